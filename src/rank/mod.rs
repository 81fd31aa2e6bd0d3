//! In-memory total order over all users.
//!
//! A `BTreeSet` keyed by (score desc, achieved-at asc, user id asc) gives
//! O(log n) updates; the side map tracks each user's live key plus the
//! version of the last applied ledger commit so out-of-order deliveries get
//! dropped instead of resurrecting old scores.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::store::models::{ScoreDelta, UserId, UserScore};

#[derive(Debug, Clone, PartialEq, Eq)]
struct RankKey {
    score: i64,
    achieved_at: DateTime<Utc>,
    user_id: UserId,
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.achieved_at.cmp(&other.achieved_at))
            .then_with(|| self.user_id.cmp(&other.user_id))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct IndexEntry {
    key: RankKey,
    version: i64,
}

#[derive(Default)]
struct IndexState {
    by_user: HashMap<UserId, IndexEntry>,
    ordered: BTreeSet<RankKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub rank: i64,
    pub user_id: UserId,
    pub score: i64,
    pub achieved_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderboardPage {
    pub entries: Vec<RankEntry>,
    pub total_users: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Default)]
pub struct RankIndex {
    inner: RwLock<IndexState>,
}

impl RankIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed score. Returns `false` when the index already
    /// holds this user at an equal or newer version, in which case nothing
    /// changes.
    pub async fn update(
        &self,
        user_id: &UserId,
        score: i64,
        achieved_at: DateTime<Utc>,
        version: i64,
    ) -> bool {
        let mut state = self.inner.write().await;

        if let Some(existing) = state.by_user.get(user_id) {
            if existing.version >= version {
                return false;
            }
            let old_key = existing.key.clone();
            state.ordered.remove(&old_key);
        }

        let key = RankKey {
            score,
            achieved_at,
            user_id: user_id.clone(),
        };
        state.ordered.insert(key.clone());
        state.by_user.insert(user_id.clone(), IndexEntry { key, version });

        true
    }

    pub async fn apply(&self, delta: &ScoreDelta) -> bool {
        self.update(&delta.user_id, delta.new_score, delta.committed_at, delta.version)
            .await
    }

    /// Replaces the whole index from authoritative storage (boot path).
    pub async fn rebuild(&self, users: Vec<UserScore>) {
        let mut state = self.inner.write().await;
        state.by_user.clear();
        state.ordered.clear();

        for user in users {
            let key = RankKey {
                score: user.score,
                achieved_at: user.achieved_at,
                user_id: user.user_id.clone(),
            };
            state.ordered.insert(key.clone());
            state.by_user.insert(
                user.user_id,
                IndexEntry {
                    key,
                    version: user.version,
                },
            );
        }
    }

    /// First k entries of the total order, taken under one read guard so the
    /// snapshot is internally consistent.
    pub async fn top_k(&self, k: usize) -> Vec<RankEntry> {
        let state = self.inner.read().await;
        collect_entries(state.ordered.iter().take(k), 0)
    }

    pub async fn page(&self, limit: usize, offset: usize) -> LeaderboardPage {
        let state = self.inner.read().await;
        let entries = collect_entries(
            state.ordered.iter().skip(offset).take(limit),
            offset as i64,
        );

        LeaderboardPage {
            entries,
            total_users: state.by_user.len() as i64,
            limit: limit as i64,
            offset: offset as i64,
        }
    }

    /// Position scan; costs O(rank). Fine for a spot lookup endpoint, not
    /// meant for bulk use.
    pub async fn rank_of(&self, user_id: &UserId) -> Option<RankEntry> {
        let state = self.inner.read().await;
        let key = &state.by_user.get(user_id)?.key;
        let position = state.ordered.range(..=key.clone()).count();

        Some(RankEntry {
            rank: position as i64,
            user_id: key.user_id.clone(),
            score: key.score,
            achieved_at: key.achieved_at,
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn collect_entries<'a>(
    keys: impl Iterator<Item = &'a RankKey>,
    rank_offset: i64,
) -> Vec<RankEntry> {
    keys.enumerate()
        .map(|(i, key)| RankEntry {
            rank: rank_offset + i as i64 + 1,
            user_id: key.user_id.clone(),
            score: key.score,
            achieved_at: key.achieved_at,
        })
        .collect()
}
