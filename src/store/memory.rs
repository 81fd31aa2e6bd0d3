use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::models::{AppliedUpdate, BlockedAttempt, ScoreHistoryEntry, UserId, UserScore};
use super::{ReplayStore, ScoreStore, StoreResult};

/// History kept per user. Old entries fall off the back; risk scoring only
/// ever looks at a recent window.
const HISTORY_KEEP: usize = 256;
const BLOCKED_KEEP: usize = 1024;

struct UserRecord {
    score: UserScore,
    history: VecDeque<ScoreHistoryEntry>,
}

impl UserRecord {
    fn new(user_id: &UserId, now: DateTime<Utc>) -> Self {
        Self {
            score: UserScore {
                user_id: user_id.clone(),
                score: 0,
                version: 0,
                achieved_at: now,
                created_at: now,
                updated_at: now,
            },
            history: VecDeque::new(),
        }
    }
}

/// In-process backend. The outer map lock is held only long enough to find
/// or insert a user's record; the actual read-modify-write serializes on the
/// record's own mutex, so two updates for one user can never interleave.
pub struct MemoryScoreStore {
    users: RwLock<HashMap<UserId, Arc<Mutex<UserRecord>>>>,
    blocked: Mutex<VecDeque<BlockedAttempt>>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            blocked: Mutex::new(VecDeque::new()),
        }
    }

    async fn record_for(&self, user_id: &UserId) -> Arc<Mutex<UserRecord>> {
        {
            let users = self.users.read().await;
            if let Some(rec) = users.get(user_id) {
                return rec.clone();
            }
        }

        let mut users = self.users.write().await;
        users
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(UserRecord::new(user_id, Utc::now()))))
            .clone()
    }

    async fn existing_record(&self, user_id: &UserId) -> Option<Arc<Mutex<UserRecord>>> {
        self.users.read().await.get(user_id).cloned()
    }
}

impl Default for MemoryScoreStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn apply_increment(
        &self,
        user_id: &UserId,
        increment: i64,
        action: &str,
        session_id: Option<&str>,
        flagged: bool,
    ) -> StoreResult<AppliedUpdate> {
        let record = self.record_for(user_id).await;
        let mut record = record.lock().await;

        let now = Utc::now();
        let old_score = record.score.score;
        let new_score = old_score + increment;
        let version = record.score.version + 1;

        record.score.score = new_score;
        record.score.version = version;
        record.score.achieved_at = now;
        record.score.updated_at = now;

        record.history.push_front(ScoreHistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            action: action.to_owned(),
            increment,
            old_score,
            new_score,
            session_id: session_id.map(str::to_owned),
            flagged,
            recorded_at: now,
        });
        record.history.truncate(HISTORY_KEEP);

        Ok(AppliedUpdate {
            user_id: user_id.clone(),
            old_score,
            new_score,
            increment,
            version,
            achieved_at: now,
        })
    }

    async fn get_user(&self, user_id: &UserId) -> StoreResult<Option<UserScore>> {
        match self.existing_record(user_id).await {
            Some(rec) => Ok(Some(rec.lock().await.score.clone())),
            None => Ok(None),
        }
    }

    async fn load_users(&self) -> StoreResult<Vec<UserScore>> {
        let users = self.users.read().await;
        let mut out = Vec::with_capacity(users.len());
        for rec in users.values() {
            out.push(rec.lock().await.score.clone());
        }

        Ok(out)
    }

    async fn history_for(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> StoreResult<Vec<ScoreHistoryEntry>> {
        match self.existing_record(user_id).await {
            Some(rec) => Ok(rec.lock().await.history.iter().take(limit).cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn attempts_since(&self, user_id: &UserId, since: DateTime<Utc>) -> StoreResult<u32> {
        let mut count = 0u32;

        if let Some(rec) = self.existing_record(user_id).await {
            count += rec
                .lock()
                .await
                .history
                .iter()
                .take_while(|entry| entry.recorded_at >= since)
                .count() as u32;
        }

        count += self
            .blocked
            .lock()
            .await
            .iter()
            .filter(|attempt| attempt.user_id == *user_id && attempt.recorded_at >= since)
            .count() as u32;

        Ok(count)
    }

    async fn record_blocked(&self, attempt: BlockedAttempt) -> StoreResult<()> {
        let mut blocked = self.blocked.lock().await;
        blocked.push_front(attempt);
        blocked.truncate(BLOCKED_KEEP);

        Ok(())
    }

    async fn recent_blocked(&self, limit: usize) -> StoreResult<Vec<BlockedAttempt>> {
        Ok(self
            .blocked
            .lock()
            .await
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}

pub struct MemoryReplayStore {
    retention: Duration,
    claims: Mutex<HashMap<String, Instant>>,
}

impl MemoryReplayStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            claims: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ReplayStore for MemoryReplayStore {
    async fn claim(&self, nonce: &str) -> StoreResult<bool> {
        let mut claims = self.claims.lock().await;

        // a claim past retention is re-claimable; the token it protected
        // expired long before the retention window ran out
        if let Some(claimed_at) = claims.get(nonce) {
            if claimed_at.elapsed() < self.retention {
                return Ok(false);
            }
        }

        claims.insert(nonce.to_owned(), Instant::now());
        Ok(true)
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let mut claims = self.claims.lock().await;
        let before = claims.len();
        claims.retain(|_, claimed_at| claimed_at.elapsed() < self.retention);

        Ok((before - claims.len()) as u64)
    }
}
