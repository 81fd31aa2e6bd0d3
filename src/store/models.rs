use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct UserId(pub String);

/// Base scoreboard row. `achieved_at` is the commit time of the update that
/// produced the current score and drives leaderboard tiebreaks.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserScore {
    pub user_id: UserId,
    pub score: i64,
    pub version: i64,
    pub achieved_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row per accepted update, written in the same atomic unit as the score
/// itself. Blocked attempts never land here.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScoreHistoryEntry {
    pub id: String,
    pub user_id: UserId,
    pub action: String,
    pub increment: i64,
    pub old_score: i64,
    pub new_score: i64,
    pub session_id: Option<String>,
    pub flagged: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Audit record for updates refused on risk grounds.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlockedAttempt {
    pub id: String,
    pub user_id: UserId,
    pub action: String,
    pub increment: i64,
    pub risk_score: f64,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// What a successful read-modify-write handed back from storage.
#[derive(Debug, Clone)]
pub struct AppliedUpdate {
    pub user_id: UserId,
    pub old_score: i64,
    pub new_score: i64,
    pub increment: i64,
    pub version: i64,
    pub achieved_at: DateTime<Utc>,
}

/// Broadcast payload for every committed score change. Versions are per-user
/// and strictly increasing, so consumers can drop stale deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreDelta {
    pub user_id: UserId,
    pub action: String,
    pub increment: i64,
    pub old_score: i64,
    pub new_score: i64,
    pub version: i64,
    pub flagged: bool,
    pub committed_at: DateTime<Utc>,
}

impl ScoreDelta {
    pub fn from_applied(applied: &AppliedUpdate, action: &str, flagged: bool) -> Self {
        ScoreDelta {
            user_id: applied.user_id.clone(),
            action: action.to_owned(),
            increment: applied.increment,
            old_score: applied.old_score,
            new_score: applied.new_score,
            version: applied.version,
            flagged,
            committed_at: applied.achieved_at,
        }
    }
}

#[inline]
const fn default_offset() -> i64 {
    0
}

#[inline]
const fn default_limit() -> i64 {
    50
}

const MAX_PAGE_LIMIT: i64 = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_offset")]
    pub offset: i64,
}

impl Pagination {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Oversized or negative values are clamped rather than rejected.
    pub fn clamped(&self) -> (usize, usize) {
        let limit = self.limit.clamp(0, MAX_PAGE_LIMIT) as usize;
        let offset = self.offset.max(0) as usize;

        (limit, offset)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(default_limit(), default_offset())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        UserId(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId(value.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
