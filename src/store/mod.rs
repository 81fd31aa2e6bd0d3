use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
pub mod models;
pub mod postgres;
pub mod redis;

use crate::util::env::{Env, EnvErr};
use models::{AppliedUpdate, BlockedAttempt, ScoreHistoryEntry, UserId, UserScore};

pub mod prelude {
    pub use crate::store::models::{
        AppliedUpdate, BlockedAttempt, Pagination, ScoreDelta, ScoreHistoryEntry, UserId,
        UserScore,
    };
    pub use crate::store::{ReplayStore, ScoreStore, StoreError, StoreResult};
}

/// Durable scoreboard state. Implementations must make `apply_increment`
/// atomic per user: the score mutation and its history row either both land
/// or neither does, and concurrent calls for one user serialize.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    async fn apply_increment(
        &self,
        user_id: &UserId,
        increment: i64,
        action: &str,
        session_id: Option<&str>,
        flagged: bool,
    ) -> StoreResult<AppliedUpdate>;

    async fn get_user(&self, user_id: &UserId) -> StoreResult<Option<UserScore>>;

    /// Full scan, used to rebuild the in-memory rank index on boot.
    async fn load_users(&self) -> StoreResult<Vec<UserScore>>;

    /// Most recent entries first.
    async fn history_for(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> StoreResult<Vec<ScoreHistoryEntry>>;

    /// Counts every attempt (accepted and blocked) recorded since `since`.
    async fn attempts_since(&self, user_id: &UserId, since: DateTime<Utc>) -> StoreResult<u32>;

    async fn record_blocked(&self, attempt: BlockedAttempt) -> StoreResult<()>;

    /// Most recent refusals first, across all users.
    async fn recent_blocked(&self, limit: usize) -> StoreResult<Vec<BlockedAttempt>>;
}

/// Single-use nonce claims backing token replay protection.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Atomically claims a nonce. The first claim wins; `false` means the
    /// nonce was already consumed.
    async fn claim(&self, nonce: &str) -> StoreResult<bool>;

    /// Drops claims older than the retention window, returning how many were
    /// removed. Backends with server-side expiry may report zero.
    async fn purge_expired(&self) -> StoreResult<u64>;
}

pub async fn connect_score_store(env: &Env) -> StoreResult<Arc<dyn ScoreStore>> {
    match env.storage_backend.as_str() {
        "postgres" => {
            let store = postgres::PgScoreStore::connect().await?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(memory::MemoryScoreStore::new())),
        other => Err(StoreError::Config(format!(
            "unsupported STORAGE_BACKEND '{other}'"
        ))),
    }
}

pub async fn connect_replay_store(env: &Env) -> StoreResult<Arc<dyn ReplayStore>> {
    let retention = std::time::Duration::from_secs(env.replay_retention_secs);

    match env.replay_backend.as_str() {
        "redis" => {
            let store = redis::RedisReplayStore::connect(retention).await?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(memory::MemoryReplayStore::new(retention))),
        other => Err(StoreError::Config(format!(
            "unsupported REPLAY_BACKEND '{other}'"
        ))),
    }
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient backend failure. Callers are expected to retry these.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("unknown user '{0}'")]
    UnknownUser(UserId),

    #[error("storage misconfigured: {0}")]
    Config(String),

    #[error(transparent)]
    Sqlx(sqlx::Error),

    #[error(transparent)]
    Redis(::redis::RedisError),

    #[error("{0}")]
    Env(#[from] EnvErr),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Connection-shaped sqlx failures count as transient so the ledger retry
/// loop picks them up; everything else surfaces as-is.
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Sqlx(other),
        }
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Redis(err)
        }
    }
}
