use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::util::env::Var;
use crate::var;

use super::models::{AppliedUpdate, BlockedAttempt, ScoreHistoryEntry, UserId, UserScore};
use super::{ScoreStore, StoreError, StoreResult};

static PG_POOL: LazyLock<OnceCell<PgPool>> = LazyLock::new(OnceCell::new);

async fn pg_pool() -> StoreResult<&'static PgPool> {
    PG_POOL
        .get_or_try_init(|| async {
            let db_url = var!(Var::DatabaseUrl).await?;
            if db_url.is_empty() {
                return Err(StoreError::Config(
                    "STORAGE_BACKEND is 'postgres' but DATABASE_URL is empty".into(),
                ));
            }

            debug!("connecting to postgres");
            let pool = PgPool::connect(db_url).await?;
            Ok(pool)
        })
        .await
}

/// Applied idempotently on boot so a fresh database works without an
/// external migration step.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS user_scores (
        user_id     TEXT PRIMARY KEY,
        score       BIGINT NOT NULL DEFAULT 0,
        version     BIGINT NOT NULL DEFAULT 0,
        achieved_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS score_history (
        id          TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL REFERENCES user_scores (user_id),
        action      TEXT NOT NULL,
        increment   BIGINT NOT NULL,
        old_score   BIGINT NOT NULL,
        new_score   BIGINT NOT NULL,
        session_id  TEXT,
        flagged     BOOLEAN NOT NULL DEFAULT FALSE,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS score_history_user_recorded_idx
        ON score_history (user_id, recorded_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blocked_attempts (
        id          TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL,
        action      TEXT NOT NULL,
        increment   BIGINT NOT NULL,
        risk_score  DOUBLE PRECISION NOT NULL,
        reason      TEXT NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS blocked_attempts_user_recorded_idx
        ON blocked_attempts (user_id, recorded_at DESC)
    "#,
];

async fn ensure_schema(pool: &PgPool) -> StoreResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Postgres-backed score store. The upsert in `apply_increment` takes a row
/// lock on the user, which serializes concurrent updates per user without
/// any application-side locking.
pub struct PgScoreStore {
    pool: &'static PgPool,
}

impl PgScoreStore {
    #[instrument]
    pub async fn connect() -> StoreResult<Self> {
        let pool = pg_pool().await?;
        ensure_schema(pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ScoreStore for PgScoreStore {
    #[instrument(skip(self, session_id), fields(user_id = %user_id))]
    async fn apply_increment(
        &self,
        user_id: &UserId,
        increment: i64,
        action: &str,
        session_id: Option<&str>,
        flagged: bool,
    ) -> StoreResult<AppliedUpdate> {
        let mut tx = self.pool.begin().await?;

        let score = sqlx::query_as::<_, UserScore>(
            r#"
            INSERT INTO user_scores (user_id, score, version, achieved_at, created_at, updated_at)
            VALUES ($1, $2, 1, NOW(), NOW(), NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET
                score = user_scores.score + $2,
                version = user_scores.version + 1,
                achieved_at = NOW(),
                updated_at = NOW()
            RETURNING user_id, score, version, achieved_at, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(increment)
        .fetch_one(&mut *tx)
        .await?;

        // same transaction as the score write: both land or neither does
        sqlx::query(
            r#"
            INSERT INTO score_history
                (id, user_id, action, increment, old_score, new_score, session_id, flagged, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(action)
        .bind(increment)
        .bind(score.score - increment)
        .bind(score.score)
        .bind(session_id)
        .bind(flagged)
        .bind(score.achieved_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AppliedUpdate {
            user_id: score.user_id,
            old_score: score.score - increment,
            new_score: score.score,
            increment,
            version: score.version,
            achieved_at: score.achieved_at,
        })
    }

    async fn get_user(&self, user_id: &UserId) -> StoreResult<Option<UserScore>> {
        let user = sqlx::query_as::<_, UserScore>(
            "SELECT user_id, score, version, achieved_at, created_at, updated_at
             FROM user_scores WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(user)
    }

    async fn load_users(&self) -> StoreResult<Vec<UserScore>> {
        let users = sqlx::query_as::<_, UserScore>(
            "SELECT user_id, score, version, achieved_at, created_at, updated_at FROM user_scores",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(users)
    }

    async fn history_for(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> StoreResult<Vec<ScoreHistoryEntry>> {
        let entries = sqlx::query_as::<_, ScoreHistoryEntry>(
            r#"
            SELECT id, user_id, action, increment, old_score, new_score, session_id, flagged, recorded_at
            FROM score_history
            WHERE user_id = $1
            ORDER BY recorded_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await?;
        Ok(entries)
    }

    async fn attempts_since(&self, user_id: &UserId, since: DateTime<Utc>) -> StoreResult<u32> {
        let accepted: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM score_history WHERE user_id = $1 AND recorded_at >= $2",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(self.pool)
        .await?;

        let blocked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM blocked_attempts WHERE user_id = $1 AND recorded_at >= $2",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(self.pool)
        .await?;

        Ok((accepted + blocked) as u32)
    }

    async fn record_blocked(&self, attempt: BlockedAttempt) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO blocked_attempts (id, user_id, action, increment, risk_score, reason, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.user_id)
        .bind(&attempt.action)
        .bind(attempt.increment)
        .bind(attempt.risk_score)
        .bind(&attempt.reason)
        .bind(attempt.recorded_at)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    async fn recent_blocked(&self, limit: usize) -> StoreResult<Vec<BlockedAttempt>> {
        let attempts = sqlx::query_as::<_, BlockedAttempt>(
            r#"
            SELECT id, user_id, action, increment, risk_score, reason, recorded_at
            FROM blocked_attempts
            ORDER BY recorded_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await?;
        Ok(attempts)
    }
}
