//! Applies risk-cleared increments to durable state and announces commits.
//!
//! The ledger never re-checks token validity; by the time `submit` runs the
//! Action Token Validator has already parsed, verified and claimed the
//! token. What the ledger owns is ordering: risk first, then the atomic
//! score-plus-history write, then the rank index, then the broadcast bus.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::instrument;

use crate::rank::RankIndex;
use crate::risk::{RiskAssessment, RiskDecision, RiskInput, RiskScorer};
use crate::store::prelude::*;
use crate::token::TokenClaims;
use crate::util::env::Env;
use crate::util::jitter;

/// How much accepted history the risk scorer gets to look at.
const RISK_WINDOW: usize = 20;

/// Capacity of the commit bus. Lagging fanout consumers detect the gap via
/// `RecvError::Lagged` and resynchronize from the rank index.
const DELTA_BUS_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: StdDuration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn from_env(env: &Env) -> Self {
        Self {
            attempts: env.ledger_retry_attempts.max(1),
            base: StdDuration::from_millis(env.ledger_retry_base_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> StdDuration {
        let base_ms = self.base.as_millis() as u64;
        StdDuration::from_millis((base_ms << attempt.min(10)) + jitter(base_ms.max(1)))
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub applied: AppliedUpdate,
    pub assessment: RiskAssessment,
}

pub struct Ledger {
    store: Arc<dyn ScoreStore>,
    rank: Arc<RankIndex>,
    scorer: RiskScorer,
    retry: RetryPolicy,
    deltas: broadcast::Sender<ScoreDelta>,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn ScoreStore>,
        rank: Arc<RankIndex>,
        scorer: RiskScorer,
        retry: RetryPolicy,
    ) -> Self {
        let (deltas, _) = broadcast::channel(DELTA_BUS_CAPACITY);

        Self {
            store,
            rank,
            scorer,
            retry,
            deltas,
        }
    }

    /// Every committed delta lands here exactly once, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<ScoreDelta> {
        self.deltas.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn ScoreStore> {
        &self.store
    }

    pub fn rank(&self) -> &Arc<RankIndex> {
        &self.rank
    }

    #[instrument(skip(self, claims, session_id), fields(user_id = %claims.user_id, action = %claims.action))]
    pub async fn submit(
        &self,
        claims: &TokenClaims,
        session_id: Option<&str>,
    ) -> LedgerResult<UpdateOutcome> {
        let assessment = self.assess(claims, session_id).await?;

        if assessment.decision == RiskDecision::Block {
            tracing::warn!(
                risk_score = assessment.score,
                increment = claims.increment,
                "blocked update on risk grounds"
            );

            // the refusal stands even if the audit write fails
            let attempt = BlockedAttempt {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: claims.user_id.clone(),
                action: claims.action.clone(),
                increment: claims.increment,
                risk_score: assessment.score,
                reason: "risk threshold exceeded".to_owned(),
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.store.record_blocked(attempt).await {
                tracing::error!(error = %e, "failed to record blocked attempt");
            }

            return Err(LedgerError::Blocked { assessment });
        }

        let flagged = assessment.decision.flags_for_audit();
        let applied = self
            .apply_with_retry(claims, session_id, flagged)
            .await?;

        let delta = ScoreDelta::from_applied(&applied, &claims.action, flagged);

        // rank before bus: anyone woken by the bus must already see the new
        // order when they read the index
        self.rank.apply(&delta).await;
        let receivers = self.deltas.send(delta).unwrap_or(0);

        tracing::info!(
            old_score = applied.old_score,
            new_score = applied.new_score,
            version = applied.version,
            receivers,
            "committed score update"
        );

        Ok(UpdateOutcome {
            applied,
            assessment,
        })
    }

    async fn assess(
        &self,
        claims: &TokenClaims,
        session_id: Option<&str>,
    ) -> LedgerResult<RiskAssessment> {
        let hour_ago = Utc::now() - Duration::hours(1);

        // the +1 counts the attempt being assessed right now
        let attempts = self
            .store
            .attempts_since(&claims.user_id, hour_ago)
            .await?
            .saturating_add(1);
        let recent = self.store.history_for(&claims.user_id, RISK_WINDOW).await?;

        Ok(self.scorer.assess(&RiskInput {
            increment: claims.increment,
            action: &claims.action,
            session_id,
            attempts_last_hour: attempts,
            recent: &recent,
        }))
    }

    async fn apply_with_retry(
        &self,
        claims: &TokenClaims,
        session_id: Option<&str>,
        flagged: bool,
    ) -> LedgerResult<AppliedUpdate> {
        let mut attempt = 0u32;

        loop {
            let res = self
                .store
                .apply_increment(
                    &claims.user_id,
                    claims.increment,
                    &claims.action,
                    session_id,
                    flagged,
                )
                .await;

            match res {
                Ok(applied) => return Ok(applied),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.attempts => {
                    let wait = self.retry.backoff(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "transient storage failure, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

pub type LedgerResult<T> = core::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("update blocked by risk policy (score {:.2})", .assessment.score)]
    Blocked { assessment: RiskAssessment },

    #[error(transparent)]
    Store(#[from] StoreError),
}
