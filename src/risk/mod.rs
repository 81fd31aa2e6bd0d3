//! Weighted fraud scoring for proposed score updates.
//!
//! Each sub-score is independently bounded to [0, 1]; the total is their
//! weighted sum with weights summing to 1.0. Weights are deployment policy
//! (env-tunable), the decision thresholds are contract and stay fixed.

use serde::{Deserialize, Serialize};

use crate::store::models::ScoreHistoryEntry;
use crate::util::env::Env;

pub const BLOCK_THRESHOLD: f64 = 0.8;
pub const CHALLENGE_THRESHOLD: f64 = 0.6;
pub const MONITOR_THRESHOLD: f64 = 0.4;

/// Increments this multiple of the user's historical mean are treated as
/// maximally anomalous.
const MAGNITUDE_SCALE: f64 = 4.0;

/// Below this many history entries the distribution-based sub-scores fall
/// back to a moderate 0.5 instead of guessing from noise.
const MIN_HISTORY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskDecision {
    Allow,
    Monitor,
    Challenge,
    Block,
}

impl RiskDecision {
    pub fn from_score(score: f64) -> Self {
        if score >= BLOCK_THRESHOLD {
            RiskDecision::Block
        } else if score >= CHALLENGE_THRESHOLD {
            RiskDecision::Challenge
        } else if score >= MONITOR_THRESHOLD {
            RiskDecision::Monitor
        } else {
            RiskDecision::Allow
        }
    }

    /// Monitor and Challenge let the update through but mark its history
    /// entry for audit. Block never reaches the ledger.
    pub fn flags_for_audit(&self) -> bool {
        matches!(self, RiskDecision::Monitor | RiskDecision::Challenge)
    }
}

#[derive(Debug, Clone)]
pub struct RiskPolicy {
    pub weight_frequency: f64,
    pub weight_magnitude: f64,
    pub weight_action_mix: f64,
    pub weight_session: f64,
    pub frequency_limit: u32,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            weight_frequency: 0.60,
            weight_magnitude: 0.10,
            weight_action_mix: 0.20,
            weight_session: 0.10,
            frequency_limit: 20,
        }
    }
}

impl RiskPolicy {
    pub fn from_env(env: &Env) -> Self {
        Self {
            weight_frequency: env.risk_weight_frequency,
            weight_magnitude: env.risk_weight_magnitude,
            weight_action_mix: env.risk_weight_action_mix,
            weight_session: env.risk_weight_session,
            frequency_limit: env.risk_frequency_limit,
        }
    }
}

/// Everything the scorer looks at for one proposed update. `recent` is the
/// user's accepted history, newest first; `attempts_last_hour` counts every
/// attempt in the window including this one and including blocked ones.
#[derive(Debug)]
pub struct RiskInput<'a> {
    pub increment: i64,
    pub action: &'a str,
    pub session_id: Option<&'a str>,
    pub attempts_last_hour: u32,
    pub recent: &'a [ScoreHistoryEntry],
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub decision: RiskDecision,
    pub frequency: f64,
    pub magnitude: f64,
    pub action_mix: f64,
    pub session: f64,
}

pub struct RiskScorer {
    policy: RiskPolicy,
}

impl RiskScorer {
    pub fn new(policy: RiskPolicy) -> Self {
        Self { policy }
    }

    pub fn from_env(env: &Env) -> Self {
        Self::new(RiskPolicy::from_env(env))
    }

    pub fn assess(&self, input: &RiskInput) -> RiskAssessment {
        let frequency = self.frequency_score(input.attempts_last_hour);
        let magnitude = self.magnitude_score(input.increment, input.recent);
        let action_mix = self.action_mix_score(input.action, input.recent);
        let session = self.session_score(input.session_id, input.recent);

        let score = unit(
            frequency * self.policy.weight_frequency
                + magnitude * self.policy.weight_magnitude
                + action_mix * self.policy.weight_action_mix
                + session * self.policy.weight_session,
        );

        RiskAssessment {
            score,
            decision: RiskDecision::from_score(score),
            frequency,
            magnitude,
            action_mix,
            session,
        }
    }

    fn frequency_score(&self, attempts_last_hour: u32) -> f64 {
        unit(f64::from(attempts_last_hour) / f64::from(self.policy.frequency_limit.max(1)))
    }

    fn magnitude_score(&self, increment: i64, recent: &[ScoreHistoryEntry]) -> f64 {
        if recent.len() < MIN_HISTORY {
            return 0.5;
        }

        let mean = recent
            .iter()
            .map(|entry| entry.increment.unsigned_abs() as f64)
            .sum::<f64>()
            / recent.len() as f64;
        let mean = mean.max(1.0);

        unit(increment as f64 / (mean * MAGNITUDE_SCALE))
    }

    fn action_mix_score(&self, action: &str, recent: &[ScoreHistoryEntry]) -> f64 {
        if recent.len() < MIN_HISTORY {
            return 0.5;
        }

        let same = recent.iter().filter(|entry| entry.action == action).count();
        unit(same as f64 / recent.len() as f64)
    }

    fn session_score(&self, session_id: Option<&str>, recent: &[ScoreHistoryEntry]) -> f64 {
        let previous = recent.first().and_then(|entry| entry.session_id.as_deref());

        match (session_id, previous) {
            (Some(current), Some(previous)) if current == previous => 0.0,
            (Some(_), Some(_)) => 1.0,
            _ => 0.5,
        }
    }
}

fn unit(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}
