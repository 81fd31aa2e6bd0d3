//! Push delivery of leaderboard changes to websocket subscribers.
//!
//! Delivery is at-least-once per connection: every event carries a sequence
//! number, slow consumers lose the *oldest* queued events first, and a
//! subscriber that falls behind or misses bus capacity gets a fresh snapshot
//! to resynchronize from.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rank::RankEntry;
use crate::store::models::UserId;
use crate::util::env::Env;

pub mod dispatcher;
pub mod queue;
pub mod registry;

pub use dispatcher::Dispatcher;
pub use queue::DeliveryQueue;
pub use registry::{FanoutRegistry, Subscriber};

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Outbound events buffered per subscriber before coalescing kicks in.
    pub queue_capacity: usize,
    /// Leaderboard depth included in pushed events.
    pub top_k: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            top_k: 25,
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

impl FanoutConfig {
    pub fn from_env(env: &Env) -> Self {
        Self {
            queue_capacity: (env.fanout_queue_capacity as usize).max(1),
            top_k: (env.fanout_top_k as usize).max(1),
            heartbeat_interval: Duration::from_secs(env.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(env.heartbeat_timeout_secs),
        }
    }
}

/// The score change that caused a push, echoed inside the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTrigger {
    pub user_id: UserId,
    pub action: String,
    pub increment: i64,
    pub old_score: i64,
    pub new_score: i64,
}

/// Server-to-client events on the websocket channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaderboardEvent {
    /// Full top-k state; sent on connect and whenever a subscriber needs to
    /// resynchronize.
    Snapshot {
        seq: u64,
        generated_at: DateTime<Utc>,
        top: Vec<RankEntry>,
    },
    LeaderboardUpdate {
        seq: u64,
        committed_at: DateTime<Utc>,
        trigger: UpdateTrigger,
        top: Vec<RankEntry>,
    },
    Ping {
        seq: u64,
    },
}

impl LeaderboardEvent {
    pub fn seq(&self) -> u64 {
        match self {
            LeaderboardEvent::Snapshot { seq, .. }
            | LeaderboardEvent::LeaderboardUpdate { seq, .. }
            | LeaderboardEvent::Ping { seq } => *seq,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = LeaderboardEvent::Snapshot {
            seq: 7,
            generated_at: Utc::now(),
            top: vec![],
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["seq"], 7);

        let ping = serde_json::to_value(LeaderboardEvent::Ping { seq: 1 }).unwrap();
        assert_eq!(ping["type"], "ping");
    }
}
