use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::rank::RankIndex;
use crate::store::models::ScoreDelta;

use super::registry::FanoutRegistry;
use super::{LeaderboardEvent, UpdateTrigger};

/// Bridges the ledger's delta bus to the subscriber registry.
///
/// The ledger updates the rank index before publishing a delta, so reading
/// top-k here always reflects at least the change being announced. If the
/// bus overruns this task, subscribers get a fresh snapshot instead of the
/// missed deltas.
pub struct Dispatcher {
    registry: Arc<FanoutRegistry>,
    rank: Arc<RankIndex>,
    seq: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: Arc<FanoutRegistry>, rank: Arc<RankIndex>) -> Self {
        Self {
            registry,
            rank,
            seq: AtomicU64::new(0),
        }
    }

    /// Sequence numbers are global and start at 1; a gap tells a subscriber
    /// it missed something, a repeat tells it to ignore the duplicate.
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current top-k as a snapshot event. Also used to greet new
    /// subscribers before any delta arrives.
    pub async fn snapshot_event(&self) -> LeaderboardEvent {
        let top = self.rank.top_k(self.registry.config().top_k).await;
        LeaderboardEvent::Snapshot {
            seq: self.next_seq(),
            generated_at: Utc::now(),
            top,
        }
    }

    async fn update_event(&self, delta: &ScoreDelta) -> LeaderboardEvent {
        let top = self.rank.top_k(self.registry.config().top_k).await;
        LeaderboardEvent::LeaderboardUpdate {
            seq: self.next_seq(),
            committed_at: delta.committed_at,
            trigger: UpdateTrigger {
                user_id: delta.user_id.clone(),
                action: delta.action.clone(),
                increment: delta.increment,
                old_score: delta.old_score,
                new_score: delta.new_score,
            },
            top,
        }
    }

    pub fn spawn(self: Arc<Self>, deltas: broadcast::Receiver<ScoreDelta>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(deltas).await })
    }

    async fn run(self: Arc<Self>, mut deltas: broadcast::Receiver<ScoreDelta>) {
        loop {
            match deltas.recv().await {
                Ok(delta) => {
                    let event = self.update_event(&delta).await;
                    debug!(
                        seq = event.seq(),
                        user_id = %delta.user_id,
                        new_score = delta.new_score,
                        "fanning out score update"
                    );
                    self.registry.broadcast(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "delta bus overran the dispatcher, resyncing with a snapshot");
                    let snapshot = self.snapshot_event().await;
                    self.registry.broadcast(&snapshot).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("delta bus closed, dispatcher exiting");
                    break;
                }
            }
        }
    }
}
