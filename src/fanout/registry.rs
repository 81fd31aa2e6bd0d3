use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DeliveryQueue, FanoutConfig, LeaderboardEvent};

/// One registered websocket consumer.
pub struct Subscriber {
    pub id: String,
    pub queue: Arc<DeliveryQueue>,
    connected_at: Instant,
    /// Millis after `connected_at` of the most recent pong. Registration
    /// counts as the first pong.
    last_pong_ms: AtomicU64,
    delivered: AtomicUsize,
    closed: Notify,
}

impl Subscriber {
    fn new(queue_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: Arc::new(DeliveryQueue::new(queue_capacity)),
            connected_at: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
            delivered: AtomicUsize::new(0),
            closed: Notify::new(),
        }
    }

    pub fn record_pong(&self) {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        self.last_pong_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_pong_age(&self) -> Duration {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }

    /// Resolves once the registry has evicted this subscriber. The socket
    /// task selects on this to shut the connection down.
    pub async fn evicted(&self) {
        self.closed.notified().await;
    }

    fn close(&self) {
        self.closed.notify_one();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub id: String,
    pub connected_secs: u64,
    pub queued: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub last_pong_secs_ago: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanoutStats {
    pub subscribers: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub per_subscriber: Vec<SubscriberStats>,
}

/// Registry of live subscribers, keyed by connection id.
///
/// Fanout never blocks on any one consumer: `broadcast` pushes into bounded
/// per-subscriber queues and returns, and the reaper task removes consumers
/// that stop answering pings.
pub struct FanoutRegistry {
    config: FanoutConfig,
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
}

impl FanoutRegistry {
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub async fn register(&self) -> Arc<Subscriber> {
        let subscriber = Arc::new(Subscriber::new(self.config.queue_capacity));
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(subscriber.id.clone(), subscriber.clone());
        debug!(
            subscriber = %subscriber.id,
            total = subscribers.len(),
            "subscriber registered"
        );
        subscriber
    }

    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.subscribers.write().await.remove(id).is_some();
        if removed {
            debug!(subscriber = %id, "subscriber unregistered");
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Fan an event out to every registered subscriber. Slow consumers shed
    /// their oldest queued events rather than slowing anyone else down.
    pub async fn broadcast(&self, event: &LeaderboardEvent) {
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.values() {
            subscriber.queue.push(event.clone()).await;
        }
    }

    /// Remove every subscriber whose last pong is older than the heartbeat
    /// timeout, waking their socket tasks so the connections close.
    pub async fn evict_stale(&self) -> Vec<String> {
        let timeout = self.config.heartbeat_timeout;
        let mut evicted = Vec::new();

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|id, subscriber| {
            if subscriber.last_pong_age() > timeout {
                subscriber.close();
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });
        drop(subscribers);

        for id in &evicted {
            warn!(subscriber = %id, "evicted unresponsive subscriber");
        }
        evicted
    }

    pub async fn collect_stats(&self) -> FanoutStats {
        let subscribers = self.subscribers.read().await;
        let mut per_subscriber = Vec::with_capacity(subscribers.len());
        let mut delivered = 0;
        let mut dropped = 0;

        for subscriber in subscribers.values() {
            let sub_delivered = subscriber.delivered.load(Ordering::Relaxed);
            let sub_dropped = subscriber.queue.dropped();
            delivered += sub_delivered;
            dropped += sub_dropped;
            per_subscriber.push(SubscriberStats {
                id: subscriber.id.clone(),
                connected_secs: subscriber.connected_at.elapsed().as_secs(),
                queued: subscriber.queue.len().await,
                delivered: sub_delivered,
                dropped: sub_dropped,
                last_pong_secs_ago: subscriber.last_pong_age().as_secs(),
            });
        }

        FanoutStats {
            subscribers: per_subscriber.len(),
            delivered,
            dropped,
            per_subscriber,
        }
    }

    /// Background task that sweeps for dead subscribers on the heartbeat
    /// interval and logs delivery counters while it is at it.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = registry.evict_stale().await;
                let stats = registry.collect_stats().await;
                info!(
                    subscribers = stats.subscribers,
                    delivered = stats.delivered,
                    dropped = stats.dropped,
                    evicted = evicted.len(),
                    "fanout sweep"
                );
            }
        })
    }
}
