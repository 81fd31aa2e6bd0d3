use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify};

use super::LeaderboardEvent;

/// Bounded per-subscriber event queue.
///
/// When the queue is full the oldest event is discarded to make room, so a
/// slow consumer converges on recent state instead of replaying a backlog.
/// Every update carries the full top-k, which makes older events strictly
/// redundant once a newer one exists.
pub struct DeliveryQueue {
    capacity: usize,
    events: Mutex<VecDeque<LeaderboardEvent>>,
    notify: Notify,
    dropped: AtomicUsize,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Enqueue an event, displacing the oldest one if the queue is at
    /// capacity. Never blocks on the consumer.
    pub async fn push(&self, event: LeaderboardEvent) {
        {
            let mut events = self.events.lock().await;
            if events.len() >= self.capacity {
                events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Wait for the next event. Cancel-safe: an event is only removed from
    /// the queue synchronously, never across an await point.
    pub async fn recv(&self) -> LeaderboardEvent {
        loop {
            if let Some(event) = self.events.lock().await.pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub async fn try_recv(&self) -> Option<LeaderboardEvent> {
        self.events.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Events discarded by drop-oldest since the queue was created.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn ping(seq: u64) -> LeaderboardEvent {
        LeaderboardEvent::Ping { seq }
    }

    #[tokio::test]
    async fn events_come_out_in_push_order() {
        let queue = DeliveryQueue::new(8);
        for seq in 0..5 {
            queue.push(ping(seq)).await;
        }

        for seq in 0..5 {
            assert_eq!(queue.recv().await.seq(), seq);
        }
        assert!(queue.try_recv().await.is_none());
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn overflow_discards_the_oldest_events_first() {
        let queue = DeliveryQueue::new(4);
        for seq in 0..10 {
            queue.push(ping(seq)).await;
        }

        assert_eq!(queue.len().await, 4);
        assert_eq!(queue.dropped(), 6);

        // survivors are the newest four, still in order
        for seq in 6..10 {
            assert_eq!(queue.recv().await.seq(), seq);
        }
    }

    #[tokio::test]
    async fn recv_wakes_up_when_an_event_arrives() {
        let queue = Arc::new(DeliveryQueue::new(4));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(ping(42)).await;

        let event = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.seq(), 42);
    }

    #[tokio::test]
    async fn push_before_recv_is_not_lost() {
        let queue = DeliveryQueue::new(4);
        queue.push(ping(1)).await;

        let event = tokio::time::timeout(Duration::from_millis(100), queue.recv())
            .await
            .unwrap();
        assert_eq!(event.seq(), 1);
    }
}
