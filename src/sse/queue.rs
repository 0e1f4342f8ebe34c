//! Bounded per-connection delivery queue used for channel fan-out.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use super::event::SseEvent;

/// What to do when a publish hits a full queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    RejectNew,
}

impl OverflowPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::RejectNew => "reject_new",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest pending event.
    DroppedOldest,
    Rejected,
    Closed,
}

impl PushOutcome {
    #[must_use]
    pub const fn accepted(self) -> bool {
        matches!(self, Self::Queued | Self::DroppedOldest)
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<SseEvent>,
    closed: bool,
}

/// Single-consumer queue feeding one connection's event stream.
#[derive(Debug)]
pub struct DeliveryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: SseEvent) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            if inner.items.len() < self.capacity {
                inner.items.push_back(event);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        inner.items.pop_front();
                        inner.items.push_back(event);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::RejectNew => PushOutcome::Rejected,
                }
            }
        };

        if outcome.accepted() {
            self.notify.notify_one();
        }
        outcome
    }

    /// Waits for the next event. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<SseEvent> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(event) = inner.items.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stops accepting events; pending events are still delivered.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Turns the queue into an infallible event stream.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send {
        stream::unfold(self, |queue| async move {
            let event = queue.recv().await?;
            Some((Ok(event), queue))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn event(n: u32) -> SseEvent {
        SseEvent::new(n.to_string())
    }

    #[tokio::test]
    async fn test_push_and_recv_in_order() {
        let queue = DeliveryQueue::new(8, OverflowPolicy::DropOldest);
        assert_eq!(queue.push(event(1)), PushOutcome::Queued);
        assert_eq!(queue.push(event(2)), PushOutcome::Queued);

        assert_eq!(queue.recv().await, Some(event(1)));
        assert_eq!(queue.recv().await, Some(event(2)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drop_oldest_policy() {
        let queue = DeliveryQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(event(1));
        queue.push(event(2));
        assert_eq!(queue.push(event(3)), PushOutcome::DroppedOldest);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.recv().await, Some(event(2)));
        assert_eq!(queue.recv().await, Some(event(3)));
    }

    #[tokio::test]
    async fn test_reject_new_policy() {
        let queue = DeliveryQueue::new(1, OverflowPolicy::RejectNew);
        queue.push(event(1));
        assert_eq!(queue.push(event(2)), PushOutcome::Rejected);
        assert_eq!(queue.recv().await, Some(event(1)));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = DeliveryQueue::new(4, OverflowPolicy::DropOldest);
        queue.push(event(1));
        queue.close();

        assert_eq!(queue.push(event(2)), PushOutcome::Closed);
        assert_eq!(queue.recv().await, Some(event(1)));
        assert_eq!(queue.recv().await, None);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = Arc::new(DeliveryQueue::new(4, OverflowPolicy::DropOldest));
        let producer = queue.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(event(42));
            producer.close();
        });

        let received: Vec<_> = queue.into_stream().map(Result::unwrap).collect().await;
        handle.await.unwrap();
        assert_eq!(received, vec![event(42)]);
    }
}
