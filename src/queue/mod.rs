//! In-process queue for asynchronous sends.
//!
//! Items become eligible at their `not_before` instant; among eligible
//! items dequeue order is FIFO.

use crate::context::{SendContext, SendOptions};
use crate::errors::{QueueError, SenderResult};
use crate::observability::{ComponentHealth, HealthStatus};
use crate::types::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// A send waiting to be dispatched by a worker
#[derive(Clone)]
pub struct QueueItem {
    /// Message to send
    pub message: Arc<dyn Message>,
    /// Options captured at enqueue time
    pub options: SendOptions,
    /// When the item was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Earliest dispatch time
    pub not_before: Instant,
}

impl QueueItem {
    /// Item eligible immediately
    pub fn new(message: Arc<dyn Message>, options: SendOptions) -> Self {
        Self {
            message,
            options,
            enqueued_at: Utc::now(),
            not_before: Instant::now(),
        }
    }

    /// Item eligible after `delay`
    pub fn delayed(message: Arc<dyn Message>, options: SendOptions, delay: Duration) -> Self {
        let mut item = Self::new(message, options);
        item.not_before += delay;
        item
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("msg_id", &self.message.msg_id())
            .field("provider_type", &self.message.provider_type())
            .field("enqueued_at", &self.enqueued_at)
            .field("not_before", &self.not_before)
            .finish()
    }
}

/// Queue backing asynchronous sends
#[async_trait]
pub trait Queue: Send + Sync + fmt::Debug {
    /// Add an item; fails when full or closed
    async fn enqueue(&self, item: QueueItem) -> SenderResult<()>;

    /// Add an item that becomes eligible after `delay`
    async fn enqueue_delayed(&self, mut item: QueueItem, delay: Duration) -> SenderResult<()> {
        item.not_before = Instant::now() + delay;
        self.enqueue(item).await
    }

    /// Wait for the next eligible item.
    ///
    /// Returns `Queue(Closed)` once the queue is closed.
    async fn dequeue(&self, ctx: &SendContext) -> SenderResult<QueueItem>;

    /// Number of pending items
    fn size(&self) -> usize;

    /// Stop accepting items and wake all waiters
    fn close(&self);

    /// Remove and return all pending items
    fn drain(&self) -> Vec<QueueItem>;

    /// Current health
    fn health(&self) -> ComponentHealth;
}

struct Entry {
    item: QueueItem,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest item first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .item
            .not_before
            .cmp(&self.item.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

/// Bounded in-memory queue
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl MemoryQueue {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Maximum number of items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryQueue")
            .field("size", &state.heap.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, item: QueueItem) -> SenderResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed.into());
            }
            if state.heap.len() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                }
                .into());
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry { item, seq });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, ctx: &SendContext) -> SenderResult<QueueItem> {
        loop {
            // Register interest before inspecting state so a concurrent
            // enqueue cannot slip between the check and the wait.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed.into());
                }
                match state.heap.peek().map(|entry| entry.item.not_before) {
                    Some(at) if at <= Instant::now() => match state.heap.pop() {
                        Some(entry) => return Ok(entry.item),
                        None => None,
                    },
                    other => other,
                }
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                        err = ctx.done() => return Err(err),
                    }
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        err = ctx.done() => return Err(err),
                    }
                }
            }
        }
    }

    fn size(&self) -> usize {
        self.state.lock().heap.len()
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn drain(&self) -> Vec<QueueItem> {
        let mut state = self.state.lock();
        let mut items = Vec::with_capacity(state.heap.len());
        while let Some(entry) = state.heap.pop() {
            items.push(entry.item);
        }
        items
    }

    fn health(&self) -> ComponentHealth {
        let state = self.state.lock();
        if state.closed {
            ComponentHealth::with_status("queue", HealthStatus::Unhealthy, "closed")
        } else if state.heap.len() * 10 >= self.capacity * 9 {
            ComponentHealth::with_status(
                "queue",
                HealthStatus::Degraded,
                format!("{}/{} items", state.heap.len(), self.capacity),
            )
        } else {
            ComponentHealth::healthy("queue")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SenderError;
    use crate::mocks::TestMessage;

    fn item(tag: &str) -> QueueItem {
        QueueItem::new(
            Arc::new(TestMessage::new("test")),
            SendOptions::new().metadata("tag", tag),
        )
    }

    fn tag(item: &QueueItem) -> &str {
        &item.options.metadata["tag"]
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryQueue::new(10);
        let ctx = SendContext::new();
        for t in ["a", "b", "c"] {
            queue.enqueue(item(t)).await.unwrap();
        }
        assert_eq!(queue.size(), 3);
        assert_eq!(tag(&queue.dequeue(&ctx).await.unwrap()), "a");
        assert_eq!(tag(&queue.dequeue(&ctx).await.unwrap()), "b");
        assert_eq!(tag(&queue.dequeue(&ctx).await.unwrap()), "c");
    }

    #[tokio::test]
    async fn test_delayed_item_waits() {
        let queue = MemoryQueue::new(10);
        let ctx = SendContext::new();
        queue
            .enqueue_delayed(item("late"), Duration::from_millis(50))
            .await
            .unwrap();
        queue.enqueue(item("now")).await.unwrap();

        let start = Instant::now();
        assert_eq!(tag(&queue.dequeue(&ctx).await.unwrap()), "now");
        assert_eq!(tag(&queue.dequeue(&ctx).await.unwrap()), "late");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let queue = MemoryQueue::new(1);
        queue.enqueue(item("a")).await.unwrap();
        let err = queue.enqueue(item("b")).await.unwrap_err();
        assert!(matches!(err, SenderError::Queue(QueueError::Full { capacity: 1 })));
        assert_eq!(queue.health().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let queue = Arc::new(MemoryQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(&SendContext::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SenderError::Queue(QueueError::Closed))));
        assert!(queue.enqueue(item("x")).await.is_err());
        assert_eq!(queue.health().status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_blocked_dequeue() {
        let queue = Arc::new(MemoryQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(&SendContext::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(item("x")).await.unwrap();
        assert_eq!(tag(&waiter.await.unwrap().unwrap()), "x");
    }

    #[tokio::test]
    async fn test_dequeue_honors_cancellation() {
        let queue = MemoryQueue::new(10);
        let ctx = SendContext::new().with_timeout(Duration::from_millis(10));
        let err = queue.dequeue(&ctx).await.unwrap_err();
        assert!(matches!(err, SenderError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_drain_returns_pending() {
        let queue = MemoryQueue::new(10);
        queue.enqueue(item("a")).await.unwrap();
        queue.enqueue(item("b")).await.unwrap();
        queue.close();
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.size(), 0);
    }
}
