//! Bounded per-kind event queues.
//!
//! Push never blocks: when a queue is full the oldest queued event is evicted
//! in favor of the new one and the overflow counter is bumped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::types::{Event, EventKind};

/// Bounded FIFO of events of one kind with drop-oldest overflow
pub struct EventQueue {
    kind: EventKind,
    buffer: ArrayQueue<Event>,
    notify: Notify,
    enqueued: AtomicU64,
    overflowed: AtomicU64,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` events (minimum 1)
    pub fn new(kind: EventKind, capacity: usize) -> Self {
        Self {
            kind,
            buffer: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Enqueue an event, evicting the oldest one if the queue is full.
    ///
    /// Returns `true` when an older event was dropped.
    pub fn push(&self, event: Event) -> bool {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        let evicted = self.buffer.force_push(event);
        let overflowed = evicted.is_some();

        if let Some(dropped) = evicted {
            self.overflowed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                kind = %self.kind,
                handle = %dropped.handle,
                sequence = dropped.sequence,
                "Event queue full, dropped oldest event"
            );
        }

        self.notify.notify_one();
        overflowed
    }

    pub fn pop(&self) -> Option<Event> {
        self.buffer.pop()
    }

    /// Future resolved on the next push (or immediately if a push already
    /// happened since the last wait)
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            kind: self.kind,
            depth: self.len(),
            capacity: self.capacity(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            overflowed: self.overflow_count(),
        }
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// One queue per event kind
#[derive(Debug, Clone)]
pub struct EventQueues {
    alarm: Arc<EventQueue>,
    analytics: Arc<EventQueue>,
    snapshot: Arc<EventQueue>,
}

impl EventQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            alarm: Arc::new(EventQueue::new(EventKind::Alarm, capacity)),
            analytics: Arc::new(EventQueue::new(EventKind::Analytics, capacity)),
            snapshot: Arc::new(EventQueue::new(EventKind::Snapshot, capacity)),
        }
    }

    pub fn get(&self, kind: EventKind) -> &Arc<EventQueue> {
        match kind {
            EventKind::Alarm => &self.alarm,
            EventKind::Analytics => &self.analytics,
            EventKind::Snapshot => &self.snapshot,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EventQueue>> {
        [&self.alarm, &self.analytics, &self.snapshot].into_iter()
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        self.iter().map(|queue| queue.stats()).collect()
    }
}

/// Point-in-time counters of one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub kind: EventKind,
    pub depth: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub overflowed: u64,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} queued, {} enqueued, {} dropped on overflow",
            self.kind, self.depth, self.capacity, self.enqueued, self.overflowed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceHandle;
    use bytes::Bytes;
    use chrono::Utc;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn event(sequence: u64) -> Event {
        Event {
            id: Uuid::new_v4(),
            handle: DeviceHandle::new(1),
            kind: EventKind::Alarm,
            sequence,
            received_at: Utc::now(),
            command: None,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new(EventKind::Alarm, 8);
        for seq in 0..3 {
            assert!(!queue.push(event(seq)));
        }

        let drained: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|e| e.sequence).collect();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let queue = EventQueue::new(EventKind::Alarm, 4);
        for seq in 0..7 {
            queue.push(event(seq));
        }

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.overflow_count(), 3);

        let drained: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|e| e.sequence).collect();
        assert_eq!(drained, vec![3, 4, 5, 6]);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 7);
        assert_eq!(stats.overflowed, 3);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = EventQueue::new(EventKind::Snapshot, 0);
        assert_eq!(queue.capacity(), 1);
        queue.push(event(1));
        queue.push(event(2));
        assert_eq!(queue.pop().map(|e| e.sequence), Some(2));
    }

    #[test]
    fn test_notified_is_pending_until_push() {
        let queue = EventQueue::new(EventKind::Alarm, 4);
        let mut notified = tokio_test::task::spawn(queue.notified());

        tokio_test::assert_pending!(notified.poll());
        queue.push(event(1));
        assert!(notified.is_woken());
        tokio_test::assert_ready!(notified.poll());
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = Arc::new(EventQueue::new(EventKind::Alarm, 4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.notified().await;
                queue.pop().map(|e| e.sequence)
            })
        };

        tokio::task::yield_now().await;
        queue.push(event(9));

        let popped = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some(9));
    }

    proptest! {
        #[test]
        fn overflow_counter_matches_excess(capacity in 1usize..32, pushes in 0usize..128) {
            let queue = EventQueue::new(EventKind::Analytics, capacity);
            for seq in 0..pushes {
                queue.push(event(seq as u64));
            }

            prop_assert_eq!(queue.len(), pushes.min(capacity));
            prop_assert_eq!(queue.overflow_count() as usize, pushes.saturating_sub(capacity));
            if pushes > 0 {
                let last = std::iter::from_fn(|| queue.pop()).last().map(|e| e.sequence);
                prop_assert_eq!(last, Some(pushes as u64 - 1));
            }
        }
    }
}
