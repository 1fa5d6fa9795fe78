//! Normalizes adapter pushes into events and hands them to the queues.
//!
//! Everything here runs on adapter-owned threads, so nothing may block or
//! await: a push is stamped, sequenced and enqueued, then control returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::adapter::PushHandler;
use crate::clock::Clock;
use crate::events::queue::EventQueues;
use crate::types::{DeviceHandle, Event, EventKind, RawPush};

/// Entry point for device pushes
pub struct EventDispatcher {
    queues: EventQueues,
    sequences: DashMap<(DeviceHandle, EventKind), u64>,
    clock: Arc<dyn Clock>,
    dispatched: AtomicU64,
}

impl EventDispatcher {
    pub fn new(queues: EventQueues, clock: Arc<dyn Clock>) -> Self {
        Self {
            queues,
            sequences: DashMap::new(),
            clock,
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn queues(&self) -> &EventQueues {
        &self.queues
    }

    /// Build the handler to register with the adapter for `kind`
    pub fn handler(self: &Arc<Self>, kind: EventKind) -> PushHandler {
        let dispatcher = Arc::clone(self);
        Arc::new(move |push: RawPush| dispatcher.dispatch(kind, push))
    }

    /// Normalize and enqueue one push. Never blocks.
    pub fn dispatch(&self, kind: EventKind, push: RawPush) {
        let event = self.normalize(kind, push);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(kind = %kind, handle = %event.handle, sequence = event.sequence, "Event enqueued");
        self.queues.get(kind).push(event);
    }

    fn normalize(&self, kind: EventKind, push: RawPush) -> Event {
        let sequence = self.next_sequence(push.handle, kind, push.sequence);

        Event {
            id: Uuid::new_v4(),
            handle: push.handle,
            kind,
            sequence,
            received_at: self.clock.now(),
            command: push.command,
            payload: push.payload,
        }
    }

    /// Device-supplied sequence when present, else a per-stream counter.
    ///
    /// The counter follows the last sequence seen on the stream, device or
    /// local, and wraps to 0 after `u64::MAX`.
    fn next_sequence(&self, handle: DeviceHandle, kind: EventKind, device_sequence: Option<u64>) -> u64 {
        let mut last = self.sequences.entry((handle, kind)).or_insert(0);
        let next = device_sequence.unwrap_or_else(|| last.wrapping_add(1));
        *last = next;
        next
    }

    /// Drop sequence state of a handle that is gone for good
    pub fn forget(&self, handle: DeviceHandle) {
        self.sequences.retain(|(h, _), _| *h != handle);
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("queues", &self.queues)
            .field("dispatched", &self.dispatched_count())
            .finish()
    }
}
