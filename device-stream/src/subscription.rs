//! Per-device event subscriptions
//!
//! One [`SubscriptionRecord`] per `(handle, kind)`. `attach` is a
//! test-and-set on the record, so concurrent callers (startup and reconnect
//! recovery) never start the same subscription twice.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};

use crate::adapter::{with_timeout, TransportAdapter};
use crate::clock::Clock;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::events::EventDispatcher;
use crate::types::{DeviceHandle, EventKind, SubscribeOptions, SubscriptionKind};

/// Lifecycle of one subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Inactive,
    /// An adapter start call is in flight
    Pending,
    Active,
}

/// Subscription state of one `(handle, kind)` pair
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub handle: DeviceHandle,
    pub kind: SubscriptionKind,
    pub options: SubscribeOptions,
    pub state: SubscriptionState,
    /// Re-attach this kind after a reconnect, even if the last attempt failed
    pub wanted: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Manager-wide unique, so a stale attach never settles a recreated record
    attempt: u64,
}

impl SubscriptionRecord {
    fn new(handle: DeviceHandle, kind: SubscriptionKind, options: SubscribeOptions) -> Self {
        Self {
            handle,
            kind,
            options,
            state: SubscriptionState::Inactive,
            wanted: false,
            last_attempt_at: None,
            attempt: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Active
    }
}

/// Result of a successful [`SubscriptionManager::attach`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The adapter started the subscription
    Attached,
    /// The subscription was already active or starting; nothing was done
    AlreadyActive,
}

/// Result of re-attaching a device after reconnect
#[derive(Debug, Default)]
pub struct ReattachReport {
    pub handle: Option<DeviceHandle>,
    pub reattached: Vec<SubscriptionKind>,
    pub failed: Vec<SubscriptionError>,
}

impl ReattachReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct SubscriptionCounters {
    attaches: AtomicU64,
    attach_failures: AtomicU64,
    reattaches: AtomicU64,
    stop_failures: AtomicU64,
}

/// Tracks and drives device subscriptions
pub struct SubscriptionManager {
    adapter: Arc<dyn TransportAdapter>,
    dispatcher: Arc<EventDispatcher>,
    records: DashMap<(DeviceHandle, SubscriptionKind), SubscriptionRecord>,
    handlers_registered: DashSet<EventKind>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    attempts: AtomicU64,
    counters: SubscriptionCounters,
}

impl SubscriptionManager {
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        dispatcher: Arc<EventDispatcher>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            dispatcher,
            records: DashMap::new(),
            handlers_registered: DashSet::new(),
            clock,
            call_timeout,
            attempts: AtomicU64::new(0),
            counters: SubscriptionCounters::default(),
        }
    }

    /// Install the dispatcher's push handler for `kind`, once
    pub fn ensure_push_handler(&self, kind: EventKind) {
        if self.handlers_registered.insert(kind) {
            self.adapter
                .register_push_handler(kind, self.dispatcher.handler(kind));
            tracing::debug!(kind = %kind, "Push handler registered");
        }
    }

    /// Start a subscription unless it is already active or starting
    ///
    /// # Returns
    /// * `Ok(AttachOutcome::Attached)` - The adapter accepted the subscription
    /// * `Ok(AttachOutcome::AlreadyActive)` - No adapter call was made
    /// * `Err(SubscriptionError::SubscriptionFailure)` - The record stays inactive
    pub async fn attach(
        &self,
        handle: DeviceHandle,
        kind: SubscriptionKind,
        options: SubscribeOptions,
    ) -> SubscriptionResult<AttachOutcome> {
        let attempt = {
            let mut record = self
                .records
                .entry((handle, kind))
                .or_insert_with(|| SubscriptionRecord::new(handle, kind, options.clone()));

            if record.state != SubscriptionState::Inactive {
                return Ok(AttachOutcome::AlreadyActive);
            }

            record.state = SubscriptionState::Pending;
            record.wanted = true;
            record.options = options.clone();
            record.last_attempt_at = Some(self.clock.now());
            record.attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            record.attempt
        };

        self.ensure_push_handler(kind.event_kind());
        self.counters.attaches.fetch_add(1, Ordering::Relaxed);

        let result = with_timeout(
            "StartSubscription",
            self.call_timeout,
            self.adapter.start_subscription(handle, kind, &options),
        )
        .await;

        let failure = match result {
            Ok(true) => None,
            Ok(false) => Some("device declined the subscription".to_string()),
            Err(e) => Some(e.to_string()),
        };

        let settled = match self.records.get_mut(&(handle, kind)) {
            Some(mut record) if record.attempt == attempt => {
                record.state = if failure.is_none() {
                    SubscriptionState::Active
                } else {
                    SubscriptionState::Inactive
                };
                true
            }
            _ => false,
        };

        if !settled {
            // Detached while the start call was in flight
            if failure.is_none() {
                self.stop(handle, kind).await;
            }
            self.counters.attach_failures.fetch_add(1, Ordering::Relaxed);
            return Err(SubscriptionError::SubscriptionFailure {
                handle,
                kind,
                reason: "detached while starting".to_string(),
            });
        }

        match failure {
            None => {
                tracing::info!(%handle, kind = %kind, "Subscription active");
                Ok(AttachOutcome::Attached)
            }
            Some(reason) => {
                self.counters.attach_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%handle, kind = %kind, reason = %reason, "Subscription failed");
                Err(SubscriptionError::SubscriptionFailure { handle, kind, reason })
            }
        }
    }

    /// Stop a subscription and forget its record.
    ///
    /// The record is removed even when the adapter call fails. Returns whether
    /// a record existed.
    pub async fn detach(&self, handle: DeviceHandle, kind: SubscriptionKind) -> bool {
        let Some((_, record)) = self.records.remove(&(handle, kind)) else {
            return false;
        };

        if record.state != SubscriptionState::Inactive {
            self.stop(handle, kind).await;
        }
        tracing::debug!(%handle, kind = %kind, "Subscription detached");
        true
    }

    async fn stop(&self, handle: DeviceHandle, kind: SubscriptionKind) {
        let result = with_timeout(
            "StopSubscription",
            self.call_timeout,
            self.adapter.stop_subscription(handle, kind),
        )
        .await;

        if let Err(e) = result {
            self.counters.stop_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%handle, kind = %kind, error = %e, "Stopping subscription failed");
        }
    }

    /// Detach every kind of a device
    pub async fn detach_all(&self, handle: DeviceHandle) {
        for kind in self.kinds_for(handle) {
            self.detach(handle, kind).await;
        }
    }

    /// Drop all records without adapter calls (the sessions are already gone)
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Re-attach every wanted kind of a reconnected device.
    ///
    /// Every kind is attempted; failures are collected, not short-circuited.
    pub async fn reattach(&self, handle: DeviceHandle) -> ReattachReport {
        let wanted: Vec<(SubscriptionKind, SubscribeOptions)> = self
            .records
            .iter_mut()
            .filter(|record| record.handle == handle && record.wanted)
            .map(|mut record| {
                if record.state == SubscriptionState::Active {
                    record.state = SubscriptionState::Inactive;
                }
                (record.kind, record.options.clone())
            })
            .collect();

        self.counters.reattaches.fetch_add(1, Ordering::Relaxed);
        let mut report = ReattachReport {
            handle: Some(handle),
            ..Default::default()
        };

        for (kind, options) in wanted {
            match self.attach(handle, kind, options).await {
                Ok(_) => report.reattached.push(kind),
                Err(e) => report.failed.push(e),
            }
        }

        if report.is_complete() {
            tracing::info!(%handle, kinds = report.reattached.len(), "Subscriptions re-attached");
        } else {
            tracing::warn!(
                %handle,
                reattached = report.reattached.len(),
                failed = report.failed.len(),
                "Some subscriptions could not be re-attached"
            );
        }

        report
    }

    pub fn is_active(&self, handle: DeviceHandle, kind: SubscriptionKind) -> bool {
        self.records
            .get(&(handle, kind))
            .map(|record| record.is_active())
            .unwrap_or(false)
    }

    pub fn record(&self, handle: DeviceHandle, kind: SubscriptionKind) -> Option<SubscriptionRecord> {
        self.records.get(&(handle, kind)).map(|record| record.clone())
    }

    /// All records ordered by handle then kind
    pub fn records(&self) -> Vec<SubscriptionRecord> {
        let mut records: Vec<SubscriptionRecord> =
            self.records.iter().map(|record| record.clone()).collect();
        records.sort_by_key(|record| (record.handle, record.kind));
        records
    }

    fn kinds_for(&self, handle: DeviceHandle) -> Vec<SubscriptionKind> {
        self.records
            .iter()
            .filter(|record| record.handle == handle)
            .map(|record| record.kind)
            .collect()
    }

    pub fn stats(&self) -> SubscriptionStats {
        let mut stats = SubscriptionStats {
            attaches: self.counters.attaches.load(Ordering::Relaxed),
            attach_failures: self.counters.attach_failures.load(Ordering::Relaxed),
            reattaches: self.counters.reattaches.load(Ordering::Relaxed),
            stop_failures: self.counters.stop_failures.load(Ordering::Relaxed),
            ..Default::default()
        };

        for record in self.records.iter() {
            match record.state {
                SubscriptionState::Active => stats.active += 1,
                SubscriptionState::Pending => stats.pending += 1,
                SubscriptionState::Inactive => stats.inactive += 1,
            }
        }

        stats
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Subscription counters and state breakdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub active: usize,
    pub pending: usize,
    pub inactive: usize,
    pub attaches: u64,
    pub attach_failures: u64,
    pub reattaches: u64,
    pub stop_failures: u64,
}

impl fmt::Display for SubscriptionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} active, {} pending, {} inactive subscriptions; {} attach calls, {} failed",
            self.active, self.pending, self.inactive, self.attaches, self.attach_failures
        )
    }
}
