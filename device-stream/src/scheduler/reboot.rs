//! Throttled remote reboot
//!
//! A reboot is only issued when the policy allows it, the device has failed
//! enough consecutive snapshot probes (unless explicitly requested), and the
//! throttle interval since its last successful reboot has passed. The
//! throttle is keyed by session key, so it survives reconnects and re-login.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::adapter::{invoke_with_timeout, DeviceOperation, TransportAdapter};
use crate::clock::Clock;
use crate::config::RebootPolicy;
use crate::error::AdapterError;
use crate::registry::ConnectedDevice;
use crate::scheduler::health::DeviceHealth;
use crate::scheduler::{ActionOutcome, DeviceJob, JobKind};
use crate::types::SessionKey;

#[derive(Debug, Default)]
struct ThrottleState {
    last_reboot: HashMap<SessionKey, DateTime<Utc>>,
    pending: HashSet<SessionKey>,
}

/// Minimum-interval gate for reboots, per device
#[derive(Debug, Clone)]
pub struct RebootThrottle {
    min_interval: ChronoDuration,
    state: Arc<Mutex<ThrottleState>>,
}

impl RebootThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval: ChronoDuration::from_std(min_interval).unwrap_or_else(|_| ChronoDuration::days(36_500)),
            state: Arc::new(Mutex::new(ThrottleState::default())),
        }
    }

    /// Claim the right to reboot `key` at `now`.
    ///
    /// Returns `None` while a reboot of the device is in flight or the last
    /// successful one is less than the minimum interval ago.
    pub fn acquire(&self, key: &SessionKey, now: DateTime<Utc>) -> Option<ThrottlePermit> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.pending.contains(key) {
            return None;
        }
        if let Some(last) = state.last_reboot.get(key) {
            if now - *last < self.min_interval {
                return None;
            }
        }

        state.pending.insert(key.clone());
        Some(ThrottlePermit {
            state: Arc::clone(&self.state),
            key: key.clone(),
        })
    }

    pub fn last_reboot(&self, key: &SessionKey) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_reboot.get(key).copied()
    }
}

/// An acquired reboot slot. Commit it after a successful reboot; dropping it
/// without committing leaves the throttle unchanged.
#[derive(Debug)]
pub struct ThrottlePermit {
    state: Arc<Mutex<ThrottleState>>,
    key: SessionKey,
}

impl ThrottlePermit {
    /// Record a successful reboot at `at`. Timestamps never move backwards.
    pub fn commit(self, at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let last = state.last_reboot.entry(self.key.clone()).or_insert(at);
        if at > *last {
            *last = at;
        }
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.remove(&self.key);
    }
}

/// Why a reboot was or was not issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootDecision {
    Issued,
    /// `allow_remote_reboot` is off
    Disabled,
    NotEligible { failures: u32, threshold: u32 },
    Throttled,
}

impl fmt::Display for RebootDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebootDecision::Issued => f.write_str("reboot issued"),
            RebootDecision::Disabled => f.write_str("remote reboot disabled"),
            RebootDecision::NotEligible { failures, threshold } => {
                write!(f, "{failures}/{threshold} probe failures, not eligible")
            }
            RebootDecision::Throttled => f.write_str("reboot throttled"),
        }
    }
}

#[derive(Debug, Default)]
struct RebootCounters {
    issued: AtomicU64,
    throttled: AtomicU64,
    disabled: AtomicU64,
    failed: AtomicU64,
}

/// Reboot eligibility check and reboot gate
pub struct RebootJob {
    adapter: Arc<dyn TransportAdapter>,
    throttle: RebootThrottle,
    health: Arc<DeviceHealth>,
    policy: RebootPolicy,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    counters: RebootCounters,
}

impl RebootJob {
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        health: Arc<DeviceHealth>,
        policy: RebootPolicy,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            throttle: RebootThrottle::new(policy.min_interval()),
            health,
            policy,
            clock,
            call_timeout,
            counters: RebootCounters::default(),
        }
    }

    pub fn throttle(&self) -> &RebootThrottle {
        &self.throttle
    }

    /// Reboot `device` if policy, eligibility and throttle all allow it.
    ///
    /// `explicit` requests skip the probe-failure eligibility check but never
    /// the policy or the throttle. The throttle is only advanced when the
    /// adapter reports success.
    pub async fn try_reboot(
        &self,
        device: &ConnectedDevice,
        explicit: bool,
    ) -> Result<RebootDecision, AdapterError> {
        if !self.policy.allow_remote_reboot {
            self.counters.disabled.fetch_add(1, Ordering::Relaxed);
            return Ok(RebootDecision::Disabled);
        }

        if !explicit {
            let failures = self.health.consecutive_failures(&device.key);
            if failures < self.policy.failure_threshold {
                return Ok(RebootDecision::NotEligible {
                    failures,
                    threshold: self.policy.failure_threshold,
                });
            }
        }

        let Some(permit) = self.throttle.acquire(&device.key, self.clock.now()) else {
            self.counters.throttled.fetch_add(1, Ordering::Relaxed);
            tracing::info!(device = %device.key, "Reboot throttled");
            return Ok(RebootDecision::Throttled);
        };

        match invoke_with_timeout(
            self.adapter.as_ref(),
            device.handle,
            DeviceOperation::Reboot,
            self.call_timeout,
        )
        .await
        {
            Ok(_) => {
                permit.commit(self.clock.now());
                self.counters.issued.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(device = %device.key, handle = %device.handle, "Device reboot issued");
                Ok(RebootDecision::Issued)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn issued_count(&self) -> u64 {
        self.counters.issued.load(Ordering::Relaxed)
    }

    pub fn throttled_count(&self) -> u64 {
        self.counters.throttled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeviceJob for RebootJob {
    fn kind(&self) -> JobKind {
        JobKind::RebootCheck
    }

    async fn run(&self, device: &ConnectedDevice) -> Result<ActionOutcome, AdapterError> {
        match self.try_reboot(device, false).await? {
            RebootDecision::Issued => Ok(ActionOutcome::Done),
            other => Ok(ActionOutcome::Skipped(other.to_string())),
        }
    }

    fn metrics(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("reboots_issued", self.issued_count()),
            ("reboots_throttled", self.throttled_count()),
            ("reboots_disabled", self.counters.disabled.load(Ordering::Relaxed)),
            ("reboots_failed", self.counters.failed.load(Ordering::Relaxed)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new("cam-1", 37777)
    }

    #[test]
    fn test_throttle_blocks_within_interval() {
        let throttle = RebootThrottle::new(Duration::from_secs(3600));
        let start = Utc::now();

        let permit = throttle.acquire(&key(), start).unwrap();
        permit.commit(start);

        assert!(throttle.acquire(&key(), start + ChronoDuration::seconds(10)).is_none());
        assert!(throttle
            .acquire(&key(), start + ChronoDuration::seconds(3600))
            .is_some());
    }

    #[test]
    fn test_uncommitted_permit_leaves_throttle_open() {
        let throttle = RebootThrottle::new(Duration::from_secs(3600));
        let now = Utc::now();

        drop(throttle.acquire(&key(), now).unwrap());

        assert!(throttle.last_reboot(&key()).is_none());
        assert!(throttle.acquire(&key(), now).is_some());
    }

    #[test]
    fn test_pending_permit_blocks_second_caller() {
        let throttle = RebootThrottle::new(Duration::from_secs(1));
        let now = Utc::now();

        let _held = throttle.acquire(&key(), now).unwrap();
        assert!(throttle.acquire(&key(), now).is_none());
        assert!(throttle
            .acquire(&SessionKey::new("cam-2", 37777), now)
            .is_some());
    }

    #[test]
    fn test_commit_is_monotonic() {
        let throttle = RebootThrottle::new(Duration::from_secs(60));
        let now = Utc::now();

        throttle.acquire(&key(), now).unwrap().commit(now);
        let later = now + ChronoDuration::seconds(120);
        throttle.acquire(&key(), later).unwrap().commit(now - ChronoDuration::seconds(500));

        assert_eq!(throttle.last_reboot(&key()), Some(now));
    }

    #[test]
    fn test_decision_display() {
        let decision = RebootDecision::NotEligible {
            failures: 1,
            threshold: 3,
        };
        assert_eq!(decision.to_string(), "1/3 probe failures, not eligible");
    }
}
