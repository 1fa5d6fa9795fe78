//! Per-device probe health, shared by the snapshot probe and reboot check.

use dashmap::DashMap;

use crate::types::SessionKey;

/// Consecutive snapshot probe failures per device.
///
/// Keyed by session key so the count survives reconnects and re-login.
#[derive(Debug, Default)]
pub struct DeviceHealth {
    failures: DashMap<SessionKey, u32>,
}

impl DeviceHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, key: &SessionKey) {
        self.failures.remove(key);
    }

    /// Returns the new consecutive failure count
    pub fn record_failure(&self, key: &SessionKey) -> u32 {
        let mut count = self.failures.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn consecutive_failures(&self, key: &SessionKey) -> u32 {
        self.failures.get(key).map(|count| *count).unwrap_or(0)
    }

    /// Forget the history of a device that is gone for good
    pub fn reset(&self, key: &SessionKey) {
        self.failures.remove(key);
    }
}
