//! Device clock synchronization.
//!
//! Reads each device's time setting and rewrites it from the reference clock
//! only when the drift exceeds the threshold or the timezone offset differs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::adapter::{invoke_with_timeout, DeviceOperation, DeviceTime, OperationOutput, TransportAdapter};
use crate::clock::Clock;
use crate::config::TimeSyncConfig;
use crate::error::AdapterError;
use crate::registry::ConnectedDevice;
use crate::scheduler::{ActionOutcome, DeviceJob, JobKind};

/// Signed difference between the device clock and `reference`
pub fn clock_drift(device: &DeviceTime, reference: DateTime<Utc>) -> ChronoDuration {
    device.to_utc() - reference
}

/// Whether a device with setting `device` should be rewritten
pub fn needs_sync(
    device: &DeviceTime,
    reference: DateTime<Utc>,
    tz_offset_minutes: i32,
    threshold: Duration,
) -> bool {
    if device.tz_offset_minutes != tz_offset_minutes {
        return true;
    }

    let drift = clock_drift(device, reference).abs();
    drift.to_std().map(|drift| drift > threshold).unwrap_or(true)
}

pub struct TimeSyncJob {
    adapter: Arc<dyn TransportAdapter>,
    clock: Arc<dyn Clock>,
    tz_offset_minutes: i32,
    drift_threshold: Duration,
    call_timeout: Duration,
    applied: AtomicU64,
    skipped: AtomicU64,
}

impl TimeSyncJob {
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        clock: Arc<dyn Clock>,
        config: &TimeSyncConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            clock,
            tz_offset_minutes: config.tz_offset_minutes,
            drift_threshold: config.drift_threshold(),
            call_timeout,
            applied: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn skipped_count(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeviceJob for TimeSyncJob {
    fn kind(&self) -> JobKind {
        JobKind::TimeSync
    }

    async fn run(&self, device: &ConnectedDevice) -> Result<ActionOutcome, AdapterError> {
        let current = match invoke_with_timeout(
            self.adapter.as_ref(),
            device.handle,
            DeviceOperation::GetTimeConfig,
            self.call_timeout,
        )
        .await?
        {
            OperationOutput::TimeConfig(time) => time,
            OperationOutput::Done => {
                return Err(AdapterError::UnexpectedResponse("GetTimeConfig".to_string()))
            }
        };

        let reference = self.clock.now();
        if !needs_sync(&current, reference, self.tz_offset_minutes, self.drift_threshold) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(ActionOutcome::Skipped("clock within drift threshold".to_string()));
        }

        let drift_ms = clock_drift(&current, reference).num_milliseconds();
        let target = DeviceTime::from_utc(self.clock.now(), self.tz_offset_minutes);

        invoke_with_timeout(
            self.adapter.as_ref(),
            device.handle,
            DeviceOperation::SetTimeConfig(target),
            self.call_timeout,
        )
        .await?;

        self.applied.fetch_add(1, Ordering::Relaxed);
        tracing::info!(device = %device.key, drift_ms, tz_offset = self.tz_offset_minutes, "Device clock synchronized");
        Ok(ActionOutcome::Done)
    }

    fn metrics(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("sync_applied", self.applied_count()),
            ("sync_skipped", self.skipped_count()),
        ]
    }
}
