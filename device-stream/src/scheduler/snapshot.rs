//! Snapshot liveness probe.
//!
//! Asks each device for a still image. The picture itself comes back through
//! the Snapshot push handler; this job only tracks whether the request worked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::adapter::{invoke_with_timeout, DeviceOperation, TransportAdapter};
use crate::error::AdapterError;
use crate::registry::ConnectedDevice;
use crate::scheduler::health::DeviceHealth;
use crate::scheduler::{ActionOutcome, DeviceJob, JobKind};

pub struct SnapshotProbeJob {
    adapter: Arc<dyn TransportAdapter>,
    health: Arc<DeviceHealth>,
    channel: u32,
    call_timeout: Duration,
    probes_ok: AtomicU64,
    probes_failed: AtomicU64,
}

impl SnapshotProbeJob {
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        health: Arc<DeviceHealth>,
        channel: u32,
        call_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            health,
            channel,
            call_timeout,
            probes_ok: AtomicU64::new(0),
            probes_failed: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl DeviceJob for SnapshotProbeJob {
    fn kind(&self) -> JobKind {
        JobKind::SnapshotProbe
    }

    async fn run(&self, device: &ConnectedDevice) -> Result<ActionOutcome, AdapterError> {
        let operation = DeviceOperation::SnapPicture {
            channel: self.channel,
        };

        match invoke_with_timeout(self.adapter.as_ref(), device.handle, operation, self.call_timeout).await {
            Ok(_) => {
                self.probes_ok.fetch_add(1, Ordering::Relaxed);
                self.health.record_success(&device.key);
                Ok(ActionOutcome::Done)
            }
            Err(e) => {
                self.probes_failed.fetch_add(1, Ordering::Relaxed);
                let failures = self.health.record_failure(&device.key);
                tracing::debug!(device = %device.key, failures, "Snapshot probe failed");
                Err(e)
            }
        }
    }

    fn metrics(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("probes_ok", self.probes_ok.load(Ordering::Relaxed)),
            ("probes_failed", self.probes_failed.load(Ordering::Relaxed)),
        ]
    }
}
