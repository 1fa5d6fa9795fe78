//! Transport adapter boundary.
//!
//! The vendor SDK binding implements [`TransportAdapter`]. A single instance is
//! constructed at startup and shared as `Arc<dyn TransportAdapter>` by every
//! component that talks to devices.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};

use crate::error::{AdapterError, AdapterResult};
use crate::types::{DeviceHandle, DeviceIdentity, EventKind, RawPush, SubscribeOptions, SubscriptionKind};

/// Callback the adapter invokes for every device push of one kind.
///
/// Called synchronously from adapter-owned threads. Implementations must not block.
pub type PushHandler = Arc<dyn Fn(RawPush) + Send + Sync>;

/// Receives connection state changes detected by the adapter
pub trait ConnectionListener: Send + Sync {
    /// The adapter lost the connection behind `handle` and is retrying
    fn on_disconnect(&self, handle: DeviceHandle);

    /// The adapter re-established the connection behind `handle`
    fn on_reconnect(&self, handle: DeviceHandle);
}

/// Device wall-clock setting as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTime {
    /// Local time shown on the device
    pub local: NaiveDateTime,
    /// Offset of `local` from UTC, in minutes
    pub tz_offset_minutes: i32,
}

impl DeviceTime {
    /// Build the device setting that represents `instant` at the given offset
    pub fn from_utc(instant: DateTime<Utc>, tz_offset_minutes: i32) -> Self {
        let local = instant.naive_utc() + ChronoDuration::minutes(i64::from(tz_offset_minutes));
        Self {
            local,
            tz_offset_minutes,
        }
    }

    /// The absolute instant this setting denotes
    pub fn to_utc(&self) -> DateTime<Utc> {
        let naive = self.local - ChronoDuration::minutes(i64::from(self.tz_offset_minutes));
        Utc.from_utc_datetime(&naive)
    }
}

/// Operations issued through [`TransportAdapter::invoke`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOperation {
    GetTimeConfig,
    SetTimeConfig(DeviceTime),
    /// Request a still image; the picture arrives through the Snapshot push handler
    SnapPicture { channel: u32 },
    Reboot,
}

impl DeviceOperation {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceOperation::GetTimeConfig => "GetTimeConfig",
            DeviceOperation::SetTimeConfig(_) => "SetTimeConfig",
            DeviceOperation::SnapPicture { .. } => "SnapPicture",
            DeviceOperation::Reboot => "Reboot",
        }
    }
}

/// Result of a successful [`DeviceOperation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    TimeConfig(DeviceTime),
    Done,
}

/// Capability exposed by the device transport driver
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// One-time driver initialization. Failure here is fatal for the bridge.
    async fn initialize(&self) -> AdapterResult<()> {
        Ok(())
    }

    /// Log in to a device, returning the handle for the new connection
    async fn login(&self, identity: &DeviceIdentity) -> AdapterResult<DeviceHandle>;

    /// Release the connection behind `handle`
    async fn logout(&self, handle: DeviceHandle) -> AdapterResult<()>;

    /// Install the handler for pushes of `kind`. Replaces any earlier handler.
    fn register_push_handler(&self, kind: EventKind, handler: PushHandler);

    /// Start a subscription. `Ok(false)` means the device declined it.
    async fn start_subscription(
        &self,
        handle: DeviceHandle,
        kind: SubscriptionKind,
        options: &SubscribeOptions,
    ) -> AdapterResult<bool>;

    async fn stop_subscription(
        &self,
        handle: DeviceHandle,
        kind: SubscriptionKind,
    ) -> AdapterResult<()>;

    /// Run a device operation. Implementations should honor `timeout`; callers
    /// enforce it as well.
    async fn invoke(
        &self,
        handle: DeviceHandle,
        operation: DeviceOperation,
        timeout: Duration,
    ) -> AdapterResult<OperationOutput>;

    /// Install the listener for disconnect/reconnect notifications
    fn set_connection_listener(&self, listener: Arc<dyn ConnectionListener>);
}

/// Await an adapter call, failing with [`AdapterError::Timeout`] after `timeout`
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, call: F) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}

/// Invoke `operation` on `handle` under `timeout`
pub async fn invoke_with_timeout(
    adapter: &dyn TransportAdapter,
    handle: DeviceHandle,
    operation: DeviceOperation,
    timeout: Duration,
) -> AdapterResult<OperationOutput> {
    let name = operation.name();
    with_timeout(name, timeout, adapter.invoke(handle, operation, timeout)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_device_time_round_trip_offset() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let device_time = DeviceTime::from_utc(instant, 420);

        let expected_local = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(19, 0, 0)
            .unwrap();
        assert_eq!(device_time.local, expected_local);
        assert_eq!(device_time.to_utc(), instant);
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(DeviceOperation::Reboot.name(), "Reboot");
        assert_eq!(DeviceOperation::SnapPicture { channel: 1 }.name(), "SnapPicture");
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: AdapterResult<()> = with_timeout("Slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(AdapterError::Timeout { operation, .. }) => assert_eq!(operation, "Slow"),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout("Fast", Duration::from_secs(1), async { Ok(7u8) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
