//! Configuration types for the device bridge
//!
//! The configuration is loaded by the host process (usually from JSON) and
//! handed to [`crate::DeviceBridge`]. Every section has defaults so a config
//! file only needs to list devices.

use std::collections::HashSet;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::BridgeError;
use crate::types::{DeviceIdentity, SessionKey, SubscribeOptions};

/// Default vendor SDK TCP port
pub const DEFAULT_DEVICE_PORT: u16 = 37777;

/// Largest timezone offset a device accepts, in minutes (UTC+14:00)
const MAX_TZ_OFFSET_MINUTES: i32 = 14 * 60;

/// Periodic device clock synchronization
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    /// Default: true
    pub enable: bool,

    /// Seconds between sync ticks
    /// Default: 21600 (6 hours)
    pub interval_seconds: u64,

    /// Offset written to devices, in minutes east of UTC
    /// Default: 420 (UTC+07:00)
    pub tz_offset_minutes: i32,

    /// Drift beyond which the device clock is rewritten
    /// Default: 5 seconds
    pub drift_threshold_seconds: u64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            enable: true,
            interval_seconds: 6 * 60 * 60,
            tz_offset_minutes: 420,
            drift_threshold_seconds: 5,
        }
    }
}

impl TimeSyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn drift_threshold(&self) -> Duration {
        Duration::from_secs(self.drift_threshold_seconds)
    }
}

/// Alarm subscription
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Default: true
    pub enable: bool,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self { enable: true }
    }
}

/// Intelligent video (analytics) subscription
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IvsConfig {
    /// Default: false
    pub enable: bool,

    /// Subscribe to every rule type on the channel
    /// Default: true
    pub subscribe_all: bool,

    /// Default: 0
    pub channel: u32,
}

impl Default for IvsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            subscribe_all: true,
            channel: 0,
        }
    }
}

impl IvsConfig {
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            channel: self.channel,
            subscribe_all: self.subscribe_all,
        }
    }
}

/// Snapshot liveness probe
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnapshotProbeConfig {
    /// Default: true
    pub enable: bool,

    /// Default: 300 seconds
    pub interval_seconds: u64,

    /// Default: 0
    pub channel: u32,
}

impl Default for SnapshotProbeConfig {
    fn default() -> Self {
        Self {
            enable: true,
            interval_seconds: 300,
            channel: 0,
        }
    }
}

impl SnapshotProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Remote reboot policy
///
/// The periodic reboot check only acts on snapshot probe failures, so with
/// the probe disabled it never reboots anything; explicit reboot requests
/// still go through the throttle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RebootPolicy {
    /// Remote reboots are only issued when this is set
    /// Default: false
    pub allow_remote_reboot: bool,

    /// Minimum time between two reboots of the same device
    /// Default: 3600 seconds
    pub min_interval_seconds: u64,

    /// Consecutive snapshot probe failures that make a device reboot-eligible
    /// Default: 3
    pub failure_threshold: u32,

    /// Seconds between reboot eligibility checks
    /// Default: 60
    pub check_interval_seconds: u64,
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            allow_remote_reboot: false,
            min_interval_seconds: 3600,
            failure_threshold: 3,
            check_interval_seconds: 60,
        }
    }
}

impl RebootPolicy {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_seconds)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

/// Login credentials of one configured device
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCredentials {
    pub host: String,

    #[serde(default = "default_device_port")]
    pub port: u16,

    pub username: String,

    pub password: SecretString,
}

fn default_device_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

impl DeviceCredentials {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            self.host.clone(),
            self.port,
            self.username.clone(),
            self.password.clone(),
        )
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.host.clone(), self.port)
    }
}

/// Configuration for the DeviceBridge
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub time_sync: TimeSyncConfig,

    pub alarms: AlarmConfig,

    pub ivs: IvsConfig,

    pub snapshot_probe: SnapshotProbeConfig,

    pub reboot_policy: RebootPolicy,

    /// Devices logged in at startup
    pub devices: Vec<DeviceCredentials>,

    /// Capacity of each per-kind event queue
    /// Default: 1024
    pub queue_capacity: usize,

    /// Timeout applied to every adapter call
    /// Default: 5000 ms
    pub invoke_timeout_ms: u64,

    /// Timeout applied to every sink forward
    /// Default: 10000 ms
    pub sink_timeout_ms: u64,

    /// Maximum device actions running at once across all jobs
    /// Default: 16
    pub max_concurrent_actions: usize,

    /// How long workers may drain queued events at shutdown
    /// Default: 5000 ms
    pub shutdown_grace_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            time_sync: TimeSyncConfig::default(),
            alarms: AlarmConfig::default(),
            ivs: IvsConfig::default(),
            snapshot_probe: SnapshotProbeConfig::default(),
            reboot_policy: RebootPolicy::default(),
            devices: Vec::new(),
            queue_capacity: 1024,
            invoke_timeout_ms: 5000,
            sink_timeout_ms: 10_000,
            max_concurrent_actions: 16,
            shutdown_grace_ms: 5000,
        }
    }
}

impl BridgeConfig {
    /// Create a new BridgeConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document. Missing sections take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(json)
            .map_err(|e| BridgeError::Configuration(format!("Invalid config JSON: {e}")))
    }

    /// Event forwarding only: no background jobs
    pub fn events_only() -> Self {
        Self {
            time_sync: TimeSyncConfig {
                enable: false,
                ..Default::default()
            },
            snapshot_probe: SnapshotProbeConfig {
                enable: false,
                ..Default::default()
            },
            ivs: IvsConfig {
                enable: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Small queues and low concurrency for constrained hosts
    pub fn resource_efficient() -> Self {
        Self {
            queue_capacity: 128,
            max_concurrent_actions: 4,
            ..Default::default()
        }
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Settings that are valid but probably not what was meant
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.reboot_policy.allow_remote_reboot && !self.snapshot_probe.enable {
            warnings.push(
                "Remote reboot is allowed but the snapshot probe is disabled; \
                 the reboot check will never find an eligible device"
                    .to_string(),
            );
        }

        warnings
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.queue_capacity == 0 {
            return Err(BridgeError::Configuration(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_actions == 0 {
            return Err(BridgeError::Configuration(
                "Max concurrent actions must be greater than 0".to_string(),
            ));
        }

        if self.invoke_timeout_ms == 0 || self.sink_timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "Invoke and sink timeouts must be greater than 0".to_string(),
            ));
        }

        if self.time_sync.enable && self.time_sync.interval_seconds == 0 {
            return Err(BridgeError::Configuration(
                "Time sync interval must be greater than 0".to_string(),
            ));
        }

        if self.time_sync.tz_offset_minutes.abs() > MAX_TZ_OFFSET_MINUTES {
            return Err(BridgeError::Configuration(format!(
                "Timezone offset {} minutes is out of range",
                self.time_sync.tz_offset_minutes
            )));
        }

        if self.snapshot_probe.enable && self.snapshot_probe.interval_seconds == 0 {
            return Err(BridgeError::Configuration(
                "Snapshot probe interval must be greater than 0".to_string(),
            ));
        }

        if self.reboot_policy.allow_remote_reboot {
            if self.reboot_policy.check_interval_seconds == 0 {
                return Err(BridgeError::Configuration(
                    "Reboot check interval must be greater than 0".to_string(),
                ));
            }
            if self.reboot_policy.failure_threshold == 0 {
                return Err(BridgeError::Configuration(
                    "Reboot failure threshold must be greater than 0".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.host.trim().is_empty() {
                return Err(BridgeError::Configuration(
                    "Device host must not be empty".to_string(),
                ));
            }
            if !seen.insert(device.key()) {
                return Err(BridgeError::Configuration(format!(
                    "Duplicate device {}",
                    device.key()
                )));
            }
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_device(mut self, device: DeviceCredentials) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_max_concurrent_actions(mut self, max: usize) -> Self {
        self.max_concurrent_actions = max;
        self
    }

    pub fn with_time_sync(mut self, time_sync: TimeSyncConfig) -> Self {
        self.time_sync = time_sync;
        self
    }

    pub fn with_ivs(mut self, ivs: IvsConfig) -> Self {
        self.ivs = ivs;
        self
    }

    pub fn with_snapshot_probe(mut self, probe: SnapshotProbeConfig) -> Self {
        self.snapshot_probe = probe;
        self
    }

    pub fn with_reboot_policy(mut self, policy: RebootPolicy) -> Self {
        self.reboot_policy = policy;
        self
    }
}
