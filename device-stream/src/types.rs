//! Core identifiers and data types shared by every component.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle for an established device connection, assigned by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    /// Wrap a raw adapter login id
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw login id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "login-{}", self.0)
    }
}

/// Stable key of a device session: one session per `(host, port)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
}

impl SessionKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable login identity of a device.
///
/// The credential is only readable through `secrecy::ExposeSecret`, which the
/// transport adapter does at login time. `Debug` output redacts it.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    host: String,
    port: u16,
    username: String,
    credential: SecretString,
}

impl DeviceIdentity {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credential: SecretString,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            credential,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn credential(&self) -> &SecretString {
        &self.credential
    }

    /// The session key this identity maps to
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.host.clone(), self.port)
    }
}

/// Category of a device event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Alarm,
    Analytics,
    Snapshot,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Alarm, EventKind::Analytics, EventKind::Snapshot];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Alarm => "alarm",
            EventKind::Analytics => "analytics",
            EventKind::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription kinds a device can be attached to.
///
/// Snapshots are requested by the probe job rather than subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Alarm,
    Analytics,
}

impl SubscriptionKind {
    /// The event stream this subscription feeds
    pub fn event_kind(&self) -> EventKind {
        match self {
            SubscriptionKind::Alarm => EventKind::Alarm,
            SubscriptionKind::Analytics => EventKind::Analytics,
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_kind().as_str())
    }
}

/// Options passed through to the adapter when starting a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Video channel the subscription applies to
    pub channel: u32,
    /// Analytics only: subscribe to every rule type on the channel
    pub subscribe_all: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            channel: 0,
            subscribe_all: true,
        }
    }
}

/// A push delivered by the adapter before normalization
#[derive(Debug, Clone)]
pub struct RawPush {
    pub handle: DeviceHandle,
    /// Vendor command / alarm type code, when the device sends one
    pub command: Option<i64>,
    /// Device-supplied sequence number, when the device sends one
    pub sequence: Option<u64>,
    pub payload: Bytes,
}

impl RawPush {
    pub fn new(handle: DeviceHandle, payload: impl Into<Bytes>) -> Self {
        Self {
            handle,
            command: None,
            sequence: None,
            payload: payload.into(),
        }
    }

    pub fn with_command(mut self, command: i64) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// A normalized device event, immutable once enqueued
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub handle: DeviceHandle,
    pub kind: EventKind,
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    pub command: Option<i64>,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_and_redaction() {
        let identity = DeviceIdentity::new(
            "10.0.0.5",
            37777,
            "admin",
            SecretString::from("hunter2".to_string()),
        );

        assert_eq!(identity.key(), SessionKey::new("10.0.0.5", 37777));
        assert_eq!(identity.key().to_string(), "10.0.0.5:37777");
        assert!(!format!("{:?}", identity).contains("hunter2"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::Snapshot.to_string(), "snapshot");
        assert_eq!(SubscriptionKind::Analytics.to_string(), "analytics");
        assert_eq!(SubscriptionKind::Alarm.event_kind(), EventKind::Alarm);
        assert_eq!(DeviceHandle::new(42).to_string(), "login-42");
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&EventKind::Analytics).unwrap();
        assert_eq!(json, "\"analytics\"");
    }
}
