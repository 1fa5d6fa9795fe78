//! Error types for the device-stream crate.

use std::time::Duration;

use crate::types::{DeviceHandle, SessionKey, SubscriptionKind};

/// Failures reported by the transport adapter.
///
/// Always scoped to one call against one device; never fatal on its own.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// The call did not complete within its timeout
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The device could not be reached
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// The device refused the request (bad credentials, unsupported call)
    #[error("Rejected by device: {0}")]
    Rejected(String),

    /// The handle is not, or no longer, logged in
    #[error("Not connected: {0}")]
    NotConnected(DeviceHandle),

    /// The adapter answered with something the caller did not expect
    #[error("Unexpected response to {0}")]
    UnexpectedResponse(String),

    /// Any other adapter fault
    #[error("Adapter fault: {0}")]
    Fault(String),
}

/// Errors from the session registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The adapter rejected the login or could not reach the device
    #[error("Login failed for {key}: {source}")]
    LoginFailure {
        key: SessionKey,
        #[source]
        source: AdapterError,
    },

    /// The session was logged out or deregistered while the login was in flight
    #[error("Login aborted for {0}")]
    LoginAborted(SessionKey),

    /// No session exists for the key
    #[error("Unknown session: {0}")]
    UnknownSession(SessionKey),
}

/// Errors from the subscription manager
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The adapter refused or failed to start the subscription
    #[error("Subscription {kind} failed for {handle}: {reason}")]
    SubscriptionFailure {
        handle: DeviceHandle,
        kind: SubscriptionKind,
        reason: String,
    },
}

/// Errors from the downstream event sink
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The event could not be encoded for the sink
    #[error("Failed to encode event: {0}")]
    Encoding(String),

    /// The sink did not accept the event
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// The sink did not answer in time
    #[error("Sink timed out")]
    Timeout,
}

impl From<cms_sink::CmsError> for SinkError {
    fn from(err: cms_sink::CmsError) -> Self {
        match err {
            cms_sink::CmsError::Timeout => SinkError::Timeout,
            other => SinkError::Delivery(other.to_string()),
        }
    }
}

/// Top-level errors of the device bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The transport adapter failed to initialize; the bridge cannot run
    #[error("Adapter initialization failed: {0}")]
    AdapterInit(AdapterError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// An error occurred during shutdown
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Convenience type alias for Results using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
pub type SubscriptionResult<T> = std::result::Result<T, SubscriptionError>;
