//! # device-stream
//!
//! Session, subscription and background job management for fleets of
//! NetSDK cameras and recorders.
//!
//! # Architecture
//!
//! ```text
//! TransportAdapter push callbacks → EventDispatcher → EventQueues (per kind, drop-oldest)
//!                                                          ↓
//!                                                   ConsumerWorkers → EventSink (CMS)
//!
//! SessionRegistry ← JobScheduler (time sync, snapshot probe, reboot check)
//!        ↓ reconnect
//! SubscriptionManager (re-attach)
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use device_stream::prelude::*;
//!
//! init_logging_from_env()?;
//!
//! let config = BridgeConfig::from_json_str(&std::fs::read_to_string("bridge.json")?)?;
//! let bridge = DeviceBridge::new(config, adapter, sink).await?;
//!
//! let report = bridge.start().await;
//! tracing::info!(%report, "Bridge running");
//!
//! tokio::signal::ctrl_c().await?;
//! bridge.shutdown().await?;
//! ```
//!
//! The vendor SDK binding is supplied by the caller as a [`TransportAdapter`];
//! every adapter call runs under a timeout, so a hung device never blocks the
//! bridge.

pub mod adapter;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod subscription;
pub mod types;

pub use adapter::{
    ConnectionListener, DeviceOperation, DeviceTime, OperationOutput, PushHandler,
    TransportAdapter,
};
pub use bridge::{BridgeStats, DeviceBridge, DeviceStatus, StartupReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AlarmConfig, BridgeConfig, DeviceCredentials, IvsConfig, RebootPolicy, SnapshotProbeConfig,
    TimeSyncConfig,
};
pub use error::{
    AdapterError, AdapterResult, BridgeError, RegistryError, RegistryResult, Result, SinkError,
    SubscriptionError, SubscriptionResult,
};
pub use events::{ConsumerWorkers, EventDispatcher, EventQueue, EventQueues, QueueStats, WorkerStats};
pub use logging::{init_logging, init_logging_from_env, LoggingError, LoggingMode};
pub use registry::{
    ConnectedDevice, ConnectionEvent, ConnectionState, DeviceSession, LoginRetryPolicy,
    RegistryStats, SessionRegistry,
};
pub use scheduler::{
    ActionOutcome, DeviceHealth, DeviceJob, JobKind, JobSchedule, JobScheduler, JobStats,
    RebootDecision, RebootJob, RebootThrottle, SnapshotProbeJob, TickReport, TimeSyncJob,
};
pub use sink::{CmsEnvelope, CmsEventSink, EventSink};
pub use subscription::{
    AttachOutcome, ReattachReport, SubscriptionManager, SubscriptionRecord, SubscriptionState,
    SubscriptionStats,
};
pub use types::{
    DeviceHandle, DeviceIdentity, Event, EventKind, RawPush, SessionKey, SubscribeOptions,
    SubscriptionKind,
};

/// Everything needed to embed the bridge
pub mod prelude {
    pub use crate::{
        init_logging, init_logging_from_env, BridgeConfig, BridgeError, CmsEventSink,
        DeviceBridge, DeviceCredentials, DeviceHandle, DeviceIdentity, Event, EventKind,
        EventSink, LoggingMode, SessionKey, StartupReport, SubscriptionKind, TransportAdapter,
    };
}
