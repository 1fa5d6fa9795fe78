//! DeviceBridge: wires the registry, subscriptions, event pipeline and jobs
//!
//! ```rust,ignore
//! let bridge = DeviceBridge::new(config, adapter, sink).await?;
//! let report = bridge.start().await;
//! println!("{report}");
//! // ...
//! bridge.shutdown().await?;
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::adapter::{with_timeout, TransportAdapter};
use crate::clock::{Clock, SystemClock};
use crate::config::BridgeConfig;
use crate::error::{AdapterError, BridgeError, RegistryError, Result, SubscriptionError};
use crate::events::{ConsumerWorkers, EventDispatcher, EventQueues, QueueStats, WorkerStats};
use crate::registry::{
    ConnectedDevice, ConnectionEvent, ConnectionState, RegistryStats, SessionRegistry,
};
use crate::scheduler::{
    DeviceHealth, DeviceJob, JobKind, JobSchedule, JobScheduler, JobStats, RebootDecision,
    RebootJob, SnapshotProbeJob, TickReport, TimeSyncJob,
};
use crate::sink::EventSink;
use crate::subscription::{SubscriptionManager, SubscriptionRecord, SubscriptionStats};
use crate::types::{
    DeviceHandle, DeviceIdentity, EventKind, SessionKey, SubscribeOptions, SubscriptionKind,
};

/// Outcome of [`DeviceBridge::start`]
#[derive(Debug, Default)]
pub struct StartupReport {
    pub logged_in: Vec<(SessionKey, DeviceHandle)>,
    pub login_failures: Vec<RegistryError>,
    pub attached: usize,
    pub subscription_failures: Vec<SubscriptionError>,
}

impl fmt::Display for StartupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} devices logged in, {} login failures, {} subscriptions attached, {} subscription failures",
            self.logged_in.len(),
            self.login_failures.len(),
            self.attached,
            self.subscription_failures.len()
        )
    }
}

/// Per-device line of [`BridgeStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub key: SessionKey,
    pub handle: Option<DeviceHandle>,
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub alarm_active: bool,
    pub analytics_active: bool,
}

/// Queryable snapshot of the whole bridge
#[derive(Debug, Clone)]
pub struct BridgeStats {
    pub registry: RegistryStats,
    pub devices: Vec<DeviceStatus>,
    pub subscriptions: SubscriptionStats,
    pub queues: Vec<QueueStats>,
    pub workers: Vec<WorkerStats>,
    pub jobs: Vec<JobStats>,
}

impl BridgeStats {
    /// Events dropped on queue overflow plus events the sink did not accept
    pub fn events_dropped(&self) -> u64 {
        let overflowed: u64 = self.queues.iter().map(|q| q.overflowed).sum();
        let rejected: u64 = self.workers.iter().map(|w| w.dropped()).sum();
        overflowed + rejected
    }
}

impl fmt::Display for BridgeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Registry: {}", self.registry)?;
        for device in &self.devices {
            writeln!(
                f,
                "  {} [{}] alarm={} analytics={} failures={}",
                device.key,
                device.state,
                device.alarm_active,
                device.analytics_active,
                device.consecutive_failures
            )?;
        }
        writeln!(f, "Subscriptions: {}", self.subscriptions)?;
        for queue in &self.queues {
            writeln!(f, "Queue {queue}")?;
        }
        for worker in &self.workers {
            writeln!(f, "Worker {worker}")?;
        }
        for job in &self.jobs {
            writeln!(f, "Job {job}")?;
        }
        write!(f, "Events dropped: {}", self.events_dropped())
    }
}

/// The device session and event subscription manager
pub struct DeviceBridge {
    config: BridgeConfig,
    registry: Arc<SessionRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: Arc<EventDispatcher>,
    scheduler: JobScheduler,
    reboot: Arc<RebootJob>,
    health: Arc<DeviceHealth>,
    workers: Mutex<Option<ConsumerWorkers>>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceBridge {
    /// Build a bridge on the system clock
    pub async fn new(
        config: BridgeConfig,
        adapter: Arc<dyn TransportAdapter>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        Self::with_clock(config, adapter, sink, Arc::new(SystemClock)).await
    }

    /// Build a bridge, initialize the adapter and start the consumer workers.
    ///
    /// Fails only on invalid configuration or adapter initialization failure.
    pub async fn with_clock(
        config: BridgeConfig,
        adapter: Arc<dyn TransportAdapter>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        for warning in config.warnings() {
            tracing::warn!("{}", warning);
        }

        with_timeout("Initialize", config.invoke_timeout(), adapter.initialize())
            .await
            .map_err(BridgeError::AdapterInit)?;

        let call_timeout = config.invoke_timeout();
        let cancel = CancellationToken::new();

        let queues = EventQueues::new(config.queue_capacity);
        let dispatcher = Arc::new(EventDispatcher::new(queues.clone(), Arc::clone(&clock)));

        let (registry, connection_events) =
            SessionRegistry::new(Arc::clone(&adapter), Arc::clone(&clock), call_timeout);
        let registry = Arc::new(registry);
        adapter.set_connection_listener(registry.listener());

        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&adapter),
            Arc::clone(&dispatcher),
            Arc::clone(&clock),
            call_timeout,
        ));
        // Probe pictures arrive as pushes even though nothing subscribes to them
        subscriptions.ensure_push_handler(EventKind::Snapshot);

        let health = Arc::new(DeviceHealth::new());
        let reboot = Arc::new(RebootJob::new(
            Arc::clone(&adapter),
            Arc::clone(&health),
            config.reboot_policy.clone(),
            Arc::clone(&clock),
            call_timeout,
        ));

        let mut scheduler = JobScheduler::new(
            Arc::clone(&registry),
            config.max_concurrent_actions,
            Arc::clone(&clock),
            cancel.child_token(),
        );
        scheduler.register(
            Arc::new(TimeSyncJob::new(
                Arc::clone(&adapter),
                Arc::clone(&clock),
                &config.time_sync,
                call_timeout,
            )),
            JobSchedule {
                kind: JobKind::TimeSync,
                interval: config.time_sync.interval(),
                enabled: config.time_sync.enable,
            },
        );
        scheduler.register(
            Arc::new(SnapshotProbeJob::new(
                Arc::clone(&adapter),
                Arc::clone(&health),
                config.snapshot_probe.channel,
                call_timeout,
            )),
            JobSchedule {
                kind: JobKind::SnapshotProbe,
                interval: config.snapshot_probe.interval(),
                enabled: config.snapshot_probe.enable,
            },
        );
        scheduler.register(
            Arc::clone(&reboot) as Arc<dyn DeviceJob>,
            JobSchedule {
                kind: JobKind::RebootCheck,
                interval: config.reboot_policy.check_interval(),
                enabled: config.reboot_policy.allow_remote_reboot,
            },
        );

        let workers = ConsumerWorkers::start(&queues, sink, config.sink_timeout(), cancel.child_token());

        let forwarder = tokio::spawn(forward_connection_events(
            connection_events,
            Arc::clone(&subscriptions),
            cancel.child_token(),
        ));

        tracing::info!(
            devices = config.devices.len(),
            queue_capacity = config.queue_capacity,
            "Device bridge initialized"
        );

        Ok(Self {
            config,
            registry,
            subscriptions,
            dispatcher,
            scheduler,
            reboot,
            health,
            workers: Mutex::new(Some(workers)),
            cancel,
            background: Mutex::new(vec![forwarder]),
        })
    }

    /// Log in every configured device, attach subscriptions on the ones that
    /// connected, then start the background jobs.
    ///
    /// Per-device failures are reported, never returned as an error.
    pub async fn start(&self) -> StartupReport {
        let mut report = StartupReport::default();

        let identities: Vec<DeviceIdentity> =
            self.config.devices.iter().map(|device| device.identity()).collect();
        let logins = join_all(identities.iter().map(|identity| self.registry.login(identity))).await;

        for (identity, result) in identities.iter().zip(logins) {
            match result {
                Ok(handle) => report.logged_in.push((identity.key(), handle)),
                Err(e) => report.login_failures.push(e),
            }
        }

        let attaches = join_all(
            report
                .logged_in
                .iter()
                .map(|(_, handle)| self.attach_configured(*handle)),
        )
        .await;

        for (attached, failures) in attaches {
            report.attached += attached;
            report.subscription_failures.extend(failures);
        }

        self.scheduler.start();

        tracing::info!(%report, "Device bridge started");
        report
    }

    /// Attach every configured subscription kind on one device
    async fn attach_configured(&self, handle: DeviceHandle) -> (usize, Vec<SubscriptionError>) {
        let mut wanted: Vec<(SubscriptionKind, SubscribeOptions)> = Vec::new();
        if self.config.alarms.enable {
            wanted.push((SubscriptionKind::Alarm, SubscribeOptions::default()));
        }
        if self.config.ivs.enable {
            wanted.push((SubscriptionKind::Analytics, self.config.ivs.subscribe_options()));
        }

        let mut attached = 0;
        let mut failures = Vec::new();
        for (kind, options) in wanted {
            match self.subscriptions.attach(handle, kind, options).await {
                Ok(_) => attached += 1,
                Err(e) => failures.push(e),
            }
        }
        (attached, failures)
    }

    /// Log in a device outside the configured list and attach its subscriptions
    pub async fn login_device(&self, identity: &DeviceIdentity) -> Result<DeviceHandle> {
        let handle = self.registry.login(identity).await?;
        let (_, failures) = self.attach_configured(handle).await;
        if let Some(first) = failures.into_iter().next() {
            return Err(first.into());
        }
        Ok(handle)
    }

    /// Stop a device's subscriptions, log it out and forget it
    pub async fn deregister(&self, key: &SessionKey) -> Result<()> {
        if let Some(handle) = self.registry.session(key).and_then(|s| s.handle()) {
            self.subscriptions.detach_all(handle).await;
            self.dispatcher.forget(handle);
        }
        self.registry.deregister(key).await?;
        self.health.reset(key);
        Ok(())
    }

    /// Explicit reboot request, subject to the reboot policy and throttle
    pub async fn try_reboot(&self, handle: DeviceHandle) -> Result<RebootDecision> {
        let device = self
            .registry
            .list_connected()
            .into_iter()
            .find(|device| device.handle == handle)
            .ok_or(AdapterError::NotConnected(handle))?;

        Ok(self.reboot.try_reboot(&device, true).await?)
    }

    /// Run one tick of a job immediately and wait for it
    pub async fn run_job_now(&self, kind: JobKind) -> Option<TickReport> {
        self.scheduler.run_tick(kind).await
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn queues(&self) -> &EventQueues {
        self.dispatcher.queues()
    }

    pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
        self.registry.list_connected()
    }

    pub fn stats(&self) -> BridgeStats {
        let records: Vec<SubscriptionRecord> = self.subscriptions.records();
        let is_active = |handle: Option<DeviceHandle>, kind: SubscriptionKind| {
            handle.is_some_and(|handle| {
                records
                    .iter()
                    .any(|r| r.handle == handle && r.kind == kind && r.is_active())
            })
        };

        let devices = self
            .registry
            .sessions()
            .into_iter()
            .map(|session| DeviceStatus {
                key: session.key(),
                handle: session.handle(),
                state: session.state(),
                consecutive_failures: session.consecutive_failures(),
                alarm_active: is_active(session.handle(), SubscriptionKind::Alarm),
                analytics_active: is_active(session.handle(), SubscriptionKind::Analytics),
            })
            .collect();

        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|workers| workers.stats())
            .unwrap_or_default();

        BridgeStats {
            registry: self.registry.stats(),
            devices,
            subscriptions: self.subscriptions.stats(),
            queues: self.dispatcher.queues().stats(),
            workers,
            jobs: self.scheduler.stats(),
        }
    }

    /// Stop jobs and workers, drain queued events for up to the shutdown
    /// grace period, stop subscriptions and log out every device.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(workers) = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Ok(());
        };

        tracing::info!("Shutting down device bridge");
        self.cancel.cancel();

        let grace = self.config.shutdown_grace();
        self.scheduler.shutdown(grace).await;

        let background: Vec<JoinHandle<()>> = {
            let mut tasks = self.background.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in background {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                abort.abort();
            }
        }

        let stats = workers.shutdown(grace).await;
        for worker in &stats {
            tracing::debug!(%worker, "Worker final stats");
        }

        let active: Vec<SubscriptionRecord> = self
            .subscriptions
            .records()
            .into_iter()
            .filter(|record| record.is_active())
            .collect();
        join_all(
            active
                .iter()
                .map(|record| self.subscriptions.detach(record.handle, record.kind)),
        )
        .await;
        self.subscriptions.clear();

        self.registry.logout_all().await;

        tracing::info!("Device bridge stopped");
        Ok(())
    }
}

impl Drop for DeviceBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for DeviceBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBridge")
            .field("registry", &self.registry)
            .field("subscriptions", &self.subscriptions)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Re-attach subscriptions whenever the registry reports a reconnect
async fn forward_connection_events(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    subscriptions: Arc<SubscriptionManager>,
    cancel: CancellationToken,
) {
    let mut reattaches = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(ConnectionEvent::Reconnected(handle)) => {
                    let subscriptions = Arc::clone(&subscriptions);
                    reattaches.spawn(async move { subscriptions.reattach(handle).await });
                }
                Some(ConnectionEvent::Disconnected(handle)) => {
                    tracing::debug!(%handle, "Waiting for adapter to reconnect");
                }
                None => break,
            },
            Some(_) = reattaches.join_next(), if !reattaches.is_empty() => {}
        }
    }

    reattaches.shutdown().await;
}
