//! Background job scheduler
//!
//! Each job kind runs on its own timer. A tick takes the current snapshot of
//! connected devices from the registry and runs the job's action once per
//! device, bounded by a semaphore shared across all jobs. A device whose
//! previous action of the same job is still running is skipped for that tick.

pub mod health;
pub mod reboot;
pub mod snapshot;
pub mod time_sync;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::AdapterError;
use crate::registry::{ConnectedDevice, SessionRegistry};
use crate::types::DeviceHandle;

pub use health::DeviceHealth;
pub use reboot::{RebootDecision, RebootJob, RebootThrottle};
pub use snapshot::SnapshotProbeJob;
pub use time_sync::TimeSyncJob;

/// Kinds of periodic device jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKind {
    TimeSync,
    SnapshotProbe,
    RebootCheck,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::TimeSync => "time_sync",
            JobKind::SnapshotProbe => "snapshot_probe",
            JobKind::RebootCheck => "reboot_check",
        };
        f.write_str(name)
    }
}

/// Timer settings of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSchedule {
    pub kind: JobKind,
    pub interval: Duration,
    /// Disabled jobs get no timer but can still be ticked on demand
    pub enabled: bool,
}

/// What a per-device action ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Done,
    /// Nothing needed doing, or policy said no
    Skipped(String),
}

/// A periodic action run against every connected device
#[async_trait]
pub trait DeviceJob: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn run(&self, device: &ConnectedDevice) -> Result<ActionOutcome, AdapterError>;

    /// Job-specific counters for stats output
    fn metrics(&self) -> Vec<(&'static str, u64)> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
struct JobCounters {
    ticks: AtomicU64,
    dispatched: AtomicU64,
    skipped_busy: AtomicU64,
    succeeded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

struct JobSlot {
    job: Arc<dyn DeviceJob>,
    schedule: JobSchedule,
    in_flight: DashSet<DeviceHandle>,
    counters: JobCounters,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
}

/// Marks a device busy for one job; released on drop, including on abort
struct InFlightGuard {
    slot: Arc<JobSlot>,
    handle: DeviceHandle,
}

impl InFlightGuard {
    fn acquire(slot: &Arc<JobSlot>, handle: DeviceHandle) -> Option<Self> {
        slot.in_flight.insert(handle).then(|| Self {
            slot: Arc::clone(slot),
            handle,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.slot.in_flight.remove(&self.handle);
    }
}

enum ActionResult {
    Succeeded,
    Skipped,
    Failed,
}

/// Summary of one tick of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub kind: JobKind,
    /// Connected devices in the snapshot
    pub devices: usize,
    pub dispatched: usize,
    /// Devices skipped because the previous action was still running
    pub skipped_busy: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl TickReport {
    fn new(kind: JobKind, devices: usize) -> Self {
        Self {
            kind,
            devices,
            dispatched: 0,
            skipped_busy: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

/// Runs the registered jobs on their timers
pub struct JobScheduler {
    registry: Arc<SessionRegistry>,
    slots: Vec<Arc<JobSlot>>,
    permits: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        max_concurrent_actions: usize,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            slots: Vec::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_actions.max(1))),
            clock,
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Add a job. Registering a kind twice replaces the earlier job.
    pub fn register(&mut self, job: Arc<dyn DeviceJob>, schedule: JobSchedule) {
        self.slots.retain(|slot| slot.schedule.kind != schedule.kind);
        tracing::debug!(job = %schedule.kind, interval = ?schedule.interval, enabled = schedule.enabled, "Job registered");
        self.slots.push(Arc::new(JobSlot {
            job,
            schedule,
            in_flight: DashSet::new(),
            counters: JobCounters::default(),
            last_run_at: Mutex::new(None),
        }));
    }

    fn slot(&self, kind: JobKind) -> Option<&Arc<JobSlot>> {
        self.slots.iter().find(|slot| slot.schedule.kind == kind)
    }

    /// Start one timer task per enabled job
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            tracing::debug!("Scheduler already started");
            return;
        }

        for slot in self.slots.iter().filter(|slot| slot.schedule.enabled) {
            tasks.push(tokio::spawn(run_timer(
                Arc::clone(slot),
                Arc::clone(&self.registry),
                Arc::clone(&self.permits),
                Arc::clone(&self.clock),
                self.cancel.clone(),
            )));
        }

        tracing::info!(jobs = tasks.len(), "Background jobs started");
    }

    /// Run one tick of `kind` now and wait for its actions.
    ///
    /// Returns `None` if no such job is registered.
    pub async fn run_tick(&self, kind: JobKind) -> Option<TickReport> {
        let slot = Arc::clone(self.slot(kind)?);
        Some(
            tick(
                slot,
                Arc::clone(&self.registry),
                Arc::clone(&self.permits),
                Arc::clone(&self.clock),
            )
            .await,
        )
    }

    pub fn stats(&self) -> Vec<JobStats> {
        self.slots
            .iter()
            .map(|slot| JobStats {
                kind: slot.schedule.kind,
                enabled: slot.schedule.enabled,
                interval: slot.schedule.interval,
                ticks: slot.counters.ticks.load(Ordering::Relaxed),
                dispatched: slot.counters.dispatched.load(Ordering::Relaxed),
                skipped_busy: slot.counters.skipped_busy.load(Ordering::Relaxed),
                succeeded: slot.counters.succeeded.load(Ordering::Relaxed),
                skipped: slot.counters.skipped.load(Ordering::Relaxed),
                failed: slot.counters.failed.load(Ordering::Relaxed),
                in_flight: slot.in_flight.len(),
                last_run_at: *slot.last_run_at.lock().unwrap_or_else(|e| e.into_inner()),
                metrics: slot.job.metrics(),
            })
            .collect()
    }

    /// Stop all timers and abort in-flight ticks.
    ///
    /// Timers still running after `grace` are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        let abort_handles: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

        match tokio::time::timeout(grace, futures::future::join_all(tasks)).await {
            Ok(_) => tracing::debug!("Background jobs stopped"),
            Err(_) => {
                tracing::warn!(?grace, "Background jobs did not stop within the grace period, aborting");
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }
    }
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("jobs", &self.slots.iter().map(|s| s.schedule.kind).collect::<Vec<_>>())
            .finish()
    }
}

async fn run_timer(
    slot: Arc<JobSlot>,
    registry: Arc<SessionRegistry>,
    permits: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let kind = slot.schedule.kind;
    let mut ticker = tokio::time::interval(slot.schedule.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Ticks are not awaited by the timer, so a slow device never delays the
    // next tick. Dropping the set aborts whatever is still running.
    let mut ticks = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                ticks.spawn(tick(
                    Arc::clone(&slot),
                    Arc::clone(&registry),
                    Arc::clone(&permits),
                    Arc::clone(&clock),
                ));
            }
            Some(finished) = ticks.join_next(), if !ticks.is_empty() => {
                if let Ok(report) = finished {
                    tracing::debug!(
                        job = %report.kind,
                        devices = report.devices,
                        succeeded = report.succeeded,
                        failed = report.failed,
                        skipped_busy = report.skipped_busy,
                        "Job tick finished"
                    );
                }
            }
        }
    }

    ticks.shutdown().await;
    tracing::debug!(job = %kind, "Job timer stopped");
}

async fn tick(
    slot: Arc<JobSlot>,
    registry: Arc<SessionRegistry>,
    permits: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
) -> TickReport {
    let kind = slot.schedule.kind;
    let devices = registry.list_connected();

    slot.counters.ticks.fetch_add(1, Ordering::Relaxed);
    *slot.last_run_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(clock.now());

    let mut report = TickReport::new(kind, devices.len());
    let mut actions = JoinSet::new();

    for device in devices {
        let Some(guard) = InFlightGuard::acquire(&slot, device.handle) else {
            report.skipped_busy += 1;
            slot.counters.skipped_busy.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job = %kind, device = %device.key, "Previous action still running, skipping");
            continue;
        };

        report.dispatched += 1;
        slot.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let slot = Arc::clone(&slot);
        let permits = Arc::clone(&permits);
        actions.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return ActionResult::Failed;
            };
            run_action(&slot, &device).await
        });
    }

    while let Some(result) = actions.join_next().await {
        match result {
            Ok(ActionResult::Succeeded) => report.succeeded += 1,
            Ok(ActionResult::Skipped) => report.skipped += 1,
            Ok(ActionResult::Failed) => report.failed += 1,
            Err(e) => {
                report.failed += 1;
                slot.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(job = %kind, error = %e, "Job action panicked or was aborted");
            }
        }
    }

    report
}

async fn run_action(slot: &JobSlot, device: &ConnectedDevice) -> ActionResult {
    let kind = slot.schedule.kind;

    match slot.job.run(device).await {
        Ok(ActionOutcome::Done) => {
            slot.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job = %kind, device = %device.key, "Job action done");
            ActionResult::Succeeded
        }
        Ok(ActionOutcome::Skipped(reason)) => {
            slot.counters.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job = %kind, device = %device.key, reason = %reason, "Job action skipped");
            ActionResult::Skipped
        }
        Err(e) => {
            slot.counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job = %kind, device = %device.key, handle = %device.handle, error = %e, "Job action failed");
            ActionResult::Failed
        }
    }
}

/// Counters of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStats {
    pub kind: JobKind,
    pub enabled: bool,
    pub interval: Duration,
    pub ticks: u64,
    pub dispatched: u64,
    pub skipped_busy: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub in_flight: usize,
    pub last_run_at: Option<DateTime<Utc>>,
    pub metrics: Vec<(&'static str, u64)>,
}

impl fmt::Display for JobStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, every {:?}): {} ticks, {} ok, {} skipped, {} failed, {} busy",
            self.kind,
            if self.enabled { "enabled" } else { "disabled" },
            self.interval,
            self.ticks,
            self.succeeded,
            self.skipped,
            self.failed,
            self.skipped_busy
        )?;
        for (name, value) in &self.metrics {
            write!(f, ", {name}={value}")?;
        }
        Ok(())
    }
}
