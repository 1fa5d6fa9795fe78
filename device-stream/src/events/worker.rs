//! Consumer workers draining the event queues into the sink.
//!
//! One worker per queue kind, so events of a device+kind stream reach the sink
//! in arrival order. Each forward runs under the sink timeout; a failed or
//! timed out forward drops the event and is counted.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::queue::{EventQueue, EventQueues};
use crate::sink::EventSink;
use crate::types::{Event, EventKind};

#[derive(Debug, Default)]
struct WorkerCounters {
    forwarded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl WorkerCounters {
    fn snapshot(&self, kind: EventKind) -> WorkerStats {
        WorkerStats {
            kind,
            forwarded: self.forwarded.load(Ordering::Relaxed),
            sink_failures: self.failed.load(Ordering::Relaxed),
            sink_timeouts: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one consumer worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub kind: EventKind,
    pub forwarded: u64,
    pub sink_failures: u64,
    pub sink_timeouts: u64,
}

impl WorkerStats {
    /// Events taken off the queue but not accepted by the sink
    pub fn dropped(&self) -> u64 {
        self.sink_failures + self.sink_timeouts
    }
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} worker: {} forwarded, {} failed, {} timed out",
            self.kind, self.forwarded, self.sink_failures, self.sink_timeouts
        )
    }
}

struct Worker {
    kind: EventKind,
    counters: Arc<WorkerCounters>,
    task: JoinHandle<()>,
}

/// The running pool of consumer workers
pub struct ConsumerWorkers {
    workers: Vec<Worker>,
    cancel: CancellationToken,
}

impl ConsumerWorkers {
    /// Spawn one worker per queue. Workers stop when `cancel` fires, after
    /// draining whatever is still queued.
    pub fn start(
        queues: &EventQueues,
        sink: Arc<dyn EventSink>,
        sink_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let workers = queues
            .iter()
            .map(|queue| {
                let counters = Arc::new(WorkerCounters::default());
                let task = tokio::spawn(run_worker(
                    Arc::clone(queue),
                    Arc::clone(&sink),
                    sink_timeout,
                    Arc::clone(&counters),
                    cancel.clone(),
                ));

                Worker {
                    kind: queue.kind(),
                    counters,
                    task,
                }
            })
            .collect();

        tracing::debug!(?sink_timeout, "Consumer workers started");

        Self { workers, cancel }
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers
            .iter()
            .map(|worker| worker.counters.snapshot(worker.kind))
            .collect()
    }

    /// Stop accepting new work, let workers drain for up to `grace`, then
    /// abort whatever is still running. Returns the final counters.
    pub async fn shutdown(self, grace: Duration) -> Vec<WorkerStats> {
        self.cancel.cancel();

        let abort_handles: Vec<_> = self.workers.iter().map(|w| w.task.abort_handle()).collect();
        let counters: Vec<(EventKind, Arc<WorkerCounters>)> = self
            .workers
            .iter()
            .map(|w| (w.kind, Arc::clone(&w.counters)))
            .collect();
        let tasks: Vec<JoinHandle<()>> = self.workers.into_iter().map(|w| w.task).collect();

        match tokio::time::timeout(grace, futures::future::join_all(tasks)).await {
            Ok(_) => tracing::debug!("Consumer workers drained"),
            Err(_) => {
                tracing::warn!(?grace, "Consumer workers did not drain in time, aborting");
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }

        counters
            .into_iter()
            .map(|(kind, counters)| counters.snapshot(kind))
            .collect()
    }
}

impl fmt::Debug for ConsumerWorkers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerWorkers")
            .field("workers", &self.workers.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

async fn run_worker(
    queue: Arc<EventQueue>,
    sink: Arc<dyn EventSink>,
    sink_timeout: Duration,
    counters: Arc<WorkerCounters>,
    cancel: CancellationToken,
) {
    let kind = queue.kind();
    tracing::debug!(kind = %kind, "Consumer worker running");

    loop {
        while let Some(event) = queue.pop() {
            deliver(sink.as_ref(), event, sink_timeout, &counters).await;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = queue.notified() => {}
        }
    }

    // Drain what was queued before shutdown; the caller bounds how long this may take
    let mut drained = 0usize;
    while let Some(event) = queue.pop() {
        deliver(sink.as_ref(), event, sink_timeout, &counters).await;
        drained += 1;
    }

    tracing::debug!(kind = %kind, drained, "Consumer worker stopped");
}

async fn deliver(sink: &dyn EventSink, event: Event, sink_timeout: Duration, counters: &WorkerCounters) {
    match tokio::time::timeout(sink_timeout, sink.forward(&event)).await {
        Ok(Ok(())) => {
            counters.forwarded.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                kind = %event.kind,
                handle = %event.handle,
                sequence = event.sequence,
                error = %e,
                "Sink rejected event, dropping"
            );
        }
        Err(_) => {
            counters.timed_out.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                kind = %event.kind,
                handle = %event.handle,
                sequence = event.sequence,
                ?sink_timeout,
                "Sink timed out, dropping event"
            );
        }
    }
}
