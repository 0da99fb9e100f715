//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Per-link worker task executing queued operations."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use t_dcs_common::time::monotonic_now;
use t_dcs_metrics::CommMetrics;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelFactory};
use crate::devices::{Controller, DeviceRegistry};
use crate::operation::{OpStep, Operation, PriorityLevel};
use crate::queue::PollQueue;
use crate::CommError;

/// Load-average window, matching the 30 second busy-interval report of the
/// legacy field-comm servers this replaces.
const LOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before re-attempting a failed channel connect.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Builds the settings-download operations for a controller when it reports
/// a download request status.
pub type DownloadHandler =
    Box<dyn Fn(&Arc<Controller>, PriorityLevel) -> Vec<Box<dyn Operation>> + Send + Sync>;

struct LoadTracker {
    window_start: Instant,
    busy: Duration,
}

impl LoadTracker {
    fn new() -> Self {
        Self {
            window_start: monotonic_now(),
            busy: Duration::ZERO,
        }
    }

    fn record(&mut self, elapsed: Duration) -> Option<f64> {
        self.busy += elapsed;
        let window = self.window_start.elapsed();
        if window >= LOAD_INTERVAL {
            let load = self.busy.as_secs_f64() / window.as_secs_f64();
            self.window_start = monotonic_now();
            self.busy = Duration::ZERO;
            Some(load)
        } else {
            None
        }
    }
}

/// Worker for one communication link.
///
/// All operations against controllers on the link run strictly sequentially
/// on this task, ordered by priority then FIFO, because the underlying
/// transport is a shared serial/TCP byte stream with no multiplexing.
pub struct CommLink {
    name: String,
    queue: Arc<PollQueue>,
    metrics: Option<CommMetrics>,
    task: JoinHandle<()>,
}

impl CommLink {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        name: impl Into<String>,
        factory: Arc<dyn ChannelFactory>,
        registry: Arc<DeviceRegistry>,
        download: Option<DownloadHandler>,
        metrics: Option<CommMetrics>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let name = name.into();
        let queue = Arc::new(PollQueue::new());
        let worker = Worker {
            name: name.clone(),
            queue: queue.clone(),
            factory,
            registry,
            download,
            metrics: metrics.clone(),
        };
        let task = tokio::spawn(worker.run(shutdown));
        Self {
            name,
            queue,
            metrics,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> Arc<PollQueue> {
        self.queue.clone()
    }

    /// A cheap handle pollers keep for submitting operations.
    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            name: self.name.clone(),
            queue: self.queue.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Submit an operation for execution. Duplicates of a pending operation
    /// are dropped, not queued twice; a dropped operation never began, so no
    /// cleanup is owed.
    pub fn submit(&self, op: Box<dyn Operation>) -> bool {
        self.handle().submit(op)
    }

    /// Close the queue and wait for the worker to finish draining.
    pub async fn shutdown(self) {
        self.queue.close_and_notify();
        if let Err(err) = self.task.await {
            error!(link = %self.name, error = %err, "link worker join error");
        }
    }
}

/// Submission handle for one link's poll queue.
#[derive(Clone)]
pub struct LinkHandle {
    name: String,
    queue: Arc<PollQueue>,
    metrics: Option<CommMetrics>,
}

impl LinkHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submit(&self, op: Box<dyn Operation>) -> bool {
        match self.queue.add(op) {
            Ok(()) => true,
            Err(op) => {
                debug!(link = %self.name, op = %op.key(), "operation not queued");
                if let Some(metrics) = &self.metrics {
                    metrics.record_dropped(&self.name);
                }
                false
            }
        }
    }
}

impl PollQueue {
    fn close_and_notify(&self) {
        // Worker observes the close on its next queue.next() call; any
        // already-drained operations are failed there.
        let _ = self.close();
    }
}

struct Worker {
    name: String,
    queue: Arc<PollQueue>,
    factory: Arc<dyn ChannelFactory>,
    registry: Arc<DeviceRegistry>,
    download: Option<DownloadHandler>,
    metrics: Option<CommMetrics>,
}

impl Worker {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(link = %self.name, "link worker starting");
        let mut channel: Option<Box<dyn Channel>> = None;
        let mut load = LoadTracker::new();

        loop {
            let op = tokio::select! {
                _ = shutdown.recv() => break,
                op = self.queue.next() => op,
            };
            let Some(mut op) = op else { break };

            let ch = match self.ensure_channel(&mut channel).await {
                Some(ch) => ch,
                None => {
                    op.header_mut().fail("unable to open channel");
                    self.finish(op);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            let started = Instant::now();
            let result = op.poll(ch.as_mut()).await;
            if let Some(ratio) = load.record(started.elapsed()) {
                if let Some(metrics) = &self.metrics {
                    metrics.set_link_load(&self.name, ratio);
                }
            }

            match result {
                Ok(OpStep::Continue) => {
                    // Requeue for the next phase; a rejected requeue (queue
                    // closed) still owes the operation its cleanup.
                    if let Err(mut op) = self.queue.add(op) {
                        op.header_mut().fail("poll queue drained");
                        self.finish(op);
                    }
                }
                Ok(OpStep::Done) => self.finish(op),
                Err(CommError::DownloadRequest) => {
                    info!(link = %self.name, controller = %op.controller().name(),
                        "download request; scheduling settings operations");
                    if let Some(handler) = &self.download {
                        for settings_op in handler(op.controller(), op.priority()) {
                            let _ = self.queue.add(settings_op);
                        }
                    }
                    // Retry the interrupted phase after the download runs.
                    if let Err(mut op) = self.queue.add(op) {
                        op.header_mut().fail("poll queue drained");
                        self.finish(op);
                    }
                }
                Err(err) => {
                    warn!(link = %self.name, controller = %op.controller().name(),
                        op = op.name(), error = %err, "operation failed");
                    if err.requires_drain() {
                        if let Err(drain_err) = ch.drain().await {
                            warn!(link = %self.name, error = %drain_err, "channel drain failed");
                            channel = None;
                        }
                    }
                    let reopen = err.requires_reopen();
                    op.header_mut().fail_on(&err);
                    self.finish(op);
                    if reopen {
                        channel = None;
                        if let Some(metrics) = &self.metrics {
                            metrics.record_reconnect(&self.name);
                        }
                    }
                }
            }
        }

        for mut op in self.queue.close() {
            op.header_mut().fail("poll queue drained");
            self.finish(op);
        }
        info!(link = %self.name, "link worker stopping");
    }

    async fn ensure_channel<'a>(
        &self,
        channel: &'a mut Option<Box<dyn Channel>>,
    ) -> Option<&'a mut Box<dyn Channel>> {
        if channel.is_none() {
            match self.factory.connect().await {
                Ok(ch) => {
                    debug!(link = %self.name, channel = ch.name(), "channel opened");
                    *channel = Some(ch);
                }
                Err(err) => {
                    warn!(link = %self.name, error = %err, "channel connect failed");
                    return None;
                }
            }
        }
        channel.as_mut()
    }

    fn finish(&self, mut op: Box<dyn Operation>) {
        let commit = self.registry.commit_handle();
        op.cleanup(&commit);
        if let Some(metrics) = &self.metrics {
            metrics.record_completion(&self.name, op.name(), op.success());
        }
        if op.success() {
            debug!(link = %self.name, op = op.name(),
                controller = %op.controller().name(), "operation complete");
        } else {
            info!(link = %self.name, op = op.name(),
                controller = %op.controller().name(),
                status = op.header().error_status().unwrap_or(""),
                "operation failed");
        }
    }
}
