//! Adaptive single-process scheduler
//!
//! `task_count` symmetric workers share one scanner-job buffer and one
//! serialized cursor over the parse-job source. Each iteration a worker
//! picks an action with [`choose_action`], performs it, publishes metrics
//! and checks whether the run is over:
//!
//! ```text
//!   parse jobs ──► JobCursor ──parse──► ScannerJobQueue ──scan──► ResultSink
//!                 (async mutex)          (head pop, tail push)
//! ```
//!
//! A worker leaves once input is exhausted, the buffer is empty and every
//! other live worker is waiting. The live count shrinks as workers leave, so
//! the rest converge without a coordinator.

pub mod action;
pub mod buffer;
pub mod cursor;

pub use action::{choose_action, Action, SchedulerSnapshot};
pub use buffer::ScannerJobQueue;
pub use cursor::JobCursor;

use crate::diagnostics::Diagnostics;
use crate::error::{Result, ScanError, WorkerError};
use crate::strategy::ScanSummary;
use crate::work::{
    MetricsTracker, ParseJob, ParseOutcome, ScanFunctions, ScanMetrics, ScannerJob, SinkHandle,
};
use futures::stream::BoxStream;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default suspension between two consecutive waits
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// Default scanner-job buffer size per worker
pub const DEFAULT_PREFETCH_MULTIPLE: f64 = 1.0;

/// Configuration for one scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker tasks
    pub task_count: usize,

    /// Scanner-job buffer size per worker
    pub prefetch_multiple: f64,

    /// Suspension used by the wait action after a worker's first wait
    pub idle_backoff: Duration,

    /// Diagnostics gate
    pub diagnostics: Diagnostics,
}

impl SchedulerConfig {
    pub fn new(task_count: usize) -> Self {
        Self {
            task_count,
            prefetch_multiple: DEFAULT_PREFETCH_MULTIPLE,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            diagnostics: Diagnostics::disabled(),
        }
    }

    pub fn with_prefetch_multiple(mut self, prefetch_multiple: f64) -> Self {
        self.prefetch_multiple = prefetch_multiple;
        self
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Buffer capacity: `max(1, ceil(task_count * prefetch_multiple))`
    pub fn max_queue(&self) -> usize {
        let target = (self.task_count as f64 * self.prefetch_multiple).ceil();
        (target as usize).max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(num_cpus::get() * 4)
    }
}

/// Adaptive worker pool for one process
pub struct Scheduler<F: ScanFunctions> {
    config: SchedulerConfig,
    functions: Arc<F>,
    sink: SinkHandle<F>,
    cursor: JobCursor<ParseJob<F::Transcript>>,
    buffer: ScannerJobQueue<ScannerJob<F>>,
    metrics: MetricsTracker,
    next_worker_id: AtomicUsize,
}

impl<F: ScanFunctions> Scheduler<F> {
    pub fn new(
        config: SchedulerConfig,
        parse_jobs: BoxStream<'static, ParseJob<F::Transcript>>,
        functions: Arc<F>,
        sink: SinkHandle<F>,
    ) -> Self {
        let task_count = config.task_count.max(1);
        let max_queue = config.max_queue();
        Self {
            config: SchedulerConfig {
                task_count,
                ..config
            },
            functions,
            sink,
            cursor: JobCursor::new(parse_jobs),
            buffer: ScannerJobQueue::new(max_queue),
            metrics: MetricsTracker::new(task_count),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current metrics for this process
    pub fn metrics(&self) -> ScanMetrics {
        self.metrics.snapshot(self.buffer.len())
    }

    /// Run every worker to completion
    ///
    /// The first worker error aborts the remaining workers and is returned.
    /// Cancelling `cancel` aborts all workers and yields a summary with
    /// `completed == false`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<ScanSummary> {
        let start_time = Instant::now();

        info!(
            tasks = self.config.task_count,
            max_queue = self.buffer.capacity(),
            "Starting scheduler"
        );

        let mut workers = JoinSet::new();
        let mut worker_ids = HashMap::new();
        for _ in 0..self.config.task_count {
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let scheduler = Arc::clone(&self);
            let handle = workers.spawn(async move { scheduler.worker_loop(id).await });
            worker_ids.insert(handle.id(), id);
        }

        let outcome: Result<bool> = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Scheduler cancelled, aborting workers");
                    break Ok(false);
                }

                joined = workers.join_next_with_id() => match joined {
                    None => break Ok(true),
                    Some(Ok((_, Ok(())))) => {}
                    Some(Ok((_, Err(e)))) => {
                        warn!(error = %e, "Worker failed, aborting remaining workers");
                        break Err(e);
                    }
                    Some(Err(join_err)) => {
                        let id = worker_ids.get(&join_err.id()).copied().unwrap_or_default();
                        if join_err.is_panic() {
                            break Err(WorkerError::Panicked {
                                id,
                                message: panic_message(join_err.into_panic()),
                            }
                            .into());
                        }
                    }
                }
            }
        };

        workers.shutdown().await;

        let completed = outcome?;
        let metrics = self.metrics();
        self.sink.update_metrics(&metrics);

        debug!(
            enqueued = self.buffer.stats().enqueued.load(Ordering::Relaxed),
            high_water = self.buffer.stats().high_water.load(Ordering::Relaxed),
            parse_jobs = self.cursor.taken(),
            "Scheduler buffer statistics"
        );

        Ok(ScanSummary {
            completed,
            metrics,
            duration: start_time.elapsed(),
        })
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            queue_len: self.buffer.len(),
            max_queue: self.buffer.capacity(),
            tasks_parsing: self.metrics.tasks_parsing(),
            input_exhausted: self.cursor.is_exhausted(),
        }
    }

    async fn worker_loop(&self, id: usize) -> Result<()> {
        debug!(worker = id, "Worker started");
        let mut pacing = IdlePacing::new(self.config.idle_backoff);

        loop {
            let action = choose_action(&self.snapshot());
            self.config
                .diagnostics
                .print("scheduler", || format!("worker {id}: {action:?}"));

            match action {
                Action::Parse => self.parse_next().await?,
                Action::Scan => self.scan_next().await?,
                Action::Wait => self.wait(pacing.next_pause()).await,
            }

            self.publish_metrics();

            if self.should_exit() {
                break;
            }
        }

        let remaining = self.metrics.worker_exited();
        self.publish_metrics();
        debug!(worker = id, remaining, "Worker finished");
        Ok(())
    }

    fn should_exit(&self) -> bool {
        self.cursor.is_exhausted()
            && self.buffer.is_empty()
            && self.metrics.tasks_idle() + 1 == self.metrics.live_tasks()
    }

    async fn parse_next(&self) -> Result<()> {
        let _parsing = self.metrics.parsing();

        let Some(job) = self.cursor.next().await else {
            return Ok(());
        };

        match self.functions.parse(job).await.map_err(ScanError::Parse)? {
            ParseOutcome::Jobs(jobs) => self.buffer.extend(jobs),
            ParseOutcome::Finished(reports) => {
                for report in reports {
                    self.sink
                        .record_results(&report.transcript, &report.scanner_name, report.results)
                        .await
                        .map_err(ScanError::Record)?;
                    self.metrics.record_completed(1);
                }
            }
        }
        Ok(())
    }

    async fn scan_next(&self) -> Result<()> {
        let _scanning = self.metrics.scanning();

        let Some(job) = self.buffer.pop() else {
            tokio::task::yield_now().await;
            return Ok(());
        };

        let transcript = job.transcript.clone();
        let scanner_name = job.scanner_name.clone();
        let results = self.functions.scan(job).await.map_err(ScanError::Scan)?;

        self.sink
            .record_results(&transcript, &scanner_name, results)
            .await
            .map_err(ScanError::Record)?;
        self.metrics.record_completed(1);
        Ok(())
    }

    async fn wait(&self, pause: Duration) {
        let _idle = self.metrics.idling();
        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(pause).await;
        }
    }

    fn publish_metrics(&self) {
        self.sink.update_metrics(&self.metrics());
    }
}

/// Per-worker wait length: a bare yield on the first wait of the worker's
/// life, one full backoff on every wait after that
struct IdlePacing {
    backoff: Duration,
    waited: bool,
}

impl IdlePacing {
    fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            waited: false,
        }
    }

    fn next_pause(&mut self) -> Duration {
        if std::mem::replace(&mut self.waited, true) {
            self.backoff
        } else {
            Duration::ZERO
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_queue() {
        assert_eq!(SchedulerConfig::new(4).max_queue(), 4);
        assert_eq!(SchedulerConfig::new(4).with_prefetch_multiple(1.5).max_queue(), 6);
        assert_eq!(SchedulerConfig::new(3).with_prefetch_multiple(0.5).max_queue(), 2);
        assert_eq!(SchedulerConfig::new(1).with_prefetch_multiple(0.1).max_queue(), 1);
    }

    #[test]
    fn test_only_first_wait_is_a_yield() {
        let backoff = Duration::from_millis(250);
        let mut pacing = IdlePacing::new(backoff);

        assert_eq!(pacing.next_pause(), Duration::ZERO);
        assert_eq!(pacing.next_pause(), backoff);
        // Work in between does not reset the worker's pacing
        assert_eq!(pacing.next_pause(), backoff);
        assert_eq!(pacing.next_pause(), backoff);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }
}
