//! Multi-process scan strategy
//!
//! The coordinator spawns `process_count` worker processes, each running a
//! [`Scheduler`](crate::scheduler::Scheduler) with
//! `max(1, task_count / process_count)` tasks.
//!
//! ```text
//!   parse-job stream ──producer──► ParseJobQueue ──feeders──► worker stdin
//!                                                                  │
//!   ResultSink ◄──collector◄── UpstreamEvent queue ◄──readers◄── worker stdout
//! ```
//!
//! The producer drains the caller's stream once; dropping its sender is
//! what eventually answers every `RequestJob` with `JobsExhausted`. The
//! collector owns the upstream queue until every worker completed, one
//! failed, or teardown injected the shutdown sentinel. Teardown itself is
//! the shared [`ShutdownSequence`].

pub mod process;
pub mod worker;

pub use process::{ProcessPool, WorkerCommand};
pub use worker::{run_worker, serve_worker, WorkerIo};

use crate::diagnostics::Diagnostics;
use crate::error::{IpcError, Result, ScanError, WorkerError};
use crate::ipc::{
    ActiveRunGuard, Downstream, IpcContext, ShutdownSequence, ShutdownTimeouts, Upstream,
    UpstreamEvent, WorkerBootstrap,
};
use crate::logging;
use crate::scheduler::{DEFAULT_IDLE_BACKOFF, DEFAULT_PREFETCH_MULTIPLE};
use crate::strategy::{ScanSummary, Strategy};
use crate::work::{sum_metrics, ParseJob, ScanFunctions, ScanMetrics, SinkHandle};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration of a multi-process run
#[derive(Debug, Clone)]
pub struct MultiProcessConfig {
    /// Worker processes to spawn
    pub process_count: usize,

    /// Scheduler tasks across all processes
    pub task_count: usize,

    pub prefetch_multiple: f64,

    pub idle_backoff: Duration,

    pub diagnostics: Diagnostics,

    /// How to start a worker process
    pub command: WorkerCommand,

    /// Opaque data handed to every worker inside its bootstrap
    pub payload: serde_json::Value,

    pub timeouts: ShutdownTimeouts,

    /// Treat Ctrl-C as a shutdown request
    pub handle_interrupts: bool,
}

impl MultiProcessConfig {
    pub fn new(process_count: usize, task_count: usize, command: WorkerCommand) -> Self {
        Self {
            process_count: process_count.max(1),
            task_count: task_count.max(1),
            prefetch_multiple: DEFAULT_PREFETCH_MULTIPLE,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            diagnostics: Diagnostics::disabled(),
            command,
            payload: serde_json::Value::Null,
            timeouts: ShutdownTimeouts::default(),
            handle_interrupts: true,
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

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ShutdownTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_interrupt_handling(mut self, enabled: bool) -> Self {
        self.handle_interrupts = enabled;
        self
    }

    /// Scheduler tasks inside each worker process
    pub fn tasks_per_process(&self) -> usize {
        (self.task_count / self.process_count.max(1)).max(1)
    }

    /// Capacity of the coordinator's parse-job queue
    pub fn queue_capacity(&self) -> usize {
        self.task_count.max(1) * 2
    }

    fn bootstraps(&self, started_at: chrono::DateTime<chrono::Utc>) -> Vec<WorkerBootstrap> {
        (0..self.process_count)
            .map(|worker_index| WorkerBootstrap {
                worker_index,
                process_count: self.process_count,
                task_count: self.tasks_per_process(),
                prefetch_multiple: self.prefetch_multiple,
                idle_backoff_ms: self.idle_backoff.as_millis() as u64,
                diagnostics: self.diagnostics.enabled(),
                started_at,
                payload: self.payload.clone(),
            })
            .collect()
    }
}

/// Replicates the scheduler across worker processes
pub struct MultiProcessStrategy {
    config: MultiProcessConfig,
    cancel: CancellationToken,
}

impl MultiProcessStrategy {
    pub fn new(config: MultiProcessConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `cancel` to interrupt the run
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &MultiProcessConfig {
        &self.config
    }
}

/// Why the collector stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectorExit {
    AllCompleted,
    ShutdownRequested,
    UpstreamClosed,
}

#[async_trait]
impl<F: ScanFunctions> Strategy<F> for MultiProcessStrategy {
    async fn run(
        &self,
        parse_jobs: BoxStream<'static, ParseJob<F::Transcript>>,
        _functions: Arc<F>,
        sink: SinkHandle<F>,
    ) -> Result<ScanSummary> {
        let _active = ActiveRunGuard::acquire()?;
        let start_time = Instant::now();
        let config = &self.config;

        info!(
            processes = config.process_count,
            tasks_per_process = config.tasks_per_process(),
            "Starting multi-process scan"
        );

        let (ctx, job_tx) = IpcContext::<F::Transcript, F::Report>::new(
            config.process_count,
            config.tasks_per_process(),
            config.queue_capacity(),
            config.diagnostics,
        );

        let pool = Arc::new(ProcessPool::spawn(
            &config.command,
            config.bootstraps(ctx.started_at),
            ctx.upstream_sender(),
            Arc::clone(&ctx.parse_jobs),
        )?);

        let shutdown = ShutdownSequence::new(Arc::clone(&ctx), pool.clone(), config.timeouts);

        let watcher = tokio::spawn(watch_interrupts(
            config.handle_interrupts,
            self.cancel.clone(),
            ctx.shutdown_token(),
            Arc::clone(&shutdown),
        ));

        let producer = tokio::spawn(produce(Arc::clone(&ctx), parse_jobs, job_tx));

        let outcome = collect::<F>(&ctx, &pool, &sink).await;

        ctx.begin_shutdown();
        let report = shutdown.run().await;
        debug!(?report, "Worker processes shut down");
        producer.abort();
        watcher.abort();

        let (exit, metrics) = outcome?;
        let completed = exit == CollectorExit::AllCompleted && !self.cancel.is_cancelled();
        sink.update_metrics(&metrics);

        info!(
            completed,
            scans = metrics.completed_scans,
            elapsed_secs = start_time.elapsed().as_secs_f64(),
            "Multi-process scan finished"
        );

        Ok(ScanSummary {
            completed,
            metrics,
            duration: start_time.elapsed(),
        })
    }
}

async fn watch_interrupts<T, R>(
    handle_interrupts: bool,
    cancel: CancellationToken,
    torn_down: CancellationToken,
    shutdown: Arc<ShutdownSequence<T, R>>,
) where
    T: Send + 'static,
    R: Send + 'static,
{
    let interrupted = async {
        if handle_interrupts && tokio::signal::ctrl_c().await.is_ok() {
            return;
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        _ = interrupted => info!("Interrupted, shutting down workers"),
        _ = cancel.cancelled() => info!("Scan cancelled, shutting down workers"),
        _ = torn_down.cancelled() => return,
    }
    shutdown.run().await;
}

async fn produce<T, R>(
    ctx: Arc<IpcContext<T, R>>,
    mut parse_jobs: BoxStream<'static, ParseJob<T>>,
    job_tx: mpsc::Sender<ParseJob<T>>,
) {
    let torn_down = ctx.shutdown_token();

    tokio::select! {
        _ = ctx.wait_ready() => {}
        _ = torn_down.cancelled() => return,
    }
    ctx.diagnostics.print("producer", || "all workers ready".to_string());

    let mut produced = 0u64;
    loop {
        let job = tokio::select! {
            biased;
            _ = torn_down.cancelled() => break,
            job = parse_jobs.next() => match job {
                Some(job) => job,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = torn_down.cancelled() => break,
            sent = job_tx.send(job) => {
                if sent.is_err() {
                    break;
                }
                produced += 1;
            }
        }
    }

    // Dropping the sender ends the queue for every feeder
    drop(job_tx);
    debug!(produced, "Producer finished");
}

async fn collect<F: ScanFunctions>(
    ctx: &Arc<IpcContext<F::Transcript, F::Report>>,
    pool: &Arc<ProcessPool<F::Transcript>>,
    sink: &SinkHandle<F>,
) -> Result<(CollectorExit, ScanMetrics)> {
    let mut upstream = ctx.upstream_receiver().lock().await;
    let mut grants = JoinSet::new();
    let mut per_process: HashMap<usize, ScanMetrics> = HashMap::new();
    let mut completed: HashSet<usize> = HashSet::new();

    let exit = loop {
        let event = tokio::select! {
            event = upstream.recv() => match event {
                Some(event) => event,
                None => break CollectorExit::UpstreamClosed,
            },
            Some(_) = grants.join_next(), if !grants.is_empty() => continue,
        };

        let (worker, message) = match event {
            UpstreamEvent::Message { worker, message } => (worker, message),
            UpstreamEvent::Disconnected { worker } => {
                let released = ctx.ledger.clear_worker(worker);
                if released > 0 {
                    debug!(worker, released, "Released permits of disconnected worker");
                }
                if completed.contains(&worker) {
                    continue;
                }
                if ctx.is_shutting_down() {
                    break CollectorExit::ShutdownRequested;
                }
                warn!(worker, "Worker process exited without completing");
                return Err(WorkerError::ExitedEarly { index: worker }.into());
            }
            UpstreamEvent::Shutdown => break CollectorExit::ShutdownRequested,
        };

        match message {
            Upstream::Results {
                transcript,
                scanner_name,
                results,
            } => {
                sink.record_results(&transcript, &scanner_name, results)
                    .await
                    .map_err(ScanError::Record)?;
            }
            Upstream::Metrics(metrics) => {
                per_process.insert(worker, metrics);
                sink.update_metrics(&sum_metrics(per_process.values()));
            }
            Upstream::CreateSemaphore {
                name,
                concurrency,
                visible,
            } => {
                let (semaphore, created) = ctx.registry.get_or_create(&name, concurrency, visible);
                let announcement = Downstream::SemaphoreCreated {
                    name,
                    concurrency: semaphore.concurrency(),
                    visible: semaphore.visible(),
                };
                if created {
                    pool.broadcast(announcement);
                } else {
                    pool.send(worker, announcement);
                }
            }
            Upstream::AcquireSemaphore { name, ticket } => {
                let semaphore = ctx.registry.get(&name).ok_or_else(|| IpcError::Semaphore {
                    name: name.clone(),
                    reason: "acquired before creation".to_string(),
                })?;
                let key = (worker, ticket);
                ctx.ledger.request(key);

                let ctx = Arc::clone(ctx);
                let pool = Arc::clone(pool);
                grants.spawn(async move {
                    let Ok(permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    if ctx.ledger.grant(key, permit) {
                        pool.send(worker, Downstream::SemaphoreGranted { ticket });
                    }
                });
            }
            Upstream::ReleaseSemaphore { ticket, .. } => ctx.ledger.release((worker, ticket)),
            Upstream::Log { line } => logging::emit_worker_line(worker, &line),
            Upstream::Ready { pid } => {
                let ready = ctx.mark_ready();
                debug!(worker, pid, ready, "Worker process ready");
            }
            Upstream::Completed => {
                completed.insert(worker);
                debug!(worker, done = completed.len(), "Worker process completed");
                if completed.len() >= ctx.process_count {
                    break CollectorExit::AllCompleted;
                }
            }
            Upstream::Failed(failure) => {
                warn!(worker, kind = ?failure.kind, "Worker process failed");
                return Err(failure.into_error());
            }
            Upstream::RequestJob => {
                // Readers route job requests to the feeders
                debug!(worker, "Job request reached the collector");
            }
        }
    };

    // Pending acquires die with the run
    grants.shutdown().await;
    Ok((exit, sum_metrics(per_process.values())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_split_across_processes() {
        let config = MultiProcessConfig::new(3, 8, WorkerCommand::new("/bin/true"));
        assert_eq!(config.tasks_per_process(), 2);
        assert_eq!(config.queue_capacity(), 16);

        let config = MultiProcessConfig::new(4, 2, WorkerCommand::new("/bin/true"));
        assert_eq!(config.tasks_per_process(), 1);
    }

    #[test]
    fn test_bootstraps_carry_run_settings() {
        let config = MultiProcessConfig::new(2, 4, WorkerCommand::new("/bin/true"))
            .with_idle_backoff(Duration::from_millis(25))
            .with_prefetch_multiple(2.0)
            .with_payload(serde_json::json!({"scanners": 3}));
        let started_at = chrono::Utc::now();
        let bootstraps = config.bootstraps(started_at);

        assert_eq!(bootstraps.len(), 2);
        assert_eq!(bootstraps[1].worker_index, 1);
        assert_eq!(bootstraps[1].task_count, 2);
        assert_eq!(bootstraps[0].idle_backoff(), Duration::from_millis(25));
        assert_eq!(bootstraps[0].prefetch_multiple, 2.0);
        assert_eq!(bootstraps[0].payload["scanners"], 3);
        assert_eq!(bootstraps[0].started_at, started_at);
    }
}
