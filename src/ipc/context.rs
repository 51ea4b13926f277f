//! Coordinator state shared by the tasks of one multi-process run

use super::Upstream;
use crate::concurrency::{PermitLedger, SemaphoreRegistry};
use crate::diagnostics::Diagnostics;
use crate::error::{Result, ScanError};
use crate::work::ParseJob;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

static RUN_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Presence guard allowing one multi-process run per process
///
/// Armed by [`ActiveRunGuard::acquire`], disarmed on drop.
#[derive(Debug)]
pub struct ActiveRunGuard {
    _private: (),
}

impl ActiveRunGuard {
    pub fn acquire() -> Result<Self> {
        RUN_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ScanError::RunAlreadyActive)?;
        Ok(Self { _private: () })
    }

    pub fn is_armed() -> bool {
        RUN_ACTIVE.load(Ordering::SeqCst)
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        RUN_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Item on the multiplexed upstream queue
#[derive(Debug)]
pub enum UpstreamEvent<T, R> {
    /// A frame read from worker `worker`
    Message {
        worker: usize,
        message: Upstream<T, R>,
    },

    /// Worker `worker` closed its stdout
    Disconnected { worker: usize },

    /// Injected by the shutdown sequence to unblock the collector
    Shutdown,
}

/// Bounded parse-job queue shared by every feeder
///
/// Dropping the producer's sender is the end-of-input signal: once the
/// queue is drained every `next` returns `None`.
pub struct ParseJobQueue<T> {
    receiver: Mutex<mpsc::Receiver<ParseJob<T>>>,
}

impl<T> ParseJobQueue<T> {
    pub fn bounded(capacity: usize) -> (mpsc::Sender<ParseJob<T>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                receiver: Mutex::new(rx),
            },
        )
    }

    pub async fn next(&self) -> Option<ParseJob<T>> {
        self.receiver.lock().await.recv().await
    }
}

/// Shared configuration and synchronization state of a multi-process run
pub struct IpcContext<T, R> {
    /// Worker processes
    pub process_count: usize,

    /// Scheduler tasks per worker process
    pub tasks_per_process: usize,

    pub diagnostics: Diagnostics,

    pub started_at: DateTime<Utc>,

    pub parse_jobs: Arc<ParseJobQueue<T>>,

    pub registry: SemaphoreRegistry,

    pub ledger: PermitLedger,

    upstream_tx: mpsc::UnboundedSender<UpstreamEvent<T, R>>,
    upstream_rx: Mutex<mpsc::UnboundedReceiver<UpstreamEvent<T, R>>>,
    ready: watch::Sender<usize>,
    shutdown: CancellationToken,
}

impl<T, R> IpcContext<T, R> {
    /// Build the context and the producer's end of the parse-job queue
    pub fn new(
        process_count: usize,
        tasks_per_process: usize,
        queue_capacity: usize,
        diagnostics: Diagnostics,
    ) -> (Arc<Self>, mpsc::Sender<ParseJob<T>>) {
        let (job_tx, parse_jobs) = ParseJobQueue::bounded(queue_capacity);
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(0);

        let context = Self {
            process_count,
            tasks_per_process,
            diagnostics,
            started_at: diagnostics.started_at(),
            parse_jobs: Arc::new(parse_jobs),
            registry: SemaphoreRegistry::new(),
            ledger: PermitLedger::new(),
            upstream_tx,
            upstream_rx: Mutex::new(upstream_rx),
            ready,
            shutdown: CancellationToken::new(),
        };
        (Arc::new(context), job_tx)
    }

    /// Sender for pipe readers and the shutdown sentinel
    pub fn upstream_sender(&self) -> mpsc::UnboundedSender<UpstreamEvent<T, R>> {
        self.upstream_tx.clone()
    }

    /// The upstream receiver; the collector holds this lock while it runs
    pub fn upstream_receiver(&self) -> &Mutex<mpsc::UnboundedReceiver<UpstreamEvent<T, R>>> {
        &self.upstream_rx
    }

    /// Record one more ready worker; returns the ready count
    pub fn mark_ready(&self) -> usize {
        self.ready.send_modify(|n| *n += 1);
        *self.ready.borrow()
    }

    /// Wait until every worker process reported ready
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        let target = self.process_count;
        let _ = rx.wait_for(|n| *n >= target).await;
    }

    /// Token cancelled when teardown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
