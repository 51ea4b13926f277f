//! Worker process entry point
//!
//! A worker process reads its [`WorkerBootstrap`], announces itself, then
//! runs one [`Scheduler`] whose parse jobs are pulled from the coordinator
//! on demand and whose results, metrics and log lines are pushed back over
//! stdout. A `Shutdown` message or a closed stdin cancels the scheduler.

use crate::concurrency::{self, ConcurrencySemaphore, SemaphoreFactory, SemaphoreGuard};
use crate::diagnostics::Diagnostics;
use crate::error::{IpcError, RemoteFailure, Result};
use crate::ipc::{Downstream, FrameReader, FrameWriter, Upstream, WorkerBootstrap};
use crate::logging;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::work::{ParseJob, ResultSink, ScanFunctions, ScanMetrics};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Minimum interval between two forwarded metrics snapshots
pub const METRICS_FORWARD_INTERVAL: Duration = Duration::from_millis(100);

/// Streams and process-wide hooks a worker serves over
pub struct WorkerIo<I, O> {
    /// Downstream frames from the coordinator
    pub input: I,

    /// Upstream frames to the coordinator
    pub output: O,

    /// Formatted log lines to forward upstream
    pub log_lines: Option<mpsc::UnboundedReceiver<String>>,

    /// Route [`concurrency::concurrency`] through the coordinator
    pub install_semaphore_factory: bool,
}

/// Serve as a worker process over stdin/stdout
///
/// Installs log forwarding and the coordinator-backed semaphore factory
/// for the whole process.
pub async fn run_worker<F: ScanFunctions>(bootstrap: WorkerBootstrap, functions: Arc<F>) -> Result<()> {
    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let log_lines = match logging::init_worker_logging(log_tx, bootstrap.diagnostics) {
        Ok(()) => Some(log_rx),
        Err(_) => None,
    };

    let io = WorkerIo {
        input: tokio::io::stdin(),
        output: tokio::io::stdout(),
        log_lines,
        install_semaphore_factory: true,
    };
    serve_worker(bootstrap, functions, io).await
}

/// Serve one worker over the given streams
pub async fn serve_worker<F, I, O>(
    bootstrap: WorkerBootstrap,
    functions: Arc<F>,
    io: WorkerIo<I, O>,
) -> Result<()>
where
    F: ScanFunctions,
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let index = bootstrap.worker_index;
    let (upstream, upstream_rx) = mpsc::unbounded_channel::<Upstream<F::Transcript, F::Report>>();
    let mut writer = tokio::spawn(write_upstream(io.output, upstream_rx, io.log_lines));

    let semaphores = Arc::new(SemaphoreClient::new(upstream.clone()));
    let previous_factory = io.install_semaphore_factory.then(|| {
        concurrency::install_factory(Arc::new(IpcSemaphoreFactory {
            client: Arc::clone(&semaphores),
        }))
    });

    let cancel = CancellationToken::new();
    let (job_tx, job_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_downstream(
        index,
        io.input,
        job_tx,
        Arc::clone(&semaphores),
        cancel.clone(),
    ));

    upstream
        .send(Upstream::Ready {
            pid: std::process::id(),
        })
        .map_err(|_| IpcError::ChannelClosed("upstream"))?;
    info!(worker = index, tasks = bootstrap.task_count, "Worker ready");

    let config = SchedulerConfig::new(bootstrap.task_count)
        .with_prefetch_multiple(bootstrap.prefetch_multiple)
        .with_idle_backoff(bootstrap.idle_backoff())
        .with_diagnostics(Diagnostics::since(bootstrap.diagnostics, bootstrap.started_at));

    let scheduler = Arc::new(Scheduler::new(
        config,
        job_stream(upstream.clone(), job_rx),
        functions,
        Arc::new(ForwardingSink::new(upstream.clone())),
    ));

    let outcome = scheduler.run(cancel.clone()).await;

    let (result, terminal) = match outcome {
        Ok(summary) if summary.completed => {
            info!(
                worker = index,
                scans = summary.metrics.completed_scans,
                "Worker completed"
            );
            let _ = upstream.send(Upstream::Metrics(summary.metrics));
            let _ = upstream.send(Upstream::Completed);
            (Ok(()), true)
        }
        Ok(_) => {
            info!(worker = index, "Worker cancelled");
            (Ok(()), false)
        }
        Err(e) => {
            error!(worker = index, error = %e, "Worker failed");
            let _ = upstream.send(Upstream::Failed(RemoteFailure::from_error(&e)));
            (Err(e), true)
        }
    };

    if terminal {
        // The writer stops after the terminal frame
        if tokio::time::timeout(Duration::from_secs(5), &mut writer).await.is_err() {
            warn!(worker = index, "Upstream writer did not finish");
            writer.abort();
        }
    } else {
        writer.abort();
    }
    reader.abort();

    if let Some(previous) = previous_factory {
        concurrency::install_factory(previous);
    }
    result
}

fn job_stream<T, R>(
    upstream: mpsc::UnboundedSender<Upstream<T, R>>,
    jobs: mpsc::UnboundedReceiver<Option<ParseJob<T>>>,
) -> BoxStream<'static, ParseJob<T>>
where
    T: Send + 'static,
    R: Send + 'static,
{
    stream::unfold((upstream, jobs), |(upstream, mut jobs)| async move {
        upstream.send(Upstream::RequestJob).ok()?;
        // Outer None: pipe closed; inner None: JobsExhausted
        let job = jobs.recv().await??;
        Some((job, (upstream, jobs)))
    })
    .boxed()
}

async fn write_upstream<O, T, R>(
    output: O,
    mut messages: mpsc::UnboundedReceiver<Upstream<T, R>>,
    mut log_lines: Option<mpsc::UnboundedReceiver<String>>,
) where
    O: AsyncWrite + Unpin,
    T: Serialize,
    R: Serialize,
{
    let mut writer = FrameWriter::<_, Upstream<T, R>>::new(output);

    loop {
        let message = tokio::select! {
            biased;

            Some(line) = next_line(&mut log_lines) => Upstream::Log { line },

            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let terminal = message.is_terminal();
        if writer.send(&message).await.is_err() {
            return;
        }
        if terminal {
            break;
        }
    }
    let _ = writer.close().await;
}

async fn next_line(lines: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match lines {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn read_downstream<I, T, R>(
    index: usize,
    input: I,
    jobs: mpsc::UnboundedSender<Option<ParseJob<T>>>,
    semaphores: Arc<SemaphoreClient<T, R>>,
    cancel: CancellationToken,
) where
    I: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut reader = FrameReader::<_, Downstream<T>>::new(input);

    loop {
        match reader.recv().await {
            Ok(Some(Downstream::Job(job))) => {
                let _ = jobs.send(Some(job));
            }
            Ok(Some(Downstream::JobsExhausted)) => {
                let _ = jobs.send(None);
            }
            Ok(Some(Downstream::SemaphoreCreated {
                name,
                concurrency,
                visible,
            })) => semaphores.on_created(name, concurrency, visible),
            Ok(Some(Downstream::SemaphoreGranted { ticket })) => semaphores.on_granted(ticket),
            Ok(Some(Downstream::Shutdown)) => {
                info!(worker = index, "Shutdown requested by coordinator");
                break;
            }
            Ok(None) => {
                debug!(worker = index, "Coordinator closed the downstream pipe");
                break;
            }
            Err(e) => {
                warn!(worker = index, error = %e, "Failed to read from coordinator");
                break;
            }
        }
    }
    cancel.cancel();
}

/// Sink wrapping results and throttled metrics into upstream messages
pub struct ForwardingSink<T, R> {
    upstream: mpsc::UnboundedSender<Upstream<T, R>>,
    last_metrics: Mutex<Option<Instant>>,
    interval: Duration,
}

impl<T, R> ForwardingSink<T, R> {
    pub fn new(upstream: mpsc::UnboundedSender<Upstream<T, R>>) -> Self {
        Self {
            upstream,
            last_metrics: Mutex::new(None),
            interval: METRICS_FORWARD_INTERVAL,
        }
    }

    fn metrics_due(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_metrics.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[async_trait]
impl<T, R> ResultSink<T, R> for ForwardingSink<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    async fn record_results(
        &self,
        transcript: &T,
        scanner_name: &str,
        results: Vec<R>,
    ) -> anyhow::Result<()> {
        self.upstream
            .send(Upstream::Results {
                transcript: transcript.clone(),
                scanner_name: scanner_name.to_string(),
                results,
            })
            .map_err(|_| anyhow::anyhow!("upstream pipe closed"))
    }

    fn update_metrics(&self, metrics: &ScanMetrics) {
        if self.metrics_due() {
            let _ = self.upstream.send(Upstream::Metrics(*metrics));
        }
    }
}

#[derive(Default)]
struct ClientState {
    /// Semaphores the coordinator announced: name -> (concurrency, visible)
    known: HashMap<String, (usize, bool)>,
    /// Names this worker already asked the coordinator to create
    requested: HashSet<String>,
}

/// Worker-side view of the coordinator's semaphore registry
pub struct SemaphoreClient<T, R> {
    upstream: mpsc::UnboundedSender<Upstream<T, R>>,
    state: Mutex<ClientState>,
    created: Notify,
    next_ticket: AtomicU64,
    grants: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl<T, R> SemaphoreClient<T, R> {
    pub fn new(upstream: mpsc::UnboundedSender<Upstream<T, R>>) -> Self {
        Self {
            upstream,
            state: Mutex::new(ClientState::default()),
            created: Notify::new(),
            next_ticket: AtomicU64::new(0),
            grants: Mutex::new(HashMap::new()),
        }
    }

    /// The coordinator created (or already had) a semaphore
    pub fn on_created(&self, name: String, concurrency: usize, visible: bool) {
        self.state.lock().known.insert(name, (concurrency, visible));
        self.created.notify_waiters();
    }

    /// The coordinator granted a permit
    pub fn on_granted(&self, ticket: u64) {
        if let Some(grant) = self.grants.lock().remove(&ticket) {
            let _ = grant.send(());
        }
    }

    /// Wait until the coordinator knows `name`, asking it to create it once
    async fn resolve(&self, name: &str, concurrency: usize, visible: bool) -> Result<(usize, bool)> {
        loop {
            let notified = self.created.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(&known) = state.known.get(name) {
                    return Ok(known);
                }
                if state.requested.insert(name.to_string()) {
                    self.upstream
                        .send(Upstream::CreateSemaphore {
                            name: name.to_string(),
                            concurrency,
                            visible,
                        })
                        .map_err(|_| IpcError::ChannelClosed("upstream"))?;
                }
            }

            notified.await;
        }
    }

    fn release(&self, name: &str, ticket: u64) {
        self.grants.lock().remove(&ticket);
        let _ = self.upstream.send(Upstream::ReleaseSemaphore {
            name: name.to_string(),
            ticket,
        });
    }
}

/// Factory routing semaphore requests to the coordinator
pub struct IpcSemaphoreFactory<T, R> {
    client: Arc<SemaphoreClient<T, R>>,
}

#[async_trait]
impl<T, R> SemaphoreFactory for IpcSemaphoreFactory<T, R>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    async fn get_or_create(
        &self,
        name: &str,
        concurrency: usize,
        visible: bool,
    ) -> Result<Arc<dyn ConcurrencySemaphore>> {
        let (concurrency, visible) = self.client.resolve(name, concurrency, visible).await?;
        Ok(Arc::new(RemoteSemaphore {
            name: name.to_string(),
            concurrency,
            visible,
            client: Arc::clone(&self.client),
        }) as Arc<dyn ConcurrencySemaphore>)
    }
}

struct RemoteSemaphore<T, R> {
    name: String,
    concurrency: usize,
    visible: bool,
    client: Arc<SemaphoreClient<T, R>>,
}

#[async_trait]
impl<T, R> ConcurrencySemaphore for RemoteSemaphore<T, R>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn visible(&self) -> bool {
        self.visible
    }

    async fn acquire(&self) -> Result<SemaphoreGuard> {
        let ticket = self.client.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (grant_tx, grant_rx) = oneshot::channel();
        self.client.grants.lock().insert(ticket, grant_tx);

        // Dropping this before the grant cancels the request upstream
        let permit = RemotePermit {
            name: self.name.clone(),
            ticket,
            client: Arc::clone(&self.client),
        };

        self.client
            .upstream
            .send(Upstream::AcquireSemaphore {
                name: self.name.clone(),
                ticket,
            })
            .map_err(|_| IpcError::ChannelClosed("upstream"))?;

        grant_rx
            .await
            .map_err(|_| IpcError::ChannelClosed("semaphore grant"))?;
        Ok(SemaphoreGuard::new(permit))
    }
}

struct RemotePermit<T, R> {
    name: String,
    ticket: u64,
    client: Arc<SemaphoreClient<T, R>>,
}

impl<T, R> Drop for RemotePermit<T, R> {
    fn drop(&mut self) {
        self.client.release(&self.name, self.ticket);
    }
}
