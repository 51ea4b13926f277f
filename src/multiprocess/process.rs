//! Worker process lifecycle and pipe plumbing
//!
//! For every worker process the pool runs three tasks:
//! - a reader turning stdout frames into [`UpstreamEvent`]s, routing
//!   `RequestJob` straight to the feeder
//! - a writer draining the worker's downstream link into stdin
//! - a feeder answering each job request from the shared parse-job queue

use crate::error::{Result, WorkerError};
use crate::ipc::shutdown::WorkerFleet;
use crate::ipc::{
    Downstream, FrameReader, FrameWriter, ParseJobQueue, Upstream, UpstreamEvent, WorkerBootstrap,
    BOOTSTRAP_ENV,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Program and arguments used to start a worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// The running executable with a `worker` argument
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn build(&self, bootstrap: &WorkerBootstrap) -> Result<Command> {
        let mut command = std::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(BOOTSTRAP_ENV, bootstrap.to_env_value()?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            // Own process group: terminal interrupts reach only the coordinator
            .process_group(0);

        let mut command = Command::from(command);
        command.kill_on_drop(true);
        Ok(command)
    }
}

struct WorkerProcess {
    index: usize,
    child: Child,
}

impl WorkerProcess {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// The coordinator's worker processes and their pipe tasks
pub struct ProcessPool<T> {
    processes: tokio::sync::Mutex<Vec<WorkerProcess>>,
    links: Mutex<Vec<Option<mpsc::UnboundedSender<Downstream<T>>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> ProcessPool<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start one worker process per bootstrap
    pub fn spawn<R>(
        command: &WorkerCommand,
        bootstraps: Vec<WorkerBootstrap>,
        upstream: mpsc::UnboundedSender<UpstreamEvent<T, R>>,
        jobs: Arc<ParseJobQueue<T>>,
    ) -> Result<Self>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let mut pool = Self::empty();
        let mut processes = Vec::with_capacity(bootstraps.len());

        for bootstrap in bootstraps {
            let index = bootstrap.worker_index;
            let mut child = command
                .build(&bootstrap)?
                .spawn()
                .map_err(|e| WorkerError::SpawnFailed {
                    index,
                    reason: format!("{}: {}", command.program.display(), e),
                })?;

            let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
                (Some(stdin), Some(stdout)) => (stdin, stdout),
                _ => {
                    return Err(WorkerError::SpawnFailed {
                        index,
                        reason: "worker pipes unavailable".to_string(),
                    }
                    .into())
                }
            };

            debug!(worker = index, pid = ?child.id(), "Spawned worker process");

            let (downstream_tx, downstream_rx) = mpsc::unbounded_channel();
            let (request_tx, request_rx) = mpsc::unbounded_channel();

            let mut tasks = pool.tasks.lock();
            tasks.push(tokio::spawn(read_upstream(
                index,
                stdout,
                upstream.clone(),
                request_tx,
            )));
            tasks.push(tokio::spawn(write_downstream(index, stdin, downstream_rx)));
            tasks.push(tokio::spawn(feed_jobs(
                index,
                request_rx,
                Arc::clone(&jobs),
                downstream_tx.clone(),
            )));
            drop(tasks);

            pool.set_link(index, downstream_tx);
            processes.push(WorkerProcess { index, child });
        }

        *pool.processes.get_mut() = processes;
        Ok(pool)
    }
}

impl<T> ProcessPool<T> {
    fn empty() -> Self {
        Self {
            processes: tokio::sync::Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Manage already running children that have no pipes attached
    pub fn adopt(children: Vec<Child>) -> Self {
        let processes = children
            .into_iter()
            .enumerate()
            .map(|(index, child)| WorkerProcess { index, child })
            .collect();
        let mut pool = Self::empty();
        *pool.processes.get_mut() = processes;
        pool
    }

    fn set_link(&self, index: usize, link: mpsc::UnboundedSender<Downstream<T>>) {
        let mut links = self.links.lock();
        if links.len() <= index {
            links.resize_with(index + 1, || None);
        }
        links[index] = Some(link);
    }

    /// Send a message to one worker; false if its link is gone
    pub fn send(&self, worker: usize, message: Downstream<T>) -> bool {
        match self.links.lock().get(worker) {
            Some(Some(link)) => link.send(message).is_ok(),
            _ => false,
        }
    }

    /// Send a message to every worker; returns how many accepted it
    pub fn broadcast(&self, message: Downstream<T>) -> usize
    where
        T: Clone,
    {
        self.links
            .lock()
            .iter()
            .flatten()
            .filter(|link| link.send(message.clone()).is_ok())
            .count()
    }

    /// Worker processes that have not exited
    pub async fn running(&self) -> usize {
        let mut processes = self.processes.lock().await;
        let mut running = 0;
        for process in processes.iter_mut() {
            if process.is_running() {
                running += 1;
            }
        }
        running
    }
}

impl<T> Drop for ProcessPool<T> {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl<T> WorkerFleet for ProcessPool<T>
where
    T: Clone + Send + 'static,
{
    fn signal_shutdown(&self) -> usize {
        self.broadcast(Downstream::Shutdown)
    }

    async fn join(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut processes = self.processes.lock().await;
        let mut survivors = 0;

        for process in processes.iter_mut() {
            if !process.is_running() {
                continue;
            }
            match tokio::time::timeout_at(deadline, process.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(worker = process.index, %status, "Worker process exited")
                }
                Ok(Err(e)) => {
                    warn!(worker = process.index, error = %e, "Failed to wait for worker process")
                }
                Err(_) => survivors += 1,
            }
        }
        survivors
    }

    async fn terminate(&self) -> usize {
        let mut processes = self.processes.lock().await;
        let mut signalled = 0;

        for process in processes.iter_mut() {
            if !process.is_running() {
                continue;
            }
            let Some(pid) = process.child.id() else {
                continue;
            };
            // SAFETY: plain kill(2) on a child we spawned and have not reaped
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
                signalled += 1;
            }
        }
        signalled
    }

    async fn kill(&self) -> usize {
        let mut processes = self.processes.lock().await;
        let mut killed = 0;

        for process in processes.iter_mut() {
            if !process.is_running() {
                continue;
            }
            match process.child.kill().await {
                Ok(()) => killed += 1,
                Err(e) => {
                    warn!(worker = process.index, error = %e, "Failed to kill worker process")
                }
            }
        }
        killed
    }

    fn close_links(&self) {
        self.links.lock().clear();
    }

    fn abort_tasks(&self) -> usize {
        let mut aborted = 0;
        for task in self.tasks.lock().drain(..) {
            if !task.is_finished() {
                task.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

async fn read_upstream<T, R>(
    index: usize,
    stdout: ChildStdout,
    upstream: mpsc::UnboundedSender<UpstreamEvent<T, R>>,
    requests: mpsc::UnboundedSender<()>,
) where
    T: DeserializeOwned,
    R: DeserializeOwned,
{
    let mut reader = FrameReader::<_, Upstream<T, R>>::new(stdout);

    loop {
        match reader.recv().await {
            Ok(Some(Upstream::RequestJob)) => {
                if requests.send(()).is_err() {
                    break;
                }
            }
            Ok(Some(message)) => {
                let event = UpstreamEvent::Message {
                    worker: index,
                    message,
                };
                if upstream.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(worker = index, error = %e, "Failed to read from worker process");
                break;
            }
        }
    }

    debug!(worker = index, "Worker stdout closed");
    let _ = upstream.send(UpstreamEvent::Disconnected { worker: index });
}

async fn write_downstream<T: Serialize>(
    index: usize,
    stdin: ChildStdin,
    mut downstream: mpsc::UnboundedReceiver<Downstream<T>>,
) {
    let mut writer = FrameWriter::<_, Downstream<T>>::new(stdin);

    while let Some(message) = downstream.recv().await {
        if let Err(e) = writer.send(&message).await {
            debug!(worker = index, error = %e, "Worker stdin closed");
            return;
        }
    }
    let _ = writer.close().await;
}

async fn feed_jobs<T>(
    index: usize,
    mut requests: mpsc::UnboundedReceiver<()>,
    jobs: Arc<ParseJobQueue<T>>,
    downstream: mpsc::UnboundedSender<Downstream<T>>,
) {
    let mut fed = 0u64;
    while requests.recv().await.is_some() {
        let message = match jobs.next().await {
            Some(job) => {
                fed += 1;
                Downstream::Job(job)
            }
            None => Downstream::JobsExhausted,
        };
        if downstream.send(message).is_err() {
            break;
        }
    }
    debug!(worker = index, fed, "Job feeder finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::error::ScanError;
    use crate::ipc::{IpcContext, ShutdownSequence, ShutdownTimeouts};
    use chrono::Utc;

    fn sleeper(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn timeouts() -> ShutdownTimeouts {
        ShutdownTimeouts {
            grace: Duration::from_millis(100),
            terminate: Duration::from_secs(2),
            drain_wait: Duration::from_millis(100),
            drain_limit: 100,
            settle: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_shutdown_terminates_sleeping_workers() {
        let pool = Arc::new(ProcessPool::<u32>::adopt(vec![
            sleeper("exec sleep 30"),
            sleeper("exec sleep 30"),
        ]));
        assert_eq!(pool.running().await, 2);

        let (ctx, _jobs) = IpcContext::<u32, u32>::new(2, 1, 4, Diagnostics::disabled());
        let sequence = ShutdownSequence::new(ctx, pool.clone(), timeouts());

        let (first, second) = tokio::join!(sequence.run(), sequence.run());
        assert_eq!(first, second);
        assert_eq!(first.survived_grace, 2);
        assert_eq!(first.terminated, 2);
        assert_eq!(first.killed, 0);
        assert_eq!(pool.running().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_kills_workers_ignoring_sigterm() {
        let pool = Arc::new(ProcessPool::<u32>::adopt(vec![sleeper(
            "trap '' TERM; exec sleep 30",
        )]));

        let (ctx, _jobs) = IpcContext::<u32, u32>::new(1, 1, 4, Diagnostics::disabled());
        let report = ShutdownSequence::new(
            ctx,
            pool.clone(),
            ShutdownTimeouts {
                terminate: Duration::from_millis(100),
                ..timeouts()
            },
        )
        .run()
        .await;

        assert_eq!(report.terminated, 1);
        assert_eq!(report.killed, 1);
        assert_eq!(pool.running().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_names_worker() {
        let (ctx, _jobs) = IpcContext::<u32, u32>::new(1, 1, 4, Diagnostics::disabled());
        let bootstrap = WorkerBootstrap {
            worker_index: 0,
            process_count: 1,
            task_count: 1,
            prefetch_multiple: 1.0,
            idle_backoff_ms: 10,
            diagnostics: false,
            started_at: Utc::now(),
            payload: serde_json::Value::Null,
        };

        let result = ProcessPool::spawn(
            &WorkerCommand::new("/nonexistent/transcript-scan-worker"),
            vec![bootstrap],
            ctx.upstream_sender(),
            Arc::clone(&ctx.parse_jobs),
        );
        assert!(matches!(
            result,
            Err(ScanError::Worker(WorkerError::SpawnFailed { index: 0, .. }))
        ));
    }

    #[test]
    fn test_worker_command_builder() {
        let command = WorkerCommand::new("/usr/bin/scan").arg("worker").env("RUST_LOG", "debug");
        assert_eq!(command.args, vec![OsString::from("worker")]);
        assert_eq!(command.envs.len(), 1);
    }
}
