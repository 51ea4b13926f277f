//! Coordinator/worker wire protocol
//!
//! Each worker process talks to the coordinator over its standard streams:
//! stdin carries [`Downstream`] frames, stdout carries [`Upstream`] frames.
//! Frames are bincode payloads inside a 4-byte length prefix
//! (`LengthDelimitedCodec`). Process-invariant configuration is handed over
//! once, as a JSON [`WorkerBootstrap`] in the [`BOOTSTRAP_ENV`] variable.

pub mod context;
pub mod shutdown;

pub use context::{ActiveRunGuard, IpcContext, ParseJobQueue, UpstreamEvent};
pub use shutdown::{ShutdownReport, ShutdownSequence, ShutdownTimeouts};

use crate::error::{IpcError, RemoteFailure, Result, WorkerError};
use crate::work::{ParseJob, ScanMetrics};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Environment variable carrying the worker bootstrap
pub const BOOTSTRAP_ENV: &str = "TRANSCRIPT_SCAN_WORKER";

/// Largest frame either side accepts
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Worker → coordinator messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Upstream<T, R> {
    /// Worker is up and serving
    Ready { pid: u32 },

    /// Worker's cursor wants the next parse job
    RequestJob,

    /// Results of one scanner job
    Results {
        transcript: T,
        scanner_name: String,
        results: Vec<R>,
    },

    /// Latest metrics of this worker process
    Metrics(ScanMetrics),

    CreateSemaphore {
        name: String,
        concurrency: usize,
        visible: bool,
    },

    AcquireSemaphore { name: String, ticket: u64 },

    /// Release a held permit, or cancel a pending acquire
    ReleaseSemaphore { name: String, ticket: u64 },

    /// One formatted log line
    Log { line: String },

    /// Scheduler finished every job
    Completed,

    /// Scheduler failed; the worker exits after sending this
    Failed(RemoteFailure),
}

impl<T, R> Upstream<T, R> {
    /// Nothing follows a terminal message
    pub fn is_terminal(&self) -> bool {
        matches!(self, Upstream::Completed | Upstream::Failed(_))
    }
}

/// Coordinator → worker messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Downstream<T> {
    /// Answer to `RequestJob`
    Job(ParseJob<T>),

    /// Answer to `RequestJob` once the parse-job queue is closed and empty
    JobsExhausted,

    SemaphoreCreated {
        name: String,
        concurrency: usize,
        visible: bool,
    },

    SemaphoreGranted { ticket: u64 },

    /// Stop scheduling and exit
    Shutdown,
}

/// Serialize one message into a frame payload
pub fn encode<M: Serialize>(message: &M) -> std::result::Result<Bytes, IpcError> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

/// Deserialize one frame payload
pub fn decode<M: DeserializeOwned>(frame: &[u8]) -> std::result::Result<M, IpcError> {
    Ok(bincode::deserialize(frame)?)
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Typed frame writer over a pipe
pub struct FrameWriter<W, M> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
    _message: PhantomData<fn(M)>,
}

impl<W: AsyncWrite + Unpin, M: Serialize> FrameWriter<W, M> {
    pub fn new(io: W) -> Self {
        Self {
            inner: FramedWrite::new(io, codec()),
            _message: PhantomData,
        }
    }

    /// Write and flush one message
    pub async fn send(&mut self, message: &M) -> std::result::Result<(), IpcError> {
        self.inner.send(encode(message)?).await?;
        Ok(())
    }

    /// Flush and shut down the write half
    pub async fn close(&mut self) -> std::result::Result<(), IpcError> {
        SinkExt::<Bytes>::close(&mut self.inner).await?;
        Ok(())
    }
}

/// Typed frame reader over a pipe
pub struct FrameReader<R, M> {
    inner: FramedRead<R, LengthDelimitedCodec>,
    _message: PhantomData<fn() -> M>,
}

impl<R: AsyncRead + Unpin, M: DeserializeOwned> FrameReader<R, M> {
    pub fn new(io: R) -> Self {
        Self {
            inner: FramedRead::new(io, codec()),
            _message: PhantomData,
        }
    }

    /// Next message, or `None` at end of stream
    pub async fn recv(&mut self) -> std::result::Result<Option<M>, IpcError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(frame) => Ok(Some(decode(&frame?)?)),
        }
    }
}

/// Configuration a worker process needs before it can serve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    /// Index of this worker among the coordinator's processes
    pub worker_index: usize,

    pub process_count: usize,

    /// Scheduler tasks inside this process
    pub task_count: usize,

    pub prefetch_multiple: f64,

    pub idle_backoff_ms: u64,

    pub diagnostics: bool,

    /// Coordinator start time, for diagnostics
    pub started_at: DateTime<Utc>,

    /// Application-defined payload used to build the scan functions
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkerBootstrap {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    /// Encode for the environment variable
    pub fn to_env_value(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| WorkerError::InvalidBootstrap(e.to_string()).into())
    }

    pub fn from_env_value(value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|e| WorkerError::InvalidBootstrap(e.to_string()).into())
    }

    /// Read the bootstrap handed over by the coordinator
    pub fn from_env() -> Result<Self> {
        let value =
            std::env::var(BOOTSTRAP_ENV).map_err(|_| IpcError::MissingBootstrap(BOOTSTRAP_ENV))?;
        Self::from_env_value(&value)
    }
}
