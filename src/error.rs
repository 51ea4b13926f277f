//! Error types for transcript-scan
//!
//! This module defines the error hierarchy for a scan run:
//! - Collaborator failures (parse, scan, record callbacks)
//! - Worker process lifecycle errors
//! - IPC framing and channel errors
//! - Configuration errors
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Collaborator errors stay `anyhow::Error` so callers keep their context
//! - Errors raised inside a worker process cross the pipe as [`RemoteFailure`]
//!   and are rebuilt as the same variant in the coordinator

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a scan run
#[derive(Error, Debug)]
pub enum ScanError {
    /// `parse_function` failed
    #[error("Parse failed: {0:#}")]
    Parse(anyhow::Error),

    /// `scan_function` failed
    #[error("Scan failed: {0:#}")]
    Scan(anyhow::Error),

    /// `record_results` failed
    #[error("Recording results failed: {0:#}")]
    Record(anyhow::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker task or process errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Inter-process communication errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// A multi-process run is already active in this process
    #[error("A multi-process scan is already running in this process")]
    RunAlreadyActive,

    /// I/O errors (pipes, output files, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration and CLI errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Invalid task count
    #[error("Invalid task count {count}: must be between 1 and {max}")]
    InvalidTaskCount { count: usize, max: usize },

    /// Invalid process count
    #[error("Invalid process count {count}: must be between 1 and {max}")]
    InvalidProcessCount { count: usize, max: usize },

    /// More processes than tasks leaves processes without a worker
    #[error("Process count {processes} exceeds task count {tasks}")]
    ProcessesExceedTasks { processes: usize, tasks: usize },

    /// Invalid prefetch multiple
    #[error("Invalid prefetch multiple {value}: must be greater than 0 and at most {max}")]
    InvalidPrefetchMultiple { value: f64, max: f64 },

    /// Output path error
    #[error("Invalid output path '{path}': {reason}")]
    InvalidOutputPath { path: PathBuf, reason: String },

    /// Invalid workload description
    #[error("Invalid workload: {0}")]
    InvalidWorkload(String),

    /// Configuration failure reported by a worker process
    #[error("{0}")]
    Remote(String),
}

/// Worker task and worker process errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker task panicked
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },

    /// Worker process could not be started
    #[error("Failed to spawn worker process {index}: {reason}")]
    SpawnFailed { index: usize, reason: String },

    /// Worker process went away without reporting completion
    #[error("Worker process {index} exited before reporting completion")]
    ExitedEarly { index: usize },

    /// Worker process started with a bootstrap it cannot decode
    #[error("Invalid worker bootstrap: {0}")]
    InvalidBootstrap(String),

    /// Lifecycle failure reported by a worker process
    #[error("{0}")]
    Remote(String),
}

/// IPC framing and channel errors
#[derive(Error, Debug)]
pub enum IpcError {
    /// Frame (de)serialization failed
    #[error("Frame codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Pipe read/write failed
    #[error("Pipe I/O error: {0}")]
    Pipe(#[from] std::io::Error),

    /// Channel closed while a peer still expected it open
    #[error("IPC channel '{0}' closed unexpectedly")]
    ChannelClosed(&'static str),

    /// Semaphore protocol violation
    #[error("Semaphore '{name}': {reason}")]
    Semaphore { name: String, reason: String },

    /// Worker process started without its bootstrap variable
    #[error("Environment variable {0} is not set; not started by a coordinator?")]
    MissingBootstrap(&'static str),

    /// IPC failure reported by a worker process
    #[error("{0}")]
    Remote(String),
}

/// Result type alias for ScanError
pub type Result<T> = std::result::Result<T, ScanError>;

/// Category of a failure raised inside a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Parse,
    Scan,
    Record,
    Config,
    Worker,
    Ipc,
    Io,
}

/// A worker-side error in transit to the coordinator
///
/// Carries the variant and the fully formatted message (including the
/// `anyhow` context chain) so the coordinator raises an equivalent error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteFailure {
    /// Capture an error for transport
    pub fn from_error(err: &ScanError) -> Self {
        let (kind, message) = match err {
            ScanError::Parse(e) => (FailureKind::Parse, format!("{:#}", e)),
            ScanError::Scan(e) => (FailureKind::Scan, format!("{:#}", e)),
            ScanError::Record(e) => (FailureKind::Record, format!("{:#}", e)),
            ScanError::Config(e) => (FailureKind::Config, e.to_string()),
            ScanError::Worker(e) => (FailureKind::Worker, e.to_string()),
            ScanError::Ipc(e) => (FailureKind::Ipc, e.to_string()),
            ScanError::RunAlreadyActive => (FailureKind::Worker, err.to_string()),
            ScanError::Io(e) => (FailureKind::Io, e.to_string()),
        };
        Self { kind, message }
    }

    /// Rebuild the error in the coordinator
    pub fn into_error(self) -> ScanError {
        let message = self.message;
        match self.kind {
            FailureKind::Parse => ScanError::Parse(anyhow::Error::msg(message)),
            FailureKind::Scan => ScanError::Scan(anyhow::Error::msg(message)),
            FailureKind::Record => ScanError::Record(anyhow::Error::msg(message)),
            FailureKind::Config => ScanError::Config(ConfigError::Remote(message)),
            FailureKind::Worker => ScanError::Worker(WorkerError::Remote(message)),
            FailureKind::Ipc => ScanError::Ipc(IpcError::Remote(message)),
            FailureKind::Io => ScanError::Io(std::io::Error::other(message)),
        }
    }
}

impl ScanError {
    /// True for failures raised by the caller-supplied callbacks
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            ScanError::Parse(_) | ScanError::Scan(_) | ScanError::Record(_)
        )
    }
}
