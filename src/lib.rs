//! transcript-scan - Adaptive Transcript Scanning Engine
//!
//! Runs a set of scanners over a large corpus of transcripts. Each transcript
//! is parsed once (a *parse job*) into the scanner jobs that still need it;
//! scanner jobs are buffered and evaluated by the same pool of cooperative
//! tasks that does the parsing.
//!
//! # Features
//!
//! - **Adaptive Scheduling**: Every task picks parse, scan or wait on each
//!   iteration from the buffer fill level and the number of active parsers,
//!   keeping the buffer fed without letting it grow unbounded.
//!
//! - **Multi-Process Distribution**: The same scheduler replicated across
//!   worker processes, fed on demand from a coordinator over stdin/stdout.
//!
//! - **Cross-Process Concurrency Limits**: Named semaphores owned by the
//!   coordinator hold their limit across every worker process.
//!
//! - **Phased Shutdown**: Idempotent teardown escalating from a polite
//!   shutdown message to SIGTERM and kill.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Parse-job stream                            │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!              ┌────────────────┴─────────────────┐
//!              ▼                                  ▼
//! ┌─────────────────────────┐      ┌───────────────────────────────┐
//! │ SingleProcessStrategy   │      │ MultiProcessStrategy          │
//! │   one Scheduler         │      │   producer → ParseJobQueue    │
//! │                         │      │   feeders  → worker stdin     │
//! │                         │      │   collector ← worker stdout   │
//! └────────────┬────────────┘      └───────────────┬───────────────┘
//!              │                                   │
//!              │          ┌────────────────────────┘
//!              ▼          ▼   (one Scheduler per worker process)
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Scheduler                                 │
//! │  ┌────────┐  ┌────────┐  ┌────────┐         ┌────────┐          │
//! │  │ Task 1 │  │ Task 2 │  │ Task 3 │  ...    │ Task N │          │
//! │  └───┬────┘  └───┬────┘  └───┬────┘         └───┬────┘          │
//! │      └─── parse ─┴─► ScannerJobQueue ◄─ scan ───┘               │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//!                    ┌──────────────────┐
//!                    │   ResultSink     │
//!                    └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Single process, 32 tasks
//! transcript-scan run -n 1000 -s 4 -t 32 -o results.jsonl
//!
//! # Four worker processes sharing a limit of 8 concurrent scans
//! transcript-scan run -n 5000 -t 64 -P 4 --limit 8
//! ```

pub mod concurrency;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod multiprocess;
pub mod progress;
pub mod scheduler;
pub mod strategy;
pub mod synthetic;
pub mod work;

pub use concurrency::concurrency;
pub use config::{CliArgs, ScanConfig};
pub use diagnostics::Diagnostics;
pub use error::{Result, ScanError};
pub use multiprocess::{MultiProcessConfig, MultiProcessStrategy, WorkerCommand};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use strategy::{ScanSummary, SingleProcessStrategy, Strategy};
pub use work::{ParseJob, ParseOutcome, ResultSink, ScanFunctions, ScanMetrics, ScanReport, ScannerJob};
