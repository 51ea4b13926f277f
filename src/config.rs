//! Configuration types for transcript-scan
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - Strategy selection from the validated configuration

use crate::diagnostics::Diagnostics;
use crate::error::ConfigError;
use crate::multiprocess::{MultiProcessConfig, MultiProcessStrategy, WorkerCommand};
use crate::scheduler::SchedulerConfig;
use crate::strategy::{SingleProcessStrategy, Strategy};
use crate::synthetic::{FailureStage, SyntheticWorkload};
use crate::work::ScanFunctions;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum scheduler tasks across all processes
pub const MAX_TASKS: usize = 4096;

/// Maximum worker processes
pub const MAX_PROCESSES: usize = 256;

/// Upper bound of the prefetch multiple
pub const MAX_PREFETCH_MULTIPLE: f64 = 64.0;

/// Adaptive transcript scanner
#[derive(Parser, Debug, Clone)]
#[command(
    name = "transcript-scan",
    version,
    about = "Adaptive single- and multi-process transcript scanner",
    long_about = "Schedules parse and scan work over a pool of cooperative tasks, optionally \
                  spread across worker processes.\n\n\
                  The `run` command drives the scheduler with a synthetic workload and writes \
                  one JSON line per completed scanner job.",
    after_help = "EXAMPLES:\n    \
        transcript-scan run -n 1000 -s 4 -o results.jsonl\n    \
        transcript-scan run -n 5000 -t 64 -P 4 --limit 8\n    \
        transcript-scan run -n 100 --fail-stage scan --fail-on 42 -v"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Scan synthetic transcripts
    Run(RunArgs),

    /// Serve as a worker process (started by the coordinator)
    #[command(hide = true)]
    Worker,
}

/// Arguments of the `run` command
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Number of transcripts to generate
    #[arg(short = 'n', long, default_value = "100", value_name = "NUM")]
    pub transcripts: u64,

    /// Number of scanners applied to every transcript
    #[arg(short = 's', long, default_value = "3", value_name = "NUM")]
    pub scanners: usize,

    /// Simulated parse latency
    #[arg(long, default_value = "20", value_name = "MS")]
    pub parse_latency_ms: u64,

    /// Simulated scan latency
    #[arg(long, default_value = "50", value_name = "MS")]
    pub scan_latency_ms: u64,

    /// Scheduler tasks across all processes
    #[arg(
        short = 't',
        long,
        default_value_t = default_tasks(),
        value_name = "NUM"
    )]
    pub tasks: usize,

    /// Worker processes (more than 1 selects multi-process mode)
    #[arg(short = 'P', long, default_value = "1", value_name = "NUM")]
    pub processes: usize,

    /// Scanner-job buffer size per task
    #[arg(long, default_value = "1.0", value_name = "MULTIPLE")]
    pub prefetch: f64,

    /// Sleep between two consecutive idle checks of a task
    #[arg(long, default_value = "1000", value_name = "MS")]
    pub idle_backoff_ms: u64,

    /// Limit on concurrent scans across all processes
    #[arg(long = "limit", value_name = "NUM")]
    pub concurrency_limit: Option<usize>,

    /// Inject a failure at this stage
    #[arg(long, value_enum, requires = "fail_on")]
    pub fail_stage: Option<FailureStage>,

    /// Transcript id the injected failure fires on
    #[arg(long, value_name = "ID", requires = "fail_stage")]
    pub fail_on: Option<u64>,

    /// Transcript ids whose results are already known (can be repeated)
    #[arg(long = "skip", value_name = "ID", action = clap::ArgAction::Append)]
    pub already_scanned: Vec<u64>,

    /// Output JSON-lines file (results are counted, not written, if not set)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Emit scheduler diagnostics
    #[arg(long)]
    pub diagnostics: bool,
}

fn default_tasks() -> usize {
    // Scan work is I/O bound: oversubscribe the cores
    num_cpus::get() * 4
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub workload: SyntheticWorkload,

    pub transcript_count: u64,

    /// Scheduler tasks across all processes
    pub task_count: usize,

    pub process_count: usize,

    pub prefetch_multiple: f64,

    pub idle_backoff: Duration,

    pub output_path: Option<PathBuf>,

    pub show_progress: bool,

    pub verbose: bool,

    pub diagnostics: bool,
}

impl ScanConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: RunArgs) -> Result<Self, ConfigError> {
        if args.tasks == 0 || args.tasks > MAX_TASKS {
            return Err(ConfigError::InvalidTaskCount {
                count: args.tasks,
                max: MAX_TASKS,
            });
        }

        if args.processes == 0 || args.processes > MAX_PROCESSES {
            return Err(ConfigError::InvalidProcessCount {
                count: args.processes,
                max: MAX_PROCESSES,
            });
        }

        if args.processes > args.tasks {
            return Err(ConfigError::ProcessesExceedTasks {
                processes: args.processes,
                tasks: args.tasks,
            });
        }

        if !(args.prefetch > 0.0 && args.prefetch <= MAX_PREFETCH_MULTIPLE) {
            return Err(ConfigError::InvalidPrefetchMultiple {
                value: args.prefetch,
                max: MAX_PREFETCH_MULTIPLE,
            });
        }

        if args.scanners == 0 {
            return Err(ConfigError::InvalidWorkload(
                "at least one scanner is required".to_string(),
            ));
        }

        if args.concurrency_limit == Some(0) {
            return Err(ConfigError::InvalidWorkload(
                "concurrency limit must be at least 1".to_string(),
            ));
        }

        if let Some(path) = &args.output {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(ConfigError::InvalidOutputPath {
                        path: path.clone(),
                        reason: format!("Parent directory '{}' does not exist", parent.display()),
                    });
                }
            }
        }

        let mut workload = SyntheticWorkload::new(args.scanners)
            .with_latency(
                Duration::from_millis(args.parse_latency_ms),
                Duration::from_millis(args.scan_latency_ms),
            )
            .with_already_scanned(args.already_scanned);
        if let Some(limit) = args.concurrency_limit {
            workload = workload.with_concurrency_limit(limit);
        }
        if let (Some(stage), Some(transcript)) = (args.fail_stage, args.fail_on) {
            workload = workload.failing_at(stage, transcript);
        }

        Ok(Self {
            workload,
            transcript_count: args.transcripts,
            task_count: args.tasks,
            process_count: args.processes,
            prefetch_multiple: args.prefetch,
            idle_backoff: Duration::from_millis(args.idle_backoff_ms),
            output_path: args.output,
            show_progress: !args.quiet,
            verbose: args.verbose,
            diagnostics: args.diagnostics,
        })
    }

    pub fn is_multiprocess(&self) -> bool {
        self.process_count > 1
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(self.task_count)
            .with_prefetch_multiple(self.prefetch_multiple)
            .with_idle_backoff(self.idle_backoff)
            .with_diagnostics(Diagnostics::new(self.diagnostics))
    }

    /// Multi-process settings; the workload travels to workers as the payload
    pub fn multiprocess_config(&self, command: WorkerCommand) -> Result<MultiProcessConfig, ConfigError> {
        let payload = serde_json::to_value(&self.workload)
            .map_err(|e| ConfigError::InvalidWorkload(e.to_string()))?;

        Ok(MultiProcessConfig::new(self.process_count, self.task_count, command)
            .with_prefetch_multiple(self.prefetch_multiple)
            .with_idle_backoff(self.idle_backoff)
            .with_diagnostics(Diagnostics::new(self.diagnostics))
            .with_payload(payload))
    }

    /// Strategy matching the process count
    ///
    /// The multi-process strategy leaves Ctrl-C to the caller and is
    /// cancelled through `cancel` instead.
    pub fn strategy<F: ScanFunctions>(
        &self,
        command: WorkerCommand,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Strategy<F>>, ConfigError> {
        if self.is_multiprocess() {
            let config = self.multiprocess_config(command)?.with_interrupt_handling(false);
            Ok(Box::new(MultiProcessStrategy::new(config).with_cancellation(cancel)))
        } else {
            Ok(Box::new(
                SingleProcessStrategy::new(self.scheduler_config()).with_cancellation(cancel),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticWorkload;

    fn parse(args: &[&str]) -> RunArgs {
        let mut argv = vec!["transcript-scan", "run"];
        argv.extend_from_slice(args);
        match CliArgs::try_parse_from(argv).unwrap().command {
            Command::Run(run) => run,
            Command::Worker => panic!("expected run"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = ScanConfig::from_args(parse(&[])).unwrap();
        assert_eq!(config.task_count, num_cpus::get() * 4);
        assert_eq!(config.process_count, 1);
        assert_eq!(config.prefetch_multiple, 1.0);
        assert_eq!(config.idle_backoff, Duration::from_secs(1));
        assert!(!config.is_multiprocess());
        assert!(config.show_progress);
        assert_eq!(config.workload.scanners.len(), 3);
    }

    #[test]
    fn test_rejects_invalid_counts() {
        assert_eq!(
            ScanConfig::from_args(parse(&["-t", "0"])).unwrap_err(),
            ConfigError::InvalidTaskCount { count: 0, max: MAX_TASKS }
        );
        assert_eq!(
            ScanConfig::from_args(parse(&["-t", "4", "-P", "0"])).unwrap_err(),
            ConfigError::InvalidProcessCount { count: 0, max: MAX_PROCESSES }
        );
        assert_eq!(
            ScanConfig::from_args(parse(&["-t", "2", "-P", "3"])).unwrap_err(),
            ConfigError::ProcessesExceedTasks { processes: 3, tasks: 2 }
        );
    }

    #[test]
    fn test_rejects_invalid_prefetch() {
        for value in ["0", "0.0", "65"] {
            let err = ScanConfig::from_args(parse(&["-t", "4", "--prefetch", value])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidPrefetchMultiple { .. }));
        }
        assert!(ScanConfig::from_args(parse(&["-t", "4", "--prefetch", "64"])).is_ok());
    }

    #[test]
    fn test_missing_output_parent() {
        let err = ScanConfig::from_args(parse(&["-o", "/nonexistent/dir/out.jsonl"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOutputPath { .. }));
    }

    #[test]
    fn test_failure_injection_requires_both_flags() {
        assert!(CliArgs::try_parse_from(["transcript-scan", "run", "--fail-stage", "scan"]).is_err());

        let config =
            ScanConfig::from_args(parse(&["--fail-stage", "parse", "--fail-on", "7"])).unwrap();
        let expected = SyntheticWorkload::new(3)
            .with_latency(Duration::from_millis(20), Duration::from_millis(50))
            .failing_at(FailureStage::Parse, 7);
        assert_eq!(config.workload, expected);
    }

    #[test]
    fn test_multiprocess_payload_round_trips_workload() {
        let config = ScanConfig::from_args(parse(&["-t", "8", "-P", "2", "--limit", "3"])).unwrap();
        assert!(config.is_multiprocess());

        let mp = config.multiprocess_config(WorkerCommand::new("/bin/true")).unwrap();
        assert_eq!(mp.tasks_per_process(), 4);
        let workload: SyntheticWorkload = serde_json::from_value(mp.payload).unwrap();
        assert_eq!(workload.concurrency_limit, Some(3));
    }

    #[test]
    fn test_worker_subcommand_is_hidden_but_parses() {
        let args = CliArgs::try_parse_from(["transcript-scan", "worker"]).unwrap();
        assert!(matches!(args.command, Command::Worker));
    }
}
