//! transcript-scan - Adaptive Transcript Scanning Engine
//!
//! Entry point for the CLI application and for worker processes.

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use transcript_scan::config::{CliArgs, Command, RunArgs, ScanConfig};
use transcript_scan::error::WorkerError;
use transcript_scan::ipc::WorkerBootstrap;
use transcript_scan::logging::init_cli_logging;
use transcript_scan::multiprocess::{run_worker, WorkerCommand};
use transcript_scan::progress::{print_header, print_summary, ProgressReporter};
use transcript_scan::synthetic::{JsonlRecorder, SyntheticWorkload};
use transcript_scan::work::SinkHandle;

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
    let args = CliArgs::parse();

    match args.command {
        Command::Worker => match worker() {
            Ok(()) => ExitCode::SUCCESS,
            // The coordinator already received the failure upstream
            Err(_) => ExitCode::FAILURE,
        },
        Command::Run(args) => match run(args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{:#}", e);
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn run(args: RunArgs) -> Result<()> {
    init_cli_logging(args.verbose)?;

    let config = ScanConfig::from_args(args).context("Invalid configuration")?;

    if config.show_progress {
        print_header(
            config.transcript_count,
            config.workload.scanners.len(),
            config.task_count,
            config.process_count,
            &output_name(&config),
        );
    }

    // Worker processes bring their own parallelism; one thread is enough otherwise
    let runtime = if config.is_multiprocess() {
        tokio::runtime::Builder::new_multi_thread().enable_all().build()
    } else {
        tokio::runtime::Builder::new_current_thread().enable_all().build()
    }
    .context("Failed to create async runtime")?;

    runtime.block_on(scan(config))
}

async fn scan(config: ScanConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone())?;

    let progress = config.show_progress.then(|| Arc::new(ProgressReporter::new()));

    let recorder = match &config.output_path {
        Some(path) => JsonlRecorder::create(path)?,
        None => JsonlRecorder::discard(),
    };
    let recorder = match &progress {
        Some(progress) => {
            let progress = Arc::clone(progress);
            recorder.on_metrics(move |metrics| progress.update(metrics))
        }
        None => recorder,
    };
    let recorder = Arc::new(recorder);
    let sink: SinkHandle<SyntheticWorkload> = recorder.clone();

    let command = WorkerCommand::current_exe().context("Failed to locate worker executable")?;
    let strategy = config.strategy::<SyntheticWorkload>(command, cancel)?;

    if let Some(p) = &progress {
        p.set_status("Starting scan...");
    }

    let result = strategy
        .run(
            config.workload.parse_job_stream(config.transcript_count),
            Arc::new(config.workload.clone()),
            sink,
        )
        .await;

    if let Some(p) = &progress {
        match &result {
            Ok(summary) if summary.completed => p.finish("Scan completed"),
            Ok(_) => p.finish("Scan interrupted"),
            Err(_) => p.finish_and_clear(),
        }
    }

    let summary = result.context("Scan failed")?;
    let records = recorder.finish()?;

    if config.show_progress {
        print_summary(&summary, records, &output_name(&config));
    }

    if !summary.completed {
        info!("Scan was interrupted before completion");
    }

    Ok(())
}

/// Entry point of a worker process started by the coordinator
fn worker() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    let result = runtime.block_on(async {
        let bootstrap = WorkerBootstrap::from_env()?;
        let workload: SyntheticWorkload = serde_json::from_value(bootstrap.payload.clone())
            .map_err(|e| WorkerError::InvalidBootstrap(e.to_string()))?;
        run_worker(bootstrap, Arc::new(workload)).await?;
        Ok::<(), anyhow::Error>(())
    });

    // A blocking stdin read cannot be cancelled; do not wait for it
    runtime.shutdown_timeout(WORKER_SHUTDOWN_TIMEOUT);
    result
}

fn install_interrupt_handler(cancel: CancellationToken) -> Result<()> {
    let interrupts = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if interrupts.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\nInterrupt received, shutting down... (press Ctrl-C again to force exit)");
            cancel.cancel();
        } else {
            eprintln!("\nForced exit");
            std::process::exit(130);
        }
    })
    .context("Failed to set signal handler")
}

fn output_name(config: &ScanConfig) -> String {
    config
        .output_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(discarded)".to_string())
}
