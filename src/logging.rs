//! Logging setup
//!
//! The CLI writes formatted events to stderr. Worker processes cannot: their
//! stdout is the upstream pipe and their stderr is shared with the
//! coordinator's terminal. Instead each formatted line goes through
//! [`UpstreamLogWriter`] into a channel that the worker ships upstream, and
//! the coordinator re-emits it with [`emit_worker_line`].

use std::io;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Target used when re-emitting worker log lines
pub const WORKER_LOG_TARGET: &str = "transcript_scan::worker";

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("transcript_scan=debug,warn")
        } else {
            EnvFilter::new("transcript_scan=info,warn")
        }
    })
}

/// Install the stderr subscriber used by the CLI
pub fn init_cli_logging(verbose: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(verbose))
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

/// Install the forwarding subscriber used inside a worker process
pub fn init_worker_logging(lines: mpsc::UnboundedSender<String>, verbose: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter(verbose))
        .with_writer(UpstreamLogWriter::new(lines))
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install worker log subscriber: {e}"))
}

/// Re-emit a line received from worker `worker`
pub fn emit_worker_line(worker: usize, line: &str) {
    info!(target: WORKER_LOG_TARGET, worker, "{}", line.trim());
}

/// `MakeWriter` sending each formatted event as one line into a channel
#[derive(Clone)]
pub struct UpstreamLogWriter {
    lines: mpsc::UnboundedSender<String>,
}

impl UpstreamLogWriter {
    pub fn new(lines: mpsc::UnboundedSender<String>) -> Self {
        Self { lines }
    }
}

impl<'a> MakeWriter<'a> for UpstreamLogWriter {
    type Writer = LineForwarder;

    fn make_writer(&'a self) -> Self::Writer {
        LineForwarder {
            buffer: Vec::with_capacity(128),
            lines: self.lines.clone(),
        }
    }
}

/// Buffers one event and forwards it when dropped
pub struct LineForwarder {
    buffer: Vec<u8>,
    lines: mpsc::UnboundedSender<String>,
}

impl io::Write for LineForwarder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineForwarder {
    fn drop(&mut self) {
        let line = String::from_utf8_lossy(&self.buffer);
        let line = line.trim_end();
        if !line.is_empty() {
            // Receiver gone means the pipe is closed; nothing left to tell
            let _ = self.lines.send(line.to_string());
        }
    }
}
