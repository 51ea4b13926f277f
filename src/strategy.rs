//! Scan strategies
//!
//! A [`Strategy`] drives a whole scan: it consumes the parse-job stream
//! once, feeds results to the sink as they become available and returns a
//! [`ScanSummary`]. [`SingleProcessStrategy`] runs one [`Scheduler`] in the
//! current runtime; the multi-process strategy replicates it across worker
//! processes.

use crate::error::Result;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::work::{ParseJob, ScanFunctions, ScanMetrics, SinkHandle};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a strategy run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSummary {
    /// False when the run was cancelled or interrupted
    pub completed: bool,

    /// Final metrics, summed over processes
    pub metrics: ScanMetrics,

    pub duration: Duration,
}

impl ScanSummary {
    /// Completed scans per second
    pub fn scans_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.metrics.completed_scans as f64 / secs
        } else {
            0.0
        }
    }
}

/// Something that can drive a scan to completion
#[async_trait]
pub trait Strategy<F: ScanFunctions>: Send + Sync {
    async fn run(
        &self,
        parse_jobs: BoxStream<'static, ParseJob<F::Transcript>>,
        functions: Arc<F>,
        sink: SinkHandle<F>,
    ) -> Result<ScanSummary>;
}

/// Runs one scheduler inside the current process
#[derive(Debug, Clone)]
pub struct SingleProcessStrategy {
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl SingleProcessStrategy {
    pub fn new(config: SchedulerConfig) -> Self {
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

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

#[async_trait]
impl<F: ScanFunctions> Strategy<F> for SingleProcessStrategy {
    async fn run(
        &self,
        parse_jobs: BoxStream<'static, ParseJob<F::Transcript>>,
        functions: Arc<F>,
        sink: SinkHandle<F>,
    ) -> Result<ScanSummary> {
        let scheduler = Arc::new(Scheduler::new(
            self.config.clone(),
            parse_jobs,
            functions,
            sink,
        ));
        scheduler.run(self.cancel.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scans_per_second() {
        let summary = ScanSummary {
            completed: true,
            metrics: ScanMetrics {
                completed_scans: 50,
                ..Default::default()
            },
            duration: Duration::from_secs(2),
        };
        assert_eq!(summary.scans_per_second(), 25.0);

        let instant = ScanSummary {
            duration: Duration::ZERO,
            ..summary
        };
        assert_eq!(instant.scans_per_second(), 0.0);
    }
}
