//! Units of work and the collaborator contracts
//!
//! A scan consumes [`ParseJob`]s supplied by the caller. Parsing a job with
//! [`ScanFunctions::parse`] yields one [`ScannerJob`] per requested scanner
//! (or a short-circuited set of finished reports). Each scanner job is then
//! evaluated with [`ScanFunctions::scan`] and its results handed to a
//! [`ResultSink`].

pub mod metrics;

pub use metrics::{sum_metrics, MetricsTracker, ResourceSampler, ScanMetrics};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A transcript that must be parsed once and then evaluated by a scanner subset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseJob<T> {
    /// Caller-defined transcript descriptor
    pub transcript: T,

    /// Indices of the scanners that still need this transcript
    pub scanner_indices: BTreeSet<usize>,
}

impl<T> ParseJob<T> {
    /// Create a parse job for the given scanner indices
    pub fn new(transcript: T, scanner_indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            transcript,
            scanner_indices: scanner_indices.into_iter().collect(),
        }
    }

    /// Number of scanner jobs this parse job expands to
    pub fn scanner_count(&self) -> usize {
        self.scanner_indices.len()
    }
}

/// One filtered transcript evaluated by one scanner
///
/// `union_transcript` is shared by every job produced from the same parse.
pub struct ScannerJob<F: ScanFunctions + ?Sized> {
    pub transcript: F::Transcript,
    pub union_transcript: Arc<F::Content>,
    pub scanner: F::Scanner,
    pub scanner_name: String,
}

impl<F: ScanFunctions + ?Sized> fmt::Debug for ScannerJob<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerJob")
            .field("transcript", &self.transcript)
            .field("scanner_name", &self.scanner_name)
            .finish_non_exhaustive()
    }
}

/// Results already known for a (transcript, scanner) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport<T, R> {
    pub transcript: T,
    pub scanner_name: String,
    pub results: Vec<R>,
}

/// What parsing a [`ParseJob`] produced
pub enum ParseOutcome<F: ScanFunctions + ?Sized> {
    /// Scanner jobs to enqueue, one per requested scanner
    Jobs(Vec<ScannerJob<F>>),

    /// Nothing left to scan; these reports are recorded directly
    Finished(Vec<ScanReport<F::Transcript, F::Report>>),
}

impl<F: ScanFunctions + ?Sized> ParseOutcome<F> {
    /// Number of (transcript, scanner) pairs this outcome accounts for
    pub fn len(&self) -> usize {
        match self {
            ParseOutcome::Jobs(jobs) => jobs.len(),
            ParseOutcome::Finished(reports) => reports.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The parse and scan callbacks a strategy drives
///
/// `parse` is called concurrently for different jobs. `scan` is never
/// retried by the scheduler.
#[async_trait]
pub trait ScanFunctions: Send + Sync + 'static {
    /// Transcript descriptor; crosses the process boundary
    type Transcript: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Parsed transcript content shared by the jobs of one parse
    type Content: Send + Sync + 'static;

    /// Scanner handle resolved from a scanner index
    type Scanner: Send + Sync + 'static;

    /// Result produced by a scanner; crosses the process boundary
    type Report: fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    /// Load and filter one transcript for its requested scanners
    async fn parse(&self, job: ParseJob<Self::Transcript>) -> anyhow::Result<ParseOutcome<Self>>;

    /// Evaluate one transcript with one scanner
    async fn scan(&self, job: ScannerJob<Self>) -> anyhow::Result<Vec<Self::Report>>;
}

/// Receives results and live metrics from a strategy
///
/// `record_results` is called once per completed scanner job and never
/// concurrently for the same (transcript, scanner) pair. `update_metrics`
/// is called at high frequency and must be cheap.
#[async_trait]
pub trait ResultSink<T, R>: Send + Sync
where
    T: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn record_results(
        &self,
        transcript: &T,
        scanner_name: &str,
        results: Vec<R>,
    ) -> anyhow::Result<()>;

    fn update_metrics(&self, _metrics: &ScanMetrics) {}
}

/// Shared handle to the sink matching a set of scan functions
pub type SinkHandle<F> =
    Arc<dyn ResultSink<<F as ScanFunctions>::Transcript, <F as ScanFunctions>::Report>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_dedups_indices() {
        let job = ParseJob::new("t1".to_string(), [2, 0, 2, 1]);
        assert_eq!(job.scanner_count(), 3);
        assert_eq!(
            job.scanner_indices.into_iter().collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_parse_job_serde() {
        let job = ParseJob::new(7u32, [1, 4]);
        let json = serde_json::to_string(&job).unwrap();
        let back: ParseJob<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
    }
}
