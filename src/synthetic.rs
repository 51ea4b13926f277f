//! Synthetic scan workload
//!
//! Generated transcripts, scanners that sleep instead of calling a model,
//! and a JSON-lines result writer. Used by the `run` command, by worker
//! processes started from this binary, and by the tests and benchmarks.

use crate::concurrency;
use crate::work::{
    ParseJob, ParseOutcome, ResultSink, ScanFunctions, ScanMetrics, ScanReport, ScannerJob,
};
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Name of the limiter scanners share when a concurrency limit is set
pub const MODEL_SEMAPHORE: &str = "synthetic-model";

/// Descriptor of a generated transcript
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TranscriptRef {
    pub id: u64,
    pub location: String,
}

impl TranscriptRef {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            location: format!("synthetic://transcripts/{id:06}.json"),
        }
    }
}

/// Where an injected failure fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum FailureStage {
    Parse,
    Scan,
}

/// Failure injected for one transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedFailure {
    pub stage: FailureStage,
    pub transcript: u64,
}

/// Parsed content shared by the scanner jobs of one transcript
#[derive(Debug)]
pub struct ParsedTranscript {
    pub id: u64,
    pub messages: Vec<String>,
}

/// Scanner handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticScanner {
    pub index: usize,
    pub name: String,
}

/// One scanner result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticReport {
    pub scanner: String,
    pub value: f64,
    pub explanation: String,
}

/// Configurable synthetic scan functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticWorkload {
    /// Scanner names; a parse job's indices refer to this list
    pub scanners: Vec<String>,

    pub parse_latency_ms: u64,

    pub scan_latency_ms: u64,

    /// Limit on concurrent scans across every worker of the run
    #[serde(default)]
    pub concurrency_limit: Option<usize>,

    #[serde(default)]
    pub fail: Option<InjectedFailure>,

    /// Transcripts whose results are already known; parsing short-circuits
    #[serde(default)]
    pub already_scanned: BTreeSet<u64>,
}

impl SyntheticWorkload {
    pub fn new(scanner_count: usize) -> Self {
        Self {
            scanners: (0..scanner_count).map(|i| format!("scanner_{i}")).collect(),
            parse_latency_ms: 0,
            scan_latency_ms: 0,
            concurrency_limit: None,
            fail: None,
            already_scanned: BTreeSet::new(),
        }
    }

    pub fn with_latency(mut self, parse: Duration, scan: Duration) -> Self {
        self.parse_latency_ms = parse.as_millis() as u64;
        self.scan_latency_ms = scan.as_millis() as u64;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn failing_at(mut self, stage: FailureStage, transcript: u64) -> Self {
        self.fail = Some(InjectedFailure { stage, transcript });
        self
    }

    pub fn with_already_scanned(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.already_scanned.extend(ids);
        self
    }

    fn fails_at(&self, stage: FailureStage, transcript: u64) -> bool {
        self.fail
            .as_ref()
            .is_some_and(|f| f.stage == stage && f.transcript == transcript)
    }

    fn scanner_name(&self, index: usize) -> anyhow::Result<&str> {
        self.scanners
            .get(index)
            .map(String::as_str)
            .with_context(|| format!("no scanner at index {index}"))
    }

    /// Parse jobs for `count` transcripts, each wanting every scanner
    pub fn parse_jobs(&self, count: u64) -> Vec<ParseJob<TranscriptRef>> {
        (0..count)
            .map(|id| ParseJob::new(TranscriptRef::new(id), 0..self.scanners.len()))
            .collect()
    }

    /// Same as [`parse_jobs`](Self::parse_jobs), as a stream
    pub fn parse_job_stream(&self, count: u64) -> BoxStream<'static, ParseJob<TranscriptRef>> {
        stream::iter(self.parse_jobs(count)).boxed()
    }
}

fn score(transcript: u64, scanner: usize) -> f64 {
    ((transcript * 31 + scanner as u64 * 17) % 100) as f64 / 100.0
}

async fn simulate(latency_ms: u64) {
    if latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;
    } else {
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl ScanFunctions for SyntheticWorkload {
    type Transcript = TranscriptRef;
    type Content = ParsedTranscript;
    type Scanner = SyntheticScanner;
    type Report = SyntheticReport;

    async fn parse(&self, job: ParseJob<TranscriptRef>) -> anyhow::Result<ParseOutcome<Self>> {
        simulate(self.parse_latency_ms).await;

        let id = job.transcript.id;
        if self.fails_at(FailureStage::Parse, id) {
            bail!("failed to load transcript {}", job.transcript.location);
        }

        if self.already_scanned.contains(&id) {
            let mut reports = Vec::with_capacity(job.scanner_count());
            for &index in &job.scanner_indices {
                reports.push(ScanReport {
                    transcript: job.transcript.clone(),
                    scanner_name: self.scanner_name(index)?.to_string(),
                    results: Vec::new(),
                });
            }
            return Ok(ParseOutcome::Finished(reports));
        }

        let content = Arc::new(ParsedTranscript {
            id,
            messages: (0..4).map(|n| format!("message {n} of transcript {id}")).collect(),
        });

        let mut jobs = Vec::with_capacity(job.scanner_count());
        for &index in &job.scanner_indices {
            let name = self.scanner_name(index)?.to_string();
            jobs.push(ScannerJob {
                transcript: job.transcript.clone(),
                union_transcript: Arc::clone(&content),
                scanner: SyntheticScanner {
                    index,
                    name: name.clone(),
                },
                scanner_name: name,
            });
        }

        Ok(ParseOutcome::Jobs(jobs))
    }

    async fn scan(&self, job: ScannerJob<Self>) -> anyhow::Result<Vec<SyntheticReport>> {
        let _permit = match self.concurrency_limit {
            Some(limit) => {
                let limiter = concurrency::concurrency(MODEL_SEMAPHORE, limit, true).await?;
                Some(limiter.acquire().await?)
            }
            None => None,
        };

        simulate(self.scan_latency_ms).await;

        let id = job.transcript.id;
        if self.fails_at(FailureStage::Scan, id) {
            bail!(
                "scanner '{}' failed on transcript {}",
                job.scanner_name,
                job.transcript.location
            );
        }

        Ok(vec![SyntheticReport {
            scanner: job.scanner.name.clone(),
            value: score(id, job.scanner.index),
            explanation: format!(
                "{} read {} messages",
                job.scanner.name,
                job.union_transcript.messages.len()
            ),
        }])
    }
}

#[derive(Serialize)]
struct RecordLine<'a> {
    transcript: u64,
    location: &'a str,
    scanner: &'a str,
    results: &'a [SyntheticReport],
}

type MetricsHook = Box<dyn Fn(&ScanMetrics) + Send + Sync>;

/// Result sink writing one JSON line per recorded scanner job
pub struct JsonlRecorder {
    output: Mutex<Option<BufWriter<File>>>,
    records: AtomicU64,
    results: AtomicU64,
    latest: Mutex<ScanMetrics>,
    on_metrics: Option<MetricsHook>,
}

impl JsonlRecorder {
    /// Write records to `path`, truncating it
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self::with_output(Some(BufWriter::new(file))))
    }

    /// Count records without writing them anywhere
    pub fn discard() -> Self {
        Self::with_output(None)
    }

    fn with_output(output: Option<BufWriter<File>>) -> Self {
        Self {
            output: Mutex::new(output),
            records: AtomicU64::new(0),
            results: AtomicU64::new(0),
            latest: Mutex::new(ScanMetrics::default()),
            on_metrics: None,
        }
    }

    /// Call `hook` on every metrics update
    pub fn on_metrics(mut self, hook: impl Fn(&ScanMetrics) + Send + Sync + 'static) -> Self {
        self.on_metrics = Some(Box::new(hook));
        self
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn results(&self) -> u64 {
        self.results.load(Ordering::Relaxed)
    }

    /// Most recent metrics snapshot
    pub fn latest_metrics(&self) -> ScanMetrics {
        *self.latest.lock()
    }

    /// Flush buffered output
    pub fn finish(&self) -> anyhow::Result<u64> {
        if let Some(out) = self.output.lock().as_mut() {
            out.flush().context("failed to flush results")?;
        }
        Ok(self.records())
    }
}

#[async_trait]
impl ResultSink<TranscriptRef, SyntheticReport> for JsonlRecorder {
    async fn record_results(
        &self,
        transcript: &TranscriptRef,
        scanner_name: &str,
        results: Vec<SyntheticReport>,
    ) -> anyhow::Result<()> {
        if let Some(out) = self.output.lock().as_mut() {
            let line = RecordLine {
                transcript: transcript.id,
                location: &transcript.location,
                scanner: scanner_name,
                results: &results,
            };
            serde_json::to_writer(&mut *out, &line)?;
            out.write_all(b"\n")?;
        }
        self.records.fetch_add(1, Ordering::Relaxed);
        self.results.fetch_add(results.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn update_metrics(&self, metrics: &ScanMetrics) {
        *self.latest.lock() = *metrics;
        if let Some(hook) = &self.on_metrics {
            hook(metrics);
        }
    }
}
