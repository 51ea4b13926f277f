//! Integration tests for the single-process scheduler
//!
//! These drive the public API end to end with the synthetic workload and
//! small purpose-built scan functions.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use transcript_scan::synthetic::{FailureStage, SyntheticReport, SyntheticWorkload, TranscriptRef};
use transcript_scan::work::SinkHandle;
use transcript_scan::{
    concurrency, ParseJob, ParseOutcome, ResultSink, ScanError, ScanFunctions, ScanMetrics,
    ScannerJob, Scheduler, SchedulerConfig, SingleProcessStrategy, Strategy,
};

/// Sink counting records per pair and flagging overlapping calls
#[derive(Default)]
struct CheckingSink {
    seen: Mutex<HashMap<(u64, String), usize>>,
    in_flight: Mutex<HashSet<(u64, String)>>,
    overlaps: AtomicUsize,
    latest: Mutex<ScanMetrics>,
    fail_on: Option<u64>,
}

impl CheckingSink {
    fn failing_on(transcript: u64) -> Self {
        Self {
            fail_on: Some(transcript),
            ..Default::default()
        }
    }

    fn records(&self) -> usize {
        self.seen.lock().values().sum()
    }
}

#[async_trait]
impl ResultSink<TranscriptRef, SyntheticReport> for CheckingSink {
    async fn record_results(
        &self,
        transcript: &TranscriptRef,
        scanner_name: &str,
        _results: Vec<SyntheticReport>,
    ) -> anyhow::Result<()> {
        if self.fail_on == Some(transcript.id) {
            anyhow::bail!("disk full while recording transcript {}", transcript.id);
        }

        let key = (transcript.id, scanner_name.to_string());
        if !self.in_flight.lock().insert(key.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::task::yield_now().await;
        self.in_flight.lock().remove(&key);

        *self.seen.lock().entry(key).or_default() += 1;
        Ok(())
    }

    fn update_metrics(&self, metrics: &ScanMetrics) {
        *self.latest.lock() = *metrics;
    }
}

fn config(task_count: usize) -> SchedulerConfig {
    SchedulerConfig::new(task_count).with_idle_backoff(Duration::from_millis(5))
}

#[tokio::test]
async fn test_three_transcripts_two_scanners() {
    let workload = SyntheticWorkload::new(2);
    let sink = Arc::new(CheckingSink::default());
    let handle: SinkHandle<SyntheticWorkload> = sink.clone();

    let strategy = SingleProcessStrategy::new(config(2));
    let summary = strategy
        .run(workload.parse_job_stream(3), Arc::new(workload), handle)
        .await
        .unwrap();

    assert!(summary.completed);
    assert_eq!(sink.records(), 6);
    assert_eq!(summary.metrics.completed_scans, 6);
    assert_eq!(summary.metrics.tasks_parsing, 0);
    assert_eq!(summary.metrics.tasks_scanning, 0);
    assert_eq!(summary.metrics.tasks_idle, 0);
    assert_eq!(summary.metrics.process_count, 1);

    let last = *sink.latest.lock();
    assert_eq!(last.completed_scans, 6);
    assert_eq!(last.tasks_idle + last.tasks_parsing + last.tasks_scanning, 0);
}

#[tokio::test]
async fn test_every_requested_pair_recorded_once() {
    let workload = SyntheticWorkload::new(4).with_latency(Duration::from_millis(1), Duration::from_millis(2));

    // Scanner subsets of varying size
    let jobs: Vec<_> = (0..30u64)
        .map(|id| {
            let indices: Vec<usize> = (0..4).filter(|s| (id as usize + s) % 3 != 0).collect();
            ParseJob::new(TranscriptRef::new(id), indices)
        })
        .collect();
    let expected: usize = jobs.iter().map(ParseJob::scanner_count).sum();

    let sink = Arc::new(CheckingSink::default());
    let handle: SinkHandle<SyntheticWorkload> = sink.clone();
    let scheduler = Arc::new(Scheduler::new(
        config(8).with_prefetch_multiple(0.5),
        stream::iter(jobs.clone()).boxed(),
        Arc::new(workload),
        handle,
    ));

    let summary = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(summary.completed);
    assert_eq!(sink.records(), expected);
    assert_eq!(summary.metrics.completed_scans, expected as u64);
    assert_eq!(sink.overlaps.load(Ordering::SeqCst), 0);

    let seen = sink.seen.lock();
    for job in &jobs {
        for index in &job.scanner_indices {
            let key = (job.transcript.id, format!("scanner_{index}"));
            assert_eq!(seen.get(&key), Some(&1), "missing or duplicate {key:?}");
        }
    }
}

#[tokio::test]
async fn test_empty_source_terminates() {
    let sink = Arc::new(CheckingSink::default());
    let handle: SinkHandle<SyntheticWorkload> = sink.clone();
    let scheduler = Arc::new(Scheduler::new(
        config(4),
        stream::empty().boxed(),
        Arc::new(SyntheticWorkload::new(2)),
        handle,
    ));

    let summary = tokio::time::timeout(Duration::from_secs(5), scheduler.run(CancellationToken::new()))
        .await
        .expect("scheduler did not terminate")
        .unwrap();

    assert!(summary.completed);
    assert_eq!(summary.metrics.completed_scans, 0);
    assert_eq!(sink.records(), 0);
}

#[tokio::test]
async fn test_parse_failure_aborts_run() {
    let workload = SyntheticWorkload::new(2).failing_at(FailureStage::Parse, 2);
    let handle: SinkHandle<SyntheticWorkload> = Arc::new(CheckingSink::default());

    let err = SingleProcessStrategy::new(config(2))
        .run(workload.parse_job_stream(10), Arc::new(workload), handle)
        .await
        .unwrap_err();

    match err {
        ScanError::Parse(e) => assert!(e.to_string().contains("000002")),
        other => panic!("expected parse failure, got {other}"),
    }
}

#[tokio::test]
async fn test_scan_failure_aborts_run() {
    let workload = SyntheticWorkload::new(3).failing_at(FailureStage::Scan, 4);
    let handle: SinkHandle<SyntheticWorkload> = Arc::new(CheckingSink::default());

    let err = SingleProcessStrategy::new(config(4))
        .run(workload.parse_job_stream(10), Arc::new(workload), handle)
        .await
        .unwrap_err();

    assert!(err.is_collaborator_failure());
    assert!(matches!(err, ScanError::Scan(_)));
    assert!(err.to_string().contains("000004"));
}

#[tokio::test]
async fn test_record_failure_aborts_run() {
    let workload = SyntheticWorkload::new(2);
    let handle: SinkHandle<SyntheticWorkload> = Arc::new(CheckingSink::failing_on(1));

    let err = SingleProcessStrategy::new(config(2))
        .run(workload.parse_job_stream(5), Arc::new(workload), handle)
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::Record(_)));
    assert!(err.to_string().contains("disk full"));
}

#[tokio::test]
async fn test_cancellation_reports_incomplete() {
    let workload = SyntheticWorkload::new(2).with_latency(Duration::ZERO, Duration::from_millis(200));
    let sink = Arc::new(CheckingSink::default());
    let handle: SinkHandle<SyntheticWorkload> = sink.clone();

    let cancel = CancellationToken::new();
    let strategy = SingleProcessStrategy::new(config(4)).with_cancellation(cancel.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        strategy.run(workload.parse_job_stream(50), Arc::new(workload), handle),
    )
    .await
    .expect("cancelled run did not return")
    .unwrap();
    canceller.await.unwrap();

    assert!(!summary.completed);
    assert!(sink.records() < 100);
}

#[tokio::test]
async fn test_already_scanned_transcripts_skip_scanning() {
    let workload = SyntheticWorkload::new(2).with_already_scanned([0, 2]);
    let sink = Arc::new(CheckingSink::default());
    let handle: SinkHandle<SyntheticWorkload> = sink.clone();

    let summary = SingleProcessStrategy::new(config(2))
        .run(workload.parse_job_stream(4), Arc::new(workload), handle)
        .await
        .unwrap();

    assert!(summary.completed);
    // Finished reports are recorded like scanned ones
    assert_eq!(sink.records(), 8);
    assert_eq!(summary.metrics.completed_scans, 8);
}

/// Scan functions measuring how many scans run at once under a limit
#[derive(Default)]
struct LimitedScans {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

const LIMIT: usize = 2;

#[async_trait]
impl ScanFunctions for LimitedScans {
    type Transcript = u64;
    type Content = ();
    type Scanner = usize;
    type Report = usize;

    async fn parse(&self, job: ParseJob<u64>) -> anyhow::Result<ParseOutcome<Self>> {
        let content = Arc::new(());
        let jobs = job
            .scanner_indices
            .iter()
            .map(|&scanner| ScannerJob {
                transcript: job.transcript,
                union_transcript: Arc::clone(&content),
                scanner,
                scanner_name: format!("s{scanner}"),
            })
            .collect();
        Ok(ParseOutcome::Jobs(jobs))
    }

    async fn scan(&self, job: ScannerJob<Self>) -> anyhow::Result<Vec<usize>> {
        let limiter = concurrency("integration-limit", LIMIT, false).await?;
        let _permit = limiter.acquire().await?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(vec![job.scanner])
    }
}

struct CountingSink(AtomicUsize);

#[async_trait]
impl ResultSink<u64, usize> for CountingSink {
    async fn record_results(&self, _: &u64, _: &str, results: Vec<usize>) -> anyhow::Result<()> {
        assert_eq!(results.len(), 1);
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_named_concurrency_limit_holds() {
    let functions = Arc::new(LimitedScans::default());
    let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
    let handle: SinkHandle<LimitedScans> = sink.clone();

    let jobs = (0..10u64).map(|t| ParseJob::new(t, 0..3)).collect::<Vec<_>>();
    let scheduler = Arc::new(Scheduler::new(
        config(8),
        stream::iter(jobs).boxed(),
        Arc::clone(&functions),
        handle,
    ));

    let summary = scheduler.run(CancellationToken::new()).await.unwrap();

    assert!(summary.completed);
    assert_eq!(sink.0.load(Ordering::SeqCst), 30);
    assert!(functions.peak.load(Ordering::SeqCst) <= LIMIT);
    assert!(functions.peak.load(Ordering::SeqCst) >= 1);
}
