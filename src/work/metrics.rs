//! Live scan metrics
//!
//! [`ScanMetrics`] is the flat snapshot handed to `update_metrics`. It is
//! component-wise summable so per-process snapshots reduce to one total.
//! [`MetricsTracker`] holds the live atomics a scheduler updates through
//! RAII activity guards.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Minimum interval between two resource samples
pub const RESOURCE_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Snapshot of scan activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMetrics {
    /// Worker processes contributing to this snapshot
    pub process_count: u64,

    /// Live worker tasks
    pub task_count: u64,

    /// Tasks inside the wait action
    pub tasks_idle: u64,

    /// Tasks inside the parse action
    pub tasks_parsing: u64,

    /// Tasks inside the scan action
    pub tasks_scanning: u64,

    /// Scanner jobs waiting in the buffer
    pub buffered_scanner_jobs: u64,

    /// Scanner jobs fully scanned and recorded
    pub completed_scans: u64,

    /// CPU use in percent of one core
    pub cpu_use: u64,

    /// Peak resident memory in bytes
    pub memory_usage: u64,
}

impl ScanMetrics {
    /// Tasks doing parse or scan work
    pub fn busy_tasks(&self) -> u64 {
        self.tasks_parsing + self.tasks_scanning
    }
}

impl Add for ScanMetrics {
    type Output = ScanMetrics;

    fn add(mut self, rhs: ScanMetrics) -> ScanMetrics {
        self += rhs;
        self
    }
}

impl AddAssign for ScanMetrics {
    fn add_assign(&mut self, rhs: ScanMetrics) {
        self.process_count += rhs.process_count;
        self.task_count += rhs.task_count;
        self.tasks_idle += rhs.tasks_idle;
        self.tasks_parsing += rhs.tasks_parsing;
        self.tasks_scanning += rhs.tasks_scanning;
        self.buffered_scanner_jobs += rhs.buffered_scanner_jobs;
        self.completed_scans += rhs.completed_scans;
        self.cpu_use += rhs.cpu_use;
        self.memory_usage += rhs.memory_usage;
    }
}

impl Sum for ScanMetrics {
    fn sum<I: Iterator<Item = ScanMetrics>>(iter: I) -> ScanMetrics {
        iter.fold(ScanMetrics::default(), Add::add)
    }
}

impl<'a> Sum<&'a ScanMetrics> for ScanMetrics {
    fn sum<I: Iterator<Item = &'a ScanMetrics>>(iter: I) -> ScanMetrics {
        iter.copied().sum()
    }
}

/// Component-wise sum of a set of snapshots
pub fn sum_metrics<'a>(metrics: impl IntoIterator<Item = &'a ScanMetrics>) -> ScanMetrics {
    metrics.into_iter().sum()
}

/// Live counters shared by the workers of one scheduler
#[derive(Debug, Default)]
pub struct MetricsTracker {
    task_count: AtomicU64,
    tasks_idle: AtomicU64,
    tasks_parsing: AtomicU64,
    tasks_scanning: AtomicU64,
    completed_scans: AtomicU64,
    resources: ResourceSampler,
}

impl MetricsTracker {
    /// Create a tracker for `task_count` live workers
    pub fn new(task_count: usize) -> Self {
        Self {
            task_count: AtomicU64::new(task_count as u64),
            ..Default::default()
        }
    }

    /// Enter the parse action
    pub fn parsing(&self) -> ActivityGuard<'_> {
        ActivityGuard::new(&self.tasks_parsing)
    }

    /// Enter the scan action
    pub fn scanning(&self) -> ActivityGuard<'_> {
        ActivityGuard::new(&self.tasks_scanning)
    }

    /// Enter the wait action
    pub fn idling(&self) -> ActivityGuard<'_> {
        ActivityGuard::new(&self.tasks_idle)
    }

    pub fn record_completed(&self, count: u64) {
        self.completed_scans.fetch_add(count, Ordering::Relaxed);
    }

    /// A worker left its loop; returns the remaining live count
    pub fn worker_exited(&self) -> u64 {
        self.task_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub fn live_tasks(&self) -> u64 {
        self.task_count.load(Ordering::SeqCst)
    }

    pub fn tasks_idle(&self) -> u64 {
        self.tasks_idle.load(Ordering::SeqCst)
    }

    pub fn tasks_parsing(&self) -> u64 {
        self.tasks_parsing.load(Ordering::SeqCst)
    }

    pub fn completed_scans(&self) -> u64 {
        self.completed_scans.load(Ordering::Relaxed)
    }

    /// Build a snapshot for one process
    pub fn snapshot(&self, buffered_scanner_jobs: usize) -> ScanMetrics {
        let (cpu_use, memory_usage) = self.resources.sample();
        ScanMetrics {
            process_count: 1,
            task_count: self.live_tasks(),
            tasks_idle: self.tasks_idle(),
            tasks_parsing: self.tasks_parsing(),
            tasks_scanning: self.tasks_scanning.load(Ordering::SeqCst),
            buffered_scanner_jobs: buffered_scanner_jobs as u64,
            completed_scans: self.completed_scans(),
            cpu_use,
            memory_usage,
        }
    }
}

/// RAII guard counting a worker inside an action
pub struct ActivityGuard<'a> {
    counter: &'a AtomicU64,
}

impl<'a> ActivityGuard<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct SamplerState {
    at: Instant,
    cpu_time: Duration,
    cpu_use: u64,
    memory_usage: u64,
}

/// Throttled `getrusage` reader for CPU and memory figures
#[derive(Debug)]
pub struct ResourceSampler {
    interval: Duration,
    state: Mutex<Option<SamplerState>>,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new(RESOURCE_SAMPLE_INTERVAL)
    }
}

impl ResourceSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(None),
        }
    }

    /// Returns `(cpu_use, memory_usage)`, re-reading at most once per interval
    pub fn sample(&self) -> (u64, u64) {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(prev) = state.as_ref() {
            if now.duration_since(prev.at) < self.interval {
                return (prev.cpu_use, prev.memory_usage);
            }
        }

        let Some((cpu_time, memory_usage)) = read_rusage() else {
            return state
                .as_ref()
                .map(|s| (s.cpu_use, s.memory_usage))
                .unwrap_or_default();
        };

        let cpu_use = match state.as_ref() {
            Some(prev) => {
                let wall = now.duration_since(prev.at).as_secs_f64();
                let used = cpu_time.saturating_sub(prev.cpu_time).as_secs_f64();
                if wall > 0.0 {
                    (used / wall * 100.0).round() as u64
                } else {
                    prev.cpu_use
                }
            }
            None => 0,
        };

        *state = Some(SamplerState {
            at: now,
            cpu_time,
            cpu_use,
            memory_usage,
        });
        (cpu_use, memory_usage)
    }
}

/// User+system CPU time and peak RSS in bytes for this process
fn read_rusage() -> Option<(Duration, u64)> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided struct
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: rc == 0 means the struct was filled in
    let usage = unsafe { usage.assume_init() };

    let timeval = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    let cpu = timeval(usage.ru_utime) + timeval(usage.ru_stime);

    // ru_maxrss is bytes on macOS, kilobytes elsewhere
    #[cfg(target_os = "macos")]
    let rss = usage.ru_maxrss.max(0) as u64;
    #[cfg(not(target_os = "macos"))]
    let rss = usage.ru_maxrss.max(0) as u64 * 1024;

    Some((cpu, rss))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: u64) -> ScanMetrics {
        ScanMetrics {
            process_count: 1,
            task_count: seed + 3,
            tasks_idle: seed % 2,
            tasks_parsing: 1,
            tasks_scanning: seed,
            buffered_scanner_jobs: seed * 2,
            completed_scans: seed * 10,
            cpu_use: 50 + seed,
            memory_usage: 1024 * seed,
        }
    }

    #[test]
    fn test_sum_is_partition_independent() {
        let all: Vec<_> = (0..7).map(sample).collect();
        let total = sum_metrics(&all);

        let (left, right) = all.split_at(3);
        assert_eq!(sum_metrics(left) + sum_metrics(right), total);

        let mut reversed = all.clone();
        reversed.reverse();
        assert_eq!(sum_metrics(&reversed), total);

        let mut acc = ScanMetrics::default();
        for m in &all {
            acc += *m;
        }
        assert_eq!(acc, total);
        assert_eq!(total.process_count, 7);
        assert_eq!(total.completed_scans, 210);
    }

    #[test]
    fn test_default_is_identity() {
        let m = sample(4);
        assert_eq!(m + ScanMetrics::default(), m);
        assert_eq!(sum_metrics(std::iter::empty()), ScanMetrics::default());
    }

    #[test]
    fn test_activity_guards() {
        let tracker = MetricsTracker::new(4);
        {
            let _p = tracker.parsing();
            let _s = tracker.scanning();
            let _i = tracker.idling();
            let snap = tracker.snapshot(3);
            assert_eq!(snap.tasks_parsing, 1);
            assert_eq!(snap.tasks_scanning, 1);
            assert_eq!(snap.tasks_idle, 1);
            assert_eq!(snap.buffered_scanner_jobs, 3);
            assert_eq!(snap.busy_tasks(), 2);
        }
        let snap = tracker.snapshot(0);
        assert_eq!(snap.busy_tasks(), 0);
        assert_eq!(snap.tasks_idle, 0);
        assert_eq!(snap.task_count, 4);
    }

    #[test]
    fn test_worker_exit_decrements_live_count() {
        let tracker = MetricsTracker::new(2);
        assert_eq!(tracker.worker_exited(), 1);
        assert_eq!(tracker.worker_exited(), 0);
        assert_eq!(tracker.live_tasks(), 0);
    }

    #[test]
    fn test_resource_sampler_reports_memory() {
        let sampler = ResourceSampler::new(Duration::from_secs(60));
        let (_, memory) = sampler.sample();
        assert!(memory > 0);

        // Throttled: second read returns the cached figures
        assert_eq!(sampler.sample(), sampler.sample());
    }
}
