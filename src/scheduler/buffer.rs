//! Buffer of scanner jobs ready to be scanned
//!
//! Parsers append at the tail, scanners pop from the head. The buffer is not
//! hard-bounded: a parse appends every job it produced, and the action
//! selection rules keep the length near `max_queue`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for the scanner-job buffer
#[derive(Debug, Default)]
pub struct BufferStats {
    /// Total jobs enqueued
    pub enqueued: AtomicU64,

    /// Total jobs dequeued
    pub dequeued: AtomicU64,

    /// Highest observed length
    pub high_water: AtomicU64,
}

/// FIFO of scanner jobs shared by the workers of one scheduler
pub struct ScannerJobQueue<J> {
    jobs: Mutex<VecDeque<J>>,
    capacity: usize,
    stats: BufferStats,
}

impl<J> ScannerJobQueue<J> {
    /// Create a buffer with the given target capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            stats: BufferStats::default(),
        }
    }

    /// Append jobs at the tail
    pub fn extend(&self, jobs: impl IntoIterator<Item = J>) {
        let mut queue = self.jobs.lock();
        let before = queue.len();
        queue.extend(jobs);
        let added = queue.len() - before;
        let len = queue.len() as u64;
        drop(queue);

        self.stats.enqueued.fetch_add(added as u64, Ordering::Relaxed);
        self.stats.high_water.fetch_max(len, Ordering::Relaxed);
    }

    /// Take the job at the head
    pub fn pop(&self) -> Option<J> {
        let job = self.jobs.lock().pop_front();
        if job.is_some() {
            self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        job
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Target capacity (`max_queue`)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = ScannerJobQueue::new(4);
        queue.extend(["a", "b"]);
        queue.extend(["c"]);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("c"));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_may_exceed_capacity() {
        let queue = ScannerJobQueue::new(2);
        queue.extend(0..5);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn test_buffer_stats() {
        let queue = ScannerJobQueue::new(10);
        queue.extend(0..3);
        queue.pop();
        queue.extend(0..1);

        let stats = queue.stats();
        assert_eq!(stats.enqueued.load(Ordering::Relaxed), 4);
        assert_eq!(stats.dequeued.load(Ordering::Relaxed), 1);
        assert_eq!(stats.high_water.load(Ordering::Relaxed), 3);
    }
}
