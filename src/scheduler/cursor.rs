//! Serialized cursor over the parse-job source
//!
//! The caller's stream is not safe for concurrent readers. Advancing it may
//! run caller code that suspends, so the cursor sits behind an async mutex.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

pub struct JobCursor<T> {
    source: Mutex<BoxStream<'static, T>>,
    exhausted: AtomicBool,
    taken: AtomicU64,
}

impl<T> JobCursor<T> {
    pub fn new(source: BoxStream<'static, T>) -> Self {
        Self {
            source: Mutex::new(source),
            exhausted: AtomicBool::new(false),
            taken: AtomicU64::new(0),
        }
    }

    /// Next item, or `None` once the source is exhausted
    ///
    /// Exhaustion is sticky: the stream is never polled again after it
    /// returned `None`.
    pub async fn next(&self) -> Option<T> {
        if self.is_exhausted() {
            return None;
        }

        let mut source = self.source.lock().await;
        if self.is_exhausted() {
            return None;
        }

        match source.next().await {
            Some(item) => {
                self.taken.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            None => {
                self.exhausted.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Items handed out so far
    pub fn taken(&self) -> u64 {
        self.taken.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cursor_exhaustion_is_sticky() {
        let cursor = JobCursor::new(stream::iter(vec![1, 2]).boxed());

        assert_eq!(cursor.next().await, Some(1));
        assert_eq!(cursor.next().await, Some(2));
        assert!(!cursor.is_exhausted());
        assert_eq!(cursor.next().await, None);
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.next().await, None);
        assert_eq!(cursor.taken(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_each_item_once() {
        let cursor = Arc::new(JobCursor::new(stream::iter(0..100).boxed()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cursor = Arc::clone(&cursor);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = cursor.next().await {
                    seen.push(item);
                    tokio::task::yield_now().await;
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
