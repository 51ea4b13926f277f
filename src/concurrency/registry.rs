//! Named semaphore registry and permit ledger
//!
//! The registry maps a semaphore name to a tokio semaphore. In a single
//! process it backs [`concurrency`](super::concurrency) directly; in a
//! multi-process run the coordinator owns it and serves worker requests,
//! tracking each remote permit in a [`PermitLedger`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// A named semaphore owned by a registry
#[derive(Debug)]
pub struct LocalSemaphore {
    name: String,
    concurrency: usize,
    visible: bool,
    semaphore: Arc<Semaphore>,
}

impl LocalSemaphore {
    fn new(name: &str, concurrency: usize, visible: bool) -> Self {
        Self {
            name: name.to_string(),
            concurrency,
            visible,
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a permit that is released when dropped
    pub async fn acquire_owned(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.semaphore).acquire_owned().await
    }
}

/// Status line for one registered semaphore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreStatus {
    pub name: String,
    pub concurrency: usize,
    pub visible: bool,
    pub available: usize,
}

/// Lazily populated map of named semaphores
#[derive(Debug, Default)]
pub struct SemaphoreRegistry {
    semaphores: Mutex<HashMap<String, Arc<LocalSemaphore>>>,
}

impl SemaphoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the semaphore called `name`, creating it if absent
    ///
    /// The first creation wins: later calls reuse the existing semaphore
    /// whatever limit they ask for. The flag reports whether this call
    /// created it.
    pub fn get_or_create(
        &self,
        name: &str,
        concurrency: usize,
        visible: bool,
    ) -> (Arc<LocalSemaphore>, bool) {
        let mut semaphores = self.semaphores.lock();
        if let Some(existing) = semaphores.get(name) {
            return (Arc::clone(existing), false);
        }

        let semaphore = Arc::new(LocalSemaphore::new(name, concurrency, visible));
        semaphores.insert(name.to_string(), Arc::clone(&semaphore));
        drop(semaphores);

        if visible {
            info!(semaphore = name, concurrency, "Created concurrency limit");
        }
        (semaphore, true)
    }

    pub fn get(&self, name: &str) -> Option<Arc<LocalSemaphore>> {
        self.semaphores.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.semaphores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.semaphores.lock().is_empty()
    }

    /// Status of every semaphore, sorted by name
    pub fn snapshot(&self) -> Vec<SemaphoreStatus> {
        let mut status: Vec<_> = self
            .semaphores
            .lock()
            .values()
            .map(|s| SemaphoreStatus {
                name: s.name.clone(),
                concurrency: s.concurrency,
                visible: s.visible,
                available: s.available_permits(),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }
}

/// Key of a remote permit: worker process index and the worker's ticket
pub type PermitKey = (usize, u64);

enum PermitState {
    /// Requested, not granted yet
    Pending,
    /// Granted and held by the worker
    Held(OwnedSemaphorePermit),
    /// Released before the grant arrived
    Released,
}

/// Coordinator-side record of permits requested by worker processes
#[derive(Default)]
pub struct PermitLedger {
    entries: Mutex<HashMap<PermitKey, PermitState>>,
}

impl PermitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending acquire
    pub fn request(&self, key: PermitKey) {
        self.entries.lock().insert(key, PermitState::Pending);
    }

    /// Hand a permit to a pending request
    ///
    /// Returns false (and drops the permit) when the request was released
    /// or cleared in the meantime; the worker must not be told about it.
    pub fn grant(&self, key: PermitKey, permit: OwnedSemaphorePermit) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(PermitState::Pending) => {
                entries.insert(key, PermitState::Held(permit));
                true
            }
            Some(PermitState::Released) => {
                entries.remove(&key);
                false
            }
            Some(PermitState::Held(_)) | None => false,
        }
    }

    /// Release a permit, or cancel a request that was not granted yet
    pub fn release(&self, key: PermitKey) {
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(PermitState::Pending) => {
                entries.insert(key, PermitState::Released);
            }
            Some(PermitState::Held(_)) => {
                entries.remove(&key);
            }
            Some(PermitState::Released) | None => {}
        }
    }

    /// Drop everything a worker holds or waits for; returns the entry count
    pub fn clear_worker(&self, worker: usize) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(w, _), _| *w != worker);
        before - entries.len()
    }

    /// Permits currently held by workers
    pub fn held(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|s| matches!(s, PermitState::Held(_)))
            .count()
    }

    /// Requests waiting for a grant
    pub fn pending(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|s| matches!(s, PermitState::Pending))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_creation_wins() {
        let registry = SemaphoreRegistry::new();
        let (first, created) = registry.get_or_create("model", 2, true);
        assert!(created);

        let (second, created) = registry.get_or_create("model", 8, false);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.concurrency(), 2);
        assert!(second.visible());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_reports_available_permits() {
        let registry = SemaphoreRegistry::new();
        let (model, _) = registry.get_or_create("model", 3, true);
        registry.get_or_create("grader", 1, false);

        let _permit = model.acquire_owned().await.unwrap();
        let status = registry.snapshot();

        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "grader");
        assert_eq!(status[0].available, 1);
        assert_eq!(status[1].name, "model");
        assert_eq!(status[1].available, 2);
        assert!(!status[0].visible);
    }

    #[tokio::test]
    async fn test_ledger_grant_and_release() {
        let registry = SemaphoreRegistry::new();
        let (sem, _) = registry.get_or_create("model", 1, false);
        let ledger = PermitLedger::new();

        ledger.request((0, 1));
        let permit = sem.acquire_owned().await.unwrap();
        assert!(ledger.grant((0, 1), permit));
        assert_eq!(ledger.held(), 1);
        assert_eq!(sem.available_permits(), 0);

        ledger.release((0, 1));
        assert_eq!(ledger.held(), 0);
        assert_eq!(sem.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_release_before_grant_cancels() {
        let registry = SemaphoreRegistry::new();
        let (sem, _) = registry.get_or_create("model", 1, false);
        let ledger = PermitLedger::new();

        ledger.request((2, 7));
        ledger.release((2, 7));
        assert_eq!(ledger.pending(), 0);

        let permit = sem.acquire_owned().await.unwrap();
        assert!(!ledger.grant((2, 7), permit));
        assert_eq!(sem.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_clear_worker_returns_permits() {
        let registry = SemaphoreRegistry::new();
        let (sem, _) = registry.get_or_create("model", 2, false);
        let ledger = PermitLedger::new();

        ledger.request((0, 1));
        ledger.request((1, 1));
        ledger.request((1, 2));
        assert!(ledger.grant((1, 1), sem.acquire_owned().await.unwrap()));
        assert!(ledger.grant((0, 1), sem.acquire_owned().await.unwrap()));
        assert_eq!(sem.available_permits(), 0);

        assert_eq!(ledger.clear_worker(1), 2);
        assert_eq!(sem.available_permits(), 1);
        assert_eq!(ledger.held(), 1);
    }
}
