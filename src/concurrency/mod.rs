//! Named concurrency limits for scanner code
//!
//! Scanners call [`concurrency`] to obtain a limiter shared by every worker
//! of the run. A process-wide [`SemaphoreFactory`] decides where the limit
//! lives: the default [`LocalSemaphoreFactory`] keeps it in an in-process
//! [`SemaphoreRegistry`]; worker processes install a factory that forwards
//! create/acquire/release to the coordinator so the limit holds across
//! processes.

pub mod registry;

pub use registry::{LocalSemaphore, PermitLedger, SemaphoreRegistry, SemaphoreStatus};

use crate::error::{IpcError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::{Arc, LazyLock};

/// Held permit; the slot is returned when this is dropped
pub struct SemaphoreGuard {
    _permit: Box<dyn Any + Send + Sync>,
}

impl SemaphoreGuard {
    pub fn new(permit: impl Any + Send + Sync) -> Self {
        Self {
            _permit: Box::new(permit),
        }
    }
}

/// A concurrency limiter usable from scanner code
#[async_trait]
pub trait ConcurrencySemaphore: Send + Sync {
    fn name(&self) -> &str;

    /// Limit fixed by whoever created the semaphore first
    fn concurrency(&self) -> usize;

    /// Whether the semaphore shows up in status output
    fn visible(&self) -> bool;

    /// Wait for a permit
    async fn acquire(&self) -> Result<SemaphoreGuard>;
}

/// Resolves semaphore names to limiters
#[async_trait]
pub trait SemaphoreFactory: Send + Sync {
    async fn get_or_create(
        &self,
        name: &str,
        concurrency: usize,
        visible: bool,
    ) -> Result<Arc<dyn ConcurrencySemaphore>>;
}

#[async_trait]
impl ConcurrencySemaphore for LocalSemaphore {
    fn name(&self) -> &str {
        LocalSemaphore::name(self)
    }

    fn concurrency(&self) -> usize {
        LocalSemaphore::concurrency(self)
    }

    fn visible(&self) -> bool {
        LocalSemaphore::visible(self)
    }

    async fn acquire(&self) -> Result<SemaphoreGuard> {
        let permit = self.acquire_owned().await.map_err(|_| IpcError::Semaphore {
            name: self.name().to_string(),
            reason: "semaphore closed".to_string(),
        })?;
        Ok(SemaphoreGuard::new(permit))
    }
}

/// Factory backed by an in-process registry
#[derive(Debug, Default, Clone)]
pub struct LocalSemaphoreFactory {
    registry: Arc<SemaphoreRegistry>,
}

impl LocalSemaphoreFactory {
    pub fn new(registry: Arc<SemaphoreRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SemaphoreRegistry> {
        &self.registry
    }
}

#[async_trait]
impl SemaphoreFactory for LocalSemaphoreFactory {
    async fn get_or_create(
        &self,
        name: &str,
        concurrency: usize,
        visible: bool,
    ) -> Result<Arc<dyn ConcurrencySemaphore>> {
        let (semaphore, _) = self.registry.get_or_create(name, concurrency, visible);
        Ok(semaphore as Arc<dyn ConcurrencySemaphore>)
    }
}

static FACTORY: LazyLock<RwLock<Arc<dyn SemaphoreFactory>>> =
    LazyLock::new(|| RwLock::new(Arc::new(LocalSemaphoreFactory::default())));

/// Replace the process-wide factory, returning the previous one
pub fn install_factory(factory: Arc<dyn SemaphoreFactory>) -> Arc<dyn SemaphoreFactory> {
    std::mem::replace(&mut *FACTORY.write(), factory)
}

/// The process-wide factory
pub fn current_factory() -> Arc<dyn SemaphoreFactory> {
    Arc::clone(&FACTORY.read())
}

/// Get or create the limiter called `name`
///
/// The first caller to name a semaphore fixes its limit and visibility for
/// the rest of the run.
pub async fn concurrency(
    name: &str,
    concurrency: usize,
    visible: bool,
) -> Result<Arc<dyn ConcurrencySemaphore>> {
    current_factory()
        .get_or_create(name, concurrency, visible)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_limit_is_enforced() {
        let factory = LocalSemaphoreFactory::default();
        let limiter = factory.get_or_create("model", 2, false).await.unwrap();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = limiter.acquire().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(factory.registry().snapshot()[0].available, 2);
    }

    #[tokio::test]
    async fn test_default_factory_reuses_name() {
        let a = concurrency("default-factory-test", 3, false).await.unwrap();
        let b = concurrency("default-factory-test", 5, true).await.unwrap();
        assert_eq!(a.concurrency(), 3);
        assert_eq!(b.concurrency(), 3);
        assert_eq!(b.name(), "default-factory-test");
    }
}
