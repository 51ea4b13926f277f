//! Phased teardown of a multi-process run
//!
//! The sequence runs at most once per run, on its own task, so a caller
//! being cancelled mid-way cannot interrupt it. Every caller of
//! [`ShutdownSequence::run`] waits for that single execution and gets the
//! same [`ShutdownReport`].
//!
//! Phases:
//! 1. broadcast `Shutdown` to every worker
//! 2. wait for workers to exit (grace period)
//! 3. SIGTERM survivors and wait again
//! 4. kill whatever is left
//! 5. inject the shutdown sentinel into the upstream queue
//! 6. drain upstream leftovers, up to a bound
//! 7. close downstream links and the upstream receiver
//! 8. settle
//! 9. abort pipe tasks still running

use super::context::{IpcContext, UpstreamEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The process-side operations teardown needs
#[async_trait]
pub trait WorkerFleet: Send + Sync {
    /// Ask every worker to stop; returns how many links accepted the message
    fn signal_shutdown(&self) -> usize;

    /// Wait up to `timeout` for workers to exit; returns the survivors
    async fn join(&self, timeout: Duration) -> usize;

    /// Send SIGTERM to running workers; returns how many were signalled
    async fn terminate(&self) -> usize;

    /// Force-kill running workers; returns how many were killed
    async fn kill(&self) -> usize;

    /// Drop every downstream link
    fn close_links(&self);

    /// Abort pipe tasks; returns how many were still running
    fn abort_tasks(&self) -> usize;
}

/// Timeouts and bounds of the teardown phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTimeouts {
    /// Phase 2 wait
    pub grace: Duration,

    /// Phase 3 wait
    pub terminate: Duration,

    /// Phase 6 wait for the upstream receiver
    pub drain_wait: Duration,

    /// Phase 6 bound on drained events
    pub drain_limit: usize,

    /// Phase 8 sleep
    pub settle: Duration,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            terminate: Duration::from_secs(1),
            drain_wait: Duration::from_secs(1),
            drain_limit: 10_000,
            settle: Duration::from_millis(100),
        }
    }
}

/// What the teardown did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that received the shutdown message
    pub signalled: usize,

    /// Workers still running after the grace period
    pub survived_grace: usize,

    /// Workers sent SIGTERM
    pub terminated: usize,

    /// Workers force-killed
    pub killed: usize,

    /// Upstream events discarded while draining
    pub drained: usize,

    pub drain_limit_hit: bool,

    /// Pipe tasks aborted
    pub aborted_tasks: usize,
}

/// Idempotent teardown for one run
pub struct ShutdownSequence<T, R> {
    context: Arc<IpcContext<T, R>>,
    fleet: Arc<dyn WorkerFleet>,
    timeouts: ShutdownTimeouts,
    started: AtomicBool,
    report: watch::Sender<Option<ShutdownReport>>,
}

impl<T, R> ShutdownSequence<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub fn new(
        context: Arc<IpcContext<T, R>>,
        fleet: Arc<dyn WorkerFleet>,
        timeouts: ShutdownTimeouts,
    ) -> Arc<Self> {
        let (report, _) = watch::channel(None);
        Arc::new(Self {
            context,
            fleet,
            timeouts,
            started: AtomicBool::new(false),
            report,
        })
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run the teardown, or wait for the run already in progress
    pub async fn run(self: &Arc<Self>) -> ShutdownReport {
        let mut report_rx = self.report.subscribe();

        if !self.started.swap(true, Ordering::SeqCst) {
            let sequence = Arc::clone(self);
            tokio::spawn(async move {
                let report = sequence.execute().await;
                sequence.report.send_replace(Some(report));
            });
        }

        let report = match report_rx.wait_for(Option::is_some).await {
            Ok(report) => (*report).unwrap_or_default(),
            Err(_) => ShutdownReport::default(),
        };
        report
    }

    async fn execute(&self) -> ShutdownReport {
        let t = self.timeouts;
        let mut report = ShutdownReport::default();

        info!("Shutting down worker processes");
        self.context.begin_shutdown();

        report.signalled = self.fleet.signal_shutdown();

        report.survived_grace = self.fleet.join(t.grace).await;
        if report.survived_grace > 0 {
            warn!(
                survivors = report.survived_grace,
                "Workers still running after grace period, sending SIGTERM"
            );
            report.terminated = self.fleet.terminate().await;
            if self.fleet.join(t.terminate).await > 0 {
                report.killed = self.fleet.kill().await;
                warn!(killed = report.killed, "Force-killed worker processes");
            }
        }

        let _ = self.context.upstream_sender().send(UpstreamEvent::Shutdown);

        match tokio::time::timeout(t.drain_wait, self.context.upstream_receiver().lock()).await {
            Ok(mut receiver) => {
                while receiver.try_recv().is_ok() {
                    report.drained += 1;
                    if report.drained >= t.drain_limit {
                        report.drain_limit_hit = !receiver.is_empty();
                        break;
                    }
                }
                if report.drain_limit_hit {
                    warn!(
                        limit = t.drain_limit,
                        "Upstream drain limit reached, discarding remaining events"
                    );
                }
                receiver.close();
            }
            Err(_) => warn!("Upstream receiver still busy, skipping drain"),
        }

        self.fleet.close_links();

        tokio::time::sleep(t.settle).await;

        report.aborted_tasks = self.fleet.abort_tasks();

        debug!(?report, "Shutdown complete");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeFleet {
        stubborn: bool,
        signals: AtomicUsize,
        kills: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl WorkerFleet for FakeFleet {
        fn signal_shutdown(&self) -> usize {
            self.signals.fetch_add(1, Ordering::SeqCst);
            2
        }

        async fn join(&self, timeout: Duration) -> usize {
            if self.stubborn {
                tokio::time::sleep(timeout).await;
                2
            } else {
                0
            }
        }

        async fn terminate(&self) -> usize {
            2
        }

        async fn kill(&self) -> usize {
            self.kills.fetch_add(1, Ordering::SeqCst);
            2
        }

        fn close_links(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn abort_tasks(&self) -> usize {
            0
        }
    }

    fn fast() -> ShutdownTimeouts {
        ShutdownTimeouts {
            grace: Duration::from_millis(20),
            terminate: Duration::from_millis(20),
            drain_wait: Duration::from_millis(50),
            drain_limit: 3,
            settle: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let (ctx, _jobs) = IpcContext::<u32, u32>::new(2, 1, 4, Diagnostics::disabled());
        let fleet = Arc::new(FakeFleet::default());
        let sequence = ShutdownSequence::new(Arc::clone(&ctx), fleet.clone(), fast());
        assert!(!sequence.has_started());

        let (a, b, c) = tokio::join!(sequence.run(), sequence.run(), sequence.run());
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.signalled, 2);
        assert!(sequence.has_started());

        let again = sequence.run().await;
        assert_eq!(again, a);
        assert_eq!(fleet.signals.load(Ordering::SeqCst), 1);
        assert_eq!(fleet.closes.load(Ordering::SeqCst), 1);
        assert!(ctx.is_shutting_down());
    }

    #[tokio::test]
    async fn test_escalates_to_kill() {
        let (ctx, _jobs) = IpcContext::<u32, u32>::new(2, 1, 4, Diagnostics::disabled());
        let fleet = Arc::new(FakeFleet {
            stubborn: true,
            ..Default::default()
        });
        let report = ShutdownSequence::new(ctx, fleet.clone(), fast()).run().await;

        assert_eq!(report.survived_grace, 2);
        assert_eq!(report.terminated, 2);
        assert_eq!(report.killed, 2);
        assert_eq!(fleet.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_is_bounded() {
        let (ctx, _jobs) = IpcContext::<u32, u32>::new(1, 1, 4, Diagnostics::disabled());
        let upstream = ctx.upstream_sender();
        for worker in 0..10 {
            upstream.send(UpstreamEvent::Disconnected { worker }).unwrap();
        }

        let fleet = Arc::new(FakeFleet::default());
        let report = ShutdownSequence::new(Arc::clone(&ctx), fleet, fast()).run().await;

        assert_eq!(report.drained, 3);
        assert!(report.drain_limit_hit);

        // Receiver is closed after the drain
        assert!(upstream.send(UpstreamEvent::Shutdown).is_err());
    }

    #[tokio::test]
    async fn test_drain_skipped_while_collector_holds_receiver() {
        let (ctx, _jobs) = IpcContext::<u32, u32>::new(1, 1, 4, Diagnostics::disabled());
        let _collector = ctx.upstream_receiver().lock().await;

        let fleet = Arc::new(FakeFleet::default());
        let report = ShutdownSequence::new(Arc::clone(&ctx), fleet, fast()).run().await;
        assert_eq!(report.drained, 0);
        assert!(!report.drain_limit_hit);
    }
}
