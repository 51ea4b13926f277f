//! Opt-in scheduling diagnostics
//!
//! When enabled, schedulers and the coordinator trace each decision with the
//! time elapsed since the run started. The start timestamp is wall-clock so
//! worker processes report against the coordinator's start.

use chrono::{DateTime, Utc};
use tracing::info;

/// Diagnostics gate shared by every actor of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    enabled: bool,
    started_at: DateTime<Utc>,
}

impl Diagnostics {
    pub fn new(enabled: bool) -> Self {
        Self::since(enabled, Utc::now())
    }

    /// Diagnostics for a run that started at `started_at`
    pub fn since(enabled: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            enabled,
            started_at,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Seconds since the run started
    pub fn elapsed_secs(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Emit a diagnostic line; `message` is only built when enabled
    pub fn print(&self, actor: &str, message: impl FnOnce() -> String) {
        if !self.enabled {
            return;
        }
        info!(
            target: "transcript_scan::diagnostics",
            actor,
            elapsed = %format!("{:.3}s", self.elapsed_secs()),
            "{}",
            message()
        );
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::disabled()
    }
}
