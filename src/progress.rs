//! Progress reporting for scan runs
//!
//! Provides real-time progress display using indicatif progress bars.

use crate::strategy::ScanSummary;
use crate::work::ScanMetrics;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner showing the latest metrics of a run
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        let spinner = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(spinner);
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, metrics: &ScanMetrics) {
        let msg = format!(
            "Scans: {} | Tasks: {} parsing, {} scanning, {} idle of {} | Buffered: {} | CPU: {}% | Mem: {}",
            format_number(metrics.completed_scans),
            metrics.tasks_parsing,
            metrics.tasks_scanning,
            metrics.tasks_idle,
            metrics.task_count,
            format_number(metrics.buffered_scanner_jobs),
            metrics.cpu_use,
            format_size(metrics.memory_usage, BINARY),
        );

        self.bar.set_message(msg);
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Print a header at the start of the run
pub fn print_header(transcripts: u64, scanners: usize, tasks: usize, processes: usize, output: &str) {
    println!();
    println!(
        "{} {}",
        style("transcript-scan").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {} × {} scanners",
        style("Transcripts:").bold(),
        format_number(transcripts),
        scanners
    );
    if processes > 1 {
        println!(
            "  {} {} across {} processes",
            style("Tasks:").bold(),
            tasks,
            processes
        );
    } else {
        println!("  {} {}", style("Tasks:").bold(), tasks);
    }
    println!("  {} {}", style("Output:").bold(), output);
    println!();
}

/// Print a summary of the run
pub fn print_summary(summary: &ScanSummary, records: u64, output: &str) {
    let metrics = &summary.metrics;

    println!();
    if summary.completed {
        println!("{}", style("Scan Complete").green().bold());
    } else {
        println!("{}", style("Scan Interrupted").yellow().bold());
    }
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Scans:").bold(),
        format_number(metrics.completed_scans)
    );
    println!("  {} {}", style("Records:").bold(), format_number(records));
    println!(
        "  {} {:.1}s ({:.0} scans/sec)",
        style("Duration:").bold(),
        summary.duration.as_secs_f64(),
        summary.scans_per_second()
    );
    if metrics.memory_usage > 0 {
        println!(
            "  {} {}",
            style("Peak Memory:").bold(),
            format_size(metrics.memory_usage, BINARY)
        );
    }
    println!("  {} {}", style("Output:").bold(), output);
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }
}
