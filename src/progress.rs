//! Progress reporting for the import pipeline
//!
//! Provides real-time progress display using indicatif progress bars.

use crate::pipeline::{ImportProgress, ImportResult};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter that displays pipeline status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        if let Ok(template) = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            bar.set_style(template.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &ImportProgress) {
        let msg = format!(
            "Stage: {} | Units: {} | Rate: {:.0}/s | Deferred: {} | Resolved: {} | Queue: {} | Workers: {}/{}",
            progress.stage,
            format_number(progress.units),
            progress.units_per_second(),
            format_number(progress.deferred_links),
            format_number(progress.resolved_links),
            progress.queue_len,
            progress.active_workers,
            progress.pool_size,
        );

        self.bar.set_message(msg);
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
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
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a summary of the pipeline results
pub fn print_summary(result: &ImportResult) {
    let duration_secs = result.duration.as_secs_f64();
    let rate = if duration_secs > 0.0 {
        result.units as f64 / duration_secs
    } else {
        0.0
    };

    let title = if result.completed {
        style("Import Complete").green().bold()
    } else {
        style("Import Interrupted").yellow().bold()
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Units:").bold(), format_number(result.units));
    println!("  {} {}", style("Objects:").bold(), format_number(result.objects));
    println!(
        "  {} {} local, {} deferred",
        style("Xlinks:").bold(),
        format_number(result.local_xlinks),
        format_number(result.deferred_links)
    );
    println!(
        "  {} {} resolved, {} missing",
        style("Deferred:").bold(),
        format_number(result.resolved_links),
        format_number(result.missing_links)
    );
    println!(
        "  {} {}",
        style("Textured rings:").bold(),
        format_number(result.textured_rings)
    );
    println!(
        "  {} {} (largest pool {})",
        style("Cache drained:").bold(),
        format_number(result.drained),
        result.largest_pool_size
    );
    println!(
        "  {} {:.1}s ({:.0} units/sec)",
        style("Duration:").bold(),
        duration_secs,
        rate
    );
    if result.circular_units > 0 {
        println!(
            "  {} {}",
            style("Circular:").yellow().bold(),
            format_number(result.circular_units)
        );
    }
    if result.failed > 0 {
        println!(
            "  {} {}",
            style("Failed:").red().bold(),
            format_number(result.failed)
        );
    }
    println!();
}

/// Print a header at the start of the run
pub fn print_header(units: usize, core_workers: usize, max_workers: usize, cache: &str) {
    println!();
    println!(
        "{} {}",
        style("refstream").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Units:").bold(), format_number(units as u64));
    println!(
        "  {} {}..{}",
        style("Workers:").bold(),
        core_workers,
        max_workers
    );
    println!("  {} {}", style("Cache:").bold(), cache);
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
