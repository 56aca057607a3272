//! Terminal progress for a single upload or download
//!
//! A spinner until the agent reports a size, then a byte bar. Driven from
//! transfer-progress callbacks, so it can be shared with the event observer.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::events::{Direction, TransferProgress};

pub struct TransferDisplay {
    bar: ProgressBar,
    start_time: Instant,
}

impl TransferDisplay {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_message(label.to_string());
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    /// No terminal output; for commands without a transfer
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            start_time: Instant::now(),
        }
    }

    pub fn update(&self, p: &TransferProgress) {
        if p.total_bytes > 0 && self.bar.length() != Some(p.total_bytes) {
            self.bar.set_length(p.total_bytes);
            self.bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{bar:30.green/white}] {bytes}/{total_bytes} ({bytes_per_sec})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
        }
        let verb = match p.direction {
            Direction::Upload => "Uploading",
            Direction::Download => "Downloading",
        };
        self.bar
            .set_message(format!("{} {}", verb.with(Color::Green).bold(), p.file));
        self.bar.set_position(p.bytes_transferred);
    }

    /// Print a line above the bar without tearing it
    pub fn println(&self, line: &str) {
        self.bar.suspend(|| eprintln!("{}", line));
    }

    pub fn finish_success(&self, file: &str, bytes: u64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            bytes as f64 / elapsed / 1_048_576.0
        } else {
            0.0
        };
        self.bar.finish_with_message(format!(
            "{} {} ({:.1} MB) in {:.1}s ({:.1} MB/s)",
            "Completed".with(Color::Green).bold(),
            file.with(Color::Cyan),
            bytes as f64 / 1_048_576.0,
            elapsed,
            throughput
        ));
    }

    /// The agent already held identical content
    pub fn finish_skipped(&self, file: &str) {
        self.bar.finish_with_message(format!(
            "{} {} (already up to date)",
            "Skipped".with(Color::Yellow).bold(),
            file.with(Color::Cyan)
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar
            .finish_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
    }
}
