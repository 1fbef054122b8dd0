//! Progress reporting module with TTY detection.
//!
//! Shows a progress bar for the ten-phase pipeline when stdout is a TTY,
//! and falls back to plain status lines otherwise.

use std::time::Instant;

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Progress reporter that shows a progress bar in TTY mode and falls back
/// to simple text output when not in a TTY.
pub struct ProgressReporter {
    is_tty: bool,
    total_phases: usize,
    current_phase: usize,
    current_name: String,
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
}

impl ProgressReporter {
    /// Creates a new progress reporter for a run with `total_phases` phases.
    pub fn new(total_phases: usize) -> Self {
        let is_tty = is_tty();
        let progress_bar = if is_tty {
            let pb = ProgressBar::new(total_phases as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            total_phases,
            current_phase: 0,
            current_name: String::new(),
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// Creates a silent progress reporter that always uses non-TTY mode.
    #[allow(dead_code)]
    pub fn silent(total_phases: usize) -> Self {
        Self {
            is_tty: false,
            total_phases,
            current_phase: 0,
            current_name: String::new(),
            progress_bar: None,
            start_time: Instant::now(),
        }
    }

    /// Sets the current phase being run.
    pub fn set_phase(&mut self, index: usize, phase_name: &str, status: &str) {
        self.current_phase = index;
        self.current_name = format!("{phase_name} ({status})");

        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!(
                    "[{}/{}] {}... ({elapsed:?})",
                    self.current_phase, self.total_phases, self.current_name
                );
                pb.set_message(msg);
                pb.set_position((self.current_phase - 1) as u64);
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!(
                "[{}/{}] {}... ({elapsed:?})",
                self.current_phase, self.total_phases, self.current_name
            );
        }
    }

    /// Marks the current phase as completed.
    #[allow(clippy::collapsible_if)]
    #[allow(dead_code)]
    pub fn finish_phase(&mut self) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                pb.inc(1);
            }
        }
    }

    /// Sets a status message (e.g. "waiting for ready phase...").
    #[allow(dead_code)]
    pub fn set_status(&self, status: &str) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let current = pb.position();
                let msg = format!("[{}/{}] {}", current + 1, self.total_phases, status);
                pb.set_message(msg);
            }
        } else {
            eprintln!("[status] {}", status);
        }
    }

    /// Finishes the progress reporting.
    pub fn finish(self) {
        if self.is_tty {
            if let Some(pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!("Completed {} phases in {:?}", self.total_phases, elapsed);
                pb.set_message(msg);
                pb.finish();
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!(
                "Completed {}/{} phases in {:?}",
                self.total_phases, self.total_phases, elapsed
            );
        }
    }
}
