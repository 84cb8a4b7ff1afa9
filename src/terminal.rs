//! # Progress reporting
//!
//! Optional, purely cosmetic: a trial-count progress bar the event loop
//! advances once per closing message.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Hook the event loop advances on every closing message and finishes
/// once at the end of a run. Kept as a trait so tests can swap in a
/// no-op without pulling in a real terminal.
pub trait ProgressReporter: Send {
    fn advance(&self);
    fn finish(&self);
}

/// `indicatif`-backed reporter, or a silent no-op when the caller asked
/// for `show_progress_bar = false`.
pub struct Terminal {
    bar: Option<ProgressBar>,
}

impl Terminal {
    pub fn new(show_progress_bar: bool, n_trials: u64, timeout: Option<Duration>) -> Self {
        if !show_progress_bar {
            return Self { bar: None };
        }
        let bar = ProgressBar::new(n_trials);
        let template = if timeout.is_some() {
            "{spinner:.cyan} trial {pos}/{len} ({elapsed_precise} elapsed, timeout {msg})"
        } else {
            "{spinner:.cyan} trial {pos}/{len} ({elapsed_precise} elapsed)"
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style);
        }
        if let Some(timeout) = timeout {
            bar.set_message(format!("{timeout:?}"));
        }
        Self { bar: Some(bar) }
    }
}

impl ProgressReporter for Terminal {
    fn advance(&self) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}
