//! Transfer progress reporting.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Receives progress text from the remote operation while a transfer runs.
pub trait ProgressObserver {
    fn update(&self, message: &str);

    /// Called once the transfer has ended, whatever the outcome.
    fn finish(&self);
}

/// Ignores all progress. Used when stderr is not a terminal.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn update(&self, _message: &str) {}

    fn finish(&self) {}
}

/// Terminal spinner showing the latest progress line.
pub struct SpinnerProgress {
    bar: ProgressBar,
    label: String,
}

impl SpinnerProgress {
    /// `label` names what is being transferred, e.g. "instance" or "volume".
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        let label = format!("Transferring {label}");
        bar.set_message(label.clone());
        Self { bar, label }
    }
}

impl ProgressObserver for SpinnerProgress {
    fn update(&self, message: &str) {
        self.bar.set_message(format!("{}: {message}", self.label));
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Drop for SpinnerProgress {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}
