use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// Completed-task counter scoped to one pool run.
///
/// Incremented exactly once per task, success or failure.
pub struct SharedProgress {
    completed: Mutex<u64>,
    total: u64,
    bar: Option<ProgressBar>,
}

impl SharedProgress {
    pub fn new(total: u64) -> Self {
        Self {
            completed: Mutex::new(0),
            total,
            bar: None,
        }
    }

    /// Same counter, mirrored onto a terminal progress bar.
    pub fn with_bar(total: u64) -> Self {
        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} stems ({eta}) {msg}",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        Self {
            completed: Mutex::new(0),
            total,
            bar: Some(pb),
        }
    }

    /// Returns the new count.
    pub fn increment(&self) -> u64 {
        let mut completed = self
            .completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *completed += 1;
        if let Some(pb) = &self.bar {
            pb.set_position(*completed);
        }
        *completed
    }

    pub fn completed(&self) -> u64 {
        *self
            .completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn finish(&self, message: String) {
        if let Some(pb) = &self.bar {
            pb.finish_with_message(message);
        }
    }
}
