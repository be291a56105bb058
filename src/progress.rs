//! Progress bars for apply and destroy, one per stage

use colored::Colorize;
use declarative::{ProgressCallback, ResourceChange, ResourceId};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Mutex, MutexGuard};

use crate::ui;

pub struct StageProgress {
    bar: Mutex<Option<ProgressBar>>,
    hidden: bool,
    /// Print one line per changed resource once the bar is cleared
    verbose: bool,
}

impl StageProgress {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self {
            bar: Mutex::new(None),
            hidden: quiet,
            verbose,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        match self.bar.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.blue.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-")
    }
}

impl ProgressCallback for StageProgress {
    fn on_stage_start(&self, stage: usize, total: usize, count: usize) {
        let bar = if self.hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(count as u64)
        };
        bar.set_style(Self::style());
        bar.set_prefix(format!("[{}/{}]", stage + 1, total));
        *self.lock() = Some(bar);
    }

    fn on_resource_start(&self, _id: &ResourceId, description: &str) {
        if let Some(bar) = self.lock().as_ref() {
            bar.set_message(description.to_string());
        }
    }

    fn on_resource_complete(&self, id: &ResourceId, change: &ResourceChange) {
        let guard = self.lock();
        let Some(bar) = guard.as_ref() else {
            return;
        };
        bar.inc(1);

        let show = match change {
            ResourceChange::Failed { .. } | ResourceChange::Skipped { .. } => true,
            ResourceChange::NoChange => false,
            _ => self.verbose,
        };
        if show && !self.hidden {
            bar.suspend(|| ui::change(id.as_str(), change));
        }
    }

    fn on_stage_complete(&self, _stage: usize) {
        if let Some(bar) = self.lock().take() {
            let prefix = bar.prefix();
            let done = bar.position();
            bar.finish_and_clear();
            if !self.hidden {
                println!("{} {} resource(s)", prefix.blue().bold(), done);
            }
        }
    }
}
