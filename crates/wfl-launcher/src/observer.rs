//! Update progress reporting for the terminal.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};
use wfl_updater::{UpdateObserver, UpdateProgress, UpdateStatus};

/// Forwards pipeline events to `tracing` and prints status changes.
#[derive(Debug, Default)]
pub struct LoggingObserver {
    quiet: bool,
    /// Last whole percentage printed.
    last_percent: AtomicU64,
}

impl LoggingObserver {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            last_percent: AtomicU64::new(0),
        }
    }
}

impl UpdateObserver for LoggingObserver {
    fn on_status(&self, status: UpdateStatus) {
        info!(%status, "status");
        if !self.quiet && !matches!(status, UpdateStatus::CheckingForUpdates) {
            eprintln!("{status}");
        }
        if status == UpdateStatus::Downloading {
            self.last_percent.store(0, Ordering::Relaxed);
        }
    }

    fn on_progress(&self, progress: &UpdateProgress) {
        let percent = progress.percentage().floor() as u64;
        let printed = self.last_percent.load(Ordering::Relaxed);
        let due = percent >= printed + 10 || (percent == 100 && printed < 100);
        if due
            && self
                .last_percent
                .compare_exchange(printed, percent, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            && !self.quiet
        {
            eprintln!(
                "  {percent:>3}%  {}/{} files",
                progress.files_completed, progress.total_files
            );
        }
    }

    fn on_file_started(&self, path: &str) {
        debug!(path, "downloading");
    }

    fn on_file_finished(&self, path: &str, ok: bool) {
        if ok {
            debug!(path, "downloaded");
        } else {
            warn!(path, "download failed");
        }
    }
}
