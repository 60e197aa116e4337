//! Update status, progress snapshots and observers.
//!
//! Concurrent downloads report into a [`ProgressTracker`] whose counters are
//! plain atomics, so no lock is taken on the chunk path. Observers receive
//! immutable [`UpdateProgress`] snapshots.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Phase of the update state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStatus {
    #[default]
    Idle,
    CheckingForUpdates,
    UpToDate,
    UpdateAvailable,
    Downloading,
    Verifying,
    BackingUp,
    Applying,
    Cleanup,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
}

impl UpdateStatus {
    /// Whether no further transition follows.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::UpToDate | Self::Completed | Self::RolledBack)
    }

    /// Human readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingForUpdates => "checking for updates",
            Self::UpToDate => "up to date",
            Self::UpdateAvailable => "update available",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::BackingUp => "backing up",
            Self::Applying => "applying",
            Self::Cleanup => "cleaning up",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RollingBack => "rolling back",
            Self::RolledBack => "rolled back",
        }
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Point-in-time view of one update operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateProgress {
    /// File most recently reporting progress.
    pub current_file: Option<String>,
    pub current_file_bytes: u64,
    pub current_file_total_bytes: u64,
    /// Bytes received across all files.
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub total_files: usize,
    pub files_completed: usize,
    pub status: UpdateStatus,
}

impl UpdateProgress {
    /// Overall byte progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.downloaded_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Race-free aggregate counters shared by concurrent downloads.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total_bytes: AtomicU64,
    total_files: AtomicUsize,
    downloaded_bytes: AtomicU64,
    files_completed: AtomicUsize,
    current: Mutex<Option<(String, u64, u64)>>,
}

impl ProgressTracker {
    /// Tracker for `total_files` files totalling `total_bytes`.
    pub fn new(total_files: usize, total_bytes: u64) -> Self {
        Self {
            total_bytes: AtomicU64::new(total_bytes),
            total_files: AtomicUsize::new(total_files),
            ..Self::default()
        }
    }

    /// Account for a change in one file's byte count.
    ///
    /// `previous` is the count last reported for the same file, so a
    /// restarted download (count going down) is subtracted back out.
    pub fn record_bytes(&self, path: &str, previous: u64, now: u64, file_total: u64) {
        if now >= previous {
            self.downloaded_bytes.fetch_add(now - previous, Ordering::Relaxed);
        } else {
            self.downloaded_bytes.fetch_sub(previous - now, Ordering::Relaxed);
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some((path.to_string(), now, file_total));
        }
    }

    /// Mark one file finished.
    pub fn file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot tagged with `status`.
    pub fn snapshot(&self, status: UpdateStatus) -> UpdateProgress {
        let current = self.current.lock().ok().and_then(|c| c.clone());
        let (current_file, current_file_bytes, current_file_total_bytes) = match current {
            Some((path, bytes, total)) => (Some(path), bytes, total),
            None => (None, 0, 0),
        };
        UpdateProgress {
            current_file,
            current_file_bytes,
            current_file_total_bytes,
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            total_files: self.total_files.load(Ordering::Relaxed),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            status,
        }
    }
}

/// Receives status and progress from the update pipeline.
///
/// Callbacks run inline on download tasks and must not block.
pub trait UpdateObserver: Send + Sync {
    fn on_status(&self, _status: UpdateStatus) {}

    fn on_progress(&self, _progress: &UpdateProgress) {}

    /// A file download acquired its concurrency slot.
    fn on_file_started(&self, _path: &str) {}

    /// A file download released its slot.
    fn on_file_finished(&self, _path: &str, _ok: bool) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl UpdateObserver for NoopObserver {}

/// Event forwarded by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    Status(UpdateStatus),
    Progress(UpdateProgress),
    FileStarted(String),
    FileFinished { path: String, ok: bool },
}

/// Observer forwarding every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UpdateEvent>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: UpdateEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.tx.send(event);
    }
}

impl UpdateObserver for ChannelObserver {
    fn on_status(&self, status: UpdateStatus) {
        self.send(UpdateEvent::Status(status));
    }

    fn on_progress(&self, progress: &UpdateProgress) {
        self.send(UpdateEvent::Progress(progress.clone()));
    }

    fn on_file_started(&self, path: &str) {
        self.send(UpdateEvent::FileStarted(path.to_string()));
    }

    fn on_file_finished(&self, path: &str, ok: bool) {
        self.send(UpdateEvent::FileFinished {
            path: path.to_string(),
            ok,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_aggregates_and_handles_restart() {
        let tracker = ProgressTracker::new(2, 300);
        tracker.record_bytes("a", 0, 100, 100);
        tracker.record_bytes("b", 0, 150, 200);
        // "b" restarted from scratch after a failed attempt
        tracker.record_bytes("b", 150, 20, 200);
        tracker.file_completed();

        let snap = tracker.snapshot(UpdateStatus::Downloading);
        assert_eq!(snap.downloaded_bytes, 120);
        assert_eq!(snap.total_bytes, 300);
        assert_eq!(snap.files_completed, 1);
        assert_eq!(snap.total_files, 2);
        assert_eq!(snap.current_file.as_deref(), Some("b"));
        assert_eq!(snap.current_file_bytes, 20);
        assert_eq!(snap.status, UpdateStatus::Downloading);
        assert!((snap.percentage() - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_terminal_states() {
        assert!(UpdateStatus::Completed.is_terminal());
        assert!(UpdateStatus::RolledBack.is_terminal());
        assert!(UpdateStatus::UpToDate.is_terminal());
        assert!(!UpdateStatus::Failed.is_terminal());
        assert_eq!(UpdateStatus::default(), UpdateStatus::Idle);
    }

    #[test]
    fn test_channel_observer_forwards_events() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.on_status(UpdateStatus::Downloading);
        observer.on_file_started("a");
        observer.on_file_finished("a", true);

        assert_eq!(
            rx.try_recv().unwrap(),
            UpdateEvent::Status(UpdateStatus::Downloading)
        );
        assert_eq!(rx.try_recv().unwrap(), UpdateEvent::FileStarted("a".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            UpdateEvent::FileFinished {
                path: "a".into(),
                ok: true
            }
        );
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_status(UpdateStatus::Failed);
    }
}
