//! Update orchestration.
//!
//! [`UpdateService`] drives one update as a linear state machine:
//!
//! ```text
//! Idle -> CheckingForUpdates -> UpToDate
//!                            -> UpdateAvailable -> Downloading -> Verifying
//!                               -> BackingUp -> Applying -> Cleanup -> Completed
//!
//! Downloading | Verifying | BackingUp | Applying
//!     -> Failed -> RollingBack -> RolledBack
//! ```
//!
//! Nothing at the install root is touched until every file has been
//! downloaded and re-verified in the staging directory. The local manifest
//! is written last; that write is the commit point.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::download::{DownloadProgress, Downloader, FileDownload};
use crate::error::UpdateError;
use crate::lock::{UpdateLock, DEFAULT_STALE_AFTER};
use crate::manifest::{
    resolve_under, validate_relative_path, versions_differ, FileEntry, Manifest, ManifestService,
};
use crate::progress::{NoopObserver, ProgressTracker, UpdateObserver, UpdateStatus};
use crate::rollback::{prune_empty_parents, recover_interrupted, BackupSet, RecoveryOutcome};
use crate::security::{self, SecurityService};
use crate::settings::LauncherSettings;

/// Staging directory name at the install root.
pub const STAGING_DIR_NAME: &str = ".wfl-staging";

/// Summary of a completed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// Version now installed.
    pub version: String,
    /// Files fetched and applied.
    pub downloaded: usize,
    /// Files already matching the manifest.
    pub unchanged: usize,
    /// Live files copied to the backup before being replaced or removed.
    pub backed_up: usize,
    /// Files removed as obsolete, or because a new file takes the place of
    /// their directory.
    pub removed: usize,
    /// Outcome of resolving an earlier interrupted update.
    pub recovery: RecoveryOutcome,
}

/// Result of checking the install against the local manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub version: String,
    pub checked: usize,
    /// Missing or wrong files.
    pub mismatched: Vec<String>,
    /// Optional files that are absent. Not a failure.
    pub missing_optional: Vec<String>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Work derived from comparing a manifest with the install root.
#[derive(Debug, Default)]
struct UpdatePlan {
    to_download: Vec<FileEntry>,
    unchanged: usize,
    /// Live files to back up and remove before anything is moved in.
    obsolete: Vec<String>,
}

/// Checks for, applies, verifies and repairs game updates.
pub struct UpdateService {
    settings: Arc<LauncherSettings>,
    manifests: ManifestService,
    observer: Arc<dyn UpdateObserver>,
    lock_stale_after: Duration,
    status: Mutex<UpdateStatus>,
    in_flight: tokio::sync::Mutex<()>,
}

impl UpdateService {
    /// Create a service over an existing manifest service.
    pub fn new(settings: Arc<LauncherSettings>, manifests: ManifestService) -> Self {
        Self {
            settings,
            manifests,
            observer: Arc::new(NoopObserver),
            lock_stale_after: DEFAULT_STALE_AFTER,
            status: Mutex::new(UpdateStatus::Idle),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a service whose manifest service follows `settings`.
    pub fn from_settings(
        settings: Arc<LauncherSettings>,
        downloader: Downloader,
        security: SecurityService,
    ) -> Self {
        let manifests = ManifestService::new(settings.install_path.clone(), downloader, security)
            .with_require_signature(settings.require_signature);
        Self::new(settings, manifests)
    }

    pub fn with_observer(mut self, observer: Arc<dyn UpdateObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    pub fn manifest_service(&self) -> &ManifestService {
        &self.manifests
    }

    pub fn install_root(&self) -> &Path {
        self.manifests.install_root()
    }

    /// Current state machine position.
    pub fn status(&self) -> UpdateStatus {
        match self.status.lock() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_status(&self, status: UpdateStatus) {
        match self.status.lock() {
            Ok(mut current) => *current = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
        debug!(%status, "update status");
        self.observer.on_status(status);
    }

    /// Version recorded by the last successful update.
    pub async fn current_version(&self) -> Result<Option<String>, UpdateError> {
        Ok(self.manifests.load_local().await?.map(|m| m.version))
    }

    /// Whether `candidate` should be installed.
    pub async fn is_update_required(&self, candidate: &Manifest) -> Result<bool, UpdateError> {
        let local = self.manifests.load_local().await?;
        Ok(update_required(local.as_ref(), candidate))
    }

    /// Fetch the remote manifest and return it if it should be installed.
    pub async fn check_for_updates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Manifest>, UpdateError> {
        self.set_status(UpdateStatus::CheckingForUpdates);

        let remote = match self
            .manifests
            .fetch_remote(&self.settings.manifest_url, cancel)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "update check failed");
                self.set_status(UpdateStatus::Failed);
                return Err(e);
            }
        };

        let local = self.manifests.load_local().await?;
        if update_required(local.as_ref(), &remote) {
            info!(
                installed = local.as_ref().map(|m| m.version.as_str()).unwrap_or("none"),
                available = %remote.version,
                forced = remote.force_update,
                "update available"
            );
            self.set_status(UpdateStatus::UpdateAvailable);
            Ok(Some(remote))
        } else {
            info!(version = %remote.version, "game is up to date");
            self.set_status(UpdateStatus::UpToDate);
            Ok(None)
        }
    }

    /// Reinstall whatever the local manifest says is broken.
    pub async fn repair_game(&self, cancel: &CancellationToken) -> Result<UpdateReport, UpdateError> {
        let local = self
            .manifests
            .load_local()
            .await?
            .ok_or(UpdateError::NoLocalManifest)?;
        info!(version = %local.version, "repairing installation");
        self.update_game(&local, cancel).await
    }

    /// Check every file of the local manifest at the install root.
    ///
    /// Read-only: nothing is downloaded or changed.
    pub async fn verify_game_integrity(
        &self,
        cancel: &CancellationToken,
    ) -> Result<IntegrityReport, UpdateError> {
        let local = self
            .manifests
            .load_local()
            .await?
            .ok_or(UpdateError::NoLocalManifest)?;
        let root = self.install_root();

        let mut report = IntegrityReport {
            version: local.version.clone(),
            ..IntegrityReport::default()
        };

        for entry in &local.files {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            report.checked += 1;

            let live = resolve_under(root, &entry.path);
            let size = match tokio::fs::metadata(&live).await {
                Ok(meta) if meta.is_file() => Some(meta.len()),
                Ok(_) => None,
                Err(_) if !live.exists() => None,
                Err(e) => return Err(e.into()),
            };

            match size {
                None if entry.optional => {
                    debug!(path = %entry.path, "optional file absent");
                    report.missing_optional.push(entry.path.clone());
                }
                None => {
                    warn!(path = %entry.path, "file missing");
                    report.mismatched.push(entry.path.clone());
                }
                Some(size) if size != entry.size => {
                    warn!(path = %entry.path, expected = entry.size, actual = size, "size mismatch");
                    report.mismatched.push(entry.path.clone());
                }
                Some(_) => {
                    if !security::verify_file_digest(&live, &entry.sha256).await {
                        warn!(path = %entry.path, "digest mismatch");
                        report.mismatched.push(entry.path.clone());
                    }
                }
            }
        }

        info!(
            version = %report.version,
            checked = report.checked,
            mismatched = report.mismatched.len(),
            "integrity check finished"
        );
        Ok(report)
    }

    /// Install `manifest`.
    ///
    /// On failure the install root is restored to its previous state, the
    /// local manifest is left untouched and the error is returned. A
    /// cancellation before the apply phase keeps staged downloads so the
    /// next attempt resumes them.
    pub async fn update_game(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<UpdateReport, UpdateError> {
        manifest.validate()?;
        let root = self.install_root().to_path_buf();

        let _in_flight = self
            .in_flight
            .try_lock()
            .map_err(|_| UpdateError::UpdateInProgress(root.display().to_string()))?;
        tokio::fs::create_dir_all(&root).await?;
        let _lock = UpdateLock::acquire(&root, self.lock_stale_after)?;

        let previous = self.manifests.load_local().await?;
        let recovery = {
            let root = root.clone();
            let installed = previous.as_ref().map(|m| m.version.clone());
            blocking(move || recover_interrupted(&root, installed.as_deref())).await?
        };

        info!(
            from = previous.as_ref().map(|m| m.version.as_str()).unwrap_or("none"),
            to = %manifest.version,
            "starting update"
        );

        let staging_root = root.join(STAGING_DIR_NAME);
        let staging = staging_dir(&root, &manifest.version);
        remove_stale_staging(&staging_root, &staging).await?;

        self.set_status(UpdateStatus::Downloading);
        let plan = match self.plan(manifest, previous.as_ref(), cancel).await {
            Ok(plan) => plan,
            Err(e) => return Err(self.abort(e, &root, &staging_root, false).await),
        };
        info!(
            download = plan.to_download.len(),
            unchanged = plan.unchanged,
            obsolete = plan.obsolete.len(),
            "update planned"
        );

        if let Err(e) = self.download_all(manifest, &plan.to_download, &staging, cancel).await {
            return Err(self.abort(e, &root, &staging_root, false).await);
        }

        self.set_status(UpdateStatus::Verifying);
        if let Err(e) = verify_staged(&plan.to_download, &staging, cancel).await {
            return Err(self.abort(e, &root, &staging_root, false).await);
        }

        let (backed_up, removed) = match self
            .apply(manifest, previous.as_ref(), &plan, &staging, cancel)
            .await
        {
            Ok(counts) => counts,
            Err(e) => return Err(self.abort(e, &root, &staging_root, true).await),
        };

        self.set_status(UpdateStatus::Cleanup);
        cleanup(&root, &staging_root).await;

        self.set_status(UpdateStatus::Completed);
        info!(version = %manifest.version, downloaded = plan.to_download.len(), "update completed");

        Ok(UpdateReport {
            version: manifest.version.clone(),
            downloaded: plan.to_download.len(),
            unchanged: plan.unchanged,
            backed_up,
            removed,
            recovery,
        })
    }

    /// Decide which files need fetching and which are obsolete.
    async fn plan(
        &self,
        manifest: &Manifest,
        previous: Option<&Manifest>,
        cancel: &CancellationToken,
    ) -> Result<UpdatePlan, UpdateError> {
        let root = self.install_root();
        let mut plan = UpdatePlan::default();

        for entry in &manifest.files {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            if live_file_matches(&resolve_under(root, &entry.path), entry).await? {
                plan.unchanged += 1;
            } else {
                plan.to_download.push(entry.clone());
            }
        }

        if let Some(previous) = previous {
            let wanted: HashSet<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
            plan.obsolete = previous
                .files
                .iter()
                .filter(|f| !wanted.contains(f.path.as_str()))
                .filter(|f| resolve_under(root, &f.path).is_file())
                .map(|f| f.path.clone())
                .collect();
        }

        let displaced = {
            let root = root.to_path_buf();
            let incoming: Vec<String> = plan.to_download.iter().map(|e| e.path.clone()).collect();
            blocking(move || Ok(displaced_files(&root, &incoming))).await?
        };
        let mut known: HashSet<String> = plan.obsolete.iter().cloned().collect();
        for path in displaced {
            if known.insert(path.clone()) {
                debug!(path = %path, "file is in the way of a new entry");
                plan.obsolete.push(path);
            }
        }

        Ok(plan)
    }

    /// Fetch every entry into `staging`, at most `maxConcurrentDownloads`
    /// at a time. The first failure cancels the rest.
    async fn download_all(
        &self,
        manifest: &Manifest,
        entries: &[FileEntry],
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        tokio::fs::create_dir_all(staging).await?;

        let total_bytes = entries.iter().map(|e| e.size).sum();
        let tracker = Arc::new(ProgressTracker::new(entries.len(), total_bytes));
        let semaphore = Arc::new(Semaphore::new(self.settings.download_concurrency()));
        let batch = cancel.child_token();
        let mut tasks = JoinSet::new();

        for entry in entries {
            let url = manifest.file_url(entry)?.to_string();
            let destination = resolve_under(staging, &entry.path);
            let entry = entry.clone();
            let downloader = self.manifests.downloader().clone();
            let observer = Arc::clone(&self.observer);
            let tracker = Arc::clone(&tracker);
            let semaphore = Arc::clone(&semaphore);
            let token = batch.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = token.cancelled() => return Err(UpdateError::Cancelled),
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| UpdateError::Cancelled)?
                    }
                };

                observer.on_file_started(&entry.path);
                let result = fetch_entry(
                    &downloader,
                    &entry,
                    &url,
                    &destination,
                    &token,
                    &tracker,
                    observer.as_ref(),
                )
                .await;
                observer.on_file_finished(&entry.path, result.is_ok());

                if result.is_ok() {
                    tracker.file_completed();
                    observer.on_progress(&tracker.snapshot(UpdateStatus::Downloading));
                }
                result
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(UpdateError::Io(std::io::Error::other(e))),
            };
            if let Err(e) = outcome {
                if first_error.is_none() {
                    if !matches!(e, UpdateError::Cancelled) {
                        error!(error = %e, "download failed, cancelling remaining downloads");
                    }
                    batch.cancel();
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Back up, apply and commit. Sequential.
    async fn apply(
        &self,
        manifest: &Manifest,
        previous: Option<&Manifest>,
        plan: &UpdatePlan,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize), UpdateError> {
        let root = self.install_root().to_path_buf();

        self.set_status(UpdateStatus::BackingUp);
        let backup = {
            let root = root.clone();
            let target = manifest.version.clone();
            let previous_version = previous.map(|m| m.version.clone());
            let replaced: Vec<String> = plan.to_download.iter().map(|e| e.path.clone()).collect();
            let obsolete = plan.obsolete.clone();
            let cancel = cancel.clone();
            blocking(move || {
                let mut backup = BackupSet::begin(&root, &target, previous_version.as_deref())?;
                for path in &replaced {
                    if cancel.is_cancelled() {
                        return Err(UpdateError::Cancelled);
                    }
                    if !backup.backup_file(path)? {
                        backup.record_created(path);
                    }
                }
                for path in &obsolete {
                    backup.backup_file(path)?;
                }
                backup.seal()?;
                Ok(backup)
            })
            .await?
        };
        let backed_up = backup.journal().backed_up.len();
        info!(files = backed_up, "backup complete");

        self.set_status(UpdateStatus::Applying);
        let removed = {
            let root = root.clone();
            let staging = staging.to_path_buf();
            let entries = plan.to_download.clone();
            let obsolete = plan.obsolete.clone();
            let cancel = cancel.clone();
            blocking(move || apply_staged(&root, &staging, &entries, &obsolete, &cancel)).await?
        };

        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        self.manifests.save_local(manifest).await?;

        let mut backup = backup;
        if let Err(e) = blocking(move || backup.mark_committed()).await {
            // the version check in recovery still sees the new manifest
            warn!(error = %e, "failed to mark the update committed");
        }
        Ok((backed_up, removed))
    }

    /// Enter the failure path, roll back if asked, and clean up.
    async fn abort(
        &self,
        error: UpdateError,
        root: &Path,
        staging_root: &Path,
        rollback: bool,
    ) -> UpdateError {
        self.set_status(UpdateStatus::Failed);
        error!(error = %error, "update failed");
        self.set_status(UpdateStatus::RollingBack);

        let keep_staging = !rollback && matches!(error, UpdateError::Cancelled);
        let mut error = error;

        if rollback {
            let root = root.to_path_buf();
            let restored = blocking(move || match BackupSet::open(&root)? {
                Some(set) => {
                    set.restore_all()?;
                    set.discard()
                }
                None => Ok(()),
            })
            .await;
            if let Err(e) = restored {
                error!(error = %e, "rollback incomplete, backup kept for the next run");
                error = UpdateError::RollbackFailed(format!("{e} (after: {error})"));
            }
        }

        if keep_staging {
            info!(path = %staging_root.display(), "keeping staged downloads for resume");
        } else {
            remove_dir_if_exists(staging_root).await;
        }

        self.set_status(UpdateStatus::RolledBack);
        error
    }
}

/// Whether `candidate` should replace what `local` records.
pub fn update_required(local: Option<&Manifest>, candidate: &Manifest) -> bool {
    match local {
        None => true,
        Some(local) => candidate.force_update || versions_differ(&local.version, &candidate.version),
    }
}

async fn live_file_matches(path: &Path, entry: &FileEntry) -> Result<bool, UpdateError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() == entry.size => {
            Ok(security::verify_file_digest(path, &entry.sha256).await)
        }
        Ok(_) => Ok(false),
        // also covers a parent component that is a regular file
        Err(_) if !path.exists() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn fetch_entry(
    downloader: &Downloader,
    entry: &FileEntry,
    url: &str,
    destination: &Path,
    cancel: &CancellationToken,
    tracker: &ProgressTracker,
    observer: &dyn UpdateObserver,
) -> Result<(), UpdateError> {
    // Finished during an earlier, cancelled run.
    if live_file_matches(destination, entry).await? {
        debug!(path = %entry.path, "already staged");
        tracker.record_bytes(&entry.path, 0, entry.size, entry.size);
        return Ok(());
    }

    let last = AtomicU64::new(0);
    let progress = |p: DownloadProgress| {
        let previous = last.swap(p.downloaded, Ordering::Relaxed);
        tracker.record_bytes(&entry.path, previous, p.downloaded, p.total);
        observer.on_progress(&tracker.snapshot(UpdateStatus::Downloading));
    };

    downloader
        .download_file(
            FileDownload {
                url,
                destination,
                expected_sha256: &entry.sha256,
                expected_size: entry.size,
            },
            cancel,
            &progress,
        )
        .await
}

/// Whole-batch integrity gate before the live install is touched.
async fn verify_staged(
    entries: &[FileEntry],
    staging: &Path,
    cancel: &CancellationToken,
) -> Result<(), UpdateError> {
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let staged = resolve_under(staging, &entry.path);
        let size = tokio::fs::metadata(&staged).await?.len();
        if size != entry.size {
            return Err(UpdateError::SizeMismatch {
                path: entry.path.clone(),
                expected: entry.size,
                actual: size,
            });
        }
        let actual = security::compute_file_digest(&staged).await?;
        if !security::digests_match(&actual, &entry.sha256) {
            return Err(UpdateError::HashMismatch {
                path: entry.path.clone(),
                expected: entry.sha256.clone(),
                actual,
            });
        }
    }
    debug!(files = entries.len(), "staged files verified");
    Ok(())
}

/// Remove obsolete files, then move staged files over the live install.
///
/// Removal comes first so a new file can take the place of a directory the
/// old version used, and the other way round.
fn apply_staged(
    root: &Path,
    staging: &Path,
    entries: &[FileEntry],
    obsolete: &[String],
    cancel: &CancellationToken,
) -> Result<usize, UpdateError> {
    let mut removed = 0;
    for path in obsolete {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let live = resolve_under(root, path);
        match std::fs::remove_file(&live) {
            Ok(()) => {
                removed += 1;
                prune_empty_parents(root, &live);
                debug!(path = %path, "removed obsolete file");
            }
            Err(_) if !live.exists() => {}
            Err(e) => return Err(e.into()),
        }
    }

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let staged = resolve_under(staging, &entry.path);
        let live = resolve_under(root, &entry.path);
        if let Some(parent) = live.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&staged, &live)?;
        if entry.executable {
            mark_executable(&live)?;
        }
        debug!(path = %entry.path, "applied");
    }
    Ok(removed)
}

/// Live files standing where `incoming` paths must go: regular files at a
/// parent component, and every file below an existing directory.
fn displaced_files(root: &Path, incoming: &[String]) -> Vec<String> {
    let mut found = Vec::new();
    for path in incoming {
        for (i, _) in path.match_indices('/') {
            let ancestor = &path[..i];
            if resolve_under(root, ancestor).is_file() {
                found.push(ancestor.to_string());
            }
        }

        let live = resolve_under(root, path);
        if !live.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&live)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let relative = entry
                .path()
                .strip_prefix(root)
                .ok()
                .and_then(|p| p.to_str())
                .map(|p| p.replace(std::path::MAIN_SEPARATOR, "/"));
            match relative {
                Some(relative) if validate_relative_path(&relative).is_ok() => found.push(relative),
                _ => warn!(path = %entry.path().display(), "cannot clear this file out of the way"),
            }
        }
    }
    found
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<(), UpdateError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<(), UpdateError> {
    Ok(())
}

/// Remove staged downloads of other versions.
async fn remove_stale_staging(staging_root: &Path, keep: &Path) -> Result<(), UpdateError> {
    let mut entries = match tokio::fs::read_dir(staging_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path != keep {
            debug!(path = %path.display(), "removing stale staging");
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
    }
    Ok(())
}

/// Post-commit cleanup. Failures are logged, never returned.
async fn cleanup(root: &Path, staging_root: &Path) {
    let root = root.to_path_buf();
    let discarded = blocking(move || match BackupSet::open(&root)? {
        Some(set) => set.discard(),
        None => Ok(()),
    })
    .await;
    if let Err(e) = discarded {
        warn!(error = %e, "failed to remove backup directory");
    }
    remove_dir_if_exists(staging_root).await;
}

async fn remove_dir_if_exists(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove directory"),
    }
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, UpdateError>
where
    F: FnOnce() -> Result<T, UpdateError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?
}

/// Staging directory for `version` under `root`.
pub fn staging_dir(root: &Path, version: &str) -> PathBuf {
    root.join(STAGING_DIR_NAME).join(version.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::sample_manifest;
    use crate::manifest::LOCAL_MANIFEST_FILE;
    use crate::security::digest_bytes;
    use tempfile::TempDir;

    fn service_for(root: &Path) -> UpdateService {
        let settings = Arc::new(LauncherSettings {
            install_path: root.to_path_buf(),
            manifest_url: "http://127.0.0.1:9/manifest.json".to_string(),
            ..LauncherSettings::default()
        });
        UpdateService::from_settings(settings, Downloader::new().unwrap(), SecurityService::default())
    }

    fn install(root: &Path, manifest: &Manifest, contents: &[(&str, &[u8])]) {
        for (path, data) in contents {
            let live = resolve_under(root, path);
            std::fs::create_dir_all(live.parent().unwrap()).unwrap();
            std::fs::write(live, data).unwrap();
        }
        std::fs::write(
            root.join(LOCAL_MANIFEST_FILE),
            serde_json::to_vec(manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_update_required() {
        let candidate = sample_manifest();
        assert!(update_required(None, &candidate));

        let mut local = sample_manifest();
        assert!(!update_required(Some(&local), &candidate));

        local.version = "1.2".to_string();
        assert!(!update_required(Some(&local), &candidate));

        local.version = "1.1.9".to_string();
        assert!(update_required(Some(&local), &candidate));

        let mut forced = sample_manifest();
        forced.force_update = true;
        assert!(update_required(Some(&sample_manifest()), &forced));
    }

    #[test]
    fn test_integrity_report_intact() {
        let mut report = IntegrityReport::default();
        report.missing_optional.push("extras/music.ogg".into());
        assert!(report.is_intact());
        report.mismatched.push("bin/game".into());
        assert!(!report.is_intact());
    }

    #[tokio::test]
    async fn test_verify_game_integrity_reports_corruption() {
        let dir = TempDir::new().unwrap();
        let mut manifest = sample_manifest();
        manifest.files.push(FileEntry {
            path: "extras/music.ogg".to_string(),
            size: 5,
            sha256: digest_bytes(b"music"),
            url: None,
            compressed: false,
            optional: true,
            executable: false,
            delta: None,
        });
        install(dir.path(), &manifest, &[("bin/game", b"game"), ("data/pak0.bin", b"PAK0")]);

        let service = service_for(dir.path());
        let report = service
            .verify_game_integrity(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.checked, 3);
        assert_eq!(report.mismatched, vec!["data/pak0.bin".to_string()]);
        assert_eq!(report.missing_optional, vec!["extras/music.ogg".to_string()]);
        assert!(!report.is_intact());
    }

    #[tokio::test]
    async fn test_verify_without_local_manifest() {
        let dir = TempDir::new().unwrap();
        let service = service_for(dir.path());
        assert!(matches!(
            service.verify_game_integrity(&CancellationToken::new()).await,
            Err(UpdateError::NoLocalManifest)
        ));
        assert!(matches!(
            service.repair_game(&CancellationToken::new()).await,
            Err(UpdateError::NoLocalManifest)
        ));
        assert_eq!(service.current_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_already_installed_files_are_not_downloaded() {
        let dir = TempDir::new().unwrap();
        let manifest = sample_manifest();
        // files present and correct, but no local manifest recorded yet
        for (path, data) in [("bin/game", &b"game"[..]), ("data/pak0.bin", &b"pak0"[..])] {
            let live = resolve_under(dir.path(), path);
            std::fs::create_dir_all(live.parent().unwrap()).unwrap();
            std::fs::write(live, data).unwrap();
        }

        // base URL is unreachable: any download attempt would fail
        let service = service_for(dir.path());
        let report = service
            .update_game(&manifest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.downloaded, 0);
        assert_eq!(report.unchanged, 2);
        assert_eq!(service.current_version().await.unwrap().as_deref(), Some("1.2.0"));
        assert_eq!(service.status(), UpdateStatus::Completed);
        assert!(!dir.path().join(STAGING_DIR_NAME).exists());
    }

    #[tokio::test]
    async fn test_obsolete_files_removed() {
        let dir = TempDir::new().unwrap();
        let mut previous = sample_manifest();
        previous.version = "1.1.0".to_string();
        previous.files.push(FileEntry {
            path: "data/old.bin".to_string(),
            size: 3,
            sha256: digest_bytes(b"old"),
            url: None,
            compressed: false,
            optional: false,
            executable: false,
            delta: None,
        });
        install(
            dir.path(),
            &previous,
            &[("bin/game", b"game"), ("data/pak0.bin", b"pak0"), ("data/old.bin", b"old")],
        );

        let service = service_for(dir.path());
        let report = service
            .update_game(&sample_manifest(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.backed_up, 1);
        assert!(!dir.path().join("data").join("old.bin").exists());
        assert!(!dir.path().join(crate::rollback::BACKUP_DIR_NAME).exists());
    }

    #[tokio::test]
    async fn test_invalid_manifest_rejected_before_anything() {
        let dir = TempDir::new().unwrap();
        let mut manifest = sample_manifest();
        manifest.files[0].size = 0;

        let service = service_for(dir.path());
        let result = service.update_game(&manifest, &CancellationToken::new()).await;
        assert!(matches!(result, Err(UpdateError::Validation(_))));
        assert_eq!(service.status(), UpdateStatus::Idle);
    }

    #[test]
    fn test_staging_dir_layout() {
        assert_eq!(
            staging_dir(Path::new("/g"), "1.2.0"),
            Path::new("/g").join(STAGING_DIR_NAME).join("1.2.0")
        );
    }

    #[test]
    fn test_displaced_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("data").join("maps").join("deep")).unwrap();
        std::fs::write(root.join("data").join("maps").join("town.map"), b"t").unwrap();
        std::fs::write(root.join("data").join("maps").join("deep").join("cave.map"), b"c").unwrap();
        std::fs::write(root.join("sounds"), b"flat").unwrap();

        let mut found = displaced_files(
            root,
            &[
                "data/maps".to_string(),
                "sounds/intro.ogg".to_string(),
                "bin/game".to_string(),
            ],
        );
        found.sort();
        assert_eq!(
            found,
            vec![
                "data/maps/deep/cave.map".to_string(),
                "data/maps/town.map".to_string(),
                "sounds".to_string(),
            ]
        );
    }
}
