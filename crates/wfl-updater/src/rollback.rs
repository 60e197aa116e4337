//! Backups of replaced files and rollback.
//!
//! Before the apply phase touches a live file, the file is copied into the
//! backup directory under its relative path. Once every copy is made, a
//! journal next to the copies records what was backed up and which paths
//! the apply will create, so a rollback can put the install back exactly as
//! it was, even after a crash. A backup directory without a journal never
//! reached the apply phase and is simply discarded.
//!
//! # Backup Directory Structure
//!
//! ```text
//! <install>/.wfl-backup/
//! ├── journal.json        # target version, backed up and created paths
//! └── files/
//!     └── data/pak0.bin   # pre-update copy, same relative path
//! ```

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::manifest::{resolve_under, validate_relative_path, versions_differ};

/// Backup directory name at the install root.
pub const BACKUP_DIR_NAME: &str = ".wfl-backup";

/// Journal file name within the backup directory.
const JOURNAL_FILE: &str = "journal.json";

/// Directory holding the copied files within the backup directory.
const FILES_DIR: &str = "files";

/// Suffix of the temporary file used while restoring.
pub const RESTORE_SUFFIX: &str = ".wfl-restore";

/// Persistent record of one apply in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Journal {
    /// Version being installed.
    pub target_version: String,
    /// Version recorded before the update started, if any.
    pub previous_version: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Paths copied into the backup.
    pub backed_up: Vec<String>,
    /// Paths the apply is about to create or has created.
    pub created: Vec<String>,
    /// Set once the new local manifest is saved.
    #[serde(default)]
    pub committed: bool,
}

/// What [`recover_interrupted`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No interrupted update.
    Clean,
    /// The interrupted update had committed; its backup was discarded.
    Committed,
    /// The interrupted update was rolled back.
    RolledBack,
}

/// Backup set of one update.
#[derive(Debug)]
pub struct BackupSet {
    install_root: PathBuf,
    backup_dir: PathBuf,
    journal: Journal,
    /// Paths already in `backed_up` or `created`.
    recorded: HashSet<String>,
}

impl BackupSet {
    /// Start a fresh backup set, replacing any leftover directory.
    pub fn begin(
        install_root: &Path,
        target_version: &str,
        previous_version: Option<&str>,
    ) -> Result<Self, UpdateError> {
        let backup_dir = install_root.join(BACKUP_DIR_NAME);
        if backup_dir.exists() {
            fs::remove_dir_all(&backup_dir)?;
        }
        fs::create_dir_all(backup_dir.join(FILES_DIR))?;

        let set = Self {
            install_root: install_root.to_path_buf(),
            backup_dir,
            journal: Journal {
                target_version: target_version.to_string(),
                previous_version: previous_version.map(str::to_string),
                started_at: Utc::now(),
                backed_up: Vec::new(),
                created: Vec::new(),
                committed: false,
            },
            recorded: HashSet::new(),
        };
        debug!(dir = %set.backup_dir.display(), "backup set started");
        Ok(set)
    }

    /// Open the backup set left behind by an interrupted update.
    pub fn open(install_root: &Path) -> Result<Option<Self>, UpdateError> {
        let backup_dir = install_root.join(BACKUP_DIR_NAME);
        let data = match fs::read(backup_dir.join(JOURNAL_FILE)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if backup_dir.exists() {
                    // Never got as far as writing a journal; nothing was touched.
                    fs::remove_dir_all(&backup_dir)?;
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let journal: Journal = serde_json::from_slice(&data)?;

        for path in journal.backed_up.iter().chain(&journal.created) {
            validate_relative_path(path).map_err(|reason| {
                UpdateError::RollbackFailed(format!("journal entry {path:?}: {reason}"))
            })?;
        }

        let recorded = journal
            .backed_up
            .iter()
            .chain(&journal.created)
            .cloned()
            .collect();
        Ok(Some(Self {
            install_root: install_root.to_path_buf(),
            backup_dir,
            journal,
            recorded,
        }))
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copy the live file at `relative` into the backup.
    ///
    /// Returns `false` when there is no live file to back up.
    pub fn backup_file(&mut self, relative: &str) -> Result<bool, UpdateError> {
        if self.recorded.contains(relative) {
            return Ok(!self.journal.created.iter().any(|p| p == relative));
        }
        let live = resolve_under(&self.install_root, relative);
        if !live.is_file() {
            return Ok(false);
        }

        let copy = resolve_under(&self.backup_dir.join(FILES_DIR), relative);
        if let Some(parent) = copy.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&live, &copy)?;

        self.journal.backed_up.push(relative.to_string());
        self.recorded.insert(relative.to_string());
        debug!(path = relative, "backed up");
        Ok(true)
    }

    /// Record that the apply is about to create `relative`.
    ///
    /// Takes effect on disk with [`BackupSet::seal`].
    pub fn record_created(&mut self, relative: &str) {
        if self.recorded.insert(relative.to_string()) {
            self.journal.created.push(relative.to_string());
        }
    }

    /// Write the journal. Must happen before the apply touches a live file.
    pub fn seal(&self) -> Result<(), UpdateError> {
        self.persist()?;
        debug!(
            backed_up = self.journal.backed_up.len(),
            created = self.journal.created.len(),
            "journal written"
        );
        Ok(())
    }

    /// Record that the new version's manifest is saved.
    pub fn mark_committed(&mut self) -> Result<(), UpdateError> {
        self.journal.committed = true;
        self.persist()
    }

    /// Put every touched path back to its pre-update state.
    ///
    /// Keeps going past individual failures and reports them together.
    pub fn restore_all(&self) -> Result<(), UpdateError> {
        info!(
            target = %self.journal.target_version,
            restored = self.journal.backed_up.len(),
            removed = self.journal.created.len(),
            "rolling back"
        );
        let mut failures = Vec::new();

        for relative in &self.journal.created {
            let live = resolve_under(&self.install_root, relative);
            match fs::symlink_metadata(&live) {
                Ok(meta) if meta.is_dir() => {
                    debug!(path = %relative, "created path is a directory, leaving it");
                    continue;
                }
                Ok(_) => {}
                Err(_) => continue,
            }
            match fs::remove_file(&live) {
                Ok(()) => {
                    debug!(path = %relative, "removed created file");
                    prune_empty_parents(&self.install_root, &live);
                }
                Err(_) if !live.exists() => {}
                Err(e) => failures.push(format!("{relative}: {e}")),
            }
        }

        for relative in &self.journal.backed_up {
            if let Err(e) = self.restore_file(relative) {
                failures.push(format!("{relative}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(UpdateError::RollbackFailed(failures.join("; ")))
        }
    }

    fn restore_file(&self, relative: &str) -> std::io::Result<()> {
        let copy = resolve_under(&self.backup_dir.join(FILES_DIR), relative);
        let live = resolve_under(&self.install_root, relative);
        if let Some(parent) = live.parent() {
            fs::create_dir_all(parent)?;
        }
        if live.is_dir() {
            // left behind by files the apply created; must be empty by now
            fs::remove_dir(&live)?;
        }

        let mut tmp = live.clone().into_os_string();
        tmp.push(RESTORE_SUFFIX);
        let tmp = PathBuf::from(tmp);
        fs::copy(&copy, &tmp)?;
        fs::rename(&tmp, &live)?;
        debug!(path = %relative, "restored");
        Ok(())
    }

    /// Delete the backup directory.
    pub fn discard(self) -> Result<(), UpdateError> {
        match fs::remove_dir_all(&self.backup_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self) -> Result<(), UpdateError> {
        let path = self.backup_dir.join(JOURNAL_FILE);
        let tmp = self.backup_dir.join(format!("{JOURNAL_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(&self.journal)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Remove the directories above `path` that are now empty, stopping at
/// `root`.
pub fn prune_empty_parents(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        debug!(dir = %dir.display(), "removed empty directory");
        current = dir.parent();
    }
}

/// Resolve an update interrupted by a crash.
///
/// A journal marked committed only missed its cleanup. So did one whose
/// target is the version in the local manifest, unless the run was a
/// same-version repair, where only the flag can tell. Anything else is
/// rolled back.
pub fn recover_interrupted(
    install_root: &Path,
    installed_version: Option<&str>,
) -> Result<RecoveryOutcome, UpdateError> {
    let Some(set) = BackupSet::open(install_root)? else {
        return Ok(RecoveryOutcome::Clean);
    };
    let journal = set.journal();

    let reached_target = installed_version
        .map(|v| !versions_differ(v, &journal.target_version))
        .unwrap_or(false);
    let was_repair = journal
        .previous_version
        .as_deref()
        .map(|v| !versions_differ(v, &journal.target_version))
        .unwrap_or(false);

    if journal.committed || (reached_target && !was_repair) {
        info!(version = %journal.target_version, "interrupted update had committed, discarding backup");
        set.discard()?;
        return Ok(RecoveryOutcome::Committed);
    }

    warn!(
        target = %journal.target_version,
        started_at = %journal.started_at,
        "found interrupted update, restoring backup"
    );
    set.restore_all()?;
    set.discard()?;
    Ok(RecoveryOutcome::RolledBack)
}
