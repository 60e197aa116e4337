//! Persisted launcher settings.
//!
//! Settings are a small pretty-printed JSON file in the per-user config
//! directory. They are loaded once and cached; every save replaces the
//! cached value wholesale, so readers holding an `Arc` never observe a
//! half-modified value.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::UpdateError;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "wayfarer";
const APPLICATION: &str = "wfl-launcher";
const SETTINGS_FILE: &str = "settings.json";

/// Default number of parallel file downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LauncherSettings {
    /// Root directory of the installed game.
    pub install_path: PathBuf,
    /// URL of the published manifest.
    pub manifest_url: String,
    pub max_concurrent_downloads: usize,
    /// Version most recently started through the launcher.
    pub last_played_version: Option<String>,
    /// Reject unsigned manifests.
    pub require_signature: bool,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        let install_path = ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .map(|dirs| dirs.data_dir().join("game"))
            .unwrap_or_else(|| PathBuf::from("game"));
        Self {
            install_path,
            manifest_url: "https://cdn.wayfarer.example/stable/manifest.json".to_string(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            last_played_version: None,
            require_signature: false,
        }
    }
}

impl LauncherSettings {
    /// Concurrency limit, never below one.
    pub fn download_concurrency(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }
}

/// Loads, caches and saves [`LauncherSettings`].
#[derive(Debug)]
pub struct SettingsService {
    path: PathBuf,
    current: RwLock<Arc<LauncherSettings>>,
}

impl SettingsService {
    /// Per-user settings file location.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
    }

    /// Load settings from `path`.
    ///
    /// A missing or unreadable file yields defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = Self::read(&path);
        Self {
            path,
            current: RwLock::new(Arc::new(settings)),
        }
    }

    fn read(path: &Path) -> LauncherSettings {
        match fs::read(path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(settings) => {
                    debug!(path = %path.display(), "settings loaded");
                    settings
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "settings file is corrupt, using defaults");
                    LauncherSettings::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                LauncherSettings::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read settings, using defaults");
                LauncherSettings::default()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cached settings.
    pub fn current(&self) -> Arc<LauncherSettings> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Persist `settings` and make them current.
    pub fn save(&self, settings: LauncherSettings) -> Result<Arc<LauncherSettings>, UpdateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&settings)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        let settings = Arc::new(settings);
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::clone(&settings),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&settings),
        }
        debug!(path = %self.path.display(), "settings saved");
        Ok(settings)
    }

    /// Clone the current settings, apply `f` and save the result.
    pub fn update<F>(&self, f: F) -> Result<Arc<LauncherSettings>, UpdateError>
    where
        F: FnOnce(&mut LauncherSettings),
    {
        let mut next = (*self.current()).clone();
        f(&mut next);
        self.save(next)
    }
}
