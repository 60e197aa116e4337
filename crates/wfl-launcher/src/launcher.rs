//! Wiring of settings, updater config and services.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use tracing::{debug, warn};

use wfl_updater::security::parse_public_key;
use wfl_updater::{
    Downloader, GameLaunchService, LauncherSettings, ManifestService, SecurityService,
    SettingsService, UpdateObserver, UpdateService, UpdaterConfig,
};

use crate::EMBEDDED_PUBLIC_KEY;

const CONFIG_FILE: &str = "updater.toml";

/// Loaded launcher state.
#[derive(Debug)]
pub struct Launcher {
    settings: SettingsService,
    config: UpdaterConfig,
}

impl Launcher {
    pub fn new(settings: SettingsService, config: UpdaterConfig) -> Self {
        Self { settings, config }
    }

    /// Load settings and updater config, from the given paths or the
    /// per-user defaults.
    pub fn load(settings_path: Option<&Path>, config_path: Option<&Path>) -> Result<Self> {
        let settings_path = match settings_path {
            Some(path) => path.to_path_buf(),
            None => SettingsService::default_path()
                .context("cannot determine the settings directory, pass --settings")?,
        };
        let settings = SettingsService::load(settings_path);

        let config = match config_path {
            // An explicit path must exist.
            Some(path) => UpdaterConfig::load_from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => match default_config_path() {
                Some(path) => UpdaterConfig::load_or_default(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => UpdaterConfig::default(),
            },
        };

        Ok(Self::new(settings, config))
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Pinned manifest key: the config file's, else the compiled-in one.
    pub fn security(&self) -> Result<SecurityService> {
        if let Some(key) = self.config.security.public_key()? {
            debug!("using manifest key from config");
            return Ok(SecurityService::new(Some(key)));
        }
        match EMBEDDED_PUBLIC_KEY.filter(|k| !k.trim().is_empty()) {
            Some(key) => Ok(SecurityService::new(Some(parse_public_key(key)?))),
            None => {
                warn!("no manifest signing key configured, signatures cannot be checked");
                Ok(SecurityService::default())
            }
        }
    }

    /// Settings as the updater sees them, with config policy merged in.
    pub fn effective_settings(&self) -> Arc<LauncherSettings> {
        let current = self.settings.current();
        if self.config.security.require_signature && !current.require_signature {
            let mut merged = (*current).clone();
            merged.require_signature = true;
            Arc::new(merged)
        } else {
            current
        }
    }

    pub fn downloader(&self) -> Result<Downloader> {
        Ok(Downloader::with_config(self.config.network.downloader_config())?)
    }

    pub fn manifest_service(&self) -> Result<ManifestService> {
        let settings = self.effective_settings();
        Ok(
            ManifestService::new(settings.install_path.clone(), self.downloader()?, self.security()?)
                .with_require_signature(settings.require_signature),
        )
    }

    pub fn update_service(&self, observer: Arc<dyn UpdateObserver>) -> Result<UpdateService> {
        let service =
            UpdateService::new(self.effective_settings(), self.manifest_service()?)
                .with_lock_stale_after(self.config.lock.stale_after())
                .with_observer(observer);
        Ok(service)
    }

    pub fn game(&self) -> GameLaunchService {
        GameLaunchService::new(self.settings.current().install_path.clone())
    }
}

/// Per-user location of the updater config file.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "wayfarer", "wfl-launcher").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Setting names accepted by `settings set`, in their JSON spelling.
pub const SETTING_KEYS: &[&str] = &[
    "installPath",
    "manifestUrl",
    "maxConcurrentDownloads",
    "lastPlayedVersion",
    "requireSignature",
];

/// Assign `value` to the setting named `key`.
///
/// Keys match case-insensitively and ignore `_` and `-`, so `manifest_url`
/// and `manifest-url` both name `manifestUrl`.
pub fn apply_setting(settings: &mut LauncherSettings, key: &str, value: &str) -> Result<()> {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let value = value.trim();

    match normalized.as_str() {
        "installpath" => {
            if value.is_empty() {
                bail!("installPath cannot be empty");
            }
            settings.install_path = PathBuf::from(value);
        }
        "manifesturl" => {
            url_check(value)?;
            settings.manifest_url = value.to_string();
        }
        "maxconcurrentdownloads" => {
            let n: usize = value
                .parse()
                .with_context(|| format!("{value:?} is not a number"))?;
            if n == 0 {
                bail!("maxConcurrentDownloads must be at least 1");
            }
            settings.max_concurrent_downloads = n;
        }
        "lastplayedversion" => {
            settings.last_played_version = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
        }
        "requiresignature" => {
            settings.require_signature = match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                _ => bail!("{value:?} is not a boolean"),
            };
        }
        _ => bail!("unknown setting {key:?}, expected one of {}", SETTING_KEYS.join(", ")),
    }
    Ok(())
}

fn url_check(value: &str) -> Result<()> {
    if value.starts_with("https://") || value.starts_with("http://") {
        Ok(())
    } else {
        bail!("{value:?} is not an http(s) URL")
    }
}
