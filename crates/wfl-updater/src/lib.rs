//! # wfl-updater
//!
//! Secure, resumable game updater for the Wayfarer launcher.
//!
//! This crate handles:
//! - Manifest acquisition with detached Ed25519 signature verification
//! - Parallel, resumable file downloads with SHA-256 verification
//! - Atomic apply with backup, rollback and crash recovery
//! - Installation integrity checks and repair
//! - Launcher settings and starting the installed game
//!
//! ## Security
//!
//! - A published manifest signature must verify against the pinned key;
//!   unsigned manifests can be refused with `require_signature`
//! - Every file is checked against its manifest digest before it reaches
//!   the install directory, and again as a batch before apply
//! - Manifest paths cannot escape the install directory
//! - The locally recorded manifest changes only after a complete apply

pub mod config;
pub mod download;
pub mod error;
pub mod launch;
pub mod lock;
pub mod manifest;
pub mod progress;
#[cfg(test)]
mod proptests;
pub mod rollback;
pub mod security;
pub mod settings;
pub mod update;

// Re-export main types for convenience
pub use config::{LockConfig, NetworkConfig, SecurityConfig, UpdaterConfig};
pub use download::{DownloadProgress, Downloader, DownloaderConfig, FileDownload};
pub use error::UpdateError;
pub use launch::{GameLaunchService, GameProcess};
pub use lock::UpdateLock;
pub use manifest::{DeltaInfo, FileEntry, Manifest, ManifestService, ManifestVersion};
pub use progress::{
    ChannelObserver, NoopObserver, UpdateEvent, UpdateObserver, UpdateProgress, UpdateStatus,
};
pub use rollback::RecoveryOutcome;
pub use security::SecurityService;
pub use settings::{LauncherSettings, SettingsService};
pub use update::{IntegrityReport, UpdateReport, UpdateService};

/// Re-exported so callers can create tokens without a direct dependency.
pub use tokio_util::sync::CancellationToken;
