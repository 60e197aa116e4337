//! Game manifests: data model, validation and acquisition.
//!
//! A manifest names one installable build: its version, where its files
//! live, and the SHA-256 digest and size of every file. The client only ever
//! reads manifests; they are produced by `wfl-manifest-tool`.
//!
//! # Security
//!
//! - A remote manifest with a published detached signature is accepted only
//!   if the signature verifies against the pinned key. There is no fallback
//!   to unsigned trust once a signature exists.
//! - Unsigned manifests are accepted unless `require_signature` is set.
//! - Entry paths are confined to the install root: absolute paths, `..`
//!   segments, backslashes and drive prefixes are rejected during validation.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::download::{write_atomic, Downloader, PARTIAL_SUFFIX};
use crate::error::UpdateError;
use crate::rollback::RESTORE_SUFFIX;
use crate::security::{SecurityService, DIGEST_HEX_LEN};

/// File name of the manifest recorded at the install root.
pub const LOCAL_MANIFEST_FILE: &str = "manifest.json";

/// One installable build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Build version, 2 to 4 dot-separated integers.
    pub version: String,
    /// Release channel name.
    #[serde(default)]
    pub channel: String,
    /// Base URL that entry paths are resolved against.
    #[serde(default)]
    pub base_url: String,
    /// Every file of the build.
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Executable started by the launcher.
    #[serde(default, rename = "gameExecutable", alias = "executableName")]
    pub executable_name: String,
    /// Extra arguments passed to the executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_arguments: Option<String>,
    /// Install even if the local version already matches.
    #[serde(default)]
    pub force_update: bool,
}

/// Expected identity of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Slash-separated path relative to the install root.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
    /// Explicit download URL, absolute or relative to the base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub compressed: bool,
    /// A missing optional file does not fail integrity checks.
    #[serde(default)]
    pub optional: bool,
    /// Marked executable after install.
    #[serde(default)]
    pub executable: bool,
    /// Reserved binary patch metadata. Carried through, never applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaInfo>,
}

/// Patch from an earlier version of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaInfo {
    #[serde(rename = "from", alias = "fromVersion")]
    pub from_version: String,
    pub url: String,
    pub sha256: String,
    pub size: u64,
}

impl Manifest {
    /// Parse a manifest from JSON without validating it.
    pub fn from_json(data: &[u8]) -> Result<Self, UpdateError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Parsed numeric version.
    pub fn parsed_version(&self) -> Result<ManifestVersion, UpdateError> {
        self.version.parse()
    }

    /// Sum of all entry sizes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Look up an entry by its relative path.
    pub fn find_file(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Resolve the download URL of an entry.
    ///
    /// An explicit entry URL wins; a relative one is resolved against the
    /// base URL, as is the entry path when no URL is given.
    pub fn file_url(&self, entry: &FileEntry) -> Result<Url, UpdateError> {
        if let Some(explicit) = &entry.url {
            if let Ok(absolute) = Url::parse(explicit) {
                return Ok(absolute);
            }
            return Ok(self.base()?.join(explicit)?);
        }
        Ok(self.base()?.join(&entry.path)?)
    }

    fn base(&self) -> Result<Url, UpdateError> {
        if self.base_url.ends_with('/') {
            Ok(Url::parse(&self.base_url)?)
        } else {
            Ok(Url::parse(&format!("{}/", self.base_url))?)
        }
    }

    /// Structural and semantic checks.
    ///
    /// A manifest that fails here must never reach the update pipeline.
    pub fn validate(&self) -> Result<(), UpdateError> {
        self.parsed_version()?;

        if self.base_url.trim().is_empty() {
            return Err(UpdateError::Validation("baseUrl is empty".to_string()));
        }
        self.base()?;

        if self.files.is_empty() {
            return Err(UpdateError::Validation("file list is empty".to_string()));
        }

        let mut seen = HashSet::with_capacity(self.files.len());
        for entry in &self.files {
            validate_relative_path(&entry.path)
                .map_err(|reason| UpdateError::Validation(format!("{:?}: {reason}", entry.path)))?;

            if is_reserved_path(&entry.path) {
                return Err(UpdateError::Validation(format!(
                    "{}: path is reserved for the updater",
                    entry.path
                )));
            }
            if !is_lower_hex_digest(&entry.sha256) {
                return Err(UpdateError::Validation(format!(
                    "{}: sha256 must be {} lowercase hex characters",
                    entry.path, DIGEST_HEX_LEN
                )));
            }
            if entry.size == 0 {
                return Err(UpdateError::Validation(format!(
                    "{}: size must be positive",
                    entry.path
                )));
            }
            if !seen.insert(entry.path.as_str()) {
                return Err(UpdateError::Validation(format!(
                    "{}: duplicate path",
                    entry.path
                )));
            }
        }

        // Entries must not collide on disk, live or while staged.
        for entry in &self.files {
            let path = entry.path.as_str();
            for (i, _) in path.match_indices('/') {
                if seen.contains(&path[..i]) {
                    return Err(UpdateError::Validation(format!(
                        "{path}: nested under the file entry {}",
                        &path[..i]
                    )));
                }
            }
            for suffix in [PARTIAL_SUFFIX, RESTORE_SUFFIX] {
                if let Some(sibling) = path.strip_suffix(suffix) {
                    if seen.contains(sibling) {
                        return Err(UpdateError::Validation(format!(
                            "{path}: clashes with the temporary file of {sibling}"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Predicate form of [`Manifest::validate`].
    pub fn is_valid(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "manifest failed validation");
                false
            }
        }
    }
}

/// Whether `s` is a 64-character lowercase hex digest.
pub fn is_lower_hex_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Check that a manifest path stays inside the install root.
pub fn validate_relative_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("path is empty");
    }
    if path.contains('\\') {
        return Err("path contains a backslash");
    }
    if path.contains('\0') {
        return Err("path contains a NUL byte");
    }
    if path.starts_with('/') {
        return Err("path is absolute");
    }
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return Err("path has a drive prefix");
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err("path has an empty segment"),
            "." | ".." => return Err("path has a relative segment"),
            _ => {}
        }
    }
    Ok(())
}

/// Paths the updater itself owns at the install root.
pub fn is_reserved_path(path: &str) -> bool {
    path == LOCAL_MANIFEST_FILE || path.starts_with(".wfl-")
}

/// Resolve a validated manifest path under `root`.
pub fn resolve_under(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(root.to_path_buf(), |acc, segment| acc.join(segment))
}

/// Numeric build version with 2 to 4 components.
///
/// Missing trailing components compare as zero, so `1.2` equals `1.2.0`.
#[derive(Debug, Clone)]
pub struct ManifestVersion {
    parts: Vec<u64>,
}

impl ManifestVersion {
    /// Components as parsed.
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }
}

impl FromStr for ManifestVersion {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || UpdateError::Validation(format!("invalid version {s:?}"));
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let parts = trimmed
            .split('.')
            .map(|p| {
                if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                p.parse::<u64>().map_err(|_| invalid())
            })
            .collect::<Result<Vec<_>, _>>()?;

        if !(2..=4).contains(&parts.len()) {
            return Err(invalid());
        }
        Ok(Self { parts })
    }
}

impl Ord for ManifestVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for ManifestVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ManifestVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ManifestVersion {}

impl fmt::Display for ManifestVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .parts
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&joined)
    }
}

/// Whether two version strings name different builds.
///
/// Unparseable versions fall back to string comparison.
pub fn versions_differ(a: &str, b: &str) -> bool {
    match (a.parse::<ManifestVersion>(), b.parse::<ManifestVersion>()) {
        (Ok(a), Ok(b)) => a != b,
        _ => a.trim() != b.trim(),
    }
}

/// URL of the detached signature published next to `manifest_url`.
///
/// `.../manifest.json` maps to `.../manifest.sig`; any other path gets
/// `.sig` appended. Query strings are preserved.
pub fn signature_url_for(manifest_url: &str) -> Result<String, UpdateError> {
    let mut url = Url::parse(manifest_url)?;
    let path = url.path().to_string();
    let sig_path = match path.strip_suffix(".json") {
        Some(stem) => format!("{stem}.sig"),
        None => format!("{path}.sig"),
    };
    url.set_path(&sig_path);
    Ok(url.to_string())
}

/// Loads, saves and fetches manifests for one install root.
#[derive(Clone)]
pub struct ManifestService {
    install_root: PathBuf,
    downloader: Downloader,
    security: SecurityService,
    require_signature: bool,
}

impl ManifestService {
    /// Create a service for `install_root`.
    pub fn new(install_root: PathBuf, downloader: Downloader, security: SecurityService) -> Self {
        Self {
            install_root,
            downloader,
            security,
            require_signature: false,
        }
    }

    /// Reject unsigned remote manifests.
    pub fn with_require_signature(mut self, require: bool) -> Self {
        self.require_signature = require;
        self
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn requires_signature(&self) -> bool {
        self.require_signature
    }

    /// Location of the recorded manifest.
    pub fn local_manifest_path(&self) -> PathBuf {
        self.install_root.join(LOCAL_MANIFEST_FILE)
    }

    /// Read the manifest recorded by the last successful apply.
    ///
    /// Returns `None` on first run. An unreadable record is logged and
    /// treated the same way, so the next update re-verifies every file.
    pub async fn load_local(&self) -> Result<Option<Manifest>, UpdateError> {
        let path = self.local_manifest_path();
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no local manifest");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match Manifest::from_json(&data) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "local manifest is corrupt, ignoring");
                Ok(None)
            }
        }
    }

    /// Record `manifest` as installed. Atomic: temp file then rename.
    pub async fn save_local(&self, manifest: &Manifest) -> Result<(), UpdateError> {
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.local_manifest_path(), &json).await?;
        info!(version = %manifest.version, "local manifest saved");
        Ok(())
    }

    /// Fetch, authenticate, parse and validate the remote manifest.
    pub async fn fetch_remote(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Manifest, UpdateError> {
        info!(url, "fetching remote manifest");
        let payload = self.downloader.download_bytes(url, cancel).await?;

        let sig_url = signature_url_for(url)?;
        match self.downloader.fetch_optional(&sig_url, cancel).await? {
            Some(signature) => {
                if !self.security.verify_manifest_signature(&payload, &signature) {
                    return Err(UpdateError::SignatureInvalid(format!(
                        "signature at {sig_url} does not match manifest"
                    )));
                }
                info!("manifest signature verified");
            }
            None if self.require_signature => return Err(UpdateError::SignatureMissing),
            None => warn!(url, "manifest is unsigned, accepting"),
        }

        parse_and_validate(&payload)
    }
}

/// Parse manifest bytes and run [`Manifest::validate`].
pub fn parse_and_validate(data: &[u8]) -> Result<Manifest, UpdateError> {
    let manifest = Manifest::from_json(data)?;
    manifest.validate()?;
    Ok(manifest)
}
