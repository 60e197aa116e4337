//! Checking a built directory against a manifest.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use tracing::debug;

use wfl_updater::manifest::{parse_and_validate, resolve_under};
use wfl_updater::security::{digests_match, file_digest_blocking, verify_signature};
use wfl_updater::Manifest;

use crate::generate::signature_path;

/// Why one file does not match its entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileProblem {
    Missing {
        path: String,
    },
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for FileProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { path } => write!(f, "{path}: missing"),
            Self::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(f, "{path}: size {actual}, expected {expected}"),
            Self::HashMismatch {
                path,
                expected,
                actual,
            } => write!(f, "{path}: sha256 {actual}, expected {expected}"),
        }
    }
}

/// Outcome of checking a directory.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub version: String,
    pub checked: usize,
    pub problems: Vec<FileProblem>,
    /// Optional entries that are absent. Not a failure.
    pub missing_optional: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Read and validate a manifest file, checking its detached signature when
/// a public key is given.
pub fn load_manifest(path: &Path, public_key: Option<&VerifyingKey>) -> Result<Manifest> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    if let Some(key) = public_key {
        let sig_path = signature_path(path);
        let signature = fs::read(&sig_path)
            .with_context(|| format!("failed to read {}", sig_path.display()))?;
        if !verify_signature(&bytes, &signature, key) {
            anyhow::bail!("signature {} does not verify", sig_path.display());
        }
        debug!(path = %sig_path.display(), "signature verified");
    }

    parse_and_validate(&bytes).with_context(|| format!("{} is not a valid manifest", path.display()))
}

fn check_entry(game_dir: &Path, path: &str, size: u64, sha256: &str) -> Result<Option<FileProblem>> {
    let file = resolve_under(game_dir, path);
    let meta = match fs::metadata(&file) {
        Ok(meta) if meta.is_file() => meta,
        _ => return Ok(Some(FileProblem::Missing { path: path.to_string() })),
    };
    if meta.len() != size {
        return Ok(Some(FileProblem::SizeMismatch {
            path: path.to_string(),
            expected: size,
            actual: meta.len(),
        }));
    }

    let actual = file_digest_blocking(&file)?;
    if !digests_match(&actual, sha256) {
        return Ok(Some(FileProblem::HashMismatch {
            path: path.to_string(),
            expected: sha256.to_string(),
            actual,
        }));
    }
    Ok(None)
}

/// Check every entry of `manifest` under `game_dir`.
pub fn verify_directory(manifest: &Manifest, game_dir: &Path) -> Result<VerifyReport> {
    let mut report = VerifyReport {
        version: manifest.version.clone(),
        checked: 0,
        problems: Vec::new(),
        missing_optional: Vec::new(),
    };

    for entry in &manifest.files {
        report.checked += 1;
        match check_entry(game_dir, &entry.path, entry.size, &entry.sha256)? {
            None => debug!(path = %entry.path, "ok"),
            Some(FileProblem::Missing { path }) if entry.optional => report.missing_optional.push(path),
            Some(problem) => report.problems.push(problem),
        }
    }
    Ok(report)
}
