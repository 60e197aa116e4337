//! Manifest generation from a built game directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ed25519_dalek::SigningKey;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use wfl_updater::manifest::{is_reserved_path, validate_relative_path};
use wfl_updater::security::{file_digest_blocking, sign_payload};
use wfl_updater::{FileEntry, Manifest};

/// Extensions of files that never ship.
const NOISE_EXTENSIONS: &[&str] = &["sig", "tmp", "part", "log", "cache", "bak"];

/// File names that never ship.
const NOISE_NAMES: &[&str] = &["Thumbs.db", "desktop.ini"];

/// Inputs of one `generate` run.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub version: String,
    pub base_url: String,
    pub channel: String,
    /// Executable path; guessed from the scanned files when absent.
    pub executable: Option<String>,
    pub launch_arguments: Option<String>,
    pub force_update: bool,
}

/// What a `generate` run wrote.
#[derive(Debug, Clone)]
pub struct GenerateSummary {
    pub manifest: Manifest,
    pub output: PathBuf,
    pub signature: Option<PathBuf>,
}

/// Whether `relative` (slash-separated) is build noise.
///
/// Noise is prior manifests and signatures, temp, log and cache files,
/// private keys, and anything under a dot-prefixed name.
pub fn is_noise(relative: &str) -> bool {
    if relative.split('/').any(|segment| segment.starts_with('.')) {
        return true;
    }
    let name = relative.rsplit('/').next().unwrap_or(relative);
    if NOISE_NAMES.contains(&name) || name.ends_with(crate::keys::PRIVATE_KEY_SUFFIX) {
        return true;
    }
    if name.starts_with("manifest") && name.ends_with(".json") {
        return true;
    }
    match name.rsplit_once('.') {
        Some((_, ext)) => NOISE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

/// Slash-separated form of `path` relative to `root`.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(segments?.join("/"))
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

#[cfg(unix)]
fn is_executable_file(_path: &Path, meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path, _meta: &fs::Metadata) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}

/// Walk `input` and describe every shippable file, sorted by path.
pub fn scan_directory(input: &Path) -> Result<Vec<FileEntry>> {
    if !input.is_dir() {
        bail!("{} is not a directory", input.display());
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(input)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden_dir(e));

    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", input.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = relative_path(input, entry.path()) else {
            warn!(path = %entry.path().display(), "skipping file with a non UTF-8 path");
            continue;
        };
        if is_noise(&relative) || is_reserved_path(&relative) {
            debug!(path = %relative, "skipping");
            continue;
        }
        if let Err(reason) = validate_relative_path(&relative) {
            warn!(path = %relative, reason, "skipping file with an unusable path");
            continue;
        }

        let meta = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        if meta.len() == 0 {
            warn!(path = %relative, "skipping empty file");
            continue;
        }

        let sha256 = file_digest_blocking(entry.path())
            .with_context(|| format!("failed to hash {}", entry.path().display()))?;
        debug!(path = %relative, size = meta.len(), "hashed");

        entries.push(FileEntry {
            path: relative,
            size: meta.len(),
            sha256,
            url: None,
            compressed: false,
            optional: false,
            executable: is_executable_file(entry.path(), &meta),
            delta: None,
        });
    }

    Ok(entries)
}

/// Pick the executable when none was given: the first top-level file that
/// looks executable.
fn guess_executable(files: &[FileEntry]) -> Option<String> {
    files
        .iter()
        .filter(|f| !f.path.contains('/'))
        .find(|f| f.executable || f.path.to_ascii_lowercase().ends_with(".exe"))
        .map(|f| f.path.clone())
}

/// Scan the input directory and assemble a validated manifest.
pub fn build_manifest(options: &GenerateOptions) -> Result<Manifest> {
    let mut files = scan_directory(&options.input)?;
    if files.is_empty() {
        bail!("no files to publish under {}", options.input.display());
    }

    let executable = match &options.executable {
        Some(name) => name.trim_start_matches("./").replace('\\', "/"),
        None => guess_executable(&files)
            .context("could not determine the game executable, pass --executable")?,
    };
    match files.iter_mut().find(|f| f.path == executable) {
        Some(entry) => entry.executable = true,
        None => bail!("executable {executable} is not among the scanned files"),
    }

    let manifest = Manifest {
        version: options.version.trim().to_string(),
        channel: options.channel.clone(),
        base_url: options.base_url.trim().to_string(),
        files,
        executable_name: executable,
        launch_arguments: options.launch_arguments.clone(),
        force_update: options.force_update,
    };
    manifest.validate().context("generated manifest is invalid")?;
    Ok(manifest)
}

/// `manifest.json` → `manifest.sig`.
pub fn signature_path(output: &Path) -> PathBuf {
    output.with_extension("sig")
}

/// Write `manifest` to `output`, and its detached signature when a key is
/// given. The signature covers exactly the bytes written.
pub fn write_manifest(
    manifest: &Manifest,
    output: &Path,
    signing_key: Option<&SigningKey>,
) -> Result<Option<PathBuf>> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut bytes = serde_json::to_vec_pretty(manifest)?;
    bytes.push(b'\n');
    fs::write(output, &bytes).with_context(|| format!("failed to write {}", output.display()))?;

    let signature = match signing_key {
        Some(key) => {
            let path = signature_path(output);
            fs::write(&path, sign_payload(key, &bytes))
                .with_context(|| format!("failed to write {}", path.display()))?;
            Some(path)
        }
        None => {
            // A stale signature would no longer match.
            let stale = signature_path(output);
            if stale.exists() {
                fs::remove_file(&stale)
                    .with_context(|| format!("failed to remove {}", stale.display()))?;
            }
            None
        }
    };
    Ok(signature)
}

/// Full `generate` command.
pub fn generate(options: &GenerateOptions, signing_key: Option<&SigningKey>) -> Result<GenerateSummary> {
    let manifest = build_manifest(options)?;
    let signature = write_manifest(&manifest, &options.output, signing_key)?;
    info!(
        version = %manifest.version,
        files = manifest.files.len(),
        bytes = manifest.total_size(),
        signed = signature.is_some(),
        "manifest written"
    );
    Ok(GenerateSummary {
        manifest,
        output: options.output.clone(),
        signature,
    })
}
