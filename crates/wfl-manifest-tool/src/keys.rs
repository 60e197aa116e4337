//! Manifest signing keys.
//!
//! Keys are stored as hex text: `<prefix>_private.key` holds the 32-byte
//! Ed25519 seed and `<prefix>_public.key` the verifying key. Raw 32-byte
//! seed files are accepted when loading.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::info;

pub const PRIVATE_KEY_SUFFIX: &str = "_private.key";
pub const PUBLIC_KEY_SUFFIX: &str = "_public.key";

/// Files written by [`write_key_pair`].
#[derive(Debug, Clone)]
pub struct KeyPairFiles {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    pub verifying_key: VerifyingKey,
}

impl KeyPairFiles {
    /// Hex form of the public key, as embedded in the launcher.
    pub fn public_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }
}

/// Generate a fresh signing key from the OS RNG.
pub fn generate_signing_key() -> SigningKey {
    let mut rng = rand_core::OsRng;
    SigningKey::generate(&mut rng)
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Generate a key pair and write it next to `prefix`.
///
/// Refuses to overwrite an existing private key.
pub fn write_key_pair(prefix: &Path) -> Result<KeyPairFiles> {
    let private_key = with_suffix(prefix, PRIVATE_KEY_SUFFIX);
    let public_key = with_suffix(prefix, PUBLIC_KEY_SUFFIX);
    if private_key.exists() {
        bail!("{} already exists", private_key.display());
    }
    if let Some(parent) = private_key.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let signing_key = generate_signing_key();
    let verifying_key = signing_key.verifying_key();

    fs::write(&private_key, format!("{}\n", hex::encode(signing_key.to_bytes())))
        .with_context(|| format!("failed to write {}", private_key.display()))?;
    restrict_permissions(&private_key)?;
    fs::write(&public_key, format!("{}\n", hex::encode(verifying_key.as_bytes())))
        .with_context(|| format!("failed to write {}", public_key.display()))?;

    info!(path = %private_key.display(), "generated signing key");
    Ok(KeyPairFiles {
        private_key,
        public_key,
        verifying_key,
    })
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Load a signing key written by [`write_key_pair`], or a raw 32-byte seed.
pub fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let seed = parse_seed(&data)
        .with_context(|| format!("{} is not an Ed25519 private key", path.display()))?;
    Ok(SigningKey::from_bytes(&seed))
}

fn parse_seed(data: &[u8]) -> Result<[u8; 32]> {
    if let Ok(text) = std::str::from_utf8(data) {
        let text = text.trim();
        if text.len() == 64 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
            let mut seed = [0u8; 32];
            hex::decode_to_slice(text, &mut seed)?;
            return Ok(seed);
        }
    }
    match <[u8; 32]>::try_from(data) {
        Ok(seed) => Ok(seed),
        Err(_) => bail!("expected 64 hex characters or 32 raw bytes, got {} bytes", data.len()),
    }
}

/// Load a public key from a file, or parse it if `value` is not a file.
pub fn load_verifying_key(value: &str) -> Result<VerifyingKey> {
    let path = Path::new(value);
    let text = if path.is_file() {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    } else {
        value.to_string()
    };
    Ok(wfl_updater::security::parse_public_key(text.trim())?)
}
