//! Hashing and signature verification.
//!
//! Every file the updater installs is identified by its SHA-256 digest, and
//! every remote manifest may carry a detached Ed25519 signature. This module
//! holds the primitives for both.
//!
//! # Security
//!
//! - Files are streamed through the hasher with a fixed-size buffer; nothing
//!   is loaded whole into memory.
//! - Digest comparison is constant-time.
//! - A bad signature is a `false` result, never an error. Errors are reserved
//!   for malformed keys, which are configuration mistakes.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::UpdateError;

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Compute the lowercase hex SHA-256 digest of a file on the current thread.
///
/// Used by the async wrapper below and by build-time tooling that has no
/// runtime.
pub fn file_digest_blocking(path: &Path) -> Result<String, UpdateError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the lowercase hex SHA-256 digest of a file.
///
/// Hashing runs on the blocking pool so large files never stall a runtime
/// worker.
///
/// # Errors
///
/// Returns [`UpdateError::Io`] if the file cannot be opened or read.
pub async fn compute_file_digest(path: &Path) -> Result<String, UpdateError> {
    let owned: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || file_digest_blocking(&owned))
        .await
        .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?
}

/// Check a file against an expected hex digest.
///
/// Returns `false` on mismatch, on a missing file and on a malformed expected
/// digest, so callers can use it as a plain predicate.
pub async fn verify_file_digest(path: &Path, expected_hex: &str) -> bool {
    match compute_file_digest(path).await {
        Ok(actual) => {
            let matches = digests_match(&actual, expected_hex);
            if !matches {
                debug!(path = %path.display(), expected = expected_hex, actual = %actual, "digest mismatch");
            }
            matches
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "digest unavailable");
            false
        }
    }
}

/// Digest of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time comparison of two hex digests.
///
/// Comparison happens on the decoded bytes, so letter case does not matter.
/// Anything that does not decode to 32 bytes never matches.
pub fn digests_match(actual_hex: &str, expected_hex: &str) -> bool {
    let (Ok(actual), Ok(expected)) = (hex::decode(actual_hex), hex::decode(expected_hex)) else {
        return false;
    };
    if actual.len() != 32 || expected.len() != 32 {
        return false;
    }
    actual.ct_eq(&expected).unwrap_u8() == 1
}

/// Verify a detached Ed25519 signature over raw payload bytes.
///
/// Uses strict verification, which rejects malleable and small-order
/// signatures. Any decoding or verification failure yields `false`.
pub fn verify_signature(payload: &[u8], signature: &[u8], key: &VerifyingKey) -> bool {
    let signature = match Signature::from_slice(signature) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, len = signature.len(), "malformed signature bytes");
            return false;
        }
    };
    key.verify_strict(payload, &signature).is_ok()
}

/// Produce a detached signature over `payload`.
pub fn sign_payload(key: &SigningKey, payload: &[u8]) -> [u8; 64] {
    key.sign(payload).to_bytes()
}

/// Parse an Ed25519 public key.
///
/// Accepts `"ed25519:<hex>"` or bare hex of exactly 32 bytes.
pub fn parse_public_key(s: &str) -> Result<VerifyingKey, UpdateError> {
    let trimmed = s.trim();
    let hex_str = trimmed.strip_prefix("ed25519:").unwrap_or(trimmed);

    let key_data = hex::decode(hex_str)
        .map_err(|e| UpdateError::InvalidKey(format!("invalid key encoding: {e}")))?;

    let key_bytes: [u8; 32] = key_data
        .try_into()
        .map_err(|_| UpdateError::InvalidKey("Ed25519 public key must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| UpdateError::InvalidKey(format!("invalid Ed25519 public key: {e}")))
}

/// Holds the pinned manifest signing key.
#[derive(Debug, Clone, Default)]
pub struct SecurityService {
    public_key: Option<VerifyingKey>,
}

impl SecurityService {
    /// Create a service pinned to `public_key`.
    pub fn new(public_key: Option<VerifyingKey>) -> Self {
        Self { public_key }
    }

    /// Create a service from a hex (optionally `ed25519:` prefixed) key.
    pub fn from_key_str(key: &str) -> Result<Self, UpdateError> {
        Ok(Self::new(Some(parse_public_key(key)?)))
    }

    /// Whether a signing key is pinned.
    pub fn has_public_key(&self) -> bool {
        self.public_key.is_some()
    }

    /// The pinned key, if any.
    pub fn public_key(&self) -> Option<&VerifyingKey> {
        self.public_key.as_ref()
    }

    /// Verify a manifest's detached signature against the pinned key.
    ///
    /// Without a pinned key no signature can be trusted, so the result is
    /// `false`.
    pub fn verify_manifest_signature(&self, payload: &[u8], signature: &[u8]) -> bool {
        match &self.public_key {
            Some(key) => verify_signature(payload, signature, key),
            None => {
                warn!("manifest is signed but no public key is pinned; rejecting");
                false
            }
        }
    }
}
