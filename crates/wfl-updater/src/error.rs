//! Error types for the update pipeline.
//!
//! Variants are grouped the way callers need to react to them:
//! transient network failures are retried by the downloader, integrity and
//! signature failures abort the update immediately, and I/O failures during
//! an update trigger rollback.

use thiserror::Error;

/// Errors that can occur while checking for, downloading or applying updates.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Network error (connection reset, timeout, broken stream)
    #[error("network error: {0}")]
    Network(String),

    /// Server answered with a non-success status
    #[error("request to {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },

    /// Content digest does not match the manifest
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Content size does not match the manifest
    #[error("size mismatch for {path}: expected {expected}, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// A published manifest signature did not verify
    #[error("manifest signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Signatures are required but none was published
    #[error("manifest is unsigned but a signature is required")]
    SignatureMissing,

    /// Manifest is structurally or semantically invalid
    #[error("invalid manifest: {0}")]
    Validation(String),

    /// Malformed public key (programmer or configuration error)
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Another update holds the install directory lock
    #[error("another update is already running against {0}")]
    UpdateInProgress(String),

    /// No manifest has been recorded for the install directory yet
    #[error("no installed manifest found")]
    NoLocalManifest,

    /// Restoring the backup after a failed update did not fully succeed
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// The game executable could not be located
    #[error("game executable not found in {0}")]
    ExecutableNotFound(String),

    /// Starting the game process failed
    #[error("failed to launch game: {0}")]
    Launch(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Whether retrying the same request may succeed.
    ///
    /// Only network-level failures qualify. Integrity failures are never
    /// transient: a server serving the wrong bytes keeps serving them.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::HttpStatus { .. })
    }

    /// Whether this error is an integrity failure (digest or size).
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::HashMismatch { .. } | Self::SizeMismatch { .. })
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => UpdateError::HttpStatus {
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
                status: status.as_u16(),
            },
            None => UpdateError::Network(err.to_string()),
        }
    }
}

impl From<ed25519_dalek::SignatureError> for UpdateError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        UpdateError::SignatureInvalid(err.to_string())
    }
}

impl From<url::ParseError> for UpdateError {
    fn from(err: url::ParseError) -> Self {
        UpdateError::Validation(format!("invalid url: {err}"))
    }
}
