//! wfl-manifest-tool - build-time companion of the Wayfarer updater
//!
//! This crate provides a command-line interface for:
//! - Generating a manifest from a built game directory
//! - Signing it with an Ed25519 key
//! - Verifying a directory against a manifest
//! - Creating signing key pairs

pub mod cli;
pub mod generate;
pub mod keys;
pub mod verify;

pub use cli::Cli;
pub use generate::{GenerateOptions, GenerateSummary};
pub use verify::{FileProblem, VerifyReport};

/// Exit codes for CLI operations
///
/// - 0: Success - operation completed successfully
/// - 1: Failure - the operation failed or verification found problems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// Operation failed (exit code 1)
    Failure = 1,
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }
}
