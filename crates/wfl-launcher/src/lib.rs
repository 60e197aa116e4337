//! wfl-launcher - command-line front end for the Wayfarer updater
//!
//! This crate provides a command-line interface for:
//! - Checking for and installing game updates
//! - Verifying and repairing the installation
//! - Starting the installed game
//! - Viewing and editing launcher settings

pub mod cli;
pub mod launcher;
pub mod observer;

pub use cli::Cli;
pub use launcher::Launcher;
pub use observer::LoggingObserver;

/// Manifest signing key compiled into the binary, hex encoded.
///
/// Set `WFL_MANIFEST_PUBLIC_KEY` at build time. A key in the updater config
/// file takes precedence.
pub const EMBEDDED_PUBLIC_KEY: Option<&str> = option_env!("WFL_MANIFEST_PUBLIC_KEY");

/// Exit codes for CLI operations
///
/// - 0: Success - operation completed successfully
/// - 1: Failure - the operation failed or the install is damaged
/// - 130: Interrupted - cancelled with Ctrl-C
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// Operation failed (exit code 1)
    Failure = 1,
    /// Interrupted by the user (exit code 130)
    Interrupted = 130,
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Exit code for a failed command.
    pub fn for_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<wfl_updater::UpdateError>() {
            Some(wfl_updater::UpdateError::Cancelled) => ExitCode::Interrupted,
            _ => ExitCode::Failure,
        }
    }
}
