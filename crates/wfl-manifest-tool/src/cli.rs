//! CLI command definitions and argument parsing

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::generate::{generate, GenerateOptions};
use crate::keys::{load_signing_key, load_verifying_key, write_key_pair};
use crate::verify::{load_manifest, verify_directory};
use crate::ExitCode;

/// Wayfarer manifest tool - build, sign and check game manifests
#[derive(Parser, Debug)]
#[command(name = "wfl-manifest-tool")]
#[command(version, about = "Build, sign and check Wayfarer game manifests")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a manifest for a built game directory
    Generate(GenerateArgs),
    /// Check a game directory against a manifest
    Verify(VerifyArgs),
    /// Create a new signing key pair
    Keygen(KeygenArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        match self.command {
            Commands::Generate(args) => args.execute(),
            Commands::Verify(args) => args.execute(self.verbose),
            Commands::Keygen(args) => args.execute(),
        }
    }
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Built game directory
    #[arg(long, short)]
    pub input: PathBuf,

    /// Manifest file to write
    #[arg(long, short, default_value = "manifest.json")]
    pub output: PathBuf,

    /// Build version, e.g. 1.4.0
    #[arg(long)]
    pub version: String,

    /// URL the files will be served under
    #[arg(long)]
    pub base_url: String,

    /// Release channel
    #[arg(long, default_value = "stable")]
    pub channel: String,

    /// Game executable, relative to the input directory
    #[arg(long)]
    pub executable: Option<String>,

    /// Arguments the launcher passes to the executable
    #[arg(long, allow_hyphen_values = true)]
    pub launch_arguments: Option<String>,

    /// Make clients reinstall even when their version matches
    #[arg(long)]
    pub force_update: bool,

    /// Sign the manifest
    #[arg(long, requires = "private_key")]
    pub sign: bool,

    /// Private key file for --sign
    #[arg(long, env = "WFL_SIGNING_KEY")]
    pub private_key: Option<PathBuf>,
}

impl GenerateArgs {
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        let signing_key = match (self.sign, &self.private_key) {
            (true, Some(path)) => Some(load_signing_key(path)?),
            (true, None) => anyhow::bail!("--sign needs --private-key"),
            (false, _) => None,
        };

        let options = GenerateOptions {
            input: self.input,
            output: self.output,
            version: self.version,
            base_url: self.base_url,
            channel: self.channel,
            executable: self.executable,
            launch_arguments: self.launch_arguments,
            force_update: self.force_update,
        };
        let summary = generate(&options, signing_key.as_ref())?;

        println!(
            "Wrote {} ({} files, {} bytes, version {})",
            summary.output.display(),
            summary.manifest.files.len(),
            summary.manifest.total_size(),
            summary.manifest.version
        );
        if let Some(signature) = &summary.signature {
            println!("Wrote {}", signature.display());
        }
        Ok(ExitCode::Success)
    }
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Manifest file
    #[arg(long, short)]
    pub manifest: PathBuf,

    /// Game directory to check
    #[arg(long)]
    pub game_dir: PathBuf,

    /// Also check the detached signature against this key (hex or file)
    #[arg(long)]
    pub public_key: Option<String>,
}

impl VerifyArgs {
    pub fn execute(self, verbose: bool) -> anyhow::Result<ExitCode> {
        let key = self.public_key.as_deref().map(load_verifying_key).transpose()?;
        let manifest = load_manifest(&self.manifest, key.as_ref())?;
        let report = verify_directory(&manifest, &self.game_dir)?;

        for problem in &report.problems {
            println!("FAIL {problem}");
        }
        if verbose {
            for path in &report.missing_optional {
                println!("skip {path}: optional, not present");
            }
        }

        if report.is_ok() {
            println!("OK: {} files match version {}", report.checked, report.version);
            Ok(ExitCode::Success)
        } else {
            println!(
                "{} of {} files failed verification",
                report.problems.len(),
                report.checked
            );
            Ok(ExitCode::Failure)
        }
    }
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Path prefix for <prefix>_private.key and <prefix>_public.key
    #[arg(long, short, default_value = "wayfarer")]
    pub output: PathBuf,
}

impl KeygenArgs {
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        let files = write_key_pair(&self.output)?;
        println!("Private key: {}", files.private_key.display());
        println!("Public key:  {}", files.public_key.display());
        println!();
        println!("Embed this public key in the launcher:");
        println!("{}", files.public_hex());
        Ok(ExitCode::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_generate_flags() {
        let cli = Cli::parse_from([
            "wfl-manifest-tool",
            "generate",
            "--input",
            "build",
            "--version",
            "1.0.0",
            "--base-url",
            "https://cdn.example.com/1.0.0",
            "--sign",
            "--private-key",
            "release_private.key",
            "--launch-arguments",
            "-windowed",
        ]);
        match cli.command {
            Commands::Generate(args) => {
                assert!(args.sign);
                assert_eq!(args.output, PathBuf::from("manifest.json"));
                assert_eq!(args.channel, "stable");
                assert_eq!(args.launch_arguments.as_deref(), Some("-windowed"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_sign_requires_key() {
        let parsed = Cli::try_parse_from([
            "wfl-manifest-tool",
            "generate",
            "--input",
            "build",
            "--version",
            "1.0.0",
            "--base-url",
            "https://cdn.example.com",
            "--sign",
        ]);
        // WFL_SIGNING_KEY may be set in the environment
        if std::env::var_os("WFL_SIGNING_KEY").is_none() {
            assert!(parsed.is_err());
        }
    }
}
