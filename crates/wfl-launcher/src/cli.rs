//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use wfl_updater::{CancellationToken, UpdateReport};

use crate::launcher::{apply_setting, Launcher};
use crate::observer::LoggingObserver;
use crate::ExitCode;

/// Wayfarer launcher - keep the game up to date and start it
#[derive(Parser, Debug)]
#[command(name = "wfl-launcher")]
#[command(version, about = "Keep Wayfarer up to date and start it")]
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

    /// Log level when neither --verbose nor --debug is given
    #[arg(long, env = "WFL_LOG_LEVEL", default_value = "warn", global = true)]
    pub log_level: String,

    /// Only print results
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file path
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Updater config file path (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check whether an update is available
    Check(CheckArgs),
    /// Install the latest version
    Update,
    /// Check installed files against the local manifest
    Verify,
    /// Re-download damaged or missing files
    Repair,
    /// Start the game
    Play(PlayArgs),
    /// Show or change launcher settings
    Settings(SettingsArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self, cancel: CancellationToken) -> anyhow::Result<ExitCode> {
        let launcher = Launcher::load(self.settings.as_deref(), self.config.as_deref())?;
        let observer = Arc::new(LoggingObserver::new(self.quiet));

        match self.command {
            Commands::Check(args) => args.execute(&launcher, observer, &cancel).await,
            Commands::Update => update(&launcher, observer, &cancel).await,
            Commands::Verify => verify(&launcher, observer, &cancel).await,
            Commands::Repair => repair(&launcher, observer, &cancel).await,
            Commands::Play(args) => args.execute(&launcher).await,
            Commands::Settings(args) => args.execute(&launcher),
        }
    }
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Also store the remote manifest at this path
    #[arg(long)]
    pub save: Option<PathBuf>,
}

impl CheckArgs {
    pub async fn execute(
        self,
        launcher: &Launcher,
        observer: Arc<LoggingObserver>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ExitCode> {
        let service = launcher.update_service(observer)?;
        let installed = service.current_version().await?;

        match service.check_for_updates(cancel).await? {
            Some(remote) => println!(
                "Update available: {} -> {}",
                installed.as_deref().unwrap_or("not installed"),
                remote.version
            ),
            None => println!(
                "Up to date ({})",
                installed.as_deref().unwrap_or("unknown version")
            ),
        }

        if let Some(path) = self.save {
            let url = &service.settings().manifest_url;
            service
                .manifest_service()
                .downloader()
                .download_manifest(url, &path, cancel)
                .await?;
            println!("Saved manifest to {}", path.display());
        }
        Ok(ExitCode::Success)
    }
}

fn print_report(action: &str, report: &UpdateReport) {
    println!(
        "{action} {}: {} downloaded, {} unchanged, {} removed",
        report.version, report.downloaded, report.unchanged, report.removed
    );
}

async fn update(
    launcher: &Launcher,
    observer: Arc<LoggingObserver>,
    cancel: &CancellationToken,
) -> anyhow::Result<ExitCode> {
    let service = launcher.update_service(observer)?;
    match service.check_for_updates(cancel).await? {
        Some(remote) => {
            let report = service.update_game(&remote, cancel).await?;
            print_report("Installed", &report);
        }
        None => println!("Already up to date"),
    }
    Ok(ExitCode::Success)
}

async fn verify(
    launcher: &Launcher,
    observer: Arc<LoggingObserver>,
    cancel: &CancellationToken,
) -> anyhow::Result<ExitCode> {
    let service = launcher.update_service(observer)?;
    let report = service.verify_game_integrity(cancel).await?;

    for path in &report.mismatched {
        println!("FAIL {path}");
    }
    if report.is_intact() {
        println!("OK: {} files match version {}", report.checked, report.version);
        Ok(ExitCode::Success)
    } else {
        println!(
            "{} of {} files are damaged or missing, run `wfl-launcher repair`",
            report.mismatched.len(),
            report.checked
        );
        Ok(ExitCode::Failure)
    }
}

async fn repair(
    launcher: &Launcher,
    observer: Arc<LoggingObserver>,
    cancel: &CancellationToken,
) -> anyhow::Result<ExitCode> {
    let service = launcher.update_service(observer)?;
    let report = service.repair_game(cancel).await?;
    print_report("Repaired", &report);
    Ok(ExitCode::Success)
}

#[derive(Args, Debug)]
pub struct PlayArgs {
    /// Wait for the game to exit and return its status
    #[arg(long)]
    pub wait: bool,
}

impl PlayArgs {
    pub async fn execute(self, launcher: &Launcher) -> anyhow::Result<ExitCode> {
        let manifest = launcher.manifest_service()?.load_local().await?;
        let mut process = launcher.game().launch(manifest.as_ref())?;
        println!("Started {}", process.executable().display());

        if let Some(version) = manifest.as_ref().map(|m| m.version.clone()) {
            launcher
                .settings()
                .update(|s| s.last_played_version = Some(version))
                .context("failed to record the played version")?;
        }

        if !self.wait {
            return Ok(ExitCode::Success);
        }
        let status = process.wait().await?;
        info!(%status, "game exited");
        if status.success() {
            Ok(ExitCode::Success)
        } else {
            println!("Game exited with {status}");
            Ok(ExitCode::Failure)
        }
    }
}

#[derive(Args, Debug)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub action: SettingsAction,
}

#[derive(Subcommand, Debug)]
pub enum SettingsAction {
    /// Print the current settings as JSON
    Show,
    /// Change one setting
    Set {
        /// Setting name, e.g. manifestUrl
        key: String,
        /// New value
        value: String,
    },
    /// Print the settings file location
    Path,
}

impl SettingsArgs {
    pub fn execute(self, launcher: &Launcher) -> anyhow::Result<ExitCode> {
        let settings = launcher.settings();
        match self.action {
            SettingsAction::Show => {
                println!("{}", serde_json::to_string_pretty(&*settings.current())?);
            }
            SettingsAction::Set { key, value } => {
                let mut next = (*settings.current()).clone();
                apply_setting(&mut next, &key, &value)?;
                settings.save(next)?;
                println!("Set {key} = {value}");
            }
            SettingsAction::Path => println!("{}", settings.path().display()),
        }
        Ok(ExitCode::Success)
    }
}
