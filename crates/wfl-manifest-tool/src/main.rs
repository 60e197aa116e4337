//! wfl-manifest-tool entry point

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wfl_manifest_tool::{Cli, ExitCode};

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over the flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else if cli.verbose {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.execute() {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::Failure.to_exit_code()
        }
    }
}
