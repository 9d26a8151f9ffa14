//! CLI entry point for the transcode daemon
//!
//! Parses command line arguments, installs logging and starts the daemon.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transcode_daemon::{Config, Daemon};

/// Transcode Daemon - supervised HandBrakeCLI transcodes over HTTP and watch folders
#[derive(Parser, Debug)]
#[command(name = "transcode-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); defaults plus environment when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured from the file, so this one goes to stderr
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging.level);
    info!(
        config = ?args.config,
        worker = %config.worker.binary,
        "Transcode daemon starting"
    );

    let daemon = match Daemon::from_config(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = daemon.run().await {
        error!(error = %e, "Daemon error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
