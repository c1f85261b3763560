//! Measurement buffering service.
//!
//! Subscribes to the pipeline's event bus, buffers the measurements it carries, and periodically persists them in
//! batches.

#![deny(warnings)]
#![deny(missing_docs)]

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tally_app::prelude::*;
use tally_config::{ConfigurationLoader, GenericConfiguration};
use tally_error::{ErrorContext as _, GenericError};
use tracing::{error, info};

mod cli;
use self::cli::{metrics::handle_metrics_command, run::handle_run_command};

mod config;

mod synthetic;

const DEFAULT_CONFIG_PATH: &str = "tally.yaml";
const ENV_PREFIX: &str = "tally";

#[derive(Parser)]
#[command(name = "tally", about = "Buffers pipeline measurements and persists them in batches.")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// Runs the buffering engine until interrupted. (default)
    Run,

    /// Prints the measurements the engine subscribes to.
    Metrics,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = load_configuration(&cli.config)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:?}", e)));

    let logging_config = LoggingConfiguration::from_configuration(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("invalid logging configuration: {:?}", e)));
    let _guard = initialize_logging(&logging_config)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to initialize logging: {}", e)));

    match cli.action.unwrap_or(Action::Run) {
        Action::Run => match handle_run_command(configuration).await {
            Ok(()) => info!("Tally stopped."),
            Err(e) => {
                error!("{:?}", e);
                std::process::exit(1);
            }
        },
        Action::Metrics => handle_metrics_command(),
    }
}

fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    let loader = ConfigurationLoader::default()
        .try_from_yaml(path)
        .from_environment(ENV_PREFIX)
        .error_context("Failed to configure environment variable source.")?;

    Ok(loader.into_generic())
}
