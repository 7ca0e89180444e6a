//! `platval` binary entry point.

mod cli;
mod commands;
mod error;
mod logging;
mod output;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use platval_core::PlatvalConfig;

use crate::cli::{Cli, Commands};
use crate::error::CliError;
use crate::output::OutputWriter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "platval failed");
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Config for commands that need one. A missing file falls back to the
/// defaults plus env overrides so `platval list` works anywhere.
async fn load_config(path: &Path) -> Result<PlatvalConfig, CliError> {
    if !tokio::fs::try_exists(path).await? {
        let mut config = PlatvalConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        return Ok(config);
    }
    Ok(PlatvalConfig::load(path).await?)
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let writer = OutputWriter::new(cli.output);

    if let Commands::Config(args) = cli.command {
        logging::init_tracing(cli.log_level.as_deref().unwrap_or("warn"), "pretty")
            .map_err(|e| CliError::Command(e.to_string()))?;
        commands::config::execute(args, &cli.config, &writer).await?;
        return Ok(0);
    }

    let config = load_config(&cli.config).await?;
    let level = cli.log_level.as_deref().unwrap_or(&config.general.log_level);
    logging::init_tracing(level, &config.general.log_format)
        .map_err(|e| CliError::Config(format!("{e:#}")))?;

    let registry = platval_cases::default_registry()
        .map_err(|e| CliError::Command(e.to_string()))?;

    match cli.command {
        Commands::List(args) => {
            commands::list::execute(args, &registry, &writer)?;
            Ok(0)
        }
        Commands::Run(args) => commands::run::execute(args, config, &registry, &writer).await,
        Commands::Config(_) => Ok(0),
    }
}
