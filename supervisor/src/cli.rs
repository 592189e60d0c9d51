//! Command line interface for the supervisor.
//!
//! Parses the command line arguments and decides how the process runs:
//! normal operation, or a one-shot operation that exits immediately.

use crate::instrumentation::tracing::{TracingConfig, TracingError, try_init_tracing};
use crate::supervisor::config::{ConfigError, SupervisorConfig};
use clap::Parser;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("could not initialize tracing: {0}")]
    Tracing(#[from] TracingError),
    #[error("could not read the supervisor config: {0}")]
    Config(#[from] ConfigError),
}

/// What action was requested from the CLI.
#[derive(Debug)]
pub enum CliCommand {
    /// Normal operation with the loaded configuration.
    Run {
        config: Box<SupervisorConfig>,
        allow_multiple: bool,
    },
    /// Perform a one-shot operation and exit successfully.
    OneShot(OneShotCommand),
}

#[derive(Debug)]
pub enum OneShotCommand {
    PrintVersion,
    PrintConfig(Box<SupervisorConfig>),
}

impl OneShotCommand {
    pub fn run(self) {
        match self {
            OneShotCommand::PrintVersion => {
                println!("centerfire-supervisor {}", env!("CARGO_PKG_VERSION"));
            }
            OneShotCommand::PrintConfig(config) => {
                println!("{config:#?}");
            }
        }
    }
}

/// Command line arguments, as parsed by [`clap`].
#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
pub struct Cli {
    /// Path to the supervisor configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,

    /// Print the version and exit.
    #[arg(long)]
    version: bool,

    /// Skip the single-instance pid file check.
    #[arg(long)]
    allow_multiple: bool,
}

impl Cli {
    /// Parses command line arguments, loads configuration and initializes
    /// tracing for normal operation.
    pub fn init() -> Result<CliCommand, CliError> {
        let cli = Self::parse();
        cli.into_command()
    }

    fn into_command(self) -> Result<CliCommand, CliError> {
        if self.version {
            return Ok(CliCommand::OneShot(OneShotCommand::PrintVersion));
        }

        let config = SupervisorConfig::load(self.config.as_deref())?;
        if self.print_config {
            return Ok(CliCommand::OneShot(OneShotCommand::PrintConfig(Box::new(
                config,
            ))));
        }

        let tracing_config = match &config.logging.level {
            Some(level) => TracingConfig::default().with_filter(level.clone()),
            None => TracingConfig::default(),
        };
        try_init_tracing(tracing_config)?;

        info!(
            "starting centerfire-supervisor {} (config: {})",
            env!("CARGO_PKG_VERSION"),
            self.config
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "defaults".to_string()),
        );

        Ok(CliCommand::Run {
            config: Box::new(config),
            allow_multiple: self.allow_multiple,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("centerfire-supervisor").chain(args.iter().copied()))
    }

    #[test]
    fn version_flag_short_circuits() {
        let command = cli(&["--version"]).into_command().unwrap();
        assert_matches!(command, CliCommand::OneShot(OneShotCommand::PrintVersion));
    }

    #[test]
    fn print_config_loads_before_printing() {
        let command = cli(&["--print-config"]).into_command().unwrap();
        assert_matches!(
            command,
            CliCommand::OneShot(OneShotCommand::PrintConfig(config)) => {
                assert!(config.discovery.enabled);
            }
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = cli(&["--print-config", "--config", "/definitely/not/here.yaml"])
            .into_command();
        assert_matches!(result, Err(CliError::Config(_)));
    }
}
