use std::{path::PathBuf, time::Duration};

use apm_aggregation::{error::ErrorContext as _, generic_error, GenericError};
use apm_config::GenericConfiguration;
use clap::{Args, Parser, Subcommand};

const DEFAULT_MONITORING_PERIOD: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Log level filter, overriding the configured `log_level`.
    ///
    /// Accepts anything `RUST_LOG` would: `debug`, `apm_aggregation=trace,info`, and so on.
    #[arg(global = true, long)]
    pub log_level: Option<String>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Aggregates trace events read as JSON lines, writing metric documents to stdout.
    #[command(name = "run")]
    Run(RunConfig),
}

/// Run configuration.
#[derive(Args, Clone, Debug)]
pub struct RunConfig {
    /// Path to the YAML configuration file.
    ///
    /// Environment variables prefixed with `APM_` are layered on top of the file.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Path to read events from, or `-` for stdin.
    #[arg(short = 'i', long, default_value = "-")]
    pub input: PathBuf,
}

impl RunConfig {
    /// Returns the input path, or `None` when events are read from stdin.
    pub fn input_path(&self) -> Option<&PathBuf> {
        (self.input.as_os_str() != "-").then_some(&self.input)
    }
}

/// Self-monitoring configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitoringConfiguration {
    enabled: bool,
    period: Duration,
}

impl MonitoringConfiguration {
    /// Creates a new `MonitoringConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If `monitoring.period` is not a positive number of seconds, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let enabled = config.try_get_typed("monitoring.enabled")?.unwrap_or(false);
        let period = match config.try_get_typed::<f64>("monitoring.period")? {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|period| !period.is_zero())
                .ok_or_else(|| generic_error!("monitoring.period must be a positive number of seconds, got {}.", secs))?,
            None => DEFAULT_MONITORING_PERIOD,
        };

        Ok(Self { enabled, period })
    }

    /// Returns `true` if internal metrics should be logged periodically.
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the interval between telemetry snapshots.
    pub const fn period(&self) -> Duration {
        self.period
    }
}

/// Loads the configuration file, if any, layered with `APM_` environment variables.
pub fn load_configuration(run_config: &RunConfig) -> Result<GenericConfiguration, GenericError> {
    let mut loader = apm_config::ConfigurationLoader::default();
    if let Some(path) = &run_config.config {
        loader = loader
            .from_yaml(path)
            .with_error_context(|| format!("Failed to load configuration file '{}'.", path.display()))?;
    }

    let loader = loader
        .from_environment("apm")
        .error_context("Failed to load configuration from environment.")?;

    Ok(loader.into_generic())
}
