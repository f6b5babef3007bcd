//! Logging.

use apm_aggregation::{error::ErrorContext as _, generic_error, GenericError};
use apm_config::GenericConfiguration;
use serde::Deserialize;
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _, EnvFilter, Layer};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_false() -> bool {
    false
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

#[derive(Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default = "default_log_level")]
    log_level: LogLevel,

    #[serde(default = "default_false")]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` instance from the given configuration.
    ///
    /// When `log_level_override` is set, it takes precedence over the configured `log_level`.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, or the override is not a valid filter, an
    /// error is returned.
    pub fn from_configuration(
        config: &GenericConfiguration, log_level_override: Option<&str>,
    ) -> Result<Self, GenericError> {
        let mut logging_config: Self = config
            .as_typed()
            .error_context("Failed to load logging configuration.")?;
        if let Some(level) = log_level_override {
            logging_config.log_level = LogLevel::try_from(level.to_string())?;
        }
        Ok(logging_config)
    }
}

#[derive(Deserialize)]
#[serde(try_from = "String")]
struct LogLevel(EnvFilter);

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

/// Initializes the logging subsystem for `tracing`.
///
/// Logs are written to standard error, leaving standard output to published documents. When `log_format_json` is
/// set, each log line is a JSON object.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: LoggingConfiguration) -> Result<(), GenericError> {
    let filter = config.log_level.0;
    if config.log_format_json {
        tracing_subscriber::registry()
            .with(initialize_tracing_json().with_filter(filter))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(initialize_tracing_pretty().with_filter(filter))
            .try_init()?;
    }

    Ok(())
}

fn initialize_tracing_json<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
}

fn initialize_tracing_pretty<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .with_target(true)
        .with_writer(std::io::stderr)
}
