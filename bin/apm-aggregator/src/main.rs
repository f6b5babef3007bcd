//! APM metrics aggregator.
//!
//! Reads transactions and spans as JSON lines, aggregates them into per-interval transaction and service destination
//! metrics, and writes the resulting metric documents to stdout as JSON lines.

#![deny(warnings)]
#![deny(missing_docs)]

use clap::Parser as _;
use tracing::{error, info};

mod config;
use self::config::{load_configuration, Action, Cli};

mod internal_metrics;
use self::internal_metrics::initialize_metrics;

mod logging;
use self::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};

mod publisher;

mod run;
use self::run::run;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.action {
        Action::Run(run_config) => {
            let configuration = load_configuration(&run_config)
                .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:?}", e)));
            let logging_config = LoggingConfiguration::from_configuration(&configuration, cli.log_level.as_deref())
                .unwrap_or_else(|e| fatal_and_exit(format!("failed to load logging configuration: {:?}", e)));
            if let Err(e) = initialize_logging(logging_config) {
                fatal_and_exit(format!("failed to initialize logging: {}", e));
            }

            // The recorder has to be in place before the aggregators register their telemetry handles.
            let metrics = initialize_metrics("apm")
                .unwrap_or_else(|e| fatal_and_exit(format!("failed to initialize metrics: {}", e)));

            match run(run_config, configuration, metrics).await {
                Ok(()) => info!("apm-aggregator stopped."),
                Err(e) => {
                    error!("{:?}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
