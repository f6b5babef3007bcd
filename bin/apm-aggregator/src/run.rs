use std::sync::Arc;

use apm_aggregation::{error::ErrorContext as _, AggregationConfiguration, Aggregators, Event, GenericError};
use apm_config::GenericConfiguration;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt as _, BufReader},
    select,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::{MonitoringConfiguration, RunConfig},
    internal_metrics::{MetricValue, MetricsRegistry},
    publisher::JsonLinesPublisher,
};

/// Entrypoint for the `run` command.
pub async fn run(
    run_config: RunConfig, config: GenericConfiguration, metrics: MetricsRegistry,
) -> Result<(), GenericError> {
    info!("apm-aggregator starting...");

    let aggregation_config =
        AggregationConfiguration::from_configuration(&config).error_context("Failed to load aggregation configuration.")?;
    let monitoring_config =
        MonitoringConfiguration::from_configuration(&config).error_context("Failed to load monitoring configuration.")?;

    let input: Box<dyn AsyncBufRead + Send + Unpin> = match run_config.input_path() {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_error_context(|| format!("Failed to open input file '{}'.", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let publisher = Arc::new(JsonLinesPublisher::new(tokio::io::stdout()));
    let aggregators = Arc::new(Aggregators::new(&aggregation_config, publisher));
    info!(
        transactions = aggregation_config.transactions.enabled(),
        service_destinations = aggregation_config.service_destinations.enabled(),
        "Aggregators started."
    );

    let reporter = spawn_metrics_reporter(metrics, &monitoring_config);

    let ingested = ingest_until_shutdown(&aggregators, input).await;

    info!("Stopping aggregators...");
    let stopped = aggregators.stop().await;
    reporter.abort();
    for (aggregator, telemetry) in aggregators.telemetry() {
        info!(aggregator, ?telemetry, "Final aggregator telemetry.");
    }

    ingested?;
    stopped.error_context("Failed to publish final metrics.")
}

async fn ingest_until_shutdown<R>(aggregators: &Aggregators, input: R) -> Result<(), GenericError>
where
    R: AsyncBufRead + Unpin,
{
    // Split on raw bytes so that a line with invalid UTF-8 is skipped rather than ending intake.
    let mut lines = input.split(b'\n');
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        select! {
            line = lines.next_segment() => match line.error_context("Failed to read from input.")? {
                Some(line) => ingest_line(aggregators, &line),
                None => {
                    info!("Reached end of input, shutting down...");
                    return Ok(());
                }
            },
            _ = &mut shutdown => {
                info!("Received SIGINT, shutting down...");
                return Ok(());
            }
        }
    }
}

fn ingest_line(aggregators: &Aggregators, line: &[u8]) {
    let line = line.trim_ascii();
    if line.is_empty() {
        return;
    }

    let event = match serde_json::from_slice::<Event>(line) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Skipping malformed event.");
            return;
        }
    };

    match aggregators.add_event(&event) {
        Ok(outcome) => debug!(?outcome, "Ingested event."),
        Err(e) => warn!(error = %e, "Failed to ingest event."),
    }
}

fn spawn_metrics_reporter(metrics: MetricsRegistry, config: &MonitoringConfiguration) -> JoinHandle<()> {
    let enabled = config.enabled();
    let period = config.period();

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // Nobody reads the metrics, so just keep histogram samples from piling up.
            if !enabled {
                metrics.clear_histograms();
                continue;
            }

            for metric in metrics.flush() {
                let labels = metric
                    .labels
                    .iter()
                    .map(|(key, value)| format!("{}:{}", key, value))
                    .collect::<Vec<_>>();
                match metric.value {
                    MetricValue::Counter(delta) => info!(metric = %metric.name, ?labels, delta, "Internal metric."),
                    MetricValue::Gauge(value) => info!(metric = %metric.name, ?labels, value, "Internal metric."),
                    MetricValue::Histogram { count, sum, max } => {
                        info!(metric = %metric.name, ?labels, count, sum, max, "Internal metric.")
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use apm_aggregation::{AggregatorConfiguration, CollectingPublisher};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn malformed_and_non_utf8_lines_are_skipped() {
        let publisher = Arc::new(CollectingPublisher::new());
        let config = AggregationConfiguration {
            transactions: AggregatorConfiguration::with_defaults(),
            service_destinations: AggregatorConfiguration::with_defaults(),
        };
        let aggregators = Aggregators::new(&config, publisher.clone());

        let mut input = Vec::new();
        input.extend_from_slice(
            br#"{"transaction": {"service_name": "checkout", "name": "GET /cart", "type": "request", "outcome": "success", "result": "HTTP 2xx", "duration": 12.5}}"#,
        );
        input.extend_from_slice(b"\nnot json\n\n");
        input.extend_from_slice(b"\xff\xfe{\"transaction\": \xc3\x28}\n");
        input.extend_from_slice(
            br#"{"span": {"service_name": "checkout", "destination_name": "postgresql", "destination_resource": "postgresql:5432", "duration": 3.0}}"#,
        );
        input.extend_from_slice(b"\n");
        input.extend_from_slice(
            br#"{"transaction": {"service_name": "checkout", "name": "", "type": "request", "duration": 1.0}}"#,
        );
        input.extend_from_slice(b"\n");
        ingest_until_shutdown(&aggregators, input.as_slice()).await.unwrap();
        aggregators.stop().await.unwrap();

        let documents = publisher.documents();
        assert_eq!(documents.len(), 2);
        assert!(documents.iter().all(|document| document.count() == 1));

        let telemetry = aggregators.telemetry();
        assert_eq!(telemetry[0].1.events_processed, 1);
        assert_eq!(telemetry[0].1.events_rejected, 1);
        assert_eq!(telemetry[1].1.events_processed, 1);
    }
}
