use std::sync::Arc;

use tracing::trace;

use crate::{
    aggregator::{Aggregator, IngestOutcome},
    config::AggregationConfiguration,
    error::{IngestError, PublishError},
    event::{Event, Span, Transaction},
    key::{weight, ServiceDestinationKey, ServiceDestinationKeyRef, TransactionKey, TransactionKeyRef},
    publisher::Publisher,
    telemetry::TelemetrySnapshot,
};

/// Name of the transaction metrics aggregator.
pub const TRANSACTION_METRICS: &str = "txmetrics";

/// Name of the service destination metrics aggregator.
pub const SERVICE_DESTINATION_METRICS: &str = "spanmetrics";

/// Entry point for trace events.
///
/// Owns one aggregator per enabled aggregation kind and routes each event to the aggregator for its kind. Ingesting an
/// event never waits on I/O, rotation, or publishing.
pub struct Aggregators {
    transactions: Option<Aggregator<TransactionKey>>,
    service_destinations: Option<Aggregator<ServiceDestinationKey>>,
}

impl Aggregators {
    /// Creates a new `Aggregators`, starting an aggregator for each enabled aggregation kind.
    ///
    /// Every aggregator publishes to `publisher`. Must be called from within a Tokio runtime.
    pub fn new(config: &AggregationConfiguration, publisher: Arc<dyn Publisher>) -> Self {
        let transactions = config.transactions.enabled().then(|| {
            Aggregator::new(
                TRANSACTION_METRICS,
                config.transactions.clone(),
                Arc::clone(&publisher),
            )
        });
        let service_destinations = config.service_destinations.enabled().then(|| {
            Aggregator::new(
                SERVICE_DESTINATION_METRICS,
                config.service_destinations.clone(),
                Arc::clone(&publisher),
            )
        });

        Self {
            transactions,
            service_destinations,
        }
    }

    /// Returns the transaction metrics aggregator, if enabled.
    pub fn transactions(&self) -> Option<&Aggregator<TransactionKey>> {
        self.transactions.as_ref()
    }

    /// Returns the service destination metrics aggregator, if enabled.
    pub fn service_destinations(&self) -> Option<&Aggregator<ServiceDestinationKey>> {
        self.service_destinations.as_ref()
    }

    /// Aggregates a transaction.
    ///
    /// Sampled and unsampled transactions are aggregated alike.
    ///
    /// # Errors
    ///
    /// If the transaction is missing an identity field, or transaction metrics have stopped, an error is returned.
    pub fn add_transaction(&self, tx: &Transaction) -> Result<IngestOutcome, IngestError> {
        let Some(aggregator) = &self.transactions else {
            return Ok(IngestOutcome::Ignored);
        };

        let key = TransactionKeyRef::from_transaction(tx).inspect_err(|e| {
            trace!(error = %e, "Rejecting transaction.");
            aggregator.telemetry().increment_events_rejected();
        })?;

        aggregator.record(&key, tx.duration, weight(tx.sample_rate), Some(tx.result.as_str()))
    }

    /// Aggregates a span.
    ///
    /// Spans without a destination resource are ignored.
    ///
    /// # Errors
    ///
    /// If the span is missing an identity field, or service destination metrics have stopped, an error is returned.
    pub fn add_span(&self, span: &Span) -> Result<IngestOutcome, IngestError> {
        let Some(aggregator) = &self.service_destinations else {
            return Ok(IngestOutcome::Ignored);
        };

        let key = ServiceDestinationKeyRef::from_span(span).inspect_err(|e| {
            trace!(error = %e, "Rejecting span.");
            aggregator.telemetry().increment_events_rejected();
        })?;

        match key {
            Some(key) => aggregator.record(&key, span.duration, weight(span.sample_rate), None),
            None => {
                aggregator.telemetry().increment_events_ignored();
                Ok(IngestOutcome::Ignored)
            }
        }
    }

    /// Aggregates an event of either kind.
    ///
    /// # Errors
    ///
    /// See [`add_transaction`][Self::add_transaction] and [`add_span`][Self::add_span].
    pub fn add_event(&self, event: &Event) -> Result<IngestOutcome, IngestError> {
        match event {
            Event::Transaction(tx) => self.add_transaction(tx),
            Event::Span(span) => self.add_span(span),
        }
    }

    /// Stops every aggregator, flushing their active windows.
    ///
    /// Aggregators are stopped concurrently, and every aggregator is stopped even if another fails to publish its final
    /// window. Calling `stop` again is a no-op.
    ///
    /// # Errors
    ///
    /// If any final window could not be published, the first such error is returned.
    pub async fn stop(&self) -> Result<(), PublishError> {
        let (transactions, service_destinations) = tokio::join!(
            async {
                match &self.transactions {
                    Some(aggregator) => aggregator.stop().await,
                    None => Ok(()),
                }
            },
            async {
                match &self.service_destinations {
                    Some(aggregator) => aggregator.stop().await,
                    None => Ok(()),
                }
            },
        );

        transactions.and(service_destinations)
    }

    /// Returns the telemetry of every enabled aggregator, keyed by aggregator name.
    pub fn telemetry(&self) -> Vec<(&'static str, TelemetrySnapshot)> {
        let mut snapshots = Vec::with_capacity(2);
        if let Some(aggregator) = &self.transactions {
            snapshots.push((aggregator.name(), aggregator.telemetry().snapshot()));
        }
        if let Some(aggregator) = &self.service_destinations {
            snapshots.push((aggregator.name(), aggregator.telemetry().snapshot()));
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::AggregatorConfiguration, event::Outcome, publisher::CollectingPublisher};

    fn all_enabled() -> AggregationConfiguration {
        AggregationConfiguration {
            transactions: AggregatorConfiguration::with_defaults(),
            service_destinations: AggregatorConfiguration::with_defaults(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_kinds_are_ignored() {
        let publisher = Arc::new(CollectingPublisher::new());
        let aggregators = Aggregators::new(&AggregationConfiguration::with_defaults(), publisher.clone());
        assert!(aggregators.service_destinations().is_none());

        let span = Span::new("checkout", "postgresql", "db:5432", Duration::from_millis(1));
        assert_eq!(aggregators.add_span(&span), Ok(IngestOutcome::Ignored));
        assert_eq!(aggregators.telemetry().len(), 1);

        aggregators.stop().await.unwrap();
        assert!(publisher.documents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_events_are_rejected_and_counted() {
        let aggregators = Aggregators::new(&all_enabled(), Arc::new(CollectingPublisher::new()));

        let tx = Transaction::new("checkout", "", "request", Duration::from_millis(1));
        assert_eq!(
            aggregators.add_transaction(&tx),
            Err(IngestError::InvalidEvent { field: "name" })
        );

        let span = Span::new("checkout", "postgresql", "", Duration::from_millis(1));
        assert_eq!(aggregators.add_span(&span), Ok(IngestOutcome::Ignored));

        let telemetry = aggregators.telemetry();
        assert_eq!(telemetry[0], (TRANSACTION_METRICS, TelemetrySnapshot {
            events_rejected: 1,
            ..Default::default()
        }));
        assert_eq!(telemetry[1].1.events_ignored, 1);

        aggregators.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sample_rate_scales_histogram_mass() {
        let publisher = Arc::new(CollectingPublisher::new());
        let aggregators = Aggregators::new(&all_enabled(), publisher.clone());

        let tx = Transaction::new("checkout", "GET /", "request", Duration::from_millis(40))
            .with_outcome(Outcome::Success)
            .with_result("HTTP 2xx")
            .with_sample_rate(0.1);
        aggregators.add_event(&Event::Transaction(tx)).unwrap();
        aggregators.stop().await.unwrap();

        let documents = publisher.documents();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].count(), 1);
        assert_eq!(documents[0].representative_count(), 10);
        assert_eq!(documents[0].result_counts()["HTTP 2xx"], 1);
    }
}
