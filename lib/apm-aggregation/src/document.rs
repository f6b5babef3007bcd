//! Aggregated metric documents.

use std::{collections::BTreeMap, time::Duration};

use apm_histogram::HistogramSnapshot;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

use crate::accumulator::Accumulator;

/// Identity fields of a document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DocumentKey {
    /// Transaction metrics.
    Transaction {
        /// Service name.
        service_name: String,

        /// Service environment.
        environment: String,

        /// Transaction name.
        name: String,

        /// Transaction type.
        transaction_type: String,

        /// Transaction outcome.
        outcome: String,
    },

    /// Service destination metrics.
    ServiceDestination {
        /// Service name.
        service_name: String,

        /// Service environment.
        environment: String,

        /// Destination service name.
        destination_name: String,

        /// Destination resource.
        destination_resource: String,
    },
}

impl DocumentKey {
    /// Returns the name of the metricset this key belongs to.
    pub const fn metricset(&self) -> &'static str {
        match self {
            Self::Transaction { .. } => "transaction",
            Self::ServiceDestination { .. } => "service_destination",
        }
    }
}

/// A pre-aggregated metric document covering one group over one aggregation window.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricDocument {
    timestamp: DateTime<Utc>,
    interval: Duration,
    overflow: bool,
    key: DocumentKey,
    accumulator: Accumulator,
}

impl MetricDocument {
    pub(crate) fn new(
        key: DocumentKey, accumulator: Accumulator, timestamp: DateTime<Utc>, interval: Duration, overflow: bool,
    ) -> Self {
        Self {
            timestamp,
            interval,
            overflow,
            key,
            accumulator,
        }
    }

    /// Returns the start of the window this document covers.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the length of the window this document covers.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the name of the metricset this document belongs to.
    pub fn metricset(&self) -> &'static str {
        self.key.metricset()
    }

    /// Returns `true` if this document aggregates events that exceeded the group limit.
    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// Returns the identity fields of this document.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Returns the number of events aggregated into this document.
    pub fn count(&self) -> u64 {
        self.accumulator.events()
    }

    /// Returns the number of events this document represents, accounting for sampling.
    pub fn representative_count(&self) -> u64 {
        self.accumulator.histogram().count()
    }

    /// Returns the weighted sum of durations, in microseconds.
    pub fn duration_sum_micros(&self) -> u64 {
        self.accumulator.duration_sum_micros()
    }

    /// Returns the per-result event counts.
    pub fn result_counts(&self) -> &BTreeMap<String, u64> {
        self.accumulator.result_counts()
    }

    /// Returns the duration histogram.
    pub fn histogram(&self) -> HistogramSnapshot {
        self.accumulator.histogram().snapshot()
    }
}

/// Formats an interval the way the document store expects it, such as `1m`, `10s`, or `500ms`.
pub fn format_interval(interval: Duration) -> String {
    let millis = interval.as_millis();
    if millis >= 60_000 && millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis >= 1_000 && millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{}ms", millis)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn has_no_results(result_counts: &&BTreeMap<String, u64>) -> bool {
    result_counts.is_empty()
}

#[derive(Serialize)]
struct MetricsetFields<'a> {
    name: &'a str,
    interval: String,
    #[serde(skip_serializing_if = "is_false")]
    overflow: bool,
}

#[derive(Serialize)]
struct ServiceFields<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    environment: &'a str,
}

#[derive(Serialize)]
struct HistogramFields {
    histogram: HistogramSnapshot,
}

#[derive(Serialize)]
struct TransactionFields<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    transaction_type: &'a str,
    duration: HistogramFields,
    #[serde(skip_serializing_if = "has_no_results")]
    result_counts: &'a BTreeMap<String, u64>,
}

#[derive(Serialize)]
struct EventFields<'a> {
    outcome: &'a str,
}

#[derive(Serialize)]
struct TransactionDocument<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    metricset: MetricsetFields<'a>,
    service: ServiceFields<'a>,
    transaction: TransactionFields<'a>,
    event: EventFields<'a>,
    #[serde(rename = "_doc_count")]
    doc_count: u64,
}

#[derive(Serialize)]
struct SumFields {
    us: u64,
}

#[derive(Serialize)]
struct ResponseTimeFields {
    count: u64,
    sum: SumFields,
}

#[derive(Serialize)]
struct DestinationServiceFields<'a> {
    resource: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    name: &'a str,
    response_time: ResponseTimeFields,
}

#[derive(Serialize)]
struct DestinationFields<'a> {
    service: DestinationServiceFields<'a>,
}

#[derive(Serialize)]
struct SpanFields<'a> {
    destination: DestinationFields<'a>,
    duration: HistogramFields,
}

#[derive(Serialize)]
struct ServiceDestinationDocument<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    metricset: MetricsetFields<'a>,
    service: ServiceFields<'a>,
    span: SpanFields<'a>,
    #[serde(rename = "_doc_count")]
    doc_count: u64,
}

impl Serialize for MetricDocument {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let timestamp = self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        let metricset = MetricsetFields {
            name: self.metricset(),
            interval: format_interval(self.interval),
            overflow: self.overflow,
        };
        let duration = HistogramFields {
            histogram: self.histogram(),
        };

        match &self.key {
            DocumentKey::Transaction {
                service_name,
                environment,
                name,
                transaction_type,
                outcome,
            } => TransactionDocument {
                timestamp,
                metricset,
                service: ServiceFields {
                    name: service_name,
                    environment,
                },
                transaction: TransactionFields {
                    name,
                    transaction_type,
                    duration,
                    result_counts: self.result_counts(),
                },
                event: EventFields { outcome },
                doc_count: self.count(),
            }
            .serialize(serializer),
            DocumentKey::ServiceDestination {
                service_name,
                environment,
                destination_name,
                destination_resource,
            } => ServiceDestinationDocument {
                timestamp,
                metricset,
                service: ServiceFields {
                    name: service_name,
                    environment,
                },
                span: SpanFields {
                    destination: DestinationFields {
                        service: DestinationServiceFields {
                            resource: destination_resource,
                            name: destination_name,
                            response_time: ResponseTimeFields {
                                count: self.representative_count(),
                                sum: SumFields {
                                    us: self.duration_sum_micros(),
                                },
                            },
                        },
                    },
                    duration,
                },
                doc_count: self.count(),
            }
            .serialize(serializer),
        }
    }
}
