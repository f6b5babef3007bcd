//! Pre-aggregated metrics for APM transactions and spans.
//!
//! Trace events are grouped by service and operation identity into fixed-length windows. Each window is summarized as
//! one document per group, carrying a duration histogram and event counts, and handed to a [`Publisher`] as the window
//! closes. Memory is bounded by a per-window group limit, past which events are folded into a single overflow group.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod accumulator;
pub mod aggregator;
pub mod bucket_map;
mod config;
pub mod document;
pub mod error;
pub mod event;
mod ingest;
pub mod key;
pub mod publisher;
mod telemetry;

pub use self::aggregator::{Aggregator, AggregatorState, IngestOutcome};
pub use self::config::{AggregationConfiguration, AggregatorConfiguration};
pub use self::document::MetricDocument;
pub use self::error::{GenericError, IngestError, PublishError};
pub use self::event::{Event, Outcome, Span, Transaction};
pub use self::ingest::{Aggregators, SERVICE_DESTINATION_METRICS, TRANSACTION_METRICS};
pub use self::publisher::{CollectingPublisher, MetricBatch, Publisher};
pub use self::telemetry::{Telemetry, TelemetrySnapshot};
