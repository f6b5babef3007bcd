use std::{
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use serde::Serialize;

/// Point-in-time view of an aggregator's health counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Events recorded into a group, including overflow.
    pub events_processed: u64,

    /// Events rejected as invalid or received after the aggregator stopped.
    pub events_rejected: u64,

    /// Events that carried nothing to aggregate.
    pub events_ignored: u64,

    /// Events routed to the overflow group.
    pub events_overflowed: u64,

    /// Groups in the active window.
    pub active_groups: u64,

    /// Documents handed to the publisher successfully.
    pub documents_published: u64,

    /// Batches the publisher failed to accept.
    pub publish_failures: u64,

    /// Windows rotated out, including the final flush.
    pub rotations: u64,
}

#[derive(Default)]
struct Counts {
    events_processed: AtomicU64,
    events_rejected: AtomicU64,
    events_ignored: AtomicU64,
    events_overflowed: AtomicU64,
    active_groups: AtomicU64,
    documents_published: AtomicU64,
    publish_failures: AtomicU64,
    rotations: AtomicU64,
}

struct Handles {
    events_processed: Counter,
    events_rejected: Counter,
    events_ignored: Counter,
    events_overflowed: Counter,
    active_groups: Gauge,
    documents_published: Counter,
    publish_failures: Counter,
    rotations: Counter,
    publish_duration: Histogram,
}

/// Health counters for a single aggregator.
///
/// Every update is forwarded to the global `metrics` recorder, tagged with the aggregator name, and mirrored locally so
/// that [`snapshot`][Self::snapshot] can be read synchronously.
#[derive(Clone)]
pub struct Telemetry {
    handles: Arc<Handles>,
    counts: Arc<Counts>,
}

impl Telemetry {
    /// Registers the telemetry for the aggregator with the given name.
    pub fn new(aggregator: &'static str) -> Self {
        let handles = Handles {
            events_processed: counter!("aggregation_events_processed_total", "aggregator" => aggregator),
            events_rejected: counter!("aggregation_events_rejected_total", "aggregator" => aggregator),
            events_ignored: counter!("aggregation_events_ignored_total", "aggregator" => aggregator),
            events_overflowed: counter!("aggregation_events_overflowed_total", "aggregator" => aggregator),
            active_groups: gauge!("aggregation_active_groups", "aggregator" => aggregator),
            documents_published: counter!("aggregation_documents_published_total", "aggregator" => aggregator),
            publish_failures: counter!("aggregation_publish_failures_total", "aggregator" => aggregator),
            rotations: counter!("aggregation_rotations_total", "aggregator" => aggregator),
            publish_duration: histogram!("aggregation_publish_duration_secs", "aggregator" => aggregator),
        };

        Self {
            handles: Arc::new(handles),
            counts: Arc::new(Counts::default()),
        }
    }

    pub(crate) fn increment_events_processed(&self) {
        self.handles.events_processed.increment(1);
        self.counts.events_processed.fetch_add(1, Relaxed);
    }

    pub(crate) fn increment_events_rejected(&self) {
        self.handles.events_rejected.increment(1);
        self.counts.events_rejected.fetch_add(1, Relaxed);
    }

    pub(crate) fn increment_events_ignored(&self) {
        self.handles.events_ignored.increment(1);
        self.counts.events_ignored.fetch_add(1, Relaxed);
    }

    pub(crate) fn increment_events_overflowed(&self) {
        self.handles.events_overflowed.increment(1);
        self.counts.events_overflowed.fetch_add(1, Relaxed);
    }

    pub(crate) fn increment_active_groups(&self) {
        self.handles.active_groups.increment(1.0);
        self.counts.active_groups.fetch_add(1, Relaxed);
    }

    pub(crate) fn decrement_active_groups(&self, groups: u64) {
        self.handles.active_groups.decrement(groups as f64);
        self.counts.active_groups.fetch_sub(groups, Relaxed);
    }

    pub(crate) fn increment_documents_published(&self, documents: u64) {
        self.handles.documents_published.increment(documents);
        self.counts.documents_published.fetch_add(documents, Relaxed);
    }

    pub(crate) fn increment_publish_failures(&self) {
        self.handles.publish_failures.increment(1);
        self.counts.publish_failures.fetch_add(1, Relaxed);
    }

    pub(crate) fn increment_rotations(&self) {
        self.handles.rotations.increment(1);
        self.counts.rotations.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_publish_duration(&self, duration: Duration) {
        self.handles.publish_duration.record(duration.as_secs_f64());
    }

    /// Returns the current value of every counter.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            events_processed: self.counts.events_processed.load(Relaxed),
            events_rejected: self.counts.events_rejected.load(Relaxed),
            events_ignored: self.counts.events_ignored.load(Relaxed),
            events_overflowed: self.counts.events_overflowed.load(Relaxed),
            active_groups: self.counts.active_groups.load(Relaxed),
            documents_published: self.counts.documents_published.load(Relaxed),
            publish_failures: self.counts.publish_failures.load(Relaxed),
            rotations: self.counts.rotations.load(Relaxed),
        }
    }
}
