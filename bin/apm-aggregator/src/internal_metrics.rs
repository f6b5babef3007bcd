//! Internal metrics recorder.
//!
//! Installs a global `metrics` recorder backed by an atomic registry, so that the aggregators' telemetry handles record
//! into something readable. [`MetricsRegistry`] drains the registry on each reporting tick.

use std::sync::{atomic::Ordering, Arc};

use apm_aggregation::{generic_error, GenericError};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};

struct State {
    registry: Registry<Key, AtomicStorage>,
    metrics_prefix: String,
}

struct MetricsRecorder {
    state: Arc<State>,
}

impl MetricsRecorder {
    fn new(metrics_prefix: String) -> Self {
        Self {
            state: Arc::new(State {
                registry: Registry::new(AtomicStorage {}),
                metrics_prefix,
            }),
        }
    }

    fn registry(&self) -> MetricsRegistry {
        MetricsRegistry {
            state: Arc::clone(&self.state),
        }
    }

    fn prefix_key(&self, key: &Key) -> Key {
        Key::from_parts(format!("{}.{}", self.state.metrics_prefix, key.name()), key.labels())
    }
}

impl Recorder for MetricsRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let prefixed_key = self.prefix_key(key);
        self.state
            .registry
            .get_or_create_counter(&prefixed_key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        let prefixed_key = self.prefix_key(key);
        self.state
            .registry
            .get_or_create_gauge(&prefixed_key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        let prefixed_key = self.prefix_key(key);
        self.state
            .registry
            .get_or_create_histogram(&prefixed_key, |h| h.clone().into())
    }
}

/// Value of an internal metric, as of the last flush.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// Increments since the previous flush.
    Counter(u64),

    /// Last value set.
    Gauge(f64),

    /// Summary of the samples recorded since the previous flush.
    Histogram {
        /// Number of samples.
        count: u64,

        /// Sum of all samples.
        sum: f64,

        /// Largest sample, or zero if there were none.
        max: f64,
    },
}

/// A flushed internal metric.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSnapshot {
    /// Metric name, including the prefix.
    pub name: String,

    /// Metric labels, in registration order.
    pub labels: Vec<(String, String)>,

    /// Metric value.
    pub value: MetricValue,
}

/// Read side of the installed recorder.
#[derive(Clone)]
pub struct MetricsRegistry {
    state: Arc<State>,
}

impl MetricsRegistry {
    /// Drains the registry.
    ///
    /// Counters are reset to zero and histograms are cleared, so each flush reports what happened since the previous
    /// one. Gauges keep their value. Metrics are sorted by name.
    pub fn flush(&self) -> Vec<MetricSnapshot> {
        let mut metrics = Vec::new();

        for (key, counter) in self.state.registry.get_counter_handles() {
            let delta = counter.swap(0, Ordering::Relaxed);
            metrics.push(snapshot_from_key(key, MetricValue::Counter(delta)));
        }

        for (key, gauge) in self.state.registry.get_gauge_handles() {
            let value = f64::from_bits(gauge.load(Ordering::Relaxed));
            metrics.push(snapshot_from_key(key, MetricValue::Gauge(value)));
        }

        for (key, histogram) in self.state.registry.get_histogram_handles() {
            // `clear_with` hands over the samples one block at a time.
            let (mut count, mut sum, mut max) = (0u64, 0.0f64, 0.0f64);
            histogram.clear_with(|samples| {
                for sample in samples {
                    count += 1;
                    sum += *sample;
                    max = max.max(*sample);
                }
            });
            metrics.push(snapshot_from_key(key, MetricValue::Histogram { count, sum, max }));
        }

        metrics.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        metrics
    }

    /// Clears histogram samples without reporting them.
    ///
    /// Used when nothing reads the registry, so that histogram samples don't accumulate forever.
    pub fn clear_histograms(&self) {
        for (_, histogram) in self.state.registry.get_histogram_handles() {
            histogram.clear();
        }
    }
}

fn snapshot_from_key(key: Key, value: MetricValue) -> MetricSnapshot {
    let (name, labels) = key.into_parts();
    let labels = labels
        .into_iter()
        .map(|l| (l.key().to_string(), l.value().to_string()))
        .collect();

    MetricSnapshot {
        name: name.as_str().to_string(),
        labels,
        value,
    }
}

/// Installs the global metrics recorder, prefixing every metric name with `metrics_prefix`.
///
/// Must run before any metric handle is registered: handles registered earlier stay bound to the no-op recorder.
///
/// # Errors
///
/// If a global recorder is already installed, an error is returned.
pub fn initialize_metrics(metrics_prefix: impl Into<String>) -> Result<MetricsRegistry, GenericError> {
    let recorder = MetricsRecorder::new(metrics_prefix.into());
    let registry = recorder.registry();
    metrics::set_global_recorder(recorder)
        .map_err(|_| generic_error!("A global metrics recorder is already installed."))?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use metrics::{counter, gauge, histogram};

    use super::*;

    #[test]
    fn flush_reports_deltas_and_drains_histograms() {
        let recorder = MetricsRecorder::new("apm".to_string());
        let registry = recorder.registry();

        metrics::with_local_recorder(&recorder, || {
            counter!("events_total", "aggregator" => "txmetrics").increment(3);
            gauge!("active_groups", "aggregator" => "txmetrics").set(7.0);
            let duration = histogram!("publish_duration_secs");
            duration.record(0.5);
            duration.record(1.5);
        });

        let metrics = registry.flush();
        assert_eq!(
            metrics,
            vec![
                MetricSnapshot {
                    name: "apm.active_groups".to_string(),
                    labels: vec![("aggregator".to_string(), "txmetrics".to_string())],
                    value: MetricValue::Gauge(7.0),
                },
                MetricSnapshot {
                    name: "apm.events_total".to_string(),
                    labels: vec![("aggregator".to_string(), "txmetrics".to_string())],
                    value: MetricValue::Counter(3),
                },
                MetricSnapshot {
                    name: "apm.publish_duration_secs".to_string(),
                    labels: vec![],
                    value: MetricValue::Histogram {
                        count: 2,
                        sum: 2.0,
                        max: 1.5
                    },
                },
            ]
        );

        // Counters restart from zero, histograms are empty, gauges hold.
        let metrics = registry.flush();
        assert_eq!(metrics[0].value, MetricValue::Gauge(7.0));
        assert_eq!(metrics[1].value, MetricValue::Counter(0));
        assert_eq!(
            metrics[2].value,
            MetricValue::Histogram {
                count: 0,
                sum: 0.0,
                max: 0.0
            }
        );
    }

    #[test]
    fn handles_share_storage_across_registrations() {
        let recorder = MetricsRecorder::new("apm".to_string());
        let registry = recorder.registry();

        metrics::with_local_recorder(&recorder, || {
            counter!("events_total").increment(1);
            counter!("events_total").increment(2);
            histogram!("publish_duration_secs").record(0.25);
        });
        registry.clear_histograms();

        let metrics = registry.flush();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].value, MetricValue::Counter(3));
        assert_eq!(
            metrics[1].value,
            MetricValue::Histogram {
                count: 0,
                sum: 0.0,
                max: 0.0
            }
        );
    }
}
