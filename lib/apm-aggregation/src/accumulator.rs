//! Per-group aggregation state.

use std::{collections::BTreeMap, time::Duration};

use apm_histogram::Histogram;

/// Aggregated state for a single group within one window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Accumulator {
    histogram: Histogram,
    events: u64,
    duration_sum_micros: u64,
    result_counts: BTreeMap<String, u64>,
}

impl Accumulator {
    /// Records a single event.
    ///
    /// `weight` is the number of events the event stands for, and scales the histogram mass and duration sum. The raw
    /// event count always grows by one. When `result` is non-empty, the event is also counted against that result.
    pub fn record(&mut self, duration: Duration, weight: u64, result: Option<&str>) {
        self.histogram.record(duration, weight);
        self.events = self.events.saturating_add(1);

        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.duration_sum_micros = self.duration_sum_micros.saturating_add(micros.saturating_mul(weight));

        if let Some(result) = result.filter(|result| !result.is_empty()) {
            // Lookup first so repeat results don't allocate.
            match self.result_counts.get_mut(result) {
                Some(count) => *count = count.saturating_add(1),
                None => {
                    self.result_counts.insert(result.to_string(), 1);
                }
            }
        }
    }

    /// Returns the duration histogram.
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    /// Returns the number of events recorded.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Returns the weighted sum of recorded durations, in microseconds.
    pub fn duration_sum_micros(&self) -> u64 {
        self.duration_sum_micros
    }

    /// Returns the per-result event counts.
    pub fn result_counts(&self) -> &BTreeMap<String, u64> {
        &self.result_counts
    }
}
