//! A mergeable, bounded-size histogram of durations.
//!
//! Values are bucketed with a log-linear scheme: every power-of-two range is split into a fixed number of equal-width
//! sub-buckets. Bucket assignment is a pure function of the value, so two histograms built from the same multiset of
//! durations are identical regardless of insertion or merge order.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{cmp::Ordering, time::Duration};

use smallvec::SmallVec;

/// Number of bits of precision kept below the most significant bit of a value.
const SUB_BUCKET_BITS: u32 = 7;
const SUB_BUCKET_COUNT: u64 = 1 << SUB_BUCKET_BITS;

/// Largest value, in microseconds, that is tracked at full precision.
///
/// Larger values are clamped into the last bucket (roughly nineteen hours).
pub const MAX_TRACKABLE_MICROS: u64 = (1 << 36) - 1;

/// Upper bound on the number of distinct buckets a histogram can hold.
pub const MAX_BUCKETS: usize = bucket_index(MAX_TRACKABLE_MICROS) as usize + 1;

/// A histogram bin.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Bin {
    /// The bucket index.
    index: u16,

    /// The number of observations within the bucket.
    count: u64,
}

/// A mergeable histogram of durations.
///
/// Durations are recorded at microsecond resolution. Values below 128µs are tracked exactly, and larger values are
/// tracked with a relative error of at most 1/256 (~0.4%) against the value reported for their bucket.
///
/// All operations are total: zero is a valid duration, and durations above [`MAX_TRACKABLE_MICROS`] are clamped rather
/// than rejected. Counts saturate instead of overflowing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Histogram {
    /// Non-empty bins, sorted by bucket index.
    bins: SmallVec<[Bin; 4]>,

    /// Total number of observations.
    count: u64,
}

impl Histogram {
    /// Creates an empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no observations have been recorded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the total number of recorded observations.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the number of non-empty buckets.
    pub fn bucket_count(&self) -> usize {
        self.bins.len()
    }

    /// Records `count` occurrences of `duration`.
    pub fn record(&mut self, duration: Duration, count: u64) {
        if count == 0 {
            return;
        }

        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let index = bucket_index(micros);

        match self.bins.binary_search_by_key(&index, |b| b.index) {
            Ok(pos) => self.bins[pos].count = self.bins[pos].count.saturating_add(count),
            Err(pos) => self.bins.insert(pos, Bin { index, count }),
        }
        self.count = self.count.saturating_add(count);
    }

    /// Merges another histogram into this one.
    ///
    /// The result holds the combined mass of both histograms. Merging is commutative and associative.
    pub fn merge(&mut self, other: &Histogram) {
        if other.is_empty() {
            return;
        }

        let mut merged = SmallVec::<[Bin; 4]>::with_capacity(self.bins.len().max(other.bins.len()));

        let mut left = self.bins.iter().peekable();
        let mut right = other.bins.iter().peekable();
        loop {
            let next = match (left.peek(), right.peek()) {
                (Some(l), Some(r)) => match l.index.cmp(&r.index) {
                    Ordering::Less => left.next().copied(),
                    Ordering::Greater => right.next().copied(),
                    Ordering::Equal => {
                        let count = l.count.saturating_add(r.count);
                        let index = l.index;
                        left.next();
                        right.next();
                        Some(Bin { index, count })
                    }
                },
                (Some(_), None) => left.next().copied(),
                (None, Some(_)) => right.next().copied(),
                (None, None) => None,
            };

            match next {
                Some(bin) => merged.push(bin),
                None => break,
            }
        }

        self.bins = merged;
        self.count = self.count.saturating_add(other.count);
    }

    /// Removes all observations.
    pub fn clear(&mut self) {
        self.bins.clear();
        self.count = 0;
    }

    /// Estimates the duration at the given quantile.
    ///
    /// `q` is clamped to `[0.0, 1.0]`. Returns `None` if the histogram is empty.
    pub fn quantile(&self, q: f64) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }

        let q = if q.is_nan() { 0.0 } else { q.clamp(0.0, 1.0) };
        let wanted_rank = q * (self.count - 1) as f64;

        let mut seen = 0u64;
        for bin in &self.bins {
            seen = seen.saturating_add(bin.count);
            if seen as f64 > wanted_rank {
                return Some(micros_to_duration(bucket_value(bin.index)));
            }
        }

        self.bins.last().map(|bin| micros_to_duration(bucket_value(bin.index)))
    }

    /// Returns an iterator over the non-empty buckets, in ascending order of value.
    pub fn buckets(&self) -> impl Iterator<Item = HistogramBucket> + '_ {
        self.bins.iter().map(|bin| HistogramBucket {
            value: bucket_value(bin.index),
            count: bin.count,
        })
    }

    /// Builds the compact, storable representation of this histogram.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut values = Vec::with_capacity(self.bins.len());
        let mut counts = Vec::with_capacity(self.bins.len());
        for bucket in self.buckets() {
            values.push(bucket.value);
            counts.push(bucket.count);
        }

        HistogramSnapshot { values, counts }
    }
}

/// A single non-empty histogram bucket.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistogramBucket {
    /// Representative value of the bucket, in microseconds.
    pub value: f64,

    /// Number of observations in the bucket.
    pub count: u64,
}

/// Pre-aggregated histogram representation: parallel arrays of bucket values (microseconds) and counts.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct HistogramSnapshot {
    /// Representative value of each bucket, in microseconds, in ascending order.
    pub values: Vec<f64>,

    /// Number of observations in each bucket.
    pub counts: Vec<u64>,
}

impl HistogramSnapshot {
    /// Returns the total number of observations represented.
    pub fn total_count(&self) -> u64 {
        self.counts.iter().fold(0u64, |acc, n| acc.saturating_add(*n))
    }
}

const fn bucket_index(micros: u64) -> u16 {
    let v = if micros > MAX_TRACKABLE_MICROS {
        MAX_TRACKABLE_MICROS
    } else {
        micros
    };

    if v < SUB_BUCKET_COUNT {
        return v as u16;
    }

    let msb = 63 - v.leading_zeros();
    let shift = msb - SUB_BUCKET_BITS;
    let mantissa = (v >> shift) & (SUB_BUCKET_COUNT - 1);

    // Bounded by `MAX_BUCKETS`, which fits comfortably in a u16.
    ((shift as u64 + 1) * SUB_BUCKET_COUNT + mantissa) as u16
}

fn bucket_lower_bound(index: u16) -> u64 {
    let index = u64::from(index);
    if index < SUB_BUCKET_COUNT {
        return index;
    }

    let shift = index / SUB_BUCKET_COUNT - 1;
    let mantissa = index % SUB_BUCKET_COUNT;
    (SUB_BUCKET_COUNT + mantissa) << shift
}

fn bucket_width(index: u16) -> u64 {
    let shift = (u64::from(index) / SUB_BUCKET_COUNT).saturating_sub(1);
    1 << shift
}

/// Midpoint of the integer range covered by the bucket.
fn bucket_value(index: u16) -> f64 {
    bucket_lower_bound(index) as f64 + (bucket_width(index) - 1) as f64 / 2.0
}

fn micros_to_duration(micros: f64) -> Duration {
    Duration::from_micros(micros.round() as u64)
}
