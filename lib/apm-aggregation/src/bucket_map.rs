//! Capacity-bounded, sharded map of aggregation groups.

use std::{
    hash::BuildHasher as _,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::SystemTime,
};

use foldhash::fast::FixedState;
use hashbrown::HashMap;

use crate::{
    accumulator::Accumulator,
    key::{AggregationKey, KeyLookup},
};

const HASH_SEED: u64 = 0x5d58_9c1b_3a7e_04f1;

/// Where an event ended up after being routed to a generation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    /// Merged into an existing group.
    Existing,

    /// Seeded a new group.
    Created,

    /// Merged into the overflow group because the generation was at capacity.
    Overflow,

    /// Not recorded, because the generation no longer accepts writes.
    Closed,
}

type Shard<K> = Mutex<HashMap<K, Accumulator, FixedState>>;

/// One generation of aggregation groups.
///
/// Groups are spread across independently locked shards, so writers only contend when their keys hash to the same
/// shard. The number of groups is bounded by `max_groups`: once reached, events for new keys are merged into a single
/// overflow group instead.
pub struct Generation<K> {
    started: SystemTime,
    hasher: FixedState,
    shards: Box<[Shard<K>]>,
    groups: AtomicUsize,
    max_groups: usize,
    overflow: Mutex<Option<Accumulator>>,
    closed: bool,
}

impl<K: AggregationKey> Generation<K> {
    /// Creates an empty generation that accepts writes.
    pub fn new(shards: usize, max_groups: usize) -> Self {
        let hasher = FixedState::with_seed(HASH_SEED);
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(HashMap::with_hasher(hasher)))
            .collect();

        Self {
            started: SystemTime::now(),
            hasher,
            shards,
            groups: AtomicUsize::new(0),
            max_groups,
            overflow: Mutex::new(None),
            closed: false,
        }
    }

    /// Creates an empty generation that rejects every write.
    pub fn closed() -> Self {
        Self {
            closed: true,
            ..Self::new(1, 0)
        }
    }

    /// Returns `true` if this generation rejects every write.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the time at which this generation started accepting writes.
    pub fn started(&self) -> SystemTime {
        self.started
    }

    /// Returns the number of groups, not counting overflow.
    pub fn len(&self) -> usize {
        self.groups.load(Ordering::Acquire)
    }

    /// Returns `true` if no group has been created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Routes an event to the group for `key`, creating the group if there is room, or to the overflow group if not.
    ///
    /// `update` is called with the accumulator the event belongs to, unless the generation is closed.
    pub fn record<Q, F>(&self, key: &Q, update: F) -> Placement
    where
        Q: KeyLookup<K> + ?Sized,
        F: FnOnce(&mut Accumulator),
    {
        if self.closed {
            return Placement::Closed;
        }

        let hash = self.hasher.hash_one(key);
        // The upper bits pick the shard, as the lower bits drive slot selection within the shard's own table.
        let shard_idx = ((hash >> 32) as usize) % self.shards.len();
        let mut shard = lock(&self.shards[shard_idx]);

        if let Some(accumulator) = shard.get_mut(key) {
            update(accumulator);
            return Placement::Existing;
        }

        if self.try_reserve_group() {
            let mut accumulator = Accumulator::default();
            update(&mut accumulator);
            shard.insert(key.to_owned_key(), accumulator);
            return Placement::Created;
        }
        drop(shard);

        let mut overflow = lock(&self.overflow);
        update(overflow.get_or_insert_with(Accumulator::default));
        Placement::Overflow
    }

    fn try_reserve_group(&self) -> bool {
        self.groups
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |groups| {
                (groups < self.max_groups).then_some(groups + 1)
            })
            .is_ok()
    }

    /// Consumes the generation, returning every group it holds.
    ///
    /// Groups are sorted by key.
    pub fn into_snapshot(self) -> GenerationSnapshot<K> {
        let mut groups = Vec::with_capacity(self.groups.into_inner());
        for shard in self.shards.into_vec() {
            groups.extend(shard.into_inner().unwrap_or_else(PoisonError::into_inner));
        }
        groups.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

        GenerationSnapshot {
            started: self.started,
            groups,
            overflow: self.overflow.into_inner().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The frozen contents of a generation.
pub struct GenerationSnapshot<K> {
    /// Time at which the generation started accepting writes.
    pub started: SystemTime,

    /// Every group, sorted by key.
    pub groups: Vec<(K, Accumulator)>,

    /// The overflow group, if any event overflowed.
    pub overflow: Option<Accumulator>,
}

impl<K> GenerationSnapshot<K> {
    /// Returns the number of events recorded across all groups, including overflow.
    pub fn events(&self) -> u64 {
        self.groups
            .iter()
            .map(|(_, acc)| acc)
            .chain(self.overflow.as_ref())
            .map(Accumulator::events)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use proptest::prelude::*;

    use super::*;
    use crate::{
        event::Span,
        key::{ServiceDestinationKey, ServiceDestinationKeyRef},
    };

    fn record_span(generation: &Generation<ServiceDestinationKey>, resource: &str, millis: u64) -> Placement {
        let span = Span::new("checkout", "postgresql", resource, Duration::from_millis(millis));
        let key = ServiceDestinationKeyRef::from_span(&span).unwrap().unwrap();
        generation.record(&key, |acc| acc.record(span.duration, 1, None))
    }

    #[test]
    fn groups_by_key() {
        let generation = Generation::new(4, 10);
        assert_eq!(record_span(&generation, "db:5432", 1), Placement::Created);
        assert_eq!(record_span(&generation, "db:5432", 2), Placement::Existing);
        assert_eq!(record_span(&generation, "cache:6379", 3), Placement::Created);
        assert_eq!(generation.len(), 2);

        let snapshot = generation.into_snapshot();
        assert_eq!(snapshot.groups.len(), 2);
        assert!(snapshot.overflow.is_none());
        assert_eq!(snapshot.events(), 3);

        // Sorted by key.
        assert_eq!(snapshot.groups[0].0.destination_resource(), "cache:6379");
        assert_eq!(snapshot.groups[1].0.destination_resource(), "db:5432");
        assert_eq!(snapshot.groups[1].1.events(), 2);
    }

    #[test]
    fn overflows_at_capacity() {
        let generation = Generation::new(4, 1);
        assert_eq!(record_span(&generation, "a", 1), Placement::Created);
        assert_eq!(record_span(&generation, "b", 1), Placement::Overflow);
        assert_eq!(record_span(&generation, "c", 1), Placement::Overflow);
        assert_eq!(record_span(&generation, "a", 1), Placement::Existing);

        let snapshot = generation.into_snapshot();
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.groups[0].1.events(), 2);
        assert_eq!(snapshot.overflow.as_ref().map(Accumulator::events), Some(2));
        assert_eq!(snapshot.events(), 4);
    }

    #[test]
    fn closed_generation_rejects_writes() {
        let generation = Generation::<ServiceDestinationKey>::closed();
        let mut called = false;
        let span = Span::new("checkout", "postgresql", "db", Duration::ZERO);
        let key = ServiceDestinationKeyRef::from_span(&span).unwrap().unwrap();

        assert!(generation.is_closed());
        assert_eq!(generation.record(&key, |_| called = true), Placement::Closed);
        assert!(!called);
        assert_eq!(generation.into_snapshot().events(), 0);
    }

    #[test]
    fn concurrent_writers_respect_capacity() {
        const THREADS: usize = 8;
        const EVENTS_PER_THREAD: usize = 500;

        let generation = Arc::new(Generation::new(16, 50));
        let handles = (0..THREADS)
            .map(|t| {
                let generation = Arc::clone(&generation);
                thread::spawn(move || {
                    for i in 0..EVENTS_PER_THREAD {
                        record_span(&generation, &format!("resource-{}", (t * 31 + i) % 200), 5);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let generation = Arc::into_inner(generation).unwrap();
        assert_eq!(generation.len(), 50);

        let snapshot = generation.into_snapshot();
        assert_eq!(snapshot.groups.len(), 50);
        assert_eq!(snapshot.events(), (THREADS * EVENTS_PER_THREAD) as u64);
    }

    proptest! {
        #[test]
        fn property_test_groups_bounded_and_events_conserved(
            max_groups in 0usize..8,
            shards in 1usize..6,
            resources in proptest::collection::vec(0u8..20, 0..200),
        ) {
            let generation = Generation::new(shards, max_groups);
            for resource in &resources {
                record_span(&generation, &resource.to_string(), 1);
            }
            prop_assert!(generation.len() <= max_groups);

            let snapshot = generation.into_snapshot();
            prop_assert!(snapshot.groups.len() <= max_groups);
            prop_assert_eq!(snapshot.events(), resources.len() as u64);
            prop_assert!(snapshot.groups.windows(2).all(|pair| pair[0].0 < pair[1].0));
        }
    }
}
