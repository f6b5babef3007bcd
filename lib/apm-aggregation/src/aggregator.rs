//! Windowed aggregation with lossless rotation.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio::{
    select,
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::{
    bucket_map::{Generation, GenerationSnapshot, Placement},
    config::AggregatorConfiguration,
    document::MetricDocument,
    error::{IngestError, PublishError},
    key::{AggregationKey, KeyLookup},
    publisher::{MetricBatch, Publisher},
    telemetry::Telemetry,
};

/// Result of handing an event to an aggregator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IngestOutcome {
    /// The event was merged into its group.
    Recorded,

    /// The event was merged into the overflow group, as the window had reached its group limit.
    Overflowed,

    /// The event had nothing to aggregate, or its aggregator is disabled.
    Ignored,
}

/// Lifecycle state of an aggregator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AggregatorState {
    /// Accepting events and rotating on every interval.
    Running = 0,

    /// Performing the final flush.
    Stopping = 1,

    /// Final flush complete. Events are rejected.
    Stopped = 2,
}

impl AggregatorState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

struct Shared<K> {
    name: &'static str,
    config: AggregatorConfiguration,
    active: ArcSwap<Generation<K>>,
    state: AtomicU8,
    rotation: Mutex<()>,
    publisher: Arc<dyn Publisher>,
    telemetry: Telemetry,
}

impl<K: AggregationKey> Shared<K> {
    fn state(&self) -> AggregatorState {
        AggregatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: AggregatorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn new_generation(&self) -> Generation<K> {
        Generation::new(self.config.shards(), self.config.max_groups())
    }

    /// Swaps in a fresh generation and publishes the one it replaced.
    ///
    /// The final rotation swaps in a closed generation, so nothing can be recorded after it.
    async fn rotate(&self, final_rotation: bool) -> Result<(), PublishError> {
        let _rotation = self.rotation.lock().await;
        if self.active.load().is_closed() {
            return Ok(());
        }

        let next = if final_rotation {
            Generation::closed()
        } else {
            self.new_generation()
        };
        let previous = self.active.swap(Arc::new(next));
        let generation = wait_for_writers(previous).await;

        let groups = generation.len() as u64;
        let snapshot = generation.into_snapshot();
        self.telemetry.increment_rotations();
        self.telemetry.decrement_active_groups(groups);

        let documents = self.build_documents(snapshot);
        if documents.is_empty() {
            debug!(aggregator = self.name, "No groups to flush.");
            return Ok(());
        }

        self.publish(documents).await
    }

    fn build_documents(&self, snapshot: GenerationSnapshot<K>) -> Vec<MetricDocument> {
        let timestamp = DateTime::<Utc>::from(snapshot.started);
        let interval = self.config.interval();

        let mut documents = Vec::with_capacity(snapshot.groups.len() + 1);
        for (key, accumulator) in snapshot.groups {
            documents.push(MetricDocument::new(
                key.to_document_key(),
                accumulator,
                timestamp,
                interval,
                false,
            ));
        }
        if let Some(accumulator) = snapshot.overflow {
            documents.push(MetricDocument::new(
                K::overflow_document_key(),
                accumulator,
                timestamp,
                interval,
                true,
            ));
        }
        documents
    }

    async fn publish(&self, documents: Vec<MetricDocument>) -> Result<(), PublishError> {
        let batch = MetricBatch::new(self.name, documents);
        let batch_len = batch.len() as u64;
        let publish_timeout = self.config.publish_timeout();

        let started = Instant::now();
        let result = match timeout(publish_timeout, self.publisher.publish(batch)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::TimedOut {
                timeout: publish_timeout,
            }),
        };
        self.telemetry.record_publish_duration(started.elapsed());

        match result {
            Ok(()) => {
                self.telemetry.increment_documents_published(batch_len);
                debug!(aggregator = self.name, documents = batch_len, "Published aggregated documents.");
                Ok(())
            }
            Err(e) => {
                self.telemetry.increment_publish_failures();
                error!(aggregator = self.name, documents = batch_len, error = %e, "Failed to publish aggregated documents. Dropping batch.");
                Err(e)
            }
        }
    }
}

/// Waits until no writer holds a reference to `generation`, then takes ownership of it.
///
/// Writers only hold a reference for the duration of a single in-memory update, so this resolves quickly.
async fn wait_for_writers<K>(mut generation: Arc<Generation<K>>) -> Generation<K> {
    loop {
        match Arc::try_unwrap(generation) {
            Ok(generation) => return generation,
            Err(shared) => {
                generation = shared;
                tokio::task::yield_now().await;
            }
        }
    }
}

async fn run_scheduler<K: AggregationKey>(shared: Arc<Shared<K>>, mut shutdown_rx: oneshot::Receiver<()>) {
    let interval = shared.config.interval();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(aggregator = shared.name, ?interval, "Rotation scheduler started.");

    loop {
        select! {
            // Shutdown wins over a tick that is ready at the same time, so a stop never triggers an extra rotation.
            biased;

            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                // Failures are already logged and counted, and the batch is gone either way.
                let _ = shared.rotate(false).await;
            }
        }
    }

    debug!(aggregator = shared.name, "Rotation scheduler stopped.");
}

struct Scheduler {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Aggregates events into fixed-length windows, publishing each window as it closes.
///
/// Events are recorded into the active generation of a bucket map. On every interval, the active generation is swapped
/// for an empty one, and the previous generation is published once every writer that was still holding it has
/// finished. Each event therefore lands in exactly one window.
///
/// Calling [`stop`][Self::stop] flushes the active window immediately, without waiting for the interval to elapse.
/// Dropping an aggregator without stopping it discards the active window.
pub struct Aggregator<K> {
    shared: Arc<Shared<K>>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl<K: AggregationKey> Aggregator<K> {
    /// Creates a new `Aggregator` and starts its rotation scheduler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: &'static str, config: AggregatorConfiguration, publisher: Arc<dyn Publisher>) -> Self {
        let generation = Generation::new(config.shards(), config.max_groups());
        let shared = Arc::new(Shared {
            name,
            config,
            active: ArcSwap::from_pointee(generation),
            state: AtomicU8::new(AggregatorState::Running as u8),
            rotation: Mutex::new(()),
            publisher,
            telemetry: Telemetry::new(name),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_scheduler(Arc::clone(&shared), shutdown_rx));

        Self {
            shared,
            scheduler: Mutex::new(Some(Scheduler { shutdown_tx, handle })),
        }
    }

    /// Returns the name of this aggregator.
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Returns the configuration of this aggregator.
    pub fn config(&self) -> &AggregatorConfiguration {
        &self.shared.config
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> AggregatorState {
        self.shared.state()
    }

    /// Returns the telemetry of this aggregator.
    pub fn telemetry(&self) -> &Telemetry {
        &self.shared.telemetry
    }

    /// Records an event under `key`.
    ///
    /// This never waits on a rotation or a publish: the only shared state touched is the active generation pointer and
    /// the shard that `key` hashes to.
    ///
    /// # Errors
    ///
    /// If the final flush has already happened, [`IngestError::Stopped`] is returned and the event is not recorded.
    pub fn record<Q>(
        &self, key: &Q, duration: Duration, weight: u64, result: Option<&str>,
    ) -> Result<IngestOutcome, IngestError>
    where
        Q: KeyLookup<K> + ?Sized,
    {
        let telemetry = &self.shared.telemetry;

        // The guard is held until telemetry is updated, so a rotation can't account for a group before it's counted.
        let generation = self.shared.active.load();
        match generation.record(key, |acc| acc.record(duration, weight, result)) {
            Placement::Existing => {
                telemetry.increment_events_processed();
                Ok(IngestOutcome::Recorded)
            }
            Placement::Created => {
                telemetry.increment_events_processed();
                telemetry.increment_active_groups();
                Ok(IngestOutcome::Recorded)
            }
            Placement::Overflow => {
                telemetry.increment_events_processed();
                telemetry.increment_events_overflowed();
                Ok(IngestOutcome::Overflowed)
            }
            Placement::Closed => {
                telemetry.increment_events_rejected();
                Err(IngestError::Stopped { aggregator: self.shared.name })
            }
        }
    }

    /// Rotates the active window immediately and publishes it, as if the interval had elapsed.
    ///
    /// Does nothing once the aggregator has stopped.
    ///
    /// # Errors
    ///
    /// If the window could not be published, an error is returned. The window's data is dropped.
    pub async fn flush(&self) -> Result<(), PublishError> {
        self.shared.rotate(false).await
    }

    /// Stops the aggregator, flushing the active window.
    ///
    /// Waits for any rotation already in progress, then performs a final rotation and publish before returning. Events
    /// recorded after the final rotation are rejected. Once `stop` has completed, calling it again is a no-op. If a
    /// previous call was cancelled before completing, the next call picks up the final flush.
    ///
    /// # Errors
    ///
    /// If the final window could not be published, an error is returned. The aggregator is stopped regardless.
    pub async fn stop(&self) -> Result<(), PublishError> {
        let mut scheduler = self.scheduler.lock().await;
        if self.shared.state() == AggregatorState::Stopped {
            return Ok(());
        }

        self.shared.set_state(AggregatorState::Stopping);
        info!(aggregator = self.shared.name, "Stopping aggregator and flushing active window...");

        // Taken at most once. A scheduler that outlives a cancelled `stop` still exits, as its shutdown sender is gone,
        // and any rotation it has in flight holds the rotation lock until done.
        if let Some(Scheduler { shutdown_tx, handle }) = scheduler.take() {
            // The scheduler may already be gone if it panicked, in which case there's no one to notify.
            let _ = shutdown_tx.send(());
            if let Err(e) = handle.await {
                error!(aggregator = self.shared.name, error = %e, "Rotation scheduler terminated abnormally.");
            }
        }

        let result = self.shared.rotate(true).await;
        self.shared.set_state(AggregatorState::Stopped);
        info!(aggregator = self.shared.name, "Aggregator stopped.");

        result
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        event::{Span, Transaction},
        generic_error,
        key::{ServiceDestinationKey, ServiceDestinationKeyRef, TransactionKey, TransactionKeyRef},
        publisher::CollectingPublisher,
    };

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(&self, _batch: MetricBatch) -> Result<(), PublishError> {
            Err(generic_error!("sink unavailable").into())
        }
    }

    struct StalledPublisher;

    #[async_trait]
    impl Publisher for StalledPublisher {
        async fn publish(&self, _batch: MetricBatch) -> Result<(), PublishError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct SlowPublisher {
        delay: Duration,
        publishes: std::sync::Mutex<Vec<(Instant, Instant, MetricBatch)>>,
    }

    impl SlowPublisher {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                publishes: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn publishes(&self) -> Vec<(Instant, Instant, MetricBatch)> {
            self.publishes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Publisher for SlowPublisher {
        async fn publish(&self, batch: MetricBatch) -> Result<(), PublishError> {
            let started = Instant::now();
            tokio::time::sleep(self.delay).await;
            self.publishes.lock().unwrap().push((started, Instant::now(), batch));
            Ok(())
        }
    }

    fn transaction_aggregator(
        config: AggregatorConfiguration,
    ) -> (Aggregator<TransactionKey>, Arc<CollectingPublisher>) {
        let publisher = Arc::new(CollectingPublisher::new());
        let aggregator = Aggregator::new("txmetrics", config, Arc::clone(&publisher) as Arc<dyn Publisher>);
        (aggregator, publisher)
    }

    fn record_transaction(aggregator: &Aggregator<TransactionKey>, tx: &Transaction) -> Result<IngestOutcome, IngestError> {
        let key = TransactionKeyRef::from_transaction(tx)?;
        aggregator.record(&key, tx.duration, 1, Some(tx.result.as_str()))
    }

    fn request(name: &str, millis: u64) -> Transaction {
        Transaction::new("checkout", name, "request", Duration::from_millis(millis))
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_on_interval() {
        let config = AggregatorConfiguration::with_defaults().with_interval(Duration::from_secs(1));
        let (aggregator, publisher) = transaction_aggregator(config);

        record_transaction(&aggregator, &request("GET /", 10)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        record_transaction(&aggregator, &request("GET /", 20)).unwrap();
        assert!(publisher.documents().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        let documents = publisher.documents();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].count(), 2);
        assert_eq!(documents[0].histogram().total_count(), 2);
        assert_eq!(aggregator.telemetry().snapshot().active_groups, 0);

        aggregator.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_without_waiting_for_interval() {
        let config = AggregatorConfiguration::with_defaults().with_interval(Duration::from_secs(60));
        let (aggregator, publisher) = transaction_aggregator(config);

        record_transaction(&aggregator, &request("GET /", 1000)).unwrap();

        let started = Instant::now();
        aggregator.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let documents = publisher.documents();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].count(), 1);
        assert_eq!(aggregator.state(), AggregatorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_rejects_late_events() {
        let (aggregator, publisher) = transaction_aggregator(AggregatorConfiguration::with_defaults());

        record_transaction(&aggregator, &request("GET /", 5)).unwrap();
        aggregator.stop().await.unwrap();
        aggregator.stop().await.unwrap();
        aggregator.flush().await.unwrap();

        assert_eq!(
            record_transaction(&aggregator, &request("GET /", 5)),
            Err(IngestError::Stopped { aggregator: "txmetrics" })
        );
        assert_eq!(publisher.batches().len(), 1);

        let telemetry = aggregator.telemetry().snapshot();
        assert_eq!(telemetry.events_processed, 1);
        assert_eq!(telemetry.events_rejected, 1);
        assert_eq!(telemetry.documents_published, 1);
        assert_eq!(telemetry.rotations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_stop_is_completed_by_next_stop() {
        let (aggregator, publisher) = transaction_aggregator(AggregatorConfiguration::with_defaults());
        record_transaction(&aggregator, &request("GET /", 5)).unwrap();

        // Polled once, then dropped while it waits on the scheduler task.
        tokio::select! {
            biased;
            _ = aggregator.stop() => panic!("stop completed without yielding"),
            _ = std::future::ready(()) => {}
        }
        assert_eq!(aggregator.state(), AggregatorState::Stopping);
        assert_eq!(record_transaction(&aggregator, &request("GET /", 7)), Ok(IngestOutcome::Recorded));

        aggregator.stop().await.unwrap();
        assert_eq!(aggregator.state(), AggregatorState::Stopped);

        let documents = publisher.documents();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].count(), 2);
        assert_eq!(
            record_transaction(&aggregator, &request("GET /", 9)),
            Err(IngestError::Stopped { aggregator: "txmetrics" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_rotation() {
        let publisher = Arc::new(SlowPublisher::new(Duration::from_secs(5)));
        let config = AggregatorConfiguration::with_defaults().with_interval(Duration::from_secs(1));
        let aggregator = Aggregator::<TransactionKey>::new("txmetrics", config, Arc::clone(&publisher) as Arc<dyn Publisher>);

        record_transaction(&aggregator, &request("GET /first", 5)).unwrap();
        // The scheduler rotates at 1s and is still publishing when the second event and the stop request arrive.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        record_transaction(&aggregator, &request("GET /second", 5)).unwrap();

        let stop_requested = Instant::now();
        aggregator.stop().await.unwrap();
        assert!(stop_requested.elapsed() >= Duration::from_secs(9));

        let publishes = publisher.publishes();
        assert_eq!(publishes.len(), 2);
        let (first, second) = (&publishes[0], &publishes[1]);
        assert!(first.0 < first.1);
        assert!(second.0 >= first.1, "final window published while the previous one was in flight");
        assert_eq!(first.2.len(), 1);
        assert_eq!(second.2.len(), 1);

        let telemetry = aggregator.telemetry().snapshot();
        assert_eq!(telemetry.rotations, 2);
        assert_eq!(telemetry.documents_published, 2);
        assert_eq!(telemetry.events_processed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_windows_publish_nothing() {
        let config = AggregatorConfiguration::with_defaults().with_interval(Duration::from_secs(1));
        let (aggregator, publisher) = transaction_aggregator(config);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        aggregator.stop().await.unwrap();

        assert!(publisher.batches().is_empty());
        assert_eq!(aggregator.telemetry().snapshot().rotations, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_document_after_group_limit() {
        let config = AggregatorConfiguration::with_defaults().with_max_groups(1);
        let (aggregator, publisher) = transaction_aggregator(config);

        assert_eq!(record_transaction(&aggregator, &request("GET /a", 1)), Ok(IngestOutcome::Recorded));
        assert_eq!(record_transaction(&aggregator, &request("GET /b", 2)), Ok(IngestOutcome::Overflowed));
        assert_eq!(record_transaction(&aggregator, &request("GET /b", 3)), Ok(IngestOutcome::Overflowed));
        aggregator.stop().await.unwrap();

        let documents = publisher.documents();
        assert_eq!(documents.len(), 2);
        assert!(!documents[0].is_overflow());
        assert_eq!(documents[0].count(), 1);
        assert!(documents[1].is_overflow());
        assert_eq!(documents[1].count(), 2);
        assert_eq!(aggregator.telemetry().snapshot().events_overflowed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_drops_batch() {
        let aggregator = Aggregator::<ServiceDestinationKey>::new(
            "spanmetrics",
            AggregatorConfiguration::with_defaults(),
            Arc::new(FailingPublisher),
        );

        let span = Span::new("checkout", "postgresql", "db:5432", Duration::from_millis(3));
        let key = ServiceDestinationKeyRef::from_span(&span).unwrap().unwrap();
        aggregator.record(&key, span.duration, 1, None).unwrap();

        assert!(matches!(aggregator.flush().await, Err(PublishError::Rejected { .. })));
        assert_eq!(aggregator.telemetry().snapshot().publish_failures, 1);

        // The failed window is gone, so the final flush has nothing to publish.
        aggregator.stop().await.unwrap();
        assert_eq!(aggregator.telemetry().snapshot().publish_failures, 1);
        assert_eq!(aggregator.telemetry().snapshot().documents_published, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_timeout_is_reported() {
        let config = AggregatorConfiguration::with_defaults().with_publish_timeout(Duration::from_secs(2));
        let aggregator = Aggregator::<ServiceDestinationKey>::new("spanmetrics", config, Arc::new(StalledPublisher));

        let span = Span::new("checkout", "redis", "cache:6379", Duration::from_millis(1));
        let key = ServiceDestinationKeyRef::from_span(&span).unwrap().unwrap();
        aggregator.record(&key, span.duration, 1, None).unwrap();

        let result = aggregator.stop().await;
        assert!(matches!(result, Err(PublishError::TimedOut { timeout }) if timeout == Duration::from_secs(2)));
        assert_eq!(aggregator.state(), AggregatorState::Stopped);
    }
}
