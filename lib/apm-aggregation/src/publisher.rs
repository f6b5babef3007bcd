//! Publisher interface.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::{document::MetricDocument, error::PublishError};

/// A batch of documents flushed from a single aggregation window.
#[derive(Clone, Debug)]
pub struct MetricBatch {
    aggregator: &'static str,
    documents: Vec<MetricDocument>,
}

impl MetricBatch {
    pub(crate) fn new(aggregator: &'static str, documents: Vec<MetricDocument>) -> Self {
        Self { aggregator, documents }
    }

    /// Returns the name of the aggregator that produced this batch.
    pub fn aggregator(&self) -> &'static str {
        self.aggregator
    }

    /// Returns the number of documents in this batch.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns `true` if this batch holds no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Returns the documents in this batch.
    pub fn documents(&self) -> &[MetricDocument] {
        &self.documents
    }

    /// Consumes the batch, returning its documents.
    pub fn into_documents(self) -> Vec<MetricDocument> {
        self.documents
    }
}

/// Destination for aggregated documents.
///
/// Publishing happens on the aggregator's rotation task, never on the ingest path, and the next rotation does not start
/// until the current publish completes. A batch that fails to publish is dropped.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes a batch of documents.
    ///
    /// # Errors
    ///
    /// If the batch could not be forwarded, an error is returned.
    async fn publish(&self, batch: MetricBatch) -> Result<(), PublishError>;
}

/// A publisher that keeps every batch in memory.
#[derive(Debug, Default)]
pub struct CollectingPublisher {
    batches: Mutex<Vec<MetricBatch>>,
}

impl CollectingPublisher {
    /// Creates an empty `CollectingPublisher`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every batch published so far.
    pub fn batches(&self) -> Vec<MetricBatch> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns a copy of every document published so far, in publish order.
    pub fn documents(&self) -> Vec<MetricDocument> {
        self.batches()
            .into_iter()
            .flat_map(MetricBatch::into_documents)
            .collect()
    }
}

#[async_trait]
impl Publisher for CollectingPublisher {
    async fn publish(&self, batch: MetricBatch) -> Result<(), PublishError> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).push(batch);
        Ok(())
    }
}
