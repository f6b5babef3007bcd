use apm_aggregation::{error::ErrorContext as _, MetricBatch, PublishError, Publisher};
use async_trait::async_trait;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt as _},
    sync::Mutex,
};
use tracing::debug;

/// Writes every metric document as one line of JSON.
///
/// Batches are written whole, so lines from concurrent batches never interleave.
pub struct JsonLinesPublisher<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesPublisher<W> {
    /// Creates a new `JsonLinesPublisher` writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> Publisher for JsonLinesPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&self, batch: MetricBatch) -> Result<(), PublishError> {
        let mut buf = Vec::with_capacity(batch.len() * 512);
        for document in batch.documents() {
            serde_json::to_writer(&mut buf, document).error_context("Failed to serialize metric document.")?;
            buf.push(b'\n');
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await.error_context("Failed to write metric documents.")?;
        writer.flush().await.error_context("Failed to flush metric documents.")?;

        debug!(aggregator = batch.aggregator(), documents = batch.len(), "Published metric documents.");
        Ok(())
    }
}
