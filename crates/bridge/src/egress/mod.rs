//! Egress Batch Adapter
//!
//! Receives point and batch messages from the processing pipeline and
//! republishes them on the bus, one publish call per batch. Only the first
//! point of a batch is published; integer fields are narrowed to the
//! platform integer width on the way out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{
    bus::{BusDiscovery, BusTransport, MsgbusClient, Publisher},
    config::EgressConfig,
    error::{BridgeError, BridgeResult},
    types::{Fields, OutboundMessage, PublishValue, Tags},
};

/// Start of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BeginBatchMessage {
    /// Measurement name
    pub name: String,
    /// Group tags
    pub tags: Tags,
    /// Group-by dimension names
    pub dimensions: Vec<String>,
    /// Batch time
    pub time: DateTime<Utc>,
    /// Expected number of points
    pub size_hint: usize,
}

/// One point inside a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPointMessage {
    /// Field set
    pub fields: Fields,
    /// Tag set
    pub tags: Tags,
    /// Point time
    pub time: DateTime<Utc>,
}

/// End of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndBatchMessage;

/// A single point outside any batch
#[derive(Debug, Clone, PartialEq)]
pub struct PointMessage {
    /// Measurement name
    pub name: String,
    /// Tag set
    pub tags: Tags,
    /// Group-by dimension names
    pub dimensions: Vec<String>,
    /// Field set
    pub fields: Fields,
    /// Point time
    pub time: DateTime<Utc>,
}

/// Watermark for a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierMessage {
    /// Group identifier
    pub group: String,
    /// Watermark time
    pub time: DateTime<Utc>,
}

/// Deletion of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteGroupMessage {
    /// Group identifier
    pub group: String,
}

/// A complete batch: begin, points, end
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedBatchMessage {
    /// Batch header
    pub begin: BeginBatchMessage,
    /// Points in arrival order
    pub points: Vec<BatchPointMessage>,
    /// Batch trailer
    pub end: EndBatchMessage,
}

impl From<PointMessage> for BufferedBatchMessage {
    fn from(point: PointMessage) -> Self {
        Self {
            begin: BeginBatchMessage {
                name: point.name,
                tags: point.tags.clone(),
                dimensions: point.dimensions,
                time: point.time,
                size_hint: 1,
            },
            points: vec![BatchPointMessage {
                fields: point.fields,
                tags: point.tags,
                time: point.time,
            }],
            end: EndBatchMessage,
        }
    }
}

/// Messages flowing out of the processing pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeMessage {
    /// Start of a batch
    BeginBatch(BeginBatchMessage),
    /// Point inside a batch
    BatchPoint(BatchPointMessage),
    /// End of a batch
    EndBatch(EndBatchMessage),
    /// Single point
    Point(PointMessage),
    /// Group watermark
    Barrier(BarrierMessage),
    /// Group deletion
    DeleteGroup(DeleteGroupMessage),
}

/// Accumulates begin / point* / end into a buffered batch
#[derive(Debug, Default)]
pub struct BatchBuffer {
    begin: Option<BeginBatchMessage>,
    points: Vec<BatchPointMessage>,
}

impl BatchBuffer {
    /// Start a new batch, discarding anything buffered
    pub fn begin_batch(&mut self, begin: BeginBatchMessage) {
        self.points = Vec::with_capacity(begin.size_hint);
        self.begin = Some(begin);
    }

    /// Buffer one point
    ///
    /// # Errors
    ///
    /// Returns an edge error if no batch has begun
    pub fn batch_point(&mut self, point: BatchPointMessage) -> BridgeResult<()> {
        if self.begin.is_none() {
            return Err(BridgeError::edge("Batch point received before begin batch"));
        }
        self.points.push(point);
        Ok(())
    }

    /// Close the current batch and hand it out
    ///
    /// # Errors
    ///
    /// Returns an edge error if no batch has begun
    pub fn buffered_batch(&mut self, end: EndBatchMessage) -> BridgeResult<BufferedBatchMessage> {
        let begin = self
            .begin
            .take()
            .ok_or_else(|| BridgeError::edge("End batch received before begin batch"))?;
        Ok(BufferedBatchMessage {
            begin,
            points: std::mem::take(&mut self.points),
            end,
        })
    }
}

/// Receiver side of the pipeline edge protocol
#[async_trait]
pub trait EdgeReceiver: Send {
    /// Handle the start of a batch
    async fn begin_batch(&mut self, begin: BeginBatchMessage) -> BridgeResult<()>;

    /// Handle a point inside a batch
    async fn batch_point(&mut self, point: BatchPointMessage) -> BridgeResult<()>;

    /// Handle the end of a batch
    async fn end_batch(&mut self, end: EndBatchMessage) -> BridgeResult<()>;

    /// Handle a single point
    async fn point(&mut self, point: PointMessage) -> BridgeResult<()>;

    /// Handle a group watermark
    async fn barrier(&mut self, barrier: BarrierMessage) -> BridgeResult<()>;

    /// Handle a group deletion
    async fn delete_group(&mut self, delete: DeleteGroupMessage) -> BridgeResult<()>;

    /// Release resources once the edge is exhausted
    async fn done(&mut self);
}

/// Feed every message from `rx` to `receiver`, then call `done`.
///
/// Stops at the first receiver error.
///
/// # Errors
///
/// Returns the first error raised by the receiver
pub async fn consume<R>(receiver: &mut R, mut rx: mpsc::Receiver<EdgeMessage>) -> BridgeResult<()>
where
    R: EdgeReceiver + ?Sized,
{
    let mut result = Ok(());
    while let Some(message) = rx.recv().await {
        let handled = match message {
            EdgeMessage::BeginBatch(m) => receiver.begin_batch(m).await,
            EdgeMessage::BatchPoint(m) => receiver.batch_point(m).await,
            EdgeMessage::EndBatch(m) => receiver.end_batch(m).await,
            EdgeMessage::Point(m) => receiver.point(m).await,
            EdgeMessage::Barrier(m) => receiver.barrier(m).await,
            EdgeMessage::DeleteGroup(m) => receiver.delete_group(m).await,
        };
        if let Err(e) = handled {
            result = Err(e);
            break;
        }
    }
    receiver.done().await;
    result
}

/// Normalize a field set for publishing
#[must_use]
pub fn normalize_fields(fields: &Fields) -> OutboundMessage {
    fields
        .iter()
        .map(|(key, value)| (key.clone(), PublishValue::from(value)))
        .collect()
}

/// Egress statistics
#[derive(Debug, Default)]
pub struct EgressStats {
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

/// Point-in-time copy of [`EgressStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressStatsSnapshot {
    /// Messages accepted by the publisher
    pub messages_published: u64,
    /// Publish calls that failed
    pub publish_failures: u64,
}

impl EgressStats {
    /// Take a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> EgressStatsSnapshot {
        EgressStatsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

/// Publishes pipeline output onto the bus
pub struct EgressAdapter {
    config: EgressConfig,
    client: Option<Arc<dyn MsgbusClient>>,
    publisher: Option<Box<dyn Publisher>>,
    buffer: BatchBuffer,
    stats: Arc<EgressStats>,
}

impl EgressAdapter {
    /// Create an adapter and initialize its publisher.
    ///
    /// Initialization failures are logged, not returned: the adapter is then
    /// left without a publisher and drops what it receives.
    pub async fn connect(
        config: EgressConfig,
        discovery: &dyn BusDiscovery,
        transport: &dyn BusTransport,
    ) -> Self {
        let mut adapter = Self::unconnected(config);
        if let Err(e) = adapter.init_publisher(discovery, transport).await {
            tracing::error!(
                pubname = %adapter.config.pubname,
                topic = %adapter.config.topic,
                error = %e,
                "Failed to initialize egress publisher"
            );
        }
        adapter
    }

    /// Create an adapter without a publisher
    #[must_use]
    pub fn unconnected(config: EgressConfig) -> Self {
        Self {
            config,
            client: None,
            publisher: None,
            buffer: BatchBuffer::default(),
            stats: Arc::new(EgressStats::default()),
        }
    }

    async fn init_publisher(
        &mut self,
        discovery: &dyn BusDiscovery,
        transport: &dyn BusTransport,
    ) -> BridgeResult<()> {
        let ctx = discovery.publisher_by_name(&self.config.pubname)?;
        tracing::debug!(endpoints = ?ctx.endpoints, "Publisher endpoints");
        tracing::debug!(topics = ?ctx.topics, "Publisher topics");

        let client = transport.connect(&ctx.msgbus_config).await?;
        self.client = Some(Arc::clone(&client));
        self.publisher = Some(client.new_publisher(&self.config.topic).await?);

        tracing::info!(
            pubname = %self.config.pubname,
            topic = %self.config.topic,
            "Egress publisher ready"
        );
        Ok(())
    }

    /// Whether a publisher is available
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.publisher.is_some()
    }

    /// Egress statistics
    #[must_use]
    pub fn stats(&self) -> EgressStatsSnapshot {
        self.stats.snapshot()
    }

    async fn write(&self, batch: BufferedBatchMessage) {
        let Some(first) = batch.points.first() else {
            tracing::debug!(name = %batch.begin.name, "Empty batch, nothing to publish");
            return;
        };
        let Some(publisher) = &self.publisher else {
            tracing::debug!(name = %batch.begin.name, "No publisher, dropping batch");
            return;
        };

        let message = normalize_fields(&first.fields);
        match publisher.publish(&message).await {
            Ok(()) => {
                self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    name = %batch.begin.name,
                    topic = %self.config.topic,
                    error = %e,
                    "Failed to publish batch"
                );
            }
        }
    }
}

#[async_trait]
impl EdgeReceiver for EgressAdapter {
    async fn begin_batch(&mut self, begin: BeginBatchMessage) -> BridgeResult<()> {
        self.buffer.begin_batch(begin);
        Ok(())
    }

    async fn batch_point(&mut self, point: BatchPointMessage) -> BridgeResult<()> {
        self.buffer.batch_point(point)
    }

    async fn end_batch(&mut self, end: EndBatchMessage) -> BridgeResult<()> {
        let batch = self.buffer.buffered_batch(end)?;
        self.write(batch).await;
        Ok(())
    }

    async fn point(&mut self, point: PointMessage) -> BridgeResult<()> {
        self.write(BufferedBatchMessage::from(point)).await;
        Ok(())
    }

    async fn barrier(&mut self, _barrier: BarrierMessage) -> BridgeResult<()> {
        Ok(())
    }

    async fn delete_group(&mut self, _delete: DeleteGroupMessage) -> BridgeResult<()> {
        Ok(())
    }

    async fn done(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            publisher.close();
        }
        if let Some(client) = self.client.take() {
            client.close();
        }
    }
}

impl std::fmt::Debug for EgressAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressAdapter")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .field("buffer", &self.buffer)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::types::FieldValue;

    fn bus() -> MemoryBus {
        MemoryBus::new().with_publisher("out", &["processed"])
    }

    fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn point(pairs: &[(&str, FieldValue)]) -> PointMessage {
        PointMessage {
            name: "cpu".to_string(),
            tags: Tags::new(),
            dimensions: Vec::new(),
            fields: fields(pairs),
            time: Utc::now(),
        }
    }

    fn begin(size_hint: usize) -> BeginBatchMessage {
        BeginBatchMessage {
            name: "cpu".to_string(),
            tags: Tags::new(),
            dimensions: Vec::new(),
            time: Utc::now(),
            size_hint,
        }
    }

    fn batch_point(pairs: &[(&str, FieldValue)]) -> BatchPointMessage {
        BatchPointMessage {
            fields: fields(pairs),
            tags: Tags::new(),
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_single_point_is_published_with_narrowed_integers() -> BridgeResult<()> {
        let bus = bus();
        let mut adapter =
            EgressAdapter::connect(EgressConfig::new("out", "processed"), &bus, &bus).await;
        assert!(adapter.is_connected());

        adapter
            .point(point(&[
                ("count", FieldValue::Integer(42)),
                ("load", FieldValue::Float(0.75)),
                ("host", FieldValue::from("edge-1")),
            ]))
            .await?;

        let published = bus.published("processed");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].get("count"), Some(&PublishValue::Int(42)));
        assert_eq!(published[0].get("load"), Some(&PublishValue::Float(0.75)));
        assert_eq!(
            published[0].get("host"),
            Some(&PublishValue::String("edge-1".to_string()))
        );
        assert_eq!(adapter.stats().messages_published, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_publishes_first_point_once() -> BridgeResult<()> {
        let bus = bus();
        let mut adapter =
            EgressAdapter::connect(EgressConfig::new("out", "processed"), &bus, &bus).await;

        adapter.begin_batch(begin(3)).await?;
        for i in 1..=3 {
            adapter
                .batch_point(batch_point(&[("seq", FieldValue::Integer(i))]))
                .await?;
        }
        adapter.end_batch(EndBatchMessage).await?;

        let published = bus.published("processed");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].get("seq"), Some(&PublishValue::Int(1)));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_batch_publishes_nothing() -> BridgeResult<()> {
        let bus = bus();
        let mut adapter =
            EgressAdapter::connect(EgressConfig::new("out", "processed"), &bus, &bus).await;

        adapter.begin_batch(begin(0)).await?;
        adapter.end_batch(EndBatchMessage).await?;

        assert!(bus.published("processed").is_empty());
        assert_eq!(adapter.stats().messages_published, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_protocol_violations() {
        let mut adapter = EgressAdapter::unconnected(EgressConfig::new("out", "processed"));

        let result = adapter
            .batch_point(batch_point(&[("v", FieldValue::Integer(1))]))
            .await;
        assert!(matches!(result, Err(BridgeError::Edge { .. })));

        let result = adapter.end_batch(EndBatchMessage).await;
        assert!(matches!(result, Err(BridgeError::Edge { .. })));
    }

    #[tokio::test]
    async fn test_barrier_and_delete_group_are_noops() -> BridgeResult<()> {
        let bus = bus();
        let mut adapter =
            EgressAdapter::connect(EgressConfig::new("out", "processed"), &bus, &bus).await;

        adapter
            .barrier(BarrierMessage {
                group: "g".to_string(),
                time: Utc::now(),
            })
            .await?;
        adapter
            .delete_group(DeleteGroupMessage {
                group: "g".to_string(),
            })
            .await?;

        assert!(bus.published("processed").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_partially_initialized_adapter() -> BridgeResult<()> {
        let bus = bus();
        let mut adapter =
            EgressAdapter::connect(EgressConfig::new("missing", "processed"), &bus, &bus).await;
        assert!(!adapter.is_connected());

        adapter
            .point(point(&[("v", FieldValue::Integer(1))]))
            .await?;
        adapter.done().await;
        adapter.done().await;

        assert!(bus.published("processed").is_empty());
        assert_eq!(bus.connections(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_done_closes_client_when_publisher_failed() -> BridgeResult<()> {
        let bus = bus();
        bus.set_fail_publisher(true);
        let mut adapter =
            EgressAdapter::connect(EgressConfig::new("out", "processed"), &bus, &bus).await;
        assert!(!adapter.is_connected());
        assert_eq!(bus.connections(), 1);

        adapter
            .point(point(&[("v", FieldValue::Integer(1))]))
            .await?;
        adapter.done().await;
        adapter.done().await;

        assert!(bus.published("processed").is_empty());
        assert_eq!(bus.closed_clients(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_failure_is_counted() -> BridgeResult<()> {
        let bus = bus();
        let mut adapter =
            EgressAdapter::connect(EgressConfig::new("out", "processed"), &bus, &bus).await;
        bus.set_fail_publish(true);

        adapter
            .point(point(&[("v", FieldValue::Integer(1))]))
            .await?;

        let stats = adapter.stats();
        assert_eq!(stats.messages_published, 0);
        assert_eq!(stats.publish_failures, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_consume_runs_until_closed_then_done() -> BridgeResult<()> {
        let bus = bus();
        let mut adapter =
            EgressAdapter::connect(EgressConfig::new("out", "processed"), &bus, &bus).await;

        let (tx, rx) = mpsc::channel(8);
        let messages = [
            EdgeMessage::Point(point(&[("v", FieldValue::Integer(1))])),
            EdgeMessage::BeginBatch(begin(1)),
            EdgeMessage::BatchPoint(batch_point(&[("v", FieldValue::Integer(2))])),
            EdgeMessage::EndBatch(EndBatchMessage),
        ];
        for message in messages {
            tx.send(message)
                .await
                .map_err(|_| BridgeError::internal("receiver gone"))?;
        }
        drop(tx);

        consume(&mut adapter, rx).await?;

        assert_eq!(bus.published("processed").len(), 2);
        assert!(!adapter.is_connected());
        assert_eq!(bus.closed_clients(), 1);
        Ok(())
    }

    #[test]
    fn test_consume_stops_at_first_error() {
        let mut adapter = EgressAdapter::unconnected(EgressConfig::new("out", "processed"));
        let (tx, rx) = mpsc::channel(4);
        let queued = tx.try_send(EdgeMessage::EndBatch(EndBatchMessage));
        assert!(queued.is_ok());
        drop(tx);

        let result = tokio_test::block_on(consume(&mut adapter, rx));
        assert!(result.is_err());
    }

    #[test]
    fn test_normalize_fields() {
        let normalized = normalize_fields(&fields(&[
            ("count", FieldValue::Integer(42)),
            ("ok", FieldValue::Boolean(true)),
        ]));
        assert_eq!(normalized.get("count"), Some(&PublishValue::Int(42)));
        assert_eq!(normalized.get("ok"), Some(&PublishValue::Bool(true)));
    }
}
