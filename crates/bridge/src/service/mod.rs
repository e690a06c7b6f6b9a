//! Ingestion Service
//!
//! Wires the fan-in, the converter, the batcher, the provisioner and the
//! storage writer together behind an open/close lifecycle.
//!
//! ```text
//! subscriptions ─► fan-in ─► converter ─► batcher ─► provisioner ─► write_points
//!                                                                       │
//!                                                     statistics ◄──────┘
//! ```

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::{
    bus::{BusDiscovery, BusTransport},
    config::BridgeConfig,
    error::{BridgeError, BridgeResult},
    metrics::{self, Statistic, Statistics, StatisticsSnapshot},
    pipeline::PointBatcher,
    shutdown::{self, ShutdownSender},
    storage::{MetaClient, PointsWriter},
    types::{Batch, ConsistencyLevel, Tags},
};

pub mod fanin;
pub mod provisioner;

use fanin::{FanIn, MessageHandler};
pub use provisioner::{Readiness, StorageProvisioner};

/// Tasks and handles owned by an open service
struct Running {
    shutdown: ShutdownSender,
    batcher: PointBatcher,
    fan_in: JoinHandle<()>,
    writer: JoinHandle<()>,
    reporter: Option<JoinHandle<()>>,
}

/// Collaborators resolved at open time
struct Collaborators {
    points_writer: Arc<dyn PointsWriter>,
    meta_client: Arc<dyn MetaClient>,
    discovery: Arc<dyn BusDiscovery>,
    transport: Arc<dyn BusTransport>,
}

/// Message bus ingestion service
pub struct IngestionService {
    config: BridgeConfig,
    points_writer: Option<Arc<dyn PointsWriter>>,
    meta_client: Option<Arc<dyn MetaClient>>,
    discovery: Option<Arc<dyn BusDiscovery>>,
    transport: Option<Arc<dyn BusTransport>>,
    default_tags: Tags,
    stats: Arc<Statistics>,
    ready: Readiness,
    state: Mutex<Option<Running>>,
}

impl IngestionService {
    /// Create a closed service. Zero configuration values fall back to
    /// their defaults.
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            config: config.with_defaults(),
            points_writer: None,
            meta_client: None,
            discovery: None,
            transport: None,
            default_tags: Tags::new(),
            stats: Statistics::shared(),
            ready: Readiness::default(),
            state: Mutex::new(None),
        }
    }

    /// Set the storage write interface
    #[must_use]
    pub fn with_points_writer(mut self, writer: Arc<dyn PointsWriter>) -> Self {
        self.points_writer = Some(writer);
        self
    }

    /// Set the storage metadata interface
    #[must_use]
    pub fn with_meta_client(mut self, meta: Arc<dyn MetaClient>) -> Self {
        self.meta_client = Some(meta);
        self
    }

    /// Set the bus configuration discovery
    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn BusDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Set the bus transport
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn BusTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set tags attached to every statistics block
    #[must_use]
    pub fn with_default_tags(mut self, tags: Tags) -> Self {
        self.default_tags = tags;
        self
    }

    /// Start ingesting.
    ///
    /// Opening an open service, or a disabled one, does nothing.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the database name is empty or a
    /// collaborator is missing
    pub async fn open(&self) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            tracing::debug!("Ingestion service already open");
            return Ok(());
        }
        if !self.config.enabled {
            tracing::info!("Ingestion service disabled, not starting");
            return Ok(());
        }

        let collaborators = self.collaborators()?;

        let mut batcher = PointBatcher::new(
            self.config.batch_size,
            self.config.batch_pending,
            self.config.batch_timeout(),
        )?;
        batcher.start();
        let submitter = batcher
            .submitter()
            .ok_or_else(|| BridgeError::internal("Batcher has no submission handle"))?;
        let batches = batcher
            .take_output()
            .ok_or_else(|| BridgeError::internal("Batcher output already taken"))?;

        let provisioner = Arc::new(StorageProvisioner::with_readiness(
            collaborators.meta_client,
            self.config.database.clone(),
            Arc::clone(&self.ready),
        ));

        let (shutdown_tx, shutdown_rx) = shutdown::channel();

        let writer = BatchWriter {
            points_writer: collaborators.points_writer,
            provisioner,
            retention_policy: self.config.retention_policy.clone(),
            stats: Arc::clone(&self.stats),
        };
        let writer = tokio::spawn(writer.run(batches));

        let fan_in = FanIn::new(
            collaborators.discovery,
            collaborators.transport,
            MessageHandler::new(submitter, Arc::clone(&self.stats)),
            shutdown_rx.clone(),
        );
        let fan_in = tokio::spawn(fan_in.serve());

        let reporter = self.config.stats_interval().map(|interval| {
            tokio::spawn(metrics::report_periodically(
                Arc::clone(&self.stats),
                interval,
                shutdown_rx,
            ))
        });

        *state = Some(Running {
            shutdown: shutdown_tx,
            batcher,
            fan_in,
            writer,
            reporter,
        });

        tracing::info!(
            database = %self.config.database,
            retention_policy = %self.config.retention_policy,
            batch_size = self.config.batch_size,
            batch_pending = self.config.batch_pending,
            batch_timeout_ms = self.config.batch_timeout_ms,
            "Ingestion service opened"
        );
        Ok(())
    }

    /// Stop ingesting.
    ///
    /// Waits for every listener to exit, flushes the partial batch and
    /// writes every remaining batch before returning. Closing a closed
    /// service does nothing.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let Some(mut running) = state.take() else {
            tracing::debug!("Ingestion service already closed");
            return;
        };

        let _ = running.shutdown.send(true);

        if let Err(e) = running.fan_in.await {
            tracing::error!(error = %e, "Fan-in task failed");
        }
        running.batcher.stop().await;
        if let Err(e) = running.writer.await {
            tracing::error!(error = %e, "Writer task failed");
        }
        if let Some(reporter) = running.reporter {
            if let Err(e) = reporter.await {
                tracing::error!(error = %e, "Statistics reporter failed");
            }
        }

        let s = self.stats.snapshot();
        tracing::info!(
            points_rx = s.points_received,
            points_tx = s.points_transmitted,
            batches_tx = s.batches_transmitted,
            "Ingestion service closed"
        );
    }

    /// Whether the service is running
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Whether the target storage is known to exist
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.read()
    }

    /// Current counter values
    #[must_use]
    pub fn stats(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Statistics block for external polling.
    ///
    /// # Arguments
    ///
    /// * `tags` - Tags merged over the default tags, caller wins
    #[must_use]
    pub fn statistics(&self, tags: &Tags) -> Vec<Statistic> {
        vec![Statistic::from_snapshot(
            &self.stats.snapshot(),
            &self.default_tags,
            tags,
        )]
    }

    /// Effective configuration
    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn collaborators(&self) -> BridgeResult<Collaborators> {
        if self.config.database.is_empty() {
            return Err(BridgeError::configuration("Database name cannot be empty"));
        }

        Ok(Collaborators {
            points_writer: self
                .points_writer
                .clone()
                .ok_or_else(|| BridgeError::configuration("Points writer is not set"))?,
            meta_client: self
                .meta_client
                .clone()
                .ok_or_else(|| BridgeError::configuration("Meta client is not set"))?,
            discovery: self
                .discovery
                .clone()
                .ok_or_else(|| BridgeError::configuration("Bus discovery is not set"))?,
            transport: self
                .transport
                .clone()
                .ok_or_else(|| BridgeError::configuration("Bus transport is not set"))?,
        })
    }
}

impl std::fmt::Debug for IngestionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionService")
            .field("config", &self.config)
            .field("default_tags", &self.default_tags)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

/// Drains flushed batches into storage
struct BatchWriter {
    points_writer: Arc<dyn PointsWriter>,
    provisioner: Arc<StorageProvisioner>,
    retention_policy: String,
    stats: Arc<Statistics>,
}

impl BatchWriter {
    /// Runs until the batcher closes its output
    async fn run(self, mut batches: mpsc::Receiver<Batch>) {
        while let Some(batch) = batches.recv().await {
            self.write(batch).await;
        }
        tracing::debug!("Batch writer stopped");
    }

    async fn write(&self, batch: Batch) {
        let database = self.provisioner.database();

        if let Err(e) = self.provisioner.ensure_storage().await {
            tracing::warn!(
                database = %database,
                points = batch.len(),
                retryable = e.is_retryable(),
                error = %e,
                "Required storage not yet created, dropping batch"
            );
            return;
        }

        let points = batch.len();
        match self
            .points_writer
            .write_points(
                database,
                &self.retention_policy,
                ConsistencyLevel::Any,
                batch,
            )
            .await
        {
            Ok(()) => {
                self.stats.record_batch_transmitted(points);
                tracing::debug!(database = %database, points, "Batch written");
            }
            Err(e) => {
                self.stats.record_batch_transmit_fail();
                tracing::warn!(
                    database = %database,
                    points,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Failed to write batch"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::storage::{MemoryStorage, MockPointsWriter};

    fn service(config: &BridgeConfig, storage: &Arc<MemoryStorage>) -> IngestionService {
        let bus = MemoryBus::new();
        IngestionService::new(config)
            .with_points_writer(Arc::clone(storage) as Arc<dyn PointsWriter>)
            .with_meta_client(Arc::clone(storage) as Arc<dyn MetaClient>)
            .with_discovery(Arc::new(bus.clone()))
            .with_transport(Arc::new(bus))
    }

    fn enabled() -> BridgeConfig {
        BridgeConfig {
            enabled: true,
            ..BridgeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_service_does_not_open() -> BridgeResult<()> {
        let storage = MemoryStorage::shared();
        let service = service(&BridgeConfig::default(), &storage);
        service.open().await?;
        assert!(!service.is_open().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_database_is_rejected() {
        let storage = MemoryStorage::shared();
        let config = BridgeConfig {
            database: String::new(),
            ..enabled()
        };
        let result = service(&config, &storage).open().await;
        assert!(matches!(result, Err(BridgeError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_oversized_batch_pending_is_rejected() {
        let storage = MemoryStorage::shared();
        let config = BridgeConfig {
            batch_pending: usize::MAX / 4,
            ..enabled()
        };
        let service = service(&config, &storage);

        let result = service.open().await;
        assert!(result.is_err_and(|e| e.is_configuration()));
        assert!(!service.is_open().await);
    }

    #[tokio::test]
    async fn test_missing_collaborators_are_rejected() {
        let result = IngestionService::new(&enabled()).open().await;
        assert!(result.is_err_and(|e| e.is_configuration()));

        let storage = MemoryStorage::shared();
        let without_meta = IngestionService::new(&enabled())
            .with_points_writer(storage)
            .with_discovery(Arc::new(MemoryBus::new()))
            .with_transport(Arc::new(MemoryBus::new()));
        let result = without_meta.open().await;
        assert!(result.is_err_and(|e| e.is_configuration()));
        assert!(!without_meta.is_open().await);
    }

    #[tokio::test]
    async fn test_open_close_idempotent() -> BridgeResult<()> {
        let storage = MemoryStorage::shared();
        let service = service(&enabled(), &storage);

        service.open().await?;
        service.open().await?;
        assert!(service.is_open().await);

        service.close().await;
        service.close().await;
        assert!(!service.is_open().await);

        service.open().await?;
        assert!(service.is_open().await);
        service.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_statistics_block() {
        let storage = MemoryStorage::shared();
        let service = service(&enabled(), &storage)
            .with_default_tags(Tags::from([("host".to_string(), "edge-1".to_string())]));

        let tags = Tags::from([("task".to_string(), "ingest".to_string())]);
        let stats = service.statistics(&tags);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "eii");
        assert_eq!(stats[0].tags.len(), 2);
        assert!(stats[0].values.values().all(|v| *v == 0));
    }

    #[tokio::test]
    async fn test_writer_counts_failures() -> BridgeResult<()> {
        let storage = MemoryStorage::shared();
        let mut points_writer = MockPointsWriter::new();
        points_writer
            .expect_write_points()
            .times(1)
            .returning(|_, _, _, _| Err(BridgeError::storage("write_points", "disk full")));

        let stats = Statistics::shared();
        let writer = BatchWriter {
            points_writer: Arc::new(points_writer),
            provisioner: Arc::new(StorageProvisioner::new(storage, "eii")),
            retention_policy: "autogen".to_string(),
            stats: Arc::clone(&stats),
        };

        let (tx, rx) = mpsc::channel(1);
        let point = crate::types::Point::new(
            "temp",
            Tags::new(),
            crate::types::Fields::from([("v".to_string(), 1.0.into())]),
            chrono::Utc::now(),
        )?;
        tx.send(vec![point])
            .await
            .map_err(|_| BridgeError::internal("writer gone"))?;
        drop(tx);
        writer.run(rx).await;

        let s = stats.snapshot();
        assert_eq!(s.batches_transmit_fail, 1);
        assert_eq!(s.batches_transmitted, 0);
        Ok(())
    }
}
