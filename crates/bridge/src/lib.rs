//! Busbridge - Message Bus to Time-Series Bridge
//!
//! This crate ingests messages from any number of pub/sub topics, converts
//! them into timestamped points, batches them for storage writes and, on a
//! separate path, republishes processed points back onto the bus.

#![allow(clippy::significant_drop_tightening)] // Lifecycle lock is held across the close join
#![allow(clippy::option_if_let_else)] // Pattern matching reads better for optional collaborators
#![allow(clippy::single_match_else)] // Match expressions are clearer for lifecycle state handling
#![allow(clippy::missing_errors_doc)] // Error documentation is handled at module level
#![allow(clippy::module_name_repetitions)] // Type names mirror their module on purpose
//!
//! # Features
//!
//! - **Fan-in**: one listener task per subscribed topic, shutdown-aware
//! - **Batching**: size or time triggered flushes with bounded backpressure
//! - **Lazy provisioning**: the target database is created on the first batch
//! - **Statistics**: lock-free counters polled as a tagged `eii` block
//! - **Egress**: pipeline points and batches republished one message per batch
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Ingestion Service                       │
//! ├──────────┬───────────┬──────────┬─────────────┬─────────────┤
//! │  Fan-in  │ Converter │ Batcher  │ Provisioner │   Writer    │
//! │ (topics) │           │          │   (meta)    │  (points)   │
//! ├──────────┴───────────┴──────────┴─────────────┴─────────────┤
//! │          Bus capabilities        │    Storage capabilities  │
//! ├──────────────────────────────────┴──────────────────────────┤
//! │                  Egress Batch Adapter                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use busbridge::{BridgeConfig, IngestionService, MemoryBus, MemoryStorage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = MemoryBus::new().with_subscriber("sensors", &["t1"]);
//!     let storage = MemoryStorage::shared();
//!     let config = BridgeConfig {
//!         enabled: true,
//!         ..BridgeConfig::default()
//!     };
//!
//!     let service = IngestionService::new(&config)
//!         .with_points_writer(storage.clone())
//!         .with_meta_client(storage.clone())
//!         .with_discovery(Arc::new(bus.clone()))
//!         .with_transport(Arc::new(bus));
//!
//!     service.open().await?;
//!     service.close().await;
//!     Ok(())
//! }
//! ```

// Internal modules
pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

// Capabilities
pub mod bus;
pub mod storage;

// Processing
pub mod metrics;
pub mod pipeline;

// Services
pub mod egress;
pub mod service;

// Public exports
pub use bus::{BusDiscovery, BusTransport, MemoryBus, MsgbusClient, Publisher, Subscriber};
pub use config::*;
pub use egress::{consume, EdgeMessage, EdgeReceiver, EgressAdapter};
pub use error::*;
pub use metrics::{Statistic, Statistics, StatisticsSnapshot};
pub use pipeline::{PointBatcher, PointConverter, PointSubmitter};
pub use service::{IngestionService, StorageProvisioner};
pub use storage::{MemoryStorage, MetaClient, PointsWriter};
pub use types::*;
