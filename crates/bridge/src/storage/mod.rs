//! Storage capabilities
//!
//! The bridge only needs two things from the time-series storage engine: a
//! way to write a batch of points and a way to create the target container.

use async_trait::async_trait;

use crate::{
    error::BridgeResult,
    types::{Batch, ConsistencyLevel, DatabaseInfo},
};

pub mod memory;

pub use memory::{MemoryStorage, WrittenBatch};

/// Batch write interface of the storage engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PointsWriter: Send + Sync {
    /// Write one batch of points into `database` under `retention_policy`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write is rejected
    async fn write_points(
        &self,
        database: &str,
        retention_policy: &str,
        consistency: ConsistencyLevel,
        points: Batch,
    ) -> BridgeResult<()>;
}

/// Metadata interface of the storage engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetaClient: Send + Sync {
    /// Create `name` if it does not exist yet. Creating an existing
    /// container succeeds and returns its current information.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the container cannot be created
    async fn create_database(&self, name: &str) -> BridgeResult<DatabaseInfo>;
}
