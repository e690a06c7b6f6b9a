//! In-memory storage backend
//!
//! Implements both storage capabilities against process memory. Used for
//! local runs and tests; supports injecting create and write failures.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{MetaClient, PointsWriter};
use crate::{
    config::DEFAULT_RETENTION_POLICY,
    error::{BridgeError, BridgeResult},
    types::{Batch, ConsistencyLevel, DatabaseInfo, Point},
};

/// One accepted write call
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenBatch {
    /// Target container
    pub database: String,
    /// Retention policy of the write
    pub retention_policy: String,
    /// Requested consistency
    pub consistency: ConsistencyLevel,
    /// Points in arrival order
    pub points: Batch,
}

/// In-memory storage engine
#[derive(Debug, Default)]
pub struct MemoryStorage {
    databases: DashMap<String, DatabaseInfo>,
    batches: Mutex<Vec<WrittenBatch>>,
    create_calls: AtomicUsize,
    failing_creates: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty storage engine
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty storage engine behind an `Arc`
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` create calls fail
    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Make every write fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of create calls seen, failed ones included
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Whether `name` has been created
    #[must_use]
    pub fn has_database(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    /// All accepted write calls in order
    #[must_use]
    pub fn batches(&self) -> Vec<WrittenBatch> {
        self.batches.lock().clone()
    }

    /// All accepted points in write order
    #[must_use]
    pub fn points(&self) -> Vec<Point> {
        self.batches
            .lock()
            .iter()
            .flat_map(|batch| batch.points.iter().cloned())
            .collect()
    }

    fn take_create_failure(&self) -> bool {
        self.failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MetaClient for MemoryStorage {
    async fn create_database(&self, name: &str) -> BridgeResult<DatabaseInfo> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if self.take_create_failure() {
            return Err(BridgeError::storage(
                "create_database",
                format!("Meta store unavailable while creating {name}"),
            ));
        }

        let info = self
            .databases
            .entry(name.to_string())
            .or_insert_with(|| DatabaseInfo {
                name: name.to_string(),
                default_retention_policy: DEFAULT_RETENTION_POLICY.to_string(),
            })
            .clone();
        Ok(info)
    }
}

#[async_trait]
impl PointsWriter for MemoryStorage {
    async fn write_points(
        &self,
        database: &str,
        retention_policy: &str,
        consistency: ConsistencyLevel,
        points: Batch,
    ) -> BridgeResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BridgeError::storage("write_points", "Write rejected"));
        }
        if !self.databases.contains_key(database) {
            return Err(BridgeError::storage(
                "write_points",
                format!("Database not found: {database}"),
            ));
        }

        self.batches.lock().push(WrittenBatch {
            database: database.to_string(),
            retention_policy: retention_policy.to_string(),
            consistency,
            points,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldValue, Fields, Tags};
    use chrono::Utc;

    fn batch() -> BridgeResult<Batch> {
        let fields = Fields::from([("v".to_string(), FieldValue::Float(1.0))]);
        Ok(vec![Point::new("temp", Tags::new(), fields, Utc::now())?])
    }

    #[tokio::test]
    async fn test_create_is_idempotent() -> BridgeResult<()> {
        let storage = MemoryStorage::new();
        let first = storage.create_database("eii").await?;
        let second = storage.create_database("eii").await?;
        assert_eq!(first, second);
        assert_eq!(first.default_retention_policy, "autogen");
        assert_eq!(storage.create_calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_create_failures() -> BridgeResult<()> {
        let storage = MemoryStorage::new();
        storage.fail_next_creates(1);

        assert!(storage.create_database("eii").await.is_err());
        assert!(!storage.has_database("eii"));
        storage.create_database("eii").await?;
        assert!(storage.has_database("eii"));
        Ok(())
    }

    #[tokio::test]
    async fn test_write_requires_database() -> BridgeResult<()> {
        let storage = MemoryStorage::new();
        let result = storage
            .write_points("eii", "autogen", ConsistencyLevel::Any, batch()?)
            .await;
        assert!(matches!(result, Err(BridgeError::Storage { .. })));

        storage.create_database("eii").await?;
        storage
            .write_points("eii", "autogen", ConsistencyLevel::Any, batch()?)
            .await?;
        assert_eq!(storage.batches().len(), 1);
        assert_eq!(storage.points().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_write_failure() -> BridgeResult<()> {
        let storage = MemoryStorage::new();
        storage.create_database("eii").await?;
        storage.set_fail_writes(true);

        let result = storage
            .write_points("eii", "autogen", ConsistencyLevel::Any, batch()?)
            .await;
        assert!(result.is_err_and(|e| e.is_retryable()));
        assert!(storage.batches().is_empty());
        Ok(())
    }
}
