//! Lazy Storage Provisioner

use parking_lot::RwLock;
use std::sync::Arc;

use crate::{error::BridgeResult, storage::MetaClient};

/// Creates the target container on first use
pub struct StorageProvisioner {
    meta: Arc<dyn MetaClient>,
    database: String,
    ready: Readiness,
}

/// Readiness flag that outlives a single provisioner
pub type Readiness = Arc<RwLock<bool>>;

impl StorageProvisioner {
    /// Create a provisioner for `database`
    pub fn new(meta: Arc<dyn MetaClient>, database: impl Into<String>) -> Self {
        Self::with_readiness(meta, database, Readiness::default())
    }

    /// Create a provisioner sharing an existing readiness flag. Once set,
    /// the flag stays set for every provisioner holding it.
    pub fn with_readiness(
        meta: Arc<dyn MetaClient>,
        database: impl Into<String>,
        ready: Readiness,
    ) -> Self {
        Self {
            meta,
            database: database.into(),
            ready,
        }
    }

    /// Make sure the target container exists.
    ///
    /// After the first success this is a no-op. A failure leaves the flag
    /// untouched so the next call tries again.
    ///
    /// # Errors
    ///
    /// Returns the meta client error if creation fails
    pub async fn ensure_storage(&self) -> BridgeResult<()> {
        if *self.ready.read() {
            return Ok(());
        }

        let info = self.meta.create_database(&self.database).await?;
        *self.ready.write() = true;

        tracing::info!(
            database = %info.name,
            retention_policy = %info.default_retention_policy,
            "Storage provisioned"
        );
        Ok(())
    }

    /// Whether the container is known to exist
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.read()
    }

    /// Target container name
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl std::fmt::Debug for StorageProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProvisioner")
            .field("database", &self.database)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}
