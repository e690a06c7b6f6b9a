//! Bridge Configuration
//!
//! Configuration for the ingestion service and the egress adapter.
//! Keys are kebab-case so the structs deserialize straight from the host's
//! TOML section.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::BridgeResult;

/// Default storage container written to
pub const DEFAULT_DATABASE: &str = "eii";

/// Default retention policy of the writes
pub const DEFAULT_RETENTION_POLICY: &str = "autogen";

/// Default write batch size
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Default number of pending write batches
pub const DEFAULT_BATCH_PENDING: usize = 10;

/// Default batch timeout in milliseconds
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10_000;

/// Ingestion service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BridgeConfig {
    /// Whether the service starts when opened
    pub enabled: bool,

    /// Target storage container name
    pub database: String,

    /// Retention policy used for writes
    pub retention_policy: String,

    /// Maximum number of points per batch
    pub batch_size: usize,

    /// Maximum number of flushed batches waiting for the writer
    pub batch_pending: usize,

    /// Maximum time a batch stays open after its first point
    pub batch_timeout_ms: u64,

    /// Statistics log interval, 0 disables the periodic reporter
    pub stats_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database: DEFAULT_DATABASE.to_string(),
            retention_policy: DEFAULT_RETENTION_POLICY.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_pending: DEFAULT_BATCH_PENDING,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            stats_interval_ms: 0,
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration section from TOML, applying defaults
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid TOML for this structure
    pub fn from_toml_str(raw: &str) -> BridgeResult<Self> {
        let config: Self = toml::from_str(raw)?;
        Ok(config.with_defaults())
    }

    /// Return a copy with zero values replaced by defaults.
    ///
    /// An empty `database` is kept as-is: a blank target name is a startup
    /// error rather than something to paper over.
    #[must_use]
    pub fn with_defaults(&self) -> Self {
        let mut config = self.clone();
        if config.retention_policy.is_empty() {
            config.retention_policy = DEFAULT_RETENTION_POLICY.to_string();
        }
        if config.batch_size == 0 {
            config.batch_size = DEFAULT_BATCH_SIZE;
        }
        if config.batch_pending == 0 {
            config.batch_pending = DEFAULT_BATCH_PENDING;
        }
        if config.batch_timeout_ms == 0 {
            config.batch_timeout_ms = DEFAULT_BATCH_TIMEOUT_MS;
        }
        config
    }

    /// Batch timeout as a `Duration`
    #[must_use]
    pub const fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Statistics reporter interval, `None` when disabled
    #[must_use]
    pub const fn stats_interval(&self) -> Option<Duration> {
        if self.stats_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.stats_interval_ms))
        }
    }
}

/// Egress node configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Logical publisher name resolved through bus discovery
    pub pubname: String,

    /// Topic the processed points are published on
    pub topic: String,
}

impl EgressConfig {
    /// Create egress configuration
    pub fn new(pubname: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            pubname: pubname.into(),
            topic: topic.into(),
        }
    }
}
