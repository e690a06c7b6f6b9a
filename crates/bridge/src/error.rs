//! Bridge Error System
//!
//! Error handling for the ingestion bridge and the egress adapter.
//! Per-message and per-batch failures are logged and counted by the callers;
//! only startup configuration errors are ever returned to the host.

use thiserror::Error;

/// Result type for all bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors (fatal to `open()`)
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Storage errors (provisioning or writes)
    #[error("Storage operation failed: {operation} - {reason}")]
    Storage {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
    },

    /// Message bus transport errors
    #[error("Transport operation failed: {operation} - {reason}")]
    Transport {
        /// Operation that failed
        operation: String,
        /// Reason for failure
        reason: String,
    },

    /// Message to point conversion errors
    #[error("Conversion failed for '{field}': {reason}")]
    Conversion {
        /// Offending field or attribute
        field: String,
        /// Reason for failure
        reason: String,
    },

    /// Batcher errors
    #[error("Batcher error: {reason}")]
    Batcher {
        /// Reason for failure
        reason: String,
    },

    /// Edge protocol errors in the egress adapter
    #[error("Edge protocol violation: {reason}")]
    Edge {
        /// Reason for failure
        reason: String,
    },

    /// Configuration file parse errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Generic internal error (use sparingly)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl BridgeError {
    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create storage error
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create transport error
    pub fn transport(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create conversion error
    pub fn conversion(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conversion {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create batcher error
    pub fn batcher(reason: impl Into<String>) -> Self {
        Self::Batcher {
            reason: reason.into(),
        }
    }

    /// Create edge protocol error
    pub fn edge(reason: impl Into<String>) -> Self {
        Self::Edge {
            reason: reason.into(),
        }
    }

    /// Create internal error (use sparingly)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if error is a startup configuration error
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::ConfigParse(_))
    }

    /// Check if the failed operation may succeed when attempted again
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { .. } | Self::Transport { .. } => true,
            Self::Configuration { .. }
            | Self::Conversion { .. }
            | Self::Batcher { .. }
            | Self::Edge { .. }
            | Self::ConfigParse(_)
            | Self::Internal { .. } => false,
        }
    }
}
