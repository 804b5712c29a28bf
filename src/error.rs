//! Error types for the Tagmaker engine
//!
//! This module provides structured error definitions using thiserror. The
//! binary layers anyhow on top for top-level context.

use crate::evolution::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Tagmaker operations
#[derive(Error, Debug)]
pub enum TagmakerError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Storage round trip exceeded its deadline
    #[error("Storage operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Optimistic write lost against a concurrent writer
    #[error("Write conflict on {0}")]
    Conflict(String),

    /// Malformed or incomplete input record
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl TagmakerError {
    /// Whether the failure is expected to clear up on the next scheduled run
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TagmakerError::Database(_) | TagmakerError::Timeout { .. } | TagmakerError::Conflict(_)
        )
    }
}

/// Result type alias for Tagmaker operations
pub type Result<T> = std::result::Result<T, TagmakerError>;

impl From<libsql::Error> for TagmakerError {
    fn from(err: libsql::Error) -> Self {
        TagmakerError::Database(err.to_string())
    }
}

impl From<anyhow::Error> for TagmakerError {
    fn from(err: anyhow::Error) -> Self {
        TagmakerError::Other(err.to_string())
    }
}
