//! Error types for the relay.

use std::time::Duration;

use crate::message::ChannelId;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Backfill error: {0}")]
    Backfill(#[from] BackfillError),

    #[error("Admin error: {0}")]
    Admin(#[from] AdminError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Sink delivery failures.
///
/// Transient failures are retried inside the already granted slot; permanent
/// failures are recorded and skipped without a dedup record.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transient delivery failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("Permanent delivery failure: {reason}")]
    Permanent { reason: String },
}

impl DeliveryError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Source (live stream or history) failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("Source unavailable for channel {channel}: {reason}")]
    Unavailable { channel: ChannelId, reason: String },

    #[error("Source does not support {operation}")]
    Unsupported { operation: String },
}

/// Backfill controller errors surfaced to administrative callers.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("Backfill for channel {channel} is running; stop it before {action}")]
    Running { channel: ChannelId, action: String },

    #[error("Channel {channel} has no configured route")]
    UnknownChannel { channel: ChannelId },

    #[error("Source cannot serve history for channel {channel}")]
    HistoryUnsupported { channel: ChannelId },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Administrative command errors.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Actor {0} is not an administrator")]
    Unauthorized(i64),

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    #[error("Invalid value for setting {key}: {message}")]
    InvalidSetting { key: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
