//! Unified `Database` trait: single async interface for all persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::message::{ActorId, ChannelId, MessageId, MessageKind};
use crate::policy::model::{ChannelPolicy, ListMode, PauseState};

// ── Forwarded records ───────────────────────────────────────────────

/// Proof that a source message reached the sink. Never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedRecord {
    pub source_channel_id: ChannelId,
    pub source_message_id: MessageId,
    pub destination_message_id: MessageId,
    pub message_kind: MessageKind,
    pub forwarded_at: DateTime<Utc>,
}

/// Result of `record_forwarded`. `Conflict` means another writer got there
/// first and is equivalent to success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Conflict,
}

// ── Backfill cursors ────────────────────────────────────────────────

/// Persisted backfill status for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl CursorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for CursorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown cursor status: {other}")),
        }
    }
}

/// Backfill progress for one source channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillCursor {
    pub source_channel_id: ChannelId,
    pub last_processed_message_id: Option<MessageId>,
    pub status: CursorStatus,
    pub updated_at: DateTime<Utc>,
}

// ── Error log ───────────────────────────────────────────────────────

/// Failure taxonomy for the error log. Policy denials are never logged here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    TransientDelivery,
    PermanentDelivery,
    Store,
    SourceUnavailable,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientDelivery => "transient_delivery",
            Self::PermanentDelivery => "permanent_delivery",
            Self::Store => "store",
            Self::SourceUnavailable => "source_unavailable",
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient_delivery" => Ok(Self::TransientDelivery),
            "permanent_delivery" => Ok(Self::PermanentDelivery),
            "store" => Ok(Self::Store),
            "source_unavailable" => Ok(Self::SourceUnavailable),
            other => Err(format!("unknown error category: {other}")),
        }
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ErrorContext {
    pub fn channel(channel_id: ChannelId) -> Self {
        Self {
            channel_id: Some(channel_id),
            ..Self::default()
        }
    }

    pub fn message(channel_id: ChannelId, message_id: MessageId) -> Self {
        Self {
            channel_id: Some(channel_id),
            message_id: Some(message_id),
            ..Self::default()
        }
    }

    pub fn with_destination(mut self, destination_id: ChannelId) -> Self {
        self.destination_id = Some(destination_id);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

/// An error log entry to be appended.
#[derive(Debug, Clone)]
pub struct NewErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub context: ErrorContext,
    pub occurred_at: DateTime<Utc>,
}

/// A persisted error log entry.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub category: ErrorCategory,
    pub message: String,
    pub context: ErrorContext,
}

// ── Audit log ───────────────────────────────────────────────────────

/// An audit entry to be appended.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor_id: ActorId,
    pub action: String,
    pub details: String,
    pub occurred_at: DateTime<Utc>,
}

impl NewAuditEntry {
    pub fn new(actor_id: ActorId, action: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            actor_id,
            action: action.into(),
            details: details.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// A persisted audit entry. Never pruned.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub actor_id: ActorId,
    pub action: String,
    pub details: String,
    pub occurred_at: DateTime<Utc>,
}

// ── Policy ──────────────────────────────────────────────────────────

/// A key/value administrative setting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub updated_by: ActorId,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to rebuild a policy snapshot.
#[derive(Debug, Clone, Default)]
pub struct PolicyRows {
    pub pauses: Vec<PauseState>,
    pub channel_policies: Vec<ChannelPolicy>,
    pub settings: Vec<Setting>,
}

impl PolicyRows {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.as_str())
    }
}

/// A single administrative state change. Applied together with exactly one
/// audit entry.
#[derive(Debug, Clone)]
pub enum PolicyChange {
    /// Upsert the pause row for the state's scope (pause or resume).
    SetPause(PauseState),
    AddToList(ChannelPolicy),
    RemoveFromList { channel_id: ChannelId, mode: ListMode },
    SetSetting {
        key: String,
        value: String,
        updated_by: ActorId,
    },
}

// ── Trait ───────────────────────────────────────────────────────────

/// Backend-agnostic database trait covering dedup records, backfill cursors,
/// policy state, and the error/audit logs.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Forwarded records ───────────────────────────────────────────

    /// Whether `(channel, message)` has already been delivered.
    async fn has_forwarded(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<bool, DatabaseError>;

    /// Record a confirmed delivery. A duplicate key yields `Conflict`, not an error.
    async fn record_forwarded(
        &self,
        record: &ForwardedRecord,
    ) -> Result<RecordOutcome, DatabaseError>;

    /// Fetch the delivery record for `(channel, message)`.
    async fn get_forwarded(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<ForwardedRecord>, DatabaseError>;

    /// Total delivered messages across all channels.
    async fn forwarded_count(&self) -> Result<u64, DatabaseError>;

    /// Delivered messages for one source channel.
    async fn forwarded_count_for(&self, channel: ChannelId) -> Result<u64, DatabaseError>;

    /// Delivered messages grouped by kind.
    async fn forwarded_by_kind(&self) -> Result<HashMap<String, u64>, DatabaseError>;

    // ── Backfill cursors ────────────────────────────────────────────

    /// Get the cursor for a channel, if backfill was ever requested.
    async fn get_cursor(&self, channel: ChannelId)
    -> Result<Option<BackfillCursor>, DatabaseError>;

    /// Get the cursor, creating an idle one if absent.
    async fn ensure_cursor(&self, channel: ChannelId) -> Result<BackfillCursor, DatabaseError>;

    /// Update a cursor's status.
    async fn set_cursor_status(
        &self,
        channel: ChannelId,
        status: CursorStatus,
    ) -> Result<(), DatabaseError>;

    /// Move the cursor forward to `new_id`. Lower ids are rejected with
    /// `DatabaseError::Constraint`.
    async fn advance_cursor(
        &self,
        channel: ChannelId,
        new_id: MessageId,
    ) -> Result<(), DatabaseError>;

    /// Return a cursor to idle with no progress.
    async fn reset_cursor(&self, channel: ChannelId) -> Result<(), DatabaseError>;

    /// All cursors, ordered by channel.
    async fn list_cursors(&self) -> Result<Vec<BackfillCursor>, DatabaseError>;

    // ── Policy ──────────────────────────────────────────────────────

    /// Load pause rows, list memberships and settings.
    async fn load_policy(&self) -> Result<PolicyRows, DatabaseError>;

    /// Apply one administrative change and its audit entry atomically.
    async fn apply_policy_change(
        &self,
        change: &PolicyChange,
        audit: &NewAuditEntry,
    ) -> Result<(), DatabaseError>;

    // ── Audit log ───────────────────────────────────────────────────

    /// Append an audit entry. Returns its id.
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<i64, DatabaseError>;

    /// Most recent audit entries, optionally for one actor.
    async fn list_audit(
        &self,
        limit: usize,
        actor: Option<ActorId>,
    ) -> Result<Vec<AuditEntry>, DatabaseError>;

    /// Count of audit entries per action for one actor.
    async fn audit_action_counts(
        &self,
        actor: ActorId,
    ) -> Result<HashMap<String, u64>, DatabaseError>;

    // ── Error log ───────────────────────────────────────────────────

    /// Append an error record. Returns its id.
    async fn insert_error(&self, record: &NewErrorRecord) -> Result<i64, DatabaseError>;

    /// Total error records currently retained.
    async fn error_count(&self) -> Result<u64, DatabaseError>;

    /// Most recent error records.
    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorRecord>, DatabaseError>;

    /// Delete error records older than `cutoff`. Returns the number deleted.
    async fn prune_errors(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
