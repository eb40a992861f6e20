//! Error and audit recorder.
//!
//! Persisting a record never fails the caller: a record that cannot be
//! written is still traced, and the write failure is logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::DatabaseError;
use crate::message::ActorId;
use crate::store::{
    AuditEntry, Database, ErrorCategory, ErrorContext, ErrorRecord, NewAuditEntry, NewErrorRecord,
};

/// How often the prune task runs.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Recorder {
    db: Arc<dyn Database>,
}

impl Recorder {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Trace and persist a failure. Returns the record id when it was stored.
    pub async fn record_error(
        &self,
        category: ErrorCategory,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Option<i64> {
        let message = message.into();
        match category {
            ErrorCategory::TransientDelivery | ErrorCategory::SourceUnavailable => warn!(
                category = category.as_str(),
                channel = ?context.channel_id,
                message_id = ?context.message_id,
                attempts = ?context.attempts,
                "{message}"
            ),
            ErrorCategory::PermanentDelivery | ErrorCategory::Store => error!(
                category = category.as_str(),
                channel = ?context.channel_id,
                message_id = ?context.message_id,
                attempts = ?context.attempts,
                "{message}"
            ),
        }

        let record = NewErrorRecord {
            category,
            message,
            context,
            occurred_at: Utc::now(),
        };
        match self.db.insert_error(&record).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, "Failed to persist error record");
                None
            }
        }
    }

    /// Append an audit entry for an administrative action.
    pub async fn record_audit(
        &self,
        actor: ActorId,
        action: &str,
        details: impl Into<String>,
    ) -> Result<i64, DatabaseError> {
        let entry = NewAuditEntry::new(actor, action, details);
        let id = self.db.append_audit(&entry).await?;
        info!(actor, action, details = %entry.details, "Audit entry recorded");
        Ok(id)
    }

    pub async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorRecord>, DatabaseError> {
        self.db.recent_errors(limit).await
    }

    pub async fn error_count(&self) -> Result<u64, DatabaseError> {
        self.db.error_count().await
    }

    pub async fn audit_log(
        &self,
        limit: usize,
        actor: Option<ActorId>,
    ) -> Result<Vec<AuditEntry>, DatabaseError> {
        self.db.list_audit(limit, actor).await
    }

    /// Action → count for one administrator.
    pub async fn actor_breakdown(
        &self,
        actor: ActorId,
    ) -> Result<HashMap<String, u64>, DatabaseError> {
        self.db.audit_action_counts(actor).await
    }

    /// Delete error records older than `retention`.
    pub async fn prune_errors(&self, retention: Duration) -> Result<usize, DatabaseError> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - retention;
        let deleted = self.db.prune_errors(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "Pruned old error records");
        }
        Ok(deleted)
    }
}

/// Spawn a background task that prunes the error log every hour.
pub fn spawn_prune_task(recorder: Arc<Recorder>, retention: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = recorder.prune_errors(retention).await {
                warn!(error = %e, "Error log pruning failed");
            }
        }
    })
}
