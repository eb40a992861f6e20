//! In-memory store that can be told to fail individual operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::message::{ActorId, ChannelId, MessageId};
use crate::store::libsql_backend::LibSqlBackend;
use crate::store::traits::{
    AuditEntry, BackfillCursor, CursorStatus, Database, ErrorRecord, ForwardedRecord,
    NewAuditEntry, NewErrorRecord, PolicyChange, PolicyRows, RecordOutcome,
};

pub struct FlakyDatabase {
    inner: LibSqlBackend,
    fail_record_forwarded: AtomicBool,
    fail_advance_cursor: AtomicBool,
}

impl FlakyDatabase {
    pub async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            fail_record_forwarded: AtomicBool::new(false),
            fail_advance_cursor: AtomicBool::new(false),
        }
    }

    pub fn fail_record_forwarded(&self, fail: bool) {
        self.fail_record_forwarded.store(fail, Ordering::SeqCst);
    }

    pub fn fail_advance_cursor(&self, fail: bool) {
        self.fail_advance_cursor.store(fail, Ordering::SeqCst);
    }
}

fn unavailable(op: &str) -> DatabaseError {
    DatabaseError::Pool(format!("{op}: database unavailable"))
}

#[async_trait]
impl Database for FlakyDatabase {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn has_forwarded(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<bool, DatabaseError> {
        self.inner.has_forwarded(channel, message).await
    }

    async fn record_forwarded(
        &self,
        record: &ForwardedRecord,
    ) -> Result<RecordOutcome, DatabaseError> {
        if self.fail_record_forwarded.load(Ordering::SeqCst) {
            return Err(unavailable("record_forwarded"));
        }
        self.inner.record_forwarded(record).await
    }

    async fn get_forwarded(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<ForwardedRecord>, DatabaseError> {
        self.inner.get_forwarded(channel, message).await
    }

    async fn forwarded_count(&self) -> Result<u64, DatabaseError> {
        self.inner.forwarded_count().await
    }

    async fn forwarded_count_for(&self, channel: ChannelId) -> Result<u64, DatabaseError> {
        self.inner.forwarded_count_for(channel).await
    }

    async fn forwarded_by_kind(&self) -> Result<HashMap<String, u64>, DatabaseError> {
        self.inner.forwarded_by_kind().await
    }

    async fn get_cursor(
        &self,
        channel: ChannelId,
    ) -> Result<Option<BackfillCursor>, DatabaseError> {
        self.inner.get_cursor(channel).await
    }

    async fn ensure_cursor(&self, channel: ChannelId) -> Result<BackfillCursor, DatabaseError> {
        self.inner.ensure_cursor(channel).await
    }

    async fn set_cursor_status(
        &self,
        channel: ChannelId,
        status: CursorStatus,
    ) -> Result<(), DatabaseError> {
        self.inner.set_cursor_status(channel, status).await
    }

    async fn advance_cursor(
        &self,
        channel: ChannelId,
        new_id: MessageId,
    ) -> Result<(), DatabaseError> {
        if self.fail_advance_cursor.load(Ordering::SeqCst) {
            return Err(unavailable("advance_cursor"));
        }
        self.inner.advance_cursor(channel, new_id).await
    }

    async fn reset_cursor(&self, channel: ChannelId) -> Result<(), DatabaseError> {
        self.inner.reset_cursor(channel).await
    }

    async fn list_cursors(&self) -> Result<Vec<BackfillCursor>, DatabaseError> {
        self.inner.list_cursors().await
    }

    async fn load_policy(&self) -> Result<PolicyRows, DatabaseError> {
        self.inner.load_policy().await
    }

    async fn apply_policy_change(
        &self,
        change: &PolicyChange,
        audit: &NewAuditEntry,
    ) -> Result<(), DatabaseError> {
        self.inner.apply_policy_change(change, audit).await
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<i64, DatabaseError> {
        self.inner.append_audit(entry).await
    }

    async fn list_audit(
        &self,
        limit: usize,
        actor: Option<ActorId>,
    ) -> Result<Vec<AuditEntry>, DatabaseError> {
        self.inner.list_audit(limit, actor).await
    }

    async fn audit_action_counts(
        &self,
        actor: ActorId,
    ) -> Result<HashMap<String, u64>, DatabaseError> {
        self.inner.audit_action_counts(actor).await
    }

    async fn insert_error(&self, record: &NewErrorRecord) -> Result<i64, DatabaseError> {
        self.inner.insert_error(record).await
    }

    async fn error_count(&self) -> Result<u64, DatabaseError> {
        self.inner.error_count().await
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorRecord>, DatabaseError> {
        self.inner.recent_errors(limit).await
    }

    async fn prune_errors(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        self.inner.prune_errors(cutoff).await
    }
}
