//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for every operation and lives behind a mutex, so a read never
//! observes another call's open transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::message::{ActorId, ChannelId, MessageId, MessageKind};
use crate::policy::model::{ChannelPolicy, ListMode, PauseScope, PauseState};
use crate::store::migrations;
use crate::store::traits::{
    AuditEntry, BackfillCursor, CursorStatus, Database, ErrorCategory, ErrorContext, ErrorRecord,
    ForwardedRecord, NewAuditEntry, NewErrorRecord, PolicyChange, PolicyRows, RecordOutcome,
    Setting,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 so text comparison orders
/// timestamps correctly.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(i) => libsql::Value::Integer(i),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Read a nullable integer column.
fn get_opt_int(row: &libsql::Row, idx: i32) -> Result<Option<i64>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Integer(i) => Ok(Some(i)),
        _ => Ok(None),
    }
}

/// Read a nullable text column.
fn get_opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Text(s) => Ok(Some(s)),
        _ => Ok(None),
    }
}

fn scope_key(scope: &PauseScope) -> String {
    match scope {
        PauseScope::Global => "global".to_string(),
        PauseScope::Channel(id) => id.to_string(),
    }
}

fn row_err(context: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

/// 0:source_channel_id, 1:source_message_id, 2:destination_message_id,
/// 3:message_kind, 4:forwarded_at
fn row_to_forwarded(row: &libsql::Row) -> Result<ForwardedRecord, libsql::Error> {
    let kind_str: String = row.get(3)?;
    let forwarded_str: String = row.get(4)?;
    Ok(ForwardedRecord {
        source_channel_id: row.get(0)?,
        source_message_id: row.get(1)?,
        destination_message_id: row.get(2)?,
        message_kind: kind_str.parse().unwrap_or(MessageKind::Unsupported),
        forwarded_at: parse_datetime(&forwarded_str),
    })
}

/// 0:source_channel_id, 1:last_processed_message_id, 2:status, 3:updated_at
fn row_to_cursor(row: &libsql::Row) -> Result<BackfillCursor, libsql::Error> {
    let status_str: String = row.get(2)?;
    let updated_str: String = row.get(3)?;
    Ok(BackfillCursor {
        source_channel_id: row.get(0)?,
        last_processed_message_id: get_opt_int(row, 1)?,
        status: status_str.parse().unwrap_or(CursorStatus::Idle),
        updated_at: parse_datetime(&updated_str),
    })
}

/// 0:id, 1:occurred_at, 2:category, 3:message, 4:context
fn row_to_error(row: &libsql::Row) -> Result<ErrorRecord, libsql::Error> {
    let occurred_str: String = row.get(1)?;
    let category_str: String = row.get(2)?;
    let context_str: String = row.get(4)?;
    Ok(ErrorRecord {
        id: row.get(0)?,
        occurred_at: parse_datetime(&occurred_str),
        category: category_str.parse().unwrap_or(ErrorCategory::Store),
        message: row.get(3)?,
        context: serde_json::from_str::<ErrorContext>(&context_str).unwrap_or_default(),
    })
}

/// 0:id, 1:actor_id, 2:action, 3:details, 4:occurred_at
fn row_to_audit(row: &libsql::Row) -> Result<AuditEntry, libsql::Error> {
    let occurred_str: String = row.get(4)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        actor_id: row.get(1)?,
        action: row.get(2)?,
        details: row.get(3)?,
        occurred_at: parse_datetime(&occurred_str),
    })
}

const FORWARDED_COLUMNS: &str =
    "source_channel_id, source_message_id, destination_message_id, message_kind, forwarded_at";

const CURSOR_COLUMNS: &str = "source_channel_id, last_processed_message_id, status, updated_at";

async fn insert_audit(conn: &Connection, entry: &NewAuditEntry) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO audit_log (actor_id, action, details, occurred_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            entry.actor_id,
            entry.action.clone(),
            entry.details.clone(),
            ts(&entry.occurred_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_audit: {e}")))?;
    Ok(conn.last_insert_rowid())
}

async fn apply_change(conn: &Connection, change: &PolicyChange) -> Result<(), DatabaseError> {
    match change {
        PolicyChange::SetPause(state) => {
            conn.execute(
                "INSERT INTO pause_states (scope_key, channel_id, paused, reason, set_by, set_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(scope_key) DO UPDATE SET paused = excluded.paused, \
                 reason = excluded.reason, set_by = excluded.set_by, set_at = excluded.set_at",
                params![
                    scope_key(&state.scope),
                    opt_int(state.scope.channel_id()),
                    state.paused as i64,
                    state.reason.clone(),
                    state.set_by,
                    ts(&state.set_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_pause: {e}")))?;
        }
        PolicyChange::AddToList(policy) => {
            conn.execute(
                "INSERT INTO channel_policies (channel_id, mode, reason, added_by, added_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(channel_id, mode) DO UPDATE SET reason = excluded.reason, \
                 added_by = excluded.added_by, added_at = excluded.added_at",
                params![
                    policy.channel_id,
                    policy.mode.as_str(),
                    opt_text(policy.reason.as_deref()),
                    policy.added_by,
                    ts(&policy.added_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_to_list: {e}")))?;
        }
        PolicyChange::RemoveFromList { channel_id, mode } => {
            conn.execute(
                "DELETE FROM channel_policies WHERE channel_id = ?1 AND mode = ?2",
                params![*channel_id, mode.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_from_list: {e}")))?;
        }
        PolicyChange::SetSetting {
            key,
            value,
            updated_by,
        } => {
            conn.execute(
                "INSERT INTO settings (key, value, updated_by, updated_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 updated_by = excluded.updated_by, updated_at = excluded.updated_at",
                params![key.clone(), value.clone(), *updated_by, ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        }
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    // ── Forwarded records ───────────────────────────────────────────

    async fn has_forwarded(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM forwarded_messages WHERE source_channel_id = ?1 AND source_message_id = ?2",
                params![channel, message],
            )
            .await
            .map_err(row_err("has_forwarded"))?;
        let row = rows.next().await.map_err(row_err("has_forwarded"))?;
        Ok(row.is_some())
    }

    async fn record_forwarded(
        &self,
        record: &ForwardedRecord,
    ) -> Result<RecordOutcome, DatabaseError> {
        let conn = self.conn().await;
        let affected = conn
            .execute(
                "INSERT OR IGNORE INTO forwarded_messages \
                 (source_channel_id, source_message_id, destination_message_id, message_kind, forwarded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.source_channel_id,
                    record.source_message_id,
                    record.destination_message_id,
                    record.message_kind.as_str(),
                    ts(&record.forwarded_at),
                ],
            )
            .await
            .map_err(row_err("record_forwarded"))?;

        if affected == 0 {
            debug!(
                channel = record.source_channel_id,
                message = record.source_message_id,
                "Forwarded record already present"
            );
            Ok(RecordOutcome::Conflict)
        } else {
            Ok(RecordOutcome::Inserted)
        }
    }

    async fn get_forwarded(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<ForwardedRecord>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {FORWARDED_COLUMNS} FROM forwarded_messages \
                     WHERE source_channel_id = ?1 AND source_message_id = ?2"
                ),
                params![channel, message],
            )
            .await
            .map_err(row_err("get_forwarded"))?;
        match rows.next().await.map_err(row_err("get_forwarded"))? {
            Some(row) => Ok(Some(row_to_forwarded(&row).map_err(row_err("get_forwarded"))?)),
            None => Ok(None),
        }
    }

    async fn forwarded_count(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM forwarded_messages", ())
            .await
            .map_err(row_err("forwarded_count"))?;
        match rows.next().await.map_err(row_err("forwarded_count"))? {
            Some(row) => Ok(row.get::<i64>(0).map_err(row_err("forwarded_count"))? as u64),
            None => Ok(0),
        }
    }

    async fn forwarded_count_for(&self, channel: ChannelId) -> Result<u64, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM forwarded_messages WHERE source_channel_id = ?1",
                params![channel],
            )
            .await
            .map_err(row_err("forwarded_count_for"))?;
        match rows.next().await.map_err(row_err("forwarded_count_for"))? {
            Some(row) => Ok(row.get::<i64>(0).map_err(row_err("forwarded_count_for"))? as u64),
            None => Ok(0),
        }
    }

    async fn forwarded_by_kind(&self) -> Result<HashMap<String, u64>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT message_kind, COUNT(*) FROM forwarded_messages GROUP BY message_kind",
                (),
            )
            .await
            .map_err(row_err("forwarded_by_kind"))?;
        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await.map_err(row_err("forwarded_by_kind"))? {
            let kind: String = row.get(0).map_err(row_err("forwarded_by_kind"))?;
            let count: i64 = row.get(1).map_err(row_err("forwarded_by_kind"))?;
            counts.insert(kind, count as u64);
        }
        Ok(counts)
    }

    // ── Backfill cursors ────────────────────────────────────────────

    async fn get_cursor(
        &self,
        channel: ChannelId,
    ) -> Result<Option<BackfillCursor>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CURSOR_COLUMNS} FROM backfill_cursors WHERE source_channel_id = ?1"
                ),
                params![channel],
            )
            .await
            .map_err(row_err("get_cursor"))?;
        match rows.next().await.map_err(row_err("get_cursor"))? {
            Some(row) => Ok(Some(row_to_cursor(&row).map_err(row_err("get_cursor"))?)),
            None => Ok(None),
        }
    }

    async fn ensure_cursor(&self, channel: ChannelId) -> Result<BackfillCursor, DatabaseError> {
        {
            self.conn()
                .await
                .execute(
                    "INSERT OR IGNORE INTO backfill_cursors \
                     (source_channel_id, last_processed_message_id, status, updated_at) \
                     VALUES (?1, NULL, 'idle', ?2)",
                    params![channel, ts(&Utc::now())],
                )
                .await
                .map_err(row_err("ensure_cursor"))?;
        }
        self.get_cursor(channel)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "backfill_cursor".into(),
                id: channel.to_string(),
            })
    }

    async fn set_cursor_status(
        &self,
        channel: ChannelId,
        status: CursorStatus,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn
            .execute(
                "INSERT INTO backfill_cursors \
                 (source_channel_id, last_processed_message_id, status, updated_at) \
                 VALUES (?1, NULL, ?2, ?3) \
                 ON CONFLICT(source_channel_id) DO UPDATE SET status = excluded.status, \
                 updated_at = excluded.updated_at",
                params![channel, status.as_str(), ts(&Utc::now())],
            )
            .await
            .map_err(row_err("set_cursor_status"))?;
        Ok(())
    }

    async fn advance_cursor(
        &self,
        channel: ChannelId,
        new_id: MessageId,
    ) -> Result<(), DatabaseError> {
        let affected = {
            self.conn()
                .await
                .execute(
                    "UPDATE backfill_cursors SET last_processed_message_id = ?2, updated_at = ?3 \
                     WHERE source_channel_id = ?1 \
                     AND (last_processed_message_id IS NULL OR last_processed_message_id <= ?2)",
                    params![channel, new_id, ts(&Utc::now())],
                )
                .await
                .map_err(row_err("advance_cursor"))?
        };
        if affected > 0 {
            return Ok(());
        }

        match self.get_cursor(channel).await? {
            Some(cursor) => Err(DatabaseError::Constraint(format!(
                "cursor for channel {channel} cannot move from {:?} back to {new_id}",
                cursor.last_processed_message_id
            ))),
            None => Err(DatabaseError::NotFound {
                entity: "backfill_cursor".into(),
                id: channel.to_string(),
            }),
        }
    }

    async fn reset_cursor(&self, channel: ChannelId) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn
            .execute(
                "INSERT INTO backfill_cursors \
                 (source_channel_id, last_processed_message_id, status, updated_at) \
                 VALUES (?1, NULL, 'idle', ?2) \
                 ON CONFLICT(source_channel_id) DO UPDATE SET last_processed_message_id = NULL, \
                 status = 'idle', updated_at = excluded.updated_at",
                params![channel, ts(&Utc::now())],
            )
            .await
            .map_err(row_err("reset_cursor"))?;
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<BackfillCursor>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {CURSOR_COLUMNS} FROM backfill_cursors ORDER BY source_channel_id"),
                (),
            )
            .await
            .map_err(row_err("list_cursors"))?;
        let mut cursors = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_cursors"))? {
            cursors.push(row_to_cursor(&row).map_err(row_err("list_cursors"))?);
        }
        Ok(cursors)
    }

    // ── Policy ──────────────────────────────────────────────────────

    async fn load_policy(&self) -> Result<PolicyRows, DatabaseError> {
        let conn = self.conn().await;
        let mut policy = PolicyRows::default();

        let mut rows = conn
            .query(
                "SELECT scope_key, channel_id, paused, reason, set_by, set_at FROM pause_states",
                (),
            )
            .await
            .map_err(row_err("load_policy"))?;
        while let Some(row) = rows.next().await.map_err(row_err("load_policy"))? {
            let key: String = row.get(0).map_err(row_err("load_policy"))?;
            let channel_id = get_opt_int(&row, 1).map_err(row_err("load_policy"))?;
            let scope = match (key.as_str(), channel_id) {
                ("global", _) => PauseScope::Global,
                (_, Some(id)) => PauseScope::Channel(id),
                (other, None) => match other.parse::<ChannelId>() {
                    Ok(id) => PauseScope::Channel(id),
                    Err(_) => continue,
                },
            };
            let paused: i64 = row.get(2).map_err(row_err("load_policy"))?;
            let set_at: String = row.get(5).map_err(row_err("load_policy"))?;
            policy.pauses.push(PauseState {
                scope,
                paused: paused != 0,
                reason: row.get(3).map_err(row_err("load_policy"))?,
                set_by: row.get(4).map_err(row_err("load_policy"))?,
                set_at: parse_datetime(&set_at),
            });
        }

        let mut rows = conn
            .query(
                "SELECT channel_id, mode, reason, added_by, added_at FROM channel_policies \
                 ORDER BY channel_id",
                (),
            )
            .await
            .map_err(row_err("load_policy"))?;
        while let Some(row) = rows.next().await.map_err(row_err("load_policy"))? {
            let mode_str: String = row.get(1).map_err(row_err("load_policy"))?;
            let Ok(mode) = mode_str.parse::<ListMode>() else {
                continue;
            };
            let added_at: String = row.get(4).map_err(row_err("load_policy"))?;
            policy.channel_policies.push(ChannelPolicy {
                channel_id: row.get(0).map_err(row_err("load_policy"))?,
                mode,
                reason: get_opt_text(&row, 2).map_err(row_err("load_policy"))?,
                added_by: row.get(3).map_err(row_err("load_policy"))?,
                added_at: parse_datetime(&added_at),
            });
        }

        let mut rows = conn
            .query(
                "SELECT key, value, updated_by, updated_at FROM settings ORDER BY key",
                (),
            )
            .await
            .map_err(row_err("load_policy"))?;
        while let Some(row) = rows.next().await.map_err(row_err("load_policy"))? {
            let updated_at: String = row.get(3).map_err(row_err("load_policy"))?;
            policy.settings.push(Setting {
                key: row.get(0).map_err(row_err("load_policy"))?,
                value: row.get(1).map_err(row_err("load_policy"))?,
                updated_by: row.get(2).map_err(row_err("load_policy"))?,
                updated_at: parse_datetime(&updated_at),
            });
        }

        Ok(policy)
    }

    async fn apply_policy_change(
        &self,
        change: &PolicyChange,
        audit: &NewAuditEntry,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(row_err("apply_policy_change"))?;

        let applied = async {
            apply_change(&tx, change).await?;
            insert_audit(&tx, audit).await?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match applied {
            Ok(()) => tx.commit().await.map_err(row_err("apply_policy_change")),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    // ── Audit log ───────────────────────────────────────────────────

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<i64, DatabaseError> {
        let conn = self.conn().await;
        insert_audit(&conn, entry).await
    }

    async fn list_audit(
        &self,
        limit: usize,
        actor: Option<ActorId>,
    ) -> Result<Vec<AuditEntry>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT id, actor_id, action, details, occurred_at FROM audit_log \
                 WHERE ?1 IS NULL OR actor_id = ?1 ORDER BY id DESC LIMIT ?2",
                params![opt_int(actor), limit as i64],
            )
            .await
            .map_err(row_err("list_audit"))?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_audit"))? {
            entries.push(row_to_audit(&row).map_err(row_err("list_audit"))?);
        }
        Ok(entries)
    }

    async fn audit_action_counts(
        &self,
        actor: ActorId,
    ) -> Result<HashMap<String, u64>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT action, COUNT(*) FROM audit_log WHERE actor_id = ?1 GROUP BY action",
                params![actor],
            )
            .await
            .map_err(row_err("audit_action_counts"))?;
        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await.map_err(row_err("audit_action_counts"))? {
            let action: String = row.get(0).map_err(row_err("audit_action_counts"))?;
            let count: i64 = row.get(1).map_err(row_err("audit_action_counts"))?;
            counts.insert(action, count as u64);
        }
        Ok(counts)
    }

    // ── Error log ───────────────────────────────────────────────────

    async fn insert_error(&self, record: &NewErrorRecord) -> Result<i64, DatabaseError> {
        let context = serde_json::to_string(&record.context)
            .map_err(|e| DatabaseError::Query(format!("insert_error: {e}")))?;
        let conn = self.conn().await;
        conn
            .execute(
                "INSERT INTO error_log (occurred_at, category, message, channel_id, message_id, context) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ts(&record.occurred_at),
                    record.category.as_str(),
                    record.message.clone(),
                    opt_int(record.context.channel_id),
                    opt_int(record.context.message_id),
                    context,
                ],
            )
            .await
            .map_err(row_err("insert_error"))?;
        Ok(conn.last_insert_rowid())
    }

    async fn error_count(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM error_log", ())
            .await
            .map_err(row_err("error_count"))?;
        match rows.next().await.map_err(row_err("error_count"))? {
            Some(row) => Ok(row.get::<i64>(0).map_err(row_err("error_count"))? as u64),
            None => Ok(0),
        }
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorRecord>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT id, occurred_at, category, message, context FROM error_log \
                 ORDER BY id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(row_err("recent_errors"))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("recent_errors"))? {
            records.push(row_to_error(&row).map_err(row_err("recent_errors"))?);
        }
        Ok(records)
    }

    async fn prune_errors(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let conn = self.conn().await;
        let deleted = conn
            .execute(
                "DELETE FROM error_log WHERE occurred_at < ?1",
                params![ts(&cutoff)],
            )
            .await
            .map_err(row_err("prune_errors"))?;
        Ok(deleted as usize)
    }
}
