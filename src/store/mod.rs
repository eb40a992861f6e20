//! Persistence layer: libSQL-backed storage for delivery records, backfill
//! cursors, policy state and the error/audit logs.

pub mod libsql_backend;
pub mod migrations;
#[cfg(test)]
pub mod testing;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AuditEntry, BackfillCursor, CursorStatus, Database, ErrorCategory, ErrorContext, ErrorRecord,
    ForwardedRecord, NewAuditEntry, NewErrorRecord, PolicyChange, PolicyRows, RecordOutcome,
    Setting,
};
