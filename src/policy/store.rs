//! Current policy snapshot, published through a watch channel.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::SETTING_FORWARDING_MODE;
use crate::error::DatabaseError;
use crate::message::ChannelId;
use crate::policy::gate::{self, Decision};
use crate::policy::model::{ForwardingMode, PolicySnapshot};
use crate::store::{Database, PolicyRows};

/// Holder of the current [`PolicySnapshot`].
///
/// Readers call [`snapshot`](Self::snapshot) once per decision. Tasks that
/// wait on policy changes (a paused backfill, a message waiting for its
/// slot) use [`subscribe`](Self::subscribe).
pub struct PolicyStore {
    tx: watch::Sender<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(snapshot));
        Self { tx }
    }

    /// Build the initial snapshot from the database.
    pub async fn load(db: &dyn Database) -> Result<Self, DatabaseError> {
        let rows = db.load_policy().await?;
        Ok(Self::new(snapshot_from_rows(1, &rows)))
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PolicySnapshot>> {
        self.tx.subscribe()
    }

    /// Evaluate `channel` against the current snapshot.
    pub fn admit(&self, channel: ChannelId) -> Decision {
        gate::admit(&self.snapshot(), channel)
    }

    /// Publish a snapshot rebuilt from `rows` with the next version number.
    pub(crate) fn publish(&self, rows: &PolicyRows) -> Arc<PolicySnapshot> {
        let version = self.tx.borrow().version + 1;
        let snapshot = Arc::new(snapshot_from_rows(version, rows));
        self.tx.send_replace(Arc::clone(&snapshot));
        snapshot
    }
}

fn snapshot_from_rows(version: u64, rows: &PolicyRows) -> PolicySnapshot {
    let mode = match rows.setting(SETTING_FORWARDING_MODE) {
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring persisted forwarding_mode");
            ForwardingMode::default()
        }),
        None => ForwardingMode::default(),
    };
    PolicySnapshot::from_rows(version, mode, rows.pauses.clone(), &rows.channel_policies)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::policy::gate::DenyReason;
    use crate::policy::model::{PauseScope, PauseState};
    use crate::store::Setting;

    #[test]
    fn publish_bumps_version_and_notifies() {
        let store = PolicyStore::new(PolicySnapshot::default());
        let mut rx = store.subscribe();
        assert_eq!(store.snapshot().version, 0);

        let rows = PolicyRows {
            pauses: vec![PauseState {
                scope: PauseScope::Global,
                paused: true,
                reason: String::new(),
                set_by: 1,
                set_at: Utc::now(),
            }],
            ..Default::default()
        };
        let published = store.publish(&rows);
        assert_eq!(published.version, 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().version, 1);
        assert_eq!(store.admit(5), Decision::Deny(DenyReason::Paused));
    }

    #[test]
    fn persisted_mode_is_used() {
        let rows = PolicyRows {
            settings: vec![Setting {
                key: SETTING_FORWARDING_MODE.into(),
                value: "whitelist_only".into(),
                updated_by: 1,
                updated_at: Utc::now(),
            }],
            ..Default::default()
        };
        let snapshot = snapshot_from_rows(4, &rows);
        assert_eq!(snapshot.mode, ForwardingMode::WhitelistOnly);
        assert_eq!(snapshot.version, 4);
    }
}
