//! Administrative service: the single writer of policy state.
//!
//! Every mutation persists the change together with exactly one audit entry,
//! then publishes a fresh snapshot before returning, so the caller's next
//! admission decision already sees it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{
    self, QuotaConfig, SETTING_FORWARDING_MODE, SETTING_QUOTA_MESSAGES, SETTING_QUOTA_WINDOW_SECS,
};
use crate::error::AdminError;
use crate::message::{ActorId, ChannelId};
use crate::policy::model::{ChannelPolicy, ForwardingMode, ListMode, PauseScope, PauseState, PolicySnapshot};
use crate::policy::store::PolicyStore;
use crate::relay::limiter::Limiters;
use crate::store::{Database, NewAuditEntry, PolicyChange};

pub const ACTION_PAUSE: &str = "PAUSE";
pub const ACTION_RESUME: &str = "RESUME";
pub const ACTION_WHITELIST_ADD: &str = "WHITELIST_ADD";
pub const ACTION_WHITELIST_REMOVE: &str = "WHITELIST_REMOVE";
pub const ACTION_BLACKLIST_ADD: &str = "BLACKLIST_ADD";
pub const ACTION_BLACKLIST_REMOVE: &str = "BLACKLIST_REMOVE";
pub const ACTION_SETTING_UPDATE: &str = "SETTING_UPDATE";

pub struct AdminService {
    db: Arc<dyn Database>,
    policy: Arc<PolicyStore>,
    limiters: Arc<Limiters>,
    admins: HashSet<ActorId>,
    lock: Mutex<()>,
}

impl AdminService {
    pub fn new(
        db: Arc<dyn Database>,
        policy: Arc<PolicyStore>,
        limiters: Arc<Limiters>,
        admins: HashSet<ActorId>,
    ) -> Self {
        Self {
            db,
            policy,
            limiters,
            admins,
            lock: Mutex::new(()),
        }
    }

    /// Reject actors that are not configured administrators.
    pub fn authorize(&self, actor: ActorId) -> Result<(), AdminError> {
        if self.admins.contains(&actor) {
            Ok(())
        } else {
            Err(AdminError::Unauthorized(actor))
        }
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    pub async fn pause(
        &self,
        actor: ActorId,
        scope: PauseScope,
        reason: impl Into<String>,
    ) -> Result<Arc<PolicySnapshot>, AdminError> {
        let reason = reason.into();
        let details = format!("Paused {scope}. Reason: {reason}");
        let change = PolicyChange::SetPause(PauseState {
            scope,
            paused: true,
            reason,
            set_by: actor,
            set_at: Utc::now(),
        });
        self.apply(actor, change, ACTION_PAUSE, details).await
    }

    pub async fn resume(
        &self,
        actor: ActorId,
        scope: PauseScope,
    ) -> Result<Arc<PolicySnapshot>, AdminError> {
        let change = PolicyChange::SetPause(PauseState {
            scope,
            paused: false,
            reason: String::new(),
            set_by: actor,
            set_at: Utc::now(),
        });
        self.apply(actor, change, ACTION_RESUME, format!("Resumed {scope}"))
            .await
    }

    pub async fn whitelist_add(
        &self,
        actor: ActorId,
        channel: ChannelId,
        reason: Option<String>,
    ) -> Result<Arc<PolicySnapshot>, AdminError> {
        let details = format!("Added channel {channel} to whitelist");
        self.apply(
            actor,
            list_add(actor, channel, ListMode::Whitelisted, reason),
            ACTION_WHITELIST_ADD,
            details,
        )
        .await
    }

    pub async fn whitelist_remove(
        &self,
        actor: ActorId,
        channel: ChannelId,
    ) -> Result<Arc<PolicySnapshot>, AdminError> {
        let change = PolicyChange::RemoveFromList {
            channel_id: channel,
            mode: ListMode::Whitelisted,
        };
        let details = format!("Removed channel {channel} from whitelist");
        self.apply(actor, change, ACTION_WHITELIST_REMOVE, details)
            .await
    }

    pub async fn blacklist_add(
        &self,
        actor: ActorId,
        channel: ChannelId,
        reason: Option<String>,
    ) -> Result<Arc<PolicySnapshot>, AdminError> {
        let details = format!(
            "Added channel {channel} to blacklist. Reason: {}",
            reason.as_deref().unwrap_or("")
        );
        self.apply(
            actor,
            list_add(actor, channel, ListMode::Blacklisted, reason),
            ACTION_BLACKLIST_ADD,
            details,
        )
        .await
    }

    pub async fn blacklist_remove(
        &self,
        actor: ActorId,
        channel: ChannelId,
    ) -> Result<Arc<PolicySnapshot>, AdminError> {
        let change = PolicyChange::RemoveFromList {
            channel_id: channel,
            mode: ListMode::Blacklisted,
        };
        let details = format!("Removed channel {channel} from blacklist");
        self.apply(actor, change, ACTION_BLACKLIST_REMOVE, details)
            .await
    }

    /// Update a known setting. `forwarding_mode` changes the gate;
    /// the quota settings reconfigure the rate limiters.
    ///
    /// The current quota is read, persisted and pushed to the limiters under
    /// the writer lock, so concurrent quota updates cannot overwrite each
    /// other.
    pub async fn update_setting(
        &self,
        actor: ActorId,
        key: &str,
        value: &str,
    ) -> Result<Arc<PolicySnapshot>, AdminError> {
        let _guard = self.lock.lock().await;
        let (normalized, quota) = match key {
            SETTING_FORWARDING_MODE => {
                let mode: ForwardingMode =
                    value.parse().map_err(|message| AdminError::InvalidSetting {
                        key: key.into(),
                        message,
                    })?;
                (mode.as_str().to_string(), None)
            }
            SETTING_QUOTA_MESSAGES => {
                let messages = config::parse_quota_messages(value).map_err(|e| invalid(key, e))?;
                let quota = QuotaConfig {
                    messages,
                    ..self.limiters.quota().await
                };
                (messages.to_string(), Some(quota))
            }
            SETTING_QUOTA_WINDOW_SECS => {
                let window = config::parse_quota_window(value).map_err(|e| invalid(key, e))?;
                let quota = QuotaConfig {
                    window,
                    ..self.limiters.quota().await
                };
                (window.as_secs().to_string(), Some(quota))
            }
            other => return Err(AdminError::UnknownSetting(other.into())),
        };

        let change = PolicyChange::SetSetting {
            key: key.into(),
            value: normalized.clone(),
            updated_by: actor,
        };
        let details = format!("Updated setting {key} to {normalized}");
        let snapshot = self
            .commit(actor, change, ACTION_SETTING_UPDATE, details)
            .await?;

        if let Some(quota) = quota {
            self.limiters.reconfigure(quota).await;
        }
        Ok(snapshot)
    }

    /// Effective values of all known settings.
    pub async fn settings(&self) -> BTreeMap<String, String> {
        let snapshot = self.policy.snapshot();
        let quota = self.limiters.quota().await;
        BTreeMap::from([
            (SETTING_FORWARDING_MODE.to_string(), snapshot.mode.as_str().to_string()),
            (SETTING_QUOTA_MESSAGES.to_string(), quota.messages.to_string()),
            (
                SETTING_QUOTA_WINDOW_SECS.to_string(),
                quota.window.as_secs().to_string(),
            ),
        ])
    }

    async fn apply(
        &self,
        actor: ActorId,
        change: PolicyChange,
        action: &str,
        details: String,
    ) -> Result<Arc<PolicySnapshot>, AdminError> {
        let _guard = self.lock.lock().await;
        self.commit(actor, change, action, details).await
    }

    /// Persist, audit and publish. Callers hold `self.lock`.
    async fn commit(
        &self,
        actor: ActorId,
        change: PolicyChange,
        action: &str,
        details: String,
    ) -> Result<Arc<PolicySnapshot>, AdminError> {
        let audit = NewAuditEntry::new(actor, action, details);
        self.db.apply_policy_change(&change, &audit).await?;
        let rows = self.db.load_policy().await?;
        let snapshot = self.policy.publish(&rows);
        info!(
            actor,
            action,
            details = %audit.details,
            version = snapshot.version,
            "Policy updated"
        );
        Ok(snapshot)
    }
}

fn list_add(
    actor: ActorId,
    channel: ChannelId,
    mode: ListMode,
    reason: Option<String>,
) -> PolicyChange {
    PolicyChange::AddToList(ChannelPolicy {
        channel_id: channel,
        mode,
        reason,
        added_by: actor,
        added_at: Utc::now(),
    })
}

fn invalid(key: &str, err: crate::error::ConfigError) -> AdminError {
    AdminError::InvalidSetting {
        key: key.into(),
        message: err.to_string(),
    }
}
