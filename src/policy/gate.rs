//! Policy gate: the admission decision for one channel against one snapshot.
//!
//! Denials are ordinary control flow. They are traced by callers, never
//! written to the error log.

use serde::Serialize;

use crate::message::ChannelId;
use crate::policy::model::{ForwardingMode, PolicySnapshot};

/// Why a channel is currently not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Paused,
    ChannelPaused,
    NotWhitelisted,
    Blacklisted,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::ChannelPaused => "channel_paused",
            Self::NotWhitelisted => "not_whitelisted",
            Self::Blacklisted => "blacklisted",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Evaluate `channel` against `snapshot`.
///
/// Order: global pause, channel pause, whitelist-only membership,
/// blacklist-exclude membership.
pub fn admit(snapshot: &PolicySnapshot, channel: ChannelId) -> Decision {
    if snapshot.global_pause.is_some() {
        return Decision::Deny(DenyReason::Paused);
    }
    if snapshot.channel_pauses.contains_key(&channel) {
        return Decision::Deny(DenyReason::ChannelPaused);
    }
    match snapshot.mode {
        ForwardingMode::WhitelistOnly if !snapshot.whitelist.contains(&channel) => {
            Decision::Deny(DenyReason::NotWhitelisted)
        }
        ForwardingMode::BlacklistExclude if snapshot.blacklist.contains(&channel) => {
            Decision::Deny(DenyReason::Blacklisted)
        }
        _ => Decision::Allow,
    }
}
