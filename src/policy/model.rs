//! Policy data model: pause rows, channel lists, and the versioned snapshot
//! the gate evaluates against.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ActorId, ChannelId};

/// What a pause row applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "channel_id", rename_all = "snake_case")]
pub enum PauseScope {
    Global,
    Channel(ChannelId),
}

impl PauseScope {
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Self::Global => None,
            Self::Channel(id) => Some(*id),
        }
    }
}

impl std::fmt::Display for PauseScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Channel(id) => write!(f, "channel {id}"),
        }
    }
}

/// A persisted pause. At most one per scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseState {
    pub scope: PauseScope,
    pub paused: bool,
    pub reason: String,
    pub set_by: ActorId,
    pub set_at: DateTime<Utc>,
}

/// Which membership list a channel policy row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListMode {
    Whitelisted,
    Blacklisted,
}

impl ListMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Whitelisted => "whitelisted",
            Self::Blacklisted => "blacklisted",
        }
    }
}

impl std::str::FromStr for ListMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whitelisted" => Ok(Self::Whitelisted),
            "blacklisted" => Ok(Self::Blacklisted),
            other => Err(format!("unknown list mode: {other}")),
        }
    }
}

/// Membership of a channel in the whitelist or blacklist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub channel_id: ChannelId,
    pub mode: ListMode,
    pub reason: Option<String>,
    pub added_by: ActorId,
    pub added_at: DateTime<Utc>,
}

/// The single active forwarding mode the membership lists are evaluated
/// against. Defaults to `BlacklistExclude`, so a blacklist entry takes
/// effect without any mode change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingMode {
    Open,
    WhitelistOnly,
    #[default]
    BlacklistExclude,
}

impl ForwardingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::WhitelistOnly => "whitelist_only",
            Self::BlacklistExclude => "blacklist_exclude",
        }
    }
}

impl std::fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ForwardingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "whitelist_only" | "whitelist" => Ok(Self::WhitelistOnly),
            "blacklist_exclude" | "blacklist" => Ok(Self::BlacklistExclude),
            other => Err(format!(
                "expected open, whitelist_only or blacklist_exclude, got '{other}'"
            )),
        }
    }
}

/// Immutable, momentarily consistent view of all policy state.
///
/// A new snapshot with a higher `version` replaces the old one on every
/// administrative mutation; decisions never mix two versions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicySnapshot {
    pub version: u64,
    pub mode: ForwardingMode,
    pub global_pause: Option<PauseState>,
    pub channel_pauses: HashMap<ChannelId, PauseState>,
    pub whitelist: HashSet<ChannelId>,
    pub blacklist: HashSet<ChannelId>,
}

impl PolicySnapshot {
    /// Build a snapshot from persisted rows.
    pub fn from_rows(
        version: u64,
        mode: ForwardingMode,
        pauses: Vec<PauseState>,
        policies: &[ChannelPolicy],
    ) -> Self {
        let mut snapshot = Self {
            version,
            mode,
            ..Self::default()
        };
        for pause in pauses.into_iter().filter(|p| p.paused) {
            match pause.scope {
                PauseScope::Global => snapshot.global_pause = Some(pause),
                PauseScope::Channel(id) => {
                    snapshot.channel_pauses.insert(id, pause);
                }
            }
        }
        for policy in policies {
            match policy.mode {
                ListMode::Whitelisted => snapshot.whitelist.insert(policy.channel_id),
                ListMode::Blacklisted => snapshot.blacklist.insert(policy.channel_id),
            };
        }
        snapshot
    }

    pub fn is_globally_paused(&self) -> bool {
        self.global_pause.is_some()
    }
}
