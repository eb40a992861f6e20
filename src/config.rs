//! Configuration types.
//!
//! Everything is read from `RELAY_*` environment variables. Settings that an
//! administrator has persisted (`forwarding_mode`, `quota_messages`,
//! `quota_window_secs`) take precedence over the environment at startup.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;

use crate::error::ConfigError;
use crate::message::{ActorId, Route};
use crate::relay::retry::RetryPolicy;
use crate::store::PolicyRows;

pub const SETTING_FORWARDING_MODE: &str = "forwarding_mode";
pub const SETTING_QUOTA_MESSAGES: &str = "quota_messages";
pub const SETTING_QUOTA_WINDOW_SECS: &str = "quota_window_secs";

/// Throughput ceiling: at most `messages` admissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    pub messages: u32,
    pub window: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            messages: 50,
            window: Duration::from_secs(20 * 60),
        }
    }
}

impl QuotaConfig {
    /// Spacing between consecutive admissions.
    pub fn interval(&self) -> Duration {
        self.window / self.messages.max(1)
    }

    /// Apply persisted quota settings on top of this config. Unparseable
    /// values are ignored with a warning.
    pub fn with_overrides(mut self, rows: &PolicyRows) -> Self {
        if let Some(raw) = rows.setting(SETTING_QUOTA_MESSAGES) {
            match parse_quota_messages(raw) {
                Ok(n) => self.messages = n,
                Err(e) => tracing::warn!(error = %e, "Ignoring persisted quota_messages"),
            }
        }
        if let Some(raw) = rows.setting(SETTING_QUOTA_WINDOW_SECS) {
            match parse_quota_window(raw) {
                Ok(w) => self.window = w,
                Err(e) => tracing::warn!(error = %e, "Ignoring persisted quota_window_secs"),
            }
        }
        self
    }
}

pub fn parse_quota_messages(raw: &str) -> Result<u32, ConfigError> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key: SETTING_QUOTA_MESSAGES.into(),
            message: format!("expected a positive integer, got '{raw}'"),
        }),
    }
}

pub fn parse_quota_window(raw: &str) -> Result<Duration, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidValue {
            key: SETTING_QUOTA_WINDOW_SECS.into(),
            message: format!("expected a positive number of seconds, got '{raw}'"),
        }),
    }
}

/// Whether the quota is shared by every channel or kept per source channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    #[default]
    Global,
    PerChannel,
}

impl std::str::FromStr for QuotaScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "per_channel" | "per-channel" => Ok(Self::PerChannel),
            other => Err(format!("expected global or per_channel, got '{other}'")),
        }
    }
}

/// Relay process configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Telegram bot token.
    pub bot_token: SecretString,
    /// Source → destination pairs. Sources are unique.
    pub routes: Vec<Route>,
    pub db_path: PathBuf,
    pub quota: QuotaConfig,
    pub quota_scope: QuotaScope,
    /// Messages per backfill page.
    pub page_size: usize,
    pub retry: RetryPolicy,
    pub forward_live: bool,
    pub forward_history: bool,
    /// How long error records are kept.
    pub error_retention: Duration,
    pub api_addr: SocketAddr,
    /// Actors allowed to issue administrative commands.
    pub admin_ids: HashSet<ActorId>,
    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
}

impl RelayConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bot_token = get("RELAY_BOT_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("RELAY_BOT_TOKEN".into()))?;

        let routes_raw =
            get("RELAY_ROUTES").ok_or_else(|| ConfigError::MissingEnvVar("RELAY_ROUTES".into()))?;
        let routes = parse_routes(&routes_raw)?;

        let db_path = get("RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/channel-relay.db"));

        let defaults = QuotaConfig::default();
        let quota = QuotaConfig {
            messages: match get("RELAY_QUOTA_MESSAGES") {
                Some(raw) => parse_quota_messages(&raw).map_err(|e| rename(e, "RELAY_QUOTA_MESSAGES"))?,
                None => defaults.messages,
            },
            window: match get("RELAY_QUOTA_WINDOW_SECS") {
                Some(raw) => parse_quota_window(&raw).map_err(|e| rename(e, "RELAY_QUOTA_WINDOW_SECS"))?,
                None => defaults.window,
            },
        };

        let quota_scope = match get("RELAY_QUOTA_SCOPE") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "RELAY_QUOTA_SCOPE".into(),
                message,
            })?,
            None => QuotaScope::default(),
        };

        let page_size: usize = parse_or(&get, "RELAY_PAGE_SIZE", 100)?;
        if page_size == 0 {
            return Err(invalid("RELAY_PAGE_SIZE", "must be at least 1"));
        }

        let max_attempts: u32 = parse_or(&get, "RELAY_MAX_DELIVERY_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(invalid("RELAY_MAX_DELIVERY_ATTEMPTS", "must be at least 1"));
        }
        let retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(parse_or(&get, "RELAY_RETRY_BASE_MS", 1000)?),
            max_delay: Duration::from_millis(parse_or(&get, "RELAY_RETRY_MAX_MS", 30_000)?),
        };

        let forward_live = parse_flag(&get, "RELAY_FORWARD_LIVE", true)?;
        let forward_history = parse_flag(&get, "RELAY_FORWARD_HISTORY", true)?;

        let retention_days: u64 = parse_or(&get, "RELAY_ERROR_RETENTION_DAYS", 30)?;
        let error_retention = Duration::from_secs(retention_days * 24 * 60 * 60);

        let api_addr: SocketAddr = match get("RELAY_API_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e| invalid("RELAY_API_ADDR", &format!("{e}")))?,
            None => SocketAddr::from(([127, 0, 0, 1], 8080)),
        };

        let admin_ids = get("RELAY_ADMIN_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<ActorId>()
                    .map_err(|_| invalid("RELAY_ADMIN_IDS", &format!("'{s}' is not a user id")))
            })
            .collect::<Result<HashSet<_>, _>>()?;

        let log_dir = get("RELAY_LOG_DIR").map(PathBuf::from);

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            routes,
            db_path,
            quota,
            quota_scope,
            page_size,
            retry,
            forward_live,
            forward_history,
            error_retention,
            api_addr,
            admin_ids,
            log_dir,
        })
    }
}

/// Parse `source:destination` pairs separated by commas.
pub fn parse_routes(raw: &str) -> Result<Vec<Route>, ConfigError> {
    let mut routes: Vec<Route> = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (src, dst) = pair
            .split_once(':')
            .ok_or_else(|| invalid("RELAY_ROUTES", &format!("'{pair}' is not source:destination")))?;
        let source = src
            .trim()
            .parse()
            .map_err(|_| invalid("RELAY_ROUTES", &format!("bad source id in '{pair}'")))?;
        let destination = dst
            .trim()
            .parse()
            .map_err(|_| invalid("RELAY_ROUTES", &format!("bad destination id in '{pair}'")))?;
        if routes.iter().any(|r| r.source == source) {
            return Err(invalid(
                "RELAY_ROUTES",
                &format!("source {source} is routed more than once"),
            ));
        }
        routes.push(Route::new(source, destination));
    }
    if routes.is_empty() {
        return Err(invalid("RELAY_ROUTES", "no routes configured"));
    }
    Ok(routes)
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        message: message.into(),
    }
}

fn rename(err: ConfigError, key: &str) -> ConfigError {
    match err {
        ConfigError::InvalidValue { message, .. } => invalid(key, &message),
        other => other,
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &e.to_string())),
        None => Ok(default),
    }
}

fn parse_flag<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes") => Ok(true),
        Some(v) if matches!(v.as_str(), "false" | "0" | "no") => Ok(false),
        Some(v) => Err(invalid(key, &format!("expected true or false, got '{v}'"))),
        None => Ok(default),
    }
}
