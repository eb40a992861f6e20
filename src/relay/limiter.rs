//! Uniform-spacing rate limiter.
//!
//! Instead of releasing Q messages in a burst every W, the limiter hands out
//! one slot every W/Q. Slots are reserved under a fair async mutex, so the
//! order of `reserve()` calls is the order of admissions regardless of
//! whether the caller is the live path or a backfill task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{QuotaConfig, QuotaScope};
use crate::message::ChannelId;

struct LimiterState {
    quota: QuotaConfig,
    next_slot: Option<Instant>,
}

/// One quota group.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(quota: QuotaConfig) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                quota,
                next_slot: None,
            }),
        }
    }

    /// Reserve the next free slot and return the instant it opens.
    ///
    /// The slot is consumed immediately. A caller that gives up before its
    /// slot opens does not get it back.
    pub async fn reserve(&self) -> Instant {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let slot = match state.next_slot {
            Some(next) if next > now => next,
            _ => now,
        };
        state.next_slot = Some(slot + state.quota.interval());
        slot
    }

    /// Change the quota. Applies to reservations made after this call;
    /// the slot already scheduled next is kept.
    pub async fn reconfigure(&self, quota: QuotaConfig) {
        let mut state = self.state.lock().await;
        debug!(
            messages = quota.messages,
            window_secs = quota.window.as_secs(),
            "Rate limiter reconfigured"
        );
        state.quota = quota;
    }

    pub async fn quota(&self) -> QuotaConfig {
        self.state.lock().await.quota
    }
}

/// Hands out the limiter for a channel according to the quota scope.
pub struct Limiters {
    scope: QuotaScope,
    global: Arc<RateLimiter>,
    per_channel: Mutex<HashMap<ChannelId, Arc<RateLimiter>>>,
    quota: Mutex<QuotaConfig>,
}

impl Limiters {
    pub fn new(quota: QuotaConfig, scope: QuotaScope) -> Self {
        Self {
            scope,
            global: Arc::new(RateLimiter::new(quota)),
            per_channel: Mutex::new(HashMap::new()),
            quota: Mutex::new(quota),
        }
    }

    pub fn scope(&self) -> QuotaScope {
        self.scope
    }

    /// The limiter that governs `channel`.
    pub async fn for_channel(&self, channel: ChannelId) -> Arc<RateLimiter> {
        match self.scope {
            QuotaScope::Global => Arc::clone(&self.global),
            QuotaScope::PerChannel => {
                let quota = *self.quota.lock().await;
                let mut map = self.per_channel.lock().await;
                Arc::clone(
                    map.entry(channel)
                        .or_insert_with(|| Arc::new(RateLimiter::new(quota))),
                )
            }
        }
    }

    /// Reconfigure every limiter, present and future.
    pub async fn reconfigure(&self, quota: QuotaConfig) {
        *self.quota.lock().await = quota;
        self.global.reconfigure(quota).await;
        let limiters: Vec<Arc<RateLimiter>> =
            self.per_channel.lock().await.values().cloned().collect();
        for limiter in limiters {
            limiter.reconfigure(quota).await;
        }
    }

    pub async fn quota(&self) -> QuotaConfig {
        *self.quota.lock().await
    }
}
