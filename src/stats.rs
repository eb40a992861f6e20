//! On-demand statistics over the store, policy and backfill state.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::QuotaScope;
use crate::error::DatabaseError;
use crate::message::ChannelId;
use crate::policy::{ForwardingMode, PauseState, PolicyStore};
use crate::relay::{BackfillController, BackfillStatus, Limiters, LiveHealth, LiveStatus};
use crate::store::Database;

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStats {
    pub messages: u32,
    pub window_secs: u64,
    pub interval_secs: f64,
    pub scope: QuotaScope,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub total_forwarded: u64,
    pub forwarded_by_kind: HashMap<String, u64>,
    pub total_errors: u64,
    pub global_pause: Option<PauseState>,
    pub paused_channels: Vec<ChannelId>,
    pub forwarding_mode: ForwardingMode,
    pub policy_version: u64,
    pub backfill: Vec<BackfillStatus>,
    pub live: Vec<LiveStatus>,
    pub quota: QuotaStats,
}

pub struct Stats {
    db: Arc<dyn Database>,
    policy: Arc<PolicyStore>,
    limiters: Arc<Limiters>,
    backfill: Arc<BackfillController>,
    live: Arc<LiveHealth>,
}

impl Stats {
    pub fn new(
        db: Arc<dyn Database>,
        policy: Arc<PolicyStore>,
        limiters: Arc<Limiters>,
        backfill: Arc<BackfillController>,
        live: Arc<LiveHealth>,
    ) -> Self {
        Self {
            db,
            policy,
            limiters,
            backfill,
            live,
        }
    }

    pub async fn collect(&self) -> Result<RelayStats, DatabaseError> {
        let snapshot = self.policy.snapshot();
        let quota = self.limiters.quota().await;

        let mut paused_channels: Vec<ChannelId> = snapshot.channel_pauses.keys().copied().collect();
        paused_channels.sort_unstable();

        Ok(RelayStats {
            total_forwarded: self.db.forwarded_count().await?,
            forwarded_by_kind: self.db.forwarded_by_kind().await?,
            total_errors: self.db.error_count().await?,
            global_pause: snapshot.global_pause.clone(),
            paused_channels,
            forwarding_mode: snapshot.mode,
            policy_version: snapshot.version,
            backfill: self.backfill.statuses().await?,
            live: self.live.statuses().await,
            quota: QuotaStats {
                messages: quota.messages,
                window_secs: quota.window.as_secs(),
                interval_secs: quota.interval().as_secs_f64(),
                scope: self.limiters.scope(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::channels::{MemorySink, MemorySource};
    use crate::config::QuotaConfig;
    use crate::message::{Message, Route};
    use crate::policy::{AdminService, PauseScope};
    use crate::recorder::Recorder;
    use crate::relay::{Forwarder, RetryPolicy};
    use crate::store::LibSqlBackend;

    #[tokio::test(start_paused = true)]
    async fn reflects_deliveries_and_pauses() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let policy = Arc::new(PolicyStore::load(db.as_ref()).await.unwrap());
        let limiters = Arc::new(Limiters::new(QuotaConfig::default(), QuotaScope::Global));
        let recorder = Arc::new(Recorder::new(Arc::clone(&db)));
        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&db),
            Arc::new(MemorySink::new()),
            Arc::clone(&policy),
            Arc::clone(&limiters),
            Arc::clone(&recorder),
            RetryPolicy::none(),
        ));
        let route = Route::new(-1, -2);
        let backfill = Arc::new(BackfillController::new(
            Arc::clone(&db),
            Arc::new(MemorySource::new()),
            Arc::clone(&forwarder),
            Arc::clone(&policy),
            recorder,
            &[route],
            100,
            RetryPolicy::none(),
        ));
        let admin = AdminService::new(
            Arc::clone(&db),
            Arc::clone(&policy),
            Arc::clone(&limiters),
            HashSet::from([1]),
        );
        let stats = Stats::new(
            Arc::clone(&db),
            Arc::clone(&policy),
            limiters,
            backfill,
            Arc::new(LiveHealth::new()),
        );

        forwarder.forward(&route, &Message::text(-1, 1, "a")).await.unwrap();
        admin.pause(1, PauseScope::Channel(-1), "review").await.unwrap();

        let s = stats.collect().await.unwrap();
        assert_eq!(s.total_forwarded, 1);
        assert_eq!(s.forwarded_by_kind.get("text"), Some(&1));
        assert_eq!(s.total_errors, 0);
        assert!(s.global_pause.is_none());
        assert_eq!(s.paused_channels, vec![-1]);
        assert_eq!(s.policy_version, 2);
        assert_eq!(s.backfill.len(), 1);
        assert_eq!(s.quota.interval_secs, 24.0);

        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["quota"]["scope"], "global");
        assert_eq!(json["backfill"][0]["state"], "idle");
        assert_eq!(json["live"], serde_json::json!([]));
    }
}
