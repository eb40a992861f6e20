//! Live ingestion: forward messages as the source reports them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::channels::Source;
use crate::message::{ChannelId, Route};
use crate::recorder::Recorder;
use crate::relay::forwarder::{ForwardOutcome, Forwarder};
use crate::store::{ErrorCategory, ErrorContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveState {
    Running,
    /// The source closed the stream.
    Ended,
    /// Stopped on a subscription or store failure. Needs a restart.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub channel_id: ChannelId,
    pub state: LiveState,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Per-channel state of the live tasks, for statistics.
#[derive(Default)]
pub struct LiveHealth {
    channels: RwLock<HashMap<ChannelId, LiveStatus>>,
}

impl LiveHealth {
    pub fn new() -> Self {
        Self::default()
    }

    async fn set(&self, channel: ChannelId, state: LiveState, last_error: Option<String>) {
        self.channels.write().await.insert(
            channel,
            LiveStatus {
                channel_id: channel,
                state,
                last_error,
                updated_at: Utc::now(),
            },
        );
    }

    pub async fn state(&self, channel: ChannelId) -> Option<LiveState> {
        self.channels.read().await.get(&channel).map(|s| s.state)
    }

    /// All channels, ordered by id.
    pub async fn statuses(&self) -> Vec<LiveStatus> {
        let mut statuses: Vec<LiveStatus> = self.channels.read().await.values().cloned().collect();
        statuses.sort_by_key(|s| s.channel_id);
        statuses
    }
}

/// Spawn a task forwarding live messages for `route`, one at a time in
/// arrival order. Denied messages are dropped; live traffic is never queued
/// behind a pause.
///
/// Each message is acknowledged to the source once the forwarder returns an
/// outcome for it. On a store failure the task stops without acknowledging,
/// marks the channel failed and leaves the message with the source.
pub fn spawn_live_task(
    source: Arc<dyn Source>,
    forwarder: Arc<Forwarder>,
    recorder: Arc<Recorder>,
    health: Arc<LiveHealth>,
    route: Route,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let channel = route.source;
        let mut stream = match source.subscribe(channel).await {
            Ok(stream) => stream,
            Err(e) => {
                let message = format!("Live subscription failed: {e}");
                recorder
                    .record_error(
                        ErrorCategory::SourceUnavailable,
                        message.clone(),
                        ErrorContext::channel(channel),
                    )
                    .await;
                health.set(channel, LiveState::Failed, Some(message)).await;
                return;
            }
        };
        health.set(channel, LiveState::Running, None).await;
        info!(%route, source = source.name(), "Live forwarding started");

        while let Some(incoming) = stream.next().await {
            let message_id = incoming.message.id;
            match forwarder.forward(&route, &incoming.message).await {
                Ok(outcome) => {
                    match outcome {
                        ForwardOutcome::Delivered { .. } => {}
                        ForwardOutcome::Denied { reason } => {
                            debug!(channel, message_id, %reason, "Live message dropped by policy");
                        }
                        other => {
                            debug!(channel, message_id, outcome = ?other, "Live message not delivered");
                        }
                    }
                    incoming.ack();
                }
                Err(e) => {
                    // Already recorded by the forwarder.
                    error!(%route, message_id, error = %e, "Live forwarding stopped on store failure");
                    health
                        .set(channel, LiveState::Failed, Some(e.to_string()))
                        .await;
                    return;
                }
            }
        }
        health.set(channel, LiveState::Ended, None).await;
        info!(%route, "Live stream ended");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::channels::{MemorySink, MemorySource};
    use crate::config::{QuotaConfig, QuotaScope};
    use crate::message::Message;
    use crate::policy::{AdminService, PolicyStore};
    use crate::relay::limiter::Limiters;
    use crate::relay::retry::RetryPolicy;
    use crate::store::testing::FlakyDatabase;
    use crate::store::{Database, LibSqlBackend};

    struct Fixture {
        db: Arc<dyn Database>,
        admin: AdminService,
        recorder: Arc<Recorder>,
        forwarder: Arc<Forwarder>,
        source: Arc<MemorySource>,
        sink: Arc<MemorySink>,
        health: Arc<LiveHealth>,
    }

    async fn fixture(db: Arc<dyn Database>) -> Fixture {
        let policy = Arc::new(PolicyStore::load(db.as_ref()).await.unwrap());
        // One message per minute.
        let limiters = Arc::new(Limiters::new(
            QuotaConfig {
                messages: 1,
                window: Duration::from_secs(60),
            },
            QuotaScope::Global,
        ));
        let recorder = Arc::new(Recorder::new(Arc::clone(&db)));
        let sink = Arc::new(MemorySink::new());
        let admin = AdminService::new(
            Arc::clone(&db),
            Arc::clone(&policy),
            Arc::clone(&limiters),
            HashSet::from([9]),
        );
        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&db),
            sink.clone(),
            policy,
            limiters,
            Arc::clone(&recorder),
            RetryPolicy::none(),
        ));
        Fixture {
            db,
            admin,
            recorder,
            forwarder,
            source: Arc::new(MemorySource::new()),
            sink,
            health: Arc::new(LiveHealth::new()),
        }
    }

    impl Fixture {
        fn spawn(&self) -> JoinHandle<()> {
            spawn_live_task(
                self.source.clone(),
                Arc::clone(&self.forwarder),
                Arc::clone(&self.recorder),
                Arc::clone(&self.health),
                Route::new(-1, -2),
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_live_messages_and_drops_blacklisted() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let f = fixture(db).await;
        let handle = f.spawn();
        let mut deliveries = f.sink.watch().await;
        tokio::task::yield_now().await;

        f.source.push(Message::text(-1, 1, "first")).await;
        deliveries.recv().await.unwrap();

        f.admin.blacklist_add(9, -1, None).await.unwrap();
        f.source.push(Message::text(-1, 2, "dropped")).await;
        f.source.close().await;
        handle.await.unwrap();

        assert_eq!(f.sink.delivered_ids().await, vec![1]);
        assert!(!f.db.has_forwarded(-1, 2).await.unwrap());
        assert_eq!(f.db.error_count().await.unwrap(), 0);
        // Denied messages count as handled.
        while !f.source.pending(-1).await.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.health.state(-1).await, Some(LiveState::Ended));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_mid_backlog_loses_nothing() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let f = fixture(db).await;
        let mut deliveries = f.sink.watch().await;
        let first = f.spawn();
        tokio::task::yield_now().await;

        for id in 1..=10 {
            f.source.push(Message::text(-1, id, format!("burst {id}"))).await;
        }
        for _ in 0..3 {
            deliveries.recv().await.unwrap();
        }
        // Let message 3 be recorded; message 4 now waits for its slot.
        tokio::time::sleep(Duration::from_secs(30)).await;
        first.abort();
        let _ = first.await;

        let second = f.spawn();
        for _ in 3..10 {
            deliveries.recv().await.unwrap();
        }
        f.source.close().await;
        second.await.unwrap();

        assert_eq!(f.sink.delivered_ids().await, (1..=10).collect::<Vec<_>>());
        assert_eq!(f.db.forwarded_count_for(-1).await.unwrap(), 10);
        while !f.source.pending(-1).await.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_marks_channel_failed() {
        let flaky = Arc::new(FlakyDatabase::new().await);
        let f = fixture(flaky.clone()).await;
        let handle = f.spawn();
        tokio::task::yield_now().await;

        flaky.fail_record_forwarded(true);
        f.source.push(Message::text(-1, 1, "lost record")).await;
        handle.await.unwrap();

        assert_eq!(f.health.state(-1).await, Some(LiveState::Failed));
        let statuses = f.health.statuses().await;
        assert!(statuses[0].last_error.as_deref().unwrap().contains("unavailable"));

        let errors = f.db.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, ErrorCategory::Store);
        // Left with the source for the next subscription.
        assert_eq!(f.source.pending(-1).await, vec![1]);
    }
}
