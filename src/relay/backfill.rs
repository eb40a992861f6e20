//! Resumable history backfill.
//!
//! Each routed channel has its own task walking history oldest-first from
//! the persisted cursor. Every message goes through the same [`Forwarder`]
//! as the live path. The cursor moves only after a whole page has been
//! handled, so a crash mid-page replays that page and dedup absorbs it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::{HistoryPage, Source};
use crate::error::{BackfillError, DatabaseError, SourceError};
use crate::message::{ActorId, ChannelId, MessageId, Route};
use crate::policy::{DenyReason, PolicyStore, admit};
use crate::recorder::Recorder;
use crate::relay::forwarder::{ForwardOutcome, Forwarder};
use crate::relay::retry::RetryPolicy;
use crate::store::{CursorStatus, Database, ErrorCategory, ErrorContext};

pub const ACTION_BACKFILL_START: &str = "BACKFILL_START";
pub const ACTION_BACKFILL_RESET: &str = "BACKFILL_RESET";

/// Backfill state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    Idle,
    Running,
    /// Running, but the gate currently denies the channel. Waiting on policy.
    PausedExternally,
    Completed,
    Failed,
}

impl BackfillState {
    pub fn can_transition_to(&self, target: BackfillState) -> bool {
        use BackfillState::*;

        matches!(
            (self, target),
            (Idle, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, PausedExternally)
                | (PausedExternally, Running)
                // Restart after a failure, or after an explicit reset.
                | (Failed, Running)
                | (Failed, Idle)
                | (Completed, Idle)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::PausedExternally => "paused_externally",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// What to persist for this state.
    fn persisted(&self) -> CursorStatus {
        match self {
            Self::Idle => CursorStatus::Idle,
            Self::Running | Self::PausedExternally => CursorStatus::Running,
            Self::Completed => CursorStatus::Completed,
            Self::Failed => CursorStatus::Failed,
        }
    }
}

impl From<CursorStatus> for BackfillState {
    fn from(status: CursorStatus) -> Self {
        match status {
            CursorStatus::Idle => Self::Idle,
            CursorStatus::Running => Self::Running,
            CursorStatus::Completed => Self::Completed,
            CursorStatus::Failed => Self::Failed,
        }
    }
}

impl std::fmt::Display for BackfillState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel backfill status for statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillStatus {
    pub channel_id: ChannelId,
    pub state: BackfillState,
    pub last_processed_message_id: Option<MessageId>,
    pub updated_at: Option<DateTime<Utc>>,
}

struct Shared {
    db: Arc<dyn Database>,
    source: Arc<dyn Source>,
    forwarder: Arc<Forwarder>,
    policy: Arc<PolicyStore>,
    recorder: Arc<Recorder>,
    page_size: usize,
    source_retry: RetryPolicy,
    states: RwLock<HashMap<ChannelId, BackfillState>>,
}

/// Why a backfill run stopped early.
enum RunError {
    Store(DatabaseError),
    /// Store failure inside the forwarder, which has already recorded it.
    Forward(DatabaseError),
    Source(SourceError),
}

pub struct BackfillController {
    shared: Arc<Shared>,
    routes: HashMap<ChannelId, Route>,
    tasks: Mutex<HashMap<ChannelId, JoinHandle<()>>>,
}

impl BackfillController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn Database>,
        source: Arc<dyn Source>,
        forwarder: Arc<Forwarder>,
        policy: Arc<PolicyStore>,
        recorder: Arc<Recorder>,
        routes: &[Route],
        page_size: usize,
        source_retry: RetryPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                db,
                source,
                forwarder,
                policy,
                recorder,
                page_size: page_size.max(1),
                source_retry,
                states: RwLock::new(HashMap::new()),
            }),
            routes: routes.iter().map(|r| (r.source, *r)).collect(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn supports_history(&self) -> bool {
        self.shared.source.supports_history()
    }

    /// Start backfilling `channel`. A no-op when it is already running or
    /// has completed; the request is audited either way.
    pub async fn start(
        &self,
        actor: ActorId,
        channel: ChannelId,
    ) -> Result<BackfillState, BackfillError> {
        let route = self.route(channel)?;
        if !self.supports_history() {
            return Err(BackfillError::HistoryUnsupported { channel });
        }

        let mut tasks = self.tasks.lock().await;
        let state = if tasks.get(&channel).is_some_and(|h| !h.is_finished()) {
            debug!(channel, "Backfill already running");
            self.state(channel).await?
        } else {
            let cursor = self.shared.db.ensure_cursor(channel).await?;
            if cursor.status == CursorStatus::Completed {
                info!(channel, "Backfill already completed; reset to run again");
                BackfillState::Completed
            } else {
                self.shared
                    .db
                    .set_cursor_status(channel, CursorStatus::Running)
                    .await?;
                self.shared.set_state(channel, BackfillState::Running).await;
                tasks.insert(channel, self.spawn(route));
                BackfillState::Running
            }
        };
        drop(tasks);

        self.shared
            .recorder
            .record_audit(
                actor,
                ACTION_BACKFILL_START,
                format!("Backfill start requested for channel {channel}: {state}"),
            )
            .await?;
        Ok(state)
    }

    /// Return a stopped channel to idle with no progress. Refused while
    /// the channel is running.
    pub async fn reset(&self, actor: ActorId, channel: ChannelId) -> Result<(), BackfillError> {
        self.route(channel)?;
        let mut tasks = self.tasks.lock().await;
        if tasks.get(&channel).is_some_and(|h| !h.is_finished()) {
            return Err(BackfillError::Running {
                channel,
                action: "reset".into(),
            });
        }
        tasks.remove(&channel);
        self.shared.db.reset_cursor(channel).await?;
        self.shared.set_state(channel, BackfillState::Idle).await;
        drop(tasks);

        self.shared
            .recorder
            .record_audit(
                actor,
                ACTION_BACKFILL_RESET,
                format!("Backfill cursor reset for channel {channel}"),
            )
            .await?;
        info!(channel, "Backfill reset");
        Ok(())
    }

    /// Restart every routed channel whose persisted status is `running`.
    /// Returns the channels restarted.
    pub async fn resume_incomplete(&self) -> Result<Vec<ChannelId>, BackfillError> {
        if !self.supports_history() {
            return Ok(Vec::new());
        }
        let mut resumed = Vec::new();
        let mut tasks = self.tasks.lock().await;
        for cursor in self.shared.db.list_cursors().await? {
            if cursor.status != CursorStatus::Running {
                continue;
            }
            let channel = cursor.source_channel_id;
            let Some(route) = self.routes.get(&channel).copied() else {
                warn!(channel, "Backfill cursor is running but channel is no longer routed");
                continue;
            };
            if tasks.get(&channel).is_some_and(|h| !h.is_finished()) {
                continue;
            }
            info!(
                channel,
                last_processed = ?cursor.last_processed_message_id,
                "Resuming interrupted backfill"
            );
            self.shared.set_state(channel, BackfillState::Running).await;
            tasks.insert(channel, self.spawn(route));
            resumed.push(channel);
        }
        Ok(resumed)
    }

    /// Current state of `channel`.
    pub async fn state(&self, channel: ChannelId) -> Result<BackfillState, DatabaseError> {
        if let Some(state) = self.shared.states.read().await.get(&channel) {
            return Ok(*state);
        }
        Ok(self
            .shared
            .db
            .get_cursor(channel)
            .await?
            .map(|c| BackfillState::from(c.status))
            .unwrap_or(BackfillState::Idle))
    }

    /// Status of every routed channel.
    pub async fn statuses(&self) -> Result<Vec<BackfillStatus>, DatabaseError> {
        let cursors: HashMap<ChannelId, _> = self
            .shared
            .db
            .list_cursors()
            .await?
            .into_iter()
            .map(|c| (c.source_channel_id, c))
            .collect();
        let states = self.shared.states.read().await;

        let mut channels: Vec<ChannelId> = self.routes.keys().copied().collect();
        channels.sort_unstable();
        Ok(channels
            .into_iter()
            .map(|channel| {
                let cursor = cursors.get(&channel);
                let state = states
                    .get(&channel)
                    .copied()
                    .or_else(|| cursor.map(|c| c.status.into()))
                    .unwrap_or(BackfillState::Idle);
                BackfillStatus {
                    channel_id: channel,
                    state,
                    last_processed_message_id: cursor.and_then(|c| c.last_processed_message_id),
                    updated_at: cursor.map(|c| c.updated_at),
                }
            })
            .collect())
    }

    /// Wait for the task of `channel` to finish, if one is running.
    pub async fn join(&self, channel: ChannelId) {
        let handle = self.tasks.lock().await.remove(&channel);
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(channel, error = %e, "Backfill task panicked");
        }
    }

    /// Abort every backfill task. Progress is as durable as after a crash.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (channel, handle) in tasks.drain() {
            handle.abort();
            debug!(channel, "Backfill task aborted");
        }
    }

    fn route(&self, channel: ChannelId) -> Result<Route, BackfillError> {
        self.routes
            .get(&channel)
            .copied()
            .ok_or(BackfillError::UnknownChannel { channel })
    }

    fn spawn(&self, route: Route) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.run(route).await })
    }
}

impl Shared {
    async fn set_state(&self, channel: ChannelId, state: BackfillState) {
        let mut states = self.states.write().await;
        let previous = states.insert(channel, state);
        if let Some(previous) = previous
            && previous != state
            && !previous.can_transition_to(state)
        {
            debug!(channel, from = %previous, to = %state, "Unusual backfill transition");
        }
    }

    async fn run(&self, route: Route) {
        let channel = route.source;
        info!(channel, "Backfill started");

        let final_state = match self.run_pages(&route).await {
            Ok(()) => BackfillState::Completed,
            Err(RunError::Source(e)) => {
                self.recorder
                    .record_error(
                        ErrorCategory::SourceUnavailable,
                        format!("Backfill halted: {e}"),
                        ErrorContext::channel(channel)
                            .with_attempts(self.source_retry.max_attempts),
                    )
                    .await;
                BackfillState::Failed
            }
            Err(RunError::Forward(e)) => {
                warn!(channel, error = %e, "Backfill halted on store failure");
                BackfillState::Failed
            }
            Err(RunError::Store(e)) => {
                self.recorder
                    .record_error(
                        ErrorCategory::Store,
                        format!("Backfill halted: {e}"),
                        ErrorContext::channel(channel),
                    )
                    .await;
                BackfillState::Failed
            }
        };

        if let Err(e) = self
            .db
            .set_cursor_status(channel, final_state.persisted())
            .await
        {
            warn!(channel, error = %e, "Failed to persist final backfill status");
        }
        self.set_state(channel, final_state).await;
        info!(channel, state = %final_state, "Backfill finished");
    }

    async fn run_pages(&self, route: &Route) -> Result<(), RunError> {
        let channel = route.source;
        loop {
            let cursor = self
                .db
                .ensure_cursor(channel)
                .await
                .map_err(RunError::Store)?;
            let after = cursor.last_processed_message_id;

            let mut page = self.fetch_page(channel, after).await?;
            if page.messages.is_empty() {
                return Ok(());
            }
            page.messages.sort_by_key(|m| m.id);

            for message in &page.messages {
                loop {
                    match self
                        .forwarder
                        .forward(route, message)
                        .await
                        .map_err(RunError::Forward)?
                    {
                        ForwardOutcome::Denied { reason } => {
                            self.wait_until_admitted(channel, message.id, reason).await;
                        }
                        _ => break,
                    }
                }
            }

            // Non-empty: checked above.
            if let Some(last) = page.messages.last() {
                self.db
                    .advance_cursor(channel, last.id)
                    .await
                    .map_err(RunError::Store)?;
                debug!(channel, cursor = last.id, count = page.messages.len(), "Backfill page done");
            }
            if !page.has_more {
                return Ok(());
            }
        }
    }

    async fn fetch_page(
        &self,
        channel: ChannelId,
        after: Option<MessageId>,
    ) -> Result<HistoryPage, RunError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .source
                .fetch_history(channel, after, self.page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(e @ SourceError::Unsupported { .. }) => return Err(RunError::Source(e)),
                Err(e) if attempt < self.source_retry.max_attempts => {
                    let delay = self.source_retry.delay_for(attempt, None);
                    warn!(channel, attempt, error = %e, "History fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(RunError::Source(e)),
            }
        }
    }

    /// Park in `PausedExternally` until the gate admits `channel` again.
    async fn wait_until_admitted(&self, channel: ChannelId, message_id: MessageId, reason: DenyReason) {
        self.set_state(channel, BackfillState::PausedExternally).await;
        info!(channel, message_id, %reason, "Backfill paused by policy");

        let mut rx = self.policy.subscribe();
        loop {
            if admit(&rx.borrow_and_update(), channel).is_allowed() {
                break;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }

        self.set_state(channel, BackfillState::Running).await;
        info!(channel, message_id, "Backfill resumed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::channels::{MemorySink, MemorySource};
    use crate::config::{QuotaConfig, QuotaScope};
    use crate::error::DeliveryError;
    use crate::message::Message;
    use crate::policy::{AdminService, PauseScope};
    use crate::relay::limiter::Limiters;
    use crate::store::LibSqlBackend;
    use crate::store::testing::FlakyDatabase;

    const SRC: ChannelId = -100;
    const DST: ChannelId = -200;

    struct Fixture {
        db: Arc<dyn Database>,
        source: Arc<MemorySource>,
        sink: Arc<MemorySink>,
        admin: Arc<AdminService>,
        controller: BackfillController,
    }

    async fn fixture_with(source: MemorySource, db: Arc<dyn Database>) -> Fixture {
        let source = Arc::new(source);
        let policy = Arc::new(PolicyStore::load(db.as_ref()).await.unwrap());
        // One message per second keeps paused-clock tests short.
        let limiters = Arc::new(Limiters::new(
            QuotaConfig {
                messages: 60,
                window: Duration::from_secs(60),
            },
            QuotaScope::Global,
        ));
        let sink = Arc::new(MemorySink::new());
        let recorder = Arc::new(Recorder::new(Arc::clone(&db)));
        let admin = Arc::new(AdminService::new(
            Arc::clone(&db),
            Arc::clone(&policy),
            Arc::clone(&limiters),
            HashSet::from([1]),
        ));
        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&db),
            sink.clone(),
            Arc::clone(&policy),
            limiters,
            Arc::clone(&recorder),
            RetryPolicy::none(),
        ));
        let controller = BackfillController::new(
            Arc::clone(&db),
            source.clone(),
            forwarder,
            policy,
            recorder,
            &[Route::new(SRC, DST)],
            10,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
            },
        );
        Fixture {
            db,
            source,
            sink,
            admin,
            controller,
        }
    }

    async fn fixture(messages: i64) -> Fixture {
        let source = MemorySource::new();
        source
            .add_history((1..=messages).map(|i| Message::text(SRC, i, format!("m{i}"))))
            .await;
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        fixture_with(source, db).await
    }

    #[test]
    fn transitions() {
        use BackfillState::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(PausedExternally));
        assert!(PausedExternally.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert_eq!(PausedExternally.persisted(), CursorStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn backfills_everything_in_order() {
        let f = fixture(25).await;
        assert_eq!(f.controller.start(1, SRC).await.unwrap(), BackfillState::Running);
        f.controller.join(SRC).await;

        assert_eq!(f.sink.delivered_ids().await, (1..=25).collect::<Vec<_>>());
        let cursor = f.db.get_cursor(SRC).await.unwrap().unwrap();
        assert_eq!(cursor.last_processed_message_id, Some(25));
        assert_eq!(cursor.status, CursorStatus::Completed);
        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_channel_does_not_restart_until_reset() {
        let f = fixture(3).await;
        f.controller.start(1, SRC).await.unwrap();
        f.controller.join(SRC).await;

        assert_eq!(f.controller.start(1, SRC).await.unwrap(), BackfillState::Completed);
        assert_eq!(f.source.history_calls().await, 1);

        f.controller.reset(1, SRC).await.unwrap();
        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::Idle);
        f.controller.start(1, SRC).await.unwrap();
        f.controller.join(SRC).await;

        // Replayed from the start, but nothing is delivered twice.
        assert_eq!(f.sink.delivered_ids().await, vec![1, 2, 3]);
        let counts = f.db.audit_action_counts(1).await.unwrap();
        assert_eq!(counts.get(ACTION_BACKFILL_START), Some(&3));
        assert_eq!(counts.get(ACTION_BACKFILL_RESET), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_refused_while_running() {
        let f = fixture(50).await;
        f.controller.start(1, SRC).await.unwrap();
        assert!(matches!(
            f.controller.reset(1, SRC).await,
            Err(BackfillError::Running { .. })
        ));
        // Starting again while running is a no-op.
        assert_eq!(f.controller.start(1, SRC).await.unwrap(), BackfillState::Running);
        f.controller.join(SRC).await;
        assert_eq!(f.sink.delivered_ids().await.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_channel_rejected() {
        let f = fixture(1).await;
        assert!(matches!(
            f.controller.start(1, 12345).await,
            Err(BackfillError::UnknownChannel { channel: 12345 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn live_only_source_refuses_backfill() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let f = fixture_with(MemorySource::live_only(), db).await;
        assert!(matches!(
            f.controller.start(1, SRC).await,
            Err(BackfillError::HistoryUnsupported { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn source_failures_retry_then_fail() {
        let f = fixture(5).await;
        f.source.fail_next_history(3).await;
        f.controller.start(1, SRC).await.unwrap();
        f.controller.join(SRC).await;

        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::Failed);
        assert_eq!(f.source.history_calls().await, 3);
        let errors = f.db.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, ErrorCategory::SourceUnavailable);
        assert_eq!(
            f.db.get_cursor(SRC).await.unwrap().unwrap().status,
            CursorStatus::Failed
        );

        // A failed channel can be started again.
        f.controller.start(1, SRC).await.unwrap();
        f.controller.join(SRC).await;
        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::Completed);
        assert_eq!(f.sink.delivered_ids().await.len(), 5);
    }

    async fn flaky_fixture(messages: i64) -> (Fixture, Arc<FlakyDatabase>) {
        let source = MemorySource::new();
        source
            .add_history((1..=messages).map(|i| Message::text(SRC, i, format!("m{i}"))))
            .await;
        let flaky = Arc::new(FlakyDatabase::new().await);
        (fixture_with(source, flaky.clone()).await, flaky)
    }

    #[tokio::test(start_paused = true)]
    async fn record_failure_fails_channel_once() {
        let (f, flaky) = flaky_fixture(5).await;
        flaky.fail_record_forwarded(true);
        f.controller.start(1, SRC).await.unwrap();
        f.controller.join(SRC).await;

        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::Failed);
        let cursor = f.db.get_cursor(SRC).await.unwrap().unwrap();
        assert_eq!(cursor.status, CursorStatus::Failed);
        assert_eq!(cursor.last_processed_message_id, None);

        // The forwarder records it; the controller does not add a second entry.
        let errors = f.db.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, ErrorCategory::Store);
        assert_eq!(errors[0].context.message_id, Some(1));
        // Halted on the first message.
        assert_eq!(f.sink.delivered_ids().await, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_failure_fails_channel_without_advance() {
        let (f, flaky) = flaky_fixture(5).await;
        flaky.fail_advance_cursor(true);
        f.controller.start(1, SRC).await.unwrap();
        f.controller.join(SRC).await;

        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::Failed);
        let cursor = f.db.get_cursor(SRC).await.unwrap().unwrap();
        assert_eq!(cursor.status, CursorStatus::Failed);
        assert_eq!(cursor.last_processed_message_id, None);

        let errors = f.db.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, ErrorCategory::Store);
        assert_eq!(errors[0].context.channel_id, Some(SRC));
        // The page was delivered and recorded, so a restart only moves the cursor.
        assert_eq!(f.db.forwarded_count_for(SRC).await.unwrap(), 5);

        flaky.fail_advance_cursor(false);
        f.controller.start(1, SRC).await.unwrap();
        f.controller.join(SRC).await;
        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::Completed);
        assert_eq!(f.sink.delivered_ids().await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_source_failure_recovers() {
        let f = fixture(5).await;
        f.source.fail_next_history(2).await;
        f.controller.start(1, SRC).await.unwrap();
        f.controller.join(SRC).await;
        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::Completed);
        assert_eq!(f.db.error_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_delivery_failure_skips_message_but_advances() {
        let f = fixture(3).await;
        f.sink
            .script_failures(SRC, 2, [DeliveryError::permanent("too big")])
            .await;
        f.controller.start(1, SRC).await.unwrap();
        f.controller.join(SRC).await;

        assert_eq!(f.sink.delivered_ids().await, vec![1, 3]);
        assert!(!f.db.has_forwarded(SRC, 2).await.unwrap());
        assert_eq!(
            f.db.get_cursor(SRC).await.unwrap().unwrap().last_processed_message_id,
            Some(3)
        );
        assert_eq!(f.db.error_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_parks_and_resume_continues_same_page() {
        let f = fixture(8).await;
        let mut deliveries = f.sink.watch().await;
        f.controller.start(1, SRC).await.unwrap();

        for _ in 0..3 {
            deliveries.recv().await.unwrap();
        }
        f.admin.pause(1, PauseScope::Global, "hold").await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::PausedExternally);
        assert_eq!(f.sink.delivered_ids().await, vec![1, 2, 3]);
        // The page is still in flight, so the cursor has not moved.
        assert_eq!(
            f.db.get_cursor(SRC).await.unwrap().unwrap().last_processed_message_id,
            None
        );

        f.admin.resume(1, PauseScope::Global).await.unwrap();
        f.controller.join(SRC).await;
        assert_eq!(f.sink.delivered_ids().await, (1..=8).collect::<Vec<_>>());
        assert_eq!(f.controller.state(SRC).await.unwrap(), BackfillState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_incomplete_picks_up_running_cursor() {
        let f = fixture(12).await;
        // Simulate a crash after the first page of 10.
        f.db.ensure_cursor(SRC).await.unwrap();
        f.db.set_cursor_status(SRC, CursorStatus::Running).await.unwrap();
        f.db.advance_cursor(SRC, 10).await.unwrap();

        let resumed = f.controller.resume_incomplete().await.unwrap();
        assert_eq!(resumed, vec![SRC]);
        f.controller.join(SRC).await;

        assert_eq!(f.sink.delivered_ids().await, vec![11, 12]);
        let statuses = f.controller.statuses().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, BackfillState::Completed);
        assert_eq!(statuses[0].last_processed_message_id, Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_crash_equivalent() {
        let f = fixture(30).await;
        f.controller.start(1, SRC).await.unwrap();
        tokio::time::sleep(Duration::from_millis(12_500)).await;
        f.controller.shutdown().await;

        // First page of 10 is done; the second was interrupted.
        let cursor = f.db.get_cursor(SRC).await.unwrap().unwrap();
        assert_eq!(cursor.status, CursorStatus::Running);
        assert_eq!(cursor.last_processed_message_id, Some(10));
        let delivered_before = f.sink.delivered_ids().await;
        assert!(delivered_before.len() > 10 && delivered_before.len() < 30);

        f.controller.resume_incomplete().await.unwrap();
        f.controller.join(SRC).await;
        let delivered = f.sink.delivered_ids().await;
        assert_eq!(delivered, (1..=30).collect::<Vec<_>>());
    }
}
