//! The per-message pipeline shared by the live and backfill paths:
//! gate, dedup, rate-limited admission, delivery, record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, trace};

use crate::channels::Sink;
use crate::error::{DatabaseError, DeliveryError};
use crate::message::{ChannelId, Message, MessageId, Route};
use crate::policy::{Decision, DenyReason, PolicyStore, admit};
use crate::recorder::Recorder;
use crate::relay::limiter::Limiters;
use crate::relay::retry::RetryPolicy;
use crate::store::{Database, ErrorCategory, ErrorContext, ForwardedRecord, RecordOutcome};

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ForwardOutcome {
    Delivered { destination_message_id: MessageId },
    /// A delivery record already exists; nothing was sent.
    AlreadyForwarded,
    /// The gate denied the channel, either up front or while waiting for a slot.
    Denied { reason: DenyReason },
    /// Delivery failed and an error record was written.
    Skipped { category: ErrorCategory },
}

/// One async mutex per source channel. Holding it makes the
/// check → send → record sequence exclusive for that channel.
#[derive(Default)]
pub struct ChannelLocks {
    locks: Mutex<HashMap<ChannelId, Arc<Mutex<()>>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, channel: ChannelId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(channel).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct Forwarder {
    db: Arc<dyn Database>,
    sink: Arc<dyn Sink>,
    policy: Arc<PolicyStore>,
    limiters: Arc<Limiters>,
    recorder: Arc<Recorder>,
    retry: RetryPolicy,
    locks: ChannelLocks,
}

impl Forwarder {
    pub fn new(
        db: Arc<dyn Database>,
        sink: Arc<dyn Sink>,
        policy: Arc<PolicyStore>,
        limiters: Arc<Limiters>,
        recorder: Arc<Recorder>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            sink,
            policy,
            limiters,
            recorder,
            retry,
            locks: ChannelLocks::new(),
        }
    }

    /// Forward one message along `route`.
    ///
    /// Only store failures are returned as errors; they are fatal for the
    /// calling pipeline. Everything else is an outcome.
    pub async fn forward(
        &self,
        route: &Route,
        message: &Message,
    ) -> Result<ForwardOutcome, DatabaseError> {
        let channel = route.source;
        let _guard = self.locks.lock(channel).await;
        let mut policy_rx = self.policy.subscribe();

        let decision = admit(&policy_rx.borrow_and_update(), channel);
        if let Decision::Deny(reason) = decision {
            trace!(channel, message_id = message.id, %reason, "Denied by policy");
            return Ok(ForwardOutcome::Denied { reason });
        }

        let seen = match self.db.has_forwarded(channel, message.id).await {
            Ok(seen) => seen,
            Err(e) => return Err(self.store_failure(route, message, e).await),
        };
        if seen {
            debug!(channel, message_id = message.id, "Already forwarded");
            return Ok(ForwardOutcome::AlreadyForwarded);
        }

        // Wait for a slot, giving it up if the gate closes meanwhile.
        let limiter = self.limiters.for_channel(channel).await;
        let slot = limiter.reserve().await;
        let sleep = tokio::time::sleep_until(slot);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                changed = policy_rx.changed() => {
                    if changed.is_err() {
                        (&mut sleep).await;
                        break;
                    }
                    let decision = admit(&policy_rx.borrow_and_update(), channel);
                    if let Decision::Deny(reason) = decision {
                        debug!(channel, message_id = message.id, %reason, "Slot forfeited, denied while waiting");
                        return Ok(ForwardOutcome::Denied { reason });
                    }
                }
            }
        }

        if let Decision::Deny(reason) = self.policy.admit(channel) {
            debug!(channel, message_id = message.id, %reason, "Denied at send time");
            return Ok(ForwardOutcome::Denied { reason });
        }

        let destination_message_id = match self.deliver_with_retry(route, message).await {
            Ok(id) => id,
            Err(outcome) => return Ok(outcome),
        };

        let record = ForwardedRecord {
            source_channel_id: channel,
            source_message_id: message.id,
            destination_message_id,
            message_kind: message.kind(),
            forwarded_at: Utc::now(),
        };
        let outcome = match self.db.record_forwarded(&record).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.store_failure(route, message, e).await),
        };
        if outcome == RecordOutcome::Conflict {
            debug!(channel, message_id = message.id, "Delivery record already existed");
        }

        info!(
            channel,
            message_id = message.id,
            destination = route.destination,
            destination_message_id,
            kind = %message.kind(),
            "Message forwarded"
        );
        Ok(ForwardOutcome::Delivered {
            destination_message_id,
        })
    }

    /// Deliver inside the already granted slot, retrying transient failures.
    async fn deliver_with_retry(
        &self,
        route: &Route,
        message: &Message,
    ) -> Result<MessageId, ForwardOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.sink.deliver(route.destination, message).await {
                Ok(id) => return Ok(id),
                Err(e) => e,
            };

            let context = ErrorContext::message(route.source, message.id)
                .with_destination(route.destination)
                .with_attempts(attempt);
            match err {
                DeliveryError::Transient {
                    ref reason,
                    retry_after,
                } if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt, retry_after);
                    debug!(
                        channel = route.source,
                        message_id = message.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient delivery failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                DeliveryError::Transient { .. } => {
                    let category = ErrorCategory::TransientDelivery;
                    self.recorder
                        .record_error(category, format!("Giving up: {err}"), context)
                        .await;
                    return Err(ForwardOutcome::Skipped { category });
                }
                DeliveryError::Permanent { .. } => {
                    let category = ErrorCategory::PermanentDelivery;
                    self.recorder
                        .record_error(category, err.to_string(), context)
                        .await;
                    return Err(ForwardOutcome::Skipped { category });
                }
            }
        }
    }

    async fn store_failure(
        &self,
        route: &Route,
        message: &Message,
        err: DatabaseError,
    ) -> DatabaseError {
        self.recorder
            .record_error(
                ErrorCategory::Store,
                err.to_string(),
                ErrorContext::message(route.source, message.id),
            )
            .await;
        err
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::channels::MemorySink;
    use crate::config::{QuotaConfig, QuotaScope};
    use crate::policy::{AdminService, PauseScope};
    use crate::store::LibSqlBackend;

    const SRC: ChannelId = -100;
    const DST: ChannelId = -200;

    struct Fixture {
        db: Arc<dyn Database>,
        sink: Arc<MemorySink>,
        admin: Arc<AdminService>,
        forwarder: Arc<Forwarder>,
    }

    async fn fixture(retry: RetryPolicy) -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let policy = Arc::new(PolicyStore::load(db.as_ref()).await.unwrap());
        let limiters = Arc::new(Limiters::new(QuotaConfig::default(), QuotaScope::Global));
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
            policy,
            limiters,
            recorder,
            retry,
        ));
        Fixture {
            db,
            sink,
            admin,
            forwarder,
        }
    }

    fn route() -> Route {
        Route::new(SRC, DST)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_and_records_once() {
        let f = fixture(RetryPolicy::none()).await;
        let msg = Message::text(SRC, 1, "hello");

        let first = f.forwarder.forward(&route(), &msg).await.unwrap();
        assert_eq!(first, ForwardOutcome::Delivered { destination_message_id: 1 });
        let second = f.forwarder.forward(&route(), &msg).await.unwrap();
        assert_eq!(second, ForwardOutcome::AlreadyForwarded);

        assert_eq!(f.sink.delivered_ids().await, vec![1]);
        assert_eq!(f.db.forwarded_count_for(SRC).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_channel_is_denied_without_error_record() {
        let f = fixture(RetryPolicy::none()).await;
        f.admin.pause(1, PauseScope::Global, "").await.unwrap();

        let outcome = f
            .forwarder
            .forward(&route(), &Message::text(SRC, 1, "x"))
            .await
            .unwrap();
        assert_eq!(outcome, ForwardOutcome::Denied { reason: DenyReason::Paused });
        assert!(f.sink.delivered().await.is_empty());
        assert_eq!(f.db.error_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_while_waiting_forfeits_slot() {
        let f = fixture(RetryPolicy::none()).await;
        // Consume the immediate slot so the next message waits 24s.
        f.forwarder
            .forward(&route(), &Message::text(SRC, 1, "a"))
            .await
            .unwrap();

        let forwarder = Arc::clone(&f.forwarder);
        let waiting = tokio::spawn(async move {
            forwarder
                .forward(&route(), &Message::text(SRC, 2, "b"))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        f.admin.pause(1, PauseScope::Channel(SRC), "hold").await.unwrap();

        let outcome = waiting.await.unwrap();
        assert_eq!(outcome, ForwardOutcome::Denied { reason: DenyReason::ChannelPaused });
        assert_eq!(f.sink.delivered_ids().await, vec![1]);
        assert!(!f.db.has_forwarded(SRC, 2).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_policy_change_keeps_waiting() {
        let f = fixture(RetryPolicy::none()).await;
        f.forwarder
            .forward(&route(), &Message::text(SRC, 1, "a"))
            .await
            .unwrap();

        let forwarder = Arc::clone(&f.forwarder);
        let waiting = tokio::spawn(async move {
            forwarder
                .forward(&route(), &Message::text(SRC, 2, "b"))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        f.admin.pause(1, PauseScope::Channel(-999), "").await.unwrap();

        let outcome = waiting.await.unwrap();
        assert!(matches!(outcome, ForwardOutcome::Delivered { .. }));
        assert_eq!(f.sink.delivered_ids().await, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_within_slot() {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        let f = fixture(retry).await;
        f.sink
            .script_failures(
                SRC,
                1,
                [DeliveryError::transient("502"), DeliveryError::transient("502")],
            )
            .await;

        let outcome = f
            .forwarder
            .forward(&route(), &Message::text(SRC, 1, "x"))
            .await
            .unwrap();
        assert!(matches!(outcome, ForwardOutcome::Delivered { .. }));
        assert_eq!(f.sink.attempts(SRC, 1).await, 3);
        assert_eq!(f.db.error_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_is_skipped_and_recorded() {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        };
        let f = fixture(retry).await;
        f.sink
            .script_failures(SRC, 1, (0..5).map(|_| DeliveryError::transient("flood")))
            .await;

        let outcome = f
            .forwarder
            .forward(&route(), &Message::text(SRC, 1, "x"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ForwardOutcome::Skipped { category: ErrorCategory::TransientDelivery }
        );
        assert_eq!(f.sink.attempts(SRC, 1).await, 2);
        let errors = f.db.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].context.attempts, Some(2));
        assert!(!f.db.has_forwarded(SRC, 1).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_leaves_no_dedup_record() {
        let f = fixture(RetryPolicy::default()).await;
        f.sink
            .script_failures(SRC, 1, [DeliveryError::permanent("chat not found")])
            .await;

        let outcome = f
            .forwarder
            .forward(&route(), &Message::text(SRC, 1, "x"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ForwardOutcome::Skipped { category: ErrorCategory::PermanentDelivery }
        );
        assert_eq!(f.sink.attempts(SRC, 1).await, 1);
        assert!(!f.db.has_forwarded(SRC, 1).await.unwrap());

        // A later manual retry goes through.
        let retried = f
            .forwarder
            .forward(&route(), &Message::text(SRC, 1, "x"))
            .await
            .unwrap();
        assert!(matches!(retried, ForwardOutcome::Delivered { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_attempts_deliver_once() {
        let f = fixture(RetryPolicy::none()).await;
        let msg = Message::text(SRC, 9, "dup");

        let a = {
            let forwarder = Arc::clone(&f.forwarder);
            let msg = msg.clone();
            tokio::spawn(async move { forwarder.forward(&route(), &msg).await.unwrap() })
        };
        let b = {
            let forwarder = Arc::clone(&f.forwarder);
            let msg = msg.clone();
            tokio::spawn(async move { forwarder.forward(&route(), &msg).await.unwrap() })
        };
        let outcomes = [a.await.unwrap(), b.await.unwrap()];

        let delivered = outcomes
            .iter()
            .filter(|o| matches!(o, ForwardOutcome::Delivered { .. }))
            .count();
        assert_eq!(delivered, 1);
        assert!(outcomes.contains(&ForwardOutcome::AlreadyForwarded));
        assert_eq!(f.sink.delivered_ids().await, vec![9]);
        assert_eq!(f.db.forwarded_count().await.unwrap(), 1);
    }
}
