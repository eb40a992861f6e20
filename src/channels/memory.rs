//! In-process source and sink.
//!
//! Used for dry runs and for exercising the relay end to end without a
//! provider. Both sides can be scripted to fail. Live messages stay pending
//! until a subscriber acknowledges them, like updates held by a provider.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channels::{HistoryPage, Incoming, MessageStream, Sink, Source};
use crate::error::{DeliveryError, SourceError};
use crate::message::{ChannelId, Message, MessageId};

#[derive(Default)]
struct SourceState {
    history: HashMap<ChannelId, BTreeMap<MessageId, Message>>,
    subscribers: HashMap<ChannelId, Vec<mpsc::UnboundedSender<Incoming>>>,
    /// Live messages not yet acknowledged, per channel.
    pending: HashMap<ChannelId, BTreeMap<MessageId, Message>>,
    history_failures: usize,
    history_calls: usize,
}

/// A source backed by in-memory history plus a live push API.
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
    supports_history: bool,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState::default())),
            supports_history: true,
        }
    }

    /// A source that behaves like a live-only provider.
    pub fn live_only() -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState::default())),
            supports_history: false,
        }
    }

    /// Seed history without notifying subscribers.
    pub async fn add_history(&self, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.state.lock().await;
        for message in messages {
            state
                .history
                .entry(message.channel_id)
                .or_default()
                .insert(message.id, message);
        }
    }

    /// Post a live message: recorded in history, held as pending and sent
    /// to subscribers.
    pub async fn push(&self, message: Message) {
        let mut state = self.state.lock().await;
        state
            .history
            .entry(message.channel_id)
            .or_default()
            .insert(message.id, message.clone());
        state
            .pending
            .entry(message.channel_id)
            .or_default()
            .insert(message.id, message.clone());
        if let Some(subscribers) = state.subscribers.get_mut(&message.channel_id) {
            subscribers.retain(|tx| self.offer(tx, message.clone()));
        }
    }

    /// Ids of live messages on `channel` that no subscriber has acknowledged.
    pub async fn pending(&self, channel: ChannelId) -> Vec<MessageId> {
        self.state
            .lock()
            .await
            .pending
            .get(&channel)
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Send `message` to one subscriber and clear it from `pending` once
    /// acknowledged. Returns false when the subscriber is gone.
    fn offer(&self, tx: &mpsc::UnboundedSender<Incoming>, message: Message) -> bool {
        let (channel, id) = (message.channel_id, message.id);
        let (incoming, acked) = Incoming::new(message);
        if tx.send(incoming).is_err() {
            return false;
        }
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if acked.await.is_err() {
                return;
            }
            if let Some(pending) = state.lock().await.pending.get_mut(&channel) {
                pending.remove(&id);
            }
        });
        true
    }

    /// Make the next `n` history fetches fail.
    pub async fn fail_next_history(&self, n: usize) {
        self.state.lock().await.history_failures = n;
    }

    /// Number of `fetch_history` calls so far.
    pub async fn history_calls(&self) -> usize {
        self.state.lock().await.history_calls
    }

    /// Drop all live subscribers, ending their streams.
    pub async fn close(&self) {
        self.state.lock().await.subscribers.clear();
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn subscribe(&self, channel: ChannelId) -> Result<MessageStream, SourceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        let backlog: Vec<Message> = state
            .pending
            .get(&channel)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        for message in backlog {
            self.offer(&tx, message);
        }
        state.subscribers.entry(channel).or_default().push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn supports_history(&self) -> bool {
        self.supports_history
    }

    async fn fetch_history(
        &self,
        channel: ChannelId,
        after: Option<MessageId>,
        page_size: usize,
    ) -> Result<HistoryPage, SourceError> {
        if !self.supports_history {
            return Err(SourceError::Unsupported {
                operation: "fetch_history".into(),
            });
        }
        let mut state = self.state.lock().await;
        state.history_calls += 1;
        if state.history_failures > 0 {
            state.history_failures -= 1;
            return Err(SourceError::Unavailable {
                channel,
                reason: "scripted history failure".into(),
            });
        }

        let Some(history) = state.history.get(&channel) else {
            return Ok(HistoryPage::default());
        };
        let start = after.map_or(MessageId::MIN, |id| id.saturating_add(1));
        let mut remaining = history.range(start..).map(|(_, m)| m.clone());
        let messages: Vec<Message> = remaining.by_ref().take(page_size).collect();
        let has_more = remaining.next().is_some();
        Ok(HistoryPage { messages, has_more })
    }
}

/// One delivery observed by [`MemorySink`].
#[derive(Debug, Clone)]
pub struct Delivered {
    pub destination: ChannelId,
    pub destination_message_id: MessageId,
    pub message: Message,
}

#[derive(Default)]
struct SinkState {
    delivered: Vec<Delivered>,
    next_ids: HashMap<ChannelId, MessageId>,
    scripted: HashMap<(ChannelId, MessageId), VecDeque<DeliveryError>>,
    attempts: HashMap<(ChannelId, MessageId), u32>,
    watchers: Vec<mpsc::UnboundedSender<Delivered>>,
}

/// A sink that records every delivery.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next attempts to deliver `(channel, message)` with `errors`,
    /// in order. Once they run out, delivery succeeds.
    pub async fn script_failures(
        &self,
        channel: ChannelId,
        message: MessageId,
        errors: impl IntoIterator<Item = DeliveryError>,
    ) {
        self.state
            .lock()
            .await
            .scripted
            .entry((channel, message))
            .or_default()
            .extend(errors);
    }

    pub async fn delivered(&self) -> Vec<Delivered> {
        self.state.lock().await.delivered.clone()
    }

    /// Source message ids delivered so far, in delivery order.
    pub async fn delivered_ids(&self) -> Vec<MessageId> {
        self.state
            .lock()
            .await
            .delivered
            .iter()
            .map(|d| d.message.id)
            .collect()
    }

    /// Delivery attempts (successful or not) for one source message.
    pub async fn attempts(&self, channel: ChannelId, message: MessageId) -> u32 {
        self.state
            .lock()
            .await
            .attempts
            .get(&(channel, message))
            .copied()
            .unwrap_or(0)
    }

    /// Receive every future successful delivery.
    pub async fn watch(&self) -> mpsc::UnboundedReceiver<Delivered> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.watchers.push(tx);
        rx
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(
        &self,
        destination: ChannelId,
        message: &Message,
    ) -> Result<MessageId, DeliveryError> {
        let mut state = self.state.lock().await;
        let key = (message.channel_id, message.id);
        *state.attempts.entry(key).or_default() += 1;

        if let Some(err) = state.scripted.get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if let crate::message::MessageContent::Unsupported { description } = &message.content {
            return Err(DeliveryError::permanent(format!(
                "unsupported content: {description}"
            )));
        }

        let next = state.next_ids.entry(destination).or_insert(0);
        *next += 1;
        let destination_message_id = *next;

        let delivered = Delivered {
            destination,
            destination_message_id,
            message: message.clone(),
        };
        state
            .watchers
            .retain(|tx| tx.send(delivered.clone()).is_ok());
        state.delivered.push(delivered);
        Ok(destination_message_id)
    }
}
