//! Provider seams: where messages come from and where they go.

pub mod memory;
pub mod telegram;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::oneshot;

use crate::error::{DeliveryError, SourceError};
use crate::message::{ChannelId, Message, MessageId};

pub use memory::{MemorySink, MemorySource};
pub use telegram::TelegramChannel;

/// Live messages for one source channel, in arrival order.
pub type MessageStream = Pin<Box<dyn Stream<Item = Incoming> + Send>>;

/// A live message handed to a subscriber.
///
/// The source treats the message as handled only once [`ack`](Self::ack)
/// is called. A message dropped unacknowledged is offered again to the next
/// subscription, so a crash mid-backlog loses nothing.
#[derive(Debug)]
pub struct Incoming {
    pub message: Message,
    ack: oneshot::Sender<()>,
}

impl Incoming {
    /// Wrap `message`. The receiver resolves on [`ack`](Self::ack) and
    /// fails if the message is dropped unhandled.
    pub fn new(message: Message) -> (Self, oneshot::Receiver<()>) {
        let (ack, acked) = oneshot::channel();
        (Self { message, ack }, acked)
    }

    pub fn ack(self) {
        let _ = self.ack.send(());
    }
}

/// One page of channel history, oldest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    /// Whether newer history beyond this page's last id remains to be fetched.
    pub has_more: bool,
}

/// Where messages are observed.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Subscribe to live messages posted to `channel`. Messages not yet
    /// acknowledged by an earlier subscriber are delivered first.
    async fn subscribe(&self, channel: ChannelId) -> Result<MessageStream, SourceError>;

    /// Whether [`fetch_history`](Self::fetch_history) is available.
    fn supports_history(&self) -> bool;

    /// Fetch up to `page_size` messages with ids strictly greater than
    /// `after` (or from the beginning when `None`), ascending by id.
    async fn fetch_history(
        &self,
        channel: ChannelId,
        after: Option<MessageId>,
        page_size: usize,
    ) -> Result<HistoryPage, SourceError>;
}

/// Where messages are delivered.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Send `message` to `destination`. Returns the destination message id.
    async fn deliver(
        &self,
        destination: ChannelId,
        message: &Message,
    ) -> Result<MessageId, DeliveryError>;
}
