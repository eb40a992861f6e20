//! Telegram channel: long-polls the Bot API for updates and re-sends
//! messages by `file_id`.
//!
//! One `getUpdates` loop serves every subscribed channel; updates are
//! demultiplexed by chat id. The poll offset moves past an update only
//! after every subscriber has acknowledged it, so updates still queued in
//! the relay are fetched again after a restart. The Bot API cannot read
//! channel history, so this source reports `supports_history() == false`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::channels::{HistoryPage, Incoming, MessageStream, Sink, Source};
use crate::error::{DeliveryError, SourceError};
use crate::message::{ChannelId, Message, MessageContent, MessageId};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to `getUpdates`, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Pause before fetching again an update a subscriber dropped unhandled.
const REDELIVERY_DELAY: Duration = Duration::from_secs(1);

type Subscribers = Arc<Mutex<HashMap<ChannelId, Vec<mpsc::Sender<Incoming>>>>>;

/// Telegram Bot API source and sink over long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
    subscribers: Subscribers,
    poller_started: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self::with_api_base(bot_token, DEFAULT_API_BASE)
    }

    /// Point at a different Bot API server (self-hosted or a test double).
    pub fn with_api_base(bot_token: SecretString, api_base: impl Into<String>) -> Self {
        Self {
            bot_token,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            poller_started: AtomicBool::new(false),
            poller: Mutex::new(None),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Verify the token with `getMe`.
    pub async fn health_check(&self) -> Result<(), SourceError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| SourceError::Unavailable {
                channel: 0,
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SourceError::Unavailable {
                channel: 0,
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    /// Stop the update poller. Subscriber streams end.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.poller.lock().await.take() {
            handle.abort();
        }
        self.subscribers.lock().await.clear();
        tracing::info!("Telegram channel shut down");
    }

    async fn ensure_poller(&self) {
        if self.poller_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.client.clone();
        let url = self.api_url("getUpdates");
        let subscribers = Arc::clone(&self.subscribers);
        let handle = tokio::spawn(poll_updates(client, url, subscribers));
        *self.poller.lock().await = Some(handle);
    }
}

/// The single `getUpdates` loop.
async fn poll_updates(client: reqwest::Client, url: String, subscribers: Subscribers) {
    let mut offset: i64 = 0;
    tracing::info!("Telegram poller listening for channel posts");

    loop {
        let body = json!({
            "offset": offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["channel_post", "message"],
        });

        let resp = match client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Telegram poll error");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let data: Value = match resp.json().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "Telegram parse error");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let Some(results) = data.get("result").and_then(Value::as_array) else {
            tracing::warn!(response = %data, "Telegram getUpdates returned no result");
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        };

        for update in results {
            let Some(uid) = update.get("update_id").and_then(Value::as_i64) else {
                continue;
            };
            if let Some(message) = parse_update(update)
                && !dispatch(&subscribers, message).await
            {
                // Leave the offset at this update so it is fetched again.
                tracing::debug!(update_id = uid, "Update not acknowledged, refetching");
                tokio::time::sleep(REDELIVERY_DELAY).await;
                break;
            }
            offset = uid + 1;
        }
    }
}

/// Hand `message` to every subscriber of its chat and wait for each to
/// acknowledge it. Returns false if a subscriber dropped it unhandled.
///
/// Closed subscribers are pruned. A chat without subscribers counts as
/// handled.
async fn dispatch(subscribers: &Subscribers, message: Message) -> bool {
    let senders = {
        let mut subs = subscribers.lock().await;
        let Some(senders) = subs.get_mut(&message.channel_id) else {
            tracing::trace!(channel = message.channel_id, "Update for unrouted chat");
            return true;
        };
        senders.retain(|tx| !tx.is_closed());
        senders.clone()
    };

    let mut handled = true;
    for tx in senders {
        let (incoming, acked) = Incoming::new(message.clone());
        if tx.send(incoming).await.is_err() {
            continue;
        }
        if acked.await.is_err() {
            handled = false;
        }
    }
    handled
}

// ── Update parsing ──────────────────────────────────────────────────

/// Turn a Bot API update into a [`Message`]. Channel posts and group
/// messages are both accepted; edits and service updates are ignored.
pub fn parse_update(update: &Value) -> Option<Message> {
    let post = update
        .get("channel_post")
        .or_else(|| update.get("message"))?;

    let id = post.get("message_id").and_then(Value::as_i64)?;
    let channel_id = post
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;
    let sent_at = post
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    Some(Message::new(channel_id, id, parse_content(post)).with_sent_at(sent_at))
}

fn parse_content(post: &Value) -> MessageContent {
    let caption = post
        .get("caption")
        .and_then(Value::as_str)
        .map(String::from);
    let file_id = |key: &str| {
        post.get(key)
            .and_then(|v| v.get("file_id"))
            .and_then(Value::as_str)
            .map(String::from)
    };

    if let Some(text) = post.get("text").and_then(Value::as_str) {
        return MessageContent::Text {
            text: text.to_string(),
            parse_mode: None,
        };
    }
    // Photos arrive as several sizes; the last is the largest.
    if let Some(file_id) = post
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| sizes.last())
        .and_then(|p| p.get("file_id"))
        .and_then(Value::as_str)
    {
        return MessageContent::Photo {
            file_id: file_id.to_string(),
            caption,
        };
    }
    // Animations also carry a `document` field, so check them first.
    if let Some(file_id) = file_id("animation") {
        return MessageContent::Animation { file_id, caption };
    }
    if let Some(file_id) = file_id("video") {
        return MessageContent::Video { file_id, caption };
    }
    if let Some(file_id) = file_id("document") {
        return MessageContent::Document { file_id, caption };
    }
    if let Some(file_id) = file_id("audio") {
        return MessageContent::Audio { file_id, caption };
    }
    if let Some(file_id) = file_id("voice") {
        return MessageContent::Voice { file_id, caption };
    }
    if let Some(file_id) = file_id("sticker") {
        return MessageContent::Sticker { file_id };
    }
    if let Some(loc) = post.get("location") {
        let latitude = loc.get("latitude").and_then(Value::as_f64);
        let longitude = loc.get("longitude").and_then(Value::as_f64);
        if let (Some(latitude), Some(longitude)) = (latitude, longitude) {
            return MessageContent::Location {
                latitude,
                longitude,
            };
        }
    }
    if let Some(contact) = post.get("contact") {
        let phone = contact.get("phone_number").and_then(Value::as_str);
        let first = contact.get("first_name").and_then(Value::as_str);
        if let (Some(phone), Some(first)) = (phone, first) {
            return MessageContent::Contact {
                phone_number: phone.to_string(),
                first_name: first.to_string(),
                last_name: contact
                    .get("last_name")
                    .and_then(Value::as_str)
                    .map(String::from),
            };
        }
    }
    if let Some(poll) = post.get("poll")
        && let Some(question) = poll.get("question").and_then(Value::as_str)
    {
        let options = poll
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .filter_map(|o| o.get("text").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        return MessageContent::Poll {
            question: question.to_string(),
            options,
            is_anonymous: poll
                .get("is_anonymous")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        };
    }

    let description = post
        .as_object()
        .map(|o| {
            o.keys()
                .filter(|k| !matches!(k.as_str(), "message_id" | "chat" | "date" | "sender_chat" | "from"))
                .cloned()
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    MessageContent::Unsupported { description }
}

// ── Delivery ────────────────────────────────────────────────────────

/// Bot API method and JSON body for re-sending `content` to `chat_id`.
pub fn build_request(
    chat_id: ChannelId,
    content: &MessageContent,
) -> Result<(&'static str, Value), DeliveryError> {
    fn media(chat_id: ChannelId, field: &str, file_id: &str, caption: &Option<String>) -> Value {
        let mut body = json!({ "chat_id": chat_id, field: file_id });
        if let Some(caption) = caption {
            body["caption"] = json!(caption);
        }
        body
    }

    let request = match content {
        MessageContent::Text { text, parse_mode } => {
            let mut body = json!({ "chat_id": chat_id, "text": text });
            if let Some(mode) = parse_mode {
                body["parse_mode"] = json!(mode);
            }
            ("sendMessage", body)
        }
        MessageContent::Photo { file_id, caption } => {
            ("sendPhoto", media(chat_id, "photo", file_id, caption))
        }
        MessageContent::Video { file_id, caption } => {
            ("sendVideo", media(chat_id, "video", file_id, caption))
        }
        MessageContent::Animation { file_id, caption } => {
            ("sendAnimation", media(chat_id, "animation", file_id, caption))
        }
        MessageContent::Document { file_id, caption } => {
            ("sendDocument", media(chat_id, "document", file_id, caption))
        }
        MessageContent::Audio { file_id, caption } => {
            ("sendAudio", media(chat_id, "audio", file_id, caption))
        }
        MessageContent::Voice { file_id, caption } => {
            ("sendVoice", media(chat_id, "voice", file_id, caption))
        }
        MessageContent::Sticker { file_id } => (
            "sendSticker",
            json!({ "chat_id": chat_id, "sticker": file_id }),
        ),
        MessageContent::Location {
            latitude,
            longitude,
        } => (
            "sendLocation",
            json!({ "chat_id": chat_id, "latitude": latitude, "longitude": longitude }),
        ),
        MessageContent::Contact {
            phone_number,
            first_name,
            last_name,
        } => {
            let mut body = json!({
                "chat_id": chat_id,
                "phone_number": phone_number,
                "first_name": first_name,
            });
            if let Some(last) = last_name {
                body["last_name"] = json!(last);
            }
            ("sendContact", body)
        }
        MessageContent::Poll {
            question,
            options,
            is_anonymous,
        } => (
            "sendPoll",
            json!({
                "chat_id": chat_id,
                "question": question,
                "options": options.iter().map(|o| json!({ "text": o })).collect::<Vec<_>>(),
                "is_anonymous": is_anonymous,
            }),
        ),
        MessageContent::Unsupported { description } => {
            return Err(DeliveryError::permanent(format!(
                "cannot relay unsupported content ({description})"
            )));
        }
    };
    Ok(request)
}

/// Map a Bot API response to a destination message id or a delivery error.
///
/// 429 and 5xx are transient; every other failure is permanent.
pub fn classify_response(status: u16, body: &Value) -> Result<MessageId, DeliveryError> {
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description")
        .to_string();

    if (200..300).contains(&status) && body.get("ok").and_then(Value::as_bool) == Some(true) {
        return body
            .get("result")
            .and_then(|r| r.get("message_id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| DeliveryError::permanent("response carried no message_id"));
    }

    if status == 429 || status >= 500 {
        let retry_after = body
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        return Err(DeliveryError::Transient {
            reason: format!("HTTP {status}: {description}"),
            retry_after,
        });
    }

    Err(DeliveryError::permanent(format!(
        "HTTP {status}: {description}"
    )))
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl Source for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn subscribe(&self, channel: ChannelId) -> Result<MessageStream, SourceError> {
        // Capacity 1: the poller stays at most one update ahead of the relay.
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .lock()
            .await
            .entry(channel)
            .or_default()
            .push(tx);
        self.ensure_poller().await;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn supports_history(&self) -> bool {
        false
    }

    async fn fetch_history(
        &self,
        _channel: ChannelId,
        _after: Option<MessageId>,
        _page_size: usize,
    ) -> Result<HistoryPage, SourceError> {
        Err(SourceError::Unsupported {
            operation: "fetch_history via the Bot API".into(),
        })
    }
}

#[async_trait]
impl Sink for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(
        &self,
        destination: ChannelId,
        message: &Message,
    ) -> Result<MessageId, DeliveryError> {
        let (method, body) = build_request(destination, &message.content)?;

        let resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::transient(format!("{method}: {e}")))?;

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        classify_response(status, &body)
    }
}
