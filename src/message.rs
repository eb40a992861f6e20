//! Shared message types for both ingestion paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider-native channel identifier.
pub type ChannelId = i64;

/// Provider-native message identifier, increasing within a channel.
pub type MessageId = i64;

/// Identity of whoever issued an administrative command.
pub type ActorId = i64;

/// A source → destination channel pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub source: ChannelId,
    pub destination: ChannelId,
}

impl Route {
    pub fn new(source: ChannelId, destination: ChannelId) -> Self {
        Self {
            source,
            destination,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.source, self.destination)
    }
}

/// A message observed on a source channel, from either the live stream or
/// a history page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sent_at: DateTime<Utc>,
    pub content: MessageContent,
}

impl Message {
    pub fn new(channel_id: ChannelId, id: MessageId, content: MessageContent) -> Self {
        Self {
            id,
            channel_id,
            sent_at: Utc::now(),
            content,
        }
    }

    /// Shorthand for a plain text message.
    pub fn text(channel_id: ChannelId, id: MessageId, text: impl Into<String>) -> Self {
        Self::new(
            channel_id,
            id,
            MessageContent::Text {
                text: text.into(),
                parse_mode: None,
            },
        )
    }

    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = sent_at;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }

    /// The text body, for text messages only.
    pub fn text_content(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Message payload, one variant per media type the relay knows how to send.
///
/// Media variants carry the provider's file reference so the sink can
/// re-send without downloading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parse_mode: Option<String>,
    },
    Photo {
        file_id: String,
        caption: Option<String>,
    },
    Video {
        file_id: String,
        caption: Option<String>,
    },
    Animation {
        file_id: String,
        caption: Option<String>,
    },
    Document {
        file_id: String,
        caption: Option<String>,
    },
    Audio {
        file_id: String,
        caption: Option<String>,
    },
    Voice {
        file_id: String,
        caption: Option<String>,
    },
    Sticker {
        file_id: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    Contact {
        phone_number: String,
        first_name: String,
        last_name: Option<String>,
    },
    Poll {
        question: String,
        options: Vec<String>,
        is_anonymous: bool,
    },
    /// Anything the relay cannot reproduce. Sinks reject it permanently.
    Unsupported { description: String },
}

impl MessageContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Photo { .. } => MessageKind::Photo,
            Self::Video { .. } => MessageKind::Video,
            Self::Animation { .. } => MessageKind::Animation,
            Self::Document { .. } => MessageKind::Document,
            Self::Audio { .. } => MessageKind::Audio,
            Self::Voice { .. } => MessageKind::Voice,
            Self::Sticker { .. } => MessageKind::Sticker,
            Self::Location { .. } => MessageKind::Location,
            Self::Contact { .. } => MessageKind::Contact,
            Self::Poll { .. } => MessageKind::Poll,
            Self::Unsupported { .. } => MessageKind::Unsupported,
        }
    }
}

/// Discriminant of [`MessageContent`], stored with each forwarded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Photo,
    Video,
    Animation,
    Document,
    Audio,
    Voice,
    Sticker,
    Location,
    Contact,
    Poll,
    Unsupported,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Animation => "animation",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Sticker => "sticker",
            Self::Location => "location",
            Self::Contact => "contact",
            Self::Poll => "poll",
            Self::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "text" => Self::Text,
            "photo" => Self::Photo,
            "video" => Self::Video,
            "animation" => Self::Animation,
            "document" => Self::Document,
            "audio" => Self::Audio,
            "voice" => Self::Voice,
            "sticker" => Self::Sticker,
            "location" => Self::Location,
            "contact" => Self::Contact,
            "poll" => Self::Poll,
            "unsupported" => Self::Unsupported,
            other => return Err(format!("unknown message kind: {other}")),
        })
    }
}
