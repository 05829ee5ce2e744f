//! Typed inbound WeChat messages and events.

pub mod parse;
pub mod xml;

pub use parse::{parse_message, ParseError};

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// `MsgType` of an inbound push.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    Video,
    ShortVideo,
    Location,
    Link,
    Event,
    Other(String),
}

impl MessageKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Self::Text,
            "image" => Self::Image,
            "voice" => Self::Voice,
            "video" => Self::Video,
            "shortvideo" => Self::ShortVideo,
            "location" => Self::Location,
            "link" => Self::Link,
            "event" => Self::Event,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::ShortVideo => "shortvideo",
            Self::Location => "location",
            Self::Link => "link",
            Self::Event => "event",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Cow::<str>::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// `Event` value of an event push. Names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Subscribe,
    /// `subscribe` carrying a `qrscene_` event key.
    SubscribeScan,
    Unsubscribe,
    Scan,
    Click,
    View,
    Location,
    Other(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "subscribe" => Self::Subscribe,
            "subscribe_scan" => Self::SubscribeScan,
            "unsubscribe" => Self::Unsubscribe,
            "scan" => Self::Scan,
            "click" => Self::Click,
            "view" => Self::View,
            "location" => Self::Location,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribe => "subscribe",
            Self::SubscribeScan => "subscribe_scan",
            Self::Unsubscribe => "unsubscribe",
            Self::Scan => "scan",
            Self::Click => "click",
            Self::View => "view",
            Self::Location => "location",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Cow::<str>::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub key: Option<String>,
    pub ticket: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub precision: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text {
        content: String,
    },
    Image {
        media_id: String,
        pic_url: Option<String>,
    },
    Voice {
        media_id: String,
        format: Option<String>,
        recognition: Option<String>,
    },
    Video {
        media_id: String,
        thumb_media_id: Option<String>,
    },
    ShortVideo {
        media_id: String,
        thumb_media_id: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        scale: Option<u32>,
        label: Option<String>,
    },
    Link {
        title: String,
        description: Option<String>,
        url: String,
    },
    Event(Event),
    /// A push of a kind we do not model. The kind is kept for rule matching.
    Unknown {
        kind: MessageKind,
    },
}

/// One parsed push. Constructed per request, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: Option<String>,
    /// Sender openid (`FromUserName`).
    pub source: String,
    /// Official account id (`ToUserName`).
    pub target: String,
    pub create_time: i64,
    pub body: MessageBody,
    /// Plaintext XML the message was parsed from.
    pub raw: String,
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match &self.body {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Image { .. } => MessageKind::Image,
            MessageBody::Voice { .. } => MessageKind::Voice,
            MessageBody::Video { .. } => MessageKind::Video,
            MessageBody::ShortVideo { .. } => MessageKind::ShortVideo,
            MessageBody::Location { .. } => MessageKind::Location,
            MessageBody::Link { .. } => MessageKind::Link,
            MessageBody::Event(_) => MessageKind::Event,
            MessageBody::Unknown { kind } => kind.clone(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text { content } => Some(content),
            _ => None,
        }
    }

    pub fn event(&self) -> Option<&Event> {
        match &self.body {
            MessageBody::Event(event) => Some(event),
            _ => None,
        }
    }
}
