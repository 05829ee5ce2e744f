//! Reply definitions and their two wire shapes: passive XML responses and
//! customer-service direct messages.

pub mod render;
pub mod send;

pub use render::{parse_reply_xml, render_xml};
pub use send::direct_message_payload;

use serde::{Deserialize, Serialize};

/// The platform renders at most this many articles in one news reply.
pub const MAX_NEWS_ARTICLES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "image")]
    pub pic_url: String,
    pub url: String,
}

/// A concrete reply addressed back to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Text {
        content: String,
    },
    Image {
        media_id: String,
    },
    Voice {
        media_id: String,
    },
    Video {
        media_id: String,
        title: Option<String>,
        description: Option<String>,
    },
    Music {
        thumb_media_id: String,
        title: Option<String>,
        description: Option<String>,
        music_url: Option<String>,
        hq_music_url: Option<String>,
    },
    News {
        articles: Vec<Article>,
    },
}

impl ReplyBody {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Voice { .. } => "voice",
            Self::Video { .. } => "video",
            Self::Music { .. } => "music",
            Self::News { .. } => "news",
        }
    }

    /// A text reply with no content is treated the same as no reply.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text { content } => content.is_empty(),
            Self::News { articles } => articles.is_empty(),
            _ => false,
        }
    }
}

/// One configured reply of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Message(ReplyBody),
    /// POST the raw message to `url` and relay its response verbatim.
    Forward { url: String },
    /// Invoke a registered program by name.
    Custom { program: String },
}

impl Reply {
    pub fn kind(&self) -> &str {
        match self {
            Self::Message(body) => body.msg_type(),
            Self::Forward { .. } => "forward",
            Self::Custom { .. } => "custom",
        }
    }
}
