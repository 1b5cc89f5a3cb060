use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of payload carried by a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    /// `content` is base64-encoded image bytes.
    Image,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            _ => None,
        }
    }
}

/// A user's public profile as sent to clients.
///
/// Image fields are base64 strings. In contact lists they may be downscaled
/// copies of the stored originals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    pub display_name: String,
    pub status_message: String,
    pub profile_image: Option<String>,
    pub additional_image: Option<String>,
    pub current_theme: Option<String>,
    /// `None` while the user is online.
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub online: bool,
}

/// One entry of the append-only chat log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub receiver: String,
    pub message_type: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Unread counts per peer, keyed by the peer's username.
pub type UnreadCounts = HashMap<String, u32>;
