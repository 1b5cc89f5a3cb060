use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, MessageKind, Profile, UnreadCounts};

/// Outcome field carried by request replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Presence state announced in `status_update` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// Envelopes sent FROM client TO server.
///
/// Every envelope is a flat JSON object whose `type` field selects the
/// variant. Required string fields default to empty so that a missing field
/// reaches the router as a validation error instead of a decode failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Create an account
    Register {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
        display_name: Option<String>,
        profile_image: Option<String>,
        additional_image: Option<String>,
    },

    /// Authenticate this connection
    Login {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },

    /// Send a one-to-one message. `message_type` stays a raw string here so
    /// that an unsupported kind is answered rather than dropped.
    Message {
        sender: Option<String>,
        #[serde(default)]
        receiver: String,
        message_type: Option<String>,
        #[serde(default)]
        content: String,
    },

    /// Partially update the caller's profile. Absent fields are left alone.
    ProfileUpdate {
        username: Option<String>,
        display_name: Option<String>,
        status_message: Option<String>,
        #[serde(alias = "profile_image")]
        profile_picture: Option<String>,
        additional_image: Option<String>,
        current_theme: Option<String>,
    },

    /// Fetch a single user's profile
    ProfileRequest {
        #[serde(default)]
        requested_username: String,
    },

    /// Replace the caller's unread counters
    SaveUnread {
        username: Option<String>,
        #[serde(default)]
        unread_messages: UnreadCounts,
    },

    /// Fetch the conversation between the caller and `peer`
    HistoryRequest {
        #[serde(default)]
        peer: String,
    },

    /// Any other `type`; ignored by the router
    #[serde(other)]
    Unknown,
}

impl ClientCommand {
    /// Wire name of the envelope type, used in logs and error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Login { .. } => "login",
            Self::Message { .. } => "message",
            Self::ProfileUpdate { .. } => "profile_update",
            Self::ProfileRequest { .. } => "profile_request",
            Self::SaveUnread { .. } => "save_unread",
            Self::HistoryRequest { .. } => "history_request",
            Self::Unknown => "unknown",
        }
    }
}

/// Envelopes sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to `register`
    Register {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Reply to `login`. The collections are only present on success.
    Login {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contacts: Option<Vec<Profile>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_history: Option<Vec<ChatMessage>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unread_messages: Option<UnreadCounts>,
    },

    /// A message relayed to its live receiver
    Message {
        sender: String,
        receiver: String,
        message_type: MessageKind,
        content: String,
        timestamp: DateTime<Utc>,
    },

    /// A user came online or went offline
    StatusUpdate { username: String, status: Presence },

    /// Another user changed their profile
    ProfileUpdate { username: String, profile: Profile },

    /// Reply to `profile_update`
    ProfileUpdateResult {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Reply to `profile_request`
    ProfileData { profile: Profile },

    /// Reply to `history_request`
    History {
        peer: String,
        messages: Vec<ChatMessage>,
    },

    /// A request that has no dedicated reply type failed
    Error { request: String, message: String },
}

impl ServerEvent {
    pub fn register_ok() -> Self {
        Self::Register {
            status: Status::Success,
            message: None,
        }
    }

    pub fn register_failed(message: impl Into<String>) -> Self {
        Self::Register {
            status: Status::Error,
            message: Some(message.into()),
        }
    }

    pub fn login_failed(message: impl Into<String>) -> Self {
        Self::Login {
            status: Status::Error,
            message: Some(message.into()),
            contacts: None,
            chat_history: None,
            unread_messages: None,
        }
    }

    pub fn presence(username: impl Into<String>, status: Presence) -> Self {
        Self::StatusUpdate {
            username: username.into(),
            status,
        }
    }
}

impl From<ChatMessage> for ServerEvent {
    fn from(msg: ChatMessage) -> Self {
        Self::Message {
            sender: msg.sender,
            receiver: msg.receiver,
            message_type: msg.message_type,
            content: msg.content,
            timestamp: msg.timestamp,
        }
    }
}
