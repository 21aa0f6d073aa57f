use serde::{Deserialize, Serialize};

use crate::domain::MessageStatus;

/// Message payload carried on the live transport's best-effort send path.
///
/// Mirrors what the rendering layer would have POSTed: the optional `image`
/// is the inline base64 data URL, never a multipart reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "_id")]
    pub id: Option<String>,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

/// Frames emitted by the client. Event names are the backend's socket
/// vocabulary; `data` carries the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Joins a room. The handshake joins the local identity's own room;
    /// selecting a conversation joins the peer's room.
    Join {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Leave {
        #[serde(rename = "userId")]
        user_id: String,
    },
    UserOnline {
        #[serde(rename = "userId")]
        user_id: String,
    },
    SendMessage(WireMessage),
    Typing {
        #[serde(rename = "recipientId")]
        recipient_id: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    StopTyping {
        #[serde(rename = "recipientId")]
        recipient_id: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    MessageDelivered {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    MessageRead {
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

impl ClientFrame {
    pub fn encode(&self) -> String {
        // Only fails on non-string map keys, which these frames never carry.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frames received from the server. Inbound message bodies stay raw JSON
/// here; the wire normalization boundary turns them into canonical
/// `Message` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Authoritative snapshot replacing the whole online set.
    OnlineUsers(Vec<String>),
    UserOnline {
        #[serde(rename = "userId")]
        user_id: String,
    },
    UserOffline {
        #[serde(rename = "userId")]
        user_id: String,
    },
    UserTyping {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    NewMessage(serde_json::Value),
    MessageStatus {
        #[serde(rename = "messageId")]
        message_id: String,
        status: MessageStatus,
    },
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
