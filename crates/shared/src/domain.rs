use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user identity. Stable across reconnects; the backend hands these
/// out as object-id strings and we never inspect them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Either a durable server-assigned id or a local temporary one.
///
/// Local ids are negative and strictly decreasing, so they can never collide
/// with anything the server assigns. A message keeps its `Local` id only
/// until reconciliation replaces it with the server counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Local(i64),
    Server(String),
}

impl MessageId {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }

    pub fn as_server(&self) -> Option<&str> {
        match self {
            MessageId::Server(id) if !id.is_empty() => Some(id),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Local(n) => write!(f, "{n}"),
            MessageId::Server(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Rank along the delivery ladder. `Pending` and `Failed` sit outside it
    /// and never advance via status events.
    fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sent => Some(0),
            MessageStatus::Delivered => Some(1),
            MessageStatus::Read => Some(2),
            MessageStatus::Pending | MessageStatus::Failed => None,
        }
    }

    /// Forward-only advancement: `sent -> delivered -> read`. A stale event
    /// (e.g. `delivered` after `read`) leaves the status untouched.
    pub fn advance(self, next: MessageStatus) -> MessageStatus {
        match (self.rank(), next.rank()) {
            (Some(current), Some(incoming)) if incoming > current => next,
            _ => self,
        }
    }
}

/// Attachment reference carried by a message: a resolved URL once the server
/// owns the payload, or the inline base64 form used before/while sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attachment {
    Url(String),
    Inline { content_type: String, data_b64: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// The other participant of the conversation this message belongs to.
    pub peer_id: PeerId,
    pub sender_id: PeerId,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSide {
    Me,
    Peer,
}

impl Message {
    /// A message must carry content; the engine rejects sends that don't.
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty()) || self.attachment.is_some()
    }

    /// Derived, never stored: which side of the conversation rendered this.
    pub fn sender_side(&self, local: &PeerId) -> SenderSide {
        if &self.sender_id == local {
            SenderSide::Me
        } else {
            SenderSide::Peer
        }
    }

    /// The rendered time bucket (`HH:MM`) used as the dedup fallback when a
    /// self-originated copy has no durable id yet. Two distinct messages with
    /// identical text in the same bucket collide; accepted ambiguity.
    pub fn time_bucket(&self) -> String {
        self.created_at.format("%H:%M").to_string()
    }
}

/// Contact or chat-list entry. `online` and `typing` are projections filled
/// in from the presence tracker at query time; they are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub peer_id: PeerId,
    pub display_name: String,
    pub avatar: String,
    pub last_message: String,
    pub online: bool,
    pub typing: bool,
}

/// Connection lifecycle, owned exclusively by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}
