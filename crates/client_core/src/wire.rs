//! The single normalization boundary between heterogeneous backend payload
//! shapes and the canonical domain entities. Field-name fallbacks live here
//! and nowhere else.

use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::domain::{Attachment, ConversationSummary, Message, MessageId, MessageStatus, PeerId};

/// Maps a raw message payload (history entry, send response, or live frame)
/// to the canonical `Message`. Returns `None` when the payload carries no
/// usable content at all; missing individual fields degrade instead of
/// failing.
pub fn normalize_message(raw: &Value, local: &PeerId, media_origin: &str) -> Option<Message> {
    let text = string_at(raw, &["text", "message"]).unwrap_or_default();
    let image = string_at(raw, &["image", "imageUrl", "fileUrl", "url", "file"])
        .map(|img| normalize_image_url(&img, media_origin));

    if text.is_empty() && image.is_none() {
        return None;
    }

    let sender_id = PeerId::new(string_at(raw, &["senderId", "sender", "from"]).unwrap_or_default());
    let recipient_id =
        PeerId::new(string_at(raw, &["recipientId", "receiverId", "to"]).unwrap_or_default());
    // The conversation is keyed by the *other* participant.
    let peer_id = if sender_id == *local {
        recipient_id
    } else {
        sender_id.clone()
    };

    let status = raw
        .get("status")
        .and_then(|v| serde_json::from_value::<MessageStatus>(v.clone()).ok())
        .unwrap_or(MessageStatus::Sent);

    Some(Message {
        id: MessageId::Server(string_at(raw, &["_id", "id"]).unwrap_or_default()),
        peer_id,
        sender_id,
        text: (!text.is_empty()).then_some(text),
        attachment: image.map(Attachment::Url),
        created_at: timestamp_at(raw, "createdAt"),
        status,
    })
}

/// Maps a raw contact or chat-partner entry to a `ConversationSummary`.
/// The `online`/`typing` projections are left false; the engine fills them
/// from the presence tracker at query time.
pub fn normalize_summary(raw: &Value) -> Option<ConversationSummary> {
    let peer_id = string_at(raw, &["_id", "id", "email"])?;
    let display_name = string_at(raw, &["fullName", "name", "participantName", "email"])
        .unwrap_or_else(|| "Unknown".to_string());
    let last_message = string_at(raw, &["lastMessage"])
        .or_else(|| string_at(raw.get("last")?, &["text"]))
        .unwrap_or_default();
    Some(ConversationSummary {
        peer_id: PeerId::new(peer_id),
        display_name,
        avatar: string_at(raw, &["profilePic", "avatar"]).unwrap_or_default(),
        last_message,
        online: false,
        typing: false,
    })
}

/// Uniform image reference resolution for history and live messages alike:
/// absolute URLs pass through, a leading path separator gets the media
/// origin prefixed, anything else is treated as already resolved.
pub fn normalize_image_url(reference: &str, media_origin: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        reference.to_string()
    } else if reference.starts_with('/') {
        format!("{media_origin}{reference}")
    } else {
        reference.to_string()
    }
}

/// History responses are usually a bare array, but some backends wrap them
/// in a `messages` field.
pub fn history_entries(raw: &Value) -> Vec<Value> {
    if let Some(entries) = raw.as_array() {
        return entries.clone();
    }
    raw.get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn string_at(raw: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match raw.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn timestamp_at(raw: &Value, key: &str) -> DateTime<Utc> {
    match raw.get(key) {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

#[cfg(test)]
#[path = "tests/wire_tests.rs"]
mod tests;
