//! Tolerant conversion of backend message payloads into [`Event`].
//!
//! The backend only guarantees a topic identifier; every other attribute may
//! live under one of several aliases. Each field is resolved by trying its
//! alias list in order and keeping the first non-empty value.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use shared::domain::{Event, EventId, Role, SenderIdentity, TopicId};

const EVENT_ID_KEYS: &[&str] = &[
    "eventId",
    "event_id",
    "messageId",
    "message_id",
    "id",
    "_id",
    "message.id",
];

const TOPIC_ID_KEYS: &[&str] = &[
    "topicId",
    "topic_id",
    "chatId",
    "chat_id",
    "conversationId",
    "conversation_id",
    "channelId",
    "channel_id",
    "topic.id",
    "chat.id",
    "message.chatId",
];

const DISPLAY_NAME_KEYS: &[&str] = &[
    "senderDisplayName",
    "sender_display_name",
    "senderName",
    "sender_name",
    "sender.displayName",
    "sender.display_name",
    "sender.name",
    "authorName",
    "author.name",
    "user.name",
    "from.name",
];

const EMAIL_KEYS: &[&str] = &[
    "senderEmail",
    "sender_email",
    "sender.email",
    "author.email",
    "user.email",
    "from.email",
];

const PARTICIPANT_KEYS: &[&str] = &[
    "senderParticipantId",
    "sender_participant_id",
    "participantId",
    "participant_id",
    "sender.participantId",
    "sender.participant_id",
    "sender.id",
    "senderId",
    "sender_id",
];

const ROLE_KEYS: &[&str] = &[
    "senderRole",
    "sender_role",
    "sender.role",
    "author.role",
    "senderType",
    "sender_type",
    "role",
];

const CODE_KEYS: &[&str] = &[
    "senderCode",
    "sender_code",
    "sender.code",
    "sender.teamCode",
    "teamCode",
    "team_code",
];

const BODY_KEYS: &[&str] = &["body", "text", "content", "message.text", "message"];

const TIMESTAMP_KEYS: &[&str] = &[
    "arrivedAt",
    "arrived_at",
    "createdAt",
    "created_at",
    "sentAt",
    "sent_at",
    "timestamp",
    "ts",
];

/// Builds an [`Event`] from a raw payload, or `None` when no topic can be
/// attributed.
///
/// `received_at` is used when the payload carries no timestamp and `sequence`
/// is the per-connection arrival position, used in the synthesized id only
/// when neither an id nor a server timestamp is present.
pub fn normalize_event(raw: &Value, received_at: DateTime<Utc>, sequence: u64) -> Option<Event> {
    let topic_id = TopicId(first_string(raw, TOPIC_ID_KEYS)?);

    let sender_display_name = first_string(raw, DISPLAY_NAME_KEYS);
    let sender = SenderIdentity {
        role: first_string(raw, ROLE_KEYS).and_then(|role| Role::parse(&role)),
        code: first_string(raw, CODE_KEYS),
        participant_id: first_string(raw, PARTICIPANT_KEYS),
        email: first_string(raw, EMAIL_KEYS),
    };

    let server_timestamp = TIMESTAMP_KEYS
        .iter()
        .find_map(|key| lookup(raw, key).and_then(parse_timestamp));
    let arrived_at = server_timestamp.unwrap_or(received_at);

    let (event_id, synthesized_id) = match first_string(raw, EVENT_ID_KEYS) {
        Some(id) => (EventId(id), false),
        None => (
            synthesize_event_id(
                &topic_id,
                server_timestamp,
                &sender,
                sender_display_name.as_deref(),
                sequence,
            ),
            true,
        ),
    };

    let body = BODY_KEYS
        .iter()
        .find_map(|key| lookup(raw, key).filter(|value| !value.is_null()))
        .cloned()
        .unwrap_or(Value::Null);

    Some(Event {
        event_id,
        synthesized_id,
        topic_id,
        sender,
        sender_display_name,
        body,
        arrived_at,
    })
}

/// Composite dedup key for payloads without an id.
///
/// Replays of the same message carry the same server timestamp, so the key
/// stays stable across reconnects; the sender signal narrows collisions
/// between distinct messages sharing a millisecond.
fn synthesize_event_id(
    topic_id: &TopicId,
    server_timestamp: Option<DateTime<Utc>>,
    sender: &SenderIdentity,
    display_name: Option<&str>,
    sequence: u64,
) -> EventId {
    match server_timestamp {
        Some(timestamp) => {
            let who = sender
                .participant_id
                .as_deref()
                .or(sender.email.as_deref())
                .or(display_name)
                .unwrap_or("-");
            EventId(format!(
                "{topic_id}@{}:{who}",
                timestamp.timestamp_millis()
            ))
        }
        None => EventId(format!("{topic_id}#{sequence}")),
    }
}

fn lookup<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(raw, |current, segment| current.as_object()?.get(segment))
}

fn first_string(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match lookup(raw, key)? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
            .or_else(|| text.trim().parse::<i64>().ok().and_then(from_epoch)),
        Value::Number(number) => number.as_i64().and_then(from_epoch),
        _ => None,
    }
}

/// Epoch values above ~1973 in milliseconds are treated as milliseconds.
fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

#[cfg(test)]
#[path = "tests/normalize_tests.rs"]
mod tests;
