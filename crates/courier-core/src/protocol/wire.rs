//! Socket Wire Format and Payload Normalization
//!
//! The server speaks named JSON events over a text socket. Payloads are
//! loosely typed (`_id` or `id`, senders as objects or bare ids, timestamps as
//! epoch numbers or RFC 3339 strings). Everything is normalized here into the
//! strict shapes the store works with; nothing loosely typed crosses into the
//! core.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::WireError;
use crate::protocol::conversation_index::ConversationRecord;
use crate::protocol::message::{
    ConfirmedMessage, DeliveryState, LastMessage, MessageContent, ReadMark, ReadReceipt,
};
use crate::types::{ConversationId, CorrelationId, MessageId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const EVENT_JOIN_ROOM: &str = "join-room";
pub const EVENT_LEAVE_ROOM: &str = "leave-room";
pub const EVENT_SEND_MESSAGE: &str = "send-message";
pub const EVENT_MARK_READ: &str = "mark-read";
pub const EVENT_PRESENCE: &str = "presence";

pub const EVENT_NEW_MESSAGE: &str = "new-message";
pub const EVENT_MESSAGE_READ: &str = "message-read";
pub const EVENT_MESSAGE_DELIVERED: &str = "message-delivered";
pub const EVENT_USER_ONLINE: &str = "user-online";
pub const EVENT_USER_OFFLINE: &str = "user-offline";

/// Epoch values below this are taken to be seconds rather than milliseconds
const SECONDS_EPOCH_CEILING: u64 = 1_000_000_000_000;

// ----------------------------------------------------------------------------
// Outbound Events
// ----------------------------------------------------------------------------

/// Client → server events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutboundEvent {
    JoinRoom {
        conversation_id: ConversationId,
    },
    LeaveRoom {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
        content: MessageContent,
        metadata: Option<Value>,
    },
    MarkRead {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    Presence {
        is_online: bool,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinRoom { .. } => EVENT_JOIN_ROOM,
            OutboundEvent::LeaveRoom { .. } => EVENT_LEAVE_ROOM,
            OutboundEvent::SendMessage { .. } => EVENT_SEND_MESSAGE,
            OutboundEvent::MarkRead { .. } => EVENT_MARK_READ,
            OutboundEvent::Presence { .. } => EVENT_PRESENCE,
        }
    }

    /// Whether the server answers this event with an acknowledgment
    pub fn expects_ack(&self) -> bool {
        matches!(
            self,
            OutboundEvent::SendMessage { .. } | OutboundEvent::MarkRead { .. }
        )
    }

    /// JSON payload as the server expects it
    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::JoinRoom { conversation_id }
            | OutboundEvent::LeaveRoom { conversation_id } => {
                json!({ "conversationId": conversation_id })
            }
            OutboundEvent::SendMessage {
                conversation_id,
                correlation_id,
                content,
                metadata,
            } => {
                let mut payload = json!({
                    "conversationId": conversation_id,
                    "content": encode_content(content),
                    "contentType": content.content_type(),
                    "correlationId": correlation_id,
                });
                if let (Some(metadata), Some(map)) = (metadata, payload.as_object_mut()) {
                    map.insert("metadata".to_string(), metadata.clone());
                }
                payload
            }
            OutboundEvent::MarkRead {
                message_id,
                conversation_id,
            } => json!({ "messageId": message_id, "conversationId": conversation_id }),
            OutboundEvent::Presence { is_online } => json!({ "isOnline": is_online }),
        }
    }
}

/// Text content travels as a bare string; attachments as an object
fn encode_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text { text } => Value::String(text.clone()),
        MessageContent::Image { url, caption } => json!({ "url": url, "caption": caption }),
        MessageContent::File { url, name, size } => {
            json!({ "url": url, "name": name, "size": size })
        }
    }
}

// ----------------------------------------------------------------------------
// Socket Frames
// ----------------------------------------------------------------------------

/// Frame written to the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub event: String,
    pub data: Value,
    #[serde(rename = "ackId", default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl OutboundFrame {
    pub fn new(event: &OutboundEvent, ack_id: Option<u64>) -> Self {
        Self {
            event: event.name().to_string(),
            data: event.payload(),
            ack_id,
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Malformed {
            event: self.event.clone(),
            reason: e.to_string(),
        })
    }
}

/// Frame read from the socket
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "ackId", default)]
    pub ack_id: Option<u64>,
}

/// Decoded meaning of an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundKind {
    Ack { ack_id: u64, data: Value },
    Event { name: String, data: Value },
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<InboundKind, WireError> {
        let frame: InboundFrame = serde_json::from_str(text).map_err(|e| WireError::Malformed {
            event: "frame".to_string(),
            reason: e.to_string(),
        })?;
        match (frame.event, frame.ack_id) {
            (Some(name), _) => Ok(InboundKind::Event {
                name,
                data: frame.data,
            }),
            (None, Some(ack_id)) => Ok(InboundKind::Ack {
                ack_id,
                data: frame.data,
            }),
            (None, None) => Err(WireError::MissingField {
                event: "frame".to_string(),
                field: "event",
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Acknowledgments
// ----------------------------------------------------------------------------

/// `{status: "success", message} | {status: "error", reason}`
#[derive(Debug, Clone, PartialEq)]
pub enum AckPayload {
    Success { message: Option<Value> },
    Error { reason: String },
}

impl AckPayload {
    pub fn parse(data: &Value) -> AckPayload {
        match data.get("status").and_then(Value::as_str) {
            Some("success") | Some("ok") => AckPayload::Success {
                message: data.get("message").filter(|v| !v.is_null()).cloned(),
            },
            _ => AckPayload::Error {
                reason: data
                    .get("reason")
                    .or_else(|| data.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified error")
                    .to_string(),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Inbound Events
// ----------------------------------------------------------------------------

/// Server → client events after normalization
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    NewMessage(ConfirmedMessage),
    MessageRead(ReadReceipt),
    MessageDelivered { message_id: MessageId },
    UserOnline { user_id: UserId },
    UserOffline { user_id: UserId },
}

/// Context needed to fill gaps in loose payloads
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    /// The signed-in user, recipient of messages that omit one
    pub self_id: &'a UserId,
    /// Fallback for receipts without a timestamp
    pub now: Timestamp,
}

impl ServerEvent {
    /// Normalize a named event; unknown event names yield `Ok(None)`
    pub fn parse(
        name: &str,
        data: &Value,
        ctx: NormalizeContext<'_>,
    ) -> Result<Option<ServerEvent>, WireError> {
        let event = match name {
            EVENT_NEW_MESSAGE => {
                let message = data.get("message").unwrap_or(data);
                ServerEvent::NewMessage(normalize_message(name, message, ctx)?)
            }
            EVENT_MESSAGE_READ => ServerEvent::MessageRead(normalize_read_receipt(data, ctx)?),
            EVENT_MESSAGE_DELIVERED => ServerEvent::MessageDelivered {
                message_id: MessageId::new(require(name, data, &["messageId", "_id", "id"], "messageId")?),
            },
            EVENT_USER_ONLINE => ServerEvent::UserOnline {
                user_id: UserId::new(require_user(name, data)?),
            },
            EVENT_USER_OFFLINE => ServerEvent::UserOffline {
                user_id: UserId::new(require_user(name, data)?),
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn require_user(event: &str, data: &Value) -> Result<String, WireError> {
    // Presence events sometimes carry the bare id as the whole payload
    id_value(data)
        .or_else(|| lookup_id(data, &["userId", "user"]))
        .ok_or_else(|| WireError::MissingField {
            event: event.to_string(),
            field: "userId",
        })
}

// ----------------------------------------------------------------------------
// Field Helpers
// ----------------------------------------------------------------------------

/// String or numeric scalar as a string
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Id of a bare scalar or of an object carrying `_id`/`id`
fn id_value(value: &Value) -> Option<String> {
    scalar_string(value).or_else(|| {
        let object = value.as_object()?;
        object
            .get("_id")
            .or_else(|| object.get("id"))
            .and_then(scalar_string)
    })
}

/// First key present whose value resolves to an id
fn lookup_id(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| data.get(*key).and_then(id_value))
}

fn require(
    event: &str,
    data: &Value,
    keys: &[&str],
    field: &'static str,
) -> Result<String, WireError> {
    lookup_id(data, keys).ok_or_else(|| WireError::MissingField {
        event: event.to_string(),
        field,
    })
}

/// Epoch seconds, epoch millis or RFC 3339
pub fn parse_timestamp(value: &Value) -> Result<Timestamp, WireError> {
    match value {
        Value::Number(n) => {
            let raw = n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| WireError::InvalidTimestamp {
                    value: n.to_string(),
                })?;
            let millis = if raw < SECONDS_EPOCH_CEILING {
                raw.saturating_mul(1_000)
            } else {
                raw
            };
            Ok(Timestamp::new(millis))
        }
        Value::String(s) => Timestamp::from_rfc3339(s)
            .or_else(|| s.parse::<u64>().ok().map(Timestamp::new))
            .ok_or_else(|| WireError::InvalidTimestamp { value: s.clone() }),
        other => Err(WireError::InvalidTimestamp {
            value: other.to_string(),
        }),
    }
}

fn optional_timestamp(data: &Value, keys: &[&str]) -> Result<Option<Timestamp>, WireError> {
    match keys.iter().find_map(|key| data.get(*key).filter(|v| !v.is_null())) {
        Some(value) => parse_timestamp(value).map(Some),
        None => Ok(None),
    }
}

fn parse_delivery_state(value: &Value) -> Option<DeliveryState> {
    match value.as_str()? {
        "sent" => Some(DeliveryState::Sent),
        "delivered" => Some(DeliveryState::Delivered),
        "read" | "seen" => Some(DeliveryState::Read),
        _ => None,
    }
}

/// Content from `content` plus an optional `contentType` discriminator
pub fn parse_content(event: &str, data: &Value) -> Result<MessageContent, WireError> {
    let content_type = data
        .get("contentType")
        .or_else(|| data.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("text");
    let content = data.get("content").ok_or_else(|| WireError::MissingField {
        event: event.to_string(),
        field: "content",
    })?;

    // Already in tagged form
    if content.get("type").is_some() {
        return serde_json::from_value(content.clone()).map_err(|e| WireError::Malformed {
            event: event.to_string(),
            reason: e.to_string(),
        });
    }

    let text_field = |key: &str| content.get(key).and_then(Value::as_str).map(str::to_string);

    match content_type {
        "text" => match content {
            Value::String(text) => Ok(MessageContent::Text { text: text.clone() }),
            _ => text_field("text")
                .map(|text| MessageContent::Text { text })
                .ok_or_else(|| WireError::Malformed {
                    event: event.to_string(),
                    reason: "text content is not a string".to_string(),
                }),
        },
        "image" => {
            let url = content
                .as_str()
                .map(str::to_string)
                .or_else(|| text_field("url"))
                .ok_or_else(|| WireError::MissingField {
                    event: event.to_string(),
                    field: "url",
                })?;
            Ok(MessageContent::Image {
                url,
                caption: text_field("caption"),
            })
        }
        "file" => {
            let url = text_field("url").ok_or_else(|| WireError::MissingField {
                event: event.to_string(),
                field: "url",
            })?;
            Ok(MessageContent::File {
                name: text_field("name").unwrap_or_else(|| url.clone()),
                size: content.get("size").and_then(Value::as_u64).unwrap_or(0),
                url,
            })
        }
        other => Err(WireError::UnknownContentType {
            content_type: other.to_string(),
        }),
    }
}

fn parse_read_by(data: &Value) -> Vec<ReadMark> {
    let Some(entries) = data.get("readBy").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let user_id = id_value(entry).or_else(|| lookup_id(entry, &["userId", "user"]))?;
            let read_at = optional_timestamp(entry, &["readAt"]).ok().flatten().unwrap_or(Timestamp::new(0));
            Some(ReadMark {
                user_id: UserId::new(user_id),
                read_at,
            })
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Normalizers
// ----------------------------------------------------------------------------

/// Normalize a loose message payload into a [`ConfirmedMessage`]
pub fn normalize_message(
    event: &str,
    data: &Value,
    ctx: NormalizeContext<'_>,
) -> Result<ConfirmedMessage, WireError> {
    if !data.is_object() {
        return Err(WireError::Malformed {
            event: event.to_string(),
            reason: "message payload is not an object".to_string(),
        });
    }

    let id = require(event, data, &["_id", "id", "messageId"], "id")?;
    let conversation_id = require(
        event,
        data,
        &["conversationId", "conversation", "roomId"],
        "conversationId",
    )?;
    let sender_id = UserId::new(require(event, data, &["sender", "senderId", "from"], "sender")?);
    let recipient_id = match lookup_id(data, &["recipient", "recipientId", "receiver", "to"]) {
        Some(recipient) => UserId::new(recipient),
        None if &sender_id != ctx.self_id => ctx.self_id.clone(),
        None => {
            return Err(WireError::MissingField {
                event: event.to_string(),
                field: "recipient",
            })
        }
    };

    Ok(ConfirmedMessage {
        id: MessageId::new(id),
        correlation_id: lookup_id(data, &["correlationId", "clientId"]).map(CorrelationId::new),
        conversation_id: ConversationId::new(conversation_id),
        sender_id,
        recipient_id,
        content: parse_content(event, data)?,
        created_at: optional_timestamp(data, &["createdAt", "timestamp", "sentAt"])?,
        delivery_state: data
            .get("status")
            .or_else(|| data.get("deliveryState"))
            .and_then(parse_delivery_state),
        read_by: parse_read_by(data),
        metadata: data.get("metadata").filter(|v| !v.is_null()).cloned(),
    })
}

/// Normalize a `message-read` payload
pub fn normalize_read_receipt(
    data: &Value,
    ctx: NormalizeContext<'_>,
) -> Result<ReadReceipt, WireError> {
    let event = EVENT_MESSAGE_READ;
    Ok(ReadReceipt {
        message_id: MessageId::new(require(event, data, &["messageId", "_id", "id"], "messageId")?),
        reader_id: UserId::new(require(event, data, &["readerId", "userId", "reader"], "readerId")?),
        read_at: optional_timestamp(data, &["readAt", "timestamp"])?.unwrap_or(ctx.now),
    })
}

/// Normalize a conversation entry from the history service
pub fn normalize_conversation(
    data: &Value,
    ctx: NormalizeContext<'_>,
) -> Result<ConversationRecord, WireError> {
    let event = "conversation";
    let id = require(event, data, &["_id", "id", "conversationId"], "id")?;
    let participant_ids: Vec<UserId> = data
        .get("participants")
        .or_else(|| data.get("participantIds"))
        .and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(id_value).map(UserId::new).collect())
        .unwrap_or_default();
    if participant_ids.is_empty() {
        return Err(WireError::MissingField {
            event: event.to_string(),
            field: "participants",
        });
    }

    let last_message = match data.get("lastMessage").filter(|v| v.is_object()) {
        Some(last) => Some(LastMessage {
            content: parse_content(event, last)?,
            timestamp: optional_timestamp(last, &["createdAt", "timestamp"])?.unwrap_or(ctx.now),
            sender_id: UserId::new(require(event, last, &["sender", "senderId"], "sender")?),
        }),
        None => None,
    };

    Ok(ConversationRecord {
        id: ConversationId::new(id),
        participant_ids,
        last_message,
        unread_count: data
            .get("unreadCount")
            .and_then(Value::as_u64)
            .map_or(0, |n| n as usize),
    })
}

/// Normalize a list payload (bare array or wrapped in `key`), skipping bad entries
pub fn normalize_list<T>(
    data: &Value,
    key: &str,
    mut normalize: impl FnMut(&Value) -> Result<T, WireError>,
) -> (Vec<T>, Vec<WireError>) {
    let empty = Vec::new();
    let entries = data
        .as_array()
        .or_else(|| data.get(key).and_then(Value::as_array))
        .unwrap_or(&empty);

    let mut items = Vec::with_capacity(entries.len());
    let mut errors = Vec::new();
    for entry in entries {
        match normalize(entry) {
            Ok(item) => items.push(item),
            Err(e) => errors.push(e),
        }
    }
    (items, errors)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
