//! Message Data Model
//!
//! The client-side shape of a chat message, its content variants and the
//! delivery state machine every message moves through.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, CorrelationId, MessageId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Delivery State Machine
// ----------------------------------------------------------------------------

/// Per-message delivery progress
///
/// Moves forward only: `Pending → {Sent | Delivered | Read | Failed}`,
/// `Sent → {Delivered | Read}`, `Delivered → Read`. `Failed` and `Read` are
/// terminal. A read receipt may overtake a delivery notice since a read
/// message has necessarily been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    #[default]
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryState {
    /// Compute the state after moving towards `next`
    ///
    /// Returns `None` when the move is backward, a repeat, or leaves a
    /// terminal state. Callers treat `None` as a silent no-op.
    pub fn advance(self, next: DeliveryState) -> Option<DeliveryState> {
        use DeliveryState::*;

        match (self, next) {
            (Pending, Sent | Delivered | Read | Failed) => Some(next),
            (Sent, Delivered | Read) => Some(next),
            (Delivered, Read) => Some(next),
            _ => None,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Read | DeliveryState::Failed)
    }

    /// Whether the server has accepted the message
    pub fn is_confirmed(self) -> bool {
        matches!(
            self,
            DeliveryState::Sent | DeliveryState::Delivered | DeliveryState::Read
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryState::Pending => write!(f, "pending"),
            DeliveryState::Sent => write!(f, "sent"),
            DeliveryState::Delivered => write!(f, "delivered"),
            DeliveryState::Read => write!(f, "read"),
            DeliveryState::Failed => write!(f, "failed"),
        }
    }
}

// ----------------------------------------------------------------------------
// Message Content
// ----------------------------------------------------------------------------

/// Message payload, tagged by content type on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    File {
        url: String,
        name: String,
        size: u64,
    },
}

impl MessageContent {
    /// Convenience constructor for plain text
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text { text: text.into() }
    }

    /// Wire name of the content type
    pub fn content_type(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Image { .. } => "image",
            MessageContent::File { .. } => "file",
        }
    }

    /// The user-authored text carried by this content, if any
    pub fn body(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } => Some(text),
            MessageContent::Image { caption, .. } => caption.as_deref(),
            MessageContent::File { name, .. } => Some(name),
        }
    }

    /// Short human-readable rendering for list previews
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { text } => text.clone(),
            MessageContent::Image { caption: Some(caption), .. } => format!("[image] {}", caption),
            MessageContent::Image { caption: None, .. } => "[image]".to_string(),
            MessageContent::File { name, .. } => format!("[file] {}", name),
        }
    }
}

// ----------------------------------------------------------------------------
// Read Tracking
// ----------------------------------------------------------------------------

/// A single reader acknowledgment recorded on a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMark {
    pub user_id: UserId,
    pub read_at: Timestamp,
}

/// Normalized `message-read` notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub reader_id: UserId,
    pub read_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// A message as held by the store, optimistic or confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server id, absent until the server has persisted the message
    pub id: Option<MessageId>,
    /// Client token for an outgoing attempt, never reused
    pub correlation_id: Option<CorrelationId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: MessageContent,
    pub created_at: Timestamp,
    pub delivery_state: DeliveryState,
    pub read_by: Vec<ReadMark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    /// Ownership check used everywhere a sender comparison is needed
    pub fn is_authored_by(&self, user_id: &UserId) -> bool {
        &self.sender_id == user_id
    }

    /// Whether the server has assigned an id
    pub fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }

    /// Whether the given user has a read mark on this message
    pub fn is_read_by(&self, user_id: &UserId) -> bool {
        self.read_by.iter().any(|mark| &mark.user_id == user_id)
    }

    /// Whether this message should count as unread for `self_id`
    pub fn is_unread_for(&self, self_id: &UserId) -> bool {
        !self.is_authored_by(self_id) && self.delivery_state != DeliveryState::Read
    }
}

/// Strict, server-confirmed message shape produced at the transport boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedMessage {
    pub id: MessageId,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: MessageContent,
    /// Server timestamp, when the server supplied one
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    /// Server-side delivery state, when the server supplied one
    #[serde(default)]
    pub delivery_state: Option<DeliveryState>,
    #[serde(default)]
    pub read_by: Vec<ReadMark>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// User input for a new outgoing message
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: MessageContent,
    pub metadata: Option<serde_json::Value>,
}

impl OutgoingMessage {
    pub fn new(sender_id: UserId, recipient_id: UserId, content: MessageContent) -> Self {
        Self {
            sender_id,
            recipient_id,
            content,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Denormalized preview of a conversation's most recent message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: MessageContent,
    pub timestamp: Timestamp,
    pub sender_id: UserId,
}

impl From<&Message> for LastMessage {
    fn from(message: &Message) -> Self {
        Self {
            content: message.content.clone(),
            timestamp: message.created_at,
            sender_id: message.sender_id.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
