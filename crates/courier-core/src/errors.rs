//! Error types for the Courier synchronization layer
//!
//! This module contains all error types used throughout the core, including
//! transport errors, store errors, local peer channel errors, wire
//! normalization errors, and the main CourierError type that unifies them.

use crate::types::{ConversationId, CorrelationId, DeviceAddress, MessageId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Server transport error types
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },
    #[error("Not connected to server")]
    NotConnected,
    #[error("Missing credential for transport handshake")]
    MissingCredential,
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },
    #[error("Transport closed: {reason}")]
    Closed { reason: String },
    #[error("HTTP request failed: {reason}")]
    Http { reason: String },
}

/// Message store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Message content exceeds maximum length of {max} characters")]
    ContentTooLong { max: usize },
    #[error("Message content is empty")]
    EmptyContent,
    #[error("Message content contains invalid characters: {reason}")]
    InvalidContent { reason: String },
    #[error("No optimistic message with correlation id {correlation_id}")]
    UnknownCorrelation { correlation_id: CorrelationId },
    #[error("Message {message_id} not found")]
    MessageNotFound { message_id: MessageId },
    #[error("Conversation {conversation_id} is not tracked")]
    UnknownConversation { conversation_id: ConversationId },
    #[error("Message {correlation_id} is not in a failed state")]
    NotFailed { correlation_id: CorrelationId },
}

/// Local peer channel error types
#[derive(Debug, thiserror::Error)]
pub enum PeerChannelError {
    #[error("Local peer channel is only available in offline-local mode")]
    Inactive,
    #[error("Peer {address} is unreachable: {reason}")]
    Unreachable { address: DeviceAddress, reason: String },
    #[error("Peer {address} is not connected")]
    NotConnected { address: DeviceAddress },
    #[error("Discovery failed: {reason}")]
    DiscoveryFailed { reason: String },
    #[error("Local peer channel unavailable on this platform")]
    Unavailable,
}

/// Errors raised while normalizing loosely-typed payloads
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Missing field {field} in {event} payload")]
    MissingField { event: String, field: &'static str },
    #[error("Unknown content type: {content_type}")]
    UnknownContentType { content_type: String },
    #[error("Invalid timestamp: {value}")]
    InvalidTimestamp { value: String },
    #[error("Malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error types for Courier
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Local peer channel error: {0}")]
    PeerChannel(#[from] PeerChannelError),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] crate::protocol::StateTransitionError),

    /// Channel communication error (internal to CSP architecture)
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Key-value persistence error
    #[error("Storage error: {reason}")]
    Storage { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl CourierError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        CourierError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        CourierError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a storage error with a reason
    pub fn storage_error<T: Into<String>>(reason: T) -> Self {
        CourierError::Storage {
            reason: reason.into(),
        }
    }

    /// Create a transport connection failed error
    pub fn connection_failed<R: Into<String>>(reason: R) -> Self {
        CourierError::Transport(TransportError::ConnectionFailed {
            reason: reason.into(),
        })
    }

    /// Create a transport send failed error
    pub fn send_failed<R: Into<String>>(reason: R) -> Self {
        CourierError::Transport(TransportError::SendFailed {
            reason: reason.into(),
        })
    }

    /// Create a malformed payload error
    pub fn malformed<E: Into<String>, R: Into<String>>(event: E, reason: R) -> Self {
        CourierError::Wire(WireError::Malformed {
            event: event.into(),
            reason: reason.into(),
        })
    }

    /// Whether the error leaves the owning task unable to continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CourierError::Channel { .. } | CourierError::Configuration { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, CourierError>;
pub type CourierResult<T> = Result<T>;
