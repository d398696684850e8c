//! CSP Channel Communication Protocol Types
//!
//! All inter-task communication flows through these message types:
//! `Command` (UI → sync engine), `Event` (transports → sync engine),
//! `Effect` (sync engine → transports) and `AppEvent` (sync engine → UI).

use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::protocol::conversation_index::ConversationRecord;
use crate::protocol::message::{ConfirmedMessage, Message, MessageContent};
use crate::protocol::peer_session::{LocalPeerMessage, LocalPeerSession, PersistedPeerBook};
use crate::protocol::wire::{OutboundEvent, ServerEvent};
use crate::types::{
    ConnectivityMode, ConversationId, CorrelationId, DeviceAddress, MessageId, UserId,
};

// ----------------------------------------------------------------------------
// Command: UI → Sync Engine
// ----------------------------------------------------------------------------

/// Commands sent from the UI to the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Send a message optimistically
    SendMessage {
        conversation_id: ConversationId,
        recipient_id: UserId,
        content: MessageContent,
        metadata: Option<serde_json::Value>,
    },
    /// Resubmit a failed message under a new correlation id
    RetryMessage { correlation_id: CorrelationId },
    /// Remove a failed message that never reached the server
    DiscardMessage { correlation_id: CorrelationId },
    /// Conversation screen opened: join its room and mark it read
    OpenConversation { conversation_id: ConversationId },
    /// Conversation screen closed: leave its room
    CloseConversation { conversation_id: ConversationId },
    MarkConversationRead { conversation_id: ConversationId },
    ClearHistory { conversation_id: ConversationId },
    /// Stop or resume reporting our reads to the server
    SetReadReceipts { enabled: bool },
    /// Switch between server and local device-to-device chat
    SetMode { mode: ConnectivityMode },
    /// Explicit user request to (re)connect
    Connect,
    Disconnect,
    StartDiscovery,
    StopDiscovery,
    ConnectPeer { address: DeviceAddress },
    DisconnectPeer { address: DeviceAddress },
    SendPeerMessage { address: DeviceAddress, text: String },
    RenamePeer {
        address: DeviceAddress,
        display_name: Option<String>,
    },
    ClearPeerHistory { address: DeviceAddress },
    /// Shutdown the engine gracefully
    Shutdown,
}

// ----------------------------------------------------------------------------
// Event: Transports → Sync Engine
// ----------------------------------------------------------------------------

/// Outcome of a `send-message` acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub enum SendAck {
    Confirmed(ConfirmedMessage),
    Rejected { reason: String },
}

/// Events sent from transport tasks to the sync engine
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Normalized server push
    Server(ServerEvent),
    SendAcked {
        correlation_id: CorrelationId,
        result: SendAck,
    },
    MarkReadAcked {
        message_id: MessageId,
        error: Option<String>,
    },
    ConnectionEstablished { session_id: String },
    ConnectionFailed { reason: String },
    ConnectionLost { reason: String },
    ReconnectTimerFired,
    /// Credential became available or was revoked
    AuthChanged { authenticated: bool },
    ConversationsFetched { conversations: Vec<ConversationRecord> },
    HistoryFetched {
        conversation_id: ConversationId,
        messages: Vec<ConfirmedMessage>,
    },
    ResyncFailed { reason: String },
    Peer(PeerEvent),
}

/// Events from the local peer channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEvent {
    Discovered {
        address: DeviceAddress,
        name: Option<String>,
    },
    Lost { address: DeviceAddress },
    Connected { address: DeviceAddress },
    Disconnected { address: DeviceAddress },
    ConnectFailed { address: DeviceAddress, reason: String },
    MessageReceived { address: DeviceAddress, text: String },
    /// The channel accepted an outgoing text
    SendAccepted { address: DeviceAddress, text: String },
    SendFailed { address: DeviceAddress, reason: String },
    DiscoveryStopped,
    DiscoveryFailed { reason: String },
}

// ----------------------------------------------------------------------------
// Effect: Sync Engine → Transports (External Side Effects Only)
// ----------------------------------------------------------------------------

/// Effects broadcast from the sync engine to transport tasks
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenConnection,
    CloseConnection,
    /// Write an event to the server socket
    Emit(OutboundEvent),
    ScheduleReconnect { delay: Duration, attempt: u32 },
    /// Backfill the conversation list and these conversations' histories
    Resync { conversation_ids: Vec<ConversationId> },
    Peer(PeerEffect),
    PersistPeerBook { key: String, book: PersistedPeerBook },
}

/// Commands for the local peer channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEffect {
    StartDiscovery,
    StopDiscovery,
    Connect { address: DeviceAddress },
    Disconnect { address: DeviceAddress },
    Send { address: DeviceAddress, text: String },
}

// ----------------------------------------------------------------------------
// AppEvent: Sync Engine → UI (State Changes Only)
// ----------------------------------------------------------------------------

/// Application events describing state changes the UI renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppEvent {
    /// A message was inserted or changed
    MessageUpserted { message: Message },
    /// A failed message was discarded
    MessageRemoved {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
    },
    SendFailed {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
        reason: String,
    },
    /// Conversation summaries or their order changed
    ConversationListChanged,
    ConversationCleared { conversation_id: ConversationId },
    ConnectivityChanged {
        status: ConnectionStatus,
        mode: ConnectivityMode,
        can_send: bool,
    },
    ReconnectExhausted { attempts: u32 },
    PresenceChanged { user_id: UserId, online: bool },
    PeerSessionChanged { session: LocalPeerSession },
    PeerSessionRemoved { address: DeviceAddress },
    PeerMessage {
        address: DeviceAddress,
        message: LocalPeerMessage,
    },
    PeerHistoryCleared { address: DeviceAddress },
    /// Local channel failure shown to the user; nothing is retried
    PeerAlert {
        address: Option<DeviceAddress>,
        reason: String,
    },
    DiscoveryStateChanged { active: bool },
    Error { message: String },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Server connection status for UI display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for or performing an automatic reconnect
    Reconnecting,
    /// Automatic reconnects gave up; waiting for the user
    Exhausted,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Connecting => write!(f, "Connecting"),
            ConnectionStatus::Connected => write!(f, "Connected"),
            ConnectionStatus::Reconnecting => write!(f, "Reconnecting"),
            ConnectionStatus::Exhausted => write!(f, "Exhausted"),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_status_display() {
        assert_eq!(format!("{}", ConnectionStatus::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionStatus::Exhausted), "Exhausted");
    }

    #[test]
    fn test_command_serialization() {
        let cmd = Command::SendMessage {
            conversation_id: ConversationId::new("c1"),
            recipient_id: UserId::new("peer"),
            content: MessageContent::text("test message"),
            metadata: None,
        };

        let serialized = serde_json::to_string(&cmd).unwrap();
        let deserialized: Command = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, cmd);
    }
}
