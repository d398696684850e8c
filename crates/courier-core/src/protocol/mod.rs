//! Courier Protocol Module
//!
//! This module contains the message delivery and synchronization protocol:
//! - `message`: Message data model and the delivery state machine
//! - `message_store`: Conversation-scoped store with correlation matching
//! - `reconciler`: Unified merge of acknowledgments, pushed events and backfill
//! - `conversation_index`: Chat list summaries derived from store changes
//! - `presence` / `receipts`: Presence tracking and read receipt bookkeeping
//! - `connection_state`: Server connection state machine
//! - `peer_session`: Local device-to-device sessions and histories
//! - `wire`: Socket framing and payload normalization

pub mod connection_state;
pub mod conversation_index;
pub mod message;
pub mod message_store;
pub mod peer_session;
pub mod presence;
pub mod receipts;
pub mod reconciler;
pub mod wire;

// Re-export message types
pub use message::{
    ConfirmedMessage, DeliveryState, LastMessage, Message, MessageContent, OutgoingMessage,
    ReadMark, ReadReceipt,
};

// Re-export store types
pub use message_store::{
    CorrelationIdGenerator, MessageStore, MessageStoreStats, ReadOutcome, ReconcileOutcome,
    StoreChange, StoredMessage,
};

// Re-export reconciler types
pub use reconciler::{DeliveryReconciler, ReconcileInput, ReconcileResult};

// Re-export index types
pub use conversation_index::{ConversationIndex, ConversationRecord, ConversationSummary};

// Re-export tracker types
pub use presence::{PresenceChange, PresenceTracker};
pub use receipts::{ReceiptStats, ReceiptTracker};

// Re-export connection state types
pub use connection_state::{
    AuditEntry, ConnectionEffect, ConnectionEvent, ConnectionGate, ConnectionManager,
    ConnectionState, ConnectionStats, StateTransition, StateTransitionError, TransitionContext,
};

// Re-export local peer types
pub use peer_session::{
    LocalPeerBook, LocalPeerMessage, LocalPeerSession, MessageDirection, PeerSessionState,
    PersistedPeerBook,
};

// Re-export wire types
pub use wire::{AckPayload, InboundFrame, InboundKind, NormalizeContext, OutboundEvent, OutboundFrame, ServerEvent};
