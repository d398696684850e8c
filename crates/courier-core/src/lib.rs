//! Courier Core
//!
//! This crate provides the synchronization state of the Courier chat client:
//! the message store, the delivery reconciler that merges optimistic sends with
//! server confirmations, the conversation index, read/presence tracking, the
//! server connection state machine, and the local peer book used in offline mode.
//!
//! Everything here is synchronous and owned by a single logical task; the async
//! plumbing lives in `courier-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod sync;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{
    AppEvent, Command, ConnectionStatus, Effect, Event, PeerEffect, PeerEvent, SendAck,
};
pub use config::{
    ChannelConfig, ConfirmationLevel, ConnectionConfig, CourierConfig, MessageStoreConfig,
    PeerChannelConfig,
};
pub use errors::{
    CourierError, CourierResult, PeerChannelError, Result, StoreError, TransportError, WireError,
};
pub use protocol::{
    ConfirmedMessage, ConversationIndex, ConversationRecord, ConversationSummary,
    DeliveryReconciler, DeliveryState, LocalPeerBook, LocalPeerMessage, LocalPeerSession, Message,
    MessageContent, MessageStore, OutboundEvent, PeerSessionState, PersistedPeerBook,
    ReconcileInput, ServerEvent,
};
pub use sync::{SyncOutput, SyncSnapshot, SyncState};
pub use types::{
    ConnectivityMode, ConversationId, CorrelationId, DeviceAddress, MessageId, SystemTimeSource,
    TimeSource, Timestamp, UserId,
};
