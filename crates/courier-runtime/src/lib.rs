//! Courier Runtime Engine
//!
//! This crate contains the async runtime for the Courier chat client:
//! - `SyncEngine`: the single task that owns `SyncState` and serializes every
//!   command and event through it
//! - transport tasks for the server event stream, history backfill, the local
//!   peer channel and key-value persistence
//! - `RuntimeBuilder` / `RuntimeHandle` for wiring it all together
//!
//! `courier-core` holds the synchronous state and the channel message types;
//! this crate only moves messages between it and the outside world.

pub mod builder;
pub mod logic;
pub mod storage;
pub mod tasks;
pub mod transports;

pub use builder::{RuntimeBuilder, RuntimeHandle};
pub use logic::{EngineStats, SyncEngine};
pub use storage::{load_peer_book, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, PersistenceTask};
pub use tasks::TransportTask;
pub use transports::{
    CredentialProvider, HistoryApi, HttpHistoryApi, PeerChannel, PeerChannelTask, ResyncTask,
    ServerConnector, ServerLink, ServerTransportTask, StaticCredentials, UnavailablePeerChannel,
    WsConnector,
};

// Re-export core types for convenience
pub use courier_core::{
    channel::{
        create_app_event_channel, create_command_channel, create_effect_channel,
        create_effect_receiver, create_event_channel, AppEventReceiver, AppEventSender,
        ChannelError, CommandReceiver, CommandSender, EffectReceiver, EffectSender, EventReceiver,
        EventSender, NonBlockingSend,
    },
    AppEvent, Command, ConnectionStatus, CourierConfig, CourierError, CourierResult, Effect,
    Event, PeerEffect, PeerEvent, SyncSnapshot, UserId,
};
