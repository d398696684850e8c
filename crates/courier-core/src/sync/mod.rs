//! Synchronization State
//!
//! This module contains the single owned state container the sync engine drives:
//! - `state`: `SyncState`, its outputs and the snapshots handed to the UI
//! - `handlers`: Command and event handlers
//!
//! Every mutation happens synchronously in response to one `Command` or
//! `Event`. The handlers return the effects for transport tasks and the app
//! events for the UI; nothing here performs I/O.

pub mod handlers;
pub mod state;

pub use state::{SyncOutput, SyncSnapshot, SyncState};
