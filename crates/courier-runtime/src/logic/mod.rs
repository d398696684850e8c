//! Sync Engine Module
//!
//! The single task that owns the synchronization state. Handler logic lives
//! in `courier_core::sync`; this module drives it from the CSP channels.

pub mod task;

pub use task::{EngineStats, SyncEngine};
