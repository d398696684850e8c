//! Transport tasks
//!
//! - `server`: event-stream connection, acknowledgments, inbound normalization
//! - `websocket`: [`ServerConnector`] over tokio-tungstenite
//! - `history`: HTTP backfill and the resync task
//! - `peer`: local device-to-device channel

pub mod history;
pub mod peer;
pub mod server;
pub mod websocket;

pub use history::{HistoryApi, HttpHistoryApi, ResyncTask};
pub use peer::{PeerChannel, PeerChannelTask, UnavailablePeerChannel};
pub use server::{
    CredentialProvider, ServerConnector, ServerLink, ServerTransportTask, StaticCredentials,
};
pub use websocket::WsConnector;
