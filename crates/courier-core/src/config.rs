//! Centralized Configuration Management
//!
//! This module consolidates all configuration structures used throughout
//! Courier Core so the runtime and the CLI share a single, validated view.

use core::time::Duration;

use crate::protocol::DeliveryState;

// ----------------------------------------------------------------------------
// Message Store Configuration
// ----------------------------------------------------------------------------

/// How far the transport guarantees a message went once the server acknowledged it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationLevel {
    /// The server only guarantees it accepted the message
    Sent,
    /// The server guarantees delivery to the recipient's inbox
    #[default]
    Delivered,
}

impl ConfirmationLevel {
    /// Delivery state a reconciled message lands in
    pub fn delivery_state(self) -> DeliveryState {
        match self {
            ConfirmationLevel::Sent => DeliveryState::Sent,
            ConfirmationLevel::Delivered => DeliveryState::Delivered,
        }
    }
}

/// Configuration for message storage and validation
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageStoreConfig {
    /// Maximum content length for outgoing messages (in characters, not bytes)
    pub max_content_length: usize,
    /// Whether to reject control characters in outgoing text
    pub strict_content_validation: bool,
    /// State a message is moved to when its confirmation arrives
    pub confirmation_level: ConfirmationLevel,
}

impl Default for MessageStoreConfig {
    fn default() -> Self {
        Self {
            max_content_length: 4096,
            strict_content_validation: true,
            confirmation_level: ConfirmationLevel::Delivered,
        }
    }
}

impl MessageStoreConfig {
    /// Create configuration for testing with small limits
    pub fn testing() -> Self {
        Self {
            max_content_length: 512,
            strict_content_validation: true,
            confirmation_level: ConfirmationLevel::Delivered,
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Configuration for the server connection lifecycle
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionConfig {
    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// Number of reconnection attempts before giving up until the user acts
    pub max_reconnect_attempts: u32,
    /// How long to wait for an acknowledgment before forgetting it
    pub ack_timeout: Duration,
    /// How long a connection handshake may take
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            ack_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration for flaky mobile networks
    pub fn low_latency() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 10,
            ack_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Create configuration optimized for testing (fast retries)
    pub fn testing() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: 2,
            ack_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Configuration for CSP channel buffer sizes
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChannelConfig {
    /// Buffer size for Command channels (UI → Sync Engine)
    pub command_buffer_size: usize,
    /// Buffer size for Event channels (Transports → Sync Engine)
    pub event_buffer_size: usize,
    /// Buffer size for Effect channels (Sync Engine → Transports)
    pub effect_buffer_size: usize,
    /// Buffer size for AppEvent channels (Sync Engine → UI)
    pub app_event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 32,   // UI commands are infrequent
            event_buffer_size: 128,    // Server pushes can be bursty after reconnect
            effect_buffer_size: 64,    // Effects are processed quickly
            app_event_buffer_size: 64, // UI updates need responsiveness
        }
    }
}

impl ChannelConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            command_buffer_size: 16,
            event_buffer_size: 64,
            effect_buffer_size: 64,
            app_event_buffer_size: 256,
        }
    }
}

// ----------------------------------------------------------------------------
// Local Peer Channel Configuration
// ----------------------------------------------------------------------------

/// Configuration for the offline device-to-device channel
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PeerChannelConfig {
    /// How long discovery runs before it is stopped automatically
    pub discovery_timeout: Duration,
    /// Key under which peer histories and display names are persisted
    pub storage_key: String,
}

impl Default for PeerChannelConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(30),
            storage_key: "courier.local-peers".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Aggregate Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the synchronization core
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CourierConfig {
    pub store: MessageStoreConfig,
    pub connection: ConnectionConfig,
    pub channels: ChannelConfig,
    pub peer: PeerChannelConfig,
}

impl CourierConfig {
    /// Create default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration for tests: small buffers, fast reconnects
    pub fn testing() -> Self {
        Self {
            store: MessageStoreConfig::testing(),
            connection: ConnectionConfig::testing(),
            channels: ChannelConfig::testing(),
            peer: PeerChannelConfig {
                discovery_timeout: Duration::from_millis(200),
                storage_key: "courier.test-peers".to_string(),
            },
        }
    }

    pub fn with_store(mut self, store: MessageStoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_peer(mut self, peer: PeerChannelConfig) -> Self {
        self.peer = peer;
        self
    }

    /// Validate the configuration for consistency and feasibility
    pub fn validate(&self) -> Result<(), String> {
        if self.channels.command_buffer_size == 0 {
            return Err("Command buffer size cannot be zero".into());
        }
        if self.channels.event_buffer_size == 0 {
            return Err("Event buffer size cannot be zero".into());
        }
        if self.channels.effect_buffer_size == 0 {
            return Err("Effect buffer size cannot be zero".into());
        }
        if self.channels.app_event_buffer_size == 0 {
            return Err("App event buffer size cannot be zero".into());
        }

        if self.store.max_content_length == 0 {
            return Err("Max content length cannot be zero".into());
        }

        if self.connection.max_reconnect_attempts == 0 {
            return Err("Max reconnect attempts cannot be zero".into());
        }
        if self.connection.ack_timeout.is_zero() {
            return Err("Acknowledgment timeout cannot be zero".into());
        }
        if self.connection.connect_timeout.is_zero() {
            return Err("Connect timeout cannot be zero".into());
        }

        if self.peer.storage_key.trim().is_empty() {
            return Err("Peer storage key cannot be empty".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CourierConfig::default().validate().is_ok());
        assert!(CourierConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_zero_buffers_rejected() {
        let config = CourierConfig::default().with_channels(ChannelConfig {
            command_buffer_size: 0,
            ..ChannelConfig::default()
        });
        assert_eq!(
            config.validate().unwrap_err(),
            "Command buffer size cannot be zero"
        );
    }

    #[test]
    fn test_zero_reconnect_attempts_rejected() {
        let config = CourierConfig::default().with_connection(ConnectionConfig {
            max_reconnect_attempts: 0,
            ..ConnectionConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confirmation_level_maps_to_state() {
        assert_eq!(
            ConfirmationLevel::Sent.delivery_state(),
            DeliveryState::Sent
        );
        assert_eq!(
            ConfirmationLevel::default().delivery_state(),
            DeliveryState::Delivered
        );
    }
}
