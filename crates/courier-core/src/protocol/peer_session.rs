//! Local Peer Book
//!
//! Session and history bookkeeping for the offline device-to-device channel.
//! Peer histories are keyed by device address, live apart from the message
//! store and are persisted as a single JSON document.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::PeerChannelError;
use crate::types::{DeviceAddress, Timestamp};

// ----------------------------------------------------------------------------
// Session Types
// ----------------------------------------------------------------------------

/// Connection progress with a single nearby device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSessionState {
    Idle,
    Discovering,
    Connecting,
    Connected,
    Failed,
}

/// A nearby device known to the local channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPeerSession {
    pub device_address: DeviceAddress,
    /// User-assigned label; not unique
    pub display_name: Option<String>,
    pub connection_state: PeerSessionState,
    pub last_error: Option<String>,
}

impl LocalPeerSession {
    fn new(device_address: DeviceAddress, display_name: Option<String>) -> Self {
        Self {
            device_address,
            display_name,
            connection_state: PeerSessionState::Idle,
            last_error: None,
        }
    }

    /// Label to show in lists: display name, falling back to the address
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| self.device_address.as_str())
    }
}

/// Which side wrote a peer history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Sent,
    Received,
}

/// One line of local peer chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPeerMessage {
    pub direction: MessageDirection,
    pub text: String,
    pub timestamp: Timestamp,
}

/// Persisted form of the peer book
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPeerBook {
    #[serde(default)]
    pub display_names: BTreeMap<DeviceAddress, String>,
    #[serde(default)]
    pub histories: BTreeMap<DeviceAddress, Vec<LocalPeerMessage>>,
}

// ----------------------------------------------------------------------------
// Local Peer Book
// ----------------------------------------------------------------------------

/// Sessions, display names and histories for nearby devices
#[derive(Debug, Clone, Default)]
pub struct LocalPeerBook {
    /// Whether offline-local mode is on
    active: bool,
    discovering: bool,
    sessions: HashMap<DeviceAddress, LocalPeerSession>,
    display_names: HashMap<DeviceAddress, String>,
    histories: HashMap<DeviceAddress, Vec<LocalPeerMessage>>,
    /// Persisted state changed since the last snapshot
    dirty: bool,
}

impl LocalPeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted state; sessions start empty
    pub fn restore(persisted: PersistedPeerBook) -> Self {
        Self {
            display_names: persisted.display_names.into_iter().collect(),
            histories: persisted.histories.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn to_persisted(&self) -> PersistedPeerBook {
        PersistedPeerBook {
            display_names: self
                .display_names
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            histories: self
                .histories
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Return whether persisted state changed, resetting the flag
    pub fn take_dirty(&mut self) -> bool {
        core::mem::take(&mut self.dirty)
    }

    // ------------------------------------------------------------------------
    // Mode and Discovery
    // ------------------------------------------------------------------------

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Leave offline-local mode, returning the devices that were connected
    pub fn deactivate(&mut self) -> Vec<DeviceAddress> {
        self.active = false;
        self.discovering = false;
        let connected = self
            .sessions
            .values()
            .filter(|s| {
                matches!(
                    s.connection_state,
                    PeerSessionState::Connected | PeerSessionState::Connecting
                )
            })
            .map(|s| s.device_address.clone())
            .collect();
        self.sessions.clear();
        connected
    }

    fn ensure_active(&self) -> Result<(), PeerChannelError> {
        if self.active {
            Ok(())
        } else {
            Err(PeerChannelError::Inactive)
        }
    }

    pub fn start_discovery(&mut self) -> Result<(), PeerChannelError> {
        self.ensure_active()?;
        self.discovering = true;
        for session in self.sessions.values_mut() {
            if matches!(
                session.connection_state,
                PeerSessionState::Idle | PeerSessionState::Failed
            ) {
                session.connection_state = PeerSessionState::Discovering;
            }
        }
        Ok(())
    }

    pub fn stop_discovery(&mut self) {
        self.discovering = false;
        for session in self.sessions.values_mut() {
            if session.connection_state == PeerSessionState::Discovering {
                session.connection_state = PeerSessionState::Idle;
            }
        }
    }

    /// A device showed up during discovery
    pub fn peer_discovered(
        &mut self,
        address: DeviceAddress,
        advertised_name: Option<String>,
    ) -> Option<&LocalPeerSession> {
        if !self.active {
            return None;
        }
        let display_name = self
            .display_names
            .get(&address)
            .cloned()
            .or(advertised_name);
        let discovering = self.discovering;
        let session = self
            .sessions
            .entry(address.clone())
            .or_insert_with(|| LocalPeerSession::new(address, display_name));
        if discovering && session.connection_state == PeerSessionState::Idle {
            session.connection_state = PeerSessionState::Discovering;
        }
        Some(session)
    }

    /// A device went out of range; connected sessions are kept
    pub fn peer_lost(&mut self, address: &DeviceAddress) -> bool {
        let removable = self
            .sessions
            .get(address)
            .is_some_and(|s| s.connection_state != PeerSessionState::Connected);
        if removable {
            self.sessions.remove(address);
        }
        removable
    }

    // ------------------------------------------------------------------------
    // Session Lifecycle
    // ------------------------------------------------------------------------

    pub fn begin_connect(&mut self, address: &DeviceAddress) -> Result<(), PeerChannelError> {
        self.ensure_active()?;
        let session = self
            .sessions
            .get_mut(address)
            .ok_or_else(|| PeerChannelError::Unreachable {
                address: address.clone(),
                reason: "device not discovered".to_string(),
            })?;
        if session.connection_state != PeerSessionState::Connected {
            session.connection_state = PeerSessionState::Connecting;
            session.last_error = None;
        }
        Ok(())
    }

    pub fn mark_connected(&mut self, address: &DeviceAddress) -> Option<&LocalPeerSession> {
        let display_name = self.display_names.get(address).cloned();
        let session = self
            .sessions
            .entry(address.clone())
            .or_insert_with(|| LocalPeerSession::new(address.clone(), display_name));
        session.connection_state = PeerSessionState::Connected;
        session.last_error = None;
        Some(session)
    }

    pub fn mark_disconnected(&mut self, address: &DeviceAddress) -> Option<&LocalPeerSession> {
        let session = self.sessions.get_mut(address)?;
        session.connection_state = PeerSessionState::Idle;
        Some(session)
    }

    pub fn mark_failed(&mut self, address: &DeviceAddress, reason: String) -> Option<&LocalPeerSession> {
        let session = self.sessions.get_mut(address)?;
        session.connection_state = PeerSessionState::Failed;
        session.last_error = Some(reason);
        Some(session)
    }

    /// Check that a message can be handed to the channel
    pub fn ensure_connected(&self, address: &DeviceAddress) -> Result<(), PeerChannelError> {
        self.ensure_active()?;
        match self.sessions.get(address) {
            Some(session) if session.connection_state == PeerSessionState::Connected => Ok(()),
            _ => Err(PeerChannelError::NotConnected {
                address: address.clone(),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    fn append(&mut self, address: DeviceAddress, message: LocalPeerMessage) -> LocalPeerMessage {
        self.histories
            .entry(address)
            .or_default()
            .push(message.clone());
        self.dirty = true;
        message
    }

    /// Record our own text after the channel accepted it
    pub fn record_sent(
        &mut self,
        address: DeviceAddress,
        text: String,
        timestamp: Timestamp,
    ) -> LocalPeerMessage {
        self.append(
            address,
            LocalPeerMessage {
                direction: MessageDirection::Sent,
                text,
                timestamp,
            },
        )
    }

    /// Record inbound text; ignored while offline-local mode is off
    pub fn record_received(
        &mut self,
        address: DeviceAddress,
        text: String,
        timestamp: Timestamp,
    ) -> Option<LocalPeerMessage> {
        if !self.active {
            debug!(%address, "Dropping local peer message outside offline mode");
            return None;
        }
        Some(self.append(
            address,
            LocalPeerMessage {
                direction: MessageDirection::Received,
                text,
                timestamp,
            },
        ))
    }

    pub fn history(&self, address: &DeviceAddress) -> &[LocalPeerMessage] {
        self.histories
            .get(address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop a peer's whole history at once
    pub fn clear_history(&mut self, address: &DeviceAddress) -> usize {
        let removed = self.histories.remove(address).map_or(0, |h| h.len());
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Assign or remove a display name
    pub fn rename_peer(&mut self, address: &DeviceAddress, display_name: Option<String>) {
        let display_name = display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        match &display_name {
            Some(name) => {
                self.display_names.insert(address.clone(), name.clone());
            }
            None => {
                self.display_names.remove(address);
            }
        }
        if let Some(session) = self.sessions.get_mut(address) {
            session.display_name = display_name;
        }
        self.dirty = true;
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn session(&self, address: &DeviceAddress) -> Option<&LocalPeerSession> {
        self.sessions.get(address)
    }

    /// Sessions ordered by address for stable rendering
    pub fn sessions(&self) -> Vec<&LocalPeerSession> {
        let mut sessions: Vec<_> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.device_address.cmp(&b.device_address));
        sessions
    }

    pub fn display_name(&self, address: &DeviceAddress) -> Option<&str> {
        self.display_names.get(address).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> DeviceAddress {
        DeviceAddress::new(s)
    }

    fn active_book() -> LocalPeerBook {
        let mut book = LocalPeerBook::new();
        book.activate();
        book
    }

    #[test]
    fn test_inactive_book_rejects_operations() {
        let mut book = LocalPeerBook::new();
        assert!(matches!(book.start_discovery(), Err(PeerChannelError::Inactive)));
        assert!(book.peer_discovered(addr("a"), None).is_none());
        assert!(book
            .record_received(addr("a"), "hi".to_string(), Timestamp::new(1))
            .is_none());
    }

    #[test]
    fn test_connect_lifecycle() {
        let mut book = active_book();
        book.start_discovery().unwrap();
        let session = book.peer_discovered(addr("a"), Some("Phone".to_string())).unwrap();
        assert_eq!(session.connection_state, PeerSessionState::Discovering);
        assert_eq!(session.label(), "Phone");

        book.begin_connect(&addr("a")).unwrap();
        assert!(book.ensure_connected(&addr("a")).is_err());
        book.mark_connected(&addr("a"));
        assert!(book.ensure_connected(&addr("a")).is_ok());

        // Connected sessions survive going out of range
        assert!(!book.peer_lost(&addr("a")));
        assert_eq!(book.deactivate(), vec![addr("a")]);
        assert!(book.sessions().is_empty());
    }

    #[test]
    fn test_connect_to_unknown_device() {
        let mut book = active_book();
        assert!(matches!(
            book.begin_connect(&addr("ghost")),
            Err(PeerChannelError::Unreachable { .. })
        ));
    }

    #[test]
    fn test_history_and_names_persist() {
        let mut book = active_book();
        book.record_sent(addr("a"), "hello".to_string(), Timestamp::new(1));
        book.record_received(addr("a"), "hey".to_string(), Timestamp::new(2));
        book.rename_peer(&addr("a"), Some("  Alex  ".to_string()));
        assert!(book.take_dirty());
        assert!(!book.take_dirty());

        let json = serde_json::to_value(book.to_persisted()).unwrap();
        let restored = LocalPeerBook::restore(serde_json::from_value(json).unwrap());
        assert_eq!(restored.history(&addr("a")).len(), 2);
        assert_eq!(restored.history(&addr("a"))[1].direction, MessageDirection::Received);
        assert_eq!(restored.display_name(&addr("a")), Some("Alex"));
        assert!(!restored.is_active());
    }

    #[test]
    fn test_clear_history_is_atomic() {
        let mut book = active_book();
        book.record_sent(addr("a"), "1".to_string(), Timestamp::new(1));
        book.record_sent(addr("a"), "2".to_string(), Timestamp::new(2));
        book.record_sent(addr("b"), "3".to_string(), Timestamp::new(3));

        assert_eq!(book.clear_history(&addr("a")), 2);
        assert!(book.history(&addr("a")).is_empty());
        assert_eq!(book.history(&addr("b")).len(), 1);
    }
}
