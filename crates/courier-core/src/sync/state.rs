//! Sync State and Snapshots
//!
//! `SyncState` bundles the store, the conversation index, the trackers, the
//! connection manager and the local peer book behind one owner.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::channel::{AppEvent, ConnectionStatus, Effect};
use crate::config::CourierConfig;
use crate::protocol::conversation_index::{ConversationIndex, ConversationSummary};
use crate::protocol::message::Message;
use crate::protocol::message_store::{MessageStore, StoreChange};
use crate::protocol::peer_session::{
    LocalPeerBook, LocalPeerMessage, LocalPeerSession, PersistedPeerBook,
};
use crate::protocol::presence::PresenceTracker;
use crate::protocol::receipts::ReceiptTracker;
use crate::protocol::reconciler::DeliveryReconciler;
use crate::protocol::ConnectionManager;
use crate::types::{
    ConnectivityMode, ConversationId, DeviceAddress, MessageId, SystemTimeSource, TimeSource,
    Timestamp, UserId,
};

// ----------------------------------------------------------------------------
// Handler Output
// ----------------------------------------------------------------------------

/// Effects for transport tasks and app events for the UI, in emission order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutput {
    pub effects: Vec<Effect>,
    pub app_events: Vec<AppEvent>,
}

impl SyncOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn app_event(&mut self, event: AppEvent) {
        self.app_events.push(event);
    }

    pub fn extend(&mut self, other: SyncOutput) {
        self.effects.extend(other.effects);
        self.app_events.extend(other.app_events);
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.app_events.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Immutable view published to UI consumers after every mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub self_id: UserId,
    pub mode: ConnectivityMode,
    pub connection: ConnectionStatus,
    pub can_send: bool,
    /// Chat list, most recent first
    pub conversations: Vec<ConversationSummary>,
    pub total_unread: usize,
    pub peer_sessions: Vec<LocalPeerSession>,
    pub discovering: bool,
}

impl SyncSnapshot {
    /// Snapshot of a client that has not processed anything yet
    pub fn empty(self_id: UserId) -> Self {
        Self {
            self_id,
            mode: ConnectivityMode::default(),
            connection: ConnectionStatus::Disconnected,
            can_send: false,
            conversations: Vec::new(),
            total_unread: 0,
            peer_sessions: Vec::new(),
            discovering: false,
        }
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&ConversationSummary> {
        self.conversations.iter().find(|c| &c.id == conversation_id)
    }
}

// ----------------------------------------------------------------------------
// Sync State
// ----------------------------------------------------------------------------

/// Client-side synchronization state owned by one task
#[derive(Debug)]
pub struct SyncState<T: TimeSource + Clone = SystemTimeSource> {
    pub(super) self_id: UserId,
    pub(super) config: CourierConfig,
    pub(super) mode: ConnectivityMode,
    pub(super) store: MessageStore<T>,
    pub(super) index: ConversationIndex,
    pub(super) reconciler: DeliveryReconciler,
    pub(super) presence: PresenceTracker,
    pub(super) receipts: ReceiptTracker,
    pub(super) connection: ConnectionManager<T>,
    pub(super) peers: LocalPeerBook,
    /// Conversations whose room the client wants joined
    pub(super) open_rooms: BTreeSet<ConversationId>,
    /// Messages read locally whose `mark-read` has not been emitted yet
    pub(super) unreported_reads: Vec<(MessageId, ConversationId)>,
    pub(super) time_source: T,
}

impl<T: TimeSource + Clone> SyncState<T> {
    pub fn new(self_id: UserId, config: CourierConfig, time_source: T) -> Self {
        let store = MessageStore::with_config(config.store.clone(), time_source.clone());
        let connection = ConnectionManager::new(config.connection.clone(), time_source.clone());
        Self {
            index: ConversationIndex::new(self_id.clone()),
            self_id,
            config,
            mode: ConnectivityMode::default(),
            store,
            reconciler: DeliveryReconciler::new(),
            presence: PresenceTracker::new(),
            receipts: ReceiptTracker::new(),
            connection,
            peers: LocalPeerBook::new(),
            open_rooms: BTreeSet::new(),
            unreported_reads: Vec::new(),
            time_source,
        }
    }

    /// Load persisted peer names and histories
    pub fn restore_peer_book(&mut self, persisted: PersistedPeerBook) {
        let mut peers = LocalPeerBook::restore(persisted);
        if self.mode == ConnectivityMode::OfflineLocal {
            peers.activate();
        }
        self.peers = peers;
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn mode(&self) -> ConnectivityMode {
        self.mode
    }

    pub fn store(&self) -> &MessageStore<T> {
        &self.store
    }

    pub fn index(&self) -> &ConversationIndex {
        &self.index
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn receipts(&self) -> &ReceiptTracker {
        &self.receipts
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn peers(&self) -> &LocalPeerBook {
        &self.peers
    }

    pub fn is_room_open(&self, conversation_id: &ConversationId) -> bool {
        self.open_rooms.contains(conversation_id)
    }

    // ------------------------------------------------------------------------
    // Selectors
    // ------------------------------------------------------------------------

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            self_id: self.self_id.clone(),
            mode: self.mode,
            connection: self.connection.status(),
            can_send: self.connection.can_send(),
            conversations: self
                .index
                .sorted_by_recent()
                .into_iter()
                .cloned()
                .collect(),
            total_unread: self.index.total_unread(),
            peer_sessions: self.peers.sessions().into_iter().cloned().collect(),
            discovering: self.peers.is_discovering(),
        }
    }

    /// Messages of one conversation in display order
    pub fn conversation_view(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.store
            .get_ordered(conversation_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn peer_history(&self, address: &DeviceAddress) -> &[LocalPeerMessage] {
        self.peers.history(address)
    }

    // ------------------------------------------------------------------------
    // Shared Helpers
    // ------------------------------------------------------------------------

    pub(super) fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    /// Fold pending store changes into the index and describe them to the UI
    pub(super) fn publish_store_changes(&mut self, out: &mut SyncOutput) {
        let changes = self.store.drain_changes();
        if changes.is_empty() {
            return;
        }

        for change in &changes {
            self.index.apply(change);
            match change {
                StoreChange::AllRead { message_ids, .. } => {
                    for message_id in message_ids {
                        if let Some(message) = self.store.get_message(message_id) {
                            out.app_event(AppEvent::MessageUpserted {
                                message: message.clone(),
                            });
                        }
                    }
                }
                StoreChange::Cleared { conversation_id } => {
                    out.app_event(AppEvent::ConversationCleared {
                        conversation_id: conversation_id.clone(),
                    });
                }
                StoreChange::Discarded {
                    conversation_id,
                    correlation_id,
                    ..
                } => {
                    out.app_event(AppEvent::MessageRemoved {
                        conversation_id: conversation_id.clone(),
                        correlation_id: correlation_id.clone(),
                    });
                }
                _ => {
                    if let Some(message) = change.message() {
                        out.app_event(AppEvent::MessageUpserted {
                            message: message.clone(),
                        });
                    }
                }
            }
        }
        out.app_event(AppEvent::ConversationListChanged);
    }

    /// Emit a connectivity notice when the visible status moved
    pub(super) fn publish_connectivity(
        &self,
        before: (ConnectionStatus, ConnectivityMode),
        out: &mut SyncOutput,
    ) {
        let status = self.connection.status();
        if before != (status, self.mode) {
            out.app_event(AppEvent::ConnectivityChanged {
                status,
                mode: self.mode,
                can_send: self.connection.can_send(),
            });
        }
    }

    pub(super) fn connectivity(&self) -> (ConnectionStatus, ConnectivityMode) {
        (self.connection.status(), self.mode)
    }

    /// Queue a persistence effect if the peer book changed
    pub(super) fn persist_peers(&mut self, out: &mut SyncOutput) {
        if self.peers.take_dirty() {
            out.effect(Effect::PersistPeerBook {
                key: self.config.peer.storage_key.clone(),
                book: self.peers.to_persisted(),
            });
        }
    }
}
