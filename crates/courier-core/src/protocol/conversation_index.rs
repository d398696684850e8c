//! Conversation Index
//!
//! Denormalized per-conversation summaries (last message preview, unread
//! count, peer presence) kept in step with the message store by applying the
//! [`StoreChange`]s it records.

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::protocol::message::{DeliveryState, LastMessage, Message};
use crate::protocol::message_store::StoreChange;
use crate::types::{ConnectivityMode, ConversationId, UserId};

// ----------------------------------------------------------------------------
// Summary Types
// ----------------------------------------------------------------------------

/// List-row view of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    /// Both participants, self included
    pub participant_ids: Vec<UserId>,
    pub last_message: Option<LastMessage>,
    /// Peer-authored messages not yet read by self
    pub unread_count: usize,
    pub peer_online: bool,
    pub peer_connection_mode: ConnectivityMode,
}

impl ConversationSummary {
    pub fn new(id: ConversationId, participant_ids: Vec<UserId>) -> Self {
        Self {
            id,
            participant_ids,
            last_message: None,
            unread_count: 0,
            peer_online: false,
            peer_connection_mode: ConnectivityMode::Online,
        }
    }

    /// The participant that is not `self_id`
    pub fn peer_id(&self, self_id: &UserId) -> Option<&UserId> {
        self.participant_ids.iter().find(|id| *id != self_id)
    }

    pub fn involves(&self, user_id: &UserId) -> bool {
        self.participant_ids.contains(user_id)
    }
}

/// Conversation metadata fetched from the history service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: usize,
}

// ----------------------------------------------------------------------------
// Conversation Index
// ----------------------------------------------------------------------------

/// Index of conversation summaries for the signed-in user
///
/// Presence and connectivity mode are remembered here as well, so a summary
/// created after a `user-online` or a mode switch starts out in step with them.
#[derive(Debug, Clone)]
pub struct ConversationIndex {
    self_id: UserId,
    conversations: HashMap<ConversationId, ConversationSummary>,
    online_peers: HashSet<UserId>,
    mode: ConnectivityMode,
}

impl ConversationIndex {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            conversations: HashMap::new(),
            online_peers: HashSet::new(),
            mode: ConnectivityMode::Online,
        }
    }

    /// Fresh summary seeded with the current presence and mode
    fn seeded_summary(
        self_id: &UserId,
        online_peers: &HashSet<UserId>,
        mode: ConnectivityMode,
        id: ConversationId,
        participant_ids: Vec<UserId>,
    ) -> ConversationSummary {
        let mut summary = ConversationSummary::new(id, participant_ids);
        summary.peer_online = summary
            .peer_id(self_id)
            .map_or(false, |peer| online_peers.contains(peer));
        summary.peer_connection_mode = mode;
        summary
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    fn entry_for(&mut self, message: &Message) -> &mut ConversationSummary {
        let Self {
            self_id,
            conversations,
            online_peers,
            mode,
        } = self;
        conversations
            .entry(message.conversation_id.clone())
            .or_insert_with(|| {
                Self::seeded_summary(
                    self_id,
                    online_peers,
                    *mode,
                    message.conversation_id.clone(),
                    vec![message.sender_id.clone(), message.recipient_id.clone()],
                )
            })
    }

    /// Bring summaries in line with one store mutation
    pub fn apply(&mut self, change: &StoreChange) {
        let self_id = self.self_id.clone();

        match change {
            StoreChange::Inserted { message } => {
                let summary = self.entry_for(message);
                let newer = summary
                    .last_message
                    .as_ref()
                    .map_or(true, |last| message.created_at >= last.timestamp);
                if newer {
                    summary.last_message = Some(LastMessage::from(message));
                }
                if message.is_unread_for(&self_id) {
                    summary.unread_count += 1;
                }
            }
            StoreChange::Replaced { message, latest } => {
                let summary = self.entry_for(message);
                summary.last_message = latest.clone();
            }
            StoreChange::StateChanged { message, previous }
            | StoreChange::Read { message, previous } => {
                let became_read = *previous != DeliveryState::Read
                    && message.delivery_state == DeliveryState::Read;
                if became_read && !message.is_authored_by(&self_id) {
                    let summary = self.entry_for(message);
                    summary.unread_count = summary.unread_count.saturating_sub(1);
                }
            }
            StoreChange::AllRead {
                conversation_id, ..
            } => {
                if let Some(summary) = self.conversations.get_mut(conversation_id) {
                    summary.unread_count = 0;
                }
            }
            StoreChange::Cleared { conversation_id } => {
                if let Some(summary) = self.conversations.get_mut(conversation_id) {
                    summary.last_message = None;
                    summary.unread_count = 0;
                }
            }
            StoreChange::Discarded {
                conversation_id,
                latest,
                ..
            } => {
                if let Some(summary) = self.conversations.get_mut(conversation_id) {
                    summary.last_message = latest.clone();
                }
            }
        }
    }

    /// Merge a conversation fetched from the history service
    ///
    /// Unknown conversations are taken as-is. Known ones keep their local
    /// unread count and only move `last_message` forward.
    pub fn upsert_conversation(&mut self, record: ConversationRecord) {
        match self.conversations.get_mut(&record.id) {
            Some(summary) => {
                summary.participant_ids = record.participant_ids;
                let newer = match (&summary.last_message, &record.last_message) {
                    (None, Some(_)) => true,
                    (Some(current), Some(fetched)) => fetched.timestamp > current.timestamp,
                    _ => false,
                };
                if newer {
                    summary.last_message = record.last_message;
                }
            }
            None => {
                let mut summary = Self::seeded_summary(
                    &self.self_id,
                    &self.online_peers,
                    self.mode,
                    record.id.clone(),
                    record.participant_ids,
                );
                summary.last_message = record.last_message;
                summary.unread_count = record.unread_count;
                self.conversations.insert(record.id, summary);
            }
        }
    }

    /// Overwrite the unread count after a bulk reload of the conversation
    pub fn set_unread_count(&mut self, conversation_id: &ConversationId, unread_count: usize) {
        if let Some(summary) = self.conversations.get_mut(conversation_id) {
            summary.unread_count = unread_count;
        }
    }

    /// Update presence for every conversation with `user_id`
    ///
    /// Returns the conversations whose flag changed.
    pub fn set_peer_online(&mut self, user_id: &UserId, online: bool) -> Vec<ConversationId> {
        if online {
            self.online_peers.insert(user_id.clone());
        } else {
            self.online_peers.remove(user_id);
        }
        let self_id = &self.self_id;
        self.conversations
            .values_mut()
            .filter(|summary| summary.peer_id(self_id) == Some(user_id))
            .filter_map(|summary| {
                if summary.peer_online == online {
                    return None;
                }
                summary.peer_online = online;
                Some(summary.id.clone())
            })
            .collect()
    }

    /// Record which channel peers are reachable on, for existing and future conversations
    pub fn set_connection_mode(&mut self, mode: ConnectivityMode) {
        self.mode = mode;
        for summary in self.conversations.values_mut() {
            summary.peer_connection_mode = mode;
        }
    }

    /// Mark every peer offline, e.g. once the server connection is gone
    pub fn clear_presence(&mut self) {
        self.online_peers.clear();
        for summary in self.conversations.values_mut() {
            summary.peer_online = false;
        }
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&ConversationSummary> {
        self.conversations.get(conversation_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ConversationId> {
        self.conversations.keys()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn total_unread(&self) -> usize {
        self.conversations.values().map(|s| s.unread_count).sum()
    }

    /// Summaries ordered for the chat list
    ///
    /// Most recent first; conversations without messages last; ties broken by
    /// id so the order is deterministic.
    pub fn sorted_by_recent(&self) -> Vec<&ConversationSummary> {
        let mut sorted: Vec<&ConversationSummary> = self.conversations.values().collect();
        sorted.sort_by(|a, b| {
            let a_time = a.last_message.as_ref().map(|m| m.timestamp);
            let b_time = b.last_message.as_ref().map(|m| m.timestamp);
            // None < Some, so reversing puts empty conversations last
            b_time.cmp(&a_time).then_with(|| a.id.cmp(&b.id))
        });
        sorted
    }
}
