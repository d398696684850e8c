//! Conversation-Scoped Message Store
//!
//! Single source of truth for every message the client knows about. Messages
//! live in per-conversation sequences and are indexed by server id and by
//! client correlation id so that acknowledgments, pushed events and history
//! backfill all merge into the same row.
//!
//! Every mutation records a [`StoreChange`] that dependent views (the
//! conversation index, the UI) drain after each input.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MessageStoreConfig;
use crate::errors::{Result, StoreError};
use crate::protocol::message::{
    ConfirmedMessage, DeliveryState, LastMessage, Message, MessageContent, OutgoingMessage,
    ReadMark,
};
use crate::types::{ConversationId, CorrelationId, MessageId, SystemTimeSource, TimeSource, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Correlation Ids
// ----------------------------------------------------------------------------

/// Generates client correlation ids that are never reused
///
/// Format: `<millis>-<counter>-<random>`. The counter keeps ids unique within a
/// millisecond; the random suffix keeps them unique across app restarts.
#[derive(Debug, Default)]
pub struct CorrelationIdGenerator {
    counter: u64,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, now: Timestamp) -> CorrelationId {
        self.counter = self.counter.wrapping_add(1);
        let random = uuid::Uuid::new_v4().simple().to_string();
        CorrelationId::new(format!(
            "{}-{}-{}",
            now.as_millis(),
            self.counter,
            &random[..8]
        ))
    }
}

// ----------------------------------------------------------------------------
// Store Records
// ----------------------------------------------------------------------------

/// A message together with its insertion sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Monotonic insertion order, used as the ordering tie-break
    pub sequence: u64,
    pub message: Message,
}

/// How a confirmed message was merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// An optimistic entry was upgraded in place
    Replaced,
    /// The message was already known; nothing changed
    Duplicate,
    /// No local counterpart existed; appended as a new row
    Appended,
}

/// Result of recording a read receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Read mark added and the message moved to `Read`
    Transitioned,
    /// Read mark added without a state change
    Recorded,
    /// The reader was already recorded
    AlreadyRecorded,
    /// The sender acknowledged their own message
    IgnoredSelfReceipt,
    /// No message with that id is stored
    UnknownMessage,
}

/// Mutation notice consumed by dependent views
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Inserted {
        message: Message,
    },
    Replaced {
        message: Message,
        latest: Option<LastMessage>,
    },
    StateChanged {
        message: Message,
        previous: DeliveryState,
    },
    Read {
        message: Message,
        previous: DeliveryState,
    },
    AllRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    Cleared {
        conversation_id: ConversationId,
    },
    Discarded {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
        latest: Option<LastMessage>,
    },
}

impl StoreChange {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            StoreChange::Inserted { message }
            | StoreChange::Replaced { message, .. }
            | StoreChange::StateChanged { message, .. }
            | StoreChange::Read { message, .. } => &message.conversation_id,
            StoreChange::AllRead { conversation_id, .. }
            | StoreChange::Cleared { conversation_id }
            | StoreChange::Discarded {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// The message this change produced, if it concerns a single message
    pub fn message(&self) -> Option<&Message> {
        match self {
            StoreChange::Inserted { message }
            | StoreChange::Replaced { message, .. }
            | StoreChange::StateChanged { message, .. }
            | StoreChange::Read { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStoreStats {
    pub total_messages: usize,
    pub conversations: usize,
    pub optimistic_inserts: u64,
    pub reconciliations: u64,
    pub duplicates_absorbed: u64,
    pub failures: u64,
}

// ----------------------------------------------------------------------------
// Message Store Implementation
// ----------------------------------------------------------------------------

/// Conversation-scoped message store
#[derive(Debug)]
pub struct MessageStore<T: TimeSource = SystemTimeSource> {
    /// Messages per conversation in insertion order
    conversations: HashMap<ConversationId, Vec<StoredMessage>>,
    /// Server id → owning conversation
    id_index: HashMap<MessageId, ConversationId>,
    /// Correlation id → owning conversation
    correlation_index: HashMap<CorrelationId, ConversationId>,
    correlation_ids: CorrelationIdGenerator,
    next_sequence: u64,
    pending_changes: Vec<StoreChange>,
    config: MessageStoreConfig,
    stats: MessageStoreStats,
    time_source: T,
}

impl MessageStore<SystemTimeSource> {
    /// Create new empty store with default configuration and the wall clock
    pub fn new() -> Self {
        Self::with_config(MessageStoreConfig::default(), SystemTimeSource)
    }
}

impl Default for MessageStore<SystemTimeSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeSource> MessageStore<T> {
    /// Create new empty store with specified configuration and clock
    pub fn with_config(config: MessageStoreConfig, time_source: T) -> Self {
        Self {
            conversations: HashMap::new(),
            id_index: HashMap::new(),
            correlation_index: HashMap::new(),
            correlation_ids: CorrelationIdGenerator::new(),
            next_sequence: 0,
            pending_changes: Vec::new(),
            config,
            stats: MessageStoreStats::default(),
            time_source,
        }
    }

    pub fn config(&self) -> &MessageStoreConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Validate outgoing content against configuration limits
    fn validate_content(&self, content: &MessageContent) -> Result<()> {
        match content {
            MessageContent::Text { text } => {
                if text.trim().is_empty() {
                    return Err(StoreError::EmptyContent.into());
                }
            }
            MessageContent::Image { url, .. } | MessageContent::File { url, .. } => {
                if url.trim().is_empty() {
                    return Err(StoreError::InvalidContent {
                        reason: "attachment url is empty".to_string(),
                    }
                    .into());
                }
            }
        }

        let Some(body) = content.body() else {
            return Ok(());
        };

        if body.chars().count() > self.config.max_content_length {
            return Err(StoreError::ContentTooLong {
                max: self.config.max_content_length,
            }
            .into());
        }

        if self.config.strict_content_validation {
            if body.contains('\0') {
                return Err(StoreError::InvalidContent {
                    reason: "null bytes".to_string(),
                }
                .into());
            }
            if body
                .chars()
                .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
            {
                return Err(StoreError::InvalidContent {
                    reason: "control characters".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internal Lookup Helpers
    // ------------------------------------------------------------------------

    fn allocate_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn push_row(&mut self, message: Message) {
        let sequence = self.allocate_sequence();
        if let Some(id) = &message.id {
            self.id_index
                .insert(id.clone(), message.conversation_id.clone());
        }
        if let Some(correlation_id) = &message.correlation_id {
            self.correlation_index
                .insert(correlation_id.clone(), message.conversation_id.clone());
        }
        self.conversations
            .entry(message.conversation_id.clone())
            .or_default()
            .push(StoredMessage { sequence, message });
        self.refresh_counts();
    }

    fn refresh_counts(&mut self) {
        self.stats.total_messages = self.conversations.values().map(Vec::len).sum();
        self.stats.conversations = self.conversations.len();
    }

    fn locate_by_id(&self, message_id: &MessageId) -> Option<(ConversationId, usize)> {
        let conversation_id = self.id_index.get(message_id)?;
        let position = self
            .conversations
            .get(conversation_id)?
            .iter()
            .position(|row| row.message.id.as_ref() == Some(message_id))?;
        Some((conversation_id.clone(), position))
    }

    fn locate_by_correlation(
        &self,
        conversation_id: &ConversationId,
        correlation_id: &CorrelationId,
    ) -> Option<usize> {
        self.conversations
            .get(conversation_id)?
            .iter()
            .position(|row| row.message.correlation_id.as_ref() == Some(correlation_id))
    }

    fn row_mut(&mut self, conversation_id: &ConversationId, position: usize) -> Option<&mut Message> {
        self.conversations
            .get_mut(conversation_id)
            .and_then(|rows| rows.get_mut(position))
            .map(|row| &mut row.message)
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Insert a locally-originated message ahead of server confirmation
    pub fn insert_optimistic(
        &mut self,
        conversation_id: ConversationId,
        outgoing: OutgoingMessage,
    ) -> Result<Message> {
        self.validate_content(&outgoing.content)?;

        let now = self.time_source.now();
        let correlation_id = self.correlation_ids.next(now);
        let message = Message {
            id: None,
            correlation_id: Some(correlation_id),
            conversation_id,
            sender_id: outgoing.sender_id,
            recipient_id: outgoing.recipient_id,
            content: outgoing.content,
            created_at: now,
            delivery_state: DeliveryState::Pending,
            read_by: Vec::new(),
            metadata: outgoing.metadata,
        };

        self.push_row(message.clone());
        self.stats.optimistic_inserts += 1;
        self.pending_changes.push(StoreChange::Inserted {
            message: message.clone(),
        });

        debug!(
            conversation_id = %message.conversation_id,
            correlation_id = ?message.correlation_id,
            "Inserted optimistic message"
        );
        Ok(message)
    }

    /// Merge a server-confirmed message
    ///
    /// An unconfirmed entry in the same conversation with the same correlation
    /// id is upgraded in place. Otherwise a known id is a no-op, and anything
    /// else is appended as a new row.
    pub fn reconcile_confirmed(&mut self, confirmed: ConfirmedMessage) -> Result<ReconcileOutcome> {
        if confirmed.conversation_id.as_str().is_empty() {
            return Err(StoreError::UnknownConversation {
                conversation_id: confirmed.conversation_id,
            }
            .into());
        }

        let conversation_id = confirmed.conversation_id.clone();
        let optimistic = confirmed.correlation_id.as_ref().and_then(|correlation_id| {
            self.locate_by_correlation(&conversation_id, correlation_id)
                .filter(|&position| {
                    self.conversations[&conversation_id][position]
                        .message
                        .id
                        .is_none()
                })
        });
        let already_known = self.id_index.contains_key(&confirmed.id);

        match (optimistic, already_known) {
            (Some(position), false) => {
                let state = self.confirmed_state(&confirmed);
                let Some(row) = self.row_mut(&conversation_id, position) else {
                    return Ok(ReconcileOutcome::Duplicate);
                };
                row.id = Some(confirmed.id.clone());
                if let Some(created_at) = confirmed.created_at {
                    row.created_at = created_at;
                }
                row.delivery_state = state;
                row.content = confirmed.content;
                for mark in confirmed.read_by {
                    if !row.is_read_by(&mark.user_id) {
                        row.read_by.push(mark);
                    }
                }
                if confirmed.metadata.is_some() {
                    row.metadata = confirmed.metadata;
                }
                let message = row.clone();

                self.id_index.insert(confirmed.id, conversation_id.clone());
                self.stats.reconciliations += 1;
                let latest = self.latest_summary(&conversation_id);
                self.pending_changes
                    .push(StoreChange::Replaced { message, latest });

                debug!(conversation_id = %conversation_id, "Reconciled optimistic message");
                Ok(ReconcileOutcome::Replaced)
            }
            (Some(position), true) => {
                // The confirmed row arrived first (e.g. via backfill); fold the
                // optimistic twin into it.
                if let Some(rows) = self.conversations.get_mut(&conversation_id) {
                    let removed = rows.remove(position);
                    if let Some(correlation_id) = &removed.message.correlation_id {
                        self.correlation_index.remove(correlation_id);
                    }
                }
                self.refresh_counts();
                self.stats.reconciliations += 1;

                let message = self
                    .get_message(&confirmed.id)
                    .cloned()
                    .ok_or(StoreError::MessageNotFound {
                        message_id: confirmed.id,
                    })?;
                let latest = self.latest_summary(&conversation_id);
                self.pending_changes
                    .push(StoreChange::Replaced { message, latest });
                Ok(ReconcileOutcome::Replaced)
            }
            (None, true) => {
                self.stats.duplicates_absorbed += 1;
                debug!(message_id = %confirmed.id, "Absorbed duplicate confirmation");
                Ok(ReconcileOutcome::Duplicate)
            }
            (None, false) => {
                let state = confirmed
                    .delivery_state
                    .unwrap_or_else(|| self.config.confirmation_level.delivery_state());
                let message = Message {
                    id: Some(confirmed.id),
                    correlation_id: confirmed.correlation_id,
                    conversation_id: confirmed.conversation_id,
                    sender_id: confirmed.sender_id,
                    recipient_id: confirmed.recipient_id,
                    content: confirmed.content,
                    created_at: confirmed
                        .created_at
                        .unwrap_or_else(|| self.time_source.now()),
                    delivery_state: state,
                    read_by: confirmed.read_by,
                    metadata: confirmed.metadata,
                };
                self.push_row(message.clone());
                self.pending_changes.push(StoreChange::Inserted { message });
                Ok(ReconcileOutcome::Appended)
            }
        }
    }

    /// State a confirmed optimistic entry lands in
    fn confirmed_state(&self, confirmed: &ConfirmedMessage) -> DeliveryState {
        let base = self.config.confirmation_level.delivery_state();
        confirmed
            .delivery_state
            .and_then(|server_state| base.advance(server_state))
            .filter(|state| state.is_confirmed())
            .unwrap_or(base)
    }

    /// Move a pending optimistic message to `Failed`
    ///
    /// Returns `Ok(false)` when the message already moved past `Pending`.
    pub fn mark_failed(&mut self, correlation_id: &CorrelationId) -> Result<bool> {
        let Some(conversation_id) = self.correlation_index.get(correlation_id).cloned() else {
            return Err(StoreError::UnknownCorrelation {
                correlation_id: correlation_id.clone(),
            }
            .into());
        };
        let Some(position) = self.locate_by_correlation(&conversation_id, correlation_id) else {
            return Err(StoreError::UnknownCorrelation {
                correlation_id: correlation_id.clone(),
            }
            .into());
        };
        let Some(row) = self.row_mut(&conversation_id, position) else {
            return Ok(false);
        };

        if row.id.is_some() || row.delivery_state != DeliveryState::Pending {
            debug!(%correlation_id, state = %row.delivery_state, "Ignoring failure for settled message");
            return Ok(false);
        }

        let previous = row.delivery_state;
        row.delivery_state = DeliveryState::Failed;
        let message = row.clone();
        self.stats.failures += 1;
        self.pending_changes
            .push(StoreChange::StateChanged { message, previous });

        warn!(%correlation_id, "Message send failed");
        Ok(true)
    }

    /// Record that `reader_id` read a message
    pub fn mark_read(
        &mut self,
        message_id: &MessageId,
        reader_id: &UserId,
        read_at: Timestamp,
    ) -> ReadOutcome {
        let Some((conversation_id, position)) = self.locate_by_id(message_id) else {
            return ReadOutcome::UnknownMessage;
        };
        let Some(row) = self.row_mut(&conversation_id, position) else {
            return ReadOutcome::UnknownMessage;
        };

        if row.is_authored_by(reader_id) {
            return ReadOutcome::IgnoredSelfReceipt;
        }
        if row.is_read_by(reader_id) {
            return ReadOutcome::AlreadyRecorded;
        }

        row.read_by.push(ReadMark {
            user_id: reader_id.clone(),
            read_at,
        });

        let previous = row.delivery_state;
        let transitioned = if &row.recipient_id == reader_id {
            match previous.advance(DeliveryState::Read) {
                Some(next) => {
                    row.delivery_state = next;
                    true
                }
                None => false,
            }
        } else {
            false
        };

        let message = row.clone();
        self.pending_changes
            .push(StoreChange::Read { message, previous });

        if transitioned {
            ReadOutcome::Transitioned
        } else {
            ReadOutcome::Recorded
        }
    }

    /// Mark every unread message addressed to `reader_id` as read
    ///
    /// Returns the ids of messages that transitioned.
    pub fn mark_all_read(
        &mut self,
        conversation_id: &ConversationId,
        reader_id: &UserId,
        read_at: Timestamp,
    ) -> Vec<MessageId> {
        let Some(rows) = self.conversations.get_mut(conversation_id) else {
            return Vec::new();
        };

        let mut newly_read = Vec::new();
        for row in rows.iter_mut() {
            let message = &mut row.message;
            if message.is_authored_by(reader_id) || &message.recipient_id != reader_id {
                continue;
            }
            let Some(next) = message.delivery_state.advance(DeliveryState::Read) else {
                continue;
            };
            message.delivery_state = next;
            if !message.is_read_by(reader_id) {
                message.read_by.push(ReadMark {
                    user_id: reader_id.clone(),
                    read_at,
                });
            }
            if let Some(id) = &message.id {
                newly_read.push(id.clone());
            }
        }

        self.pending_changes.push(StoreChange::AllRead {
            conversation_id: conversation_id.clone(),
            message_ids: newly_read.clone(),
        });
        newly_read
    }

    /// Advance a message's delivery state; backward moves are absorbed
    pub fn apply_delivery_state(&mut self, message_id: &MessageId, state: DeliveryState) -> bool {
        let Some((conversation_id, position)) = self.locate_by_id(message_id) else {
            return false;
        };
        let Some(row) = self.row_mut(&conversation_id, position) else {
            return false;
        };
        let previous = row.delivery_state;
        let Some(next) = previous.advance(state) else {
            debug!(%message_id, from = %previous, to = %state, "Ignoring stale delivery state");
            return false;
        };

        row.delivery_state = next;
        let message = row.clone();
        self.pending_changes
            .push(StoreChange::StateChanged { message, previous });
        true
    }

    /// Remove every message of a conversation
    pub fn clear_conversation(&mut self, conversation_id: &ConversationId) -> usize {
        let Some(rows) = self.conversations.remove(conversation_id) else {
            return 0;
        };
        for row in &rows {
            if let Some(id) = &row.message.id {
                self.id_index.remove(id);
            }
            if let Some(correlation_id) = &row.message.correlation_id {
                self.correlation_index.remove(correlation_id);
            }
        }
        self.refresh_counts();
        self.pending_changes.push(StoreChange::Cleared {
            conversation_id: conversation_id.clone(),
        });
        rows.len()
    }

    /// Remove a failed message that the server never confirmed
    pub fn discard_failed(&mut self, correlation_id: &CorrelationId) -> Result<Message> {
        let unknown = || StoreError::UnknownCorrelation {
            correlation_id: correlation_id.clone(),
        };
        let conversation_id = self
            .correlation_index
            .get(correlation_id)
            .cloned()
            .ok_or_else(unknown)?;
        let position = self
            .locate_by_correlation(&conversation_id, correlation_id)
            .ok_or_else(unknown)?;

        let rows = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(unknown)?;
        let row = &rows[position].message;
        if row.id.is_some() || row.delivery_state != DeliveryState::Failed {
            return Err(StoreError::NotFailed {
                correlation_id: correlation_id.clone(),
            }
            .into());
        }

        let removed = rows.remove(position).message;
        self.correlation_index.remove(correlation_id);
        self.refresh_counts();

        let latest = self.latest_summary(&conversation_id);
        self.pending_changes.push(StoreChange::Discarded {
            conversation_id,
            correlation_id: correlation_id.clone(),
            latest,
        });
        Ok(removed)
    }

    /// Take the changes recorded since the last drain
    pub fn drain_changes(&mut self) -> Vec<StoreChange> {
        core::mem::take(&mut self.pending_changes)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Messages of a conversation ordered by `created_at`, then insertion order
    pub fn get_ordered(&self, conversation_id: &ConversationId) -> Vec<&Message> {
        let Some(rows) = self.conversations.get(conversation_id) else {
            return Vec::new();
        };
        let mut ordered: Vec<&StoredMessage> = rows.iter().collect();
        ordered.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        ordered.into_iter().map(|row| &row.message).collect()
    }

    /// Rows of a conversation in raw insertion order
    pub fn messages(&self, conversation_id: &ConversationId) -> &[StoredMessage] {
        self.conversations
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get_message(&self, message_id: &MessageId) -> Option<&Message> {
        let (conversation_id, position) = self.locate_by_id(message_id)?;
        self.conversations
            .get(&conversation_id)
            .and_then(|rows| rows.get(position))
            .map(|row| &row.message)
    }

    pub fn find_by_correlation(&self, correlation_id: &CorrelationId) -> Option<&Message> {
        let conversation_id = self.correlation_index.get(correlation_id)?;
        let position = self.locate_by_correlation(conversation_id, correlation_id)?;
        self.conversations
            .get(conversation_id)
            .and_then(|rows| rows.get(position))
            .map(|row| &row.message)
    }

    /// Preview of the newest message (latest `created_at`, then latest insert)
    pub fn latest_summary(&self, conversation_id: &ConversationId) -> Option<LastMessage> {
        self.conversations
            .get(conversation_id)?
            .iter()
            .max_by(|a, b| {
                a.message
                    .created_at
                    .cmp(&b.message.created_at)
                    .then(a.sequence.cmp(&b.sequence))
            })
            .map(|row| LastMessage::from(&row.message))
    }

    /// Messages from the other participant that `self_id` has not read
    pub fn unread_peer_messages(
        &self,
        conversation_id: &ConversationId,
        self_id: &UserId,
    ) -> Vec<&Message> {
        self.messages(conversation_id)
            .iter()
            .map(|row| &row.message)
            .filter(|message| message.is_unread_for(self_id))
            .collect()
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &ConversationId> {
        self.conversations.keys()
    }

    pub fn conversation_message_count(&self, conversation_id: &ConversationId) -> usize {
        self.messages(conversation_id).len()
    }

    pub fn message_count(&self) -> usize {
        self.stats.total_messages
    }

    pub fn contains_message(&self, message_id: &MessageId) -> bool {
        self.id_index.contains_key(message_id)
    }

    pub fn stats(&self) -> &MessageStoreStats {
        &self.stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfirmationLevel;
    use core::cell::Cell;

    struct StepClock(Cell<u64>);

    impl TimeSource for StepClock {
        fn now(&self) -> Timestamp {
            let now = self.0.get();
            self.0.set(now + 10);
            Timestamp::new(now)
        }
    }

    fn store() -> MessageStore<StepClock> {
        MessageStore::with_config(MessageStoreConfig::testing(), StepClock(Cell::new(1_000)))
    }

    fn conv() -> ConversationId {
        ConversationId::new("c1")
    }

    fn outgoing(text: &str) -> OutgoingMessage {
        OutgoingMessage::new(UserId::new("me"), UserId::new("peer"), MessageContent::text(text))
    }

    fn confirmed(id: &str, correlation: Option<&CorrelationId>, at: u64) -> ConfirmedMessage {
        ConfirmedMessage {
            id: MessageId::new(id),
            correlation_id: correlation.cloned(),
            conversation_id: conv(),
            sender_id: UserId::new("me"),
            recipient_id: UserId::new("peer"),
            content: MessageContent::text("hello"),
            created_at: Some(Timestamp::new(at)),
            delivery_state: None,
            read_by: Vec::new(),
            metadata: None,
        }
    }

    fn inbound(id: &str, at: u64) -> ConfirmedMessage {
        ConfirmedMessage {
            sender_id: UserId::new("peer"),
            recipient_id: UserId::new("me"),
            ..confirmed(id, None, at)
        }
    }

    #[test]
    fn test_optimistic_insert_is_pending() {
        let mut store = store();
        let message = store.insert_optimistic(conv(), outgoing("hello")).unwrap();

        assert!(message.id.is_none());
        assert!(message.correlation_id.is_some());
        assert_eq!(message.delivery_state, DeliveryState::Pending);
        assert_eq!(store.message_count(), 1);
        assert_eq!(store.drain_changes().len(), 1);
        assert!(store.drain_changes().is_empty());
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let mut store = store();
        let a = store.insert_optimistic(conv(), outgoing("a")).unwrap();
        let b = store.insert_optimistic(conv(), outgoing("b")).unwrap();
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn test_content_validation() {
        let mut store = store();
        assert!(matches!(
            store.insert_optimistic(conv(), outgoing("   ")),
            Err(crate::CourierError::Store(StoreError::EmptyContent))
        ));
        assert!(matches!(
            store.insert_optimistic(conv(), outgoing("bad\u{0007}bell")),
            Err(crate::CourierError::Store(StoreError::InvalidContent { .. }))
        ));
        let long = "x".repeat(513);
        assert!(matches!(
            store.insert_optimistic(conv(), outgoing(&long)),
            Err(crate::CourierError::Store(StoreError::ContentTooLong { max: 512 }))
        ));
        assert_eq!(store.message_count(), 0);
    }

    #[test]
    fn test_reconcile_replaces_in_place() {
        let mut store = store();
        let first = store.insert_optimistic(conv(), outgoing("first")).unwrap();
        store.insert_optimistic(conv(), outgoing("second")).unwrap();

        let outcome = store
            .reconcile_confirmed(confirmed("m1", first.correlation_id.as_ref(), 5_000))
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Replaced);

        let rows = store.messages(&conv());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message.id, Some(MessageId::new("m1")));
        assert_eq!(rows[0].message.delivery_state, DeliveryState::Delivered);
        assert_eq!(rows[0].message.created_at, Timestamp::new(5_000));
        assert_eq!(store.stats().reconciliations, 1);
    }

    #[test]
    fn test_reconcile_twice_is_duplicate() {
        let mut store = store();
        let sent = store.insert_optimistic(conv(), outgoing("hi")).unwrap();
        let ack = confirmed("m1", sent.correlation_id.as_ref(), 2_000);

        assert_eq!(
            store.reconcile_confirmed(ack.clone()).unwrap(),
            ReconcileOutcome::Replaced
        );
        assert_eq!(
            store.reconcile_confirmed(ack).unwrap(),
            ReconcileOutcome::Duplicate
        );
        assert_eq!(store.message_count(), 1);
        assert_eq!(store.stats().duplicates_absorbed, 1);
    }

    #[test]
    fn test_confirmation_level_sent() {
        let config = MessageStoreConfig {
            confirmation_level: ConfirmationLevel::Sent,
            ..MessageStoreConfig::testing()
        };
        let mut store = MessageStore::with_config(config, StepClock(Cell::new(0)));
        let sent = store.insert_optimistic(conv(), outgoing("hi")).unwrap();
        store
            .reconcile_confirmed(confirmed("m1", sent.correlation_id.as_ref(), 20))
            .unwrap();
        assert_eq!(
            store.get_message(&MessageId::new("m1")).unwrap().delivery_state,
            DeliveryState::Sent
        );
    }

    #[test]
    fn test_backfilled_row_absorbs_optimistic_twin() {
        let mut store = store();
        let sent = store.insert_optimistic(conv(), outgoing("hi")).unwrap();
        // Backfill arrives without the correlation id
        store.reconcile_confirmed(confirmed("m1", None, 2_000)).unwrap();
        assert_eq!(store.message_count(), 2);

        let outcome = store
            .reconcile_confirmed(confirmed("m1", sent.correlation_id.as_ref(), 2_000))
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Replaced);
        assert_eq!(store.message_count(), 1);
        assert!(store
            .find_by_correlation(sent.correlation_id.as_ref().unwrap())
            .is_none());
    }

    #[test]
    fn test_mark_failed_and_discard() {
        let mut store = store();
        let sent = store.insert_optimistic(conv(), outgoing("hi")).unwrap();
        let correlation_id = sent.correlation_id.unwrap();

        assert!(store.mark_failed(&correlation_id).unwrap());
        assert!(!store.mark_failed(&correlation_id).unwrap());
        assert_eq!(
            store.find_by_correlation(&correlation_id).unwrap().delivery_state,
            DeliveryState::Failed
        );

        let removed = store.discard_failed(&correlation_id).unwrap();
        assert_eq!(removed.delivery_state, DeliveryState::Failed);
        assert_eq!(store.message_count(), 0);
        assert!(store.discard_failed(&correlation_id).is_err());
    }

    #[test]
    fn test_discard_rejects_pending() {
        let mut store = store();
        let sent = store.insert_optimistic(conv(), outgoing("hi")).unwrap();
        assert!(matches!(
            store.discard_failed(sent.correlation_id.as_ref().unwrap()),
            Err(crate::CourierError::Store(StoreError::NotFailed { .. }))
        ));
    }

    #[test]
    fn test_mark_failed_unknown_correlation() {
        let mut store = store();
        assert!(store.mark_failed(&CorrelationId::new("nope")).is_err());
    }

    #[test]
    fn test_mark_read_semantics() {
        let mut store = store();
        let sent = store.insert_optimistic(conv(), outgoing("hi")).unwrap();
        store
            .reconcile_confirmed(confirmed("m1", sent.correlation_id.as_ref(), 100))
            .unwrap();
        let id = MessageId::new("m1");

        // Sender's own receipt is ignored
        assert_eq!(
            store.mark_read(&id, &UserId::new("me"), Timestamp::new(200)),
            ReadOutcome::IgnoredSelfReceipt
        );
        assert_eq!(
            store.mark_read(&id, &UserId::new("peer"), Timestamp::new(200)),
            ReadOutcome::Transitioned
        );
        assert_eq!(
            store.mark_read(&id, &UserId::new("peer"), Timestamp::new(300)),
            ReadOutcome::AlreadyRecorded
        );
        let message = store.get_message(&id).unwrap();
        assert_eq!(message.delivery_state, DeliveryState::Read);
        assert_eq!(message.read_by.len(), 1);

        assert_eq!(
            store.mark_read(&MessageId::new("missing"), &UserId::new("peer"), Timestamp::new(1)),
            ReadOutcome::UnknownMessage
        );
    }

    #[test]
    fn test_delivery_state_is_monotonic() {
        let mut store = store();
        store.reconcile_confirmed(inbound("m1", 100)).unwrap();
        let id = MessageId::new("m1");
        store.mark_read(&id, &UserId::new("me"), Timestamp::new(150));

        assert!(!store.apply_delivery_state(&id, DeliveryState::Delivered));
        assert_eq!(store.get_message(&id).unwrap().delivery_state, DeliveryState::Read);
    }

    #[test]
    fn test_get_ordered_uses_sequence_tie_break() {
        let mut store = store();
        store.reconcile_confirmed(inbound("b", 500)).unwrap();
        store.reconcile_confirmed(inbound("a", 500)).unwrap();
        store.reconcile_confirmed(inbound("c", 100)).unwrap();

        let ids: Vec<_> = store
            .get_ordered(&conv())
            .iter()
            .map(|m| m.id.clone().unwrap().into_inner())
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert!(store.get_ordered(&ConversationId::new("missing")).is_empty());
    }

    #[test]
    fn test_mark_all_read_and_clear() {
        let mut store = store();
        store.reconcile_confirmed(inbound("m1", 100)).unwrap();
        store.reconcile_confirmed(inbound("m2", 200)).unwrap();
        store.insert_optimistic(conv(), outgoing("mine")).unwrap();

        assert_eq!(store.unread_peer_messages(&conv(), &UserId::new("me")).len(), 2);
        let read = store.mark_all_read(&conv(), &UserId::new("me"), Timestamp::new(300));
        assert_eq!(read.len(), 2);
        assert!(store.unread_peer_messages(&conv(), &UserId::new("me")).is_empty());
        assert!(store
            .mark_all_read(&conv(), &UserId::new("me"), Timestamp::new(400))
            .is_empty());

        assert_eq!(store.clear_conversation(&conv()), 3);
        assert_eq!(store.message_count(), 0);
        assert!(!store.contains_message(&MessageId::new("m1")));
    }

    #[test]
    fn test_latest_summary_tracks_max_created_at() {
        let mut store = store();
        store.reconcile_confirmed(inbound("late", 900)).unwrap();
        store.reconcile_confirmed(inbound("early", 100)).unwrap();
        let latest = store.latest_summary(&conv()).unwrap();
        assert_eq!(latest.timestamp, Timestamp::new(900));
    }
}
