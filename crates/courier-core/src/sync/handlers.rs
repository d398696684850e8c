//! Sync Command and Event Handlers
//!
//! Contains the command and event handling logic driven by the sync engine.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::state::{SyncOutput, SyncState};
use crate::channel::{AppEvent, Command, Effect, Event, PeerEffect, PeerEvent, SendAck};
use crate::errors::{PeerChannelError, Result, StoreError};
use crate::protocol::connection_state::{ConnectionEffect, ConnectionEvent};
use crate::protocol::message::{DeliveryState, MessageContent, OutgoingMessage};
use crate::protocol::message_store::ReconcileOutcome;
use crate::protocol::reconciler::{ReconcileInput, ReconcileResult};
use crate::protocol::wire::{OutboundEvent, ServerEvent};
use crate::types::{
    ConnectivityMode, ConversationId, CorrelationId, DeviceAddress, TimeSource, UserId,
};

/// Upper bound on remembered outgoing read receipts
const MAX_TRACKED_RECEIPTS: usize = 10_000;

impl<T: TimeSource + Clone> SyncState<T> {
    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Handle one command from the UI
    ///
    /// Errors leave the state consistent; the engine reports them and keeps going.
    pub fn handle_command(&mut self, command: Command) -> Result<SyncOutput> {
        let mut out = SyncOutput::new();

        match command {
            Command::SendMessage {
                conversation_id,
                recipient_id,
                content,
                metadata,
            } => self.send_message(conversation_id, recipient_id, content, metadata, &mut out)?,
            Command::RetryMessage { correlation_id } => {
                self.retry_message(&correlation_id, &mut out)?
            }
            Command::DiscardMessage { correlation_id } => {
                self.store.discard_failed(&correlation_id)?;
                info!(%correlation_id, "Discarded failed message");
            }
            Command::OpenConversation { conversation_id } => {
                self.open_conversation(conversation_id, &mut out)
            }
            Command::CloseConversation { conversation_id } => {
                self.close_conversation(&conversation_id, &mut out)
            }
            Command::MarkConversationRead { conversation_id } => {
                self.mark_conversation_read(&conversation_id, &mut out)
            }
            Command::ClearHistory { conversation_id } => {
                let removed = self.store.clear_conversation(&conversation_id);
                self.unreported_reads
                    .retain(|(_, queued_in)| queued_in != &conversation_id);
                info!(%conversation_id, removed, "Cleared conversation history");
            }
            Command::SetReadReceipts { enabled } => {
                self.receipts.set_read_receipts_enabled(enabled);
                self.flush_unreported_reads(&mut out);
            }
            Command::SetMode { mode } => self.set_mode(mode, &mut out)?,
            Command::Connect => self.drive_connection(ConnectionEvent::Resume, &mut out)?,
            Command::Disconnect => self.drive_connection(ConnectionEvent::Disconnect, &mut out)?,
            Command::StartDiscovery => match self.peers.start_discovery() {
                Ok(()) => {
                    out.effect(Effect::Peer(PeerEffect::StartDiscovery));
                    out.app_event(AppEvent::DiscoveryStateChanged { active: true });
                }
                Err(e) => peer_alert(&mut out, None, e),
            },
            Command::StopDiscovery => self.stop_discovery(&mut out),
            Command::ConnectPeer { address } => match self.peers.begin_connect(&address) {
                Ok(()) => {
                    self.publish_peer_session(&address, &mut out);
                    out.effect(Effect::Peer(PeerEffect::Connect { address }));
                }
                Err(e) => peer_alert(&mut out, Some(address), e),
            },
            Command::DisconnectPeer { address } => {
                if self.peers.session(&address).is_some() {
                    out.effect(Effect::Peer(PeerEffect::Disconnect { address }));
                } else {
                    let error = PeerChannelError::NotConnected {
                        address: address.clone(),
                    };
                    peer_alert(&mut out, Some(address), error);
                }
            }
            Command::SendPeerMessage { address, text } => {
                match self.peers.ensure_connected(&address) {
                    Ok(()) => out.effect(Effect::Peer(PeerEffect::Send { address, text })),
                    Err(e) => peer_alert(&mut out, Some(address), e),
                }
            }
            Command::RenamePeer {
                address,
                display_name,
            } => {
                self.peers.rename_peer(&address, display_name);
                self.publish_peer_session(&address, &mut out);
            }
            Command::ClearPeerHistory { address } => {
                if self.peers.clear_history(&address) > 0 {
                    out.app_event(AppEvent::PeerHistoryCleared { address });
                }
            }
            Command::Shutdown => debug!("Shutdown is handled by the engine loop"),
        }

        self.publish_store_changes(&mut out);
        self.persist_peers(&mut out);
        Ok(out)
    }

    fn send_message(
        &mut self,
        conversation_id: ConversationId,
        recipient_id: UserId,
        content: MessageContent,
        metadata: Option<serde_json::Value>,
        out: &mut SyncOutput,
    ) -> Result<()> {
        let mut outgoing = OutgoingMessage::new(self.self_id.clone(), recipient_id, content);
        if let Some(metadata) = metadata {
            outgoing = outgoing.with_metadata(metadata);
        }

        let message = self.store.insert_optimistic(conversation_id, outgoing)?;
        let Some(correlation_id) = message.correlation_id else {
            return Err(StoreError::InvalidContent {
                reason: "optimistic message without correlation id".to_string(),
            }
            .into());
        };

        if self.connection.can_send() {
            debug!(%correlation_id, conversation_id = %message.conversation_id, "Emitting message");
            out.effect(Effect::Emit(OutboundEvent::SendMessage {
                conversation_id: message.conversation_id,
                correlation_id,
                content: message.content,
                metadata: message.metadata,
            }));
        } else {
            let reason = format!("not connected ({})", self.connection.status());
            self.fail_send(&correlation_id, reason, out);
        }
        Ok(())
    }

    /// Resubmit a failed message as a new attempt; the failed row stays
    fn retry_message(&mut self, correlation_id: &CorrelationId, out: &mut SyncOutput) -> Result<()> {
        let failed = self
            .store
            .find_by_correlation(correlation_id)
            .ok_or_else(|| StoreError::UnknownCorrelation {
                correlation_id: correlation_id.clone(),
            })?;
        if failed.delivery_state != DeliveryState::Failed || failed.id.is_some() {
            return Err(StoreError::NotFailed {
                correlation_id: correlation_id.clone(),
            }
            .into());
        }

        let conversation_id = failed.conversation_id.clone();
        let recipient_id = failed.recipient_id.clone();
        let content = failed.content.clone();
        let metadata = failed.metadata.clone();
        info!(%correlation_id, "Retrying failed message");
        self.send_message(conversation_id, recipient_id, content, metadata, out)
    }

    fn open_conversation(&mut self, conversation_id: ConversationId, out: &mut SyncOutput) {
        if self.open_rooms.insert(conversation_id.clone()) && self.connection.can_send() {
            out.effect(Effect::Emit(OutboundEvent::JoinRoom {
                conversation_id: conversation_id.clone(),
            }));
        }
        self.mark_conversation_read(&conversation_id, out);
    }

    fn close_conversation(&mut self, conversation_id: &ConversationId, out: &mut SyncOutput) {
        if self.open_rooms.remove(conversation_id) && self.connection.can_send() {
            out.effect(Effect::Emit(OutboundEvent::LeaveRoom {
                conversation_id: conversation_id.clone(),
            }));
        }
    }

    fn mark_conversation_read(&mut self, conversation_id: &ConversationId, out: &mut SyncOutput) {
        let now = self.now();
        let newly_read = self
            .store
            .mark_all_read(conversation_id, &self.self_id, now);
        if newly_read.is_empty() {
            return;
        }

        self.unreported_reads.extend(
            newly_read
                .into_iter()
                .map(|message_id| (message_id, conversation_id.clone())),
        );
        self.flush_unreported_reads(out);
    }

    /// Emit `mark-read` for reads not yet reported
    ///
    /// Reads stay queued while receipts are disabled or there is no connection.
    fn flush_unreported_reads(&mut self, out: &mut SyncOutput) {
        if !self.receipts.read_receipts_enabled()
            || !self.connection.can_send()
            || self.unreported_reads.is_empty()
        {
            return;
        }

        for (message_id, conversation_id) in core::mem::take(&mut self.unreported_reads) {
            if !self.receipts.should_send_read_receipt(&message_id) {
                continue;
            }
            out.effect(Effect::Emit(OutboundEvent::MarkRead {
                message_id: message_id.clone(),
                conversation_id,
            }));
            self.receipts.mark_read_receipt_sent(message_id);
        }
        self.receipts.cleanup_old_receipts(MAX_TRACKED_RECEIPTS);
    }

    fn set_mode(&mut self, mode: ConnectivityMode, out: &mut SyncOutput) -> Result<()> {
        if mode == self.mode {
            return Ok(());
        }
        let before = self.connectivity();
        info!(from = %self.mode, to = %mode, "Switching connectivity mode");

        match mode {
            ConnectivityMode::OfflineLocal => {
                // Announce and tear down while the gate still allows it
                self.apply_connection_event(ConnectionEvent::Disconnect, out)?;
                self.connection.set_mode(mode);
                self.mode = mode;
                self.drop_presence(out);
                self.peers.activate();
            }
            ConnectivityMode::Online => {
                self.stop_discovery(out);
                for address in self.peers.deactivate() {
                    out.effect(Effect::Peer(PeerEffect::Disconnect { address }));
                }
                self.connection.set_mode(mode);
                self.mode = mode;
                self.apply_connection_event(ConnectionEvent::Resume, out)?;
            }
        }

        self.index.set_connection_mode(mode);
        out.app_event(AppEvent::ConversationListChanged);
        self.publish_connectivity(before, out);
        Ok(())
    }

    fn stop_discovery(&mut self, out: &mut SyncOutput) {
        if self.peers.is_discovering() {
            self.peers.stop_discovery();
            out.effect(Effect::Peer(PeerEffect::StopDiscovery));
            out.app_event(AppEvent::DiscoveryStateChanged { active: false });
        }
    }

    // ------------------------------------------------------------------------
    // Connection Lifecycle
    // ------------------------------------------------------------------------

    fn drive_connection(&mut self, event: ConnectionEvent, out: &mut SyncOutput) -> Result<()> {
        let before = self.connectivity();
        self.apply_connection_event(event, out)?;
        self.publish_connectivity(before, out);
        Ok(())
    }

    fn apply_connection_event(&mut self, event: ConnectionEvent, out: &mut SyncOutput) -> Result<()> {
        let transition = self.connection.process_event(event)?;
        debug!(
            from = %transition.audit_entry.from_state,
            to = %transition.audit_entry.to_state,
            event = %transition.audit_entry.event,
            "Connection transition"
        );
        for effect in transition.effects {
            self.run_connection_effect(effect, out);
        }
        Ok(())
    }

    fn run_connection_effect(&mut self, effect: ConnectionEffect, out: &mut SyncOutput) {
        match effect {
            ConnectionEffect::OpenTransport => out.effect(Effect::OpenConnection),
            ConnectionEffect::CloseTransport => out.effect(Effect::CloseConnection),
            ConnectionEffect::ScheduleReconnect { delay, attempt } => {
                info!(attempt, ?delay, "Scheduling reconnect");
                out.effect(Effect::ScheduleReconnect { delay, attempt });
            }
            ConnectionEffect::AnnouncePresence { online } => {
                out.effect(Effect::Emit(OutboundEvent::Presence { is_online: online }));
            }
            ConnectionEffect::ReplayRoomJoins => {
                for conversation_id in &self.open_rooms {
                    out.effect(Effect::Emit(OutboundEvent::JoinRoom {
                        conversation_id: conversation_id.clone(),
                    }));
                }
                self.flush_unreported_reads(out);
            }
            ConnectionEffect::Resync => {
                let conversation_ids: BTreeSet<ConversationId> = self
                    .open_rooms
                    .iter()
                    .chain(self.index.ids())
                    .chain(self.store.conversation_ids())
                    .cloned()
                    .collect();
                out.effect(Effect::Resync {
                    conversation_ids: conversation_ids.into_iter().collect(),
                });
            }
            ConnectionEffect::ReportExhausted { attempts } => {
                warn!(attempts, "Reconnect attempts exhausted");
                out.app_event(AppEvent::ReconnectExhausted { attempts });
            }
        }
    }

    /// Presence is only meaningful while connected
    fn drop_presence(&mut self, out: &mut SyncOutput) {
        let cleared = self.presence.clear();
        if cleared.is_empty() {
            return;
        }
        for user_id in cleared {
            out.app_event(AppEvent::PresenceChanged {
                user_id,
                online: false,
            });
        }
        self.index.clear_presence();
        out.app_event(AppEvent::ConversationListChanged);
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Handle one event from a transport, resync or peer task
    pub fn handle_event(&mut self, event: Event) -> Result<SyncOutput> {
        let mut out = SyncOutput::new();

        match event {
            Event::Server(server_event) => self.on_server_event(server_event, &mut out),
            Event::SendAcked {
                correlation_id,
                result,
            } => match result {
                SendAck::Confirmed(message) => {
                    let input = ReconcileInput::AckSuccess {
                        correlation_id,
                        message,
                    };
                    self.reconciler.apply(&mut self.store, input);
                }
                SendAck::Rejected { reason } => self.fail_send(&correlation_id, reason, &mut out),
            },
            Event::MarkReadAcked { message_id, error } => {
                if let Some(reason) = error {
                    warn!(%message_id, %reason, "Server rejected read receipt");
                    self.receipts.mark_rejected(message_id);
                }
            }
            Event::ConnectionEstablished { session_id } => {
                info!(%session_id, "Server connection established");
                self.drive_connection(ConnectionEvent::Established { session_id }, &mut out)?;
            }
            Event::ConnectionFailed { reason } => {
                warn!(%reason, "Server connection attempt failed");
                self.drive_connection(ConnectionEvent::Failed { reason }, &mut out)?;
            }
            Event::ConnectionLost { reason } => {
                warn!(%reason, "Server connection lost");
                self.drive_connection(ConnectionEvent::Lost { reason }, &mut out)?;
                if !self.connection.can_send() {
                    self.drop_presence(&mut out);
                }
            }
            Event::ReconnectTimerFired => {
                self.drive_connection(ConnectionEvent::Retry, &mut out)?
            }
            Event::AuthChanged { authenticated } => {
                let before = self.connectivity();
                self.connection.set_authenticated(authenticated);
                let event = if authenticated {
                    ConnectionEvent::Connect
                } else {
                    ConnectionEvent::Disconnect
                };
                self.apply_connection_event(event, &mut out)?;
                self.publish_connectivity(before, &mut out);
            }
            Event::ConversationsFetched { conversations } => {
                debug!(count = conversations.len(), "Merging fetched conversations");
                for record in conversations {
                    self.index.upsert_conversation(record);
                }
                out.app_event(AppEvent::ConversationListChanged);
            }
            Event::HistoryFetched {
                conversation_id,
                messages,
            } => self.on_history(conversation_id, messages, &mut out),
            Event::ResyncFailed { reason } => {
                warn!(%reason, "Resync failed");
                out.app_event(AppEvent::Error {
                    message: format!("Resync failed: {}", reason),
                });
            }
            Event::Peer(peer_event) => self.on_peer_event(peer_event, &mut out),
        }

        self.publish_store_changes(&mut out);
        self.persist_peers(&mut out);
        Ok(out)
    }

    fn on_server_event(&mut self, event: ServerEvent, out: &mut SyncOutput) {
        match event {
            ServerEvent::NewMessage(message) => {
                let conversation_id = message.conversation_id.clone();
                let from_peer = message.sender_id != self.self_id;
                let result = self
                    .reconciler
                    .apply(&mut self.store, ReconcileInput::NewMessage(message));
                if result == ReconcileResult::Merged(ReconcileOutcome::Appended)
                    && from_peer
                    && self.open_rooms.contains(&conversation_id)
                {
                    self.mark_conversation_read(&conversation_id, out);
                }
            }
            ServerEvent::MessageRead(receipt) => {
                let outcome =
                    self.store
                        .mark_read(&receipt.message_id, &receipt.reader_id, receipt.read_at);
                debug!(message_id = %receipt.message_id, ?outcome, "Applied read receipt");
            }
            ServerEvent::MessageDelivered { message_id } => {
                self.store
                    .apply_delivery_state(&message_id, DeliveryState::Delivered);
            }
            ServerEvent::UserOnline { user_id } => self.set_presence(user_id, true, out),
            ServerEvent::UserOffline { user_id } => self.set_presence(user_id, false, out),
        }
    }

    fn set_presence(&mut self, user_id: UserId, online: bool, out: &mut SyncOutput) {
        let now = self.now();
        let Some(change) = self.presence.update(user_id, online, now) else {
            return;
        };
        let changed = self.index.set_peer_online(&change.user_id, change.online);
        out.app_event(AppEvent::PresenceChanged {
            user_id: change.user_id,
            online: change.online,
        });
        if !changed.is_empty() {
            out.app_event(AppEvent::ConversationListChanged);
        }
    }

    /// Route a send rejection through the reconciler and surface it
    fn fail_send(&mut self, correlation_id: &CorrelationId, reason: String, out: &mut SyncOutput) {
        let input = ReconcileInput::AckError {
            correlation_id: correlation_id.clone(),
            reason: reason.clone(),
        };
        if self.reconciler.apply(&mut self.store, input) != ReconcileResult::Failed {
            return;
        }
        if let Some(message) = self.store.find_by_correlation(correlation_id) {
            out.app_event(AppEvent::SendFailed {
                conversation_id: message.conversation_id.clone(),
                correlation_id: correlation_id.clone(),
                reason,
            });
        }
    }

    fn on_history(
        &mut self,
        conversation_id: ConversationId,
        messages: Vec<crate::protocol::message::ConfirmedMessage>,
        out: &mut SyncOutput,
    ) {
        let total = messages.len();
        let mut merged = 0usize;
        for message in messages {
            let result = self
                .reconciler
                .apply(&mut self.store, ReconcileInput::NewMessage(message));
            if matches!(
                result,
                ReconcileResult::Merged(ReconcileOutcome::Appended | ReconcileOutcome::Replaced)
            ) {
                merged += 1;
            }
        }
        debug!(%conversation_id, total, merged, "Merged history backfill");

        // Index first sees the inserts, then takes the recount as authoritative
        self.publish_store_changes(out);
        let unread = self
            .store
            .unread_peer_messages(&conversation_id, &self.self_id)
            .len();
        self.index.set_unread_count(&conversation_id, unread);

        if self.open_rooms.contains(&conversation_id) {
            self.mark_conversation_read(&conversation_id, out);
        }
    }

    // ------------------------------------------------------------------------
    // Local Peer Channel
    // ------------------------------------------------------------------------

    fn on_peer_event(&mut self, event: PeerEvent, out: &mut SyncOutput) {
        match event {
            PeerEvent::Discovered { address, name } => {
                if let Some(session) = self.peers.peer_discovered(address, name) {
                    out.app_event(AppEvent::PeerSessionChanged {
                        session: session.clone(),
                    });
                }
            }
            PeerEvent::Lost { address } => {
                if self.peers.peer_lost(&address) {
                    out.app_event(AppEvent::PeerSessionRemoved { address });
                }
            }
            PeerEvent::Connected { address } => {
                if let Some(session) = self.peers.mark_connected(&address) {
                    out.app_event(AppEvent::PeerSessionChanged {
                        session: session.clone(),
                    });
                }
            }
            PeerEvent::Disconnected { address } => {
                if let Some(session) = self.peers.mark_disconnected(&address) {
                    out.app_event(AppEvent::PeerSessionChanged {
                        session: session.clone(),
                    });
                }
            }
            PeerEvent::ConnectFailed { address, reason } => {
                if let Some(session) = self.peers.mark_failed(&address, reason.clone()) {
                    out.app_event(AppEvent::PeerSessionChanged {
                        session: session.clone(),
                    });
                }
                let error = PeerChannelError::Unreachable {
                    address: address.clone(),
                    reason,
                };
                peer_alert(out, Some(address), error);
            }
            PeerEvent::MessageReceived { address, text } => {
                let now = self.now();
                if let Some(message) = self.peers.record_received(address.clone(), text, now) {
                    out.app_event(AppEvent::PeerMessage { address, message });
                }
            }
            PeerEvent::SendAccepted { address, text } => {
                let now = self.now();
                let message = self.peers.record_sent(address.clone(), text, now);
                out.app_event(AppEvent::PeerMessage { address, message });
            }
            PeerEvent::SendFailed { address, reason } => {
                peer_alert(out, Some(address), reason);
            }
            PeerEvent::DiscoveryStopped => self.stop_discovery_quietly(out),
            PeerEvent::DiscoveryFailed { reason } => {
                self.stop_discovery_quietly(out);
                peer_alert(out, None, PeerChannelError::DiscoveryFailed { reason });
            }
        }
    }

    /// The radio ended discovery on its own; no effect needs to go back out
    fn stop_discovery_quietly(&mut self, out: &mut SyncOutput) {
        if self.peers.is_discovering() {
            self.peers.stop_discovery();
            out.app_event(AppEvent::DiscoveryStateChanged { active: false });
        }
    }

    fn publish_peer_session(&self, address: &DeviceAddress, out: &mut SyncOutput) {
        if let Some(session) = self.peers.session(address) {
            out.app_event(AppEvent::PeerSessionChanged {
                session: session.clone(),
            });
        }
    }
}

/// Local channel failures are shown to the user and never retried
fn peer_alert(out: &mut SyncOutput, address: Option<DeviceAddress>, reason: impl ToString) {
    let reason = reason.to_string();
    warn!(?address, %reason, "Local peer channel failure");
    out.app_event(AppEvent::PeerAlert { address, reason });
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionStatus;
    use crate::config::CourierConfig;
    use crate::protocol::message::ConfirmedMessage;
    use crate::types::{MessageId, Timestamp};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct TestClock(Arc<AtomicU64>);

    impl TimeSource for TestClock {
        fn now(&self) -> Timestamp {
            Timestamp::new(self.0.fetch_add(10, Ordering::SeqCst))
        }
    }

    fn conv() -> ConversationId {
        ConversationId::new("conv-1")
    }

    fn me() -> UserId {
        UserId::new("me")
    }

    fn peer() -> UserId {
        UserId::new("peer")
    }

    fn new_state() -> SyncState<TestClock> {
        let clock = TestClock(Arc::new(AtomicU64::new(1_000)));
        let mut state = SyncState::new(me(), CourierConfig::testing(), clock);
        state
            .handle_event(Event::AuthChanged {
                authenticated: true,
            })
            .unwrap();
        state
    }

    fn connected_state() -> SyncState<TestClock> {
        let mut state = new_state();
        state
            .handle_event(Event::ConnectionEstablished {
                session_id: "s1".to_string(),
            })
            .unwrap();
        state
    }

    fn send(state: &mut SyncState<TestClock>, text: &str) -> (CorrelationId, SyncOutput) {
        let out = state
            .handle_command(Command::SendMessage {
                conversation_id: conv(),
                recipient_id: peer(),
                content: MessageContent::text(text),
                metadata: None,
            })
            .unwrap();
        let correlation_id = state
            .conversation_view(&conv())
            .last()
            .and_then(|m| m.correlation_id.clone())
            .unwrap();
        (correlation_id, out)
    }

    fn confirmed(id: &str, sender: UserId, recipient: UserId, text: &str) -> ConfirmedMessage {
        ConfirmedMessage {
            id: MessageId::new(id),
            correlation_id: None,
            conversation_id: conv(),
            sender_id: sender,
            recipient_id: recipient,
            content: MessageContent::text(text),
            created_at: Some(Timestamp::new(5_000)),
            delivery_state: None,
            read_by: Vec::new(),
            metadata: None,
        }
    }

    #[test]
    fn test_auth_opens_connection() {
        let clock = TestClock(Arc::new(AtomicU64::new(0)));
        let mut state = SyncState::new(me(), CourierConfig::testing(), clock);
        let out = state
            .handle_event(Event::AuthChanged {
                authenticated: true,
            })
            .unwrap();
        assert_eq!(out.effects, vec![Effect::OpenConnection]);
        assert_eq!(state.snapshot().connection, ConnectionStatus::Connecting);
    }

    #[test]
    fn test_established_announces_and_resyncs() {
        let mut state = new_state();
        state
            .handle_command(Command::OpenConversation {
                conversation_id: conv(),
            })
            .unwrap();

        let out = state
            .handle_event(Event::ConnectionEstablished {
                session_id: "s1".to_string(),
            })
            .unwrap();

        assert_eq!(
            out.effects,
            vec![
                Effect::Emit(OutboundEvent::Presence { is_online: true }),
                Effect::Emit(OutboundEvent::JoinRoom {
                    conversation_id: conv()
                }),
                Effect::Resync {
                    conversation_ids: vec![conv()]
                },
            ]
        );
        assert!(out.app_events.iter().any(|e| matches!(
            e,
            AppEvent::ConnectivityChanged {
                status: ConnectionStatus::Connected,
                can_send: true,
                ..
            }
        )));
    }

    #[test]
    fn test_send_while_connected_emits_with_correlation() {
        let mut state = connected_state();
        let (correlation_id, out) = send(&mut state, "hello");

        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::Emit(OutboundEvent::SendMessage { correlation_id: c, .. }) if *c == correlation_id
        )));
        let view = state.conversation_view(&conv());
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].delivery_state, DeliveryState::Pending);
    }

    #[test]
    fn test_send_while_disconnected_fails_visibly() {
        let mut state = new_state();
        let (correlation_id, out) = send(&mut state, "offline");

        assert!(out
            .effects
            .iter()
            .all(|e| !matches!(e, Effect::Emit(OutboundEvent::SendMessage { .. }))));
        assert!(out.app_events.iter().any(|e| matches!(
            e,
            AppEvent::SendFailed { correlation_id: c, .. } if *c == correlation_id
        )));
        assert_eq!(
            state.conversation_view(&conv())[0].delivery_state,
            DeliveryState::Failed
        );
    }

    #[test]
    fn test_retry_creates_new_attempt_and_discard_removes_failed() {
        let mut state = new_state();
        let (failed_id, _) = send(&mut state, "try me");
        state
            .handle_event(Event::ConnectionEstablished {
                session_id: "s1".to_string(),
            })
            .unwrap();

        let out = state
            .handle_command(Command::RetryMessage {
                correlation_id: failed_id.clone(),
            })
            .unwrap();
        let view = state.conversation_view(&conv());
        assert_eq!(view.len(), 2);
        let retry_id = view[1].correlation_id.clone().unwrap();
        assert_ne!(retry_id, failed_id);
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::Emit(OutboundEvent::SendMessage { correlation_id, .. }) if *correlation_id == retry_id
        )));

        state
            .handle_command(Command::DiscardMessage {
                correlation_id: failed_id,
            })
            .unwrap();
        assert_eq!(state.conversation_view(&conv()).len(), 1);

        // Only failed entries can be retried
        assert!(state
            .handle_command(Command::RetryMessage {
                correlation_id: retry_id
            })
            .is_err());
    }

    #[test]
    fn test_ack_then_event_yield_one_row() {
        let mut state = connected_state();
        let (correlation_id, _) = send(&mut state, "hello");
        let mut server_copy = confirmed("m1", me(), peer(), "hello");
        server_copy.correlation_id = Some(correlation_id.clone());

        state
            .handle_event(Event::SendAcked {
                correlation_id: correlation_id.clone(),
                result: SendAck::Confirmed(server_copy.clone()),
            })
            .unwrap();
        state
            .handle_event(Event::Server(ServerEvent::NewMessage(server_copy)))
            .unwrap();

        let view = state.conversation_view(&conv());
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, Some(MessageId::new("m1")));
        assert_eq!(view[0].correlation_id, Some(correlation_id));
    }

    #[test]
    fn test_inbound_in_open_room_is_read_and_reported() {
        let mut state = connected_state();
        state
            .handle_command(Command::OpenConversation {
                conversation_id: conv(),
            })
            .unwrap();

        let out = state
            .handle_event(Event::Server(ServerEvent::NewMessage(confirmed(
                "m1",
                peer(),
                me(),
                "hi",
            ))))
            .unwrap();

        assert!(out.effects.contains(&Effect::Emit(OutboundEvent::MarkRead {
            message_id: MessageId::new("m1"),
            conversation_id: conv(),
        })));
        assert_eq!(state.snapshot().total_unread, 0);
    }

    #[test]
    fn test_reads_while_offline_are_reported_after_reconnect() {
        let mut state = new_state();
        state
            .handle_event(Event::HistoryFetched {
                conversation_id: conv(),
                messages: vec![confirmed("m1", peer(), me(), "hi")],
            })
            .unwrap();
        assert_eq!(state.snapshot().total_unread, 1);

        let out = state
            .handle_command(Command::MarkConversationRead {
                conversation_id: conv(),
            })
            .unwrap();
        assert!(out.effects.is_empty());
        assert_eq!(state.snapshot().total_unread, 0);

        let out = state
            .handle_event(Event::ConnectionEstablished {
                session_id: "s1".to_string(),
            })
            .unwrap();
        assert!(out.effects.contains(&Effect::Emit(OutboundEvent::MarkRead {
            message_id: MessageId::new("m1"),
            conversation_id: conv(),
        })));
    }

    #[test]
    fn test_reads_while_receipts_disabled_are_reported_on_enable() {
        let mut state = connected_state();
        state
            .handle_command(Command::SetReadReceipts { enabled: false })
            .unwrap();
        state
            .handle_event(Event::Server(ServerEvent::NewMessage(confirmed(
                "m1",
                peer(),
                me(),
                "hi",
            ))))
            .unwrap();

        let out = state
            .handle_command(Command::MarkConversationRead {
                conversation_id: conv(),
            })
            .unwrap();
        assert!(out.effects.is_empty());
        assert_eq!(state.snapshot().total_unread, 0);

        let out = state
            .handle_command(Command::SetReadReceipts { enabled: true })
            .unwrap();
        assert_eq!(
            out.effects,
            vec![Effect::Emit(OutboundEvent::MarkRead {
                message_id: MessageId::new("m1"),
                conversation_id: conv(),
            })]
        );

        // Already reported, so toggling again sends nothing
        state
            .handle_command(Command::SetReadReceipts { enabled: false })
            .unwrap();
        let out = state
            .handle_command(Command::SetReadReceipts { enabled: true })
            .unwrap();
        assert!(out.effects.is_empty());
    }

    #[test]
    fn test_clearing_history_drops_queued_reads() {
        let mut state = new_state();
        state
            .handle_event(Event::HistoryFetched {
                conversation_id: conv(),
                messages: vec![confirmed("m1", peer(), me(), "hi")],
            })
            .unwrap();
        state
            .handle_command(Command::MarkConversationRead {
                conversation_id: conv(),
            })
            .unwrap();
        state
            .handle_command(Command::ClearHistory {
                conversation_id: conv(),
            })
            .unwrap();

        let out = state
            .handle_event(Event::ConnectionEstablished {
                session_id: "s1".to_string(),
            })
            .unwrap();
        assert!(!out
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Emit(OutboundEvent::MarkRead { .. }))));
    }

    #[test]
    fn test_presence_updates_conversation() {
        let mut state = connected_state();
        state
            .handle_event(Event::Server(ServerEvent::NewMessage(confirmed(
                "m1",
                peer(),
                me(),
                "hi",
            ))))
            .unwrap();

        let out = state
            .handle_event(Event::Server(ServerEvent::UserOnline { user_id: peer() }))
            .unwrap();
        assert!(out.app_events.contains(&AppEvent::PresenceChanged {
            user_id: peer(),
            online: true
        }));
        assert!(state.snapshot().conversation(&conv()).unwrap().peer_online);

        state
            .handle_event(Event::ConnectionLost {
                reason: "reset".to_string(),
            })
            .unwrap();
        assert!(!state.snapshot().conversation(&conv()).unwrap().peer_online);
    }

    #[test]
    fn test_connection_loss_keeps_pending_and_schedules_reconnect() {
        let mut state = connected_state();
        send(&mut state, "in flight");

        let out = state
            .handle_event(Event::ConnectionLost {
                reason: "socket closed".to_string(),
            })
            .unwrap();

        assert!(out
            .effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleReconnect { attempt: 1, .. })));
        assert_eq!(
            state.conversation_view(&conv())[0].delivery_state,
            DeliveryState::Pending
        );
        assert_eq!(state.snapshot().connection, ConnectionStatus::Reconnecting);
    }

    #[test]
    fn test_offline_mode_switch_tears_down_server_connection() {
        let mut state = connected_state();
        let out = state
            .handle_command(Command::SetMode {
                mode: ConnectivityMode::OfflineLocal,
            })
            .unwrap();

        assert_eq!(
            out.effects,
            vec![
                Effect::Emit(OutboundEvent::Presence { is_online: false }),
                Effect::CloseConnection,
            ]
        );
        assert!(state.peers().is_active());

        // Reconnects are gated while offline
        let out = state.handle_event(Event::ReconnectTimerFired).unwrap();
        assert!(out.effects.is_empty());

        let out = state
            .handle_command(Command::SetMode {
                mode: ConnectivityMode::Online,
            })
            .unwrap();
        assert!(out.effects.contains(&Effect::OpenConnection));
        assert!(!state.peers().is_active());
    }

    #[test]
    fn test_peer_message_flow_records_history() {
        let mut state = new_state();
        state
            .handle_command(Command::SetMode {
                mode: ConnectivityMode::OfflineLocal,
            })
            .unwrap();
        let address = DeviceAddress::new("AA:BB");

        state
            .handle_command(Command::StartDiscovery)
            .unwrap();
        state
            .handle_event(Event::Peer(PeerEvent::Discovered {
                address: address.clone(),
                name: Some("Phone".to_string()),
            }))
            .unwrap();
        let out = state
            .handle_command(Command::ConnectPeer {
                address: address.clone(),
            })
            .unwrap();
        assert!(out.effects.contains(&Effect::Peer(PeerEffect::Connect {
            address: address.clone()
        })));
        state
            .handle_event(Event::Peer(PeerEvent::Connected {
                address: address.clone(),
            }))
            .unwrap();

        let out = state
            .handle_command(Command::SendPeerMessage {
                address: address.clone(),
                text: "yo".to_string(),
            })
            .unwrap();
        assert!(out.effects.contains(&Effect::Peer(PeerEffect::Send {
            address: address.clone(),
            text: "yo".to_string()
        })));
        // Recorded only once the channel accepts it
        assert!(state.peer_history(&address).is_empty());

        let out = state
            .handle_event(Event::Peer(PeerEvent::SendAccepted {
                address: address.clone(),
                text: "yo".to_string(),
            }))
            .unwrap();
        assert!(out
            .effects
            .iter()
            .any(|e| matches!(e, Effect::PersistPeerBook { .. })));
        state
            .handle_event(Event::Peer(PeerEvent::MessageReceived {
                address: address.clone(),
                text: "sup".to_string(),
            }))
            .unwrap();
        assert_eq!(state.peer_history(&address).len(), 2);
        // Server store untouched
        assert_eq!(state.store().message_count(), 0);
    }

    #[test]
    fn test_peer_send_without_session_raises_alert() {
        let mut state = new_state();
        let out = state
            .handle_command(Command::SendPeerMessage {
                address: DeviceAddress::new("AA"),
                text: "hello".to_string(),
            })
            .unwrap();
        assert!(out.effects.is_empty());
        assert!(out
            .app_events
            .iter()
            .any(|e| matches!(e, AppEvent::PeerAlert { .. })));
    }
}
