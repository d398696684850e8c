//! Plain-text rendering of engine output

use std::fmt::Write;

use courier_core::protocol::{MessageDirection, PeerSessionState};
use courier_core::{AppEvent, Message, SyncSnapshot, UserId};

/// One line describing an app event, or `None` for events only the status view uses
pub fn describe_event(event: &AppEvent, self_id: &UserId) -> Option<String> {
    let line = match event {
        AppEvent::MessageUpserted { message } => describe_message(message, self_id),
        AppEvent::MessageRemoved { correlation_id, .. } => {
            format!("discarded message {}", correlation_id)
        }
        AppEvent::SendFailed {
            conversation_id,
            correlation_id,
            reason,
        } => format!(
            "[{}] send failed ({}): {}; use 'retry {}'",
            conversation_id, correlation_id, reason, correlation_id
        ),
        AppEvent::ConversationListChanged => return None,
        AppEvent::ConversationCleared { conversation_id } => {
            format!("[{}] history cleared", conversation_id)
        }
        AppEvent::ConnectivityChanged {
            status,
            mode,
            can_send,
        } => format!(
            "* {} ({}){}",
            status,
            mode,
            if *can_send { "" } else { ", sending disabled" }
        ),
        AppEvent::ReconnectExhausted { attempts } => format!(
            "* gave up reconnecting after {} attempts; type 'connect' to try again",
            attempts
        ),
        AppEvent::PresenceChanged { user_id, online } => format!(
            "* {} is {}",
            user_id,
            if *online { "online" } else { "offline" }
        ),
        AppEvent::PeerSessionChanged { session } => format!(
            "~ {} {}{}",
            session
                .display_name
                .as_deref()
                .unwrap_or(session.device_address.as_str()),
            peer_state(session.connection_state),
            session
                .last_error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        ),
        AppEvent::PeerSessionRemoved { address } => format!("~ {} out of range", address),
        AppEvent::PeerMessage { address, message } => match message.direction {
            MessageDirection::Sent => format!("~ {} <- {}", address, message.text),
            MessageDirection::Received => format!("~ {} -> {}", address, message.text),
        },
        AppEvent::PeerHistoryCleared { address } => format!("~ {} history cleared", address),
        AppEvent::PeerAlert { address, reason } => match address {
            Some(address) => format!("! {}: {}", address, reason),
            None => format!("! {}", reason),
        },
        AppEvent::DiscoveryStateChanged { active } => {
            if *active {
                "~ scanning for nearby devices".to_string()
            } else {
                "~ scan stopped".to_string()
            }
        }
        AppEvent::Error { message } => format!("! {}", message),
    };
    Some(line)
}

fn describe_message(message: &Message, self_id: &UserId) -> String {
    let who = if message.is_authored_by(self_id) {
        "me".to_string()
    } else {
        message.sender_id.to_string()
    };
    let id = match (&message.id, &message.correlation_id) {
        (Some(id), _) => id.to_string(),
        (None, Some(correlation_id)) => correlation_id.to_string(),
        (None, None) => "-".to_string(),
    };
    format!(
        "[{}] {}: {} ({}, {})",
        message.conversation_id,
        who,
        message.content.preview(),
        message.delivery_state,
        id
    )
}

fn peer_state(state: PeerSessionState) -> &'static str {
    match state {
        PeerSessionState::Idle => "nearby",
        PeerSessionState::Discovering => "discovered",
        PeerSessionState::Connecting => "connecting",
        PeerSessionState::Connected => "connected",
        PeerSessionState::Failed => "failed",
    }
}

/// Multi-line status view
pub fn format_snapshot(snapshot: &SyncSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "User:       {}", snapshot.self_id);
    let _ = writeln!(out, "Mode:       {}", snapshot.mode);
    let _ = writeln!(
        out,
        "Connection: {}{}",
        snapshot.connection,
        if snapshot.can_send { "" } else { " (sending disabled)" }
    );
    let _ = writeln!(out, "Unread:     {}", snapshot.total_unread);

    let _ = writeln!(out, "\nConversations:");
    if snapshot.conversations.is_empty() {
        let _ = writeln!(out, "  None");
    }
    for summary in &snapshot.conversations {
        let peers: Vec<&str> = summary
            .participant_ids
            .iter()
            .filter(|p| *p != &snapshot.self_id)
            .map(|p| p.as_str())
            .collect();
        let _ = write!(
            out,
            "  {} with {}{}",
            summary.id,
            peers.join(", "),
            if summary.peer_online { " (online)" } else { "" }
        );
        if summary.unread_count > 0 {
            let _ = write!(out, " [{} unread]", summary.unread_count);
        }
        if let Some(last) = &summary.last_message {
            let _ = write!(out, ": {}", last.content.preview());
        }
        let _ = writeln!(out);
    }

    if !snapshot.peer_sessions.is_empty() || snapshot.discovering {
        let _ = writeln!(
            out,
            "\nNearby devices{}:",
            if snapshot.discovering { " (scanning)" } else { "" }
        );
        for session in &snapshot.peer_sessions {
            let _ = writeln!(
                out,
                "  {} {} {}",
                session.device_address,
                session.display_name.as_deref().unwrap_or("-"),
                peer_state(session.connection_state)
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{
        ConnectionStatus, ConnectivityMode, ConversationId, ConversationSummary, CorrelationId,
        DeliveryState, MessageContent, Timestamp,
    };

    fn me() -> UserId {
        UserId::new("alice")
    }

    #[test]
    fn test_pending_message_shows_correlation() {
        let message = Message {
            id: None,
            correlation_id: Some(CorrelationId::new("k1")),
            conversation_id: ConversationId::new("c1"),
            sender_id: me(),
            recipient_id: UserId::new("bob"),
            content: MessageContent::text("hi"),
            created_at: Timestamp::new(1),
            delivery_state: DeliveryState::Pending,
            read_by: Vec::new(),
            metadata: None,
        };
        let line = describe_event(&AppEvent::MessageUpserted { message }, &me()).unwrap();
        assert!(line.starts_with("[c1] me: hi"));
        assert!(line.contains("k1"));
    }

    #[test]
    fn test_list_changes_are_silent() {
        assert!(describe_event(&AppEvent::ConversationListChanged, &me()).is_none());
        let line = describe_event(
            &AppEvent::ConnectivityChanged {
                status: ConnectionStatus::Reconnecting,
                mode: ConnectivityMode::Online,
                can_send: false,
            },
            &me(),
        )
        .unwrap();
        assert!(line.contains("Reconnecting"));
        assert!(line.contains("sending disabled"));
    }

    #[test]
    fn test_snapshot_lists_conversations() {
        let mut snapshot = SyncSnapshot::empty(me());
        let mut summary = ConversationSummary::new(
            ConversationId::new("c1"),
            vec![me(), UserId::new("bob")],
        );
        summary.unread_count = 3;
        snapshot.conversations.push(summary);
        snapshot.total_unread = 3;

        let text = format_snapshot(&snapshot);
        assert!(text.contains("c1 with bob [3 unread]"));
        assert!(text.contains("Unread:     3"));
        assert!(!text.contains("Nearby devices"));
    }
}
