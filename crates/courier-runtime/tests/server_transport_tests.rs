//! Server transport task tests
//!
//! Drive the task directly through its channels: effects in, engine events out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{accept, message_json, MockConnector, WAIT};
use courier_core::channel::{create_effect_channel, create_event_channel, EffectSender, EventReceiver};
use courier_core::config::{ChannelConfig, ConnectionConfig};
use courier_core::{
    ConversationId, CorrelationId, Effect, Event, MessageContent, MessageId, OutboundEvent,
    SendAck, ServerEvent, UserId,
};
use courier_runtime::{CredentialProvider, ServerTransportTask, StaticCredentials, TransportTask};
use serde_json::json;
use tokio::time::timeout;

struct Harness {
    effects: EffectSender,
    events: EventReceiver,
}

fn start(connector: Arc<MockConnector>, credentials: Arc<dyn CredentialProvider>) -> Harness {
    let channels = ChannelConfig::testing();
    let (event_sender, events) = create_event_channel(&channels);
    let (effects, effect_receiver) = create_effect_channel(&channels);

    let mut task = ServerTransportTask::new(
        UserId::new("alice"),
        ConnectionConfig::testing(),
        connector,
        credentials,
    );
    task.attach_channels(event_sender, effect_receiver).unwrap();
    tokio::spawn(async move { task.run().await });

    Harness { effects, events }
}

impl Harness {
    fn effect(&self, effect: Effect) {
        self.effects.send(effect).expect("task subscribed");
    }

    async fn next_event(&mut self) -> Event {
        timeout(WAIT, self.events.recv())
            .await
            .expect("task should report an event")
            .expect("task alive")
    }

    async fn is_quiet(&mut self, window: Duration) -> bool {
        timeout(window, self.events.recv()).await.is_err()
    }
}

fn send_event(correlation: &str, text: &str) -> OutboundEvent {
    OutboundEvent::SendMessage {
        conversation_id: ConversationId::new("c1"),
        correlation_id: CorrelationId::new(correlation),
        content: MessageContent::text(text),
        metadata: None,
    }
}

#[tokio::test]
async fn test_open_connection_reports_session() {
    let (connector, mut remotes) = MockConnector::new();
    let mut harness = start(connector.clone(), Arc::new(StaticCredentials::new("token-1")));

    harness.effect(Effect::OpenConnection);
    let remote = accept(&mut remotes).await;

    assert_eq!(
        harness.next_event().await,
        Event::ConnectionEstablished {
            session_id: remote.session_id.clone()
        }
    );
    assert_eq!(connector.tokens(), vec!["token-1".to_string()]);

    // A second open while connected is ignored
    harness.effect(Effect::OpenConnection);
    assert!(harness.is_quiet(Duration::from_millis(50)).await);
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn test_missing_credential_fails_without_dialing() {
    let (connector, _remotes) = MockConnector::new();
    let mut harness = start(connector.clone(), Arc::new(StaticCredentials::signed_out()));

    harness.effect(Effect::OpenConnection);
    assert!(matches!(
        harness.next_event().await,
        Event::ConnectionFailed { .. }
    ));
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn test_refused_connection_is_reported() {
    let (connector, _remotes) = MockConnector::new();
    connector.set_refusing(true);
    let mut harness = start(connector, Arc::new(StaticCredentials::new("t")));

    harness.effect(Effect::OpenConnection);
    match harness.next_event().await {
        Event::ConnectionFailed { reason } => assert!(reason.contains("refused")),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_send_ack_becomes_confirmation() {
    let (connector, mut remotes) = MockConnector::new();
    let mut harness = start(connector, Arc::new(StaticCredentials::new("t")));
    harness.effect(Effect::OpenConnection);
    let mut remote = accept(&mut remotes).await;
    harness.next_event().await;

    harness.effect(Effect::Emit(send_event("k1", "hello")));
    let frame = remote.next_event("send-message").await;
    assert_eq!(frame["data"]["correlationId"], "k1");
    assert_eq!(frame["data"]["content"], "hello");

    let mut message = message_json("m1", "c1", "alice", "bob", "hello");
    message["correlationId"] = json!("k1");
    remote.ack(&frame["ackId"], json!({ "status": "success", "message": message }));

    match harness.next_event().await {
        Event::SendAcked {
            correlation_id,
            result: SendAck::Confirmed(confirmed),
        } => {
            assert_eq!(correlation_id, CorrelationId::new("k1"));
            assert_eq!(confirmed.id, MessageId::new("m1"));
            assert_eq!(confirmed.sender_id, UserId::new("alice"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_send_ack_error_becomes_rejection() {
    let (connector, mut remotes) = MockConnector::new();
    let mut harness = start(connector, Arc::new(StaticCredentials::new("t")));
    harness.effect(Effect::OpenConnection);
    let mut remote = accept(&mut remotes).await;
    harness.next_event().await;

    harness.effect(Effect::Emit(send_event("k2", "spam")));
    let frame = remote.next_event("send-message").await;
    remote.ack(&frame["ackId"], json!({ "status": "error", "reason": "blocked" }));

    assert_eq!(
        harness.next_event().await,
        Event::SendAcked {
            correlation_id: CorrelationId::new("k2"),
            result: SendAck::Rejected {
                reason: "blocked".to_string()
            },
        }
    );
}

#[tokio::test]
async fn test_late_ack_is_ignored_after_timeout() {
    let (connector, mut remotes) = MockConnector::new();
    let mut harness = start(connector, Arc::new(StaticCredentials::new("t")));
    harness.effect(Effect::OpenConnection);
    let mut remote = accept(&mut remotes).await;
    harness.next_event().await;

    harness.effect(Effect::Emit(send_event("k3", "slow")));
    let frame = remote.next_event("send-message").await;

    // Testing preset waits 200ms for acknowledgments
    tokio::time::sleep(Duration::from_millis(400)).await;
    remote.ack(
        &frame["ackId"],
        json!({ "status": "error", "reason": "too late" }),
    );
    assert!(harness.is_quiet(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_emit_without_link_rejects_sends() {
    let (connector, _remotes) = MockConnector::new();
    let mut harness = start(connector, Arc::new(StaticCredentials::new("t")));

    harness.effect(Effect::Emit(OutboundEvent::Presence { is_online: true }));
    harness.effect(Effect::Emit(send_event("k4", "hi")));

    match harness.next_event().await {
        Event::SendAcked {
            correlation_id,
            result: SendAck::Rejected { reason },
        } => {
            assert_eq!(correlation_id, CorrelationId::new("k4"));
            assert!(reason.contains("not connected"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_inbound_events_are_normalized() {
    let (connector, mut remotes) = MockConnector::new();
    let mut harness = start(connector, Arc::new(StaticCredentials::new("t")));
    harness.effect(Effect::OpenConnection);
    let remote = accept(&mut remotes).await;
    harness.next_event().await;

    remote.push_raw("not json".to_string());
    remote.push_event("typing", json!({ "userId": "bob" }));
    remote.push_event("new-message", json!({ "sender": "bob" }));
    remote.push_event("user-online", json!({ "userId": "bob" }));
    assert_eq!(
        harness.next_event().await,
        Event::Server(ServerEvent::UserOnline {
            user_id: UserId::new("bob")
        })
    );

    // Recipient defaults to the signed-in user
    let mut message = message_json("m9", "c1", "bob", "alice", "yo");
    message.as_object_mut().unwrap().remove("recipient");
    remote.push_event("new-message", json!({ "message": message }));
    match harness.next_event().await {
        Event::Server(ServerEvent::NewMessage(confirmed)) => {
            assert_eq!(confirmed.id, MessageId::new("m9"));
            assert_eq!(confirmed.recipient_id, UserId::new("alice"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_remote_close_reports_lost_connection() {
    let (connector, mut remotes) = MockConnector::new();
    let mut harness = start(connector, Arc::new(StaticCredentials::new("t")));
    harness.effect(Effect::OpenConnection);
    let remote = accept(&mut remotes).await;
    harness.next_event().await;

    drop(remote);
    assert!(matches!(
        harness.next_event().await,
        Event::ConnectionLost { .. }
    ));

    // The task can dial again afterwards
    harness.effect(Effect::OpenConnection);
    let remote = accept(&mut remotes).await;
    assert_eq!(
        harness.next_event().await,
        Event::ConnectionEstablished {
            session_id: remote.session_id.clone()
        }
    );
}

#[tokio::test]
async fn test_mark_read_ack_reports_outcome() {
    let (connector, mut remotes) = MockConnector::new();
    let mut harness = start(connector, Arc::new(StaticCredentials::new("t")));
    harness.effect(Effect::OpenConnection);
    let mut remote = accept(&mut remotes).await;
    harness.next_event().await;

    harness.effect(Effect::Emit(OutboundEvent::MarkRead {
        message_id: MessageId::new("m5"),
        conversation_id: ConversationId::new("c1"),
    }));
    let frame = remote.next_event("mark-read").await;
    remote.ack(&frame["ackId"], json!({ "status": "success" }));

    assert_eq!(
        harness.next_event().await,
        Event::MarkReadAcked {
            message_id: MessageId::new("m5"),
            error: None,
        }
    );
}
