//! In-memory collaborators for runtime tests
//!
//! A mock server connector whose links are plain channels, a scripted history
//! service and a scripted local peer channel.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    AppEvent, ConfirmedMessage, ConversationId, ConversationRecord, CourierError, DeviceAddress,
    MessageContent, MessageId, PeerChannelError, PeerEvent, Result, SyncSnapshot, Timestamp,
    UserId,
};
use courier_runtime::{HistoryApi, PeerChannel, ServerConnector, ServerLink};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Mock Server
// ----------------------------------------------------------------------------

/// The server side of a mock link
pub struct RemoteEnd {
    pub session_id: String,
    sent: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<String>,
}

impl RemoteEnd {
    /// Next frame the client wrote, as JSON
    pub async fn next_frame(&mut self) -> Value {
        let text = timeout(WAIT, self.sent.recv())
            .await
            .expect("client should write a frame")
            .expect("link should be open");
        serde_json::from_str(&text).expect("client frames are JSON")
    }

    /// Skip frames until one for `event` arrives
    pub async fn next_event(&mut self, event: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["event"] == event {
                return frame;
            }
        }
    }

    /// Whether the client wrote nothing within `window`
    pub async fn is_quiet(&mut self, window: Duration) -> bool {
        timeout(window, self.sent.recv()).await.is_err()
    }

    pub fn push_event(&self, event: &str, data: Value) {
        self.push_raw(json!({ "event": event, "data": data }).to_string());
    }

    pub fn ack(&self, ack_id: &Value, data: Value) {
        self.push_raw(json!({ "ackId": ack_id, "data": data }).to_string());
    }

    pub fn push_raw(&self, text: String) {
        self.push.send(text).expect("client link should be listening");
    }
}

struct ChannelLink {
    session_id: String,
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ServerLink for ChannelLink {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.outgoing
            .send(text)
            .map_err(|_| CourierError::send_failed("remote end dropped"))
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.incoming.close();
    }
}

/// Hands every accepted link's remote end to the test
pub struct MockConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    refuse: AtomicBool,
    connects: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            remotes,
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        });
        (connector, accepted)
    }

    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServerConnector for MockConnector {
    async fn connect(&self, bearer_token: &str) -> Result<Box<dyn ServerLink>> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.tokens.lock().unwrap().push(bearer_token.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CourierError::connection_failed("connection refused"));
        }

        let session_id = format!("session-{}", attempt);
        let (outgoing, sent) = mpsc::unbounded_channel();
        let (push, incoming) = mpsc::unbounded_channel();
        let remote = RemoteEnd {
            session_id: session_id.clone(),
            sent,
            push,
        };
        self.remotes
            .send(remote)
            .map_err(|_| CourierError::connection_failed("test dropped the connector"))?;
        Ok(Box::new(ChannelLink {
            session_id,
            outgoing,
            incoming,
        }))
    }
}

pub async fn accept(remotes: &mut mpsc::UnboundedReceiver<RemoteEnd>) -> RemoteEnd {
    timeout(WAIT, remotes.recv())
        .await
        .expect("client should connect")
        .expect("connector alive")
}

// ----------------------------------------------------------------------------
// Mock History
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct MockHistory {
    conversations: Mutex<Vec<ConversationRecord>>,
    histories: Mutex<HashMap<ConversationId, Vec<ConfirmedMessage>>>,
    list_calls: AtomicUsize,
}

impl MockHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_conversation(&self, record: ConversationRecord, messages: Vec<ConfirmedMessage>) {
        self.histories
            .lock()
            .unwrap()
            .insert(record.id.clone(), messages);
        self.conversations.lock().unwrap().push(record);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryApi for MockHistory {
    async fn conversations(&self) -> Result<Vec<ConversationRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn history(&self, conversation_id: &ConversationId) -> Result<Vec<ConfirmedMessage>> {
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ----------------------------------------------------------------------------
// Mock Peer Channel
// ----------------------------------------------------------------------------

/// Test-side controls for a [`MockPeerChannel`]
#[derive(Clone)]
pub struct MockPeerHandle {
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub sent: Arc<Mutex<Vec<(DeviceAddress, String)>>>,
    pub reachable: Arc<Mutex<HashSet<DeviceAddress>>>,
}

pub struct MockPeerChannel {
    events: mpsc::UnboundedReceiver<PeerEvent>,
    sent: Arc<Mutex<Vec<(DeviceAddress, String)>>>,
    reachable: Arc<Mutex<HashSet<DeviceAddress>>>,
}

impl MockPeerChannel {
    pub fn new() -> (Self, MockPeerHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let reachable = Arc::new(Mutex::new(HashSet::new()));
        let handle = MockPeerHandle {
            events: events_tx,
            sent: sent.clone(),
            reachable: reachable.clone(),
        };
        (
            Self {
                events,
                sent,
                reachable,
            },
            handle,
        )
    }
}

#[async_trait]
impl PeerChannel for MockPeerChannel {
    async fn start_discovery(&mut self) -> std::result::Result<(), PeerChannelError> {
        Ok(())
    }

    async fn stop_discovery(&mut self) -> std::result::Result<(), PeerChannelError> {
        Ok(())
    }

    async fn connect(&mut self, address: &DeviceAddress) -> std::result::Result<(), PeerChannelError> {
        if self.reachable.lock().unwrap().contains(address) {
            Ok(())
        } else {
            Err(PeerChannelError::Unreachable {
                address: address.clone(),
                reason: "out of range".to_string(),
            })
        }
    }

    async fn disconnect(
        &mut self,
        _address: &DeviceAddress,
    ) -> std::result::Result<(), PeerChannelError> {
        Ok(())
    }

    async fn send(
        &mut self,
        address: &DeviceAddress,
        text: &str,
    ) -> std::result::Result<(), PeerChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((address.clone(), text.to_string()));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }
}

// ----------------------------------------------------------------------------
// Waiting Helpers
// ----------------------------------------------------------------------------

/// Receive app events until one matches
pub async fn wait_for_app_event(
    events: &mut mpsc::Receiver<AppEvent>,
    mut predicate: impl FnMut(&AppEvent) -> bool,
) -> AppEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("engine alive");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected app event did not arrive")
}

/// Wait until the published snapshot satisfies `predicate`
pub async fn wait_for_snapshot(
    snapshots: &mut watch::Receiver<SyncSnapshot>,
    mut predicate: impl FnMut(&SyncSnapshot) -> bool,
) -> SyncSnapshot {
    timeout(WAIT, async {
        loop {
            {
                let current = snapshots.borrow_and_update();
                if predicate(&current) {
                    return current.clone();
                }
            }
            snapshots.changed().await.expect("engine alive");
        }
    })
    .await
    .expect("expected snapshot was not published")
}

/// Drain app events in the background so the engine never waits on the UI
pub fn drain(mut events: mpsc::Receiver<AppEvent>) -> mpsc::UnboundedReceiver<AppEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    rx
}

// ----------------------------------------------------------------------------
// Payload Builders
// ----------------------------------------------------------------------------

/// Server-shaped message payload
pub fn message_json(id: &str, conversation: &str, sender: &str, recipient: &str, text: &str) -> Value {
    json!({
        "_id": id,
        "conversationId": conversation,
        "sender": { "_id": sender },
        "recipient": recipient,
        "content": text,
        "contentType": "text",
        "createdAt": 1_700_000_000_000u64,
    })
}

pub fn confirmed(id: &str, conversation: &str, sender: &str, recipient: &str, text: &str, at: u64) -> ConfirmedMessage {
    ConfirmedMessage {
        id: MessageId::new(id),
        correlation_id: None,
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new(sender),
        recipient_id: UserId::new(recipient),
        content: MessageContent::text(text),
        created_at: Some(Timestamp::new(at)),
        delivery_state: None,
        read_by: Vec::new(),
        metadata: None,
    }
}

pub fn conversation_record(id: &str, participants: &[&str]) -> ConversationRecord {
    ConversationRecord {
        id: ConversationId::new(id),
        participant_ids: participants.iter().map(|p| UserId::new(*p)).collect(),
        last_message: None,
        unread_count: 0,
    }
}
