//! Server transport task
//!
//! Owns the event-stream connection. Turns `OpenConnection`, `CloseConnection`
//! and `Emit` effects into socket activity, tracks outstanding acknowledgments,
//! and normalizes everything the server pushes before it reaches the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::channel::{EffectReceiver, EventSender};
use courier_core::config::ConnectionConfig;
use courier_core::protocol::wire::{
    normalize_message, AckPayload, InboundFrame, InboundKind, NormalizeContext, OutboundEvent,
    OutboundFrame, ServerEvent, EVENT_SEND_MESSAGE,
};
use courier_core::{
    CorrelationId, Effect, Event, MessageId, Result, SendAck, Timestamp, TransportError, UserId,
};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::tasks::{forward_event, next_effect, TaskChannels, TransportTask};

/// Floor for the acknowledgment sweep period
const MIN_ACK_SWEEP: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// Collaborator Traits
// ----------------------------------------------------------------------------

/// Source of the opaque bearer token used for the socket and the history API
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `None` while signed out
    async fn bearer_token(&self) -> Option<String>;
}

/// A fixed token, or none at all
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn bearer_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// An open event-stream connection carrying JSON text frames
#[async_trait]
pub trait ServerLink: Send {
    /// Identifier of this connection, for logs and the audit trail
    fn session_id(&self) -> &str;

    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text frame; `None` once the server closed the stream
    ///
    /// Must be cancel safe: it is polled inside `select!`.
    async fn next_text(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// Opens [`ServerLink`]s
#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn connect(&self, bearer_token: &str) -> Result<Box<dyn ServerLink>>;
}

// ----------------------------------------------------------------------------
// Pending Acknowledgments
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum AckKind {
    Send { correlation_id: CorrelationId },
    MarkRead { message_id: MessageId },
}

#[derive(Debug, Clone)]
struct PendingAck {
    kind: AckKind,
    deadline: Instant,
}

// ----------------------------------------------------------------------------
// Server Transport Task
// ----------------------------------------------------------------------------

pub struct ServerTransportTask {
    channels: TaskChannels,
    connector: Arc<dyn ServerConnector>,
    credentials: Arc<dyn CredentialProvider>,
    config: ConnectionConfig,
    /// Fills in recipients the server leaves out
    self_id: UserId,
    link: Option<Box<dyn ServerLink>>,
    pending_acks: HashMap<u64, PendingAck>,
    next_ack_id: u64,
}

impl ServerTransportTask {
    pub fn new(
        self_id: UserId,
        config: ConnectionConfig,
        connector: Arc<dyn ServerConnector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            channels: TaskChannels::default(),
            connector,
            credentials,
            config,
            self_id,
            link: None,
            pending_acks: HashMap::new(),
            next_ack_id: 1,
        }
    }

    /// Requests still waiting for an acknowledgment
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    async fn run_loop(&mut self, events: EventSender, mut effects: EffectReceiver) -> Result<()> {
        info!("Server transport task starting");
        let mut sweep = interval((self.config.ack_timeout / 2).max(MIN_ACK_SWEEP));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                effect = next_effect(&mut effects, "server") => {
                    let Some(effect) = effect else {
                        info!("Effect channel closed, shutting down server transport task");
                        break;
                    };
                    if let Err(e) = self.handle_effect(effect, &events).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!("Server effect failed: {}", e);
                    }
                }

                frame = next_frame(&mut self.link) => {
                    self.handle_frame(frame, &events).await?;
                }

                _ = sweep.tick() => self.expire_acks(),
            }
        }

        self.close_link().await;
        info!("Server transport task stopped");
        Ok(())
    }

    async fn handle_effect(&mut self, effect: Effect, events: &EventSender) -> Result<()> {
        match effect {
            Effect::OpenConnection => self.open(events).await,
            Effect::CloseConnection => {
                self.close_link().await;
                Ok(())
            }
            Effect::Emit(event) => self.emit(event, events).await,
            // Effects for other transports
            _ => Ok(()),
        }
    }

    async fn open(&mut self, events: &EventSender) -> Result<()> {
        if self.link.is_some() {
            debug!("Connection already open");
            return Ok(());
        }

        let Some(token) = self.credentials.bearer_token().await else {
            let reason = TransportError::MissingCredential.to_string();
            return forward_event(events, Event::ConnectionFailed { reason }).await;
        };

        let connect_timeout = self.config.connect_timeout;
        let event = match timeout(connect_timeout, self.connector.connect(&token)).await {
            Ok(Ok(link)) => {
                let session_id = link.session_id().to_string();
                info!(%session_id, "Server link open");
                self.link = Some(link);
                Event::ConnectionEstablished { session_id }
            }
            Ok(Err(e)) => Event::ConnectionFailed {
                reason: e.to_string(),
            },
            Err(_) => Event::ConnectionFailed {
                reason: TransportError::Timeout {
                    duration_ms: connect_timeout.as_millis() as u64,
                }
                .to_string(),
            },
        };
        forward_event(events, event).await
    }

    async fn emit(&mut self, event: OutboundEvent, events: &EventSender) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            warn!(event = event.name(), "Dropping emit without a server link");
            return reject_unsent(&event, "not connected", events).await;
        };

        let ack_id = if event.expects_ack() {
            let ack_id = self.next_ack_id;
            self.next_ack_id += 1;
            Some(ack_id)
        } else {
            None
        };
        let text = OutboundFrame::new(&event, ack_id).encode()?;

        if let Err(e) = link.send_text(text).await {
            warn!(event = event.name(), "Server write failed: {}", e);
            reject_unsent(&event, &e.to_string(), events).await?;
            return self.lose_link(e.to_string(), events).await;
        }

        if let (Some(ack_id), Some(kind)) = (ack_id, ack_kind(&event)) {
            let deadline = Instant::now() + self.config.ack_timeout;
            self.pending_acks.insert(ack_id, PendingAck { kind, deadline });
        }
        debug!(event = event.name(), ?ack_id, "Emitted");
        Ok(())
    }

    async fn handle_frame(
        &mut self,
        frame: Option<Result<String>>,
        events: &EventSender,
    ) -> Result<()> {
        let text = match frame {
            Some(Ok(text)) => text,
            Some(Err(e)) => return self.lose_link(e.to_string(), events).await,
            None => return self.lose_link("server closed the connection".to_string(), events).await,
        };

        let kind = match InboundFrame::decode(&text) {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return Ok(());
            }
        };

        let ctx = NormalizeContext {
            self_id: &self.self_id,
            now: Timestamp::now(),
        };
        match kind {
            InboundKind::Ack { ack_id, data } => {
                let Some(pending) = self.pending_acks.remove(&ack_id) else {
                    debug!(ack_id, "Ack for an unknown or expired request");
                    return Ok(());
                };
                match ack_event(pending.kind, AckPayload::parse(&data), ctx) {
                    Some(event) => forward_event(events, event).await,
                    None => Ok(()),
                }
            }
            InboundKind::Event { name, data } => match ServerEvent::parse(&name, &data, ctx) {
                Ok(Some(event)) => forward_event(events, Event::Server(event)).await,
                Ok(None) => {
                    debug!(event = %name, "Ignoring unknown server event");
                    Ok(())
                }
                Err(e) => {
                    warn!(event = %name, "Dropping malformed server event: {}", e);
                    Ok(())
                }
            },
        }
    }

    /// Forget acknowledgments that took too long; their messages stay pending
    fn expire_acks(&mut self) {
        let now = Instant::now();
        self.pending_acks.retain(|ack_id, pending| {
            let alive = pending.deadline > now;
            if !alive {
                warn!(ack_id, kind = ?pending.kind, "Acknowledgment timed out");
            }
            alive
        });
    }

    async fn lose_link(&mut self, reason: String, events: &EventSender) -> Result<()> {
        if self.link.take().is_none() {
            return Ok(());
        }
        self.drop_pending_acks();
        warn!(%reason, "Server link lost");
        forward_event(events, Event::ConnectionLost { reason }).await
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
            info!(session_id = link.session_id(), "Server link closed");
        }
        self.drop_pending_acks();
    }

    fn drop_pending_acks(&mut self) {
        if !self.pending_acks.is_empty() {
            debug!(
                count = self.pending_acks.len(),
                "Abandoning acknowledgments; messages stay pending"
            );
            self.pending_acks.clear();
        }
    }
}

#[async_trait]
impl TransportTask for ServerTransportTask {
    fn attach_channels(
        &mut self,
        event_sender: EventSender,
        effect_receiver: EffectReceiver,
    ) -> Result<()> {
        self.channels.attach(self.name(), event_sender, effect_receiver)
    }

    async fn run(&mut self) -> Result<()> {
        let (events, effects) = self.channels.take(self.name())?;
        self.run_loop(events, effects).await
    }

    fn name(&self) -> &'static str {
        "server"
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

async fn next_frame(link: &mut Option<Box<dyn ServerLink>>) -> Option<Result<String>> {
    match link {
        Some(link) => link.next_text().await,
        None => std::future::pending().await,
    }
}

fn ack_kind(event: &OutboundEvent) -> Option<AckKind> {
    match event {
        OutboundEvent::SendMessage { correlation_id, .. } => Some(AckKind::Send {
            correlation_id: correlation_id.clone(),
        }),
        OutboundEvent::MarkRead { message_id, .. } => Some(AckKind::MarkRead {
            message_id: message_id.clone(),
        }),
        _ => None,
    }
}

/// Engine event for an acknowledgment, if it carries anything usable
fn ack_event(kind: AckKind, payload: AckPayload, ctx: NormalizeContext<'_>) -> Option<Event> {
    match (kind, payload) {
        (AckKind::Send { correlation_id }, AckPayload::Success { message: Some(data) }) => {
            match normalize_message(EVENT_SEND_MESSAGE, &data, ctx) {
                Ok(mut message) => {
                    message.correlation_id.get_or_insert_with(|| correlation_id.clone());
                    Some(Event::SendAcked {
                        correlation_id,
                        result: SendAck::Confirmed(message),
                    })
                }
                Err(e) => {
                    warn!(%correlation_id, "Unusable send acknowledgment, waiting for the echo: {}", e);
                    None
                }
            }
        }
        (AckKind::Send { correlation_id }, AckPayload::Success { message: None }) => {
            debug!(%correlation_id, "Send acknowledged without a message, waiting for the echo");
            None
        }
        (AckKind::Send { correlation_id }, AckPayload::Error { reason }) => Some(Event::SendAcked {
            correlation_id,
            result: SendAck::Rejected { reason },
        }),
        (AckKind::MarkRead { message_id }, AckPayload::Success { .. }) => {
            Some(Event::MarkReadAcked {
                message_id,
                error: None,
            })
        }
        (AckKind::MarkRead { message_id }, AckPayload::Error { reason }) => {
            Some(Event::MarkReadAcked {
                message_id,
                error: Some(reason),
            })
        }
    }
}

/// A send that never reached the socket fails visibly instead of hanging
async fn reject_unsent(event: &OutboundEvent, reason: &str, events: &EventSender) -> Result<()> {
    match event {
        OutboundEvent::SendMessage { correlation_id, .. } => {
            let event = Event::SendAcked {
                correlation_id: correlation_id.clone(),
                result: SendAck::Rejected {
                    reason: format!("not sent: {}", reason),
                },
            };
            forward_event(events, event).await
        }
        _ => Ok(()),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
