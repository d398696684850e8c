//! Linear Server Connection State Machine
//!
//! The event-stream connection moves `Disconnected → Connecting → Connected`
//! and back. States are consumed by [`ConnectionState::transition`], which
//! returns the next state, the side effects to run and an audit entry.
//! Dropping the connection never touches message state; it only changes what
//! the client is allowed to send.

use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::channel::ConnectionStatus;
use crate::config::ConnectionConfig;
use crate::types::{ConnectivityMode, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Connection State Types
// ----------------------------------------------------------------------------

/// Linear connection state that must be consumed to transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected(DisconnectedState),
    Connecting(ConnectingState),
    Connected(ConnectedState),
}

/// No live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectedState {
    /// Consecutive failed attempts since the last successful connection
    pub attempts: u32,
    pub last_error: Option<String>,
    /// A reconnect timer is armed
    pub retry_scheduled: bool,
    /// Retry budget spent; only an explicit resume reconnects
    pub exhausted: bool,
}

/// Handshake in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectingState {
    /// Failed attempts preceding this one
    pub attempts: u32,
    pub started_at: Timestamp,
}

/// Live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedState {
    pub session_id: String,
    pub connected_since: Timestamp,
}

// ----------------------------------------------------------------------------
// State Transition Events
// ----------------------------------------------------------------------------

/// Events that drive the connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Automatic connect request (startup, credential became available)
    Connect,
    /// Transport finished the handshake
    Established { session_id: String },
    /// Handshake failed
    Failed { reason: String },
    /// Live connection dropped
    Lost { reason: String },
    /// Intentional teardown (mode switch, sign-out, shutdown)
    Disconnect,
    /// Reconnect timer fired
    Retry,
    /// Explicit user request; clears an exhausted retry budget
    Resume,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEffect {
    OpenTransport,
    CloseTransport,
    ScheduleReconnect { delay: Duration, attempt: u32 },
    AnnouncePresence { online: bool },
    ReplayRoomJoins,
    Resync,
    ReportExhausted { attempts: u32 },
}

/// Preconditions for opening the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionGate {
    pub authenticated: bool,
    pub mode: ConnectivityMode,
}

impl ConnectionGate {
    pub fn allows_connect(&self) -> bool {
        self.authenticated && self.mode == ConnectivityMode::Online
    }
}

/// Inputs a transition needs besides the event
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub gate: ConnectionGate,
    pub config: &'a ConnectionConfig,
    pub now: Timestamp,
}

// ----------------------------------------------------------------------------
// State Transition Results
// ----------------------------------------------------------------------------

/// Result of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub new_state: ConnectionState,
    pub effects: Vec<ConnectionEffect>,
    pub audit_entry: AuditEntry,
}

/// Audit trail entry for state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub effects_count: usize,
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl ConnectionState {
    pub fn new_disconnected() -> Self {
        ConnectionState::Disconnected(DisconnectedState {
            attempts: 0,
            last_error: None,
            retry_scheduled: false,
            exhausted: false,
        })
    }

    /// Get current state name for logging/audit
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(s) if s.exhausted => "Exhausted",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Connecting(_) => "Connecting",
            ConnectionState::Connected(_) => "Connected",
        }
    }

    /// Process an event and transition to new state (consumes self)
    pub fn transition(
        self,
        event: ConnectionEvent,
        ctx: TransitionContext<'_>,
    ) -> Result<StateTransition, StateTransitionError> {
        let from_state = self.state_name().to_string();
        let event_name = event_name(&event);
        let max_attempts = ctx.config.max_reconnect_attempts;

        let (new_state, effects) = match (self, event) {
            // From Disconnected
            (ConnectionState::Disconnected(state), ConnectionEvent::Connect | ConnectionEvent::Retry) => {
                if state.exhausted || !ctx.gate.allows_connect() {
                    let state = DisconnectedState {
                        retry_scheduled: false,
                        ..state
                    };
                    (ConnectionState::Disconnected(state), Vec::new())
                } else {
                    let new_state = ConnectionState::Connecting(ConnectingState {
                        attempts: state.attempts,
                        started_at: ctx.now,
                    });
                    (new_state, vec![ConnectionEffect::OpenTransport])
                }
            }

            (ConnectionState::Disconnected(state), ConnectionEvent::Resume) => {
                if ctx.gate.allows_connect() {
                    let new_state = ConnectionState::Connecting(ConnectingState {
                        attempts: 0,
                        started_at: ctx.now,
                    });
                    (new_state, vec![ConnectionEffect::OpenTransport])
                } else {
                    (ConnectionState::Disconnected(state), Vec::new())
                }
            }

            (ConnectionState::Disconnected(_), ConnectionEvent::Disconnect) => {
                (ConnectionState::new_disconnected(), Vec::new())
            }

            // Transport finished a handshake we no longer want
            (ConnectionState::Disconnected(state), ConnectionEvent::Established { .. }) => (
                ConnectionState::Disconnected(state),
                vec![ConnectionEffect::CloseTransport],
            ),

            // Stale failure reports after teardown
            (
                ConnectionState::Disconnected(state),
                ConnectionEvent::Failed { .. } | ConnectionEvent::Lost { .. },
            ) => (ConnectionState::Disconnected(state), Vec::new()),

            // From Connecting
            (ConnectionState::Connecting(_), ConnectionEvent::Established { session_id }) => {
                let new_state = ConnectionState::Connected(ConnectedState {
                    session_id,
                    connected_since: ctx.now,
                });
                let effects = vec![
                    ConnectionEffect::AnnouncePresence { online: true },
                    ConnectionEffect::ReplayRoomJoins,
                    ConnectionEffect::Resync,
                ];
                (new_state, effects)
            }

            (
                ConnectionState::Connecting(state),
                ConnectionEvent::Failed { reason } | ConnectionEvent::Lost { reason },
            ) => after_failure(state.attempts + 1, reason, max_attempts, ctx),

            (ConnectionState::Connecting(_), ConnectionEvent::Disconnect) => (
                ConnectionState::new_disconnected(),
                vec![ConnectionEffect::CloseTransport],
            ),

            // Duplicate connect attempts are no-ops
            (
                state @ ConnectionState::Connecting(_),
                ConnectionEvent::Connect | ConnectionEvent::Retry | ConnectionEvent::Resume,
            ) => (state, Vec::new()),

            // From Connected
            (
                ConnectionState::Connected(_),
                ConnectionEvent::Lost { reason } | ConnectionEvent::Failed { reason },
            ) => after_failure(0, reason, max_attempts, ctx),

            (ConnectionState::Connected(_), ConnectionEvent::Disconnect) => (
                ConnectionState::new_disconnected(),
                vec![
                    ConnectionEffect::AnnouncePresence { online: false },
                    ConnectionEffect::CloseTransport,
                ],
            ),

            (
                state @ ConnectionState::Connected(_),
                ConnectionEvent::Connect | ConnectionEvent::Retry | ConnectionEvent::Resume,
            ) => (state, Vec::new()),

            // Invalid transitions
            (state, event) => {
                return Err(StateTransitionError::InvalidTransition {
                    from_state: state.state_name().to_string(),
                    event: event_name.to_string(),
                    reason: format!("{:?} is not valid while {}", event, state.state_name()),
                });
            }
        };

        let to_state = new_state.state_name().to_string();
        let audit_entry = AuditEntry {
            timestamp: ctx.now,
            from_state,
            to_state,
            event: event_name.to_string(),
            effects_count: effects.len(),
        };

        Ok(StateTransition {
            new_state,
            effects,
            audit_entry,
        })
    }

    /// Check if state allows server emits
    pub fn can_send_messages(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(s) if s.exhausted)
    }

    /// Coarse status shown to the UI
    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::Disconnected(s) if s.exhausted => ConnectionStatus::Exhausted,
            ConnectionState::Disconnected(s) if s.retry_scheduled => ConnectionStatus::Reconnecting,
            ConnectionState::Disconnected(_) => ConnectionStatus::Disconnected,
            ConnectionState::Connecting(s) if s.attempts > 0 => ConnectionStatus::Reconnecting,
            ConnectionState::Connecting(_) => ConnectionStatus::Connecting,
            ConnectionState::Connected(_) => ConnectionStatus::Connected,
        }
    }
}

/// Decide between another attempt and giving up
fn after_failure(
    attempts: u32,
    reason: String,
    max_attempts: u32,
    ctx: TransitionContext<'_>,
) -> (ConnectionState, Vec<ConnectionEffect>) {
    if attempts >= max_attempts {
        let state = ConnectionState::Disconnected(DisconnectedState {
            attempts,
            last_error: Some(reason),
            retry_scheduled: false,
            exhausted: true,
        });
        return (state, vec![ConnectionEffect::ReportExhausted { attempts }]);
    }

    let retry = ctx.gate.allows_connect();
    let state = ConnectionState::Disconnected(DisconnectedState {
        attempts,
        last_error: Some(reason),
        retry_scheduled: retry,
        exhausted: false,
    });
    let effects = if retry {
        vec![ConnectionEffect::ScheduleReconnect {
            delay: ctx.config.reconnect_delay,
            attempt: attempts + 1,
        }]
    } else {
        Vec::new()
    };
    (state, effects)
}

fn event_name(event: &ConnectionEvent) -> &'static str {
    match event {
        ConnectionEvent::Connect => "Connect",
        ConnectionEvent::Established { .. } => "Established",
        ConnectionEvent::Failed { .. } => "Failed",
        ConnectionEvent::Lost { .. } => "Lost",
        ConnectionEvent::Disconnect => "Disconnect",
        ConnectionEvent::Retry => "Retry",
        ConnectionEvent::Resume => "Resume",
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    InvalidTransition {
        from_state: String,
        event: String,
        reason: String,
    },
}

impl fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTransitionError::InvalidTransition {
                from_state,
                event,
                reason,
            } => write!(
                f,
                "Invalid transition from {} on event {}: {}",
                from_state, event, reason
            ),
        }
    }
}

impl std::error::Error for StateTransitionError {}

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

const MAX_AUDIT_ENTRIES: usize = 1000;

/// Owns the single server connection state plus its audit trail
#[derive(Debug)]
pub struct ConnectionManager<T: TimeSource> {
    state: ConnectionState,
    gate: ConnectionGate,
    config: ConnectionConfig,
    audit_trail: Vec<AuditEntry>,
    time_source: T,
    stats: ConnectionStats,
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub state_transitions: u64,
    pub connections_established: u64,
    pub connections_lost: u64,
    pub failed_attempts: u64,
    pub exhaustions: u64,
    pub invalid_transitions: u64,
}

impl<T: TimeSource> ConnectionManager<T> {
    pub fn new(config: ConnectionConfig, time_source: T) -> Self {
        Self {
            state: ConnectionState::new_disconnected(),
            gate: ConnectionGate::default(),
            config,
            audit_trail: Vec::new(),
            time_source,
            stats: ConnectionStats::default(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn gate(&self) -> ConnectionGate {
        self.gate
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.gate.authenticated = authenticated;
    }

    pub fn set_mode(&mut self, mode: ConnectivityMode) {
        self.gate.mode = mode;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn can_send(&self) -> bool {
        self.state.can_send_messages()
    }

    /// Process a connection event and update state
    ///
    /// On error the previous state is kept.
    pub fn process_event(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<StateTransition, StateTransitionError> {
        let ctx = TransitionContext {
            gate: self.gate,
            config: &self.config,
            now: self.time_source.now(),
        };
        let current = self.state.clone();
        let is_lost = matches!(event, ConnectionEvent::Lost { .. })
            && matches!(current, ConnectionState::Connected(_));
        let is_failed = matches!(event, ConnectionEvent::Failed { .. })
            && matches!(current, ConnectionState::Connecting(_));

        let transition = match current.transition(event, ctx) {
            Ok(transition) => transition,
            Err(e) => {
                self.stats.invalid_transitions += 1;
                return Err(e);
            }
        };

        if matches!(transition.new_state, ConnectionState::Connected(_))
            && !self.state.can_send_messages()
        {
            self.stats.connections_established += 1;
        }
        if is_lost {
            self.stats.connections_lost += 1;
        }
        if is_failed {
            self.stats.failed_attempts += 1;
        }
        if transition.new_state.is_exhausted() && !self.state.is_exhausted() {
            self.stats.exhaustions += 1;
        }

        self.state = transition.new_state.clone();
        self.audit_trail.push(transition.audit_entry.clone());
        self.stats.state_transitions += 1;

        // Keep the last entries only
        if self.audit_trail.len() > MAX_AUDIT_ENTRIES {
            self.audit_trail.remove(0);
        }

        Ok(transition)
    }

    pub fn get_recent_audit_entries(&self, limit: usize) -> &[AuditEntry] {
        let start = self.audit_trail.len().saturating_sub(limit);
        &self.audit_trail[start..]
    }

    pub fn get_statistics(&self) -> &ConnectionStats {
        &self.stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
