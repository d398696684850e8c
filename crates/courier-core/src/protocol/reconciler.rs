//! Delivery Reconciler
//!
//! Single entry point for everything that can confirm or reject a message:
//! send acknowledgments, pushed `new-message` events and history backfill.
//! Whichever arrives first wins; later copies are absorbed by the store's
//! id check.

use tracing::{debug, warn};

use crate::protocol::message::ConfirmedMessage;
use crate::protocol::message_store::{MessageStore, ReconcileOutcome};
use crate::types::{CorrelationId, TimeSource};

/// Inputs the reconciler accepts
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileInput {
    /// Positive acknowledgment of a `send-message` emit
    AckSuccess {
        correlation_id: CorrelationId,
        message: ConfirmedMessage,
    },
    /// Negative acknowledgment of a `send-message` emit
    AckError {
        correlation_id: CorrelationId,
        reason: String,
    },
    /// Pushed or backfilled message
    NewMessage(ConfirmedMessage),
}

/// What the reconciler did with an input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Merged(ReconcileOutcome),
    Failed,
    /// Input had no effect (already settled)
    Ignored,
    /// Input was rejected by the store and logged
    Dropped,
}

/// Stateless dispatcher over the message store
#[derive(Debug, Default, Clone, Copy)]
pub struct DeliveryReconciler;

impl DeliveryReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Apply one input to the store; never propagates store errors
    pub fn apply<T: TimeSource>(
        &self,
        store: &mut MessageStore<T>,
        input: ReconcileInput,
    ) -> ReconcileResult {
        match input {
            ReconcileInput::AckSuccess {
                correlation_id,
                mut message,
            } => {
                // Acks may omit the echo; the emit-side token is authoritative.
                if message.correlation_id.is_none() {
                    message.correlation_id = Some(correlation_id);
                }
                self.merge(store, message)
            }
            ReconcileInput::AckError {
                correlation_id,
                reason,
            } => match store.mark_failed(&correlation_id) {
                Ok(true) => {
                    warn!(%correlation_id, %reason, "Server rejected message");
                    ReconcileResult::Failed
                }
                Ok(false) => ReconcileResult::Ignored,
                Err(e) => {
                    warn!(%correlation_id, error = %e, "Dropping send rejection");
                    ReconcileResult::Dropped
                }
            },
            ReconcileInput::NewMessage(message) => self.merge(store, message),
        }
    }

    fn merge<T: TimeSource>(
        &self,
        store: &mut MessageStore<T>,
        message: ConfirmedMessage,
    ) -> ReconcileResult {
        let message_id = message.id.clone();
        match store.reconcile_confirmed(message) {
            Ok(ReconcileOutcome::Duplicate) => {
                debug!(%message_id, "Confirmation already applied");
                ReconcileResult::Merged(ReconcileOutcome::Duplicate)
            }
            Ok(outcome) => ReconcileResult::Merged(outcome),
            Err(e) => {
                warn!(%message_id, error = %e, "Dropping confirmed message");
                ReconcileResult::Dropped
            }
        }
    }
}
