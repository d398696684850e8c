//! Transport task contract
//!
//! Every task that talks to the outside world (server socket, history
//! service, local radio, persistence) receives effects from the sync engine
//! over the broadcast channel and reports back over the event channel.

use async_trait::async_trait;
use courier_core::channel::{EffectReceiver, EventSender};
use courier_core::{CourierError, Effect, Event, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

// ----------------------------------------------------------------------------
// Transport Task Trait
// ----------------------------------------------------------------------------

/// A long-running task wired to the sync engine's channels
#[async_trait]
pub trait TransportTask: Send {
    /// Attach the event sender and an effect subscription before `run`
    fn attach_channels(
        &mut self,
        event_sender: EventSender,
        effect_receiver: EffectReceiver,
    ) -> Result<()>;

    /// Run until the effect channel closes
    async fn run(&mut self) -> Result<()>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

// ----------------------------------------------------------------------------
// Shared Helpers
// ----------------------------------------------------------------------------

/// Attached channels, taken once by `run`
#[derive(Debug, Default)]
pub(crate) struct TaskChannels {
    event_sender: Option<EventSender>,
    effect_receiver: Option<EffectReceiver>,
}

impl TaskChannels {
    pub(crate) fn attach(
        &mut self,
        task: &str,
        event_sender: EventSender,
        effect_receiver: EffectReceiver,
    ) -> Result<()> {
        if self.event_sender.is_some() || self.effect_receiver.is_some() {
            return Err(CourierError::config_error(format!(
                "{} channels already attached",
                task
            )));
        }
        self.event_sender = Some(event_sender);
        self.effect_receiver = Some(effect_receiver);
        Ok(())
    }

    pub(crate) fn take(&mut self, task: &str) -> Result<(EventSender, EffectReceiver)> {
        match (self.event_sender.take(), self.effect_receiver.take()) {
            (Some(events), Some(effects)) => Ok((events, effects)),
            _ => Err(CourierError::config_error(format!(
                "{} started without attached channels",
                task
            ))),
        }
    }
}

/// Next effect from the broadcast channel; `None` once it is closed
///
/// A lagging receiver skips what it missed and keeps going.
pub(crate) async fn next_effect(receiver: &mut EffectReceiver, task: &str) -> Option<Effect> {
    loop {
        match receiver.recv().await {
            Ok(effect) => return Some(effect),
            Err(RecvError::Lagged(skipped)) => {
                warn!(task, skipped, "Effect receiver lagged, skipping effects");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Forward an event to the sync engine
pub(crate) async fn forward_event(sender: &EventSender, event: Event) -> Result<()> {
    sender
        .send(event)
        .await
        .map_err(|_| CourierError::channel_error("Event channel closed"))
}
