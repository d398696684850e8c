//! Channel Utilities for CSP Communication
//!
//! Bounded tokio channels sized from [`ChannelConfig`]: mpsc for commands,
//! events and app events, broadcast for effects so every transport task sees
//! every effect.

use crate::channel::communication::{AppEvent, Command, Effect, Event};
use crate::config::ChannelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel buffer is full")]
    ChannelFull,
    #[error("Channel is closed")]
    ChannelClosed,
}

pub type CommandSender = tokio::sync::mpsc::Sender<Command>;
pub type CommandReceiver = tokio::sync::mpsc::Receiver<Command>;
pub type EventSender = tokio::sync::mpsc::Sender<Event>;
pub type EventReceiver = tokio::sync::mpsc::Receiver<Event>;
pub type EffectSender = tokio::sync::broadcast::Sender<Effect>;
pub type EffectReceiver = tokio::sync::broadcast::Receiver<Effect>;
pub type AppEventSender = tokio::sync::mpsc::Sender<AppEvent>;
pub type AppEventReceiver = tokio::sync::mpsc::Receiver<AppEvent>;

// ----------------------------------------------------------------------------
// Channel Creation Utilities
// ----------------------------------------------------------------------------

/// Create bounded command channel (UI → Sync Engine)
pub fn create_command_channel(config: &ChannelConfig) -> (CommandSender, CommandReceiver) {
    tokio::sync::mpsc::channel(config.command_buffer_size)
}

/// Create bounded event channel (Transports → Sync Engine)
pub fn create_event_channel(config: &ChannelConfig) -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::channel(config.event_buffer_size)
}

/// Create broadcast effect channel (Sync Engine → Transports)
///
/// Transports get their receivers from [`create_effect_receiver`].
pub fn create_effect_channel(config: &ChannelConfig) -> (EffectSender, EffectReceiver) {
    tokio::sync::broadcast::channel(config.effect_buffer_size)
}

pub fn create_effect_receiver(effect_sender: &EffectSender) -> EffectReceiver {
    effect_sender.subscribe()
}

/// Create bounded app event channel (Sync Engine → UI)
pub fn create_app_event_channel(config: &ChannelConfig) -> (AppEventSender, AppEventReceiver) {
    tokio::sync::mpsc::channel(config.app_event_buffer_size)
}

// ----------------------------------------------------------------------------
// Non-blocking Send Utilities
// ----------------------------------------------------------------------------

/// Non-blocking send so UI code never waits on the engine
pub trait NonBlockingSend<T> {
    fn try_send_non_blocking(&self, message: T) -> Result<(), ChannelError>;
}

impl<T> NonBlockingSend<T> for tokio::sync::mpsc::Sender<T> {
    fn try_send_non_blocking(&self, message: T) -> Result<(), ChannelError> {
        self.try_send(message).map_err(|e| match e {
            tokio::sync::mpsc::error::TrySendError::Full(_) => ChannelError::ChannelFull,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => ChannelError::ChannelClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_effect_broadcast_reaches_all_subscribers() {
        let config = ChannelConfig::testing();
        let (sender, _keepalive) = create_effect_channel(&config);
        let mut first = create_effect_receiver(&sender);
        let mut second = create_effect_receiver(&sender);

        sender.send(Effect::OpenConnection).unwrap();
        assert_eq!(first.recv().await.unwrap(), Effect::OpenConnection);
        assert_eq!(second.recv().await.unwrap(), Effect::OpenConnection);
    }

    #[tokio::test]
    async fn test_non_blocking_send_reports_full() {
        let config = ChannelConfig {
            command_buffer_size: 1,
            ..ChannelConfig::testing()
        };
        let (sender, mut receiver) = create_command_channel(&config);

        sender.try_send_non_blocking(Command::Connect).unwrap();
        assert_eq!(
            sender.try_send_non_blocking(Command::Disconnect),
            Err(ChannelError::ChannelFull)
        );
        assert_eq!(receiver.recv().await, Some(Command::Connect));

        drop(receiver);
        assert_eq!(
            sender.try_send_non_blocking(Command::Connect),
            Err(ChannelError::ChannelClosed)
        );
    }
}
