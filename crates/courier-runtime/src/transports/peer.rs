//! Local peer channel task
//!
//! Drives a device-to-device radio (or anything that behaves like one) for the
//! offline mode. Command outcomes are reported back as [`PeerEvent`]s; nothing
//! is queued or retried here.

use std::time::Duration;

use async_trait::async_trait;
use courier_core::channel::{EffectReceiver, EventSender};
use courier_core::{
    DeviceAddress, Effect, Event, PeerChannelError, PeerEffect, PeerEvent, Result,
};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::tasks::{forward_event, next_effect, TaskChannels, TransportTask};

// ----------------------------------------------------------------------------
// Peer Channel Trait
// ----------------------------------------------------------------------------

/// A nearby-device channel such as Bluetooth LE
#[async_trait]
pub trait PeerChannel: Send {
    async fn start_discovery(&mut self) -> std::result::Result<(), PeerChannelError>;

    async fn stop_discovery(&mut self) -> std::result::Result<(), PeerChannelError>;

    /// Resolves once the link is usable
    async fn connect(&mut self, address: &DeviceAddress) -> std::result::Result<(), PeerChannelError>;

    async fn disconnect(&mut self, address: &DeviceAddress)
        -> std::result::Result<(), PeerChannelError>;

    /// Fire-and-forget write; `Ok` means the channel accepted the text
    async fn send(
        &mut self,
        address: &DeviceAddress,
        text: &str,
    ) -> std::result::Result<(), PeerChannelError>;

    /// Discoveries, inbound texts and remote disconnects; `None` when the
    /// channel is gone for good. Must be cancel safe.
    async fn next_event(&mut self) -> Option<PeerEvent>;
}

/// Channel for hosts without a local radio; every request fails visibly
#[derive(Debug, Default)]
pub struct UnavailablePeerChannel;

#[async_trait]
impl PeerChannel for UnavailablePeerChannel {
    async fn start_discovery(&mut self) -> std::result::Result<(), PeerChannelError> {
        Err(PeerChannelError::Unavailable)
    }

    async fn stop_discovery(&mut self) -> std::result::Result<(), PeerChannelError> {
        Ok(())
    }

    async fn connect(&mut self, _address: &DeviceAddress) -> std::result::Result<(), PeerChannelError> {
        Err(PeerChannelError::Unavailable)
    }

    async fn disconnect(
        &mut self,
        _address: &DeviceAddress,
    ) -> std::result::Result<(), PeerChannelError> {
        Ok(())
    }

    async fn send(
        &mut self,
        _address: &DeviceAddress,
        _text: &str,
    ) -> std::result::Result<(), PeerChannelError> {
        Err(PeerChannelError::Unavailable)
    }

    async fn next_event(&mut self) -> Option<PeerEvent> {
        std::future::pending().await
    }
}

// ----------------------------------------------------------------------------
// Peer Channel Task
// ----------------------------------------------------------------------------

pub struct PeerChannelTask {
    channels: TaskChannels,
    channel: Box<dyn PeerChannel>,
    discovery_timeout: Duration,
    /// When running discovery is stopped automatically
    discovery_deadline: Option<Instant>,
    channel_closed: bool,
}

impl PeerChannelTask {
    pub fn new(channel: Box<dyn PeerChannel>, discovery_timeout: Duration) -> Self {
        Self {
            channels: TaskChannels::default(),
            channel,
            discovery_timeout,
            discovery_deadline: None,
            channel_closed: false,
        }
    }

    async fn run_loop(&mut self, events: EventSender, mut effects: EffectReceiver) -> Result<()> {
        info!("Local peer channel task starting");

        loop {
            tokio::select! {
                effect = next_effect(&mut effects, "peer") => {
                    let Some(effect) = effect else {
                        info!("Effect channel closed, shutting down local peer channel task");
                        break;
                    };
                    if let Effect::Peer(effect) = effect {
                        if let Some(event) = self.apply(effect).await {
                            forward_event(&events, Event::Peer(event)).await?;
                        }
                    }
                }

                event = self.channel.next_event(), if !self.channel_closed => {
                    match event {
                        Some(event) => forward_event(&events, Event::Peer(event)).await?,
                        None => {
                            warn!("Local peer channel closed");
                            self.channel_closed = true;
                        }
                    }
                }

                _ = discovery_expiry(self.discovery_deadline) => {
                    self.discovery_deadline = None;
                    info!("Discovery timed out");
                    if let Err(e) = self.channel.stop_discovery().await {
                        warn!("Failed to stop discovery: {}", e);
                    }
                    forward_event(&events, Event::Peer(PeerEvent::DiscoveryStopped)).await?;
                }
            }
        }

        info!("Local peer channel task stopped");
        Ok(())
    }

    /// Perform one request; the returned event reports its outcome
    async fn apply(&mut self, effect: PeerEffect) -> Option<PeerEvent> {
        debug!(?effect, "Local peer request");
        match effect {
            PeerEffect::StartDiscovery => match self.channel.start_discovery().await {
                Ok(()) => {
                    self.discovery_deadline = Some(Instant::now() + self.discovery_timeout);
                    None
                }
                Err(e) => Some(PeerEvent::DiscoveryFailed {
                    reason: e.to_string(),
                }),
            },
            PeerEffect::StopDiscovery => {
                self.discovery_deadline = None;
                if let Err(e) = self.channel.stop_discovery().await {
                    warn!("Failed to stop discovery: {}", e);
                }
                None
            }
            PeerEffect::Connect { address } => match self.channel.connect(&address).await {
                Ok(()) => Some(PeerEvent::Connected { address }),
                Err(e) => Some(PeerEvent::ConnectFailed {
                    address,
                    reason: e.to_string(),
                }),
            },
            PeerEffect::Disconnect { address } => {
                if let Err(e) = self.channel.disconnect(&address).await {
                    warn!(%address, "Disconnect reported an error: {}", e);
                }
                Some(PeerEvent::Disconnected { address })
            }
            PeerEffect::Send { address, text } => match self.channel.send(&address, &text).await {
                Ok(()) => Some(PeerEvent::SendAccepted { address, text }),
                Err(e) => Some(PeerEvent::SendFailed {
                    address,
                    reason: e.to_string(),
                }),
            },
        }
    }
}

async fn discovery_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl TransportTask for PeerChannelTask {
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
        "peer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_channel_reports_failures() {
        let mut task = PeerChannelTask::new(
            Box::new(UnavailablePeerChannel),
            Duration::from_secs(1),
        );
        let address = DeviceAddress::new("AA:BB");

        let event = task.apply(PeerEffect::StartDiscovery).await;
        assert!(matches!(event, Some(PeerEvent::DiscoveryFailed { .. })));
        assert!(task.discovery_deadline.is_none());

        let event = task
            .apply(PeerEffect::Send {
                address: address.clone(),
                text: "hi".to_string(),
            })
            .await;
        assert!(matches!(event, Some(PeerEvent::SendFailed { .. })));

        let event = task.apply(PeerEffect::Disconnect { address: address.clone() }).await;
        assert_eq!(event, Some(PeerEvent::Disconnected { address }));
    }
}
