//! Sync Engine Task Implementation
//!
//! Owns the [`SyncState`] and serializes every command and event through it.

use std::time::Duration;

use courier_core::channel::{
    AppEventSender, CommandReceiver, EffectSender, EventReceiver, EventSender,
};
use courier_core::{
    AppEvent, Command, CourierError, Effect, Event, Result, SyncOutput, SyncSnapshot, SyncState,
    SystemTimeSource, TimeSource,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ----------------------------------------------------------------------------
// Engine Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub commands_processed: u64,
    pub events_processed: u64,
    pub effects_generated: u64,
    pub app_events_generated: u64,
    /// Inputs whose handler returned a non-fatal error
    pub errors_absorbed: u64,
}

// ----------------------------------------------------------------------------
// Sync Engine
// ----------------------------------------------------------------------------

/// The task that processes all commands and events
pub struct SyncEngine<T: TimeSource + Clone = SystemTimeSource> {
    state: SyncState<T>,
    command_receiver: CommandReceiver,
    event_receiver: EventReceiver,
    /// Loopback for timers armed by the engine itself
    event_sender: EventSender,
    effect_sender: EffectSender,
    app_event_sender: AppEventSender,
    snapshot_sender: watch::Sender<SyncSnapshot>,
    reconnect_timer: Option<JoinHandle<()>>,
    stats: EngineStats,
    running: bool,
}

impl<T: TimeSource + Clone + Send + 'static> SyncEngine<T> {
    pub fn new(
        state: SyncState<T>,
        command_receiver: CommandReceiver,
        event_receiver: EventReceiver,
        event_sender: EventSender,
        effect_sender: EffectSender,
        app_event_sender: AppEventSender,
        snapshot_sender: watch::Sender<SyncSnapshot>,
    ) -> Self {
        snapshot_sender.send_replace(state.snapshot());
        Self {
            state,
            command_receiver,
            event_receiver,
            event_sender,
            effect_sender,
            app_event_sender,
            snapshot_sender,
            reconnect_timer: None,
            stats: EngineStats::default(),
            running: true,
        }
    }

    /// Run the engine loop until shutdown or a fatal error
    pub async fn run(&mut self) -> Result<()> {
        info!(self_id = %self.state.self_id(), "Sync engine starting");

        while self.running {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    let Some(command) = command else {
                        info!("Command channel closed, shutting down");
                        break;
                    };
                    if matches!(command, Command::Shutdown) {
                        info!("Shutdown requested");
                        self.say_goodbye().await;
                        self.running = false;
                        break;
                    }
                    self.stats.commands_processed += 1;
                    let result = self.state.handle_command(command);
                    if let Err(e) = self.dispatch(result, "command").await {
                        error!("Unrecoverable error processing command, shutting down sync engine: {}", e);
                        self.running = false;
                        return Err(e);
                    }
                }

                event = self.event_receiver.recv() => {
                    // The engine holds its own event sender, so this channel
                    // never closes while the loop runs.
                    let Some(event) = event else { break };
                    self.stats.events_processed += 1;
                    let result = self.state.handle_event(event);
                    if let Err(e) = self.dispatch(result, "event").await {
                        error!("Unrecoverable error processing event, shutting down sync engine: {}", e);
                        self.running = false;
                        return Err(e);
                    }
                }
            }
        }

        self.cancel_reconnect_timer();
        info!("Sync engine stopped");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn state(&self) -> &SyncState<T> {
        &self.state
    }

    /// Announce offline and close the server connection before stopping
    async fn say_goodbye(&mut self) {
        let result = self.state.handle_command(Command::Disconnect);
        if let Err(e) = self.dispatch(result, "shutdown").await {
            warn!("Could not close the connection cleanly: {}", e);
        }
    }

    /// Route handler output, classifying handler errors
    ///
    /// Only channel and configuration errors are returned; everything else
    /// is logged and the loop continues.
    async fn dispatch(&mut self, result: Result<SyncOutput>, input: &str) -> Result<()> {
        match result {
            Ok(output) => self.deliver(output).await?,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e @ CourierError::Store(_)) | Err(e @ CourierError::PeerChannel(_)) => {
                self.stats.errors_absorbed += 1;
                warn!("Rejected {}: {}", input, e);
                self.send_app_event(AppEvent::Error {
                    message: e.to_string(),
                })
                .await?;
            }
            Err(e) => {
                self.stats.errors_absorbed += 1;
                error!("Error processing {}: {}", input, e);
            }
        }
        self.publish_snapshot();
        Ok(())
    }

    async fn deliver(&mut self, output: SyncOutput) -> Result<()> {
        for effect in output.effects {
            self.send_effect(effect)?;
        }
        for app_event in output.app_events {
            self.send_app_event(app_event).await?;
        }
        Ok(())
    }

    /// Send effect to transport tasks; reconnect timers are handled here
    fn send_effect(&mut self, effect: Effect) -> Result<()> {
        self.stats.effects_generated += 1;
        if let Effect::ScheduleReconnect { delay, attempt } = effect {
            self.arm_reconnect_timer(delay, attempt);
            return Ok(());
        }

        debug!(?effect, "Sending effect");
        // A broadcast send only fails when no transport is subscribed
        if self.effect_sender.send(effect).is_err() {
            warn!("No transport task subscribed; effect dropped");
        }
        Ok(())
    }

    async fn send_app_event(&mut self, app_event: AppEvent) -> Result<()> {
        self.app_event_sender
            .send(app_event)
            .await
            .map_err(|_| CourierError::channel_error("App event channel closed"))?;
        self.stats.app_events_generated += 1;
        Ok(())
    }

    fn publish_snapshot(&self) {
        let snapshot = self.state.snapshot();
        self.snapshot_sender.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Replace any pending reconnect timer with one for `attempt`
    fn arm_reconnect_timer(&mut self, delay: Duration, attempt: u32) {
        self.cancel_reconnect_timer();
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        let sender = self.event_sender.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(Event::ReconnectTimerFired).await.is_err() {
                debug!("Engine gone before reconnect timer fired");
            }
        }));
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}
