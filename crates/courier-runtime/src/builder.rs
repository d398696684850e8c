//! Runtime Builder API
//!
//! Provides a builder-style API for consumers (CLI, tests) to plug in their
//! server connector, history service, local peer channel and storage, and get
//! back command, app-event and snapshot handles.

use std::sync::Arc;
use std::time::Duration;

use courier_core::channel::{
    create_app_event_channel, create_command_channel, create_effect_channel,
    create_effect_receiver, create_event_channel, AppEventReceiver, CommandSender, EventSender,
};
use courier_core::{
    Command, CourierConfig, CourierError, Event, Result, SyncSnapshot, SyncState,
    SystemTimeSource, UserId,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::logic::SyncEngine;
use crate::storage::{load_peer_book, KeyValueStore, MemoryKeyValueStore, PersistenceTask};
use crate::tasks::TransportTask;
use crate::transports::{
    CredentialProvider, HistoryApi, PeerChannel, PeerChannelTask, ResyncTask, ServerConnector,
    ServerTransportTask, StaticCredentials,
};

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for a Courier runtime: one sync engine plus its transport tasks
pub struct RuntimeBuilder {
    self_id: UserId,
    config: CourierConfig,
    connector: Option<Arc<dyn ServerConnector>>,
    credentials: Arc<dyn CredentialProvider>,
    history: Option<Arc<dyn HistoryApi>>,
    peer_channel: Option<Box<dyn PeerChannel>>,
    storage: Arc<dyn KeyValueStore>,
    transports: Vec<Box<dyn TransportTask>>,
    shutdown_timeout: Duration,
}

impl RuntimeBuilder {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            config: CourierConfig::default(),
            connector: None,
            credentials: Arc::new(StaticCredentials::signed_out()),
            history: None,
            peer_channel: None,
            storage: Arc::new(MemoryKeyValueStore::new()),
            transports: Vec::new(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_config(mut self, config: CourierConfig) -> Self {
        self.config = config;
        self
    }

    /// Server event stream; without one the client stays offline
    pub fn with_server(mut self, connector: Arc<dyn ServerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// History service used to resync after every (re)connect
    pub fn with_history(mut self, history: Arc<dyn HistoryApi>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_peer_channel(mut self, channel: Box<dyn PeerChannel>) -> Self {
        self.peer_channel = Some(channel);
        self
    }

    /// Storage for local peer histories (in-memory by default)
    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = storage;
        self
    }

    /// Add a custom transport task
    pub fn add_transport(mut self, transport: Box<dyn TransportTask>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build and start the runtime
    pub async fn build_and_start(self) -> Result<RuntimeHandle> {
        info!(self_id = %self.self_id, "Building Courier runtime");
        self.config.validate().map_err(CourierError::config_error)?;

        let channel_config = self.config.channels.clone();
        let (command_sender, command_receiver) = create_command_channel(&channel_config);
        let (app_event_sender, app_event_receiver) = create_app_event_channel(&channel_config);
        let (event_sender, event_receiver) = create_event_channel(&channel_config);
        let (effect_sender, _effect_receiver) = create_effect_channel(&channel_config);

        let mut state = SyncState::new(self.self_id.clone(), self.config.clone(), SystemTimeSource);
        let book = load_peer_book(self.storage.as_ref(), &self.config.peer.storage_key).await?;
        if !book.histories.is_empty() || !book.display_names.is_empty() {
            info!(peers = book.histories.len(), "Restored local peer book");
        }
        state.restore_peer_book(book);

        let mut transports = self.transports;
        transports.push(Box::new(PersistenceTask::new(self.storage.clone())));
        if let Some(connector) = self.connector.clone() {
            transports.push(Box::new(ServerTransportTask::new(
                self.self_id.clone(),
                self.config.connection.clone(),
                connector,
                self.credentials.clone(),
            )));
        }
        if let Some(history) = self.history {
            transports.push(Box::new(ResyncTask::new(history)));
        }
        if let Some(channel) = self.peer_channel {
            transports.push(Box::new(PeerChannelTask::new(
                channel,
                self.config.peer.discovery_timeout,
            )));
        }

        let mut transport_handles = Vec::with_capacity(transports.len());
        for mut transport in transports {
            transport.attach_channels(event_sender.clone(), create_effect_receiver(&effect_sender))?;
            let name = transport.name();
            transport_handles.push((
                name,
                tokio::spawn(async move {
                    let result = transport.run().await;
                    if let Err(e) = &result {
                        warn!(task = name, "Transport task failed: {}", e);
                    }
                    result
                }),
            ));
        }

        let (snapshot_sender, snapshot_receiver) =
            watch::channel(SyncSnapshot::empty(self.self_id.clone()));
        let mut engine = SyncEngine::new(
            state,
            command_receiver,
            event_receiver,
            event_sender.clone(),
            effect_sender,
            app_event_sender,
            snapshot_sender,
        );
        let engine_handle = tokio::spawn(async move { engine.run().await });

        let handle = RuntimeHandle {
            self_id: self.self_id,
            command_sender,
            event_sender,
            app_event_receiver: Some(app_event_receiver),
            snapshot_receiver,
            engine_handle: Some(engine_handle),
            transport_handles,
            shutdown_timeout: self.shutdown_timeout,
            running: true,
        };

        // Only a configured server can be signed in to
        if self.connector.is_some() {
            let authenticated = self.credentials.bearer_token().await.is_some();
            handle.set_authenticated(authenticated).await?;
        }

        info!("Courier runtime started");
        Ok(handle)
    }
}

// ----------------------------------------------------------------------------
// Runtime Handle
// ----------------------------------------------------------------------------

/// Handle to a running Courier runtime
///
/// App events must be drained: the engine waits when their buffer is full.
pub struct RuntimeHandle {
    self_id: UserId,
    command_sender: CommandSender,
    event_sender: EventSender,
    app_event_receiver: Option<AppEventReceiver>,
    snapshot_receiver: watch::Receiver<SyncSnapshot>,
    engine_handle: Option<JoinHandle<Result<()>>>,
    transport_handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
    shutdown_timeout: Duration,
    running: bool,
}

impl RuntimeHandle {
    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn command_sender(&self) -> CommandSender {
        self.command_sender.clone()
    }

    /// Take the app event receiver (can only be called once)
    pub fn take_app_event_receiver(&mut self) -> Option<AppEventReceiver> {
        self.app_event_receiver.take()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot_receiver.borrow().clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot_receiver.clone()
    }

    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.command_sender
            .send(command)
            .await
            .map_err(|_| CourierError::channel_error("Failed to send command to runtime"))
    }

    /// Report that the credential became available or was revoked
    pub async fn set_authenticated(&self, authenticated: bool) -> Result<()> {
        self.event_sender
            .send(Event::AuthChanged { authenticated })
            .await
            .map_err(|_| CourierError::channel_error("Failed to reach the sync engine"))
    }

    /// Check if the runtime is still running
    pub fn is_running(&self) -> bool {
        self.running
            && self
                .engine_handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for the engine to stop on its own
    pub async fn wait(&mut self) -> Result<()> {
        match self.engine_handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| CourierError::channel_error(format!("Sync engine panicked: {}", e)))?,
            None => Ok(()),
        }
    }

    /// Shutdown the runtime gracefully
    ///
    /// The engine closes the server connection first; transport tasks end when
    /// the engine drops the effect channel, and are aborted if they linger.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down Courier runtime");
        if let Err(e) = self.send_command(Command::Shutdown).await {
            warn!("Engine already gone: {}", e);
        }

        if let Some(handle) = self.engine_handle.take() {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(Err(e))) => warn!("Sync engine stopped with error: {}", e),
                Ok(Err(e)) => warn!("Sync engine panicked: {}", e),
                Err(_) => warn!("Sync engine did not stop in time"),
                Ok(Ok(Ok(()))) => {}
            }
        }

        for (name, mut handle) in self.transport_handles.drain(..) {
            if tokio::time::timeout(self.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(task = name, "Transport task did not stop in time, aborting");
                handle.abort();
            }
        }

        self.running = false;
        info!("Courier runtime shut down");
        Ok(())
    }
}
