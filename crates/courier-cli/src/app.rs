//! Courier CLI application
//!
//! Wires the configured server endpoints, credential and local storage into a
//! Courier runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

use courier_core::channel::AppEventReceiver;
use courier_core::{Command, CourierError, SyncSnapshot, UserId};
use courier_runtime::{
    CredentialProvider, FileKeyValueStore, HttpHistoryApi, RuntimeBuilder, RuntimeHandle,
    StaticCredentials, UnavailablePeerChannel, WsConnector,
};

use crate::config::{CliAppConfig, ConfigError};
use crate::error::{CliError, Result};

/// A running Courier client
pub struct CourierApp {
    config: CliAppConfig,
    self_id: UserId,
    handle: RuntimeHandle,
}

impl CourierApp {
    /// Build and start the runtime described by `config`
    pub async fn start(config: CliAppConfig) -> Result<Self> {
        let self_id = config.user_id()?;
        let builder = Self::runtime_builder(&config, self_id.clone())?;
        let handle = builder.build_and_start().await?;
        info!(user = %self_id, server = %config.server.ws_url, "Courier client started");
        Ok(Self {
            config,
            self_id,
            handle,
        })
    }

    /// Runtime wiring for a configuration; nothing is dialed until started
    pub fn runtime_builder(config: &CliAppConfig, self_id: UserId) -> Result<RuntimeBuilder> {
        let credentials: Arc<dyn CredentialProvider> = match &config.server.token {
            Some(token) => Arc::new(StaticCredentials::new(token.clone())),
            None => {
                info!("No token configured; staying signed out");
                Arc::new(StaticCredentials::signed_out())
            }
        };

        let ws_url = parse_url(&config.server.ws_url, "server.ws_url")?;
        let connector = Arc::new(WsConnector::new(ws_url)?);
        let data_dir = config.data_dir()?;
        debug!(data_dir = %data_dir.display(), "Local peer store");

        let mut builder = RuntimeBuilder::new(self_id.clone())
            .with_config(config.core.clone())
            .with_server(connector)
            .with_credentials(credentials.clone())
            .with_storage(Arc::new(FileKeyValueStore::new(data_dir)))
            .with_peer_channel(Box::new(UnavailablePeerChannel));

        if let Some(history_url) = &config.server.history_url {
            let base = parse_url(history_url, "server.history_url")?;
            builder = builder.with_history(Arc::new(HttpHistoryApi::new(base, credentials, self_id)?));
        }
        Ok(builder)
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn config(&self) -> &CliAppConfig {
        &self.config
    }

    /// How long one-shot commands wait on the server
    pub fn wait_limit(&self) -> Duration {
        Duration::from_secs(self.config.cli.wait_secs)
    }

    pub fn take_events(&mut self) -> Result<AppEventReceiver> {
        self.handle
            .take_app_event_receiver()
            .ok_or_else(|| CliError::Courier(CourierError::channel_error("app events already taken")))
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        Ok(self.handle.send_command(command).await?)
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.handle.snapshot()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<SyncSnapshot> {
        self.handle.subscribe_snapshots()
    }

    /// Wait until the snapshot satisfies `predicate` or the wait limit passes
    pub async fn wait_for(&self, what: &str, predicate: impl Fn(&SyncSnapshot) -> bool) -> Result<SyncSnapshot> {
        let mut snapshots = self.subscribe_snapshots();
        let limit = self.wait_limit();
        tokio::time::timeout(limit, async {
            loop {
                {
                    let current = snapshots.borrow_and_update();
                    if predicate(&current) {
                        return Ok(current.clone());
                    }
                }
                if snapshots.changed().await.is_err() {
                    return Err(CliError::Courier(CourierError::channel_error("engine stopped")));
                }
            }
        })
        .await
        .map_err(|_| CliError::Timeout(what.to_string()))?
    }

    pub async fn stop(mut self) -> Result<()> {
        Ok(self.handle.shutdown().await?)
    }
}

fn parse_url(value: &str, field: &str) -> Result<Url> {
    Url::parse(value)
        .map_err(|e| CliError::Config(ConfigError::Validation(format!("{}: {}", field, e))))
}
