//! History backfill
//!
//! The resync task answers `Effect::Resync` by fetching the conversation list
//! and the message history of every requested or listed conversation. Results
//! go back to the engine, which merges them through the same reconcile path as
//! pushed events.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::channel::{EffectReceiver, EventSender};
use courier_core::protocol::wire::{
    normalize_conversation, normalize_list, normalize_message, NormalizeContext,
};
use courier_core::{
    ConfirmedMessage, ConversationId, ConversationRecord, CourierError, Effect, Event, Result,
    Timestamp, TransportError, UserId,
};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::server::CredentialProvider;
use crate::tasks::{forward_event, next_effect, TaskChannels, TransportTask};

// ----------------------------------------------------------------------------
// History API
// ----------------------------------------------------------------------------

/// Request/response access to server-side history
#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn conversations(&self) -> Result<Vec<ConversationRecord>>;

    async fn history(&self, conversation_id: &ConversationId) -> Result<Vec<ConfirmedMessage>>;
}

/// [`HistoryApi`] over HTTP
///
/// `GET {base}/conversations` and `GET {base}/conversations/{id}/messages`,
/// both with the bearer token. Entries that fail normalization are skipped.
pub struct HttpHistoryApi {
    client: reqwest::Client,
    base_url: Url,
    credentials: Arc<dyn CredentialProvider>,
    self_id: UserId,
}

impl HttpHistoryApi {
    pub fn new(base_url: Url, credentials: Arc<dyn CredentialProvider>, self_id: UserId) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(CourierError::config_error(format!(
                "history URL {} cannot be a base",
                base_url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            credentials,
            self_id,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CourierError::config_error("history URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value> {
        let token = self
            .credentials
            .bearer_token()
            .await
            .ok_or(TransportError::MissingCredential)?;
        debug!(%url, "Fetching history");
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(http_error)?;
        response.json::<Value>().await.map_err(http_error)
    }

    fn context(&self) -> NormalizeContext<'_> {
        NormalizeContext {
            self_id: &self.self_id,
            now: Timestamp::now(),
        }
    }
}

fn http_error(e: reqwest::Error) -> CourierError {
    TransportError::Http {
        reason: e.to_string(),
    }
    .into()
}

#[async_trait]
impl HistoryApi for HttpHistoryApi {
    async fn conversations(&self) -> Result<Vec<ConversationRecord>> {
        let data = self.get_json(self.endpoint(&["conversations"])?).await?;
        let ctx = self.context();
        let (records, errors) =
            normalize_list(&data, "conversations", |entry| normalize_conversation(entry, ctx));
        for e in errors {
            warn!("Skipping conversation entry: {}", e);
        }
        Ok(records)
    }

    async fn history(&self, conversation_id: &ConversationId) -> Result<Vec<ConfirmedMessage>> {
        let url = self.endpoint(&["conversations", conversation_id.as_str(), "messages"])?;
        let data = self.get_json(url).await?;
        let ctx = self.context();
        let (messages, errors) =
            normalize_list(&data, "messages", |entry| normalize_message("history", entry, ctx));
        for e in errors {
            warn!(%conversation_id, "Skipping history entry: {}", e);
        }
        Ok(messages)
    }
}

// ----------------------------------------------------------------------------
// Resync Task
// ----------------------------------------------------------------------------

pub struct ResyncTask {
    channels: TaskChannels,
    api: Arc<dyn HistoryApi>,
}

impl ResyncTask {
    pub fn new(api: Arc<dyn HistoryApi>) -> Self {
        Self {
            channels: TaskChannels::default(),
            api,
        }
    }

    async fn resync(&self, requested: Vec<ConversationId>, events: &EventSender) -> Result<()> {
        let conversations = match self.api.conversations().await {
            Ok(conversations) => conversations,
            Err(e) => {
                let reason = format!("conversation list: {}", e);
                return forward_event(events, Event::ResyncFailed { reason }).await;
            }
        };

        let mut ids: BTreeSet<ConversationId> = requested.into_iter().collect();
        ids.extend(conversations.iter().map(|record| record.id.clone()));
        info!(
            listed = conversations.len(),
            backfilling = ids.len(),
            "Resyncing conversations"
        );
        forward_event(events, Event::ConversationsFetched { conversations }).await?;

        for conversation_id in ids {
            let event = match self.api.history(&conversation_id).await {
                Ok(messages) => Event::HistoryFetched {
                    conversation_id,
                    messages,
                },
                Err(e) => Event::ResyncFailed {
                    reason: format!("history of {}: {}", conversation_id, e),
                },
            };
            forward_event(events, event).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransportTask for ResyncTask {
    fn attach_channels(
        &mut self,
        event_sender: EventSender,
        effect_receiver: EffectReceiver,
    ) -> Result<()> {
        self.channels.attach(self.name(), event_sender, effect_receiver)
    }

    async fn run(&mut self) -> Result<()> {
        let (events, mut effects) = self.channels.take(self.name())?;
        info!("Resync task starting");

        while let Some(effect) = next_effect(&mut effects, "resync").await {
            if let Effect::Resync { conversation_ids } = effect {
                self.resync(conversation_ids, &events).await?;
            }
        }

        info!("Resync task stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "resync"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::server::StaticCredentials;

    fn api(base: &str) -> HttpHistoryApi {
        HttpHistoryApi::new(
            Url::parse(base).unwrap(),
            Arc::new(StaticCredentials::new("token")),
            UserId::new("me"),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_escapes_conversation_ids() {
        let api = api("https://chat.example.com/api/");
        let url = api
            .endpoint(&["conversations", "a/b c", "messages"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://chat.example.com/api/conversations/a%2Fb%20c/messages"
        );
    }

    #[test]
    fn test_endpoint_without_trailing_slash() {
        let api = api("https://chat.example.com/api");
        let url = api.endpoint(&["conversations"]).unwrap();
        assert_eq!(url.as_str(), "https://chat.example.com/api/conversations");
    }
}
