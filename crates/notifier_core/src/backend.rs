use std::future;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use shared::{
    domain::{IdentitySelector, TopicId},
    protocol::{BackendEvent, JoinResponse, TopicSummary},
};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::warn;
use url::Url;

use crate::error::ConnectError;

/// Push frames of one authenticated connection. The stream ends when the
/// transport closes; an `Err` item means the transport failed.
pub type EventStream = BoxStream<'static, Result<BackendEvent>>;

/// The messaging backend as seen by the engine.
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<EventStream, ConnectError>;

    async fn discover_topics(
        &self,
        credential: &str,
        selector: &IdentitySelector,
    ) -> Result<Vec<TopicSummary>>;

    async fn join(&self, credential: &str, topic_id: &TopicId) -> Result<JoinResponse>;
}

/// Websocket push stream plus HTTP request/response calls against one
/// backend base URL.
pub struct WsBackend {
    http: Client,
    base_url: Url,
}

impl WsBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid backend url: {base_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("backend url must start with http:// or https://"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("backend url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn ws_url(&self, credential: &str) -> Result<Url> {
        let mut url = self.endpoint(&["ws"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("failed to derive websocket url from {}", self.base_url))?;
        url.query_pairs_mut().append_pair("token", credential);
        Ok(url)
    }
}

fn map_handshake_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(
                StatusCode::from_u16(response.status().as_u16()),
                Ok(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            ) =>
        {
            ConnectError::AuthRejected(format!("handshake refused with {}", response.status()))
        }
        other => ConnectError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl MessagingBackend for WsBackend {
    async fn authenticate(&self, credential: &str) -> Result<EventStream, ConnectError> {
        let ws_url = self
            .ws_url(credential)
            .map_err(|err| ConnectError::Unreachable(err.to_string()))?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(map_handshake_error)?;
        let (_, ws_reader) = ws_stream.split();

        let events = ws_reader
            .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| async move {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<BackendEvent>(&text) {
                        Ok(event) => Some(Ok(event)),
                        Err(err) => {
                            warn!(%err, "dropping undecodable backend frame");
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(err) => Some(Err(anyhow!("websocket receive failed: {err}"))),
                }
            })
            .boxed();
        Ok(events)
    }

    async fn discover_topics(
        &self,
        credential: &str,
        selector: &IdentitySelector,
    ) -> Result<Vec<TopicSummary>> {
        let url = self.endpoint(&["topics"])?;
        let topics = self
            .http
            .get(url)
            .bearer_auth(credential)
            .query(&[
                ("role", selector.role.as_str()),
                ("identity_code", selector.identity_code.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(topics)
    }

    async fn join(&self, credential: &str, topic_id: &TopicId) -> Result<JoinResponse> {
        let url = self.endpoint(&["topics", topic_id.as_str(), "join"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(credential)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
