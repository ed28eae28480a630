//! HTTP Backend Implementation
//!
//! Chat backend over a Dify-style REST API.
//!
//! # API
//!
//! - `POST /chat-messages` (and other send endpoints) - SSE answer stream
//! - `GET /workflow/{run}/events` - SSE feed of a paused workflow run
//! - `GET /messages?conversation_id=` - finalized messages
//! - `GET /messages/{id}/suggested-questions` - follow-up suggestions
//! - `POST /chat-messages/{task_id}/stop` - stop generation

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::traits::{ChatBackend, PersistedMessage};
use crate::client::{EventStream, EventStreamClient, StreamRequest};
use crate::config::EngineConfig;
use crate::error::EngineError;

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// Chat backend over HTTP
#[derive(Clone, Debug)]
pub struct HttpChatBackend {
    /// API base URL (no trailing slash)
    base_url: String,
    /// HTTP client for one-shot requests
    http_client: reqwest::Client,
    /// SSE client sharing the same connection pool
    streams: EventStreamClient,
}

impl HttpChatBackend {
    /// Create a backend over an existing HTTP client
    pub fn new(base_url: impl Into<String>, http_client: reqwest::Client, stream_buffer: usize) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            streams: EventStreamClient::new(http_client.clone(), stream_buffer),
            base_url,
            http_client,
        }
    }

    /// Create from the engine configuration
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Http`] if the HTTP client cannot be built.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self::new(
            config.base_url.clone(),
            http_client,
            config.stream_buffer,
        ))
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, EngineError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    fn name(&self) -> &str {
        "HTTP"
    }

    fn resolve_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }

    fn open_stream(&self, request: StreamRequest) -> EventStream {
        self.streams.open(request)
    }

    async fn fetch_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<PersistedMessage>, EngineError> {
        let response = self
            .http_client
            .get(self.resolve_url("/messages"))
            .query(&[("conversation_id", conversation_id)])
            .send()
            .await?;
        let envelope: DataEnvelope<Vec<PersistedMessage>> = Self::read_json(response).await?;
        Ok(envelope.data)
    }

    async fn fetch_suggested_questions(
        &self,
        message_id: &str,
    ) -> Result<Vec<String>, EngineError> {
        let url = self.resolve_url(&format!("/messages/{message_id}/suggested-questions"));
        let response = self.http_client.get(url).send().await?;
        let envelope: DataEnvelope<Vec<String>> = Self::read_json(response).await?;
        Ok(envelope.data)
    }

    async fn stop_task(&self, task_id: &str) -> Result<(), EngineError> {
        let url = self.resolve_url(&format!("/chat-messages/{task_id}/stop"));
        let response = self
            .http_client
            .post(url)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> HttpChatBackend {
        HttpChatBackend::new("https://chat.example.com/api/", reqwest::Client::new(), 8)
    }

    #[test]
    fn test_resolve_url() {
        let backend = backend();
        assert_eq!(backend.base_url(), "https://chat.example.com/api");
        assert_eq!(
            backend.resolve_url("/chat-messages"),
            "https://chat.example.com/api/chat-messages"
        );
        assert_eq!(
            backend.resolve_url("workflow/run-1/events"),
            "https://chat.example.com/api/workflow/run-1/events"
        );
        assert_eq!(
            backend.resolve_url("http://other.example.com/x"),
            "http://other.example.com/x"
        );
    }

    #[test]
    fn test_from_config() {
        let config = EngineConfig::default();
        let backend = HttpChatBackend::from_config(&config).unwrap();
        assert_eq!(backend.name(), "HTTP");
        assert_eq!(backend.base_url(), config.base_url);
    }
}
