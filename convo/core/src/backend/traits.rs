//! Chat Backend Traits
//!
//! The seam between the session controller and the network. The session
//! only talks to a [`ChatBackend`], so tests drive it with scripted streams
//! instead of a server.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Deserialize;

use crate::client::{EventStream, StreamRequest};
use crate::error::EngineError;
use crate::transcript::MoreInfo;

/// A reasoning step as persisted by the server (only the text is used)
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PersistedThought {
    /// Step id
    pub id: String,
    /// Reasoning text
    pub thought: String,
}

/// A finalized message as returned by the conversation-messages read
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PersistedMessage {
    /// Message id (matches the settled Answer id)
    pub id: String,
    /// Conversation id
    pub conversation_id: Option<String>,
    /// Persisted answer text
    pub answer: String,
    /// Prompt tokens
    pub message_tokens: u64,
    /// Answer tokens
    pub answer_tokens: u64,
    /// Provider latency in seconds
    pub provider_response_latency: f64,
    /// Unix timestamp (seconds)
    pub created_at: i64,
    /// Reasoning steps
    pub agent_thoughts: Vec<PersistedThought>,
}

impl PersistedMessage {
    /// Timing and token summary shown under the answer
    #[must_use]
    pub fn more_info(&self) -> MoreInfo {
        let time = DateTime::from_timestamp(self.created_at, 0)
            .map(|utc| utc.with_timezone(&Local).format("%I:%M %p").to_string())
            .unwrap_or_default();
        let latency = self.provider_response_latency;

        #[allow(clippy::cast_precision_loss)]
        let tokens_per_second = (latency > 0.0)
            .then(|| format!("{:.2}", self.answer_tokens as f64 / latency));

        MoreInfo {
            time,
            tokens: self.message_tokens + self.answer_tokens,
            latency: format!("{latency:.2}"),
            tokens_per_second,
        }
    }

    /// Answer text to show once settled
    ///
    /// Empty when the last reasoning step already holds the whole answer
    /// (agent answers stream their final text into the last thought).
    #[must_use]
    pub fn display_answer(&self) -> String {
        match self.agent_thoughts.last() {
            Some(last) if last.thought == self.answer => String::new(),
            _ => self.answer.clone(),
        }
    }
}

/// Trait for chat backends
///
/// Stream opening is synchronous: connection failures surface inside the
/// returned [`EventStream`] as `Error` + `Completed { has_error: true }`.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Get the backend name (e.g., "HTTP")
    fn name(&self) -> &str;

    /// Resolve an endpoint (absolute URL or path under the API base)
    fn resolve_url(&self, endpoint: &str) -> String;

    /// Open an event stream
    fn open_stream(&self, request: StreamRequest) -> EventStream;

    /// Read the finalized messages of a conversation
    async fn fetch_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<PersistedMessage>, EngineError>;

    /// Read suggested follow-up questions for an answer
    async fn fetch_suggested_questions(&self, message_id: &str)
        -> Result<Vec<String>, EngineError>;

    /// Ask the server to stop generating for a task
    async fn stop_task(&self, task_id: &str) -> Result<(), EngineError>;

    /// Find one persisted message by id
    async fn fetch_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<PersistedMessage>, EngineError> {
        let messages = self.fetch_conversation_messages(conversation_id).await?;
        Ok(messages.into_iter().find(|m| m.id == message_id))
    }
}
