//! Chat Backend Integration
//!
//! Abstracted access to the chat API through the [`ChatBackend`] trait: the
//! primary and workflow event streams, the post-completion enrichment reads,
//! and the out-of-band stop request.
//!
//! # Available Backends
//!
//! - **HTTP**: SSE over reqwest against a Dify-style chat API
//!
//! # Usage
//!
//! ```ignore
//! use convo_core::backend::{ChatBackend, HttpChatBackend};
//! use convo_core::config::load_config;
//!
//! let backend = HttpChatBackend::from_config(&load_config()?)?;
//! let questions = backend.fetch_suggested_questions("m1").await?;
//! ```

mod http;
mod traits;

pub use http::HttpChatBackend;
pub use traits::{ChatBackend, PersistedMessage, PersistedThought};
