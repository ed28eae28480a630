//! Convo Core - Streaming Conversation Engine
//!
//! This crate turns the server-sent event streams of a chat/workflow API into
//! a render-ready conversation transcript. It has no UI of its own: a
//! terminal client, a web front end or a test harness drives a
//! [`ChatSession`] and renders [`ChatSession::thread`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Caller (CLI, UI, tests)                   │
//! │        send / stop / restart / switch_to_sibling              │
//! └───────────────────────────────┬───────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┴───────────────────────────────┐
//! │                        ChatSession                             │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────────────────────┐  │
//! │  │ Transcript │◄─┤  Reducer   │◄─┤  Stream events / fetches │  │
//! │  │   (tree)   │  │   (pure)   │  │  (primary, workflow feed)│  │
//! │  └────────────┘  └────────────┘  └────────────┬─────────────┘  │
//! │  ┌──────────────────┐  ┌──────────────────┐   │                │
//! │  │ Cancellation     │  │ Pause resumer    │   │                │
//! │  │ registry         │  │                  │   │                │
//! │  └──────────────────┘  └──────────────────┘   │                │
//! └───────────────────────────────────────────────┼────────────────┘
//!                                                 │
//! ┌───────────────────────────────────────────────┴────────────────┐
//! │        ChatBackend (HttpChatBackend: reqwest + SSE framing)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use convo_core::{ChatSession, EnrichmentOptions, HttpChatBackend, SendRequest};
//!
//! let config = convo_core::load_config()?;
//! let backend = HttpChatBackend::from_config(&config)?;
//! let mut session = ChatSession::new(backend, &config);
//!
//! session.send(
//!     "/chat-messages",
//!     SendRequest::new("hello"),
//!     EnrichmentOptions::from_config(&config),
//! );
//! while let Some(_update) = session.next_update().await {
//!     for turn in session.thread() {
//!         println!("{}", turn.content);
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`transcript`]: Turns, the turn tree and the active thread
//! - [`protocol`]: Stream events and wire frame decoding
//! - [`client`]: SSE client and the [`EventStream`] consumer
//! - [`reducer`]: Pure `(transcript, event) -> transcript` rules
//! - [`session`]: The session controller
//! - [`cancellation`]: Per-role cancellation handles
//! - [`resume`]: Workflow pause/resume planning
//! - [`inputs`]: Input-form validation and opening statement rendering
//! - [`backend`]: Chat backend abstraction and the HTTP implementation
//! - [`config`]: Engine configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cancellation;
pub mod client;
pub mod config;
pub mod error;
pub mod inputs;
pub mod protocol;
pub mod reducer;
pub mod resume;
pub mod session;
pub mod transcript;

// Re-exports for convenience
pub use backend::{ChatBackend, HttpChatBackend, PersistedMessage, PersistedThought};
pub use cancellation::{CancellationHandle, CancellationRegistry, StreamRole};
pub use client::{
    dispatch_event, EventStream, EventStreamClient, StreamHandler, StreamRequest,
    DEFAULT_STREAM_BUFFER,
};
pub use error::{EngineError, SendRejection};
pub use inputs::{process_inputs, render_opening_statement, InputField, InputKind};
pub use protocol::{
    ContainerKind, DataEvent, FrameDecoder, MessageEnd, MessageEndMetadata, StreamEvent,
    WorkflowStarted,
};
pub use resume::{ResumePlan, WorkflowPauseResumer};
pub use session::{ChatSession, EnrichmentOptions, SendRequest, SessionSnapshot, SessionUpdate};
pub use transcript::{
    AgentThoughtStep, Annotation, Exchange, FileRef, HumanInputForm, NodeStatus, NodeTrace, Transcript,
    Turn, TurnRole, WorkflowProcess, WorkflowStatus,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, EngineConfig, EngineToml,
};
