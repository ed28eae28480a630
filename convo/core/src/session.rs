//! Chat Session Controller
//!
//! [`ChatSession`] is the caller-facing surface of the engine: `send`,
//! `stop`, `restart` and `switch_to_sibling`, plus read access to the live
//! transcript.
//!
//! # Design Philosophy
//!
//! The session exclusively owns the transcript and is the only thing that
//! applies reducer passes to it. Network work happens elsewhere (stream
//! reader tasks, spawned enrichment fetches) and reaches the session as
//! messages; the caller drives the session with [`ChatSession::next_update`]
//! or [`ChatSession::poll`], so reducer passes never overlap.
//!
//! Observers that don't drive the session can [`ChatSession::subscribe`] to a
//! `watch` channel of [`SessionSnapshot`]s.

use std::mem;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::backend::{ChatBackend, PersistedMessage};
use crate::cancellation::{CancellationHandle, CancellationRegistry, StreamRole};
use crate::client::{EventStream, StreamRequest};
use crate::config::EngineConfig;
use crate::error::{EngineError, SendRejection};
use crate::inputs::{self, InputField};
use crate::protocol::StreamEvent;
use crate::reducer::{self, AnnotationEdit};
use crate::resume::{ResumePlan, WorkflowPauseResumer};
use crate::transcript::{Exchange, Transcript, Turn};

// ============================================================================
// Requests and options
// ============================================================================

/// What the user is sending
#[derive(Clone, Debug, Default)]
pub struct SendRequest {
    /// The question text
    pub query: String,
    /// Input variable values
    pub inputs: Map<String, Value>,
    /// Attached files, as the API expects them
    pub files: Vec<Value>,
    /// Answer to follow up on (defaults to the last answer of the thread)
    pub parent_message_id: Option<String>,
    /// Extra body fields passed through unchanged
    pub extra: Map<String, Value>,
}

impl SendRequest {
    /// A plain question
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Set one input variable
    #[must_use]
    pub fn with_input(mut self, variable: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(variable.into(), value);
        self
    }

    /// Attach a file
    #[must_use]
    pub fn with_file(mut self, file: Value) -> Self {
        self.files.push(file);
        self
    }

    /// Follow up on a specific answer
    #[must_use]
    pub fn with_parent(mut self, parent_message_id: impl Into<String>) -> Self {
        self.parent_message_id = Some(parent_message_id.into());
        self
    }

    /// Add an extra body field
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Which post-completion reads to issue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnrichmentOptions {
    /// Refetch the persisted message to attach timing/token metadata
    pub fetch_conversation_messages: bool,
    /// Fetch suggested follow-up questions
    pub suggested_questions: bool,
}

impl EnrichmentOptions {
    /// No enrichment at all
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// What the configuration enables
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            fetch_conversation_messages: config.fetch_conversation_messages,
            suggested_questions: config.suggested_questions_after_answer,
        }
    }
}

// ============================================================================
// Updates and snapshots
// ============================================================================

/// Something the session did while being driven
#[derive(Debug)]
pub enum SessionUpdate {
    /// A stream event was applied to the transcript
    Changed {
        /// Which stream delivered it
        role: StreamRole,
    },
    /// The workflow paused waiting for human input
    Paused {
        /// Paused run
        workflow_run_id: String,
        /// Answer awaiting input
        answer_id: String,
    },
    /// A stream ended
    Completed {
        /// Which stream ended
        role: StreamRole,
        /// Whether it ended in error
        has_error: bool,
    },
    /// A stream failed; the in-progress answer was discarded
    /// (a resumed branch is kept as it was)
    Failed {
        /// Which stream failed
        role: StreamRole,
        /// What went wrong
        error: EngineError,
    },
    /// Persisted metadata was merged into an answer
    Enriched {
        /// The enriched answer
        answer_id: String,
    },
    /// Suggested follow-up questions arrived
    SuggestedQuestions(Vec<String>),
}

/// Render-ready view of a session
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
    /// The active thread
    pub thread: Vec<Turn>,
    /// Whether a response is streaming
    pub is_responding: bool,
    /// Server-assigned conversation id
    pub conversation_id: Option<String>,
    /// Suggested follow-up questions for the last answer
    pub suggested_questions: Vec<String>,
}

// ============================================================================
// Internal plumbing
// ============================================================================

#[derive(Debug)]
enum FetchOutcome {
    Message {
        handle: CancellationHandle,
        answer_id: String,
        result: Result<Option<PersistedMessage>, EngineError>,
    },
    Suggestions {
        handle: CancellationHandle,
        answer_id: String,
        result: Result<Vec<String>, EngineError>,
    },
}

#[derive(Debug)]
enum Incoming {
    Primary(StreamEvent),
    Secondary(StreamEvent),
    Fetch(FetchOutcome),
}

async fn next_stream_event(slot: &mut Option<EventStream>) -> Option<StreamEvent> {
    match slot {
        Some(stream) => stream.next_event().await,
        None => None,
    }
}

// ============================================================================
// Session
// ============================================================================

/// A single conversation with a chat backend
pub struct ChatSession<B: ChatBackend> {
    backend: Arc<B>,
    transcript: Transcript,

    // Caller configuration
    inputs_form: Vec<InputField>,
    opening_template: Option<String>,
    opening_questions: Vec<String>,
    enrichment: EnrichmentOptions,
    inputs: Map<String, Value>,

    // Server-assigned state
    conversation_id: Option<String>,
    task_id: Option<String>,
    suggested_questions: Vec<String>,

    // Streams and fetches
    registry: CancellationRegistry,
    primary: Option<EventStream>,
    secondary: Option<EventStream>,
    secondary_answer_id: Option<String>,
    secondary_running: bool,
    fetch_tx: mpsc::UnboundedSender<FetchOutcome>,
    fetch_rx: mpsc::UnboundedReceiver<FetchOutcome>,
    pending_fetches: usize,

    // Round-trip state
    resumer: WorkflowPauseResumer,
    active_branch_id: Option<String>,
    primary_detached: bool,
    paused: bool,
    user_stopped: bool,

    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl<B: ChatBackend> ChatSession<B> {
    /// Create a session
    pub fn new(backend: B, config: &EngineConfig) -> Self {
        Self::with_shared_backend(Arc::new(backend), config)
    }

    /// Create a session over a shared backend
    pub fn with_shared_backend(backend: Arc<B>, config: &EngineConfig) -> Self {
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());

        let mut session = Self {
            backend,
            transcript: Transcript::new(),
            inputs_form: config.inputs_form.clone(),
            opening_template: config.opening_statement.clone(),
            opening_questions: config.suggested_questions.clone(),
            enrichment: EnrichmentOptions::from_config(config),
            inputs: Map::new(),
            conversation_id: None,
            task_id: None,
            suggested_questions: Vec::new(),
            registry: CancellationRegistry::new(),
            primary: None,
            secondary: None,
            secondary_answer_id: None,
            secondary_running: false,
            fetch_tx,
            fetch_rx,
            pending_fetches: 0,
            resumer: WorkflowPauseResumer::new(),
            active_branch_id: None,
            primary_detached: false,
            paused: false,
            user_stopped: false,
            snapshot_tx,
        };
        session.refresh_opening_statement();
        session.publish();
        session
    }

    /// Start from existing turns (e.g. a conversation loaded from history)
    #[must_use]
    pub fn with_history(mut self, turns: Vec<Turn>, conversation_id: Option<String>) -> Self {
        self.transcript = Transcript::from_turns(turns);
        self.refresh_opening_statement();
        self.conversation_id = conversation_id;
        self.publish();
        self
    }

    // ========================================================================
    // Read access
    // ========================================================================

    /// The active thread, opening statement first
    #[must_use]
    pub fn thread(&self) -> Vec<&Turn> {
        self.transcript.thread()
    }

    /// The whole transcript tree
    #[must_use]
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Whether a response is streaming
    #[must_use]
    pub fn is_responding(&self) -> bool {
        (self.primary.is_some() && !self.primary_detached) || self.secondary_running
    }

    /// Suggested follow-ups for the last answer
    #[must_use]
    pub fn suggested_questions(&self) -> &[String] {
        &self.suggested_questions
    }

    /// Server-assigned conversation id
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Task id of the current stream (for out-of-band stop)
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Watch the session's render-ready state
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Current render-ready state
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            thread: self.transcript.thread().into_iter().cloned().collect(),
            is_responding: self.is_responding(),
            conversation_id: self.conversation_id.clone(),
            suggested_questions: self.suggested_questions.clone(),
        }
    }

    /// Whether no stream is open and no fetch is outstanding
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none() && self.pending_fetches == 0
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Send a question
    ///
    /// Returns `false` (and changes nothing) when a response is already
    /// streaming or the inputs don't satisfy the input form.
    pub fn send(&mut self, endpoint: &str, request: SendRequest, enrichment: EnrichmentOptions) -> bool {
        match self.try_send(endpoint, request, enrichment) {
            Ok(()) => true,
            Err(rejection) => {
                tracing::info!(reason = %rejection, "Send rejected");
                false
            }
        }
    }

    /// Send a question, reporting why it was rejected
    ///
    /// # Errors
    ///
    /// Returns a [`SendRejection`] when a response is already streaming or
    /// the inputs don't satisfy the input form. Nothing is mutated and no
    /// request is made in that case.
    pub fn try_send(
        &mut self,
        endpoint: &str,
        request: SendRequest,
        enrichment: EnrichmentOptions,
    ) -> Result<(), SendRejection> {
        if self.is_responding() {
            return Err(SendRejection::AlreadyResponding);
        }
        let inputs = inputs::process_inputs(&self.inputs_form, &request.inputs)?;

        // A paused branch left waiting is no longer followed, nor is a
        // detached primary still draining
        self.registry.cancel(StreamRole::Primary);
        self.registry.cancel(StreamRole::WorkflowEvents);
        self.primary = None;
        self.secondary = None;
        self.secondary_answer_id = None;

        let parent_id = request.parent_message_id.clone().or_else(|| {
            self.transcript
                .thread()
                .iter()
                .rev()
                .find(|t| t.is_answer() && !t.is_opening_statement)
                .map(|t| t.id.clone())
        });

        let nonce = Uuid::new_v4();
        let mut question = Turn::question(
            format!("question-{nonce}"),
            request.query.clone(),
            parent_id.clone(),
        );
        question.conversation_id.clone_from(&self.conversation_id);
        let answer = Turn::placeholder_answer(format!("answer-placeholder-{nonce}"), question.id.clone());
        let answer_id = answer.id.clone();

        self.transcript.set_target(Some(answer_id.clone()));
        self.transcript = reducer::begin(mem::take(&mut self.transcript), Exchange::new(question, answer));

        let mut body = Map::new();
        body.insert("response_mode".to_string(), Value::from("streaming"));
        body.insert(
            "conversation_id".to_string(),
            Value::from(self.conversation_id.clone().unwrap_or_default()),
        );
        body.insert("query".to_string(), Value::from(request.query));
        body.insert("inputs".to_string(), Value::Object(inputs.clone()));
        body.insert("files".to_string(), Value::Array(request.files));
        body.insert(
            "parent_message_id".to_string(),
            parent_id.map_or(Value::Null, Value::from),
        );
        for (key, value) in request.extra {
            body.insert(key, value);
        }

        let url = self.backend.resolve_url(endpoint);
        tracing::info!(url = %url, answer_id = %answer_id, "Sending question");
        let stream = self
            .backend
            .open_stream(StreamRequest::post(url, Value::Object(body)));
        self.registry
            .register(StreamRole::Primary, stream.cancellation_handle());
        self.primary = Some(stream);

        self.inputs = inputs;
        self.refresh_opening_statement();
        self.enrichment = enrichment;
        self.suggested_questions.clear();
        self.active_branch_id = Some(answer_id);
        self.primary_detached = false;
        self.paused = false;
        self.user_stopped = false;

        self.publish();
        Ok(())
    }

    /// Stop everything in flight
    ///
    /// Cancels every stream and fetch, keeps the partial answer, and asks the
    /// server to stop the task (fire-and-forget, skipped while the workflow
    /// is paused for input). Safe to call repeatedly.
    pub fn stop(&mut self) {
        let was_streaming = self.primary.is_some() || self.secondary.is_some();
        let cancelled = self.registry.cancel_all();

        self.primary = None;
        self.secondary = None;
        self.secondary_running = false;
        self.reset_fetches();
        self.user_stopped = true;
        self.transcript = reducer::finalize(mem::take(&mut self.transcript));

        if was_streaming && !self.paused {
            if let Some(task_id) = self.task_id.clone() {
                self.request_task_stop(task_id);
            }
        }

        if cancelled > 0 {
            tracing::info!(cancelled, "Stopped in-flight operations");
        }
        self.publish();
    }

    /// Stop and start over with an empty conversation
    pub fn restart(&mut self) {
        self.stop();

        self.transcript = Transcript::new();
        self.refresh_opening_statement();
        self.conversation_id = None;
        self.task_id = None;
        self.suggested_questions.clear();
        self.resumer.reset();
        self.active_branch_id = None;
        self.secondary_answer_id = None;
        self.primary_detached = false;
        self.paused = false;

        tracing::info!("Session restarted");
        self.publish();
    }

    /// Show another branch of the conversation
    ///
    /// When the target answer is a workflow branch paused on human input,
    /// its event feed is opened; with a state snapshot unless it is the
    /// branch most recently streamed. Returns `false` for an unknown turn.
    pub fn switch_to_sibling(&mut self, turn_id: &str, enrichment: EnrichmentOptions) -> bool {
        let Some(turn) = self.transcript.get(turn_id) else {
            tracing::warn!(turn_id = %turn_id, "Switch to unknown turn ignored");
            return false;
        };

        let plan = WorkflowPauseResumer::plan_for_branch(turn, self.active_branch_id.as_deref());
        self.transcript.set_target(Some(turn_id.to_string()));

        if let Some(plan) = plan {
            if self.transcript.in_flight().is_some() {
                tracing::warn!(
                    turn_id = %turn_id,
                    "Branch not resumed while another answer is streaming"
                );
            } else {
                self.enrichment = enrichment;
                self.user_stopped = false;
                self.open_workflow_events(&plan);
            }
        }

        self.publish();
        true
    }

    /// Rewrite an answer's curated reply after an operator edited it
    ///
    /// Both the question and the answer take the edited texts. Returns
    /// `false` unless `answer_id` names a settled answer.
    pub fn edit_annotation(
        &mut self,
        answer_id: &str,
        query: impl Into<String>,
        answer: impl Into<String>,
    ) -> bool {
        self.annotate(
            answer_id,
            AnnotationEdit::Edited {
                query: query.into(),
                answer: answer.into(),
            },
        )
    }

    /// Attach a curated reply added from the logs
    ///
    /// The streamed answer text is kept; the reply is carried on the
    /// annotation.
    pub fn add_annotation(
        &mut self,
        answer_id: &str,
        annotation_id: impl Into<String>,
        author_name: impl Into<String>,
        query: impl Into<String>,
        answer: impl Into<String>,
    ) -> bool {
        self.annotate(
            answer_id,
            AnnotationEdit::Added {
                annotation_id: annotation_id.into(),
                author_name: author_name.into(),
                query: query.into(),
                answer: answer.into(),
            },
        )
    }

    /// Drop an answer's curated reply
    pub fn remove_annotation(&mut self, answer_id: &str) -> bool {
        self.annotate(answer_id, AnnotationEdit::Removed)
    }

    fn annotate(&mut self, answer_id: &str, edit: AnnotationEdit) -> bool {
        let (transcript, found) = reducer::annotate(mem::take(&mut self.transcript), answer_id, edit);
        self.transcript = transcript;
        if found {
            self.publish();
        } else {
            tracing::warn!(answer_id = %answer_id, "Annotation change ignored");
        }
        found
    }

    // ========================================================================
    // Driving
    // ========================================================================

    /// Wait for the next stream event or fetch result and apply it
    ///
    /// Returns `None` once the session is idle.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if self.is_idle() {
                return None;
            }

            let incoming = tokio::select! {
                Some(event) = next_stream_event(&mut self.primary) => Incoming::Primary(event),
                Some(event) = next_stream_event(&mut self.secondary) => Incoming::Secondary(event),
                Some(outcome) = self.fetch_rx.recv(), if self.pending_fetches > 0 => {
                    Incoming::Fetch(outcome)
                }
                else => {
                    self.drop_finished_streams();
                    continue;
                }
            };

            if let Some(update) = self.handle(incoming) {
                self.publish();
                return Some(update);
            }
        }
    }

    /// Apply everything that is ready now, without waiting
    pub fn poll(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        loop {
            let incoming = if let Some(event) =
                self.primary.as_mut().and_then(EventStream::try_next_event)
            {
                Incoming::Primary(event)
            } else if let Some(event) =
                self.secondary.as_mut().and_then(EventStream::try_next_event)
            {
                Incoming::Secondary(event)
            } else if self.pending_fetches > 0 {
                match self.fetch_rx.try_recv() {
                    Ok(outcome) => Incoming::Fetch(outcome),
                    Err(_) => break,
                }
            } else {
                break;
            };

            if let Some(update) = self.handle(incoming) {
                updates.push(update);
            }
        }

        self.drop_finished_streams();
        if !updates.is_empty() {
            self.publish();
        }
        updates
    }

    /// Drive the session until nothing is in flight
    pub async fn run_until_idle(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = self.next_update().await {
            updates.push(update);
        }
        updates
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    fn handle(&mut self, incoming: Incoming) -> Option<SessionUpdate> {
        match incoming {
            Incoming::Primary(event) => Some(self.handle_primary(event)),
            Incoming::Secondary(event) => Some(self.handle_secondary(event)),
            Incoming::Fetch(outcome) => self.handle_fetch(outcome),
        }
    }

    fn handle_primary(&mut self, event: StreamEvent) -> SessionUpdate {
        let role = StreamRole::Primary;
        tracing::trace!(kind = event.kind(), "Primary stream event");

        match &event {
            StreamEvent::Data(data) => {
                if data.is_first_message {
                    if let Some(ref conversation_id) = data.conversation_id {
                        self.conversation_id = Some(conversation_id.clone());
                    }
                }
                if let Some(ref task_id) = data.task_id {
                    self.task_id = Some(task_id.clone());
                }
            }
            StreamEvent::WorkflowStarted(started) => {
                self.resumer.observe_started(started);
                if let Some(ref task_id) = started.task_id {
                    self.task_id = Some(task_id.clone());
                }
                if let Some(ref conversation_id) = started.conversation_id {
                    self.conversation_id = Some(conversation_id.clone());
                }
            }
            _ => {}
        }

        if let StreamEvent::Completed { has_error } = event {
            return self.finish_primary(has_error);
        }
        if self.primary_detached {
            // The run continues on the workflow event feed
            tracing::debug!(kind = event.kind(), "Primary event after pause ignored");
            return SessionUpdate::Changed { role };
        }

        let answer_id = self.in_flight_answer_id();
        self.transcript = reducer::apply(mem::take(&mut self.transcript), &event);
        if let Some(id) = self.in_flight_answer_id() {
            self.active_branch_id = Some(id);
        }

        match event {
            StreamEvent::WorkflowPaused { workflow_run_id } => {
                let answer_id = answer_id
                    .or_else(|| self.active_branch_id.clone())
                    .unwrap_or_default();
                self.active_branch_id = Some(answer_id.clone());
                self.primary_detached = true;
                self.on_paused(&workflow_run_id, &answer_id)
            }
            StreamEvent::Error { message, code } => {
                tracing::warn!(error = %message, code = ?code, "Primary stream failed");
                self.primary_detached = true;
                SessionUpdate::Failed {
                    role,
                    error: EngineError::Server { message, code },
                }
            }
            _ => SessionUpdate::Changed { role },
        }
    }

    fn finish_primary(&mut self, has_error: bool) -> SessionUpdate {
        let role = StreamRole::Primary;
        let answer_id = self
            .in_flight_answer_id()
            .or_else(|| self.active_branch_id.clone());

        if !self.primary_detached {
            self.transcript = reducer::apply(
                mem::take(&mut self.transcript),
                &StreamEvent::Completed { has_error },
            );
        }
        if let Some(stream) = self.primary.take() {
            self.registry.release(role, &stream.cancellation_handle());
        }

        tracing::debug!(has_error, answer_id = ?answer_id, "Primary stream completed");
        if !has_error && !self.user_stopped && !self.paused && !self.primary_detached {
            if let Some(answer_id) = answer_id {
                self.schedule_enrichment(&answer_id, true);
            }
        }
        SessionUpdate::Completed { role, has_error }
    }

    fn handle_secondary(&mut self, event: StreamEvent) -> SessionUpdate {
        let role = StreamRole::WorkflowEvents;
        tracing::trace!(kind = event.kind(), "Workflow event");

        if let StreamEvent::WorkflowStarted(ref started) = event {
            self.resumer.observe_started(started);
            if let Some(ref task_id) = started.task_id {
                self.task_id = Some(task_id.clone());
            }
            self.secondary_running = true;
            self.paused = false;
        }

        if self.transcript.in_flight().is_none() && !event.is_terminal() {
            self.resume_in_flight();
        }
        self.transcript = reducer::apply(mem::take(&mut self.transcript), &event);

        match event {
            StreamEvent::WorkflowPaused { workflow_run_id } => {
                self.secondary_running = false;
                let answer_id = self.secondary_answer_id.clone().unwrap_or_default();
                self.on_paused(&workflow_run_id, &answer_id)
            }
            StreamEvent::Error { message, code } => {
                tracing::warn!(error = %message, "Workflow event feed failed");
                SessionUpdate::Failed {
                    role,
                    error: EngineError::Server { message, code },
                }
            }
            StreamEvent::Completed { has_error } => {
                if let Some(stream) = self.secondary.take() {
                    self.registry.release(role, &stream.cancellation_handle());
                }
                self.secondary_running = false;
                if !has_error && !self.user_stopped && !self.paused {
                    if let Some(answer_id) = self.secondary_answer_id.clone() {
                        self.schedule_enrichment(&answer_id, false);
                    }
                }
                SessionUpdate::Completed { role, has_error }
            }
            _ => SessionUpdate::Changed { role },
        }
    }

    fn on_paused(&mut self, workflow_run_id: &str, answer_id: &str) -> SessionUpdate {
        self.paused = true;
        tracing::info!(
            workflow_run_id = %workflow_run_id,
            answer_id = %answer_id,
            "Workflow paused for human input"
        );

        if let Some(plan) = self.resumer.on_paused(workflow_run_id, answer_id) {
            self.open_workflow_events(&plan);
        }
        SessionUpdate::Paused {
            workflow_run_id: workflow_run_id.to_string(),
            answer_id: answer_id.to_string(),
        }
    }

    fn open_workflow_events(&mut self, plan: &ResumePlan) {
        let url = self.backend.resolve_url(&plan.endpoint());
        tracing::info!(
            url = %url,
            include_state_snapshot = plan.include_state_snapshot,
            "Opening workflow event feed"
        );

        let stream = self.backend.open_stream(StreamRequest::get(url));
        self.registry
            .register(StreamRole::WorkflowEvents, stream.cancellation_handle());
        self.secondary = Some(stream);
        self.secondary_answer_id = Some(plan.answer_id.clone());
        self.active_branch_id = Some(plan.answer_id.clone());
    }

    /// Put the paused branch back in flight so workflow events apply to it
    fn resume_in_flight(&mut self) {
        let Some(answer_id) = self.secondary_answer_id.as_deref() else {
            return;
        };
        let Some(answer) = self.transcript.get(answer_id).cloned() else {
            tracing::warn!(answer_id = %answer_id, "Resumed branch no longer exists");
            return;
        };
        let Some(question) = self.transcript.question_for(answer_id).cloned() else {
            return;
        };
        self.transcript = reducer::begin(
            mem::take(&mut self.transcript),
            Exchange::resume(question, answer),
        );
    }

    // ========================================================================
    // Enrichment
    // ========================================================================

    fn schedule_enrichment(&mut self, answer_id: &str, with_messages: bool) {
        if with_messages && self.enrichment.fetch_conversation_messages {
            if let Some(conversation_id) = self.conversation_id.clone() {
                let handle = self.register_fetch(StreamRole::ConversationFetch);
                let backend = Arc::clone(&self.backend);
                let tx = self.fetch_tx.clone();
                let answer_id = answer_id.to_string();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        biased;
                        () = handle.cancelled() => Err(EngineError::Cancelled),
                        result = backend.fetch_message(&conversation_id, &answer_id) => result,
                    };
                    let _ = tx.send(FetchOutcome::Message {
                        handle,
                        answer_id,
                        result,
                    });
                });
            }
        }

        if self.enrichment.suggested_questions {
            let handle = self.register_fetch(StreamRole::SuggestedQuestionsFetch);
            let backend = Arc::clone(&self.backend);
            let tx = self.fetch_tx.clone();
            let answer_id = answer_id.to_string();
            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    () = handle.cancelled() => Err(EngineError::Cancelled),
                    result = backend.fetch_suggested_questions(&answer_id) => result,
                };
                let _ = tx.send(FetchOutcome::Suggestions {
                    handle,
                    answer_id,
                    result,
                });
            });
        }
    }

    fn register_fetch(&mut self, role: StreamRole) -> CancellationHandle {
        let handle = CancellationHandle::new();
        self.registry.register(role, handle.clone());
        self.pending_fetches += 1;
        handle
    }

    fn handle_fetch(&mut self, outcome: FetchOutcome) -> Option<SessionUpdate> {
        self.pending_fetches = self.pending_fetches.saturating_sub(1);

        match outcome {
            FetchOutcome::Message {
                handle,
                answer_id,
                result,
            } => {
                self.registry.release(StreamRole::ConversationFetch, &handle);
                if handle.is_cancelled() {
                    return None;
                }
                match result {
                    Ok(Some(message)) => {
                        let (transcript, matched) =
                            reducer::enrich(mem::take(&mut self.transcript), &message);
                        self.transcript = transcript;
                        matched.then_some(SessionUpdate::Enriched { answer_id })
                    }
                    Ok(None) => {
                        tracing::debug!(answer_id = %answer_id, "Persisted message not found");
                        None
                    }
                    Err(err) => {
                        tracing::warn!(answer_id = %answer_id, error = %err, "Conversation fetch failed");
                        None
                    }
                }
            }
            FetchOutcome::Suggestions {
                handle,
                answer_id,
                result,
            } => {
                self.registry
                    .release(StreamRole::SuggestedQuestionsFetch, &handle);
                if handle.is_cancelled() {
                    return None;
                }
                match result {
                    Ok(questions) => {
                        self.suggested_questions.clone_from(&questions);
                        Some(SessionUpdate::SuggestedQuestions(questions))
                    }
                    Err(err) => {
                        tracing::debug!(answer_id = %answer_id, error = %err, "Suggested questions fetch failed");
                        self.suggested_questions.clear();
                        None
                    }
                }
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn request_task_stop(&self, task_id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(task_id = %task_id, "No runtime to send stop request");
            return;
        };
        let backend = Arc::clone(&self.backend);
        runtime.spawn(async move {
            if let Err(err) = backend.stop_task(&task_id).await {
                tracing::warn!(task_id = %task_id, error = %err, "Stop request failed");
            }
        });
    }

    fn reset_fetches(&mut self) {
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        self.fetch_tx = fetch_tx;
        self.fetch_rx = fetch_rx;
        self.pending_fetches = 0;
    }

    fn drop_finished_streams(&mut self) {
        if self.primary.as_ref().is_some_and(EventStream::is_finished) {
            self.primary = None;
        }
        if self.secondary.as_ref().is_some_and(EventStream::is_finished) {
            self.secondary = None;
            self.secondary_running = false;
        }
    }

    fn in_flight_answer_id(&self) -> Option<String> {
        self.transcript.in_flight().map(|e| e.answer.id.clone())
    }

    fn refresh_opening_statement(&mut self) {
        let opening = self.opening_template.as_deref().map(|template| {
            Turn::opening_statement(
                inputs::render_opening_statement(template, &self.inputs_form, &self.inputs),
                self.opening_questions.clone(),
            )
        });
        self.transcript.set_opening_statement(opening);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}
