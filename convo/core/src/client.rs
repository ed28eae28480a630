//! Event Stream Client
//!
//! Opens a long-lived SSE stream and delivers typed [`StreamEvent`]s in
//! arrival order.
//!
//! # Design Philosophy
//!
//! The HTTP read happens in a spawned task that forwards decoded events over a
//! bounded channel, so the session never blocks on the network. The task races
//! every await against the stream's [`CancellationHandle`]. The consuming
//! [`EventStream`] guarantees the delivery contract:
//!
//! - exactly one terminal [`StreamEvent::Completed`], preceded by a single
//!   [`StreamEvent::Error`] when the stream fails (including connect failures
//!   and non-2xx statuses, before any data)
//! - nothing at all after cancellation, even events already buffered

use std::collections::VecDeque;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::cancellation::CancellationHandle;
use crate::error::EngineError;
use crate::protocol::{
    ContainerKind, DataEvent, FrameDecoder, MessageEnd, StreamEvent, WorkflowStarted,
};
use crate::transcript::{AgentThoughtStep, FileRef, HumanInputForm, NodeTrace, WorkflowStatus};

/// Default channel capacity between the reader task and the consumer
pub const DEFAULT_STREAM_BUFFER: usize = 100;

/// What to open
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// HTTP method (POST for sends, GET for workflow event feeds)
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// JSON body, if any
    pub body: Option<Value>,
}

impl StreamRequest {
    /// A POST with a JSON body
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            body: Some(body),
        }
    }

    /// A bodiless GET
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            body: None,
        }
    }
}

/// Opens SSE streams over a shared HTTP client
#[derive(Clone, Debug)]
pub struct EventStreamClient {
    http: reqwest::Client,
    buffer: usize,
}

impl EventStreamClient {
    /// Create a client over an existing HTTP client
    #[must_use]
    pub fn new(http: reqwest::Client, buffer: usize) -> Self {
        Self {
            http,
            buffer: buffer.max(1),
        }
    }

    /// Open a stream
    ///
    /// Returns immediately; connection errors surface as the stream's
    /// `Error` + `Completed { has_error: true }` events.
    #[must_use]
    pub fn open(&self, request: StreamRequest) -> EventStream {
        let (tx, stream) = EventStream::channel(self.buffer);
        let handle = stream.cancellation_handle();
        let http = self.http.clone();

        tracing::debug!(method = %request.method, url = %request.url, "Opening event stream");

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = handle.cancelled() => {
                    tracing::debug!(url = %request.url, "Event stream cancelled");
                    return;
                }
                result = pump(&http, &request, &tx) => result,
            };

            let has_error = match outcome {
                Ok(has_error) => has_error,
                Err(err) => {
                    tracing::warn!(url = %request.url, error = %err, "Event stream failed");
                    let _ = tx.send(error_event(&err)).await;
                    true
                }
            };
            let _ = tx.send(StreamEvent::Completed { has_error }).await;
        });

        stream
    }
}

/// Read the response and forward decoded events
///
/// Returns whether a server-side error event ended the stream.
async fn pump(
    http: &reqwest::Client,
    request: &StreamRequest,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<bool, EngineError> {
    let mut builder = http
        .request(request.method.clone(), &request.url)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(ref body) = request.body {
        builder = builder.json(body);
    }

    let response = builder.send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(EngineError::Status { status, body });
    }

    let mut frames = response.bytes_stream().eventsource();
    let mut decoder = FrameDecoder::new();

    while let Some(frame) = frames.next().await {
        let frame = frame.map_err(|e| EngineError::Stream(e.to_string()))?;
        let Some(event) = decoder.decode(&frame.data)? else {
            continue;
        };

        let is_error = matches!(event, StreamEvent::Error { .. });
        if tx.send(event).await.is_err() {
            // Consumer dropped the stream
            return Ok(false);
        }
        if is_error {
            return Ok(true);
        }
    }

    Ok(false)
}

fn error_event(err: &EngineError) -> StreamEvent {
    let code = match err {
        EngineError::Status { status, .. } => Some(status.to_string()),
        EngineError::Server { code, .. } => code.clone(),
        _ => None,
    };
    StreamEvent::Error {
        message: err.to_string(),
        code,
    }
}

/// Consumer side of an open stream
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    handle: CancellationHandle,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl EventStream {
    /// Create a stream fed by the returned sender
    ///
    /// Used by the HTTP client and by test backends. If the sender is dropped
    /// without sending `Completed`, the stream reports an error.
    #[must_use]
    pub fn channel(buffer: usize) -> (mpsc::Sender<StreamEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let stream = Self {
            rx,
            handle: CancellationHandle::new(),
            pending: VecDeque::new(),
            finished: false,
        };
        (tx, stream)
    }

    /// A stream that replays a fixed script
    ///
    /// `Completed { has_error: false }` is appended when the script has no
    /// terminal event.
    #[must_use]
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        let mut events = events;
        if !events.iter().any(StreamEvent::is_terminal) {
            events.push(StreamEvent::Completed { has_error: false });
        }
        let (tx, stream) = Self::channel(events.len());
        for event in events {
            // Capacity equals the script length
            let _ = tx.try_send(event);
        }
        stream
    }

    /// Handle that cancels this stream
    #[must_use]
    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.handle.clone()
    }

    /// Cancel the stream (idempotent)
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Whether the terminal event was delivered or the stream was cancelled
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished || self.handle.is_cancelled()
    }

    /// Await the next event
    ///
    /// Returns `None` after the terminal event or once cancelled.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.is_finished() {
            return None;
        }
        if let Some(event) = self.pending.pop_front() {
            return Some(self.deliver(event));
        }

        let received = tokio::select! {
            biased;
            () = self.handle.cancelled() => return None,
            received = self.rx.recv() => received,
        };

        match received {
            Some(event) => Some(self.deliver(event)),
            None => self.closed_early(),
        }
    }

    /// Take the next event if one is ready, without waiting
    pub fn try_next_event(&mut self) -> Option<StreamEvent> {
        if self.is_finished() {
            return None;
        }
        if let Some(event) = self.pending.pop_front() {
            return Some(self.deliver(event));
        }

        match self.rx.try_recv() {
            Ok(event) => Some(self.deliver(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.closed_early(),
        }
    }

    /// Deliver every remaining event to `handler`, in order
    pub async fn dispatch<H: StreamHandler + ?Sized>(&mut self, handler: &mut H) {
        while let Some(event) = self.next_event().await {
            dispatch_event(handler, &event);
        }
    }

    fn deliver(&mut self, event: StreamEvent) -> StreamEvent {
        if event.is_terminal() {
            self.finished = true;
        }
        event
    }

    fn closed_early(&mut self) -> Option<StreamEvent> {
        tracing::debug!("Event stream closed without a terminal event");
        self.pending
            .push_back(StreamEvent::Completed { has_error: true });
        Some(StreamEvent::Error {
            message: "event stream closed before completion".to_string(),
            code: None,
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.finished {
            self.handle.cancel();
        }
    }
}

/// Typed callbacks, one per event kind
///
/// Every method defaults to a no-op, so implementors only handle the kinds
/// they care about.
#[allow(unused_variables)]
pub trait StreamHandler {
    /// Content delta
    fn on_data(&mut self, event: &DataEvent) {}
    /// Agent thought (new or update)
    fn on_thought(&mut self, step: &AgentThoughtStep) {}
    /// File produced by the assistant
    fn on_file(&mut self, file: &FileRef) {}
    /// Message finished
    fn on_message_end(&mut self, end: &MessageEnd) {}
    /// Content replaced
    fn on_message_replace(&mut self, answer: &str) {}
    /// Workflow run began
    fn on_workflow_started(&mut self, started: &WorkflowStarted) {}
    /// Workflow run finished
    fn on_workflow_finished(&mut self, workflow_run_id: Option<&str>, status: WorkflowStatus) {}
    /// Workflow paused for human input
    fn on_workflow_paused(&mut self, workflow_run_id: &str) {}
    /// Node started
    fn on_node_started(&mut self, node: &NodeTrace) {}
    /// Node finished
    fn on_node_finished(&mut self, node: &NodeTrace) {}
    /// Iteration or loop started
    fn on_container_started(&mut self, kind: ContainerKind, node: &NodeTrace) {}
    /// Iteration or loop completed
    fn on_container_finished(&mut self, kind: ContainerKind, node: &NodeTrace) {}
    /// Human input required
    fn on_human_input_required(&mut self, form: &HumanInputForm) {}
    /// Human input form submitted
    fn on_human_input_form_filled(&mut self, form: &HumanInputForm) {}
    /// Human input form expiration changed
    fn on_human_input_form_timeout(&mut self, node_id: &str, expiration_time: Option<i64>) {}
    /// Stream failed
    fn on_error(&mut self, message: &str, code: Option<&str>) {}
    /// Terminal callback, exactly once
    fn on_completed(&mut self, has_error: bool) {}
}

/// Route one event to the matching handler method
pub fn dispatch_event<H: StreamHandler + ?Sized>(handler: &mut H, event: &StreamEvent) {
    match event {
        StreamEvent::Data(data) => handler.on_data(data),
        StreamEvent::Thought(step) => handler.on_thought(step),
        StreamEvent::File(file) => handler.on_file(file),
        StreamEvent::MessageEnd(end) => handler.on_message_end(end),
        StreamEvent::MessageReplace { answer } => handler.on_message_replace(answer),
        StreamEvent::WorkflowStarted(started) => handler.on_workflow_started(started),
        StreamEvent::WorkflowFinished {
            workflow_run_id,
            status,
        } => handler.on_workflow_finished(workflow_run_id.as_deref(), *status),
        StreamEvent::WorkflowPaused { workflow_run_id } => {
            handler.on_workflow_paused(workflow_run_id);
        }
        StreamEvent::NodeStarted(node) => handler.on_node_started(node),
        StreamEvent::NodeFinished(node) => handler.on_node_finished(node),
        StreamEvent::ContainerStarted { kind, node } => handler.on_container_started(*kind, node),
        StreamEvent::ContainerFinished { kind, node } => {
            handler.on_container_finished(*kind, node);
        }
        StreamEvent::HumanInputRequired(form) => handler.on_human_input_required(form),
        StreamEvent::HumanInputFormFilled(form) => handler.on_human_input_form_filled(form),
        StreamEvent::HumanInputFormTimeout {
            node_id,
            expiration_time,
        } => handler.on_human_input_form_timeout(node_id, *expiration_time),
        StreamEvent::Error { message, code } => handler.on_error(message, code.as_deref()),
        StreamEvent::Completed { has_error } => handler.on_completed(*has_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        text: String,
        errors: Vec<String>,
        completions: Vec<bool>,
    }

    impl StreamHandler for Recorder {
        fn on_data(&mut self, event: &DataEvent) {
            self.text.push_str(&event.message);
        }

        fn on_error(&mut self, message: &str, _code: Option<&str>) {
            self.errors.push(message.to_string());
        }

        fn on_completed(&mut self, has_error: bool) {
            self.completions.push(has_error);
        }
    }

    #[tokio::test]
    async fn test_from_events_appends_completed() {
        let mut stream = EventStream::from_events(vec![
            StreamEvent::Data(DataEvent::text("He")),
            StreamEvent::Data(DataEvent::text("llo")),
        ]);
        let mut recorder = Recorder::default();
        stream.dispatch(&mut recorder).await;

        assert_eq!(recorder.text, "Hello");
        assert_eq!(recorder.completions, vec![false]);
        assert!(stream.is_finished());
        assert!(stream.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_no_events_after_cancel() {
        let mut stream = EventStream::from_events(vec![
            StreamEvent::Data(DataEvent::text("a")),
            StreamEvent::Data(DataEvent::text("b")),
        ]);
        assert!(stream.next_event().await.is_some());

        let handle = stream.cancellation_handle();
        handle.cancel();
        handle.cancel();

        assert!(stream.next_event().await.is_none());
        assert!(stream.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_error_then_completed() {
        let (tx, mut stream) = EventStream::channel(4);
        tx.send(StreamEvent::Data(DataEvent::text("partial")))
            .await
            .unwrap();
        drop(tx);

        let mut recorder = Recorder::default();
        stream.dispatch(&mut recorder).await;

        assert_eq!(recorder.text, "partial");
        assert_eq!(recorder.errors.len(), 1);
        assert_eq!(recorder.completions, vec![true]);
    }

    #[tokio::test]
    async fn test_try_next_event_does_not_block() {
        let (tx, mut stream) = EventStream::channel(4);
        assert!(stream.try_next_event().is_none());

        tx.send(StreamEvent::Completed { has_error: false })
            .await
            .unwrap();
        assert_eq!(
            stream.try_next_event(),
            Some(StreamEvent::Completed { has_error: false })
        );
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn test_connect_failure_yields_error_and_completed() {
        let client = EventStreamClient::new(reqwest::Client::new(), 8);
        // Port 9 (discard) is not listening
        let mut stream = client.open(StreamRequest::get("http://127.0.0.1:9/events"));

        let mut recorder = Recorder::default();
        stream.dispatch(&mut recorder).await;

        assert_eq!(recorder.errors.len(), 1);
        assert_eq!(recorder.completions, vec![true]);
    }
}
