//! Session integration tests
//!
//! These tests drive a [`ChatSession`] end to end against a scripted backend.
//! Tests cover:
//! - The `hello` round-trip and follow-up threading
//! - Enrichment after completion
//! - Rollback on stream errors
//! - Workflow pause, the workflow event feed and branch switching
//! - Stop requests

use std::sync::Mutex;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use reqwest::Method;
use serde_json::Value;

use convo_core::{
    ChatBackend, ChatSession, DataEvent, EngineConfig, EngineError, EnrichmentOptions,
    EventStream, HumanInputForm, MessageEnd, NodeStatus, NodeTrace, PersistedMessage,
    SendRequest, SessionUpdate, StreamEvent, StreamRequest, StreamRole, Turn, WorkflowStarted,
    WorkflowStatus,
};

// =============================================================================
// Mock backend
// =============================================================================

/// Replays one scripted stream per open and records every request
#[derive(Default)]
struct MockBackend {
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    opened: Mutex<Vec<StreamRequest>>,
    persisted: Vec<PersistedMessage>,
    suggestions: Vec<String>,
    stopped: Mutex<Vec<String>>,
}

impl MockBackend {
    fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            ..Self::default()
        }
    }

    fn with_persisted(mut self, message: PersistedMessage) -> Self {
        self.persisted.push(message);
        self
    }

    fn with_suggestions(mut self, suggestions: &[&str]) -> Self {
        self.suggestions = suggestions.iter().map(|s| (*s).to_string()).collect();
        self
    }

    fn opened_urls(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.clone())
            .collect()
    }

    fn request(&self, index: usize) -> StreamRequest {
        self.opened.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        "Mock"
    }

    fn resolve_url(&self, endpoint: &str) -> String {
        format!("http://mock{endpoint}")
    }

    fn open_stream(&self, request: StreamRequest) -> EventStream {
        self.opened.lock().unwrap().push(request);
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            EventStream::from_events(Vec::new())
        } else {
            EventStream::from_events(scripts.remove(0))
        }
    }

    async fn fetch_conversation_messages(
        &self,
        _conversation_id: &str,
    ) -> Result<Vec<PersistedMessage>, EngineError> {
        Ok(self.persisted.clone())
    }

    async fn fetch_suggested_questions(
        &self,
        _message_id: &str,
    ) -> Result<Vec<String>, EngineError> {
        Ok(self.suggestions.clone())
    }

    async fn stop_task(&self, task_id: &str) -> Result<(), EngineError> {
        self.stopped.lock().unwrap().push(task_id.to_string());
        Ok(())
    }
}

// =============================================================================
// Event helpers
// =============================================================================

fn data(text: &str) -> StreamEvent {
    StreamEvent::Data(DataEvent::text(text))
}

fn first_data(text: &str, message_id: &str) -> StreamEvent {
    StreamEvent::Data(DataEvent {
        message: text.to_string(),
        is_first_message: true,
        conversation_id: Some("conv-1".to_string()),
        message_id: Some(message_id.to_string()),
        task_id: Some("task-1".to_string()),
    })
}

fn message_end(id: &str) -> StreamEvent {
    StreamEvent::MessageEnd(MessageEnd {
        id: id.to_string(),
        ..MessageEnd::default()
    })
}

fn workflow_started(run: &str, message_id: &str) -> StreamEvent {
    StreamEvent::WorkflowStarted(WorkflowStarted {
        workflow_run_id: run.to_string(),
        task_id: Some("task-1".to_string()),
        conversation_id: Some("conv-1".to_string()),
        message_id: Some(message_id.to_string()),
    })
}

fn form(node_id: &str) -> HumanInputForm {
    HumanInputForm {
        node_id: node_id.to_string(),
        node_title: "Approve".to_string(),
        ..HumanInputForm::default()
    }
}

fn node(id: &str, node_id: &str, status: NodeStatus) -> NodeTrace {
    NodeTrace {
        id: id.to_string(),
        node_id: node_id.to_string(),
        node_type: "human-input".to_string(),
        title: "Approve".to_string(),
        status,
        iteration_id: None,
        parallel_id: None,
    }
}

/// Primary stream of a workflow that pauses on an approval form
fn pausing_script() -> Vec<StreamEvent> {
    vec![
        workflow_started("run-1", "m1"),
        StreamEvent::NodeFinished(node("e0", "draft", NodeStatus::Succeeded)),
        data("Draft ready."),
        StreamEvent::NodeStarted(node("e1", "approve", NodeStatus::Running)),
        StreamEvent::HumanInputRequired(form("approve")),
        StreamEvent::WorkflowPaused {
            workflow_run_id: "run-1".to_string(),
        },
    ]
}

fn contents(thread: &[&Turn]) -> Vec<(String, String)> {
    thread
        .iter()
        .map(|t| (t.id.clone(), t.content.clone()))
        .collect()
}

// =============================================================================
// Round-trips
// =============================================================================

#[tokio::test]
async fn test_hello_round_trip() {
    let backend = MockBackend::new(vec![vec![data("He"), data("llo"), message_end("m1")]]);
    let mut session = ChatSession::new(backend, &EngineConfig::default());

    assert!(session.send("/chat-messages", SendRequest::new("hello"), EnrichmentOptions::none()));
    let updates = session.run_until_idle().await;

    assert!(matches!(
        updates.last(),
        Some(SessionUpdate::Completed {
            role: StreamRole::Primary,
            has_error: false
        })
    ));
    assert!(!session.is_responding());

    let thread = session.thread();
    assert_eq!(thread.len(), 2);
    assert!(thread[0].is_question());
    assert_eq!(thread[0].content, "hello");
    assert_eq!(thread[1].id, "m1");
    assert_eq!(thread[1].content, "Hello");
    assert!(thread[1].citation.is_empty());
    assert!(!thread[1].is_placeholder);
    assert_eq!(thread[1].parent_id.as_deref(), Some(thread[0].id.as_str()));
}

#[tokio::test]
async fn test_follow_up_threads_on_last_answer() {
    let backend = MockBackend::new(vec![
        vec![first_data("Hi", "m1"), message_end("m1")],
        vec![data("Fine"), message_end("m2")],
    ]);
    let mut session = ChatSession::new(backend, &EngineConfig::default());

    session.send("/chat-messages", SendRequest::new("hello"), EnrichmentOptions::none());
    session.run_until_idle().await;
    assert_eq!(session.conversation_id(), Some("conv-1"));

    assert!(session.send("/chat-messages", SendRequest::new("how are you"), EnrichmentOptions::none()));
    session.run_until_idle().await;

    let thread = session.thread();
    assert_eq!(
        contents(&thread),
        vec![
            ("question-m1".to_string(), "hello".to_string()),
            ("m1".to_string(), "Hi".to_string()),
            ("question-m2".to_string(), "how are you".to_string()),
            ("m2".to_string(), "Fine".to_string()),
        ]
    );
    assert_eq!(thread[2].parent_id.as_deref(), Some("m1"));
}

#[tokio::test]
async fn test_follow_up_request_body() -> anyhow::Result<()> {
    let backend = std::sync::Arc::new(MockBackend::new(vec![
        vec![first_data("Hi", "m1"), message_end("m1")],
        vec![message_end("m2")],
    ]));
    let mut session =
        ChatSession::with_shared_backend(std::sync::Arc::clone(&backend), &EngineConfig::default());

    session.send("/chat-messages", SendRequest::new("hello"), EnrichmentOptions::none());
    session.run_until_idle().await;
    session.send(
        "/chat-messages",
        SendRequest::new("again").with_file(serde_json::json!({"type": "image", "upload_file_id": "f1"})),
        EnrichmentOptions::none(),
    );
    session.run_until_idle().await;

    let second = backend.request(1);
    assert_eq!(second.method, Method::POST);
    let body = second.body.ok_or_else(|| anyhow::anyhow!("missing body"))?;
    assert_eq!(body["conversation_id"], "conv-1");
    assert_eq!(body["parent_message_id"], "m1");
    assert_eq!(body["files"][0]["upload_file_id"], "f1");
    assert_eq!(body["inputs"], Value::Object(serde_json::Map::new()));
    Ok(())
}

// =============================================================================
// Enrichment
// =============================================================================

#[tokio::test]
async fn test_enrichment_merges_persisted_metadata() {
    let persisted = PersistedMessage {
        id: "m1".to_string(),
        conversation_id: Some("conv-1".to_string()),
        answer: "Hello!".to_string(),
        message_tokens: 10,
        answer_tokens: 20,
        provider_response_latency: 2.0,
        created_at: 1_700_000_000,
        ..PersistedMessage::default()
    };
    let backend = MockBackend::new(vec![vec![first_data("Hello", "m1"), message_end("m1")]])
        .with_persisted(persisted)
        .with_suggestions(&["Why?", "How?"]);
    let mut session = ChatSession::new(backend, &EngineConfig::default());
    let options = EnrichmentOptions {
        fetch_conversation_messages: true,
        suggested_questions: true,
    };

    session.send("/chat-messages", SendRequest::new("hello"), options);
    let updates = session.run_until_idle().await;

    assert!(updates
        .iter()
        .any(|u| matches!(u, SessionUpdate::Enriched { answer_id } if answer_id == "m1")));
    let answer = session.transcript().get("m1").unwrap();
    assert_eq!(answer.content, "Hello!");
    let more = answer.more.as_ref().unwrap();
    assert_eq!(more.tokens, 30);
    assert_eq!(more.latency, "2.00");
    assert_eq!(more.tokens_per_second.as_deref(), Some("10.00"));
    assert_eq!(session.suggested_questions(), ["Why?".to_string(), "How?".to_string()]);
}

#[tokio::test]
async fn test_enrichment_without_match_is_skipped() {
    let backend = MockBackend::new(vec![vec![first_data("Hello", "m1"), message_end("m1")]])
        .with_persisted(PersistedMessage {
            id: "other".to_string(),
            answer: "nope".to_string(),
            ..PersistedMessage::default()
        });
    let mut session = ChatSession::new(backend, &EngineConfig::default());
    let options = EnrichmentOptions {
        fetch_conversation_messages: true,
        suggested_questions: false,
    };

    session.send("/chat-messages", SendRequest::new("hello"), options);
    let updates = session.run_until_idle().await;

    assert!(!updates
        .iter()
        .any(|u| matches!(u, SessionUpdate::Enriched { .. })));
    let answer = session.transcript().get("m1").unwrap();
    assert_eq!(answer.content, "Hello");
    assert!(answer.more.is_none());
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_error_before_ack_keeps_question() {
    let backend = MockBackend::new(vec![vec![
        data("He"),
        StreamEvent::Error {
            message: "model overloaded".to_string(),
            code: Some("provider_error".to_string()),
        },
        StreamEvent::Completed { has_error: true },
    ]]);
    let mut session = ChatSession::new(backend, &EngineConfig::default());

    session.send("/chat-messages", SendRequest::new("hello"), EnrichmentOptions::none());
    let updates = session.run_until_idle().await;

    assert!(updates.iter().any(|u| matches!(
        u,
        SessionUpdate::Failed { role: StreamRole::Primary, error: EngineError::Server { message, .. } }
            if message == "model overloaded"
    )));
    assert!(!session.is_responding());

    let thread = session.thread();
    assert_eq!(thread.len(), 1);
    assert!(thread[0].is_question());
    assert_eq!(thread[0].content, "hello");
    assert_eq!(session.transcript().len(), 1);
}

#[tokio::test]
async fn test_error_after_ack_keeps_question() {
    let backend = MockBackend::new(vec![vec![
        first_data("He", "m1"),
        StreamEvent::Error {
            message: "boom".to_string(),
            code: None,
        },
        StreamEvent::Completed { has_error: true },
    ]]);
    let mut session = ChatSession::new(backend, &EngineConfig::default());

    session.send("/chat-messages", SendRequest::new("hello"), EnrichmentOptions::none());
    session.run_until_idle().await;

    let thread = session.thread();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].id, "question-m1");
    assert!(session.transcript().get("m1").is_none());

    // A failed round-trip leaves the session usable
    assert!(session.send("/chat-messages", SendRequest::new("retry"), EnrichmentOptions::none()));
}

// =============================================================================
// Workflow pause and branches
// =============================================================================

#[tokio::test]
async fn test_pause_opens_workflow_event_feed() {
    let backend = std::sync::Arc::new(MockBackend::new(vec![
        pausing_script(),
        vec![
            workflow_started("run-1", "m1"),
            StreamEvent::HumanInputFormFilled(form("approve")),
            StreamEvent::NodeFinished(node("e1", "approve", NodeStatus::Succeeded)),
            data(" Approved."),
            StreamEvent::WorkflowFinished {
                workflow_run_id: Some("run-1".to_string()),
                status: WorkflowStatus::Succeeded,
            },
        ],
    ]));
    let mut session =
        ChatSession::with_shared_backend(std::sync::Arc::clone(&backend), &EngineConfig::default());

    session.send("/chat-messages", SendRequest::new("draft it"), EnrichmentOptions::none());
    let updates = session.run_until_idle().await;

    assert!(updates.iter().any(|u| matches!(
        u,
        SessionUpdate::Paused { workflow_run_id, answer_id }
            if workflow_run_id == "run-1" && answer_id == "m1"
    )));
    assert_eq!(
        backend.opened_urls(),
        vec![
            "http://mock/chat-messages".to_string(),
            "http://mock/workflow/run-1/events".to_string(),
        ]
    );
    assert_eq!(backend.request(1).method, Method::GET);

    let answer = session.transcript().get("m1").unwrap();
    assert_eq!(answer.content, "Draft ready. Approved.");
    assert!(answer.human_input_forms.is_empty());
    assert_eq!(answer.filled_human_input_forms.len(), 1);
    assert_eq!(
        answer.workflow_process.as_ref().map(|p| p.status),
        Some(WorkflowStatus::Succeeded)
    );
    // The node traced before the pause survives the resumed run
    let tracing = &answer.workflow_process.as_ref().unwrap().tracing;
    let nodes: Vec<(&str, NodeStatus)> = tracing.iter().map(|n| (n.id.as_str(), n.status)).collect();
    assert_eq!(
        nodes,
        vec![("e0", NodeStatus::Succeeded), ("e1", NodeStatus::Succeeded)]
    );
    assert_eq!(session.transcript().len(), 2);
    assert!(!session.is_responding());
}

#[tokio::test]
async fn test_workflow_feed_failure_keeps_paused_branch() {
    let backend = MockBackend::new(vec![
        pausing_script(),
        vec![
            StreamEvent::Error {
                message: "run expired".to_string(),
                code: None,
            },
            StreamEvent::Completed { has_error: true },
        ],
    ]);
    let mut session = ChatSession::new(backend, &EngineConfig::default());

    session.send("/chat-messages", SendRequest::new("draft it"), EnrichmentOptions::none());
    let updates = session.run_until_idle().await;

    assert!(updates.iter().any(|u| matches!(
        u,
        SessionUpdate::Failed {
            role: StreamRole::WorkflowEvents,
            ..
        }
    )));
    let answer = session.transcript().get("m1").unwrap();
    assert_eq!(answer.content, "Draft ready.");
    assert_eq!(answer.human_input_forms.len(), 1);
    let tracing = &answer.workflow_process.as_ref().unwrap().tracing;
    assert_eq!(tracing[1].status, NodeStatus::Paused);
    assert_eq!(session.thread().len(), 2);
}

#[tokio::test]
async fn test_switch_to_stale_branch_requests_snapshot() {
    let mut paused = Turn::answer("a2", "Waiting", "q1".to_string());
    paused.workflow_run_id = Some("run-7".to_string());
    paused.human_input_forms.push(form("approve"));
    let history = vec![
        Turn::question("q1", "draft it", None),
        paused,
        Turn::answer("a3", "Done", "q1".to_string()),
    ];

    let backend = std::sync::Arc::new(MockBackend::new(Vec::new()));
    let mut session =
        ChatSession::with_shared_backend(std::sync::Arc::clone(&backend), &EngineConfig::default())
            .with_history(history, Some("conv-1".to_string()));
    assert_eq!(session.thread()[1].id, "a3");

    assert!(session.switch_to_sibling("a2", EnrichmentOptions::none()));
    assert_eq!(session.thread()[1].id, "a2");
    assert_eq!(
        backend.opened_urls(),
        vec!["http://mock/workflow/run-7/events?include_state_snapshot=true".to_string()]
    );

    // Back to a settled branch: no subscription
    assert!(session.switch_to_sibling("a3", EnrichmentOptions::none()));
    assert_eq!(backend.opened_urls().len(), 1);

    assert!(!session.switch_to_sibling("missing", EnrichmentOptions::none()));
    session.run_until_idle().await;
}

#[tokio::test]
async fn test_switch_to_active_branch_skips_snapshot() {
    // The feed ends without resuming, leaving the form pending
    let backend = std::sync::Arc::new(MockBackend::new(vec![pausing_script(), Vec::new()]));
    let mut session =
        ChatSession::with_shared_backend(std::sync::Arc::clone(&backend), &EngineConfig::default());

    session.send("/chat-messages", SendRequest::new("draft it"), EnrichmentOptions::none());
    session.run_until_idle().await;
    assert!(session.transcript().get("m1").unwrap().awaits_human_input());

    assert!(session.switch_to_sibling("m1", EnrichmentOptions::none()));
    assert_eq!(
        backend.opened_urls().last().map(String::as_str),
        Some("http://mock/workflow/run-1/events")
    );
    session.run_until_idle().await;
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test]
async fn test_stop_sends_stop_request_for_task() {
    struct Live {
        stream: Mutex<Option<EventStream>>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatBackend for Live {
        fn name(&self) -> &str {
            "Live"
        }
        fn resolve_url(&self, endpoint: &str) -> String {
            endpoint.to_string()
        }
        fn open_stream(&self, _request: StreamRequest) -> EventStream {
            self.stream
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| EventStream::from_events(Vec::new()))
        }
        async fn fetch_conversation_messages(
            &self,
            _conversation_id: &str,
        ) -> Result<Vec<PersistedMessage>, EngineError> {
            Ok(Vec::new())
        }
        async fn fetch_suggested_questions(
            &self,
            _message_id: &str,
        ) -> Result<Vec<String>, EngineError> {
            Ok(Vec::new())
        }
        async fn stop_task(&self, task_id: &str) -> Result<(), EngineError> {
            self.stopped.lock().unwrap().push(task_id.to_string());
            Ok(())
        }
    }

    let (tx, stream) = EventStream::channel(8);
    let backend = std::sync::Arc::new(Live {
        stream: Mutex::new(Some(stream)),
        stopped: Mutex::new(Vec::new()),
    });
    let mut session =
        ChatSession::with_shared_backend(std::sync::Arc::clone(&backend), &EngineConfig::default());

    session.send("/chat-messages", SendRequest::new("long story"), EnrichmentOptions::none());
    tx.send(first_data("Once upon", "m1")).await.unwrap();
    session.next_update().await;
    assert_eq!(session.task_id(), Some("task-1"));

    session.stop();
    for _ in 0..100 {
        if !backend.stopped.lock().unwrap().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(*backend.stopped.lock().unwrap(), vec!["task-1".to_string()]);

    // A second stop has nothing left to cancel
    session.stop();
    tokio::task::yield_now().await;
    assert_eq!(backend.stopped.lock().unwrap().len(), 1);

    let answer = session.transcript().get("m1").unwrap();
    assert_eq!(answer.content, "Once upon");
    assert!(!answer.is_placeholder);
}
