//! Wire Protocol
//!
//! Typed events decoded from the chat event stream. The transport is
//! Server-Sent Events; each `data:` payload is one JSON object whose `event`
//! field selects the kind.
//!
//! # Design Philosophy
//!
//! The engine never works with raw JSON past this module. [`FrameDecoder`]
//! turns a payload into a [`StreamEvent`], normalizing the few places where the
//! server is loose (file references given as bare ids, optional envelope
//! `data` objects, message ids under two names).

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::EngineError;
use crate::transcript::{
    AgentThoughtStep, CitationEntry, FileRef, HumanInputForm, NodeStatus, NodeTrace,
    WorkflowStatus,
};

/// Content delta for the in-flight answer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataEvent {
    /// Text to append
    pub message: String,
    /// Whether this is the first content delta of the stream
    pub is_first_message: bool,
    /// Conversation id assigned by the server
    pub conversation_id: Option<String>,
    /// Canonical message id assigned by the server
    pub message_id: Option<String>,
    /// Task id usable for out-of-band stop
    pub task_id: Option<String>,
}

impl DataEvent {
    /// A bare content delta with no ids
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Curated reply metadata on `message_end`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AnnotationReply {
    /// Annotation id
    pub id: String,
    /// Author account
    pub account: AnnotationAccount,
}

/// Author of an annotation
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AnnotationAccount {
    /// Display name
    pub name: String,
}

/// Metadata attached to `message_end`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MessageEndMetadata {
    /// Present when a curated reply overrides the streamed answer
    pub annotation_reply: Option<AnnotationReply>,
    /// Retrieved sources backing the answer
    pub retriever_resources: Option<Vec<CitationEntry>>,
}

/// Terminal message event
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageEnd {
    /// Canonical message id
    pub id: String,
    /// Annotation and citation metadata
    pub metadata: MessageEndMetadata,
    /// Files confirmed by the server
    pub files: Vec<FileRef>,
}

/// A workflow run began
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkflowStarted {
    /// Run id
    pub workflow_run_id: String,
    /// Task id usable for out-of-band stop
    pub task_id: Option<String>,
    /// Conversation id
    pub conversation_id: Option<String>,
    /// Message id the run answers
    pub message_id: Option<String>,
}

/// Workflow node that runs its children repeatedly
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerKind {
    /// Runs its children once per item of a list
    Iteration,
    /// Runs its children until a break condition holds
    Loop,
}

/// A chat stream event
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Content delta
    Data(DataEvent),
    /// Agent reasoning/tool step (new or update)
    Thought(AgentThoughtStep),
    /// File produced by the assistant
    File(FileRef),
    /// Message finished
    MessageEnd(MessageEnd),
    /// Replace the answer content (moderation)
    MessageReplace {
        /// Replacement text
        answer: String,
    },
    /// Workflow run began
    WorkflowStarted(WorkflowStarted),
    /// Workflow run finished
    WorkflowFinished {
        /// Run id
        workflow_run_id: Option<String>,
        /// Final status
        status: WorkflowStatus,
    },
    /// Workflow paused waiting for human input
    WorkflowPaused {
        /// Run id
        workflow_run_id: String,
    },
    /// A workflow node started
    NodeStarted(NodeTrace),
    /// A workflow node finished
    NodeFinished(NodeTrace),
    /// An iteration or loop node started
    ContainerStarted {
        /// Iteration or loop
        kind: ContainerKind,
        /// Trace of the container node
        node: NodeTrace,
    },
    /// An iteration or loop node completed
    ContainerFinished {
        /// Iteration or loop
        kind: ContainerKind,
        /// Trace of the container node
        node: NodeTrace,
    },
    /// The workflow needs a human to fill a form
    HumanInputRequired(HumanInputForm),
    /// A pending form was submitted
    HumanInputFormFilled(HumanInputForm),
    /// A pending form got a new expiration time
    HumanInputFormTimeout {
        /// Node whose form timed out
        node_id: String,
        /// New expiration (unix seconds)
        expiration_time: Option<i64>,
    },
    /// The stream failed
    Error {
        /// Human-readable message
        message: String,
        /// Machine-readable code
        code: Option<String>,
    },
    /// Terminal event, exactly once per stream
    Completed {
        /// Whether the stream ended in error
        has_error: bool,
    },
}

impl StreamEvent {
    /// Short kind name used in logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Thought(_) => "thought",
            Self::File(_) => "file",
            Self::MessageEnd(_) => "message_end",
            Self::MessageReplace { .. } => "message_replace",
            Self::WorkflowStarted(_) => "workflow_started",
            Self::WorkflowFinished { .. } => "workflow_finished",
            Self::WorkflowPaused { .. } => "workflow_paused",
            Self::NodeStarted(_) => "node_started",
            Self::NodeFinished(_) => "node_finished",
            Self::ContainerStarted {
                kind: ContainerKind::Iteration,
                ..
            } => "iteration_started",
            Self::ContainerStarted {
                kind: ContainerKind::Loop,
                ..
            } => "loop_started",
            Self::ContainerFinished {
                kind: ContainerKind::Iteration,
                ..
            } => "iteration_completed",
            Self::ContainerFinished {
                kind: ContainerKind::Loop,
                ..
            } => "loop_completed",
            Self::HumanInputRequired(_) => "human_input_required",
            Self::HumanInputFormFilled(_) => "human_input_form_filled",
            Self::HumanInputFormTimeout { .. } => "human_input_form_timeout",
            Self::Error { .. } => "error",
            Self::Completed { .. } => "completed",
        }
    }

    /// Whether this is the terminal event
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

// ============================================================================
// Wire payloads
// ============================================================================

#[derive(Deserialize)]
struct MessageFrame {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Deserialize)]
struct ThoughtFrame {
    #[serde(default)]
    id: String,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    thought: String,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    tool_input: String,
    #[serde(default)]
    observation: String,
    #[serde(default, deserialize_with = "lenient_files")]
    message_files: Vec<FileRef>,
    #[serde(default)]
    position: u32,
}

#[derive(Deserialize)]
struct FileFrame {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    belongs_to: Option<String>,
}

#[derive(Deserialize)]
struct MessageEndFrame {
    #[serde(default)]
    id: String,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    metadata: MessageEndMetadata,
    #[serde(default, deserialize_with = "lenient_files")]
    files: Vec<FileRef>,
}

#[derive(Deserialize)]
struct ReplaceFrame {
    #[serde(default)]
    answer: String,
}

#[derive(Default, Deserialize)]
struct RunData {
    #[serde(default)]
    workflow_run_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<WorkflowStatus>,
}

#[derive(Deserialize)]
struct WorkflowFrame {
    #[serde(default)]
    workflow_run_id: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    data: RunData,
}

impl WorkflowFrame {
    fn run_id(&self) -> Option<String> {
        self.workflow_run_id
            .clone()
            .or_else(|| self.data.workflow_run_id.clone())
    }
}

#[derive(Deserialize)]
struct NodeData {
    #[serde(default)]
    id: String,
    node_id: String,
    #[serde(default)]
    node_type: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: Option<NodeStatus>,
    #[serde(default)]
    iteration_id: Option<String>,
    #[serde(default)]
    parallel_id: Option<String>,
    #[serde(default)]
    execution_metadata: Option<ExecutionMetadata>,
}

#[derive(Deserialize)]
struct ExecutionMetadata {
    #[serde(default)]
    parallel_id: Option<String>,
}

impl NodeData {
    fn into_trace(self, default_status: NodeStatus) -> NodeTrace {
        // Container frames report their branch under execution metadata
        let parallel_id = self
            .parallel_id
            .or_else(|| self.execution_metadata.and_then(|m| m.parallel_id));
        NodeTrace {
            id: self.id,
            node_id: self.node_id,
            node_type: self.node_type,
            title: self.title,
            status: self.status.unwrap_or(default_status),
            iteration_id: self.iteration_id,
            parallel_id,
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TimeoutData {
    node_id: String,
    #[serde(default)]
    expiration_time: Option<i64>,
}

#[derive(Deserialize)]
struct ErrorFrame {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// Accept file lists given either as objects or as bare id strings
fn lenient_files<'de, D>(deserializer: D) -> Result<Vec<FileRef>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        Id(String),
        File(FileRef),
    }

    let entries: Option<Vec<Entry>> = Option::deserialize(deserializer)?;
    Ok(entries
        .unwrap_or_default()
        .into_iter()
        .map(|entry| match entry {
            Entry::Id(id) => FileRef {
                id,
                ..FileRef::default()
            },
            Entry::File(file) => file,
        })
        .collect())
}

/// Build a complete file reference from the coarse kind the server sends
/// (`image`, `video`, `audio`, anything else is a document)
#[must_use]
pub fn normalize_file(
    id: String,
    kind: Option<&str>,
    url: Option<String>,
    belongs_to: Option<String>,
) -> FileRef {
    let kind = kind.unwrap_or("image");
    let (mime_type, support, ext) = match kind {
        "image" => ("image/png", "image", "png"),
        "video" => ("video/mp4", "video", "mp4"),
        "audio" => ("audio/mpeg", "audio", "mp3"),
        _ => ("application/octet-stream", "document", "bin"),
    };
    let transfer_method = if kind == "image" {
        "remote_url"
    } else {
        "local_file"
    };

    FileRef {
        upload_file_id: Some(id.clone()),
        id,
        mime_type: mime_type.to_string(),
        transfer_method: transfer_method.to_string(),
        support_file_type: support.to_string(),
        name: format!("generated_{kind}.{ext}"),
        url,
        size: 0,
        belongs_to,
    }
}

fn container_kind(event: &str) -> ContainerKind {
    if event.starts_with("loop") {
        ContainerKind::Loop
    } else {
        ContainerKind::Iteration
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Decodes SSE `data:` payloads into [`StreamEvent`]s
///
/// Stateful only to track whether a content delta is the first one.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    seen_message: bool,
}

impl FrameDecoder {
    /// Create a decoder for a fresh stream
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one payload
    ///
    /// Returns `Ok(None)` for keep-alives, blank payloads and kinds this client
    /// does not handle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Decode`] if the payload is not valid JSON or a
    /// known kind is missing required fields.
    pub fn decode(&mut self, payload: &str) -> Result<Option<StreamEvent>, EngineError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(payload)?;
        let kind = value
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let event = match kind.as_str() {
            "message" | "agent_message" => {
                let frame: MessageFrame = serde_json::from_value(value)?;
                let is_first_message = !self.seen_message;
                self.seen_message = true;
                StreamEvent::Data(DataEvent {
                    message: frame.answer,
                    is_first_message,
                    conversation_id: frame.conversation_id,
                    message_id: frame.message_id.or(frame.id),
                    task_id: frame.task_id,
                })
            }
            "agent_thought" => {
                let frame: ThoughtFrame = serde_json::from_value(value)?;
                StreamEvent::Thought(AgentThoughtStep {
                    id: frame.id,
                    message_id: frame.message_id,
                    conversation_id: frame.conversation_id,
                    thought: frame.thought,
                    tool: frame.tool,
                    tool_input: frame.tool_input,
                    observation: frame.observation,
                    message_files: frame.message_files,
                    position: frame.position,
                })
            }
            "message_file" => {
                let frame: FileFrame = serde_json::from_value(value)?;
                StreamEvent::File(normalize_file(
                    frame.id,
                    frame.kind.as_deref(),
                    frame.url,
                    frame.belongs_to,
                ))
            }
            "message_end" => {
                let frame: MessageEndFrame = serde_json::from_value(value)?;
                let id = if frame.id.is_empty() {
                    frame.message_id
                } else {
                    frame.id
                };
                StreamEvent::MessageEnd(MessageEnd {
                    id,
                    metadata: frame.metadata,
                    files: frame.files,
                })
            }
            "message_replace" => {
                let frame: ReplaceFrame = serde_json::from_value(value)?;
                StreamEvent::MessageReplace {
                    answer: frame.answer,
                }
            }
            "workflow_started" => {
                let frame: WorkflowFrame = serde_json::from_value(value)?;
                let workflow_run_id = frame
                    .run_id()
                    .or_else(|| frame.data.id.clone())
                    .unwrap_or_default();
                StreamEvent::WorkflowStarted(WorkflowStarted {
                    workflow_run_id,
                    task_id: frame.task_id,
                    conversation_id: frame.conversation_id,
                    message_id: frame.message_id,
                })
            }
            "workflow_finished" => {
                let frame: WorkflowFrame = serde_json::from_value(value)?;
                StreamEvent::WorkflowFinished {
                    workflow_run_id: frame.run_id(),
                    status: frame.data.status.unwrap_or(WorkflowStatus::Succeeded),
                }
            }
            "workflow_paused" => {
                let frame: WorkflowFrame = serde_json::from_value(value)?;
                StreamEvent::WorkflowPaused {
                    workflow_run_id: frame.run_id().unwrap_or_default(),
                }
            }
            "node_started" => {
                let frame: Envelope<NodeData> = serde_json::from_value(value)?;
                StreamEvent::NodeStarted(frame.data.into_trace(NodeStatus::Running))
            }
            "node_finished" => {
                let frame: Envelope<NodeData> = serde_json::from_value(value)?;
                StreamEvent::NodeFinished(frame.data.into_trace(NodeStatus::Succeeded))
            }
            "iteration_started" | "loop_started" => {
                let frame: Envelope<NodeData> = serde_json::from_value(value)?;
                StreamEvent::ContainerStarted {
                    kind: container_kind(&kind),
                    // A started container is running whatever the frame says
                    node: NodeTrace {
                        status: NodeStatus::Running,
                        ..frame.data.into_trace(NodeStatus::Running)
                    },
                }
            }
            "iteration_completed" | "loop_completed" => {
                let frame: Envelope<NodeData> = serde_json::from_value(value)?;
                StreamEvent::ContainerFinished {
                    kind: container_kind(&kind),
                    node: frame.data.into_trace(NodeStatus::Succeeded),
                }
            }
            "human_input_required" => {
                let frame: Envelope<HumanInputForm> = serde_json::from_value(value)?;
                StreamEvent::HumanInputRequired(frame.data)
            }
            "human_input_form_filled" => {
                let frame: Envelope<HumanInputForm> = serde_json::from_value(value)?;
                StreamEvent::HumanInputFormFilled(frame.data)
            }
            "human_input_form_timeout" => {
                let frame: Envelope<TimeoutData> = serde_json::from_value(value)?;
                StreamEvent::HumanInputFormTimeout {
                    node_id: frame.data.node_id,
                    expiration_time: frame.data.expiration_time,
                }
            }
            "error" => {
                let frame: ErrorFrame = serde_json::from_value(value)?;
                StreamEvent::Error {
                    message: frame.message,
                    code: frame.code,
                }
            }
            "ping" => return Ok(None),
            other => {
                tracing::trace!(kind = %other, "Skipping unhandled stream event");
                return Ok(None);
            }
        };

        Ok(Some(event))
    }
}
