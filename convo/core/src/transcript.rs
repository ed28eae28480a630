//! Transcript Data Model
//!
//! The conversation transcript is a tree of [`Turn`]s: a Question's parent is
//! the Answer it follows up on, and an Answer's parent is its Question. Asking
//! again from the same parent (regenerating, or resuming a human-in-the-loop
//! branch) creates sibling branches. What gets rendered is the *active
//! thread*, a linear walk through the tree.
//!
//! Turns are stored in an arena whose order is the sibling order. While a
//! round-trip is streaming, the Question and its placeholder Answer live in an
//! [`Exchange`] that remembers every id the pair has carried, so the reducer
//! can replace the pair by id no matter how often the server renames it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Id used for the synthetic opening-statement turn
pub const OPENING_STATEMENT_ID: &str = "opening-statement";

/// Which side of the conversation a turn belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// User input
    Question,
    /// Assistant output
    Answer,
}

/// A file attached to a turn or produced by a tool
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileRef {
    /// File id
    pub id: String,
    /// MIME type (e.g. `image/png`)
    #[serde(rename = "type")]
    pub mime_type: String,
    /// How the file reached the server (`remote_url` or `local_file`)
    pub transfer_method: String,
    /// Coarse kind: `image`, `video`, `audio` or `document`
    pub support_file_type: String,
    /// Display name
    pub name: String,
    /// Download URL, if any
    pub url: Option<String>,
    /// Id of the uploaded file on the server
    pub upload_file_id: Option<String>,
    /// Size in bytes (0 when unknown)
    pub size: u64,
    /// Which side produced the file (`user` or `assistant`)
    pub belongs_to: Option<String>,
}

/// One reasoning/tool-use step of an agentic answer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentThoughtStep {
    /// Step id; repeated ids update the same step
    pub id: String,
    /// Server message id this step belongs to
    pub message_id: Option<String>,
    /// Conversation id, when the server reports it on the step
    pub conversation_id: Option<String>,
    /// Reasoning text
    pub thought: String,
    /// Tool name(s) invoked
    pub tool: String,
    /// Serialized tool input
    pub tool_input: String,
    /// Tool observation/output
    pub observation: String,
    /// Files produced during this step
    pub message_files: Vec<FileRef>,
    /// 1-based position within the answer
    pub position: u32,
}

/// A retrieved source backing an answer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationEntry {
    /// Rank of the source
    pub position: u32,
    /// Dataset id
    pub dataset_id: Option<String>,
    /// Dataset name
    pub dataset_name: Option<String>,
    /// Document id
    pub document_id: Option<String>,
    /// Document name
    pub document_name: Option<String>,
    /// Segment id
    pub segment_id: Option<String>,
    /// Retrieval score
    pub score: Option<f64>,
    /// Segment content
    pub content: Option<String>,
}

/// A curated reply that overrides the streamed content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Annotation id
    pub id: String,
    /// Author display name
    pub author_name: String,
    /// Curated reply added from the logs, shown instead of the answer
    #[serde(default)]
    pub log_content: Option<String>,
}

/// Like/dislike rating
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    /// Positive
    Like,
    /// Negative
    Dislike,
}

/// End-user or admin feedback on an answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// The rating, if one was given
    pub rating: Option<Rating>,
    /// Free-text comment
    pub content: Option<String>,
}

/// Timing and token metadata attached after the enrichment fetch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoreInfo {
    /// Creation time, formatted `hh:mm AM`
    pub time: String,
    /// Prompt + answer tokens
    pub tokens: u64,
    /// Provider latency in seconds, two decimals
    pub latency: String,
    /// Answer tokens per second, two decimals (absent when latency is 0)
    pub tokens_per_second: Option<String>,
}

/// Run status of a workflow driving an answer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Executing
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Stopped by the user
    Stopped,
    /// Waiting for human input
    Paused,
    /// Finished with partial failures
    PartialSucceeded,
    /// Any status this client does not know
    #[serde(other)]
    Unknown,
}

/// Run status of one workflow node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Executing
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Finished with a handled exception
    Exception,
    /// Stopped by the user
    Stopped,
    /// Waiting for human input
    Paused,
    /// Any status this client does not know
    #[serde(other)]
    Unknown,
}

/// Trace entry for one executed workflow node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeTrace {
    /// Execution id of this node run
    pub id: String,
    /// Node id within the workflow graph
    pub node_id: String,
    /// Node type (e.g. `llm`, `human-input`)
    #[serde(default)]
    pub node_type: String,
    /// Node title
    #[serde(default)]
    pub title: String,
    /// Run status
    pub status: NodeStatus,
    /// Iteration container id, when the node runs inside an iteration
    #[serde(default)]
    pub iteration_id: Option<String>,
    /// Parallel branch id, when the node runs in a parallel branch
    #[serde(default)]
    pub parallel_id: Option<String>,
}

/// Workflow progress attached to an answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProcess {
    /// Overall run status
    pub status: WorkflowStatus,
    /// Executed nodes, in start order
    pub tracing: Vec<NodeTrace>,
}

impl WorkflowProcess {
    /// A freshly started run with no trace
    #[must_use]
    pub fn running() -> Self {
        Self {
            status: WorkflowStatus::Running,
            tracing: Vec::new(),
        }
    }
}

/// A human-input form a paused workflow is waiting on
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanInputForm {
    /// Node that requested the input
    pub node_id: String,
    /// Node title
    pub node_title: String,
    /// Form id
    pub form_id: Option<String>,
    /// Rendered form body
    pub form_content: Option<String>,
    /// Unix timestamp after which the form expires
    pub expiration_time: Option<i64>,
    /// Remaining server-defined fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One conversational unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Unique id (renamed once the server issues a canonical id)
    pub id: String,
    /// Question or Answer
    pub role: TurnRole,
    /// Parent turn in the tree (None for roots)
    pub parent_id: Option<String>,
    /// Text content (accumulated while streaming for answers)
    pub content: String,
    /// Whether this answer is still streaming
    pub is_placeholder: bool,
    /// Agentic reasoning steps
    pub agent_thoughts: Vec<AgentThoughtStep>,
    /// Attached/produced files
    pub files: Vec<FileRef>,
    /// Files confirmed by the server at message end
    pub all_files: Vec<FileRef>,
    /// Sources backing the answer
    pub citation: Vec<CitationEntry>,
    /// Curated reply overriding `content`
    pub annotation: Option<Annotation>,
    /// End-user feedback
    pub feedback: Option<Feedback>,
    /// Admin feedback
    pub admin_feedback: Option<Feedback>,
    /// Enrichment metadata
    pub more: Option<MoreInfo>,
    /// Forms the paused workflow is waiting on
    pub human_input_forms: Vec<HumanInputForm>,
    /// Forms already submitted
    pub filled_human_input_forms: Vec<HumanInputForm>,
    /// Workflow run that produced this answer
    pub workflow_run_id: Option<String>,
    /// Workflow progress
    pub workflow_process: Option<WorkflowProcess>,
    /// Conversation this turn belongs to
    pub conversation_id: Option<String>,
    /// Whether this is the synthetic opening statement
    pub is_opening_statement: bool,
    /// Suggested follow-ups (opening statement only)
    pub suggested_questions: Vec<String>,
}

impl Turn {
    fn blank(id: String, role: TurnRole, parent_id: Option<String>) -> Self {
        Self {
            id,
            role,
            parent_id,
            content: String::new(),
            is_placeholder: false,
            agent_thoughts: Vec::new(),
            files: Vec::new(),
            all_files: Vec::new(),
            citation: Vec::new(),
            annotation: None,
            feedback: None,
            admin_feedback: None,
            more: None,
            human_input_forms: Vec::new(),
            filled_human_input_forms: Vec::new(),
            workflow_run_id: None,
            workflow_process: None,
            conversation_id: None,
            is_opening_statement: false,
            suggested_questions: Vec::new(),
        }
    }

    /// Create a question turn
    pub fn question(
        id: impl Into<String>,
        content: impl Into<String>,
        parent_id: Option<String>,
    ) -> Self {
        let mut turn = Self::blank(id.into(), TurnRole::Question, parent_id);
        turn.content = content.into();
        turn
    }

    /// Create a settled answer turn
    pub fn answer(id: impl Into<String>, content: impl Into<String>, parent_id: String) -> Self {
        let mut turn = Self::blank(id.into(), TurnRole::Answer, Some(parent_id));
        turn.content = content.into();
        turn
    }

    /// Create an empty streaming answer
    pub fn placeholder_answer(id: impl Into<String>, parent_id: String) -> Self {
        let mut turn = Self::blank(id.into(), TurnRole::Answer, Some(parent_id));
        turn.is_placeholder = true;
        turn
    }

    /// Create the opening-statement turn
    pub fn opening_statement(content: impl Into<String>, suggested_questions: Vec<String>) -> Self {
        let mut turn = Self::blank(OPENING_STATEMENT_ID.to_string(), TurnRole::Answer, None);
        turn.content = content.into();
        turn.is_opening_statement = true;
        turn.suggested_questions = suggested_questions;
        turn
    }

    /// Whether this is a question
    #[must_use]
    pub fn is_question(&self) -> bool {
        self.role == TurnRole::Question
    }

    /// Whether this is an answer
    #[must_use]
    pub fn is_answer(&self) -> bool {
        self.role == TurnRole::Answer
    }

    /// Whether a workflow paused on this turn is waiting for human input
    #[must_use]
    pub fn awaits_human_input(&self) -> bool {
        !self.human_input_forms.is_empty()
    }
}

/// The in-flight Question + Answer pair of one round-trip
#[derive(Clone, Debug)]
pub struct Exchange {
    /// The question being answered
    pub question: Turn,
    /// The answer being streamed
    pub answer: Turn,
    /// Every id either turn has carried (placeholder and server-issued)
    pub(crate) known_ids: Vec<String>,
    /// Whether the server has issued a canonical message id
    pub(crate) has_server_id: bool,
    /// Whether agent thoughts have arrived (data then extends the last thought)
    pub(crate) agent_mode: bool,
    /// Whether this continues a pair that was already settled
    pub(crate) resumed: bool,
}

impl Exchange {
    /// Start a round-trip from a freshly created pair
    #[must_use]
    pub fn new(question: Turn, answer: Turn) -> Self {
        let known_ids = vec![question.id.clone(), answer.id.clone()];
        Self {
            question,
            answer,
            known_ids,
            has_server_id: false,
            agent_mode: false,
            resumed: false,
        }
    }

    /// Continue a settled pair (a resumed workflow branch)
    #[must_use]
    pub fn resume(question: Turn, answer: Turn) -> Self {
        let agent_mode = !answer.agent_thoughts.is_empty();
        let mut exchange = Self::new(question, answer);
        exchange.has_server_id = true;
        exchange.agent_mode = agent_mode;
        exchange.resumed = true;
        exchange
    }

    /// Whether the server has issued a canonical id for this pair
    #[must_use]
    pub fn has_server_id(&self) -> bool {
        self.has_server_id
    }

    /// Whether this continues an already settled pair
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub(crate) fn remember_ids(&mut self) {
        for id in [&self.question.id, &self.answer.id] {
            if !self.known_ids.contains(id) {
                self.known_ids.push(id.clone());
            }
        }
    }
}

/// Ordered tree of turns plus the in-flight exchange
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    pub(crate) turns: Vec<Turn>,
    pub(crate) in_flight: Option<Exchange>,
    opening: Option<Turn>,
    pub(crate) target_id: Option<String>,
}

impl Transcript {
    /// Create an empty transcript
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transcript that renders an opening statement first
    #[must_use]
    pub fn with_opening_statement(opening: Turn) -> Self {
        Self {
            opening: Some(opening),
            ..Self::default()
        }
    }

    /// Build a transcript from existing turns (arena order = sibling order)
    #[must_use]
    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self {
            turns,
            ..Self::default()
        }
    }

    /// All turns in arena order (excluding the opening statement)
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The opening statement, if configured
    #[must_use]
    pub fn opening_statement(&self) -> Option<&Turn> {
        self.opening.as_ref()
    }

    /// The round-trip currently streaming, if any
    #[must_use]
    pub fn in_flight(&self) -> Option<&Exchange> {
        self.in_flight.as_ref()
    }

    /// Number of turns (excluding the opening statement)
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether the transcript has no turns
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Look up a turn by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Turn> {
        self.turns.iter().find(|t| t.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.id == id)
    }

    /// Children of a turn (or roots for `None`), in sibling order
    pub fn children<'a>(&'a self, parent_id: Option<&'a str>) -> impl Iterator<Item = &'a Turn> {
        self.turns
            .iter()
            .filter(move |t| t.parent_id.as_deref() == parent_id)
    }

    /// The turn the active thread is pointed at, if any
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    /// Point the active thread at a turn (`None` follows the newest branch)
    pub fn set_target(&mut self, id: Option<String>) {
        self.target_id = id;
    }

    /// The active thread: path to the target (or newest leaf), extended
    /// through the newest child of each node, opening statement first
    #[must_use]
    pub fn thread(&self) -> Vec<&Turn> {
        let mut path: Vec<&Turn> = Vec::new();

        if let Some(target) = self.target_id.as_deref().and_then(|id| self.get(id)) {
            let mut cursor = Some(target);
            while let Some(turn) = cursor {
                path.push(turn);
                cursor = turn.parent_id.as_deref().and_then(|id| self.get(id));
            }
            path.reverse();
        } else if let Some(root) = self.children(None).last() {
            path.push(root);
        }

        while let Some(last) = path.last() {
            match self.children(Some(last.id.as_str())).last() {
                Some(child) => path.push(child),
                None => break,
            }
        }

        if let Some(ref opening) = self.opening {
            path.insert(0, opening);
        }
        path
    }

    /// Alternative answers sharing the same parent as `answer_id`
    /// (including itself), in sibling order
    #[must_use]
    pub fn siblings(&self, answer_id: &str) -> Vec<&Turn> {
        let Some(question) = self
            .get(answer_id)
            .and_then(|a| a.parent_id.as_deref())
            .and_then(|id| self.get(id))
        else {
            return Vec::new();
        };

        self.children(question.parent_id.as_deref())
            .filter(|q| q.is_question())
            .filter_map(|q| self.children(Some(q.id.as_str())).next())
            .collect()
    }

    /// Find the question a turn answers
    #[must_use]
    pub fn question_for(&self, answer_id: &str) -> Option<&Turn> {
        self.get(answer_id)
            .and_then(|a| a.parent_id.as_deref())
            .and_then(|id| self.get(id))
    }

    /// Reset to an empty transcript (the opening statement is kept)
    pub fn clear(&mut self) {
        self.turns.clear();
        self.in_flight = None;
        self.target_id = None;
    }

    /// Replace the opening statement
    pub fn set_opening_statement(&mut self, opening: Option<Turn>) {
        self.opening = opening;
    }
}
