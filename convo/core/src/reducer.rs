//! Transcript Reducer
//!
//! Pure state transitions: `(transcript, event) -> transcript`.
//!
//! # Design Philosophy
//!
//! The in-flight Question + Answer pair is edited on the [`Exchange`], never
//! in the arena. After every event the arena is rebuilt: each node carrying
//! an id the pair has ever had is filtered out, and fresh clones of the pair
//! go where the first stale node was. A server-issued id is therefore a
//! rename of the pair, and two rapid events can never leave a placeholder
//! next to its canonical replacement.

use std::mem;

use crate::backend::PersistedMessage;
use crate::protocol::{ContainerKind, DataEvent, MessageEnd, StreamEvent, WorkflowStarted};
use crate::transcript::{
    AgentThoughtStep, Annotation, Exchange, FileRef, NodeStatus, NodeTrace, Transcript,
    WorkflowProcess, WorkflowStatus,
};

/// Put a new round-trip in flight and append its pair
#[must_use]
pub fn begin(mut transcript: Transcript, mut exchange: Exchange) -> Transcript {
    if let Some(previous) = transcript.in_flight.take() {
        tracing::warn!(
            answer_id = %previous.answer.id,
            "Replacing an unsettled exchange"
        );
        transcript = settle(transcript, previous);
    }
    upsert(&mut transcript, &mut exchange);
    transcript.in_flight = Some(exchange);
    transcript
}

/// Apply one stream event
///
/// Events arriving with nothing in flight are ignored.
#[must_use]
pub fn apply(mut transcript: Transcript, event: &StreamEvent) -> Transcript {
    let Some(mut exchange) = transcript.in_flight.take() else {
        tracing::trace!(kind = event.kind(), "No exchange in flight, event ignored");
        return transcript;
    };

    match event {
        StreamEvent::Data(data) => on_data(&mut exchange, data),
        StreamEvent::Thought(step) => on_thought(&mut exchange, step),
        StreamEvent::File(file) => on_file(&mut exchange, file),
        StreamEvent::MessageEnd(end) => on_message_end(&mut exchange, end),
        StreamEvent::MessageReplace { answer } => {
            exchange.answer.content.clone_from(answer);
        }
        StreamEvent::WorkflowStarted(started) => on_workflow_started(&mut exchange, started),
        StreamEvent::WorkflowFinished { status, .. } => {
            exchange
                .answer
                .workflow_process
                .get_or_insert_with(WorkflowProcess::running)
                .status = *status;
        }
        StreamEvent::WorkflowPaused { .. } => {
            exchange
                .answer
                .workflow_process
                .get_or_insert_with(WorkflowProcess::running)
                .status = WorkflowStatus::Paused;
            return settle(transcript, exchange);
        }
        StreamEvent::NodeStarted(node) | StreamEvent::NodeFinished(node) => {
            upsert_node(&mut exchange, node);
        }
        StreamEvent::ContainerStarted { kind, node } => {
            upsert_container(&mut exchange, *kind, node, false);
        }
        StreamEvent::ContainerFinished { kind, node } => {
            upsert_container(&mut exchange, *kind, node, true);
        }
        StreamEvent::HumanInputRequired(form) => {
            let answer = &mut exchange.answer;
            match answer
                .human_input_forms
                .iter_mut()
                .find(|f| f.node_id == form.node_id)
            {
                Some(existing) => existing.clone_from(form),
                None => answer.human_input_forms.push(form.clone()),
            }
            if let Some(process) = answer.workflow_process.as_mut() {
                for node in process
                    .tracing
                    .iter_mut()
                    .filter(|n| n.node_id == form.node_id)
                {
                    node.status = NodeStatus::Paused;
                }
            }
        }
        StreamEvent::HumanInputFormFilled(form) => {
            let answer = &mut exchange.answer;
            answer.human_input_forms.retain(|f| f.node_id != form.node_id);
            answer.filled_human_input_forms.push(form.clone());
        }
        StreamEvent::HumanInputFormTimeout {
            node_id,
            expiration_time,
        } => {
            for form in exchange
                .answer
                .human_input_forms
                .iter_mut()
                .filter(|f| &f.node_id == node_id)
            {
                form.expiration_time = *expiration_time;
            }
        }
        StreamEvent::Error { message, .. } => {
            tracing::debug!(answer_id = %exchange.answer.id, error = %message, "Rolling back exchange");
            return rollback_exchange(transcript, exchange);
        }
        StreamEvent::Completed { has_error } => {
            return if *has_error {
                rollback_exchange(transcript, exchange)
            } else {
                settle(transcript, exchange)
            };
        }
    }

    upsert(&mut transcript, &mut exchange);
    transcript.in_flight = Some(exchange);
    transcript
}

/// Settle whatever is in flight as it stands
#[must_use]
pub fn finalize(mut transcript: Transcript) -> Transcript {
    match transcript.in_flight.take() {
        Some(exchange) => settle(transcript, exchange),
        None => transcript,
    }
}

/// Discard the in-flight answer, keeping its question (see [`apply`] for `Error`)
#[must_use]
pub fn rollback(mut transcript: Transcript) -> Transcript {
    match transcript.in_flight.take() {
        Some(exchange) => rollback_exchange(transcript, exchange),
        None => transcript,
    }
}

/// Merge a persisted message into the settled answer with the same id
///
/// Returns whether a matching answer was found; no match leaves the
/// transcript untouched.
#[must_use]
pub fn enrich(mut transcript: Transcript, message: &PersistedMessage) -> (Transcript, bool) {
    let Some(answer) = transcript
        .get_mut(&message.id)
        .filter(|turn| turn.is_answer() && !turn.is_placeholder)
    else {
        tracing::debug!(message_id = %message.id, "No settled answer to enrich");
        return (transcript, false);
    };

    answer.more = Some(message.more_info());
    if answer.annotation.is_none() {
        answer.content = message.display_answer();
    }
    if let Some(ref conversation_id) = message.conversation_id {
        answer.conversation_id = Some(conversation_id.clone());
    }
    (transcript, true)
}

/// A change to the curated reply of a settled answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnnotationEdit {
    /// The curated reply was edited: both texts are rewritten
    Edited {
        /// New question text
        query: String,
        /// New answer text
        answer: String,
    },
    /// A curated reply was added from the logs; the streamed answer stays
    Added {
        /// Annotation id
        annotation_id: String,
        /// Author display name
        author_name: String,
        /// New question text
        query: String,
        /// Curated reply text
        answer: String,
    },
    /// The curated reply was removed
    Removed,
}

/// Apply an annotation change to a settled answer and its question
///
/// Returns whether the answer was found. Placeholders and the in-flight
/// answer are never touched.
#[must_use]
pub fn annotate(
    mut transcript: Transcript,
    answer_id: &str,
    edit: AnnotationEdit,
) -> (Transcript, bool) {
    let in_flight = transcript
        .in_flight
        .as_ref()
        .is_some_and(|exchange| exchange.answer.id == answer_id);
    let settled = transcript
        .get(answer_id)
        .is_some_and(|turn| turn.is_answer() && !turn.is_placeholder && !turn.is_opening_statement);
    let question_id = transcript.question_for(answer_id).map(|q| q.id.clone());
    let Some(question_id) = question_id.filter(|_| settled && !in_flight) else {
        tracing::debug!(answer_id = %answer_id, "No settled answer to annotate");
        return (transcript, false);
    };

    let query = match edit {
        AnnotationEdit::Edited { ref query, .. } | AnnotationEdit::Added { ref query, .. } => {
            Some(query.clone())
        }
        AnnotationEdit::Removed => None,
    };
    if let (Some(query), Some(question)) = (query, transcript.get_mut(&question_id)) {
        question.content = query;
    }

    if let Some(turn) = transcript.get_mut(answer_id) {
        match edit {
            AnnotationEdit::Edited { answer, .. } => {
                turn.content = answer;
                if let Some(annotation) = turn.annotation.as_mut() {
                    annotation.log_content = None;
                }
            }
            AnnotationEdit::Added {
                annotation_id,
                author_name,
                answer,
                ..
            } => {
                turn.annotation = Some(Annotation {
                    id: annotation_id,
                    author_name,
                    log_content: Some(answer),
                });
            }
            AnnotationEdit::Removed => turn.annotation = None,
        }
    }
    tracing::debug!(answer_id = %answer_id, "Annotation updated");
    (transcript, true)
}

// ============================================================================
// Event rules
// ============================================================================

fn on_data(exchange: &mut Exchange, data: &DataEvent) {
    let into_thought = exchange.agent_mode && !exchange.answer.agent_thoughts.is_empty();
    if into_thought {
        if let Some(last) = exchange.answer.agent_thoughts.last_mut() {
            last.thought.push_str(&data.message);
        }
    } else {
        exchange.answer.content.push_str(&data.message);
    }

    if let Some(ref message_id) = data.message_id {
        assign_server_id(exchange, message_id);
    }
    if data.is_first_message {
        if let Some(ref conversation_id) = data.conversation_id {
            set_conversation(exchange, conversation_id);
        }
    }
}

fn on_thought(exchange: &mut Exchange, incoming: &AgentThoughtStep) {
    if let Some(ref message_id) = incoming.message_id {
        assign_server_id(exchange, message_id);
    }
    if let Some(ref conversation_id) = incoming.conversation_id {
        set_conversation(exchange, conversation_id);
    }
    exchange.agent_mode = true;

    let mut step = incoming.clone();
    let thoughts = &mut exchange.answer.agent_thoughts;
    match thoughts.last_mut() {
        Some(last) if last.id == step.id => {
            if step.thought.is_empty() {
                step.thought = mem::take(&mut last.thought);
            }
            if step.message_files.is_empty() {
                step.message_files = mem::take(&mut last.message_files);
            }
            *last = step;
        }
        _ => thoughts.push(step),
    }
}

fn on_file(exchange: &mut Exchange, file: &FileRef) {
    let answer = &mut exchange.answer;
    match answer.agent_thoughts.last_mut() {
        Some(last) => last.message_files.push(file.clone()),
        None => answer.files.push(file.clone()),
    }
}

fn on_message_end(exchange: &mut Exchange, end: &MessageEnd) {
    if let Some(ref reply) = end.metadata.annotation_reply {
        if !end.id.is_empty() {
            exchange.answer.id.clone_from(&end.id);
            exchange.has_server_id = true;
        }
        exchange.answer.annotation = Some(Annotation {
            id: reply.id.clone(),
            author_name: reply.account.name.clone(),
            log_content: None,
        });
    } else {
        if !end.id.is_empty() {
            assign_server_id(exchange, &end.id);
        }
        exchange.answer.citation = end
            .metadata
            .retriever_resources
            .clone()
            .unwrap_or_default();
        for file in &end.files {
            if !exchange.answer.all_files.iter().any(|f| f.id == file.id) {
                exchange.answer.all_files.push(file.clone());
            }
        }
    }
    exchange.answer.is_placeholder = false;
}

fn on_workflow_started(exchange: &mut Exchange, started: &WorkflowStarted) {
    if let Some(ref message_id) = started.message_id {
        assign_server_id(exchange, message_id);
    }
    if let Some(ref conversation_id) = started.conversation_id {
        set_conversation(exchange, conversation_id);
    }
    if !started.workflow_run_id.is_empty() {
        exchange.answer.workflow_run_id = Some(started.workflow_run_id.clone());
    }

    match exchange.answer.workflow_process.as_mut() {
        // A resumed run keeps the trace recorded before the pause
        Some(process) if !process.tracing.is_empty() => {
            process.status = WorkflowStatus::Running;
        }
        _ => exchange.answer.workflow_process = Some(WorkflowProcess::running()),
    }
}

fn upsert_node(exchange: &mut Exchange, node: &NodeTrace) {
    let process = exchange
        .answer
        .workflow_process
        .get_or_insert_with(WorkflowProcess::running);
    let existing = process.tracing.iter_mut().find(|n| {
        if node.id.is_empty() {
            n.node_id == node.node_id
        } else {
            n.id == node.id
        }
    });
    match existing {
        Some(trace) => trace.clone_from(node),
        // Nodes inside an iteration are traced by their container
        None if node.iteration_id.is_some() => {}
        None => process.tracing.push(node.clone()),
    }
}

/// Iterations and loops are matched by node and parallel branch, since every
/// run of a container node reuses its node id
fn upsert_container(exchange: &mut Exchange, kind: ContainerKind, node: &NodeTrace, finished: bool) {
    let Some(process) = exchange.answer.workflow_process.as_mut() else {
        tracing::trace!(node_id = %node.node_id, ?kind, "Container event outside a workflow ignored");
        return;
    };
    let existing = process
        .tracing
        .iter_mut()
        .find(|n| n.node_id == node.node_id && n.parallel_id == node.parallel_id);

    match (existing, finished) {
        (Some(trace), _) => trace.clone_from(node),
        (None, false) => process.tracing.push(node.clone()),
        (None, true) => {
            tracing::debug!(node_id = %node.node_id, ?kind, "Completion for an untraced container");
        }
    }
}

/// Rename the pair to the server's canonical message id (first id wins)
fn assign_server_id(exchange: &mut Exchange, message_id: &str) {
    if exchange.has_server_id || message_id.is_empty() {
        return;
    }
    exchange.has_server_id = true;
    exchange.question.id = format!("question-{message_id}");
    exchange.answer.id = message_id.to_string();
    exchange.answer.parent_id = Some(exchange.question.id.clone());
    tracing::debug!(message_id = %message_id, "Exchange renamed to server id");
}

fn set_conversation(exchange: &mut Exchange, conversation_id: &str) {
    exchange.question.conversation_id = Some(conversation_id.to_string());
    exchange.answer.conversation_id = Some(conversation_id.to_string());
}

// ============================================================================
// Arena rebuild
// ============================================================================

fn upsert(transcript: &mut Transcript, exchange: &mut Exchange) {
    exchange.remember_ids();

    let mut slot = None;
    let mut rebuilt = Vec::with_capacity(transcript.turns.len() + 2);
    for turn in transcript.turns.drain(..) {
        if exchange.known_ids.contains(&turn.id) {
            slot.get_or_insert(rebuilt.len());
        } else {
            rebuilt.push(turn);
        }
    }

    let pair = [exchange.question.clone(), exchange.answer.clone()];
    match slot {
        Some(at) => {
            rebuilt.splice(at..at, pair);
        }
        None => rebuilt.extend(pair),
    }
    transcript.turns = rebuilt;

    if transcript
        .target_id
        .as_ref()
        .is_some_and(|target| exchange.known_ids.contains(target))
    {
        transcript.target_id = Some(exchange.answer.id.clone());
    }
}

fn settle(mut transcript: Transcript, mut exchange: Exchange) -> Transcript {
    exchange.answer.is_placeholder = false;
    upsert(&mut transcript, &mut exchange);
    tracing::debug!(answer_id = %exchange.answer.id, "Exchange settled");
    transcript
}

fn rollback_exchange(mut transcript: Transcript, mut exchange: Exchange) -> Transcript {
    if exchange.resumed {
        // A resumed branch was settled before; keep it as it stands
        return settle(transcript, exchange);
    }

    // The question stays so the user can retry; only the answer goes
    exchange.remember_ids();
    let question_id = exchange.question.id.clone();
    transcript
        .turns
        .retain(|turn| turn.id == question_id || !exchange.known_ids.contains(&turn.id));

    if transcript
        .target_id
        .as_ref()
        .is_some_and(|target| exchange.known_ids.contains(target))
    {
        transcript.target_id = Some(question_id);
    }
    tracing::debug!(answer_id = %exchange.answer.id, "Answer discarded");
    transcript
}
