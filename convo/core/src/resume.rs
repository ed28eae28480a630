//! Workflow Pause Resumer
//!
//! When a workflow pauses for human input, the primary stream ends but the
//! run keeps producing events once the form is submitted. The resumer decides
//! which run's event feed to subscribe to and whether the subscription needs a
//! state snapshot.
//!
//! A snapshot is only needed when resuming a branch this client did not just
//! stream: the replayed state covers everything that happened while another
//! branch was active.

use crate::protocol::WorkflowStarted;
use crate::transcript::Turn;

/// A workflow event subscription to open
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumePlan {
    /// Run whose events to follow
    pub workflow_run_id: String,
    /// Answer turn the events apply to
    pub answer_id: String,
    /// Whether to ask for a replay of accumulated state
    pub include_state_snapshot: bool,
}

impl ResumePlan {
    /// Endpoint path of the run's event feed
    #[must_use]
    pub fn endpoint(&self) -> String {
        events_path(&self.workflow_run_id, self.include_state_snapshot)
    }
}

/// Path of a run's event feed
#[must_use]
pub fn events_path(workflow_run_id: &str, include_state_snapshot: bool) -> String {
    if include_state_snapshot {
        format!("/workflow/{workflow_run_id}/events?include_state_snapshot=true")
    } else {
        format!("/workflow/{workflow_run_id}/events")
    }
}

/// Tracks the current workflow run and plans resumptions
#[derive(Debug, Default)]
pub struct WorkflowPauseResumer {
    current: Option<WorkflowStarted>,
}

impl WorkflowPauseResumer {
    /// Create a resumer with no captured run
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the run announced by `workflow_started`
    pub fn observe_started(&mut self, started: &WorkflowStarted) {
        tracing::debug!(
            workflow_run_id = %started.workflow_run_id,
            task_id = ?started.task_id,
            "Workflow run started"
        );
        self.current = Some(started.clone());
    }

    /// The captured run, if any
    #[must_use]
    pub fn current(&self) -> Option<&WorkflowStarted> {
        self.current.as_ref()
    }

    /// Forget the captured run
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Plan the subscription after `workflow_paused`
    ///
    /// The client was streaming this run, so no snapshot is requested. A pause
    /// naming a different run than the captured one is ignored.
    #[must_use]
    pub fn on_paused(&self, workflow_run_id: &str, answer_id: &str) -> Option<ResumePlan> {
        let run_id = match (self.current.as_ref(), workflow_run_id.is_empty()) {
            (Some(current), true) => current.workflow_run_id.clone(),
            (Some(current), false) if current.workflow_run_id != workflow_run_id => {
                tracing::warn!(
                    paused = %workflow_run_id,
                    current = %current.workflow_run_id,
                    "Pause for an unknown workflow run ignored"
                );
                return None;
            }
            (_, false) => workflow_run_id.to_string(),
            (None, true) => {
                tracing::warn!("Pause without a workflow run id ignored");
                return None;
            }
        };

        Some(ResumePlan {
            workflow_run_id: run_id,
            answer_id: answer_id.to_string(),
            include_state_snapshot: false,
        })
    }

    /// Plan the subscription when switching to a sibling branch
    ///
    /// Only branches paused on pending human input are resumed. The snapshot
    /// is requested unless `turn` is the branch most recently streamed.
    #[must_use]
    pub fn plan_for_branch(turn: &Turn, active_branch_id: Option<&str>) -> Option<ResumePlan> {
        let run_id = turn.workflow_run_id.as_ref()?;
        if !turn.awaits_human_input() {
            return None;
        }

        Some(ResumePlan {
            workflow_run_id: run_id.clone(),
            answer_id: turn.id.clone(),
            include_state_snapshot: active_branch_id != Some(turn.id.as_str()),
        })
    }
}
