use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weave_core::error::{Result, WeaveError};
use weave_core::types::ValueMap;

use crate::definition::Workflow;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome of one step within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub input: ValueMap,
    #[serde(default)]
    pub output: ValueMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_used: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl StepState {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            input: ValueMap::new(),
            output: ValueMap::new(),
            error: None,
            started_at: None,
            completed_at: None,
            duration_ms: 0,
            agent_used: None,
            retry_count: 0,
            logs: Vec::new(),
        }
    }

    /// A step that never ran.
    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut state = Self::new(step_id);
        state.status = StepStatus::Skipped;
        state.completed_at = Some(Utc::now());
        state.logs.push(reason.into());
        state
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
    }

    pub fn complete(&mut self, output: ValueMap) {
        self.output = output;
        self.finish(StepStatus::Completed);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.finish(StepStatus::Failed);
    }

    fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at.get_or_insert(now);
        if let Some(start) = self.started_at {
            self.duration_ms = (now - start).num_milliseconds().max(0) as u64;
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }
}

/// Record of one run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub inputs: ValueMap,
    #[serde(default)]
    pub outputs: ValueMap,
    #[serde(default)]
    pub step_states: BTreeMap<String, StepState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// First step whose failure ended the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl WorkflowExecution {
    pub fn new(workflow: &Workflow, inputs: ValueMap) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            status: WorkflowStatus::Pending,
            inputs,
            outputs: ValueMap::new(),
            step_states: BTreeMap::new(),
            error: None,
            failed_step: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn start(&mut self) {
        if self.status == WorkflowStatus::Pending {
            self.status = WorkflowStatus::Running;
            self.started_at = Utc::now();
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Store a step's final state. Each step is recorded once, and nothing is
    /// recorded after the execution has finished.
    pub fn record_step(&mut self, state: StepState) -> Result<()> {
        if self.is_terminal() {
            return Err(WeaveError::invalid_state(&self.id, self.status, "record step on"));
        }
        if self.step_states.contains_key(&state.step_id) {
            return Err(WeaveError::invalid_state(
                &state.step_id,
                self.step_states[&state.step_id].status,
                "record",
            ));
        }
        self.step_states.insert(state.step_id.clone(), state);
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&StepState> {
        self.step_states.get(id)
    }

    /// Ids of steps that ended with `status`, in id order.
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.step_states
            .values()
            .filter(|s| s.status == status)
            .map(|s| s.step_id.as_str())
            .collect()
    }

    /// Returns `false` if the execution had already finished.
    pub fn mark_completed(&mut self) -> bool {
        self.finish(WorkflowStatus::Completed, None)
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        self.finish(WorkflowStatus::Failed, Some(error.into()))
    }

    pub fn mark_cancelled(&mut self, reason: impl Into<String>) -> bool {
        self.finish(WorkflowStatus::Cancelled, Some(reason.into()))
    }

    fn finish(&mut self, status: WorkflowStatus, error: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        true
    }

    /// Turn a finished record into a `Result`, for callers that only care
    /// whether the run succeeded.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            WorkflowStatus::Completed => Ok(self),
            WorkflowStatus::Cancelled => Err(WeaveError::Cancelled),
            WorkflowStatus::Failed => Err(WeaveError::StepFailed {
                step: self
                    .failed_step
                    .clone()
                    .unwrap_or_else(|| self.workflow_name.clone()),
                message: self.error.clone().unwrap_or_default(),
            }),
            other => Err(WeaveError::invalid_state(&self.id, other, "take result of")),
        }
    }
}
