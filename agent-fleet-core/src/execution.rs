//! Workflow execution records and their state machines

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a workflow execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// `pending -> running -> {completed, failed, cancelled}`; a pending
    /// execution may also fail or be cancelled before it starts.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a single step within an execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Skipped) | (Running, Completed) | (Running, Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Why an execution or step failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ResourceExhausted,
    AgentCallFailed,
    TimeoutExceeded,
    DefinitionNotFound,
    UnresolvedBranching,
    Cancelled,
    Internal,
}

/// Failure recorded on an execution or step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionError {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&Error> for ExecutionError {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::ResourceExhausted { .. } => FailureKind::ResourceExhausted,
            Error::AgentCallFailed { .. } => FailureKind::AgentCallFailed,
            Error::TimeoutExceeded { .. } => FailureKind::TimeoutExceeded,
            Error::DefinitionNotFound { .. } => FailureKind::DefinitionNotFound,
            Error::UnresolvedBranching { .. } => FailureKind::UnresolvedBranching,
            Error::Cancelled { .. } => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One dispatch attempt of a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepAttempt {
    pub attempt: u32,
    pub instance_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ExecutionError>,
    /// Delay scheduled before the next attempt, if any
    pub backoff_ms: Option<u64>,
}

/// Record of a (possibly retried) step run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStepExecution {
    pub step_id: String,
    pub status: StepStatus,
    pub instance_id: Option<Uuid>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<ExecutionError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub cost: f64,
    pub tokens_used: u64,
    pub attempts: Vec<StepAttempt>,
}

impl WorkflowStepExecution {
    pub fn new<S: Into<String>>(step_id: S, input: Value, now: DateTime<Utc>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            instance_id: None,
            input,
            output: None,
            error: None,
            started_at: now,
            completed_at: None,
            retry_count: 0,
            cost: 0.0,
            tokens_used: 0,
            attempts: Vec::new(),
        }
    }

    pub fn transition_to(&mut self, next: StepStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::state_transition(format!(
                "Step '{}' cannot move from {} to {}",
                self.step_id, self.status, next
            )));
        }
        self.status = next;
        match next {
            StepStatus::Running => self.started_at = now,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
                self.completed_at = Some(now)
            }
            StepStatus::Pending => {}
        }
        Ok(())
    }
}

/// A single run of a workflow against an input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub current_step: Option<String>,
    pub steps: Vec<WorkflowStepExecution>,
    pub input: Value,
    pub output: Map<String, Value>,
    pub error: Option<ExecutionError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cost: f64,
    pub tokens_used: u64,
}

impl WorkflowExecution {
    pub fn new(workflow_id: Uuid, input: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Pending,
            current_step: None,
            steps: Vec::new(),
            input,
            output: Map::new(),
            error: None,
            started_at: now,
            completed_at: None,
            cost: 0.0,
            tokens_used: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a new status, stamping `completed_at` on terminal states
    pub fn transition_to(&mut self, next: ExecutionStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::state_transition(format!(
                "Execution {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(now);
            self.current_step = None;
        }
        Ok(())
    }

    /// Context that step conditions are evaluated against
    pub fn condition_context(&self) -> Value {
        serde_json::json!({
            "input": self.input,
            "output": Value::Object(self.output.clone()),
        })
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut WorkflowStepExecution> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn running_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }
}
