//! Fleet and workflow events
//!
//! Events are broadcast to subscribers and forwarded to the audit sink.

use crate::execution::ExecutionError;
use crate::instance::CapabilityType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something that happened in the fleet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    InstanceRegistered {
        instance_id: Uuid,
        capability: CapabilityType,
        at: DateTime<Utc>,
    },
    InstanceDeregistered {
        instance_id: Uuid,
        at: DateTime<Utc>,
    },
    InstanceRecovered {
        instance_id: Uuid,
        at: DateTime<Utc>,
    },
    InstanceEvicted {
        instance_id: Uuid,
        capability: CapabilityType,
        at: DateTime<Utc>,
    },
    ScaleUpRequested {
        capability: CapabilityType,
        average_load: f64,
        instance_count: usize,
        at: DateTime<Utc>,
    },
    ScaleDownRequested {
        capability: CapabilityType,
        candidate: Option<Uuid>,
        average_load: f64,
        instance_count: usize,
        at: DateTime<Utc>,
    },
    WorkflowRegistered {
        workflow_id: Uuid,
        name: String,
        at: DateTime<Utc>,
    },
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        at: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        instance_id: Uuid,
        at: DateTime<Utc>,
    },
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
        at: DateTime<Utc>,
    },
    StepAttemptFailed {
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
        error: ExecutionError,
        retry_in_ms: Option<u64>,
        at: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        at: DateTime<Utc>,
    },
    ExecutionFailed {
        execution_id: Uuid,
        error: ExecutionError,
        at: DateTime<Utc>,
    },
    ExecutionCancelled {
        execution_id: Uuid,
        at: DateTime<Utc>,
    },
}

impl FleetEvent {
    /// Stable event name for logs and audit records
    pub fn name(&self) -> &'static str {
        match self {
            FleetEvent::InstanceRegistered { .. } => "instance_registered",
            FleetEvent::InstanceDeregistered { .. } => "instance_deregistered",
            FleetEvent::InstanceRecovered { .. } => "instance_recovered",
            FleetEvent::InstanceEvicted { .. } => "instance_evicted",
            FleetEvent::ScaleUpRequested { .. } => "scale_up_requested",
            FleetEvent::ScaleDownRequested { .. } => "scale_down_requested",
            FleetEvent::WorkflowRegistered { .. } => "workflow_registered",
            FleetEvent::ExecutionStarted { .. } => "execution_started",
            FleetEvent::StepCompleted { .. } => "step_completed",
            FleetEvent::StepSkipped { .. } => "step_skipped",
            FleetEvent::StepAttemptFailed { .. } => "step_attempt_failed",
            FleetEvent::ExecutionCompleted { .. } => "execution_completed",
            FleetEvent::ExecutionFailed { .. } => "execution_failed",
            FleetEvent::ExecutionCancelled { .. } => "execution_cancelled",
        }
    }

    /// Execution this event belongs to, if any
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            FleetEvent::ExecutionStarted { execution_id, .. }
            | FleetEvent::StepCompleted { execution_id, .. }
            | FleetEvent::StepSkipped { execution_id, .. }
            | FleetEvent::StepAttemptFailed { execution_id, .. }
            | FleetEvent::ExecutionCompleted { execution_id, .. }
            | FleetEvent::ExecutionFailed { execution_id, .. }
            | FleetEvent::ExecutionCancelled { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FleetEvent::ExecutionCompleted { .. }
                | FleetEvent::ExecutionFailed { .. }
                | FleetEvent::ExecutionCancelled { .. }
        )
    }
}
