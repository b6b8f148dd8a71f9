//! Fleet-wide status snapshot

use crate::engine::WorkflowEngine;
use crate::registry::InstanceRegistry;
use agent_fleet_core::clock::SharedClock;
use agent_fleet_core::execution::ExecutionStatus;
use agent_fleet_core::instance::{CapabilityType, InstanceStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Point-in-time view of the fleet and its executions.
///
/// `current_cost_rate` is a gauge (sum of per-request prices of registered
/// instances); `cumulative_cost` and `cumulative_tokens` are counters over
/// all executions ever started, including pruned ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetStatus {
    pub total_instances: usize,
    pub by_capability: BTreeMap<CapabilityType, usize>,
    pub by_status: BTreeMap<InstanceStatus, usize>,
    /// Sum of current requests over sum of capacity, 0.0-1.0
    pub utilization: f64,
    pub current_cost_rate: f64,
    pub pending_executions: usize,
    pub running_executions: usize,
    pub completed_executions: usize,
    pub failed_executions: usize,
    pub cancelled_executions: usize,
    pub cumulative_cost: f64,
    pub cumulative_tokens: u64,
    pub generated_at: DateTime<Utc>,
}

/// Read-only aggregation over the registry and the execution table
pub struct MetricsAggregator {
    registry: Arc<InstanceRegistry>,
    engine: Arc<WorkflowEngine>,
    clock: SharedClock,
}

impl MetricsAggregator {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        engine: Arc<WorkflowEngine>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            engine,
            clock,
        }
    }

    pub fn fleet_status(&self) -> FleetStatus {
        let instances = self.registry.list();
        let mut by_capability = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        let mut current = 0u64;
        let mut capacity = 0u64;
        let mut current_cost_rate = 0.0;

        for instance in &instances {
            *by_capability.entry(instance.capability).or_insert(0) += 1;
            *by_status.entry(instance.status).or_insert(0) += 1;
            current += u64::from(instance.load.current_requests);
            capacity += u64::from(instance.load.max_concurrent_requests);
            current_cost_rate += instance.metrics.cost_per_request;
        }

        let retired = self.engine.retired_executions();
        let mut status = FleetStatus {
            total_instances: instances.len(),
            by_capability,
            by_status,
            utilization: if capacity == 0 {
                0.0
            } else {
                current as f64 / capacity as f64
            },
            current_cost_rate,
            pending_executions: 0,
            running_executions: 0,
            completed_executions: retired.completed,
            failed_executions: retired.failed,
            cancelled_executions: retired.cancelled,
            cumulative_cost: retired.cost,
            cumulative_tokens: retired.tokens_used,
            generated_at: self.clock.now(),
        };

        for execution in self.engine.list_executions() {
            match execution.status {
                ExecutionStatus::Pending => status.pending_executions += 1,
                ExecutionStatus::Running => status.running_executions += 1,
                ExecutionStatus::Completed => status.completed_executions += 1,
                ExecutionStatus::Failed => status.failed_executions += 1,
                ExecutionStatus::Cancelled => status.cancelled_executions += 1,
            }
            status.cumulative_cost += execution.cost;
            status.cumulative_tokens += execution.tokens_used;
        }
        status
    }
}
