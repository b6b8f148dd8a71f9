//! External collaborator interfaces consumed by the fleet manager
//!
//! The fleet never talks to agents, infrastructure or audit storage directly.
//! Callers inject implementations of these traits; the defaults here only log.

use agent_fleet_core::event::FleetEvent;
use agent_fleet_core::instance::CapabilityType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// One dispatch of a workflow step to an agent instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCall {
    pub execution_id: Uuid,
    pub step_id: String,
    /// 1-based attempt number within the step
    pub attempt: u32,
    /// Unique per attempt; lets agents deduplicate redelivered calls
    pub attempt_id: Uuid,
    pub instance_id: Uuid,
    pub capability: CapabilityType,
    pub action: String,
    pub parameters: Value,
    /// Execution input plus the outputs of the steps completed so far
    pub input: Value,
}

/// What an agent returned for a call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResponse {
    pub success: bool,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tokens_used: u64,
}

impl AgentResponse {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
            timestamp: Utc::now(),
            tokens_used: 0,
        }
    }

    pub fn failure(data: Value) -> Self {
        Self {
            success: false,
            data,
            timestamp: Utc::now(),
            tokens_used: 0,
        }
    }

    pub fn with_tokens(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }
}

/// Invokes an agent instance on behalf of a workflow step
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn call_agent(&self, call: AgentCall) -> anyhow::Result<AgentResponse>;
}

/// Adds or removes capacity in response to scaling decisions
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn scale_up(&self, capability: CapabilityType) -> anyhow::Result<()>;

    /// `candidate` is the instance the scaler would retire, if one is idle
    async fn scale_down(
        &self,
        capability: CapabilityType,
        candidate: Option<Uuid>,
    ) -> anyhow::Result<()>;
}

/// Durable record of fleet events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &FleetEvent) -> anyhow::Result<()>;
}

/// Provisioner that only logs the requested action
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProvisioner;

#[async_trait]
impl Provisioner for LoggingProvisioner {
    async fn scale_up(&self, capability: CapabilityType) -> anyhow::Result<()> {
        info!("Scale up requested for capability {}", capability);
        Ok(())
    }

    async fn scale_down(
        &self,
        capability: CapabilityType,
        candidate: Option<Uuid>,
    ) -> anyhow::Result<()> {
        match candidate {
            Some(id) => info!(
                "Scale down requested for capability {} (candidate: {})",
                capability, id
            ),
            None => info!(
                "Scale down requested for capability {} (no idle candidate)",
                capability
            ),
        }
        Ok(())
    }
}

/// Audit sink writing events to the tracing pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &FleetEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        info!(target: "agent_fleet::audit", event = event.name(), "{}", payload);
        Ok(())
    }
}
