//! Fleet manager runtime
//!
//! The async service layer on top of `agent-fleet-core`: an in-memory
//! instance registry with strategy-driven load balancing, a heartbeat
//! health monitor, a load-driven auto-scaler and a workflow execution engine
//! with retries, deadlines and cancellation. [`FleetManager`] ties them
//! together behind one API.
//!
//! ```rust,no_run
//! use agent_fleet_core::config::FleetConfig;
//! use agent_fleet_core::instance::{CapabilityType, InstanceSpec};
//! use agent_fleet_core::workflow::{WorkflowDefinition, WorkflowStep};
//! use agent_fleet_runtime::testing::ScriptedInvoker;
//! use agent_fleet_runtime::{FleetCollaborators, FleetManager};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let collaborators = FleetCollaborators::new(Arc::new(ScriptedInvoker::new()));
//! let manager = FleetManager::new(FleetConfig::default(), collaborators)?;
//! manager.start()?;
//!
//! manager.register_agent_instance(InstanceSpec::new(CapabilityType::Planning))?;
//! let workflow_id = manager.register_workflow(
//!     WorkflowDefinition::builder()
//!         .name("plan")
//!         .step(WorkflowStep::new("plan", CapabilityType::Planning, "draft_plan"))
//!         .build()?,
//! )?;
//!
//! let execution = manager
//!     .execute_workflow(workflow_id, serde_json::json!({"goal": "ship"}))?
//!     .wait()
//!     .await?;
//! println!("{}", execution.status);
//!
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod autoscaler;
pub mod balancer;
pub mod collaborators;
pub mod engine;
pub mod events;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod testing;

pub use autoscaler::{ScaleAction, ScalingDecision};
pub use collaborators::{
    AgentCall, AgentInvoker, AgentResponse, AuditSink, LoggingProvisioner, Provisioner,
    TracingAuditSink,
};
pub use engine::{ExecutionHandle, ExecutionOptions, RetiredExecutions};
pub use health::HealthSweepReport;
pub use manager::{FleetCollaborators, FleetManager};
pub use metrics::FleetStatus;
pub use registry::LoadSlot;
