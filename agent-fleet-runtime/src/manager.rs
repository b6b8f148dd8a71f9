//! Fleet manager service
//!
//! [`FleetManager`] wires the registry, load balancer, health monitor,
//! auto-scaler, workflow store and execution engine together and exposes
//! the public API of the fleet.
//!
//! All state lives in memory. Nothing is persisted: a restart loses every
//! registered instance and workflow as well as in-flight executions.
//! Finished executions are kept until [`FleetManager::prune_executions`]
//! removes them; long-running services should call it periodically.

use crate::autoscaler::{AutoScaler, ScalingDecision};
use crate::balancer::LoadBalancer;
use crate::collaborators::{
    AgentInvoker, AuditSink, LoggingProvisioner, Provisioner, TracingAuditSink,
};
use crate::engine::{EngineParts, ExecutionHandle, ExecutionOptions, WorkflowEngine};
use crate::events::EventBus;
use crate::health::{HealthMonitor, HealthSweepReport};
use crate::metrics::{FleetStatus, MetricsAggregator};
use crate::registry::InstanceRegistry;
use crate::store::WorkflowStore;
use agent_fleet_core::clock::{SharedClock, SystemClock};
use agent_fleet_core::config::{FleetConfig, LoadBalancingStrategy};
use agent_fleet_core::event::FleetEvent;
use agent_fleet_core::execution::WorkflowExecution;
use agent_fleet_core::instance::{
    AgentInstance, CapabilityType, HealthUpdate, InstanceSpec, InstanceStatus, LoadUpdate,
    MetricsUpdate,
};
use agent_fleet_core::workflow::WorkflowDefinition;
use chrono::{DateTime, Utc};
use agent_fleet_core::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// External collaborators injected into a [`FleetManager`]
#[derive(Clone)]
pub struct FleetCollaborators {
    pub invoker: Arc<dyn AgentInvoker>,
    pub provisioner: Arc<dyn Provisioner>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: SharedClock,
}

impl FleetCollaborators {
    /// Use `invoker` with a logging provisioner, tracing audit sink and the
    /// system clock
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self {
            invoker,
            provisioner: Arc::new(LoggingProvisioner),
            audit: Arc::new(TracingAuditSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

/// The agent fleet service
pub struct FleetManager {
    config: FleetConfig,
    registry: Arc<InstanceRegistry>,
    balancer: Arc<LoadBalancer>,
    store: Arc<WorkflowStore>,
    engine: Arc<WorkflowEngine>,
    health: Arc<HealthMonitor>,
    scaler: Arc<AutoScaler>,
    metrics: MetricsAggregator,
    events: EventBus,
    clock: SharedClock,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetManager")
            .field("instances", &self.registry.len())
            .field("workflows", &self.store.len())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl FleetManager {
    /// Build a manager from a validated configuration. Background loops
    /// are not running until [`FleetManager::start`] is called.
    pub fn new(config: FleetConfig, collaborators: FleetCollaborators) -> Result<Self> {
        config.validate()?;

        let clock = collaborators.clock;
        let events = EventBus::new(config.workflow.event_channel_capacity, collaborators.audit);
        let registry = Arc::new(InstanceRegistry::new(
            clock.clone(),
            config.health_check.max_error_count,
        ));
        let balancer = Arc::new(LoadBalancer::new(Arc::clone(&registry)));
        let store = Arc::new(WorkflowStore::new());
        let shutdown = CancellationToken::new();

        let engine = Arc::new(WorkflowEngine::new(
            EngineParts {
                store: Arc::clone(&store),
                registry: Arc::clone(&registry),
                balancer: Arc::clone(&balancer),
                invoker: collaborators.invoker,
                events: events.clone(),
                clock: clock.clone(),
                shutdown: shutdown.clone(),
            },
            config.workflow.clone(),
            config.load_balancing.strategy,
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            events.clone(),
            config.health_check.clone(),
            clock.clone(),
        ));
        let scaler = Arc::new(AutoScaler::new(
            Arc::clone(&registry),
            collaborators.provisioner,
            events.clone(),
            config.auto_scaling.clone(),
            clock.clone(),
        ));
        let metrics = MetricsAggregator::new(Arc::clone(&registry), Arc::clone(&engine), clock.clone());

        Ok(Self {
            config,
            registry,
            balancer,
            store,
            engine,
            health,
            scaler,
            metrics,
            events,
            clock,
            shutdown,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Spawn the health monitor and, when enabled, the auto-scaler.
    ///
    /// Calling it again while running is a no-op; a stopped manager cannot
    /// be restarted.
    pub fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::state_transition(
                "Fleet manager has been stopped and cannot be restarted",
            ));
        }
        let mut background = self.background.lock();
        if !background.is_empty() {
            warn!("Fleet manager already started");
            return Ok(());
        }

        background.push(tokio::spawn(
            Arc::clone(&self.health).run(self.shutdown.child_token()),
        ));
        if self.config.auto_scaling.enabled {
            background.push(tokio::spawn(
                Arc::clone(&self.scaler).run(self.shutdown.child_token()),
            ));
        } else {
            info!("Auto-scaling disabled");
        }

        info!(
            "Fleet manager started (strategy: {}, {} background tasks)",
            self.config.load_balancing.strategy,
            background.len()
        );
        Ok(())
    }

    /// Stop background loops and cancel in-flight executions, waiting for
    /// all of them to finish
    pub async fn stop(&self) {
        info!("Stopping fleet manager");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        self.engine.wait_idle().await;
        info!("Fleet manager stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    // Instances

    pub fn register_agent_instance(&self, spec: InstanceSpec) -> Result<Uuid> {
        let capability = spec.capability;
        let id = self.registry.register_instance(spec)?;
        self.events.publish(FleetEvent::InstanceRegistered {
            instance_id: id,
            capability,
            at: self.clock.now(),
        });
        Ok(id)
    }

    /// Remove an instance. In-flight requests on it finish normally.
    pub fn deregister_agent_instance(&self, id: Uuid) -> Result<()> {
        if !self.registry.deregister_instance(id) {
            return Err(Error::not_found("AgentInstance", id.to_string()));
        }
        self.events.publish(FleetEvent::InstanceDeregistered {
            instance_id: id,
            at: self.clock.now(),
        });
        Ok(())
    }

    pub fn get_instance(&self, id: Uuid) -> Option<AgentInstance> {
        self.registry.get(id)
    }

    pub fn list_instances(&self) -> Vec<AgentInstance> {
        self.registry.list()
    }

    pub fn update_instance_health(&self, id: Uuid, update: HealthUpdate) -> Result<AgentInstance> {
        self.registry.update_health(id, update)
    }

    pub fn update_instance_metrics(
        &self,
        id: Uuid,
        update: MetricsUpdate,
    ) -> Result<AgentInstance> {
        self.registry.update_metrics(id, update)
    }

    pub fn update_instance_load(&self, id: Uuid, update: LoadUpdate) -> Result<AgentInstance> {
        self.registry.update_load(id, update)
    }

    pub fn heartbeat(&self, id: Uuid) -> Result<()> {
        self.registry.heartbeat(id)
    }

    pub fn set_instance_status(&self, id: Uuid, status: InstanceStatus) -> Result<()> {
        self.registry.set_status(id, status)
    }

    /// Preview which instance a dispatch would go to, without reserving it
    pub fn select_instance(
        &self,
        capability: CapabilityType,
        strategy: Option<LoadBalancingStrategy>,
    ) -> Option<AgentInstance> {
        self.balancer.select_instance(
            capability,
            strategy.unwrap_or(self.config.load_balancing.strategy),
        )
    }

    // Workflows

    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<Uuid> {
        let name = definition.name.clone();
        let id = self.store.register(definition)?;
        self.events.publish(FleetEvent::WorkflowRegistered {
            workflow_id: id,
            name,
            at: self.clock.now(),
        });
        Ok(id)
    }

    pub fn get_workflow(&self, id: Uuid) -> Option<WorkflowDefinition> {
        self.store.get(id)
    }

    pub fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        self.store.list()
    }

    /// Start an execution; see [`ExecutionHandle`] for awaiting its result
    pub fn execute_workflow(&self, workflow_id: Uuid, input: Value) -> Result<ExecutionHandle> {
        self.engine.execute_workflow(workflow_id, input)
    }

    pub fn execute_workflow_with(
        &self,
        workflow_id: Uuid,
        input: Value,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle> {
        self.engine
            .execute_workflow_with(workflow_id, input, options)
    }

    pub fn cancel_execution(&self, execution_id: Uuid) -> Result<bool> {
        self.engine.cancel_execution(execution_id)
    }

    pub fn get_workflow_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.engine.get_execution(execution_id)
    }

    pub fn get_all_executions(&self) -> Vec<WorkflowExecution> {
        self.engine.list_executions()
    }

    /// Forget executions that finished before `finished_before`. Fleet
    /// status counters still include them.
    pub fn prune_executions(&self, finished_before: DateTime<Utc>) -> usize {
        self.engine.prune_executions(finished_before)
    }

    // Monitoring

    pub fn get_fleet_status(&self) -> FleetStatus {
        self.metrics.fleet_status()
    }

    /// Run one health sweep now
    pub fn run_health_check(&self) -> HealthSweepReport {
        self.health.run_health_check()
    }

    /// Run one scaling evaluation now
    pub async fn run_scaling_cycle(&self) -> Vec<ScalingDecision> {
        self.scaler.run_scaling_cycle().await
    }
}

#[cfg(test)]
mod tests {
    include!("manager_tests.rs");
}
