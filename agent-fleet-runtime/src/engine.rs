//! Workflow execution engine
//!
//! Each execution runs on its own tokio task and walks the workflow's steps
//! one at a time in resolved order. A step is dispatched to an instance
//! chosen by the load balancer, retried with exponential backoff on
//! retryable failures, and bounded by the step deadline. The whole run is
//! bounded by the workflow deadline and can be cancelled at any point; in
//! every case the held load slot is released when its guard is dropped.

use crate::balancer::LoadBalancer;
use crate::collaborators::{AgentCall, AgentInvoker};
use crate::events::EventBus;
use crate::registry::{InstanceRegistry, LoadSlot};
use crate::store::{ResolvedWorkflow, WorkflowStore};
use agent_fleet_core::clock::SharedClock;
use agent_fleet_core::config::{LoadBalancingStrategy, WorkflowEngineConfig};
use agent_fleet_core::event::FleetEvent;
use agent_fleet_core::execution::{
    ExecutionError, ExecutionStatus, StepAttempt, StepStatus, WorkflowExecution,
    WorkflowStepExecution,
};
use agent_fleet_core::workflow::{WorkflowDefinition, WorkflowStep};
use agent_fleet_core::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-execution overrides
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutionOptions {
    /// Balancing strategy for this execution's dispatches; the configured
    /// default when `None`
    pub strategy: Option<LoadBalancingStrategy>,
}

impl ExecutionOptions {
    pub fn with_strategy(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy: Some(strategy),
        }
    }
}

/// Handle to a started execution
#[derive(Debug)]
pub struct ExecutionHandle {
    id: Uuid,
    completion: oneshot::Receiver<WorkflowExecution>,
}

impl ExecutionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the execution to reach a terminal state
    pub async fn wait(self) -> Result<WorkflowExecution> {
        self.completion.await.map_err(|_| {
            Error::Internal(format!(
                "Execution {} ended without reporting completion",
                self.id
            ))
        })
    }
}

/// Totals carried over from executions removed by
/// [`WorkflowEngine::prune_executions`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetiredExecutions {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub cost: f64,
    pub tokens_used: u64,
}

impl RetiredExecutions {
    fn absorb(&mut self, execution: &WorkflowExecution) {
        match execution.status {
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Cancelled => self.cancelled += 1,
            ExecutionStatus::Pending | ExecutionStatus::Running => return,
        }
        self.cost += execution.cost;
        self.tokens_used += execution.tokens_used;
    }
}

/// Result of one successful dispatch
#[derive(Debug)]
struct AttemptOutcome {
    instance_id: Uuid,
    output: Value,
    tokens_used: u64,
    cost: f64,
}

/// Runs workflow executions against the fleet
pub struct WorkflowEngine {
    store: Arc<WorkflowStore>,
    balancer: Arc<LoadBalancer>,
    registry: Arc<InstanceRegistry>,
    invoker: Arc<dyn AgentInvoker>,
    events: EventBus,
    config: WorkflowEngineConfig,
    default_strategy: LoadBalancingStrategy,
    clock: SharedClock,
    /// Every execution ever started, until pruned
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
    retired: Mutex<RetiredExecutions>,
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
    runners: TaskTracker,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("executions", &self.executions.read().len())
            .field("default_strategy", &self.default_strategy)
            .finish_non_exhaustive()
    }
}

/// Collaborators and settings a [`WorkflowEngine`] is built from
pub struct EngineParts {
    pub store: Arc<WorkflowStore>,
    pub registry: Arc<InstanceRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub invoker: Arc<dyn AgentInvoker>,
    pub events: EventBus,
    pub clock: SharedClock,
    /// Cancelling this token cancels every in-flight execution
    pub shutdown: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(
        parts: EngineParts,
        config: WorkflowEngineConfig,
        default_strategy: LoadBalancingStrategy,
    ) -> Self {
        Self {
            store: parts.store,
            balancer: parts.balancer,
            registry: parts.registry,
            invoker: parts.invoker,
            events: parts.events,
            config,
            default_strategy,
            clock: parts.clock,
            executions: RwLock::new(HashMap::new()),
            retired: Mutex::new(RetiredExecutions::default()),
            cancellations: Mutex::new(HashMap::new()),
            shutdown: parts.shutdown,
            runners: TaskTracker::new(),
        }
    }

    /// Start an execution with the default options
    pub fn execute_workflow(
        self: &Arc<Self>,
        workflow_id: Uuid,
        input: Value,
    ) -> Result<ExecutionHandle> {
        self.execute_workflow_with(workflow_id, input, ExecutionOptions::default())
    }

    /// Start an execution and return immediately.
    ///
    /// Fails with `Error::DefinitionNotFound` for an unknown workflow. Must be
    /// called from within a tokio runtime.
    pub fn execute_workflow_with(
        self: &Arc<Self>,
        workflow_id: Uuid,
        input: Value,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle> {
        let workflow = self.store.resolve(workflow_id)?;
        if self.shutdown.is_cancelled() {
            return Err(Error::state_transition(
                "Workflow engine is shut down and accepts no new executions",
            ));
        }

        let execution = WorkflowExecution::new(workflow_id, input, self.clock.now());
        let execution_id = execution.id;
        let token = self.shutdown.child_token();
        self.executions.write().insert(execution_id, execution);
        self.cancellations.lock().insert(execution_id, token.clone());

        let strategy = options.strategy.unwrap_or(self.default_strategy);
        info!(
            "Starting execution {} of workflow '{}' (strategy: {})",
            execution_id, workflow.definition.name, strategy
        );

        let (sender, completion) = oneshot::channel();
        self.runners.spawn(Arc::clone(self).run_execution(
            execution_id,
            workflow,
            strategy,
            token,
            sender,
        ));

        Ok(ExecutionHandle {
            id: execution_id,
            completion,
        })
    }

    /// Request cancellation of a running execution.
    ///
    /// Returns `Ok(false)` when the execution already reached a terminal
    /// state. The execution settles as `cancelled` shortly after; use the
    /// handle or the event stream to observe it.
    pub fn cancel_execution(&self, execution_id: Uuid) -> Result<bool> {
        let status = self
            .executions
            .read()
            .get(&execution_id)
            .map(|execution| execution.status)
            .ok_or_else(|| Error::not_found("WorkflowExecution", execution_id.to_string()))?;
        if status.is_terminal() {
            return Ok(false);
        }

        match self.cancellations.lock().get(&execution_id) {
            Some(token) => {
                info!("Cancelling execution {}", execution_id);
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.executions.read().get(&execution_id).cloned()
    }

    /// Snapshot of every execution, oldest first
    pub fn list_executions(&self) -> Vec<WorkflowExecution> {
        let mut executions: Vec<WorkflowExecution> =
            self.executions.read().values().cloned().collect();
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        executions
    }

    /// Drop terminal executions that finished before `finished_before`.
    ///
    /// Their outcome counts, cost and tokens are kept in
    /// [`WorkflowEngine::retired_executions`]. Returns how many were removed.
    pub fn prune_executions(&self, finished_before: DateTime<Utc>) -> usize {
        let mut executions = self.executions.write();
        let mut retired = self.retired.lock();
        let before = executions.len();
        executions.retain(|_, execution| {
            let expired = execution.is_terminal()
                && execution
                    .completed_at
                    .is_some_and(|at| at < finished_before);
            if expired {
                retired.absorb(execution);
            }
            !expired
        });
        let removed = before - executions.len();
        if removed > 0 {
            debug!("Pruned {} finished executions", removed);
        }
        removed
    }

    pub fn retired_executions(&self) -> RetiredExecutions {
        *self.retired.lock()
    }

    /// Wait for every spawned runner to finish
    pub async fn wait_idle(&self) {
        self.runners.close();
        self.runners.wait().await;
        self.runners.reopen();
    }

    async fn run_execution(
        self: Arc<Self>,
        execution_id: Uuid,
        workflow: Arc<ResolvedWorkflow>,
        strategy: LoadBalancingStrategy,
        token: CancellationToken,
        completion: oneshot::Sender<WorkflowExecution>,
    ) {
        let definition = &workflow.definition;
        if let Err(e) = self.update_execution(execution_id, |execution, now| {
            execution.transition_to(ExecutionStatus::Running, now)
        }) {
            error!("Execution {} could not start: {}", execution_id, e);
        } else {
            self.events.publish(FleetEvent::ExecutionStarted {
                execution_id,
                workflow_id: definition.id,
                at: self.clock.now(),
            });
        }

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled { execution_id }),
            result = tokio::time::timeout(
                definition.timeout(),
                self.run_steps(execution_id, &workflow, strategy),
            ) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::timeout(
                    format!("workflow '{}'", definition.name),
                    definition.timeout_ms,
                )),
            },
        };

        let snapshot = self.finish(execution_id, outcome);
        self.cancellations.lock().remove(&execution_id);
        if let Some(snapshot) = snapshot {
            // The handle may have been dropped
            let _ = completion.send(snapshot);
        }
    }

    async fn run_steps(
        &self,
        execution_id: Uuid,
        workflow: &ResolvedWorkflow,
        strategy: LoadBalancingStrategy,
    ) -> Result<()> {
        for step in workflow.ordered_steps() {
            let context = self.read_execution(execution_id, WorkflowExecution::condition_context)?;
            if !step.conditions_met(&context) {
                self.skip_step(execution_id, step, context)?;
                continue;
            }
            self.execute_step(execution_id, &workflow.definition, step, context, strategy)
                .await?;
        }
        Ok(())
    }

    fn skip_step(&self, execution_id: Uuid, step: &WorkflowStep, input: Value) -> Result<()> {
        self.update_execution(execution_id, |execution, now| {
            let mut record = WorkflowStepExecution::new(&step.id, input, now);
            record.transition_to(StepStatus::Skipped, now)?;
            execution.steps.push(record);
            Ok(())
        })?;
        info!(
            "Skipped step '{}' of execution {}: conditions not met",
            step.id, execution_id
        );
        self.events.publish(FleetEvent::StepSkipped {
            execution_id,
            step_id: step.id.clone(),
            at: self.clock.now(),
        });
        Ok(())
    }

    /// Run one step to completion or exhaustion of its retry budget
    async fn execute_step(
        &self,
        execution_id: Uuid,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        input: Value,
        strategy: LoadBalancingStrategy,
    ) -> Result<()> {
        let limit = step.retry_limit(&definition.retry_policy);
        self.update_execution(execution_id, |execution, now| {
            let mut record = WorkflowStepExecution::new(&step.id, input.clone(), now);
            record.transition_to(StepStatus::Running, now)?;
            execution.steps.push(record);
            execution.current_step = Some(step.id.clone());
            Ok(())
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .attempt_step(execution_id, step, attempt, &input, strategy)
                .await
            {
                Ok(outcome) => return self.complete_step(execution_id, step, outcome),
                Err(err) => {
                    let retries_so_far = attempt - 1;
                    let backoff = if err.is_retryable() && retries_so_far < limit {
                        Some(
                            definition
                                .retry_policy
                                .backoff(self.config.base_backoff_ms, retries_so_far + 1),
                        )
                    } else {
                        None
                    };
                    self.record_attempt_failure(execution_id, step, attempt, &err, backoff)?;

                    match backoff {
                        Some(delay) => {
                            warn!(
                                "Step '{}' of execution {} failed on attempt {}, retrying in {:?}: {}",
                                step.id, execution_id, attempt, delay, err
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(
                                "Step '{}' of execution {} failed after {} attempt(s): {}",
                                step.id, execution_id, attempt, err
                            );
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// One dispatch: acquire a slot, call the agent under the step deadline,
    /// book the result on the instance. The slot is released on return.
    async fn attempt_step(
        &self,
        execution_id: Uuid,
        step: &WorkflowStep,
        attempt: u32,
        input: &Value,
        strategy: LoadBalancingStrategy,
    ) -> Result<AttemptOutcome> {
        let slot = self.balancer.acquire(step.capability, strategy);
        let instance_id = slot.as_ref().map(LoadSlot::instance_id);
        self.update_execution(execution_id, |execution, now| {
            let record = step_record(execution, &step.id)?;
            if instance_id.is_some() {
                record.instance_id = instance_id;
            }
            record.attempts.push(StepAttempt {
                attempt,
                instance_id,
                started_at: now,
                completed_at: None,
                error: None,
                backoff_ms: None,
            });
            Ok(())
        })?;

        let Some(slot) = slot else {
            return Err(Error::resource_exhausted(
                "agent_instance",
                format!("no available agent for capability '{}'", step.capability),
            ));
        };
        let instance_id = slot.instance_id();
        let timeout_ms = step
            .timeout_ms
            .unwrap_or(self.config.default_step_timeout_ms);

        let call = AgentCall {
            execution_id,
            step_id: step.id.clone(),
            attempt,
            attempt_id: Uuid::new_v4(),
            instance_id,
            capability: step.capability,
            action: step.action.clone(),
            parameters: step.parameters.clone(),
            input: input.clone(),
        };
        debug!(
            execution_id = %execution_id,
            step_id = %step.id,
            instance_id = %instance_id,
            attempt,
            "Dispatching step"
        );

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.invoker.call_agent(call),
        )
        .await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Err(_) => {
                self.registry.record_failure(instance_id);
                Err(Error::timeout(format!("step '{}'", step.id), timeout_ms))
            }
            Ok(Err(e)) => {
                self.registry.record_failure(instance_id);
                Err(Error::agent_call_failed(instance_id, format!("{:#}", e)))
            }
            Ok(Ok(response)) if !response.success => {
                self.registry.record_failure(instance_id);
                Err(Error::agent_call_failed(
                    instance_id,
                    format!("agent reported failure: {}", response.data),
                ))
            }
            Ok(Ok(response)) => {
                self.registry
                    .record_success(instance_id, elapsed_ms, response.tokens_used);
                Ok(AttemptOutcome {
                    instance_id,
                    output: response.data,
                    tokens_used: response.tokens_used,
                    cost: slot.cost_per_request(),
                })
            }
        }
    }

    fn complete_step(
        &self,
        execution_id: Uuid,
        step: &WorkflowStep,
        outcome: AttemptOutcome,
    ) -> Result<()> {
        self.update_execution(execution_id, |execution, now| {
            let record = step_record(execution, &step.id)?;
            if let Some(last) = record.attempts.last_mut() {
                last.completed_at = Some(now);
            }
            record.output = Some(outcome.output.clone());
            record.instance_id = Some(outcome.instance_id);
            record.cost += outcome.cost;
            record.tokens_used += outcome.tokens_used;
            record.transition_to(StepStatus::Completed, now)?;

            execution.output.insert(step.id.clone(), outcome.output);
            execution.cost += outcome.cost;
            execution.tokens_used += outcome.tokens_used;
            Ok(())
        })?;

        debug!(
            "Step '{}' of execution {} completed on instance {}",
            step.id, execution_id, outcome.instance_id
        );
        self.events.publish(FleetEvent::StepCompleted {
            execution_id,
            step_id: step.id.clone(),
            instance_id: outcome.instance_id,
            at: self.clock.now(),
        });
        Ok(())
    }

    /// Book a failed attempt. Without a backoff the step fails for good.
    fn record_attempt_failure(
        &self,
        execution_id: Uuid,
        step: &WorkflowStep,
        attempt: u32,
        err: &Error,
        backoff: Option<Duration>,
    ) -> Result<()> {
        let failure = ExecutionError::from(err);
        let backoff_ms = backoff.map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));

        self.update_execution(execution_id, |execution, now| {
            let record = step_record(execution, &step.id)?;
            if let Some(last) = record.attempts.last_mut() {
                last.completed_at = Some(now);
                last.error = Some(failure.clone());
                last.backoff_ms = backoff_ms;
            }
            record.error = Some(failure.clone());
            if backoff.is_some() {
                record.retry_count += 1;
            } else {
                record.transition_to(StepStatus::Failed, now)?;
            }
            Ok(())
        })?;

        self.events.publish(FleetEvent::StepAttemptFailed {
            execution_id,
            step_id: step.id.clone(),
            attempt,
            error: failure,
            retry_in_ms: backoff_ms,
            at: self.clock.now(),
        });
        Ok(())
    }

    /// Settle the execution in its terminal state and announce it
    fn finish(&self, execution_id: Uuid, outcome: Result<()>) -> Option<WorkflowExecution> {
        let now = self.clock.now();
        let failure = outcome.as_ref().err().map(ExecutionError::from);
        let next = match &outcome {
            Ok(()) => ExecutionStatus::Completed,
            Err(Error::Cancelled { .. }) => ExecutionStatus::Cancelled,
            Err(_) => ExecutionStatus::Failed,
        };

        let snapshot = {
            let mut executions = self.executions.write();
            let execution = executions.get_mut(&execution_id)?;

            if let Some(failure) = &failure {
                // Steps interrupted by cancellation or the workflow deadline
                for record in execution
                    .steps
                    .iter_mut()
                    .filter(|record| record.status == StepStatus::Running)
                {
                    if let Some(last) = record.attempts.last_mut() {
                        if last.completed_at.is_none() {
                            last.completed_at = Some(now);
                            last.error = Some(failure.clone());
                        }
                    }
                    record.error = Some(failure.clone());
                    if let Err(e) = record.transition_to(StepStatus::Failed, now) {
                        warn!("{}", e);
                    }
                }
                execution.error = Some(failure.clone());
            }

            if let Err(e) = execution.transition_to(next, now) {
                warn!("{}", e);
            }
            execution.clone()
        };

        let event = match (&snapshot.status, &failure) {
            (ExecutionStatus::Completed, _) => {
                info!(
                    "Execution {} completed ({} steps, cost {:.4}, {} tokens)",
                    execution_id,
                    snapshot.steps.len(),
                    snapshot.cost,
                    snapshot.tokens_used
                );
                FleetEvent::ExecutionCompleted {
                    execution_id,
                    at: now,
                }
            }
            (ExecutionStatus::Cancelled, _) => {
                info!("Execution {} cancelled", execution_id);
                FleetEvent::ExecutionCancelled {
                    execution_id,
                    at: now,
                }
            }
            (_, Some(failure)) => {
                error!("Execution {} failed: {}", execution_id, failure);
                FleetEvent::ExecutionFailed {
                    execution_id,
                    error: failure.clone(),
                    at: now,
                }
            }
            (status, None) => {
                warn!(
                    "Execution {} finished in unexpected state {}",
                    execution_id, status
                );
                return Some(snapshot);
            }
        };
        self.events.publish(event);
        Some(snapshot)
    }

    fn read_execution<R, F>(&self, execution_id: Uuid, f: F) -> Result<R>
    where
        F: FnOnce(&WorkflowExecution) -> R,
    {
        self.executions
            .read()
            .get(&execution_id)
            .map(f)
            .ok_or_else(|| Error::not_found("WorkflowExecution", execution_id.to_string()))
    }

    fn update_execution<R, F>(&self, execution_id: Uuid, f: F) -> Result<R>
    where
        F: FnOnce(&mut WorkflowExecution, DateTime<Utc>) -> Result<R>,
    {
        let now = self.clock.now();
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or_else(|| Error::not_found("WorkflowExecution", execution_id.to_string()))?;
        f(execution, now)
    }
}

fn step_record<'a>(
    execution: &'a mut WorkflowExecution,
    step_id: &str,
) -> Result<&'a mut WorkflowStepExecution> {
    let execution_id = execution.id;
    execution
        .step_mut(step_id)
        .ok_or_else(|| Error::Internal(format!("Step '{}' missing from execution {}", step_id, execution_id)))
}
