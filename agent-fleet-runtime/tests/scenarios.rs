//! End-to-end scenarios driven through the public `FleetManager` API

use agent_fleet_core::clock::ManualClock;
use agent_fleet_core::config::{FleetConfig, LoadBalancingStrategy};
use agent_fleet_core::execution::{ExecutionStatus, FailureKind, StepStatus};
use agent_fleet_core::instance::{CapabilityType, HealthUpdate, InstanceSpec, InstanceStatus};
use agent_fleet_core::workflow::{WorkflowDefinition, WorkflowStep};
use agent_fleet_runtime::testing::{MemoryAuditSink, RecordingProvisioner, ScriptedInvoker};
use agent_fleet_runtime::{ExecutionOptions, FleetCollaborators, FleetManager};
use chrono::Duration as ChronoDuration;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn manager_with(
    config: FleetConfig,
    invoker: Arc<ScriptedInvoker>,
    clock: ManualClock,
) -> FleetManager {
    let collaborators = FleetCollaborators::new(invoker)
        .with_provisioner(Arc::new(RecordingProvisioner::default()))
        .with_audit_sink(Arc::new(MemoryAuditSink::default()))
        .with_clock(Arc::new(clock));
    FleetManager::new(config, collaborators).expect("valid configuration")
}

fn instance(capability: CapabilityType) -> InstanceSpec {
    InstanceSpec::builder()
        .capability(capability)
        .max_concurrent_requests(1)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn scenario_single_instance_runs_steps_sequentially() {
    let invoker = Arc::new(ScriptedInvoker::new().with_latency(Duration::from_millis(100)));
    let manager = manager_with(FleetConfig::default(), invoker.clone(), ManualClock::default());

    let planner = manager
        .register_agent_instance(instance(CapabilityType::Planning))
        .unwrap();
    let workflow_id = manager
        .register_workflow(
            WorkflowDefinition::builder()
                .name("two-step plan")
                .step(WorkflowStep::new("outline", CapabilityType::Planning, "outline"))
                .step(WorkflowStep::new("refine", CapabilityType::Planning, "refine"))
                .build()
                .unwrap(),
        )
        .unwrap();

    let execution = manager
        .execute_workflow(workflow_id, json!({"topic": "release"}))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps.len(), 2);
    assert!(execution
        .steps
        .iter()
        .all(|step| step.status == StepStatus::Completed && step.instance_id == Some(planner)));
    assert_eq!(invoker.calls().len(), 2);
    assert_eq!(invoker.max_concurrency(), 1);

    // The second step starts only after the first one finished
    let outline = execution.step("outline").unwrap();
    let refine = execution.step("refine").unwrap();
    assert!(outline.completed_at.unwrap() <= refine.started_at);

    let planner = manager.get_instance(planner).unwrap();
    assert_eq!(planner.load.current_requests, 0);
    assert_eq!(planner.status, InstanceStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn scenario_missing_capacity_exhausts_retries() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let manager = manager_with(FleetConfig::default(), invoker.clone(), ManualClock::default());

    let workflow_id = manager
        .register_workflow(
            WorkflowDefinition::builder()
                .name("execute")
                .step(
                    WorkflowStep::new("run", CapabilityType::Execution, "run").with_retry_count(2),
                )
                .build()
                .unwrap(),
        )
        .unwrap();

    let started = tokio::time::Instant::now();
    let execution = manager
        .execute_workflow(workflow_id, json!({}))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::ResourceExhausted);
    assert!(error.message.contains("no available agent"));

    let step = &execution.steps[0];
    assert_eq!(step.attempts.len(), 3);
    assert_eq!(step.retry_count, 2);
    let backoffs: Vec<u64> = step.attempts.iter().filter_map(|a| a.backoff_ms).collect();
    assert_eq!(backoffs, vec![2_000, 4_000]);
    assert!(backoffs.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(started.elapsed() >= Duration::from_millis(6_000));
    assert!(invoker.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scenario_fastest_response_always_wins() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let mut config = FleetConfig::default();
    config.load_balancing.strategy = LoadBalancingStrategy::FastestResponse;
    let manager = manager_with(config, invoker.clone(), ManualClock::default());

    let fast = manager
        .register_agent_instance(instance(CapabilityType::Research))
        .unwrap();
    let slow = manager
        .register_agent_instance(instance(CapabilityType::Research))
        .unwrap();
    for (id, response_time_ms) in [(fast, 50), (slow, 200)] {
        manager
            .update_instance_health(
                id,
                HealthUpdate {
                    response_time_ms: Some(response_time_ms),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    let workflow_id = manager
        .register_workflow(
            WorkflowDefinition::builder()
                .name("lookup")
                .step(WorkflowStep::new("lookup", CapabilityType::Research, "lookup"))
                .build()
                .unwrap(),
        )
        .unwrap();

    for _ in 0..10 {
        let execution = manager
            .execute_workflow_with(
                workflow_id,
                json!({}),
                ExecutionOptions::with_strategy(LoadBalancingStrategy::FastestResponse),
            )
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps[0].instance_id, Some(fast));
    }

    assert!(invoker.calls().iter().all(|call| call.instance_id == fast));
    for id in [fast, slow] {
        let instance = manager.get_instance(id).unwrap();
        assert_eq!(instance.status, InstanceStatus::Idle);
        assert_eq!(instance.load.current_requests, 0);
    }
    assert_eq!(manager.get_instance(slow).unwrap().metrics.requests_processed, 0);
}

#[tokio::test]
async fn scenario_stale_instance_recovered_then_evicted() {
    let clock = ManualClock::default();
    let mut config = FleetConfig::default();
    config.health_check.timeout_ms = 10_000;
    let manager = manager_with(config, Arc::new(ScriptedInvoker::new()), clock.clone());

    let id = manager
        .register_agent_instance(instance(CapabilityType::Analysis))
        .unwrap();
    clock.advance(ChronoDuration::seconds(60));

    let report = manager.run_health_check();
    assert_eq!(report.recovered, vec![id]);
    assert!(report.evicted.is_empty());
    let recovered = manager.get_instance(id).unwrap();
    assert_eq!(recovered.status, InstanceStatus::Idle);
    assert_eq!(recovered.health.error_count, 0);

    clock.advance(ChronoDuration::seconds(30));
    let report = manager.run_health_check();
    assert_eq!(report.evicted, vec![id]);
    assert!(manager.get_instance(id).is_none());
    assert_eq!(manager.get_fleet_status().total_instances, 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_releases_the_dispatched_slot() {
    let invoker = Arc::new(ScriptedInvoker::new().hang("long"));
    let manager = manager_with(FleetConfig::default(), invoker, ManualClock::default());
    let id = manager
        .register_agent_instance(instance(CapabilityType::Communication))
        .unwrap();
    let workflow_id = manager
        .register_workflow(
            WorkflowDefinition::builder()
                .name("long")
                .step(WorkflowStep::new("long", CapabilityType::Communication, "long"))
                .build()
                .unwrap(),
        )
        .unwrap();

    let handle = manager.execute_workflow(workflow_id, json!({})).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.get_instance(id).unwrap().status, InstanceStatus::Busy);

    assert!(manager.cancel_execution(handle.id()).unwrap());
    let execution = handle.wait().await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    let instance = manager.get_instance(id).unwrap();
    assert_eq!(instance.load.current_requests, 0);
    assert_eq!(instance.status, InstanceStatus::Idle);
    assert_eq!(manager.get_fleet_status().cancelled_executions, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_executions_never_overshoot_capacity() {
    let invoker = Arc::new(ScriptedInvoker::new().with_latency(Duration::from_millis(20)));
    let manager = manager_with(FleetConfig::default(), invoker.clone(), ManualClock::default());
    for _ in 0..2 {
        manager
            .register_agent_instance(
                InstanceSpec::builder()
                    .capability(CapabilityType::DataAccess)
                    .max_concurrent_requests(2)
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }
    let workflow_id = manager
        .register_workflow(
            WorkflowDefinition::builder()
                .name("fetch")
                .step(WorkflowStep::new("fetch", CapabilityType::DataAccess, "fetch"))
                .build()
                .unwrap(),
        )
        .unwrap();

    let handles: Vec<_> = (0..12)
        .map(|_| manager.execute_workflow(workflow_id, json!({})).unwrap())
        .collect();
    for handle in handles {
        let execution = handle.wait().await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    assert!(invoker.max_concurrency() <= 4);
    for instance in manager.list_instances() {
        assert_eq!(instance.load.current_requests, 0);
    }
}
