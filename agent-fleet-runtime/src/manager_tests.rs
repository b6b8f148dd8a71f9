// Tests for the fleet manager, included from manager.rs

use super::*;
use crate::testing::{MemoryAuditSink, RecordingProvisioner, ScaleRequest, ScriptedInvoker};
use agent_fleet_core::clock::ManualClock;
use agent_fleet_core::execution::ExecutionStatus;
use agent_fleet_core::workflow::WorkflowStep;
use serde_json::json;
use std::time::Duration;

struct Fixture {
    manager: FleetManager,
    provisioner: Arc<RecordingProvisioner>,
    audit: Arc<MemoryAuditSink>,
}

fn fixture(config: FleetConfig, invoker: ScriptedInvoker) -> Fixture {
    let provisioner = Arc::new(RecordingProvisioner::default());
    let audit = Arc::new(MemoryAuditSink::default());
    let collaborators = FleetCollaborators::new(Arc::new(invoker))
        .with_provisioner(provisioner.clone())
        .with_audit_sink(audit.clone())
        .with_clock(Arc::new(ManualClock::default()));
    Fixture {
        manager: FleetManager::new(config, collaborators).unwrap(),
        provisioner,
        audit,
    }
}

fn spec(capability: CapabilityType, max: u32, cost: f64) -> InstanceSpec {
    InstanceSpec::builder()
        .capability(capability)
        .max_concurrent_requests(max)
        .cost_per_request(cost)
        .build()
        .unwrap()
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = FleetConfig::default();
    config.auto_scaling.min_instances_per_type = 20;
    let result = FleetManager::new(
        config,
        FleetCollaborators::new(Arc::new(ScriptedInvoker::new())),
    );
    assert!(matches!(result, Err(Error::Configuration { .. })));
}

#[tokio::test]
async fn test_instance_lifecycle_publishes_events() {
    let f = fixture(FleetConfig::default(), ScriptedInvoker::new());
    let mut events = f.manager.subscribe();

    let id = f
        .manager
        .register_agent_instance(spec(CapabilityType::Planning, 1, 0.0))
        .unwrap();
    assert!(f.manager.get_instance(id).is_some());
    f.manager.deregister_agent_instance(id).unwrap();
    assert!(f
        .manager
        .deregister_agent_instance(id)
        .unwrap_err()
        .is_not_found());

    assert_eq!(events.recv().await.unwrap().name(), "instance_registered");
    assert_eq!(events.recv().await.unwrap().name(), "instance_deregistered");

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(f.audit.events().len(), 2);
}

#[tokio::test]
async fn test_instance_updates_and_selection() {
    let f = fixture(FleetConfig::default(), ScriptedInvoker::new());
    let busy = f
        .manager
        .register_agent_instance(spec(CapabilityType::Research, 2, 0.0))
        .unwrap();
    let free = f
        .manager
        .register_agent_instance(spec(CapabilityType::Research, 2, 0.0))
        .unwrap();

    f.manager
        .update_instance_load(
            busy,
            LoadUpdate {
                current_requests: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
    let selected = f
        .manager
        .select_instance(CapabilityType::Research, None)
        .unwrap();
    assert_eq!(selected.id, free);

    f.manager
        .set_instance_status(free, InstanceStatus::Offline)
        .unwrap();
    let selected = f
        .manager
        .select_instance(CapabilityType::Research, Some(LoadBalancingStrategy::Sequential))
        .unwrap();
    assert_eq!(selected.id, busy);

    assert!(f
        .manager
        .update_instance_metrics(
            busy,
            MetricsUpdate {
                cost_per_request: Some(-1.0),
                ..Default::default()
            }
        )
        .is_err());
    f.manager
        .update_instance_health(
            busy,
            HealthUpdate {
                success_rate: Some(0.9),
                ..Default::default()
            },
        )
        .unwrap();
    f.manager.heartbeat(busy).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fleet_status_separates_rates_from_spend() {
    let f = fixture(FleetConfig::default(), ScriptedInvoker::new().with_tokens(7));
    f.manager
        .register_agent_instance(spec(CapabilityType::Planning, 2, 0.25))
        .unwrap();
    let loaded = f
        .manager
        .register_agent_instance(spec(CapabilityType::Analysis, 2, 0.75))
        .unwrap();
    f.manager
        .update_instance_load(
            loaded,
            LoadUpdate {
                current_requests: Some(2),
                ..Default::default()
            },
        )
        .unwrap();

    let workflow_id = f
        .manager
        .register_workflow(
            WorkflowDefinition::builder()
                .name("plan-twice")
                .step(WorkflowStep::new("a", CapabilityType::Planning, "plan"))
                .step(WorkflowStep::new("b", CapabilityType::Planning, "plan"))
                .build()
                .unwrap(),
        )
        .unwrap();
    let execution = f
        .manager
        .execute_workflow(workflow_id, json!({}))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let status = f.manager.get_fleet_status();
    assert_eq!(status.total_instances, 2);
    assert_eq!(status.by_capability[&CapabilityType::Planning], 1);
    assert_eq!(status.by_status[&InstanceStatus::Busy], 1);
    assert_eq!(status.by_status[&InstanceStatus::Idle], 1);
    assert!((status.utilization - 0.5).abs() < 1e-9);
    assert!((status.current_cost_rate - 1.0).abs() < 1e-9);
    assert!((status.cumulative_cost - 0.5).abs() < 1e-9);
    assert_eq!(status.cumulative_tokens, 14);
    assert_eq!(status.completed_executions, 1);
    assert_eq!(status.running_executions, 0);

    assert_eq!(f.manager.get_all_executions().len(), 1);
    assert_eq!(
        f.manager.get_workflow_execution(execution.id).unwrap().status,
        ExecutionStatus::Completed
    );
    assert_eq!(f.manager.list_workflows().len(), 1);
    assert_eq!(f.manager.get_workflow(workflow_id).unwrap().name, "plan-twice");
}

#[tokio::test(start_paused = true)]
async fn test_background_scaler_runs_after_start() {
    let mut config = FleetConfig::default();
    config.auto_scaling.cooldown_period_ms = 1_000;
    let f = fixture(config, ScriptedInvoker::new());
    let id = f
        .manager
        .register_agent_instance(spec(CapabilityType::Execution, 1, 0.0))
        .unwrap();
    f.manager
        .update_instance_load(
            id,
            LoadUpdate {
                current_requests: Some(1),
                ..Default::default()
            },
        )
        .unwrap();

    f.manager.start().unwrap();
    // Second start is a no-op
    f.manager.start().unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    f.manager.stop().await;

    assert_eq!(
        f.provisioner.requests(),
        vec![ScaleRequest::Up(CapabilityType::Execution)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stopped_manager_rejects_work() {
    let f = fixture(FleetConfig::default(), ScriptedInvoker::new().hang("wait"));
    f.manager
        .register_agent_instance(spec(CapabilityType::Communication, 1, 0.0))
        .unwrap();
    let workflow_id = f
        .manager
        .register_workflow(
            WorkflowDefinition::builder()
                .name("waiting")
                .step(WorkflowStep::new("wait", CapabilityType::Communication, "wait"))
                .build()
                .unwrap(),
        )
        .unwrap();

    f.manager.start().unwrap();
    let handle = f
        .manager
        .execute_workflow(workflow_id, Value::Null)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    f.manager.stop().await;
    assert_eq!(
        handle.wait().await.unwrap().status,
        ExecutionStatus::Cancelled
    );
    assert!(f.manager.start().is_err());
    assert!(f
        .manager
        .execute_workflow(workflow_id, Value::Null)
        .is_err());
    for instance in f.manager.list_instances() {
        assert_eq!(instance.load.current_requests, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_live_execution_runs_one_step_at_a_time() {
    let f = fixture(
        FleetConfig::default(),
        ScriptedInvoker::new().with_latency(Duration::from_millis(40)),
    );
    for capability in [CapabilityType::Planning, CapabilityType::Research] {
        f.manager
            .register_agent_instance(spec(capability, 4, 0.0))
            .unwrap();
    }
    let workflow_id = f
        .manager
        .register_workflow(
            WorkflowDefinition::builder()
                .name("three-steps")
                .step(WorkflowStep::new("plan", CapabilityType::Planning, "plan"))
                .step(WorkflowStep::new("search", CapabilityType::Research, "search"))
                .step(WorkflowStep::new("refine", CapabilityType::Planning, "refine"))
                .build()
                .unwrap(),
        )
        .unwrap();

    let handle = f.manager.execute_workflow(workflow_id, json!({})).unwrap();
    let mut observed_running = false;
    loop {
        let snapshot = f.manager.get_workflow_execution(handle.id()).unwrap();
        assert!(snapshot.running_steps() <= 1);
        if snapshot.running_steps() == 1 {
            observed_running = true;
        }
        if snapshot.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(observed_running);

    let execution = handle.wait().await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.running_steps(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pruned_executions_still_count_in_status() {
    let f = fixture(FleetConfig::default(), ScriptedInvoker::new().with_tokens(3));
    f.manager
        .register_agent_instance(spec(CapabilityType::Planning, 1, 0.25))
        .unwrap();
    let workflow_id = f
        .manager
        .register_workflow(
            WorkflowDefinition::builder()
                .name("plan")
                .step(WorkflowStep::new("plan", CapabilityType::Planning, "plan"))
                .build()
                .unwrap(),
        )
        .unwrap();
    for _ in 0..2 {
        f.manager
            .execute_workflow(workflow_id, json!({}))
            .unwrap()
            .wait()
            .await
            .unwrap();
    }

    let cutoff = chrono::Utc::now() + chrono::Duration::days(1);
    assert_eq!(f.manager.prune_executions(cutoff), 2);
    assert!(f.manager.get_all_executions().is_empty());

    let status = f.manager.get_fleet_status();
    assert_eq!(status.completed_executions, 2);
    assert!((status.cumulative_cost - 0.5).abs() < 1e-9);
    assert_eq!(status.cumulative_tokens, 6);
}
