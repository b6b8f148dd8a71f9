//! Load-driven auto-scaling
//!
//! Every cooldown period the scaler averages utilization per capability type
//! and asks the [`Provisioner`] for at most one action per type. Counts are
//! kept within `[min_instances_per_type, max_instances_per_type]`.

use crate::collaborators::Provisioner;
use crate::events::EventBus;
use crate::registry::InstanceRegistry;
use agent_fleet_core::clock::SharedClock;
use agent_fleet_core::config::AutoScalingConfig;
use agent_fleet_core::event::FleetEvent;
use agent_fleet_core::instance::{AgentInstance, CapabilityType, InstanceStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Direction of a scaling decision
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum ScaleAction {
    Up,
    Down { candidate: Option<Uuid> },
}

/// One action requested from the provisioner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingDecision {
    pub capability: CapabilityType,
    pub action: ScaleAction,
    pub instance_count: usize,
    pub average_load: f64,
    pub average_response_time_ms: f64,
}

/// Aggregates for one capability type
#[derive(Debug, Clone, PartialEq)]
struct TypeLoad {
    count: usize,
    average_load: f64,
    average_response_time_ms: f64,
    candidate: Option<Uuid>,
}

impl TypeLoad {
    fn from_instances(instances: &[&AgentInstance]) -> Self {
        let count = instances.len();
        let (load_sum, response_sum) = instances.iter().fold((0.0, 0.0), |(load, rt), i| {
            (
                load + i.load.utilization(),
                rt + i.health.response_time_ms as f64,
            )
        });
        // Idle instance with the lowest load; instances arrive oldest first
        let candidate = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Idle)
            .min_by_key(|i| i.load.current_requests)
            .map(|i| i.id);

        let divisor = count.max(1) as f64;
        Self {
            count,
            average_load: load_sum / divisor,
            average_response_time_ms: response_sum / divisor,
            candidate,
        }
    }
}

/// Periodic scaling policy evaluation
pub struct AutoScaler {
    registry: Arc<InstanceRegistry>,
    provisioner: Arc<dyn Provisioner>,
    events: EventBus,
    config: AutoScalingConfig,
    clock: SharedClock,
}

impl AutoScaler {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        provisioner: Arc<dyn Provisioner>,
        events: EventBus,
        config: AutoScalingConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            provisioner,
            events,
            config,
            clock,
        }
    }

    /// Evaluate every capability type once and apply the resulting actions.
    ///
    /// Provisioner errors are logged and do not abort the cycle.
    pub async fn run_scaling_cycle(&self) -> Vec<ScalingDecision> {
        let decisions = self.evaluate();

        for decision in &decisions {
            let result = match decision.action {
                ScaleAction::Up => {
                    info!(
                        "Scaling up {} (instances: {}, average load: {:.2})",
                        decision.capability, decision.instance_count, decision.average_load
                    );
                    self.provisioner.scale_up(decision.capability).await
                }
                ScaleAction::Down { candidate } => {
                    info!(
                        "Scaling down {} (instances: {}, average load: {:.2})",
                        decision.capability, decision.instance_count, decision.average_load
                    );
                    self.provisioner
                        .scale_down(decision.capability, candidate)
                        .await
                }
            };
            if let Err(e) = result {
                warn!(
                    "Provisioner failed to scale {}: {:#}",
                    decision.capability, e
                );
            }

            let at = self.clock.now();
            self.events.publish(match decision.action {
                ScaleAction::Up => FleetEvent::ScaleUpRequested {
                    capability: decision.capability,
                    average_load: decision.average_load,
                    instance_count: decision.instance_count,
                    at,
                },
                ScaleAction::Down { candidate } => FleetEvent::ScaleDownRequested {
                    capability: decision.capability,
                    candidate,
                    average_load: decision.average_load,
                    instance_count: decision.instance_count,
                    at,
                },
            });
        }

        decisions
    }

    /// Decide without acting
    fn evaluate(&self) -> Vec<ScalingDecision> {
        let instances = self.registry.list();
        let mut by_type: BTreeMap<CapabilityType, Vec<&AgentInstance>> = BTreeMap::new();
        for instance in instances
            .iter()
            .filter(|i| i.status != InstanceStatus::Offline)
        {
            by_type.entry(instance.capability).or_default().push(instance);
        }

        let mut decisions = Vec::new();
        for (capability, group) in by_type {
            let load = TypeLoad::from_instances(&group);
            debug!(
                "Capability {}: {} instances, average load {:.2}, average response {:.0}ms",
                capability, load.count, load.average_load, load.average_response_time_ms
            );

            let action = if load.average_load > self.config.scale_up_threshold
                && load.count < self.config.max_instances_per_type
            {
                Some(ScaleAction::Up)
            } else if load.average_load < self.config.scale_down_threshold
                && load.count > self.config.min_instances_per_type
            {
                Some(ScaleAction::Down {
                    candidate: load.candidate,
                })
            } else {
                None
            };

            if let Some(action) = action {
                decisions.push(ScalingDecision {
                    capability,
                    action,
                    instance_count: load.count,
                    average_load: load.average_load,
                    average_response_time_ms: load.average_response_time_ms,
                });
            }
        }
        decisions
    }

    /// Evaluate every `cooldown_period_ms` until the token is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cooldown_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(
            "Auto-scaler started (cooldown: {:?}, bounds: {}..={})",
            self.config.cooldown_period(),
            self.config.min_instances_per_type,
            self.config.max_instances_per_type
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_scaling_cycle().await;
                }
            }
        }
        info!("Auto-scaler stopped");
    }
}
