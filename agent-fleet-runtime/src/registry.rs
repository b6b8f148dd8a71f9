//! In-memory instance registry
//!
//! Holds every registered [`AgentInstance`] behind a single
//! `parking_lot::RwLock`. The lock is only taken for synchronous work and is
//! never held across an `.await`. Dispatch capacity is handed out as
//! [`LoadSlot`] guards that give the slot back when dropped.

use agent_fleet_core::clock::SharedClock;
use agent_fleet_core::instance::{
    AgentInstance, CapabilityType, HealthUpdate, InstanceSpec, InstanceStatus, LoadUpdate,
    MetricsUpdate,
};
use agent_fleet_core::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry of agent instances keyed by id
pub struct InstanceRegistry {
    instances: RwLock<HashMap<Uuid, AgentInstance>>,
    clock: SharedClock,
    max_error_count: u32,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.instances.read().len())
            .field("max_error_count", &self.max_error_count)
            .finish_non_exhaustive()
    }
}

impl InstanceRegistry {
    /// Create an empty registry.
    ///
    /// `max_error_count` is the number of consecutive failed requests after
    /// which an instance is moved to `error`.
    pub fn new(clock: SharedClock, max_error_count: u32) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            clock,
            max_error_count,
        }
    }

    /// Register a new instance and return its id
    pub fn register_instance(&self, spec: InstanceSpec) -> Result<Uuid> {
        spec.validate()?;
        let instance = AgentInstance::from_spec(spec, self.clock.now());
        let id = instance.id;
        info!(
            "Registered agent instance {} (capability: {}, max concurrent: {}, location: {})",
            id, instance.capability, instance.load.max_concurrent_requests, instance.location
        );
        self.instances.write().insert(id, instance);
        Ok(id)
    }

    /// Remove an instance regardless of its state. Returns whether it existed.
    pub fn deregister_instance(&self, id: Uuid) -> bool {
        let removed = self.instances.write().remove(&id);
        match &removed {
            Some(instance) => info!(
                "Deregistered agent instance {} (capability: {}, in-flight: {})",
                id, instance.capability, instance.load.current_requests
            ),
            None => debug!("Deregister requested for unknown instance {}", id),
        }
        removed.is_some()
    }

    /// Remove an instance that failed its health re-check
    pub(crate) fn evict(&self, id: Uuid) -> Option<AgentInstance> {
        let removed = self.instances.write().remove(&id);
        if let Some(instance) = &removed {
            warn!(
                "Evicted agent instance {} (capability: {}, status: {})",
                id, instance.capability, instance.status
            );
        }
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<AgentInstance> {
        self.instances.read().get(&id).cloned()
    }

    /// Snapshot of all instances, oldest first
    pub fn list(&self) -> Vec<AgentInstance> {
        let mut instances: Vec<AgentInstance> = self.instances.read().values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        instances
    }

    pub fn list_by_capability(&self, capability: CapabilityType) -> Vec<AgentInstance> {
        self.list()
            .into_iter()
            .filter(|instance| instance.capability == capability)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Merge a health report; refreshes the heartbeat
    pub fn update_health(&self, id: Uuid, update: HealthUpdate) -> Result<AgentInstance> {
        let now = self.clock.now();
        self.with_instance_mut(id, |instance| {
            instance.apply_health(update, now)?;
            Ok(instance.clone())
        })
    }

    pub fn update_metrics(&self, id: Uuid, update: MetricsUpdate) -> Result<AgentInstance> {
        self.with_instance_mut(id, |instance| {
            instance.apply_metrics(update)?;
            Ok(instance.clone())
        })
    }

    /// Merge a load report. Rejects `current > max` and `max == 0`.
    pub fn update_load(&self, id: Uuid, update: LoadUpdate) -> Result<AgentInstance> {
        self.with_instance_mut(id, |instance| {
            instance.apply_load(update)?;
            Ok(instance.clone())
        })
    }

    /// Refresh the heartbeat without touching anything else
    pub fn heartbeat(&self, id: Uuid) -> Result<()> {
        let now = self.clock.now();
        self.with_instance_mut(id, |instance| {
            instance.health.last_heartbeat = now;
            Ok(())
        })
    }

    pub fn set_status(&self, id: Uuid, status: InstanceStatus) -> Result<()> {
        self.with_instance_mut(id, |instance| {
            let previous = instance.status;
            instance.transition_to(status)?;
            if previous != status {
                info!("Agent instance {} status: {} -> {}", id, previous, status);
            }
            Ok(())
        })
    }

    /// Book a successful call. Returns `false` if the instance is gone.
    pub fn record_success(&self, id: Uuid, response_time_ms: u64, tokens: u64) -> bool {
        let now = self.clock.now();
        self.with_instance_mut(id, |instance| {
            instance.record_success(response_time_ms, tokens, now);
            Ok(())
        })
        .is_ok()
    }

    /// Book a failed call. Returns `true` if the instance was moved to `error`.
    pub fn record_failure(&self, id: Uuid) -> bool {
        let max_error_count = self.max_error_count;
        let errored = self
            .with_instance_mut(id, |instance| Ok(instance.record_failure(max_error_count)))
            .unwrap_or(false);
        if errored {
            warn!(
                "Agent instance {} reached {} consecutive errors, marked as error",
                id, max_error_count
            );
        }
        errored
    }

    /// Reset a stale instance back to a dispatchable state
    pub(crate) fn recover(&self, id: Uuid) -> Result<()> {
        let now = self.clock.now();
        self.with_instance_mut(id, |instance| instance.recover(now))
    }

    /// Choose among the eligible instances of a type without reserving one
    pub(crate) fn select_with<F>(&self, capability: CapabilityType, choose: F) -> Option<AgentInstance>
    where
        F: FnOnce(&[&AgentInstance]) -> Option<usize>,
    {
        let instances = self.instances.read();
        let candidates = eligible(&instances, capability);
        let index = choose(&candidates)?;
        candidates.get(index).map(|instance| (*instance).clone())
    }

    /// Choose an eligible instance and take one of its slots under a single
    /// write lock, so concurrent dispatches cannot overshoot capacity.
    pub(crate) fn acquire_with<F>(
        self: &Arc<Self>,
        capability: CapabilityType,
        choose: F,
    ) -> Option<LoadSlot>
    where
        F: FnOnce(&[&AgentInstance]) -> Option<usize>,
    {
        let now = self.clock.now();
        let mut instances = self.instances.write();
        let id = {
            let candidates = eligible(&instances, capability);
            let index = choose(&candidates)?;
            candidates.get(index)?.id
        };

        let instance = instances.get_mut(&id)?;
        if let Err(e) = instance.acquire_slot(now) {
            warn!("Failed to acquire slot on instance {}: {}", id, e);
            return None;
        }
        debug!(
            instance_id = %id,
            load = instance.load.current_requests,
            max = instance.load.max_concurrent_requests,
            "Acquired load slot"
        );
        Some(LoadSlot {
            registry: Arc::clone(self),
            instance_id: id,
            cost_per_request: instance.metrics.cost_per_request,
        })
    }

    fn release_slot(&self, id: Uuid) {
        let mut instances = self.instances.write();
        match instances.get_mut(&id) {
            Some(instance) => {
                if instance.release_slot() {
                    debug!(
                        instance_id = %id,
                        load = instance.load.current_requests,
                        "Released load slot"
                    );
                } else {
                    warn!(instance_id = %id, "Attempted to release a slot below zero");
                }
            }
            None => debug!(instance_id = %id, "Released slot for an instance no longer registered"),
        }
    }

    fn with_instance_mut<R, F>(&self, id: Uuid, f: F) -> Result<R>
    where
        F: FnOnce(&mut AgentInstance) -> Result<R>,
    {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("AgentInstance", id.to_string()))?;
        f(instance)
    }
}

/// Idle instances of a type with spare capacity, oldest first then by id
fn eligible(
    instances: &HashMap<Uuid, AgentInstance>,
    capability: CapabilityType,
) -> Vec<&AgentInstance> {
    let mut candidates: Vec<&AgentInstance> = instances
        .values()
        .filter(|instance| instance.capability == capability && instance.is_selectable())
        .collect();
    candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    candidates
}

/// One reserved unit of an instance's concurrency.
///
/// The slot is given back when the guard is dropped, including when the
/// future holding it is cancelled or times out.
#[must_use = "dropping a LoadSlot releases it immediately"]
pub struct LoadSlot {
    registry: Arc<InstanceRegistry>,
    instance_id: Uuid,
    cost_per_request: f64,
}

impl LoadSlot {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Price of one request on this instance at acquisition time
    pub fn cost_per_request(&self) -> f64 {
        self.cost_per_request
    }
}

impl std::fmt::Debug for LoadSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadSlot")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl Drop for LoadSlot {
    fn drop(&mut self) {
        self.registry.release_slot(self.instance_id);
    }
}
