//! Load balancer for instance selection.
//!
//! Picks one eligible instance (matching capability, idle, spare capacity)
//! according to a [`LoadBalancingStrategy`]. Candidates are presented oldest
//! first, so every strategy breaks ties by `created_at` and then id.

use crate::registry::{InstanceRegistry, LoadSlot};
use agent_fleet_core::config::LoadBalancingStrategy;
use agent_fleet_core::instance::{AgentInstance, CapabilityType};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Strategy-driven selection over the instance registry
pub struct LoadBalancer {
    registry: Arc<InstanceRegistry>,
    /// Rotation position per capability for the sequential strategy
    cursors: Mutex<HashMap<CapabilityType, usize>>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer").finish_non_exhaustive()
    }
}

impl LoadBalancer {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self {
            registry,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Pick an instance without reserving it.
    ///
    /// `None` means no instance of the type can take work right now; callers
    /// treat it as resource exhaustion, not a fatal error.
    pub fn select_instance(
        &self,
        capability: CapabilityType,
        strategy: LoadBalancingStrategy,
    ) -> Option<AgentInstance> {
        self.registry
            .select_with(capability, |candidates| {
                self.choose(capability, strategy, candidates)
            })
    }

    /// Pick an instance and reserve one of its slots
    pub fn acquire(
        &self,
        capability: CapabilityType,
        strategy: LoadBalancingStrategy,
    ) -> Option<LoadSlot> {
        let slot = self.registry.acquire_with(capability, |candidates| {
            self.choose(capability, strategy, candidates)
        });
        if slot.is_none() {
            debug!(
                "No eligible instance for capability {} (strategy: {})",
                capability, strategy
            );
        }
        slot
    }

    fn choose(
        &self,
        capability: CapabilityType,
        strategy: LoadBalancingStrategy,
        candidates: &[&AgentInstance],
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = match strategy {
            LoadBalancingStrategy::RoundRobin => rand::thread_rng().gen_range(0..candidates.len()),
            LoadBalancingStrategy::Sequential => {
                let mut cursors = self.cursors.lock();
                let cursor = cursors.entry(capability).or_insert(0);
                let index = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                index
            }
            LoadBalancingStrategy::LeastLoaded => {
                position_of_min(candidates, |a, b| {
                    a.load.current_requests.cmp(&b.load.current_requests)
                })
            }
            LoadBalancingStrategy::FastestResponse => {
                position_of_min(candidates, |a, b| {
                    a.health.response_time_ms.cmp(&b.health.response_time_ms)
                })
            }
            LoadBalancingStrategy::CostOptimized => position_of_min(candidates, |a, b| {
                a.metrics
                    .cost_per_request
                    .total_cmp(&b.metrics.cost_per_request)
            }),
        };
        Some(index)
    }
}

/// Index of the first minimum, so earlier candidates win ties
fn position_of_min<F>(candidates: &[&AgentInstance], compare: F) -> usize
where
    F: Fn(&AgentInstance, &AgentInstance) -> std::cmp::Ordering,
{
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| compare(a, b))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_fleet_core::clock::ManualClock;
    use agent_fleet_core::instance::{
        HealthUpdate, InstanceSpec, InstanceStatus, LoadUpdate, MetricsUpdate,
    };
    use chrono::Utc;
    use std::collections::HashSet;

    struct Fixture {
        registry: Arc<InstanceRegistry>,
        balancer: LoadBalancer,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let registry = Arc::new(InstanceRegistry::new(Arc::new(clock.clone()), 5));
        Fixture {
            balancer: LoadBalancer::new(Arc::clone(&registry)),
            registry,
            clock,
        }
    }

    impl Fixture {
        /// Register instances one second apart so creation order is stable
        fn register(&self, capability: CapabilityType, max: u32) -> uuid::Uuid {
            self.clock.advance(chrono::Duration::seconds(1));
            self.registry
                .register_instance(
                    InstanceSpec::builder()
                        .capability(capability)
                        .max_concurrent_requests(max)
                        .build()
                        .unwrap(),
                )
                .unwrap()
        }
    }

    #[test]
    fn test_least_loaded_prefers_lowest_load_then_oldest() {
        let f = fixture();
        let a = f.register(CapabilityType::Planning, 4);
        let b = f.register(CapabilityType::Planning, 4);
        f.register(CapabilityType::Planning, 4);

        f.registry
            .update_load(
                a,
                LoadUpdate {
                    current_requests: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();

        let selected = f
            .balancer
            .select_instance(CapabilityType::Planning, LoadBalancingStrategy::LeastLoaded)
            .unwrap();
        assert_eq!(selected.id, b);
    }

    #[test]
    fn test_fastest_response_and_cost_optimized() {
        let f = fixture();
        let slow_cheap = f.register(CapabilityType::Research, 1);
        let fast_pricey = f.register(CapabilityType::Research, 1);

        f.registry
            .update_health(
                slow_cheap,
                HealthUpdate {
                    response_time_ms: Some(900),
                    ..Default::default()
                },
            )
            .unwrap();
        f.registry
            .update_health(
                fast_pricey,
                HealthUpdate {
                    response_time_ms: Some(50),
                    ..Default::default()
                },
            )
            .unwrap();
        f.registry
            .update_metrics(
                slow_cheap,
                MetricsUpdate {
                    cost_per_request: Some(0.01),
                    ..Default::default()
                },
            )
            .unwrap();
        f.registry
            .update_metrics(
                fast_pricey,
                MetricsUpdate {
                    cost_per_request: Some(0.10),
                    ..Default::default()
                },
            )
            .unwrap();

        let fastest = f
            .balancer
            .select_instance(
                CapabilityType::Research,
                LoadBalancingStrategy::FastestResponse,
            )
            .unwrap();
        assert_eq!(fastest.id, fast_pricey);

        let cheapest = f
            .balancer
            .select_instance(CapabilityType::Research, LoadBalancingStrategy::CostOptimized)
            .unwrap();
        assert_eq!(cheapest.id, slow_cheap);
    }

    #[test]
    fn test_sequential_rotates_through_candidates() {
        let f = fixture();
        let ids: Vec<_> = (0..3)
            .map(|_| f.register(CapabilityType::Execution, 1))
            .collect();

        let picks: Vec<_> = (0..6)
            .map(|_| {
                f.balancer
                    .select_instance(CapabilityType::Execution, LoadBalancingStrategy::Sequential)
                    .unwrap()
                    .id
            })
            .collect();
        assert_eq!(picks, [ids.clone(), ids].concat());
    }

    #[test]
    fn test_round_robin_picks_only_eligible() {
        let f = fixture();
        let a = f.register(CapabilityType::Analysis, 1);
        let b = f.register(CapabilityType::Analysis, 1);
        let offline = f.register(CapabilityType::Analysis, 1);
        f.registry
            .set_status(offline, InstanceStatus::Offline)
            .unwrap();

        let seen: HashSet<_> = (0..50)
            .filter_map(|_| {
                f.balancer
                    .select_instance(CapabilityType::Analysis, LoadBalancingStrategy::RoundRobin)
                    .map(|instance| instance.id)
            })
            .collect();
        assert!(!seen.contains(&offline));
        assert!(seen.is_subset(&[a, b].into_iter().collect()));
    }

    #[test]
    fn test_no_candidate_for_other_capability() {
        let f = fixture();
        f.register(CapabilityType::Planning, 1);
        assert!(f
            .balancer
            .acquire(CapabilityType::Communication, LoadBalancingStrategy::LeastLoaded)
            .is_none());
    }

    #[test]
    fn test_selection_never_returns_busy_or_full() {
        let f = fixture();
        let id = f.register(CapabilityType::DataAccess, 1);

        let slot = f
            .balancer
            .acquire(CapabilityType::DataAccess, LoadBalancingStrategy::LeastLoaded)
            .unwrap();
        assert_eq!(slot.instance_id(), id);

        for strategy in [
            LoadBalancingStrategy::RoundRobin,
            LoadBalancingStrategy::Sequential,
            LoadBalancingStrategy::LeastLoaded,
            LoadBalancingStrategy::FastestResponse,
            LoadBalancingStrategy::CostOptimized,
        ] {
            assert!(f
                .balancer
                .select_instance(CapabilityType::DataAccess, strategy)
                .is_none());
        }

        drop(slot);
        assert!(f
            .balancer
            .select_instance(CapabilityType::DataAccess, LoadBalancingStrategy::LeastLoaded)
            .is_some());
    }
}
