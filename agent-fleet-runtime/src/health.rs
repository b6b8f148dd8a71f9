//! Heartbeat-based health monitoring
//!
//! A sweep looks for instances whose last heartbeat is older than the
//! configured timeout. The first time an instance goes stale it is recovered
//! in place and a re-check is scheduled one recovery window later. At the
//! re-check it is evicted from the registry unless it has sent a heartbeat
//! since the recovery and is neither stale nor offline.

use crate::events::EventBus;
use crate::registry::InstanceRegistry;
use agent_fleet_core::clock::SharedClock;
use agent_fleet_core::config::HealthCheckConfig;
use agent_fleet_core::event::FleetEvent;
use agent_fleet_core::instance::InstanceStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one health sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthSweepReport {
    pub recovered: Vec<Uuid>,
    pub evicted: Vec<Uuid>,
}

impl HealthSweepReport {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.evicted.is_empty()
    }
}

/// Periodic staleness detection, recovery and eviction
pub struct HealthMonitor {
    registry: Arc<InstanceRegistry>,
    events: EventBus,
    config: HealthCheckConfig,
    clock: SharedClock,
    /// Instances under recovery
    recovering: Mutex<HashMap<Uuid, RecoveryMarker>>,
}

#[derive(Debug, Clone, Copy)]
struct RecoveryMarker {
    recovered_at: DateTime<Utc>,
    due: DateTime<Utc>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        events: EventBus,
        config: HealthCheckConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            events,
            config,
            clock,
            recovering: Mutex::new(HashMap::new()),
        }
    }

    /// Number of instances with a pending re-check
    pub fn pending_rechecks(&self) -> usize {
        self.recovering.lock().len()
    }

    /// Run one sweep
    pub fn run_health_check(&self) -> HealthSweepReport {
        let now = self.clock.now();
        let timeout = self.config.timeout();
        let mut report = HealthSweepReport::default();

        // Re-checks that have come due
        let due: Vec<(Uuid, RecoveryMarker)> = {
            let mut recovering = self.recovering.lock();
            let due: Vec<(Uuid, RecoveryMarker)> = recovering
                .iter()
                .filter(|(_, marker)| marker.due <= now)
                .map(|(id, marker)| (*id, *marker))
                .collect();
            for (id, _) in &due {
                recovering.remove(id);
            }
            due
        };

        for (id, marker) in due {
            let Some(instance) = self.registry.get(id) else {
                continue;
            };
            // Recovery itself refreshed the heartbeat; only a later one counts
            let silent = instance.health.last_heartbeat <= marker.recovered_at;
            if silent
                || instance.status == InstanceStatus::Offline
                || instance.is_stale(now, timeout)
            {
                if let Some(evicted) = self.registry.evict(id) {
                    report.evicted.push(id);
                    self.events.publish(FleetEvent::InstanceEvicted {
                        instance_id: id,
                        capability: evicted.capability,
                        at: now,
                    });
                }
            } else {
                debug!("Agent instance {} passed its health re-check", id);
            }
        }

        // Newly stale instances
        for instance in self.registry.list() {
            if !instance.is_stale(now, timeout) {
                continue;
            }
            if self.recovering.lock().contains_key(&instance.id) {
                continue;
            }

            warn!(
                "Agent instance {} missed heartbeats for {:?}, attempting recovery",
                instance.id,
                instance.heartbeat_age(now)
            );
            if let Err(e) = self.registry.recover(instance.id) {
                warn!("Failed to recover agent instance {}: {}", instance.id, e);
                continue;
            }

            let window = chrono::Duration::from_std(self.config.recovery_window())
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.recovering.lock().insert(
                instance.id,
                RecoveryMarker {
                    recovered_at: now,
                    due: now + window,
                },
            );
            report.recovered.push(instance.id);
            self.events.publish(FleetEvent::InstanceRecovered {
                instance_id: instance.id,
                at: now,
            });
        }

        // Markers of instances that were deregistered meanwhile
        self.recovering
            .lock()
            .retain(|id, _| self.registry.get(*id).is_some());

        if !report.is_empty() {
            info!(
                "Health sweep complete: {} recovered, {} evicted",
                report.recovered.len(),
                report.evicted.len()
            );
        }
        report
    }

    /// Sweep every `interval_ms` until the token is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(
            "Health monitor started (interval: {:?}, timeout: {:?})",
            self.config.interval(),
            self.config.timeout()
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_health_check();
                }
            }
        }
        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryAuditSink;
    use agent_fleet_core::clock::{Clock, ManualClock};
    use agent_fleet_core::config::FleetConfig;
    use agent_fleet_core::instance::{CapabilityType, InstanceSpec};
    use chrono::Duration;

    struct Fixture {
        registry: Arc<InstanceRegistry>,
        monitor: Arc<HealthMonitor>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        fixture_with(HealthCheckConfig {
            interval_ms: 1_000,
            timeout_ms: 10_000,
            recovery_window_ms: 30_000,
            max_error_count: 5,
        })
    }

    fn fixture_with(config: HealthCheckConfig) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let shared: SharedClock = Arc::new(clock.clone());
        let registry = Arc::new(InstanceRegistry::new(shared.clone(), 5));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            EventBus::new(16, Arc::new(MemoryAuditSink::default())),
            config,
            shared,
        ));
        Fixture {
            registry,
            monitor,
            clock,
        }
    }

    fn register(registry: &InstanceRegistry) -> Uuid {
        registry
            .register_instance(InstanceSpec::new(CapabilityType::Planning))
            .unwrap()
    }

    #[test]
    fn test_fresh_instances_are_left_alone() {
        let f = fixture();
        register(&f.registry);
        f.clock.advance(Duration::seconds(5));
        assert!(f.monitor.run_health_check().is_empty());
    }

    #[test]
    fn test_stale_instance_recovered_then_evicted() {
        let f = fixture();
        let id = register(&f.registry);
        f.registry.record_failure(id);

        f.clock.advance(Duration::seconds(60));
        let report = f.monitor.run_health_check();
        assert_eq!(report.recovered, vec![id]);
        assert!(report.evicted.is_empty());

        let instance = f.registry.get(id).unwrap();
        assert_eq!(instance.status, InstanceStatus::Idle);
        assert_eq!(instance.health.error_count, 0);
        assert_eq!(instance.health.last_heartbeat, f.clock.now());

        // No heartbeat for the whole recovery window
        f.clock.advance(Duration::seconds(30));
        let report = f.monitor.run_health_check();
        assert_eq!(report.evicted, vec![id]);
        assert!(f.registry.get(id).is_none());
        assert_eq!(f.monitor.pending_rechecks(), 0);
    }

    #[test]
    fn test_heartbeat_within_window_clears_recheck() {
        let f = fixture();
        let id = register(&f.registry);

        f.clock.advance(Duration::seconds(60));
        f.monitor.run_health_check();

        f.clock.advance(Duration::seconds(25));
        f.registry.heartbeat(id).unwrap();
        f.clock.advance(Duration::seconds(5));

        let report = f.monitor.run_health_check();
        assert!(report.evicted.is_empty());
        assert!(f.registry.get(id).is_some());
        assert_eq!(f.monitor.pending_rechecks(), 0);
    }

    #[test]
    fn test_stale_instance_under_recovery_is_left_alone_until_due() {
        let f = fixture();
        let id = register(&f.registry);

        f.clock.advance(Duration::seconds(60));
        f.monitor.run_health_check();

        // Stale again but the re-check is not due yet
        f.clock.advance(Duration::seconds(15));
        let report = f.monitor.run_health_check();
        assert!(report.is_empty());
        assert!(f.registry.get(id).is_some());
    }

    #[test]
    fn test_offline_instance_evicted_at_recheck() {
        let f = fixture();
        let id = register(&f.registry);

        f.clock.advance(Duration::seconds(60));
        f.monitor.run_health_check();
        f.registry.heartbeat(id).unwrap();
        f.registry.set_status(id, InstanceStatus::Offline).unwrap();

        f.clock.advance(Duration::seconds(30));
        let report = f.monitor.run_health_check();
        assert_eq!(report.evicted, vec![id]);
    }

    #[test]
    fn test_silent_instance_evicted_with_default_config() {
        let clock = ManualClock::new(Utc::now());
        let shared: SharedClock = Arc::new(clock.clone());
        let registry = Arc::new(InstanceRegistry::new(shared.clone(), 5));
        let config = FleetConfig::default().health_check;
        assert!(config.recovery_window_ms <= config.timeout_ms);
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            EventBus::new(16, Arc::new(MemoryAuditSink::default())),
            config,
            shared,
        );
        let id = register(&registry);

        let mut recovered = 0;
        let mut evicted = 0;
        for _ in 0..120 {
            clock.advance(Duration::seconds(5));
            let report = monitor.run_health_check();
            recovered += report.recovered.len();
            evicted += report.evicted.len();
        }

        assert_eq!(recovered, 1);
        assert_eq!(evicted, 1);
        assert!(registry.get(id).is_none());
        assert_eq!(monitor.pending_rechecks(), 0);
    }

    #[test]
    fn test_heartbeat_after_recovery_passes_recheck_with_short_window() {
        let f = fixture_with(HealthCheckConfig {
            interval_ms: 1_000,
            timeout_ms: 60_000,
            recovery_window_ms: 30_000,
            max_error_count: 5,
        });
        let id = register(&f.registry);

        f.clock.advance(Duration::seconds(61));
        assert_eq!(f.monitor.run_health_check().recovered, vec![id]);

        f.clock.advance(Duration::seconds(10));
        f.registry.heartbeat(id).unwrap();
        f.clock.advance(Duration::seconds(20));

        let report = f.monitor.run_health_check();
        assert!(report.is_empty());
        assert!(f.registry.get(id).is_some());
        assert_eq!(f.monitor.pending_rechecks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_sweeps_and_stops() {
        let f = fixture();
        let id = register(&f.registry);
        f.clock.advance(Duration::seconds(60));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&f.monitor).run(shutdown.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
        assert_eq!(f.monitor.pending_rechecks(), 1);
        assert_eq!(
            f.registry.get(id).unwrap().health.last_heartbeat,
            f.clock.now()
        );

        shutdown.cancel();
        handle.await.unwrap();
    }
}
