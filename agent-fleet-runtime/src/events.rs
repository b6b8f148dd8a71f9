//! Fleet event broadcasting and audit forwarding

use crate::collaborators::AuditSink;
use agent_fleet_core::event::FleetEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Fan-out of fleet events to subscribers and the audit sink
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(capacity: usize, audit: Arc<dyn AuditSink>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, audit }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event and hand it to the audit sink.
    ///
    /// Never blocks and never fails: a missing subscriber is not an error,
    /// and audit failures are logged on the spawned task.
    pub fn publish(&self, event: FleetEvent) {
        debug!("Publishing {} event", event.name());
        // Err only means nobody is subscribed
        let _ = self.sender.send(event.clone());

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let audit = Arc::clone(&self.audit);
                handle.spawn(async move {
                    if let Err(e) = audit.record(&event).await {
                        warn!("Audit sink failed to record {} event: {:#}", event.name(), e);
                    }
                });
            }
            Err(_) => {
                debug!(
                    "No async runtime available, {} event not forwarded to audit sink",
                    event.name()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingAuditSink, MemoryAuditSink};
    use chrono::Utc;
    use uuid::Uuid;

    fn event() -> FleetEvent {
        FleetEvent::InstanceDeregistered {
            instance_id: Uuid::new_v4(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_audit() {
        let audit = Arc::new(MemoryAuditSink::default());
        let bus = EventBus::new(8, audit.clone());
        let mut receiver = bus.subscribe();

        let sent = event();
        bus.publish(sent.clone());

        assert_eq!(receiver.recv().await.unwrap(), sent);
        // Let the forwarding task run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(audit.events(), vec![sent]);
    }

    #[tokio::test]
    async fn test_failing_audit_sink_does_not_propagate() {
        let bus = EventBus::new(8, Arc::new(FailingAuditSink));
        bus.publish(event());
        tokio::task::yield_now().await;
    }

    #[test]
    fn test_publish_without_runtime_or_subscribers() {
        let audit = Arc::new(MemoryAuditSink::default());
        let bus = EventBus::new(8, audit.clone());
        bus.publish(event());
        assert!(audit.events().is_empty());
    }
}
