//! Simulated agent invoker used by the command-line runner

use agent_fleet_runtime::{AgentCall, AgentInvoker, AgentResponse};
use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Echoes every call back after a fixed latency, failing a fraction of them
#[derive(Debug, Clone)]
pub struct SimulatedInvoker {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedInvoker {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    fn should_fail(&self) -> bool {
        self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate)
    }
}

#[async_trait]
impl AgentInvoker for SimulatedInvoker {
    async fn call_agent(&self, call: AgentCall) -> anyhow::Result<AgentResponse> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.should_fail() {
            debug!(
                "Simulated failure for step '{}' attempt {}",
                call.step_id, call.attempt
            );
            return Ok(AgentResponse::failure(json!({
                "step": call.step_id,
                "reason": "simulated failure",
            })));
        }

        let tokens = rand::thread_rng().gen_range(50..500);
        Ok(AgentResponse::success(json!({
            "step": call.step_id,
            "action": call.action,
            "instance": call.instance_id,
            "parameters": call.parameters,
        }))
        .with_tokens(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_fleet_core::instance::CapabilityType;
    use uuid::Uuid;

    fn call() -> AgentCall {
        AgentCall {
            execution_id: Uuid::new_v4(),
            step_id: "draft".to_string(),
            attempt: 1,
            attempt_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            capability: CapabilityType::Planning,
            action: "draft_plan".to_string(),
            parameters: json!({"depth": 2}),
            input: json!({}),
        }
    }

    #[tokio::test]
    async fn test_echoes_call() {
        let invoker = SimulatedInvoker::new(Duration::ZERO, 0.0);
        let response = invoker.call_agent(call()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.data["action"], "draft_plan");
        assert_eq!(response.data["parameters"]["depth"], 2);
        assert!(response.tokens_used >= 50);
    }

    #[tokio::test]
    async fn test_always_fails_at_full_rate() {
        let invoker = SimulatedInvoker::new(Duration::ZERO, 1.5);
        let response = invoker.call_agent(call()).await.unwrap();
        assert!(!response.success);
    }
}
