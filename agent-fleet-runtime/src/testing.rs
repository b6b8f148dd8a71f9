//! Scripted collaborators for tests and demos
//!
//! These implementations of [`AgentInvoker`], [`Provisioner`] and
//! [`AuditSink`] record everything they receive so tests can assert on the
//! interaction, and can be told to fail, stall or answer with fixed data.

use crate::collaborators::{AgentCall, AgentInvoker, AgentResponse, AuditSink, Provisioner};
use agent_fleet_core::event::FleetEvent;
use agent_fleet_core::instance::CapabilityType;
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// What a scripted call does
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Answer with `success: true`
    Succeed,
    /// Answer with `success: false`
    Fail,
    /// Return an invocation error
    Error(String),
    /// Never answer
    Hang,
}

/// Agent invoker driven by per-action scripts
#[derive(Debug)]
pub struct ScriptedInvoker {
    /// One-shot behaviors consumed in order, per action
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    /// Behavior once an action's script is exhausted
    fallback: HashMap<String, Behavior>,
    outputs: HashMap<String, Value>,
    latency: Duration,
    tokens_per_call: u64,
    calls: Mutex<Vec<AgentCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInvoker {
    /// Invoker that answers every call successfully and immediately
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: HashMap::new(),
            outputs: HashMap::new(),
            latency: Duration::ZERO,
            tokens_per_call: 0,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every answer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_tokens(mut self, tokens_per_call: u64) -> Self {
        self.tokens_per_call = tokens_per_call;
        self
    }

    /// Answer successful calls for `action` with fixed data
    pub fn respond_with<S: Into<String>>(mut self, action: S, data: Value) -> Self {
        self.outputs.insert(action.into(), data);
        self
    }

    /// Report failure for the next `times` calls of `action`
    pub fn fail_times<S: Into<String>>(self, action: S, times: usize) -> Self {
        self.script(action, std::iter::repeat(Behavior::Fail).take(times))
    }

    /// Queue explicit behaviors for `action`
    pub fn script<S, I>(self, action: S, behaviors: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = Behavior>,
    {
        self.scripts
            .lock()
            .entry(action.into())
            .or_default()
            .extend(behaviors);
        self
    }

    /// Report failure for every call of `action`
    pub fn always_fail<S: Into<String>>(mut self, action: S) -> Self {
        self.fallback.insert(action.into(), Behavior::Fail);
        self
    }

    /// Never answer calls of `action`
    pub fn hang<S: Into<String>>(mut self, action: S) -> Self {
        self.fallback.insert(action.into(), Behavior::Hang);
        self
    }

    /// Every call received so far, in arrival order
    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, step_id: &str) -> Vec<AgentCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.step_id == step_id)
            .cloned()
            .collect()
    }

    /// Highest number of calls that were in flight at the same time
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_behavior(&self, action: &str) -> Behavior {
        self.scripts
            .lock()
            .get_mut(action)
            .and_then(|queue| queue.pop_front())
            .or_else(|| self.fallback.get(action).cloned())
            .unwrap_or(Behavior::Succeed)
    }
}

/// Decrements the in-flight counter even when the call future is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn call_agent(&self, call: AgentCall) -> anyhow::Result<AgentResponse> {
        self.calls.lock().push(call.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let behavior = self.next_behavior(&call.action);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match behavior {
            Behavior::Succeed => {
                let data = self.outputs.get(&call.action).cloned().unwrap_or_else(|| {
                    json!({
                        "step": call.step_id,
                        "action": call.action,
                        "attempt": call.attempt,
                    })
                });
                Ok(AgentResponse::success(data).with_tokens(self.tokens_per_call))
            }
            Behavior::Fail => Ok(AgentResponse::failure(json!({
                "reason": "scripted failure",
                "attempt": call.attempt,
            }))),
            Behavior::Error(message) => Err(anyhow!(message)),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// A provisioner request as seen by [`RecordingProvisioner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleRequest {
    Up(CapabilityType),
    Down(CapabilityType, Option<Uuid>),
}

/// Provisioner that records requests and optionally rejects them
#[derive(Debug, Default)]
pub struct RecordingProvisioner {
    requests: Mutex<Vec<ScaleRequest>>,
    fail: bool,
}

impl RecordingProvisioner {
    /// Provisioner that records every request and then errors
    pub fn failing() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn requests(&self) -> Vec<ScaleRequest> {
        self.requests.lock().clone()
    }

    fn record(&self, request: ScaleRequest) -> anyhow::Result<()> {
        self.requests.lock().push(request);
        if self.fail {
            return Err(anyhow!("provisioning backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn scale_up(&self, capability: CapabilityType) -> anyhow::Result<()> {
        self.record(ScaleRequest::Up(capability))
    }

    async fn scale_down(
        &self,
        capability: CapabilityType,
        candidate: Option<Uuid>,
    ) -> anyhow::Result<()> {
        self.record(ScaleRequest::Down(capability, candidate))
    }
}

/// Audit sink keeping events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<FleetEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<FleetEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &FleetEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Audit sink that rejects every event
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingAuditSink;

#[async_trait]
impl AuditSink for FailingAuditSink {
    async fn record(&self, event: &FleetEvent) -> anyhow::Result<()> {
        Err(anyhow!("audit store rejected {} event", event.name()))
    }
}
