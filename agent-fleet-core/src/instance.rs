//! Agent instance domain model and related types
//!
//! An agent instance is one unit of bounded-concurrency capacity for a single
//! capability type. Instances are registered from an [`InstanceSpec`] and then
//! mutated by the workflow engine (load slots, metrics) and the health
//! monitor (heartbeats, recovery).
//!
//! # Examples
//!
//! ```rust
//! use agent_fleet_core::instance::*;
//!
//! let spec = InstanceSpec::builder()
//!     .capability(CapabilityType::Planning)
//!     .max_concurrent_requests(2)
//!     .location("eu-west-1")
//!     .cost_per_request(0.02)
//!     .build()
//!     .unwrap();
//!
//! let instance = AgentInstance::from_spec(spec, chrono::Utc::now());
//! assert!(instance.is_selectable());
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Category of work an instance can perform
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    Planning,
    Execution,
    DataAccess,
    Research,
    Communication,
    Analysis,
}

impl CapabilityType {
    pub const ALL: [CapabilityType; 6] = [
        CapabilityType::Planning,
        CapabilityType::Execution,
        CapabilityType::DataAccess,
        CapabilityType::Research,
        CapabilityType::Communication,
        CapabilityType::Analysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Planning => "planning",
            CapabilityType::Execution => "execution",
            CapabilityType::DataAccess => "data_access",
            CapabilityType::Research => "research",
            CapabilityType::Communication => "communication",
            CapabilityType::Analysis => "analysis",
        }
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        CapabilityType::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| Error::validation(format!("Unknown capability type '{}'", s)))
    }
}

/// Current status of an agent instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

impl InstanceStatus {
    /// Single source of truth for allowed status changes.
    ///
    /// `idle <-> busy`, `{idle, busy} -> error`, `error -> idle`,
    /// anything `-> offline` and `offline -> idle`. Same-state moves are allowed.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Error)
                | (Busy, Error)
                | (Error, Idle)
                | (_, Offline)
                | (Offline, Idle)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceStatus::Idle => "idle",
            InstanceStatus::Busy => "busy",
            InstanceStatus::Error => "error",
            InstanceStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Liveness information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceHealth {
    pub last_heartbeat: DateTime<Utc>,
    pub response_time_ms: u64,
    pub error_count: u32,
    /// Fraction of successful requests, 0.0-1.0
    pub success_rate: f64,
}

/// Usage counters and pricing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceMetrics {
    pub requests_processed: u64,
    pub average_response_time_ms: f64,
    /// Price of one request; a rate, not accumulated spend
    pub cost_per_request: f64,
    pub tokens_used: u64,
}

/// Concurrency accounting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceLoad {
    pub current_requests: u32,
    pub max_concurrent_requests: u32,
    pub queue_length: u32,
}

impl InstanceLoad {
    pub fn has_capacity(&self) -> bool {
        self.current_requests < self.max_concurrent_requests
    }

    /// Fraction of concurrency in use, 0.0-1.0
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent_requests == 0 {
            return 1.0;
        }
        f64::from(self.current_requests) / f64::from(self.max_concurrent_requests)
    }
}

/// A registered unit of agent capacity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInstance {
    pub id: Uuid,
    pub capability: CapabilityType,
    pub status: InstanceStatus,
    pub health: InstanceHealth,
    pub metrics: InstanceMetrics,
    pub load: InstanceLoad,
    pub location: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl AgentInstance {
    /// Materialize a registered instance from its spec
    pub fn from_spec(spec: InstanceSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            capability: spec.capability,
            status: InstanceStatus::Idle,
            health: InstanceHealth {
                last_heartbeat: now,
                response_time_ms: spec.initial_response_time_ms,
                error_count: 0,
                success_rate: 1.0,
            },
            metrics: InstanceMetrics {
                requests_processed: 0,
                average_response_time_ms: 0.0,
                cost_per_request: spec.cost_per_request,
                tokens_used: 0,
            },
            load: InstanceLoad {
                current_requests: 0,
                max_concurrent_requests: spec.max_concurrent_requests,
                queue_length: 0,
            },
            location: spec.location,
            version: spec.version,
            created_at: now,
            last_used: now,
        }
    }

    /// Eligible for dispatch: idle with a free slot
    pub fn is_selectable(&self) -> bool {
        self.status == InstanceStatus::Idle && self.load.has_capacity()
    }

    /// Move to a new status, rejecting transitions the state machine forbids
    pub fn transition_to(&mut self, next: InstanceStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::state_transition(format!(
                "Instance {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Time since the last heartbeat; negative ages count as zero
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.health.last_heartbeat)
            .to_std()
            .unwrap_or_default()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.heartbeat_age(now) > timeout
    }

    /// Take one concurrency slot. Fills up to `busy`.
    pub fn acquire_slot(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.load.has_capacity() {
            return Err(Error::constraint_violation(
                "max_concurrent_requests",
                format!(
                    "Instance {} already serves {} of {} requests",
                    self.id, self.load.current_requests, self.load.max_concurrent_requests
                ),
            ));
        }
        self.load.current_requests += 1;
        self.last_used = now;
        if !self.load.has_capacity() && self.status == InstanceStatus::Idle {
            self.transition_to(InstanceStatus::Busy)?;
        }
        Ok(())
    }

    /// Return one concurrency slot. Returns `false` if none was held.
    pub fn release_slot(&mut self) -> bool {
        if self.load.current_requests == 0 {
            return false;
        }
        self.load.current_requests -= 1;
        if self.status == InstanceStatus::Busy && self.load.has_capacity() {
            self.status = InstanceStatus::Idle;
        }
        true
    }

    /// Merge a partial health update; refreshes heartbeat and last use
    pub fn apply_health(&mut self, update: HealthUpdate, now: DateTime<Utc>) -> Result<()> {
        if let Some(rate) = update.success_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::validation(format!(
                    "success_rate must be within [0.0, 1.0], got {}",
                    rate
                )));
            }
            self.health.success_rate = rate;
        }
        if let Some(response_time) = update.response_time_ms {
            self.health.response_time_ms = response_time;
        }
        if let Some(errors) = update.error_count {
            self.health.error_count = errors;
        }
        self.health.last_heartbeat = now;
        self.last_used = now;
        Ok(())
    }

    /// Merge a partial metrics update
    pub fn apply_metrics(&mut self, update: MetricsUpdate) -> Result<()> {
        if let Some(cost) = update.cost_per_request {
            if cost < 0.0 || !cost.is_finite() {
                return Err(Error::validation("cost_per_request must be a non-negative number"));
            }
            self.metrics.cost_per_request = cost;
        }
        if let Some(requests) = update.requests_processed {
            self.metrics.requests_processed = requests;
        }
        if let Some(average) = update.average_response_time_ms {
            self.metrics.average_response_time_ms = average;
        }
        if let Some(tokens) = update.tokens_used {
            self.metrics.tokens_used = tokens;
        }
        Ok(())
    }

    /// Merge a partial load update, enforcing `current <= max`
    pub fn apply_load(&mut self, update: LoadUpdate) -> Result<()> {
        let current = update.current_requests.unwrap_or(self.load.current_requests);
        let max = update
            .max_concurrent_requests
            .unwrap_or(self.load.max_concurrent_requests);
        if max == 0 {
            return Err(Error::constraint_violation(
                "max_concurrent_requests",
                "max_concurrent_requests must be at least 1",
            ));
        }
        if current > max {
            return Err(Error::constraint_violation(
                "current_requests",
                format!("current_requests ({}) exceeds max_concurrent_requests ({})", current, max),
            ));
        }
        self.load.current_requests = current;
        self.load.max_concurrent_requests = max;
        if let Some(queue) = update.queue_length {
            self.load.queue_length = queue;
        }
        // Keep busy/idle in line with the new capacity
        match self.status {
            InstanceStatus::Idle if !self.load.has_capacity() => self.status = InstanceStatus::Busy,
            InstanceStatus::Busy if self.load.has_capacity() => self.status = InstanceStatus::Idle,
            _ => {}
        }
        Ok(())
    }

    /// Book a successful request
    pub fn record_success(&mut self, response_time_ms: u64, tokens: u64, now: DateTime<Utc>) {
        let processed = self.metrics.requests_processed;
        self.metrics.average_response_time_ms = (self.metrics.average_response_time_ms
            * processed as f64
            + response_time_ms as f64)
            / (processed + 1) as f64;
        self.metrics.requests_processed = processed + 1;
        self.metrics.tokens_used += tokens;

        self.health.success_rate = rolling_rate(self.health.success_rate, processed, true);
        self.health.response_time_ms = response_time_ms;
        self.health.error_count = 0;
        self.health.last_heartbeat = now;
        self.last_used = now;
    }

    /// Book a failed request. Returns `true` when the error budget is spent
    /// and the instance was moved to `error`.
    pub fn record_failure(&mut self, max_error_count: u32) -> bool {
        let processed = self.metrics.requests_processed;
        self.metrics.requests_processed = processed + 1;
        self.health.success_rate = rolling_rate(self.health.success_rate, processed, false);
        self.health.error_count += 1;

        if self.health.error_count >= max_error_count
            && self.status.can_transition_to(InstanceStatus::Error)
            && self.status != InstanceStatus::Error
        {
            self.status = InstanceStatus::Error;
            return true;
        }
        false
    }

    /// Reset after a missed heartbeat: clear errors, refresh heartbeat, go idle
    pub fn recover(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.health.error_count = 0;
        self.health.last_heartbeat = now;
        let next = if self.load.has_capacity() {
            InstanceStatus::Idle
        } else {
            InstanceStatus::Busy
        };
        if self.status == InstanceStatus::Offline || self.status == InstanceStatus::Error {
            self.transition_to(InstanceStatus::Idle)?;
            if next == InstanceStatus::Busy {
                self.transition_to(InstanceStatus::Busy)?;
            }
        } else {
            self.transition_to(next)?;
        }
        Ok(())
    }
}

fn rolling_rate(previous: f64, samples: u64, success: bool) -> f64 {
    let hit = if success { 1.0 } else { 0.0 };
    (previous * samples as f64 + hit) / (samples + 1) as f64
}

/// Registration payload for a new instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSpec {
    pub capability: CapabilityType,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub cost_per_request: f64,
    #[serde(default)]
    pub initial_response_time_ms: u64,
}

fn default_max_concurrent_requests() -> u32 {
    1
}

fn default_location() -> String {
    "local".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl InstanceSpec {
    /// Create a spec with defaults for everything but the capability
    pub fn new(capability: CapabilityType) -> Self {
        Self {
            capability,
            max_concurrent_requests: default_max_concurrent_requests(),
            location: default_location(),
            version: default_version(),
            cost_per_request: 0.0,
            initial_response_time_ms: 0,
        }
    }

    /// Create a builder for constructing an InstanceSpec
    pub fn builder() -> InstanceSpecBuilder {
        InstanceSpecBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(Error::constraint_violation(
                "max_concurrent_requests",
                "Instance must accept at least one concurrent request",
            ));
        }
        if self.version.trim().is_empty() {
            return Err(Error::validation("Instance version cannot be empty"));
        }
        if self.location.trim().is_empty() {
            return Err(Error::validation("Instance location cannot be empty"));
        }
        if self.cost_per_request < 0.0 || !self.cost_per_request.is_finite() {
            return Err(Error::validation(
                "cost_per_request must be a non-negative number",
            ));
        }
        Ok(())
    }
}

/// Builder for constructing InstanceSpec values with validation
#[derive(Debug, Clone, Default)]
pub struct InstanceSpecBuilder {
    capability: Option<CapabilityType>,
    max_concurrent_requests: Option<u32>,
    location: Option<String>,
    version: Option<String>,
    cost_per_request: Option<f64>,
    initial_response_time_ms: Option<u64>,
}

impl InstanceSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capability(mut self, capability: CapabilityType) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn max_concurrent_requests(mut self, max: u32) -> Self {
        self.max_concurrent_requests = Some(max);
        self
    }

    pub fn location<S: Into<String>>(mut self, location: S) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn cost_per_request(mut self, cost: f64) -> Self {
        self.cost_per_request = Some(cost);
        self
    }

    pub fn response_time_ms(mut self, response_time_ms: u64) -> Self {
        self.initial_response_time_ms = Some(response_time_ms);
        self
    }

    /// Build the InstanceSpec
    pub fn build(self) -> Result<InstanceSpec> {
        let capability = self
            .capability
            .ok_or_else(|| Error::validation("Instance capability is required"))?;
        let mut spec = InstanceSpec::new(capability);
        if let Some(max) = self.max_concurrent_requests {
            spec.max_concurrent_requests = max;
        }
        if let Some(location) = self.location {
            spec.location = location;
        }
        if let Some(version) = self.version {
            spec.version = version;
        }
        if let Some(cost) = self.cost_per_request {
            spec.cost_per_request = cost;
        }
        if let Some(response_time) = self.initial_response_time_ms {
            spec.initial_response_time_ms = response_time;
        }
        spec.validate()?;
        Ok(spec)
    }
}

/// Partial health update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthUpdate {
    pub response_time_ms: Option<u64>,
    pub error_count: Option<u32>,
    pub success_rate: Option<f64>,
}

/// Partial metrics update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsUpdate {
    pub requests_processed: Option<u64>,
    pub average_response_time_ms: Option<f64>,
    pub cost_per_request: Option<f64>,
    pub tokens_used: Option<u64>,
}

/// Partial load update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadUpdate {
    pub current_requests: Option<u32>,
    pub max_concurrent_requests: Option<u32>,
    pub queue_length: Option<u32>,
}
