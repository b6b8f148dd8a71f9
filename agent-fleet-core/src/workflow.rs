//! Workflow definitions: steps, retry policy and branching predicates
//!
//! A [`WorkflowDefinition`] is immutable once registered. Steps run one at a
//! time in an order that honours `depends_on` (definition order breaks ties);
//! a step whose [`WorkflowCondition`]s do not all hold is skipped.
//!
//! # Examples
//!
//! ```rust
//! use agent_fleet_core::instance::CapabilityType;
//! use agent_fleet_core::workflow::*;
//!
//! let workflow = WorkflowDefinition::builder()
//!     .name("quarterly-plan")
//!     .step(WorkflowStep::new("research", CapabilityType::Research, "gather_market_data"))
//!     .step(
//!         WorkflowStep::new("draft", CapabilityType::Planning, "draft_plan")
//!             .depends_on("research")
//!             .with_retry_count(1),
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(workflow.execution_order().unwrap(), vec![0, 1]);
//! ```

use crate::instance::CapabilityType;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Retry behaviour shared by all steps of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry numbered `retry_count` (1 for the first retry):
    /// `base * backoff_multiplier^retry_count`, capped at `max_backoff_ms`.
    pub fn backoff(&self, base_ms: u64, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let raw = base_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_backoff_ms as f64)
        } else {
            self.max_backoff_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::validation(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// Comparison applied by a step condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    Exists,
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::Contains => "contains",
            ConditionOperator::Exists => "exists",
        };
        f.write_str(name)
    }
}

/// Predicate gating a step.
///
/// `field` is a dotted path into `{"input": ..., "output": {step_id: ...}}`,
/// e.g. `input.region` or `output.review.approved`. Array elements are
/// addressed by index (`output.research.sources.0`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl WorkflowCondition {
    pub fn new<S: Into<String>>(field: S, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluate against an execution context
    pub fn evaluate(&self, context: &Value) -> bool {
        let actual = resolve_path(context, &self.field);
        match self.operator {
            ConditionOperator::Exists => {
                let present = actual.map(|v| !v.is_null()).unwrap_or(false);
                match self.value {
                    Value::Bool(false) => !present,
                    _ => present,
                }
            }
            ConditionOperator::Equals => actual.map(|v| values_equal(v, &self.value)).unwrap_or(false),
            ConditionOperator::NotEquals => !actual.map(|v| values_equal(v, &self.value)).unwrap_or(false),
            ConditionOperator::GreaterThan => {
                compare(actual, &self.value) == Some(std::cmp::Ordering::Greater)
            }
            ConditionOperator::LessThan => {
                compare(actual, &self.value) == Some(std::cmp::Ordering::Less)
            }
            ConditionOperator::Contains => match (actual, &self.value) {
                (Some(Value::String(haystack)), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.iter().any(|item| values_equal(item, needle)),
                (Some(Value::Object(map)), Value::String(key)) => map.contains_key(key),
                _ => false,
            },
        }
    }
}

fn resolve_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) if left.is_number() && right.is_number() => a == b,
        _ => left == right,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// A single unit of work inside a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub capability: CapabilityType,
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub conditions: Vec<WorkflowCondition>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Agent call deadline overriding the engine default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retry limit overriding the workflow policy
    #[serde(default)]
    pub retry_count: Option<u32>,
}

impl WorkflowStep {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        id: S1,
        capability: CapabilityType,
        action: S2,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            capability,
            action: action.into(),
            parameters: Value::Null,
            conditions: Vec::new(),
            depends_on: Vec::new(),
            timeout_ms: None,
            retry_count: None,
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_condition(mut self, condition: WorkflowCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn depends_on<S: Into<String>>(mut self, step_id: S) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Effective retry limit for this step
    pub fn retry_limit(&self, policy: &RetryPolicy) -> u32 {
        self.retry_count.unwrap_or(policy.max_retries)
    }

    /// Whether every condition holds for the given context
    pub fn conditions_met(&self, context: &Value) -> bool {
        self.conditions.iter().all(|c| c.evaluate(context))
    }
}

fn default_timeout_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_workflow_version() -> u32 {
    1
}

/// Immutable, registered workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Wall-clock budget for a whole execution
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_workflow_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Create a builder for constructing a WorkflowDefinition
    pub fn builder() -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder::new()
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Structural and branching validation
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("Workflow name cannot be empty"));
        }
        if self.steps.is_empty() {
            return Err(Error::validation(format!(
                "Workflow '{}' must contain at least one step",
                self.name
            )));
        }
        if self.timeout_ms == 0 {
            return Err(Error::validation("Workflow timeout must be greater than zero"));
        }
        self.retry_policy.validate()?;

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(Error::validation("Step id cannot be empty"));
            }
            if step.action.trim().is_empty() {
                return Err(Error::validation(format!(
                    "Step '{}' must name an action",
                    step.id
                )));
            }
            if step.timeout_ms == Some(0) {
                return Err(Error::validation(format!(
                    "Step '{}' timeout must be greater than zero",
                    step.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(Error::validation(format!(
                    "Duplicate step id '{}' in workflow '{}'",
                    step.id, self.name
                )));
            }
        }

        let order = self.execution_order()?;
        self.validate_conditions(&order)
    }

    /// Step indices in execution order.
    ///
    /// Topological over `depends_on`, choosing the earliest-defined ready
    /// step each time, so a workflow without dependencies runs in definition
    /// order.
    pub fn execution_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut pending_deps = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dependency in &step.depends_on {
                if dependency == &step.id {
                    return Err(Error::unresolved_branching(format!(
                        "Step '{}' depends on itself",
                        step.id
                    )));
                }
                let &j = index.get(dependency.as_str()).ok_or_else(|| {
                    Error::unresolved_branching(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.id, dependency
                    ))
                })?;
                pending_deps[i] += 1;
                dependents[j].push(i);
            }
        }

        let mut order = Vec::with_capacity(self.steps.len());
        let mut done = vec![false; self.steps.len()];
        while order.len() < self.steps.len() {
            let next = (0..self.steps.len()).find(|&i| !done[i] && pending_deps[i] == 0);
            let Some(i) = next else {
                let stuck: Vec<&str> = (0..self.steps.len())
                    .filter(|&i| !done[i])
                    .map(|i| self.steps[i].id.as_str())
                    .collect();
                return Err(Error::unresolved_branching(format!(
                    "Dependency cycle between steps: {}",
                    stuck.join(", ")
                )));
            };
            done[i] = true;
            order.push(i);
            for &dependent in &dependents[i] {
                pending_deps[dependent] -= 1;
            }
        }
        Ok(order)
    }

    fn validate_conditions(&self, order: &[usize]) -> Result<()> {
        let mut earlier: HashSet<&str> = HashSet::new();
        for &i in order {
            let step = &self.steps[i];
            for condition in &step.conditions {
                let mut segments = condition.field.split('.');
                match segments.next() {
                    Some("input") => {}
                    Some("output") => {
                        let referenced = segments.next().unwrap_or_default();
                        if !earlier.contains(referenced) {
                            return Err(Error::unresolved_branching(format!(
                                "Condition on step '{}' reads output of '{}', which does not run before it",
                                step.id, referenced
                            )));
                        }
                    }
                    _ => {
                        return Err(Error::unresolved_branching(format!(
                            "Condition field '{}' on step '{}' must start with 'input.' or 'output.'",
                            condition.field, step.id
                        )));
                    }
                }
            }
            earlier.insert(step.id.as_str());
        }
        Ok(())
    }
}

/// Builder for constructing WorkflowDefinition instances with validation
#[derive(Debug, Clone, Default)]
pub struct WorkflowDefinitionBuilder {
    name: Option<String>,
    steps: Vec<WorkflowStep>,
    triggers: Vec<String>,
    retry_policy: Option<RetryPolicy>,
    timeout_ms: Option<u64>,
    version: Option<u32>,
}

impl WorkflowDefinitionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps<I: IntoIterator<Item = WorkflowStep>>(mut self, steps: I) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn trigger<S: Into<String>>(mut self, trigger: S) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Build and validate the definition
    pub fn build(self) -> Result<WorkflowDefinition> {
        let name = self
            .name
            .ok_or_else(|| Error::validation("Workflow name is required"))?;
        let now = Utc::now();
        let definition = WorkflowDefinition {
            id: Uuid::new_v4(),
            name,
            steps: self.steps,
            triggers: self.triggers,
            retry_policy: self.retry_policy.unwrap_or_default(),
            timeout_ms: self.timeout_ms.unwrap_or_else(default_timeout_ms),
            version: self.version.unwrap_or_else(default_workflow_version),
            created_at: now,
            updated_at: now,
        };
        definition.validate()?;
        Ok(definition)
    }
}
