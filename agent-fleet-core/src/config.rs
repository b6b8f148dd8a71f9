//! Fleet configuration model and loading
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional file (TOML, JSON or YAML, picked by extension), then environment
//! variables prefixed with `AGENT_FLEET` using `__` as the section separator.
//!
//! # Examples
//!
//! ```rust
//! use agent_fleet_core::config::*;
//!
//! let config = FleetConfig::default();
//! assert_eq!(config.load_balancing.strategy, LoadBalancingStrategy::LeastLoaded);
//! assert!(config.validate().is_ok());
//! ```
//!
//! Overriding a value from the environment:
//!
//! ```text
//! AGENT_FLEET__HEALTH_CHECK__TIMEOUT_MS=10000
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "AGENT_FLEET";

/// Top-level configuration for a fleet manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub health_check: HealthCheckConfig,
    pub auto_scaling: AutoScalingConfig,
    pub load_balancing: LoadBalancingConfig,
    pub workflow: WorkflowEngineConfig,
}

/// Heartbeat staleness detection and recovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Time between health sweeps
    pub interval_ms: u64,
    /// Heartbeat age after which an instance is considered stale
    pub timeout_ms: u64,
    /// Delay between a recovery attempt and its re-check
    pub recovery_window_ms: u64,
    /// Consecutive failures after which an instance is marked as errored
    pub max_error_count: u32,
}

/// Auto-scaling policy thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoScalingConfig {
    pub enabled: bool,
    /// Time between scaling evaluations
    pub cooldown_period_ms: u64,
    /// Average utilization (0.0-1.0) above which a type is scaled up
    pub scale_up_threshold: f64,
    /// Average utilization (0.0-1.0) below which a type is scaled down
    pub scale_down_threshold: f64,
    pub min_instances_per_type: usize,
    pub max_instances_per_type: usize,
}

/// Instance selection policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub strategy: LoadBalancingStrategy,
}

/// Workflow engine tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowEngineConfig {
    /// Base delay multiplied by `backoff_multiplier^retry` between attempts
    pub base_backoff_ms: u64,
    /// Agent call deadline for steps without their own timeout
    pub default_step_timeout_ms: u64,
    /// Buffer size of the fleet event broadcast channel
    pub event_channel_capacity: usize,
}

/// Load balancing strategies for instance selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Uniform random pick among eligible instances. The name is kept for
    /// compatibility; use `Sequential` for an actual rotation.
    RoundRobin,
    /// Rotating cursor over eligible instances, per capability type
    Sequential,
    #[default]
    LeastLoaded,
    FastestResponse,
    CostOptimized,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::Sequential => "sequential",
            LoadBalancingStrategy::LeastLoaded => "least_loaded",
            LoadBalancingStrategy::FastestResponse => "fastest_response",
            LoadBalancingStrategy::CostOptimized => "cost_optimized",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "sequential" => Ok(LoadBalancingStrategy::Sequential),
            "least_loaded" => Ok(LoadBalancingStrategy::LeastLoaded),
            "fastest_response" => Ok(LoadBalancingStrategy::FastestResponse),
            "cost_optimized" => Ok(LoadBalancingStrategy::CostOptimized),
            other => Err(Error::configuration(format!(
                "Unknown load balancing strategy '{}'",
                other
            ))),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            timeout_ms: 30_000,
            recovery_window_ms: 30_000,
            max_error_count: 5,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms)
    }
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_period_ms: 60_000,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            min_instances_per_type: 1,
            max_instances_per_type: 10,
        }
    }
}

impl AutoScalingConfig {
    pub fn cooldown_period(&self) -> Duration {
        Duration::from_millis(self.cooldown_period_ms)
    }
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            default_step_timeout_ms: 300_000, // 5 minutes
            event_channel_capacity: 256,
        }
    }
}

impl FleetConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&FleetConfig::default())?);

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::configuration(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: FleetConfig = settings.try_deserialize()?;
        config.validate()?;
        debug!(
            "Loaded fleet configuration (file: {:?}, strategy: {})",
            path, config.load_balancing.strategy
        );
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.health_check.interval_ms == 0 {
            return Err(Error::configuration(
                "health_check.interval_ms must be greater than zero",
            ));
        }
        if self.health_check.timeout_ms == 0 {
            return Err(Error::configuration(
                "health_check.timeout_ms must be greater than zero",
            ));
        }
        if self.auto_scaling.cooldown_period_ms == 0 {
            return Err(Error::configuration(
                "auto_scaling.cooldown_period_ms must be greater than zero",
            ));
        }

        let scaling = &self.auto_scaling;
        for (name, value) in [
            ("scale_up_threshold", scaling.scale_up_threshold),
            ("scale_down_threshold", scaling.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::configuration(format!(
                    "auto_scaling.{} must be within [0.0, 1.0], got {}",
                    name, value
                )));
            }
        }
        if scaling.scale_down_threshold >= scaling.scale_up_threshold {
            return Err(Error::configuration(
                "auto_scaling.scale_down_threshold must be lower than scale_up_threshold",
            ));
        }
        if scaling.max_instances_per_type == 0 {
            return Err(Error::configuration(
                "auto_scaling.max_instances_per_type must be greater than zero",
            ));
        }
        if scaling.min_instances_per_type > scaling.max_instances_per_type {
            return Err(Error::configuration(format!(
                "auto_scaling.min_instances_per_type ({}) exceeds max_instances_per_type ({})",
                scaling.min_instances_per_type, scaling.max_instances_per_type
            )));
        }
        if self.workflow.event_channel_capacity == 0 {
            return Err(Error::configuration(
                "workflow.event_channel_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health_check.recovery_window(), Duration::from_secs(30));
        assert_eq!(config.workflow.base_backoff_ms, 1_000);
    }

    #[test]
    fn test_threshold_validation() {
        let mut config = FleetConfig::default();
        config.auto_scaling.scale_down_threshold = 0.9;
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration { .. })
        ));

        let mut config = FleetConfig::default();
        config.auto_scaling.scale_up_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.auto_scaling.min_instances_per_type = 4;
        config.auto_scaling.max_instances_per_type = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = FleetConfig::default();
        config.health_check.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "fastest-response".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::FastestResponse
        );
        assert_eq!(
            "round_robin".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::RoundRobin
        );
        assert!("weighted".parse::<LoadBalancingStrategy>().is_err());
        assert_eq!(LoadBalancingStrategy::CostOptimized.to_string(), "cost_optimized");
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("Failed to create temp file");
        writeln!(
            file,
            r#"
[health_check]
timeout_ms = 10000

[load_balancing]
strategy = "fastest_response"

[auto_scaling]
max_instances_per_type = 3
"#
        )
        .unwrap();

        let config = FleetConfig::load(Some(file.path())).expect("Failed to load config");
        assert_eq!(config.health_check.timeout_ms, 10_000);
        // Untouched keys keep their defaults
        assert_eq!(config.health_check.interval_ms, 5_000);
        assert_eq!(
            config.load_balancing.strategy,
            LoadBalancingStrategy::FastestResponse
        );
        assert_eq!(config.auto_scaling.max_instances_per_type, 3);
    }

    #[test]
    fn test_load_missing_file() {
        let result = FleetConfig::load(Some(Path::new("/nonexistent/fleet.toml")));
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
