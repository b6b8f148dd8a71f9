//! Error types for the fleet domain

use thiserror::Error;
use uuid::Uuid;

/// Core error type for fleet and workflow operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("UUID parsing error: {0}")]
    UuidParse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("State transition error: {message}")]
    StateTransition { message: String },

    #[error("Constraint violation: {constraint} - {message}")]
    ConstraintViolation { constraint: String, message: String },

    #[error("Resource exhausted: {resource} - {message}")]
    ResourceExhausted { resource: String, message: String },

    #[error("Agent call failed on instance {instance_id}: {message}")]
    AgentCallFailed { instance_id: Uuid, message: String },

    #[error("Timeout exceeded: {operation} exceeded {timeout_ms}ms")]
    TimeoutExceeded { operation: String, timeout_ms: u64 },

    #[error("Workflow definition not found: {workflow_id}")]
    DefinitionNotFound { workflow_id: Uuid },

    #[error("Unresolved branching: {message}")]
    UnresolvedBranching { message: String },

    #[error("Execution {execution_id} was cancelled")]
    Cancelled { execution_id: Uuid },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Error::UuidParse(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration {
            message: err.to_string(),
        }
    }
}

impl Error {
    /// Create a validation error with a formatted message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific entity type and ID
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(message: S) -> Self {
        Self::StateTransition {
            message: message.into(),
        }
    }

    /// Create a constraint violation error
    pub fn constraint_violation<S1: Into<String>, S2: Into<String>>(
        constraint: S1,
        message: S2,
    ) -> Self {
        Self::ConstraintViolation {
            constraint: constraint.into(),
            message: message.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted<S1: Into<String>, S2: Into<String>>(
        resource: S1,
        message: S2,
    ) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create an agent call failure for the given instance
    pub fn agent_call_failed<S: Into<String>>(instance_id: Uuid, message: S) -> Self {
        Self::AgentCallFailed {
            instance_id,
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::TimeoutExceeded {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an unresolved branching error
    pub fn unresolved_branching<S: Into<String>>(message: S) -> Self {
        Self::UnresolvedBranching {
            message: message.into(),
        }
    }

    /// Check if this error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::DefinitionNotFound { .. }
        )
    }

    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimeoutExceeded { .. })
    }

    /// Whether a step attempt that failed with this error may be retried.
    ///
    /// Only dispatch-time exhaustion and collaborator failures are absorbed
    /// by the step retry loop; deadlines and cancellation surface directly.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted { .. } | Error::AgentCallFailed { .. }
        )
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Serialization(_) => "serialization",
            Error::UuidParse(_) => "uuid_parse",
            Error::Internal(_) => "internal",
            Error::Configuration { .. } => "configuration",
            Error::StateTransition { .. } => "state_transition",
            Error::ConstraintViolation { .. } => "constraint_violation",
            Error::ResourceExhausted { .. } => "resource_exhausted",
            Error::AgentCallFailed { .. } => "agent_call_failed",
            Error::TimeoutExceeded { .. } => "timeout_exceeded",
            Error::DefinitionNotFound { .. } => "definition_not_found",
            Error::UnresolvedBranching { .. } => "unresolved_branching",
            Error::Cancelled { .. } => "cancelled",
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
