//! Registered workflow definitions
//!
//! Definitions are validated once on registration, their step order is
//! resolved, and they are immutable afterwards.

use agent_fleet_core::workflow::{WorkflowDefinition, WorkflowStep};
use agent_fleet_core::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A validated definition together with its resolved step order
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWorkflow {
    pub definition: WorkflowDefinition,
    /// Indices into `definition.steps`, dependencies first
    pub order: Vec<usize>,
}

impl ResolvedWorkflow {
    /// Steps in the order they are run
    pub fn ordered_steps(&self) -> impl Iterator<Item = &WorkflowStep> + '_ {
        self.order
            .iter()
            .filter_map(|index| self.definition.steps.get(*index))
    }
}

/// In-memory store of workflow definitions
#[derive(Debug, Default)]
pub struct WorkflowStore {
    workflows: RwLock<HashMap<Uuid, Arc<ResolvedWorkflow>>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition.
    ///
    /// Broken dependency graphs and conditions fail with
    /// `Error::UnresolvedBranching`; an id that is already taken fails with
    /// `Error::ConstraintViolation`.
    pub fn register(&self, definition: WorkflowDefinition) -> Result<Uuid> {
        definition.validate()?;
        let order = definition.execution_order()?;
        let id = definition.id;

        let mut workflows = self.workflows.write();
        if workflows.contains_key(&id) {
            return Err(Error::constraint_violation(
                "workflow_id",
                format!("Workflow {} is already registered", id),
            ));
        }
        info!(
            "Registered workflow '{}' ({}, {} steps, version {})",
            definition.name,
            id,
            definition.steps.len(),
            definition.version
        );
        workflows.insert(id, Arc::new(ResolvedWorkflow { definition, order }));
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<WorkflowDefinition> {
        self.workflows
            .read()
            .get(&id)
            .map(|workflow| workflow.definition.clone())
    }

    /// All definitions, oldest first
    pub fn list(&self) -> Vec<WorkflowDefinition> {
        let mut definitions: Vec<WorkflowDefinition> = self
            .workflows
            .read()
            .values()
            .map(|workflow| workflow.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        definitions
    }

    pub fn len(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.read().is_empty()
    }

    pub(crate) fn resolve(&self, id: Uuid) -> Result<Arc<ResolvedWorkflow>> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::DefinitionNotFound { workflow_id: id })
    }
}
