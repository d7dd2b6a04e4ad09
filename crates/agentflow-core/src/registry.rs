// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory workflow definition store.

use crate::dag::WorkflowDag;
use crate::error::{EngineError, Result};
use crate::workflow::Workflow;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Registry of workflow definitions, serialized under one mutex.
///
/// The engine layers the active-execution guards on top; the registry itself
/// only knows definitions.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: Mutex<HashMap<String, Arc<Workflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a definition, assigning an id when absent.
    /// Cyclic definitions are refused and not stored.
    pub fn create(&self, mut workflow: Workflow) -> Result<String> {
        if workflow.workflow_id.is_empty() {
            workflow.workflow_id = format!("wf-{}", Uuid::new_v4().simple());
        }
        workflow.created_time = Some(Utc::now());
        workflow.validate()?;
        WorkflowDag::from_workflow(&workflow)?;

        let mut workflows = self.workflows.lock();
        if workflows.contains_key(&workflow.workflow_id) {
            return Err(EngineError::Validation(format!(
                "workflow id already registered: {}",
                workflow.workflow_id
            )));
        }
        let workflow_id = workflow.workflow_id.clone();
        info!(workflow_id = %workflow_id, name = %workflow.name, "Workflow created");
        workflows.insert(workflow_id.clone(), Arc::new(workflow));
        Ok(workflow_id)
    }

    /// Replaces a definition, keeping the original creation time.
    pub fn update(&self, workflow_id: &str, mut workflow: Workflow) -> Result<()> {
        workflow.workflow_id = workflow_id.to_string();
        workflow.validate()?;
        WorkflowDag::from_workflow(&workflow)?;

        let mut workflows = self.workflows.lock();
        let existing = workflows
            .get(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        workflow.created_time = existing.created_time;
        workflows.insert(workflow_id.to_string(), Arc::new(workflow));
        info!(workflow_id = %workflow_id, "Workflow updated");
        Ok(())
    }

    pub fn delete(&self, workflow_id: &str) -> Result<()> {
        let mut workflows = self.workflows.lock();
        workflows
            .remove(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        info!(workflow_id = %workflow_id, "Workflow deleted");
        Ok(())
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.lock().get(workflow_id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workflows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.lock().is_empty()
    }
}
