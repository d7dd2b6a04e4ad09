// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow definitions: steps, dependencies, disciplines, and validation.

use crate::condition::Condition;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Scheduling discipline for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    /// Steps execute one after another in dependency order.
    #[default]
    Sequential,
    /// All steps launch concurrently.
    Parallel,
    /// Dependency-ordered groups, concurrent within a group.
    Pipeline,
    /// Voting steps run concurrently, then the aggregation step.
    Consensus,
    /// Dependency order with per-step condition gating.
    Conditional,
}

/// Gating mode of a step dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyCondition {
    /// Satisfied once the upstream step completed successfully.
    #[default]
    Success,
    /// Satisfied once the upstream step completed or failed.
    Completion,
}

/// A declared prerequisite between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDependency {
    /// Upstream step id.
    pub step_id: String,
    /// Gating mode.
    #[serde(default)]
    pub condition: DependencyCondition,
    /// Unsatisfied non-required dependencies are ignored.
    #[serde(default = "default_true")]
    pub required: bool,
}

impl StepDependency {
    /// A required success dependency on `step_id`.
    pub fn success(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            condition: DependencyCondition::Success,
            required: true,
        }
    }

    /// A non-required completion dependency on `step_id`.
    pub fn completion_optional(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            condition: DependencyCondition::Completion,
            required: false,
        }
    }
}

/// A single unit of work: one function invocation on one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the workflow.
    pub step_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Agent the step is dispatched to.
    pub agent_id: String,
    /// Function invoked on the agent.
    pub function_name: String,
    /// Parameter template; string leaves may carry `${...}` references.
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub dependencies: Vec<StepDependency>,
    /// Optional execution condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Whether the step may share a pipeline group with siblings.
    #[serde(default = "default_true")]
    pub parallel_allowed: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Per-step retry budget; 0 defers to the workflow default.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    /// A failure of this step alone does not fail the execution.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl WorkflowStep {
    /// Creates a step with default execution settings.
    pub fn new(
        step_id: impl Into<String>,
        name: impl Into<String>,
        agent_id: impl Into<String>,
        function_name: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            name: name.into(),
            description: String::new(),
            agent_id: agent_id.into(),
            function_name: function_name.into(),
            parameters: Value::Null,
            dependencies: Vec::new(),
            condition: None,
            parallel_allowed: true,
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
            continue_on_error: false,
        }
    }

    /// Sets the parameter template.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Adds a dependency.
    pub fn with_dependency(mut self, dependency: StepDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Sets the execution condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Workflow-level error handling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default = "default_true")]
    pub retry_on_failure: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub use_fallback_agent: bool,
    #[serde(default)]
    pub fallback_agent_id: String,
    #[serde(default)]
    pub fallback_parameters: Value,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            retry_on_failure: true,
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
            continue_on_error: false,
            use_fallback_agent: false,
            fallback_agent_id: String::new(),
            fallback_parameters: Value::Null,
        }
    }
}

/// Workflow execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Wall-clock budget for one execution.
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time_seconds: u64,
    /// Concurrent step bound within one execution.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
    #[serde(default = "default_true")]
    pub persist_state: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_execution_time_seconds: default_max_execution_time(),
            max_concurrent_steps: default_max_concurrent_steps(),
            auto_cleanup: true,
            persist_state: true,
        }
    }
}

/// A declarative, reusable description of a step DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Stable identifier, unique within the registry.
    pub workflow_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub discipline: Discipline,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Initial global variables of every execution.
    #[serde(default)]
    pub global_context: HashMap<String, Value>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Creates an empty workflow with default settings.
    pub fn new(workflow_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            name: name.into(),
            description: String::new(),
            discipline: Discipline::Sequential,
            steps: Vec::new(),
            global_context: HashMap::new(),
            error_handling: ErrorHandling::default(),
            settings: WorkflowSettings::default(),
            created_time: None,
        }
    }

    /// Looks up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Validates structural invariants.
    ///
    /// Cycle detection lives in the dependency resolver; the registry runs
    /// both on insert.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::Validation("workflow name is empty".into()));
        }
        if self.settings.max_concurrent_steps < 1 {
            return Err(EngineError::Validation(
                "max_concurrent_steps must be at least 1".into(),
            ));
        }
        if self.settings.max_execution_time_seconds == 0 {
            return Err(EngineError::Validation(
                "max_execution_time must be greater than zero".into(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.step_id.is_empty() {
                return Err(EngineError::Validation("step id is empty".into()));
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step id: {}",
                    step.step_id
                )));
            }
            if step.agent_id.is_empty() {
                return Err(EngineError::Validation(format!(
                    "step {} has no agent_id",
                    step.step_id
                )));
            }
            if step.function_name.is_empty() {
                return Err(EngineError::Validation(format!(
                    "step {} has no function",
                    step.step_id
                )));
            }
        }
        for step in &self.steps {
            for dep in &step.dependencies {
                if !seen.contains(dep.step_id.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "step {} depends on unknown step {}",
                        step.step_id, dep.step_id
                    )));
                }
                if dep.step_id == step.step_id {
                    return Err(EngineError::CyclicDependency {
                        cycle_hint: Some(step.step_id.clone()),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Fluent constructor for workflow definitions.
pub struct WorkflowBuilder {
    workflow: Workflow,
}

impl WorkflowBuilder {
    pub fn new(workflow_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow: Workflow::new(workflow_id, name),
        }
    }

    pub fn discipline(mut self, discipline: Discipline) -> Self {
        self.workflow.discipline = discipline;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.workflow.description = description.into();
        self
    }

    pub fn global(mut self, key: impl Into<String>, value: Value) -> Self {
        self.workflow.global_context.insert(key.into(), value);
        self
    }

    pub fn max_execution_time(mut self, seconds: u64) -> Self {
        self.workflow.settings.max_execution_time_seconds = seconds;
        self
    }

    pub fn max_concurrent_steps(mut self, bound: usize) -> Self {
        self.workflow.settings.max_concurrent_steps = bound;
        self
    }

    pub fn error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.workflow.error_handling = error_handling;
        self
    }

    pub fn continue_on_error(mut self, allow: bool) -> Self {
        self.workflow.error_handling.continue_on_error = allow;
        self
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.workflow.steps.push(step);
        self
    }

    pub fn build(self) -> Workflow {
        self.workflow
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    1
}

fn default_max_execution_time() -> u64 {
    300
}

fn default_max_concurrent_steps() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_accepts_minimal_workflow() {
        let workflow = WorkflowBuilder::new("wf-1", "minimal")
            .step(WorkflowStep::new("s1", "Step 1", "agent-a", "run"))
            .build();

        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn test_validate_accepts_empty_steps() {
        let workflow = Workflow::new("wf-empty", "no steps");
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_step_ids() {
        let workflow = WorkflowBuilder::new("wf-dup", "dup")
            .step(WorkflowStep::new("s1", "A", "agent-a", "run"))
            .step(WorkflowStep::new("s1", "B", "agent-b", "run"))
            .build();

        match workflow.validate() {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let workflow = WorkflowBuilder::new("wf-dep", "dep")
            .step(
                WorkflowStep::new("s1", "A", "agent-a", "run")
                    .with_dependency(StepDependency::success("missing")),
            )
            .build();

        assert!(workflow.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let workflow = WorkflowBuilder::new("wf-self", "self")
            .step(
                WorkflowStep::new("s1", "A", "agent-a", "run")
                    .with_dependency(StepDependency::success("s1")),
            )
            .build();

        assert!(matches!(
            workflow.validate(),
            Err(EngineError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut workflow = Workflow::new("wf-conc", "conc");
        workflow.settings.max_concurrent_steps = 0;
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn test_discipline_wire_names() {
        assert_eq!(
            serde_json::to_value(Discipline::Consensus).unwrap(),
            json!("consensus")
        );
        let parsed: Discipline = serde_json::from_value(json!("pipeline")).unwrap();
        assert_eq!(parsed, Discipline::Pipeline);
    }

    #[test]
    fn test_step_defaults() {
        let step = WorkflowStep::new("s1", "Step 1", "agent-a", "run");
        assert_eq!(step.timeout_seconds, 30);
        assert_eq!(step.max_retries, 3);
        assert_eq!(step.retry_delay_seconds, 1);
        assert!(step.parallel_allowed);
        assert!(!step.continue_on_error);
    }
}
