// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! YAML workflow documents.
//!
//! Field names follow the document schema (`type`, `function`, `timeout`,
//! `retry_delay`, `depends_on`); unknown fields are ignored, missing
//! required fields fail the load with a diagnostic naming the file and the
//! document path.

use crate::condition::Condition;
use crate::error::{EngineError, Result};
use crate::workflow::{
    Discipline, ErrorHandling, StepDependency, Workflow, WorkflowSettings, WorkflowStep,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct WorkflowDoc {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "type")]
    discipline: Discipline,
    #[serde(default)]
    global_context: HashMap<String, Value>,
    #[serde(default)]
    settings: SettingsDoc,
    #[serde(default)]
    error_handling: ErrorHandling,
    steps: Vec<StepDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsDoc {
    #[serde(default)]
    max_execution_time: Option<u64>,
    #[serde(default)]
    max_concurrent_steps: Option<usize>,
    #[serde(default)]
    auto_cleanup: Option<bool>,
    #[serde(default)]
    persist_state: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StepDoc {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    agent_id: String,
    function: String,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    depends_on: Vec<DependsOnDoc>,
    #[serde(default)]
    conditions: Option<Condition>,
    #[serde(default = "default_true")]
    parallel_allowed: bool,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_retry_delay")]
    retry_delay: u64,
    #[serde(default)]
    continue_on_error: bool,
}

/// `depends_on` entries: a bare step id means a required success dependency.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependsOnDoc {
    StepId(String),
    Full {
        step: String,
        #[serde(default)]
        condition: crate::workflow::DependencyCondition,
        #[serde(default = "default_true")]
        required: bool,
    },
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1
}

impl From<DependsOnDoc> for StepDependency {
    fn from(doc: DependsOnDoc) -> Self {
        match doc {
            DependsOnDoc::StepId(step_id) => StepDependency {
                step_id,
                condition: crate::workflow::DependencyCondition::Success,
                required: true,
            },
            DependsOnDoc::Full {
                step,
                condition,
                required,
            } => StepDependency {
                step_id: step,
                condition,
                required,
            },
        }
    }
}

impl From<WorkflowDoc> for Workflow {
    fn from(doc: WorkflowDoc) -> Self {
        let defaults = WorkflowSettings::default();
        Workflow {
            workflow_id: doc.id,
            name: doc.name,
            description: doc.description,
            discipline: doc.discipline,
            steps: doc.steps.into_iter().map(WorkflowStep::from).collect(),
            global_context: doc.global_context,
            error_handling: doc.error_handling,
            settings: WorkflowSettings {
                max_execution_time_seconds: doc
                    .settings
                    .max_execution_time
                    .unwrap_or(defaults.max_execution_time_seconds),
                max_concurrent_steps: doc
                    .settings
                    .max_concurrent_steps
                    .unwrap_or(defaults.max_concurrent_steps),
                auto_cleanup: doc.settings.auto_cleanup.unwrap_or(defaults.auto_cleanup),
                persist_state: doc.settings.persist_state.unwrap_or(defaults.persist_state),
            },
            created_time: None,
        }
    }
}

impl From<StepDoc> for WorkflowStep {
    fn from(doc: StepDoc) -> Self {
        WorkflowStep {
            step_id: doc.id,
            name: doc.name,
            description: doc.description,
            agent_id: doc.agent_id,
            function_name: doc.function,
            parameters: doc.parameters,
            dependencies: doc.depends_on.into_iter().map(StepDependency::from).collect(),
            condition: doc.conditions,
            parallel_allowed: doc.parallel_allowed,
            timeout_seconds: doc.timeout,
            max_retries: doc.max_retries,
            retry_delay_seconds: doc.retry_delay,
            continue_on_error: doc.continue_on_error,
        }
    }
}

/// Parses a workflow document. `source` names the origin in diagnostics.
pub fn parse_workflow_yaml(content: &str, source: &str) -> Result<Workflow> {
    let deserializer = serde_yaml::Deserializer::from_str(content);
    let doc: WorkflowDoc =
        serde_path_to_error::deserialize(deserializer).map_err(|err| EngineError::Load {
            file: source.to_string(),
            reason: format!("{} (at {})", err.inner(), err.path()),
        })?;
    Ok(Workflow::from(doc))
}

/// Loads one workflow definition from a YAML file.
pub fn load_workflow_from_file(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path).map_err(|err| EngineError::Load {
        file: path.display().to_string(),
        reason: err.to_string(),
    })?;
    parse_workflow_yaml(&content, &path.display().to_string())
}

/// Loads every `.yaml`/`.yml` workflow in a directory, registering each with
/// `register`. Per-file failures are logged and skipped; returns the number
/// of workflows loaded.
pub fn load_workflows_from_directory(
    dir: &Path,
    mut register: impl FnMut(Workflow) -> Result<String>,
) -> Result<usize> {
    let entries = std::fs::read_dir(dir).map_err(|err| EngineError::Load {
        file: dir.display().to_string(),
        reason: err.to_string(),
    })?;

    let mut loaded = 0usize;
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }
        match load_workflow_from_file(&path).and_then(&mut register) {
            Ok(workflow_id) => {
                info!(file = %path.display(), workflow_id = %workflow_id, "Loaded workflow");
                loaded += 1;
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "Skipping workflow file");
            }
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::DependencyCondition;
    use serde_json::json;

    const DOC: &str = r#"
id: research-pipeline
name: Research Pipeline
description: gather then summarize
type: pipeline
global_context:
  topic: rust
settings:
  max_execution_time: 120
  max_concurrent_steps: 2
error_handling:
  max_retries: 2
  continue_on_error: true
steps:
  - id: gather
    name: Gather
    agent_id: researcher
    function: search
    parameters:
      query: "${global.topic}"
  - id: summarize
    name: Summarize
    agent_id: writer
    function: summarize
    timeout: 45
    retry_delay: 3
    depends_on:
      - gather
      - { step: gather, condition: completion, required: false }
    conditions:
      expression: "steps.gather.status == 'completed'"
"#;

    #[test]
    fn test_parse_full_document() {
        let workflow = parse_workflow_yaml(DOC, "test.yaml").unwrap();
        assert_eq!(workflow.workflow_id, "research-pipeline");
        assert_eq!(workflow.discipline, Discipline::Pipeline);
        assert_eq!(workflow.settings.max_execution_time_seconds, 120);
        assert_eq!(workflow.settings.max_concurrent_steps, 2);
        assert!(workflow.settings.auto_cleanup);
        assert!(workflow.error_handling.continue_on_error);
        assert_eq!(workflow.error_handling.max_retries, 2);
        assert_eq!(workflow.global_context["topic"], json!("rust"));

        let gather = workflow.step("gather").unwrap();
        assert_eq!(gather.function_name, "search");
        assert_eq!(gather.timeout_seconds, 30);
        assert_eq!(gather.parameters["query"], json!("${global.topic}"));

        let summarize = workflow.step("summarize").unwrap();
        assert_eq!(summarize.timeout_seconds, 45);
        assert_eq!(summarize.retry_delay_seconds, 3);
        assert_eq!(summarize.dependencies.len(), 2);
        assert_eq!(summarize.dependencies[0].step_id, "gather");
        assert!(summarize.dependencies[0].required);
        assert_eq!(
            summarize.dependencies[0].condition,
            DependencyCondition::Success
        );
        assert_eq!(
            summarize.dependencies[1].condition,
            DependencyCondition::Completion
        );
        assert!(!summarize.dependencies[1].required);
        assert!(summarize.condition.is_some());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let doc = r#"
id: wf
name: W
novel_field: whatever
steps:
  - id: s1
    name: S1
    agent_id: a
    function: f
    another_unknown: 3
"#;
        let workflow = parse_workflow_yaml(doc, "test.yaml").unwrap();
        assert_eq!(workflow.steps.len(), 1);
    }

    #[test]
    fn test_missing_required_field_names_path() {
        let doc = r#"
id: wf
name: W
steps:
  - id: s1
    name: S1
    function: f
"#;
        let err = parse_workflow_yaml(doc, "broken.yaml").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("broken.yaml"), "message: {}", message);
        assert!(message.contains("agent_id"), "message: {}", message);
    }

    #[test]
    fn test_missing_steps_is_an_error() {
        let doc = "id: wf\nname: W\n";
        assert!(parse_workflow_yaml(doc, "empty.yaml").is_err());
    }

    #[test]
    fn test_directory_loading() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.yaml"),
            "id: wf-good\nname: Good\nsteps: []\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "name: no id\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registered = Vec::new();
        let loaded = load_workflows_from_directory(dir.path(), |workflow| {
            registered.push(workflow.workflow_id.clone());
            Ok(workflow.workflow_id)
        })
        .unwrap();

        assert_eq!(loaded, 1);
        assert_eq!(registered, ["wf-good"]);
    }
}
