// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-execution runtime state.

use crate::condition::ConditionSource;
use crate::workflow::Workflow;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecStatus {
    /// Terminal statuses are immutable except for migration to history.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecStatus::Completed | ExecStatus::Failed | ExecStatus::Cancelled | ExecStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecStatus::Pending => "pending",
            ExecStatus::Running => "running",
            ExecStatus::Paused => "paused",
            ExecStatus::Completed => "completed",
            ExecStatus::Failed => "failed",
            ExecStatus::Cancelled => "cancelled",
            ExecStatus::Timeout => "timeout",
        }
    }
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Retrying => "retrying",
        }
    }
}

/// Runtime record of one step within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            retry_count: 0,
            output: None,
            error_message: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// A single run of a workflow. Doubles as the persistence snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecStatus,
    #[serde(default)]
    pub global_variables: HashMap<String, Value>,
    #[serde(default)]
    pub step_outputs: HashMap<String, Value>,
    #[serde(default)]
    pub step_states: HashMap<String, StepState>,
    #[serde(default)]
    pub current_step_id: String,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub failed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub progress_percentage: f64,
}

impl Execution {
    /// Seeds a pending execution: step states pending, globals from the
    /// workflow's context merged with the per-execution input (input wins).
    pub fn new(execution_id: String, workflow: &Workflow, input: HashMap<String, Value>) -> Self {
        let mut global_variables = workflow.global_context.clone();
        global_variables.extend(input);

        let step_states = workflow
            .steps
            .iter()
            .map(|step| (step.step_id.clone(), StepState::default()))
            .collect();

        Self {
            execution_id,
            workflow_id: workflow.workflow_id.clone(),
            status: ExecStatus::Pending,
            global_variables,
            step_outputs: HashMap::new(),
            step_states,
            current_step_id: String::new(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            start_time: None,
            end_time: None,
            error_message: String::new(),
            progress_percentage: 0.0,
        }
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_states.get(step_id).map(|s| s.status)
    }

    /// Recomputes progress as terminal steps over total. Monotonic until the
    /// terminal transition; an empty workflow is 100% done.
    pub fn update_progress(&mut self) {
        let total = self.step_states.len();
        let next = if total == 0 {
            100.0
        } else {
            let terminal = self
                .step_states
                .values()
                .filter(|s| s.status.is_terminal())
                .count();
            terminal as f64 / total as f64 * 100.0
        };
        if next > self.progress_percentage {
            self.progress_percentage = next;
        }
    }

    /// Marks every still-pending step skipped. Used when the execution
    /// reaches a terminal status with steps that will never run.
    pub fn skip_remaining_steps(&mut self) {
        for state in self.step_states.values_mut() {
            if !state.status.is_terminal() {
                state.status = StepStatus::Skipped;
            }
        }
        self.update_progress();
    }

    /// Builds the aggregate failure message: step-scoped reasons in step-id
    /// order, truncated.
    pub fn aggregate_error_message(&self) -> String {
        const MAX_LEN: usize = 512;

        let mut failed: Vec<&String> = self.failed_steps.iter().collect();
        failed.sort();
        failed.dedup();

        let mut message = String::new();
        for step_id in failed {
            let reason = self
                .step_states
                .get(step_id.as_str())
                .and_then(|s| s.error_message.as_deref())
                .unwrap_or("unknown error");
            if !message.is_empty() {
                message.push_str("; ");
            }
            message.push_str(&format!("step '{}': {}", step_id, reason));
            if message.len() > MAX_LEN {
                message.truncate(MAX_LEN);
                message.push_str("...");
                break;
            }
        }
        message
    }

    /// Duration in milliseconds, when both endpoints are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

impl ConditionSource for Execution {
    fn global(&self, name: &str) -> Option<Value> {
        self.global_variables.get(name).cloned()
    }

    fn step_output(&self, step_id: &str) -> Option<Value> {
        self.step_outputs.get(step_id).cloned()
    }

    fn step_status(&self, step_id: &str) -> Option<String> {
        self.step_states
            .get(step_id)
            .map(|s| s.status.as_str().to_string())
    }
}

/// Shared handle to one execution's state.
///
/// The record is mutated only by the worker owning the execution; status
/// reads for pause/cancel/list go through the same lock. The token carries
/// the cancellation signal into in-flight steps and retry sleeps.
pub struct ExecutionHandle {
    state: Mutex<Execution>,
    cancel: CancellationToken,
}

/// Arc-wrapped execution handle.
pub type ExecutionRef = Arc<ExecutionHandle>;

impl ExecutionHandle {
    pub fn new(execution: Execution) -> ExecutionRef {
        Arc::new(Self {
            state: Mutex::new(execution),
            cancel: CancellationToken::new(),
        })
    }

    /// Runs `f` with shared access to the record. The lock is never held
    /// across an await point.
    pub fn with<R>(&self, f: impl FnOnce(&Execution) -> R) -> R {
        f(&self.state.lock())
    }

    /// Runs `f` with exclusive access to the record.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Execution) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn snapshot(&self) -> Execution {
        self.state.lock().clone()
    }

    pub fn status(&self) -> ExecStatus {
        self.state.lock().status
    }

    pub fn execution_id(&self) -> String {
        self.state.lock().execution_id.clone()
    }

    pub fn workflow_id(&self) -> String {
        self.state.lock().workflow_id.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signals cancellation to the in-flight step and any retry sleep.
    pub fn trigger_cancel(&self) {
        self.cancel.cancel();
    }
}
