// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-execution lifecycle: state machine, wall-time deadline, finalization.

use crate::context::{ExecStatus, ExecutionRef, StepStatus};
use crate::dag::WorkflowDag;
use crate::executor::StepExecutor;
use crate::scheduler::{ScheduleOutcome, Scheduler};
use crate::workflow::Workflow;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Grace period for an in-flight step to observe the cancel signal.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// What the worker should do with the execution afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerOutcome {
    /// The execution reached a terminal status; move it to history.
    Terminal,
    /// The execution paused; it stays active with no owning worker.
    Paused,
}

/// Runs one execution from its current state to pause or a terminal status.
pub struct ExecutionController {
    scheduler: Scheduler,
}

impl ExecutionController {
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self {
            scheduler: Scheduler::new(executor),
        }
    }

    pub async fn run(&self, workflow: Arc<Workflow>, execution: ExecutionRef) -> ControllerOutcome {
        match execution.status() {
            ExecStatus::Cancelled => {
                // Cancelled while queued; nothing ever ran.
                finalize(&execution, ExecStatus::Cancelled, "execution cancelled");
                return ControllerOutcome::Terminal;
            }
            ExecStatus::Paused => return ControllerOutcome::Paused,
            _ => {}
        }

        let dag = match WorkflowDag::from_workflow(&workflow) {
            Ok(dag) => dag,
            Err(err) => {
                // The registry validates on insert; reaching this means the
                // definition mutated underneath us.
                finalize(&execution, ExecStatus::Failed, &err.to_string());
                return ControllerOutcome::Terminal;
            }
        };

        let start_time = execution.with_mut(|exec| {
            exec.status = ExecStatus::Running;
            *exec.start_time.get_or_insert_with(Utc::now)
        });
        info!(
            execution_id = %execution.execution_id(),
            workflow_id = %workflow.workflow_id,
            discipline = ?workflow.discipline,
            "Execution running"
        );

        let budget = Duration::from_secs(workflow.settings.max_execution_time_seconds);
        let elapsed = (Utc::now() - start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let remaining = budget.saturating_sub(elapsed);

        let cancel = execution.cancel_token().clone();
        let scheduled = self.scheduler.run(workflow.clone(), &dag, &execution);
        tokio::pin!(scheduled);

        let outcome = tokio::select! {
            outcome = &mut scheduled => outcome,
            _ = cancel.cancelled() => {
                // Let the in-flight step observe the signal and settle.
                let _ = timeout(CANCEL_GRACE, &mut scheduled).await;
                ScheduleOutcome::Cancelled
            }
            _ = tokio::time::sleep(remaining) => {
                warn!(
                    execution_id = %execution.execution_id(),
                    budget_seconds = workflow.settings.max_execution_time_seconds,
                    "Execution exceeded wall-time budget"
                );
                execution.with_mut(|exec| exec.status = ExecStatus::Timeout);
                execution.trigger_cancel();
                let _ = timeout(CANCEL_GRACE, &mut scheduled).await;
                ScheduleOutcome::Finished
            }
        };

        if execution.status() == ExecStatus::Timeout {
            let message = format!(
                "execution timed out after {}s",
                workflow.settings.max_execution_time_seconds
            );
            finalize(&execution, ExecStatus::Timeout, &message);
            return ControllerOutcome::Terminal;
        }

        match outcome {
            ScheduleOutcome::Paused => {
                info!(execution_id = %execution.execution_id(), "Execution paused");
                ControllerOutcome::Paused
            }
            ScheduleOutcome::Cancelled => {
                finalize(&execution, ExecStatus::Cancelled, "execution cancelled");
                ControllerOutcome::Terminal
            }
            ScheduleOutcome::Finished => {
                let status = execution.status();
                if status == ExecStatus::Failed {
                    let message = execution.with(|exec| exec.aggregate_error_message());
                    let message = if message.is_empty() {
                        "workflow execution failed".to_string()
                    } else {
                        message
                    };
                    finalize(&execution, ExecStatus::Failed, &message);
                } else if status == ExecStatus::Cancelled {
                    finalize(&execution, ExecStatus::Cancelled, "execution cancelled");
                } else {
                    finalize(&execution, ExecStatus::Completed, "");
                }
                ControllerOutcome::Terminal
            }
        }
    }
}

/// Settles the record into a terminal status: in-flight steps fail with the
/// cancel message, unreached steps are skipped, the end time is stamped.
fn finalize(execution: &ExecutionRef, status: ExecStatus, message: &str) {
    execution.with_mut(|exec| {
        exec.status = status;
        if exec.error_message.is_empty() && !message.is_empty() {
            exec.error_message = message.to_string();
        }

        if matches!(status, ExecStatus::Cancelled | ExecStatus::Timeout) {
            let mut newly_failed = Vec::new();
            for (step_id, state) in exec.step_states.iter_mut() {
                if matches!(state.status, StepStatus::Running | StepStatus::Retrying) {
                    state.status = StepStatus::Failed;
                    state.error_message = Some("execution cancelled".to_string());
                    state.end_time = Some(Utc::now());
                    newly_failed.push(step_id.clone());
                }
            }
            exec.failed_steps.extend(newly_failed);
        }

        exec.skip_remaining_steps();
        exec.end_time = Some(Utc::now());
    });
    info!(
        execution_id = %execution.execution_id(),
        status = status.as_str(),
        "Execution finished"
    );
}
