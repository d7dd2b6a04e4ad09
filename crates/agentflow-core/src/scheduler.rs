// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discipline schedulers: sequential, parallel, pipeline, consensus,
//! conditional.
//!
//! Every scheduler checks the execution status at step boundaries, yields on
//! pause, stops on cancellation, and leaves terminal bookkeeping to the
//! execution controller.

use crate::context::{ExecStatus, ExecutionRef, StepStatus};
use crate::dag::WorkflowDag;
use crate::executor::{StepExecutor, StepRunOptions};
use crate::workflow::{Discipline, Workflow, WorkflowStep};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Step id of the consensus aggregation step.
pub const CONSENSUS_STEP_ID: &str = "consensus";

/// How a scheduling pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// All reachable steps were driven to a terminal step status (or the
    /// execution was marked failed along the way).
    Finished,
    /// The execution was paused; pending steps remain for a later pass.
    Paused,
    /// The execution was cancelled mid-pass.
    Cancelled,
}

/// Drives one execution's steps according to its workflow discipline.
pub struct Scheduler {
    executor: Arc<StepExecutor>,
}

impl Scheduler {
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self { executor }
    }

    pub async fn run(
        &self,
        workflow: Arc<Workflow>,
        dag: &WorkflowDag,
        execution: &ExecutionRef,
    ) -> ScheduleOutcome {
        match workflow.discipline {
            Discipline::Sequential => {
                self.run_ordered(workflow, dag, execution, StepRunOptions::default())
                    .await
            }
            Discipline::Conditional => {
                self.run_ordered(
                    workflow,
                    dag,
                    execution,
                    StepRunOptions {
                        condition_first: true,
                        skipped_satisfies_completion: true,
                    },
                )
                .await
            }
            Discipline::Parallel => self.run_parallel(workflow, execution).await,
            Discipline::Pipeline => self.run_pipeline(workflow, dag, execution).await,
            Discipline::Consensus => self.run_consensus(workflow, execution).await,
        }
    }

    /// Sequential and conditional disciplines: one step at a time in stable
    /// topological order.
    async fn run_ordered(
        &self,
        workflow: Arc<Workflow>,
        dag: &WorkflowDag,
        execution: &ExecutionRef,
        options: StepRunOptions,
    ) -> ScheduleOutcome {
        for step_id in dag.execution_order() {
            if let Some(outcome) = boundary_check(execution) {
                return outcome;
            }
            let Some(step) = workflow.step(step_id) else {
                continue;
            };
            // A resumed pass walks the same order; settled steps stay as-is.
            if execution.with(|e| e.step_status(step_id)) != Some(StepStatus::Pending) {
                continue;
            }

            let status = self
                .executor
                .run_step(&workflow, step, execution, options)
                .await;

            if status == StepStatus::Failed && is_fatal(step, &workflow) {
                mark_failed(execution);
                return ScheduleOutcome::Finished;
            }
        }
        ScheduleOutcome::Finished
    }

    /// Parallel discipline: every pending step launches at once, bounded by
    /// the workflow's concurrent step limit.
    async fn run_parallel(
        &self,
        workflow: Arc<Workflow>,
        execution: &ExecutionRef,
    ) -> ScheduleOutcome {
        if let Some(outcome) = boundary_check(execution) {
            return outcome;
        }
        let pending: Vec<WorkflowStep> = execution.with(|e| {
            workflow
                .steps
                .iter()
                .filter(|s| e.step_status(&s.step_id) == Some(StepStatus::Pending))
                .cloned()
                .collect()
        });

        self.run_group(&workflow, execution, pending, StepRunOptions::default())
            .await;

        if let Some(outcome) = boundary_check(execution) {
            return outcome;
        }
        if has_fatal_failure(&workflow, execution) {
            mark_failed(execution);
        }
        ScheduleOutcome::Finished
    }

    /// Pipeline discipline: resolver groups in order, concurrent within a
    /// group, the next group gated on the previous one settling.
    async fn run_pipeline(
        &self,
        workflow: Arc<Workflow>,
        dag: &WorkflowDag,
        execution: &ExecutionRef,
    ) -> ScheduleOutcome {
        for group in dag.parallel_groups() {
            if let Some(outcome) = boundary_check(execution) {
                return outcome;
            }
            let pending: Vec<WorkflowStep> = execution.with(|e| {
                group
                    .iter()
                    .filter(|id| e.step_status(id) == Some(StepStatus::Pending))
                    .filter_map(|id| workflow.step(id).cloned())
                    .collect()
            });
            if pending.is_empty() {
                continue;
            }

            self.run_group(&workflow, execution, pending, StepRunOptions::default())
                .await;

            if let Some(outcome) = boundary_check(execution) {
                return outcome;
            }
            let group_failed = execution.with(|e| {
                group.iter().any(|id| {
                    e.step_status(id) == Some(StepStatus::Failed)
                        && workflow.step(id).map(|s| is_fatal(s, &workflow)).unwrap_or(true)
                })
            });
            if group_failed {
                mark_failed(execution);
                return ScheduleOutcome::Finished;
            }
        }
        ScheduleOutcome::Finished
    }

    /// Consensus discipline: every step except the aggregator votes in
    /// parallel; the aggregator runs once all voters settled. Individual
    /// step failures never fail the execution here: a lost vote (or a failed
    /// aggregation) leaves its step failed and the run completes over the
    /// outputs that did arrive.
    async fn run_consensus(
        &self,
        workflow: Arc<Workflow>,
        execution: &ExecutionRef,
    ) -> ScheduleOutcome {
        if let Some(outcome) = boundary_check(execution) {
            return outcome;
        }
        let voters: Vec<WorkflowStep> = execution.with(|e| {
            workflow
                .steps
                .iter()
                .filter(|s| s.step_id != CONSENSUS_STEP_ID)
                .filter(|s| e.step_status(&s.step_id) == Some(StepStatus::Pending))
                .cloned()
                .collect()
        });

        self.run_group(&workflow, execution, voters, StepRunOptions::default())
            .await;

        if let Some(outcome) = boundary_check(execution) {
            return outcome;
        }

        if let Some(aggregator) = workflow.step(CONSENSUS_STEP_ID) {
            if execution.with(|e| e.step_status(CONSENSUS_STEP_ID)) == Some(StepStatus::Pending) {
                self.executor
                    .run_step(&workflow, aggregator, execution, StepRunOptions::default())
                    .await;
            }
        } else {
            // Without an aggregator, completion is the voter outputs as-is.
            debug!(workflow_id = %workflow.workflow_id, "Consensus workflow has no aggregation step");
        }

        ScheduleOutcome::Finished
    }

    /// Runs a batch of steps concurrently, bounded by the workflow's
    /// `max_concurrent_steps`. Steps launched after a pause or cancel took
    /// effect return untouched.
    async fn run_group(
        &self,
        workflow: &Arc<Workflow>,
        execution: &ExecutionRef,
        steps: Vec<WorkflowStep>,
        options: StepRunOptions,
    ) {
        if steps.is_empty() {
            return;
        }
        let semaphore = Arc::new(Semaphore::new(workflow.settings.max_concurrent_steps));
        let mut tasks = JoinSet::new();

        for step in steps {
            let semaphore = semaphore.clone();
            let workflow = workflow.clone();
            let execution = execution.clone();
            let executor = self.executor.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                // No new step starts once the execution left the running
                // state; the step stays pending for a later pass.
                if execution.status() != ExecStatus::Running {
                    return;
                }
                executor
                    .run_step(&workflow, &step, &execution, options)
                    .await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "Step task aborted");
            }
        }
    }
}

/// Non-running status at a step boundary ends the pass.
fn boundary_check(execution: &ExecutionRef) -> Option<ScheduleOutcome> {
    match execution.status() {
        ExecStatus::Running => None,
        ExecStatus::Paused => Some(ScheduleOutcome::Paused),
        ExecStatus::Cancelled => Some(ScheduleOutcome::Cancelled),
        _ => Some(ScheduleOutcome::Finished),
    }
}

/// A step failure fails the execution unless the step or the workflow allows
/// continuing.
fn is_fatal(step: &WorkflowStep, workflow: &Workflow) -> bool {
    !step.continue_on_error && !workflow.error_handling.continue_on_error
}

fn has_fatal_failure(workflow: &Workflow, execution: &ExecutionRef) -> bool {
    execution.with(|e| {
        e.failed_steps.iter().any(|id| {
            workflow
                .step(id)
                .map(|s| is_fatal(s, workflow))
                .unwrap_or(true)
        })
    })
}

fn mark_failed(execution: &ExecutionRef) {
    execution.with_mut(|e| {
        if !e.status.is_terminal() {
            e.status = ExecStatus::Failed;
        }
    });
}
