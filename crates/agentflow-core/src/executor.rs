// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-step execution: gating, interpolation, invocation, retry.

use crate::agent::{AgentError, AgentServiceRef};
use crate::context::{ExecutionRef, StepStatus};
use crate::interpolate::Interpolator;
use crate::retry::RetryPolicy;
use crate::workflow::{DependencyCondition, Workflow, WorkflowStep};
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Gating options that vary per discipline.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepRunOptions {
    /// Evaluate the condition before dependency gating (conditional runs).
    pub condition_first: bool,
    /// A skipped upstream satisfies a `completion` dependency.
    pub skipped_satisfies_completion: bool,
}

/// Executes one step at a time against the agent service.
pub struct StepExecutor {
    agent_service: AgentServiceRef,
    interpolator: Interpolator,
}

impl StepExecutor {
    pub fn new(agent_service: AgentServiceRef) -> Self {
        Self {
            agent_service,
            interpolator: Interpolator::new(),
        }
    }

    /// Runs one step to a terminal step status, recording the outcome in the
    /// execution. Never touches other steps.
    pub async fn run_step(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        execution: &ExecutionRef,
        options: StepRunOptions,
    ) -> StepStatus {
        execution.with_mut(|exec| {
            exec.current_step_id = step.step_id.clone();
            if let Some(state) = exec.step_states.get_mut(&step.step_id) {
                state.start_time = Some(Utc::now());
            }
        });

        let gate = if options.condition_first {
            self.condition_gate(step, execution)
                .or_else(|| self.dependency_gate(step, execution, options))
        } else {
            self.dependency_gate(step, execution, options)
                .or_else(|| self.condition_gate(step, execution))
        };
        if let Some(reason) = gate {
            debug!(
                step_id = %step.step_id,
                reason = %reason,
                "Skipping step"
            );
            return self.finish_skipped(step, execution);
        }

        let params = execution.with(|exec| {
            self.interpolator
                .resolve(&step.parameters, &exec.global_variables, &exec.step_outputs)
        });

        let policy = RetryPolicy::for_step(step, &workflow.error_handling);
        let step_timeout = Duration::from_secs(step.timeout_seconds);
        let cancel = execution.cancel_token().clone();

        let mut last_error = String::new();
        let mut cancelled = false;

        for attempt in 0..=policy.max_retries {
            if attempt > 0 {
                execution.with_mut(|exec| {
                    if let Some(state) = exec.step_states.get_mut(&step.step_id) {
                        state.status = StepStatus::Retrying;
                        state.retry_count = attempt;
                    }
                });
                info!(
                    step_id = %step.step_id,
                    attempt = attempt + 1,
                    "Retrying step"
                );
                let delay = policy.delay_for(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        last_error = "execution cancelled".to_string();
                        cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            execution.with_mut(|exec| {
                if let Some(state) = exec.step_states.get_mut(&step.step_id) {
                    state.status = StepStatus::Running;
                    state.retry_count = attempt;
                }
            });

            let invocation = self.agent_service.execute(
                &step.agent_id,
                &step.function_name,
                params.clone(),
                step_timeout,
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    last_error = "execution cancelled".to_string();
                    cancelled = true;
                    break;
                }
                outcome = timeout(step_timeout, invocation) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Timeout(step_timeout)),
                },
            };

            match result {
                Ok(output) => {
                    return self.finish_completed(step, execution, output);
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        step_id = %step.step_id,
                        attempt = attempt + 1,
                        error = %last_error,
                        "Step attempt failed"
                    );
                }
            }
        }

        if !cancelled {
            if let Some(output) = self.try_fallback(workflow, step, execution, &params).await {
                return self.finish_completed(step, execution, output);
            }
        }

        self.finish_failed(step, execution, last_error)
    }

    /// Returns a skip reason when a required dependency is unsatisfied.
    fn dependency_gate(
        &self,
        step: &WorkflowStep,
        execution: &ExecutionRef,
        options: StepRunOptions,
    ) -> Option<String> {
        execution.with(|exec| {
            for dep in &step.dependencies {
                let status = exec.step_status(&dep.step_id);
                let satisfied = match dep.condition {
                    DependencyCondition::Success => status == Some(StepStatus::Completed),
                    DependencyCondition::Completion => matches!(
                        status,
                        Some(StepStatus::Completed) | Some(StepStatus::Failed)
                    ) || (options.skipped_satisfies_completion
                        && status == Some(StepStatus::Skipped)),
                };
                if !satisfied && dep.required {
                    return Some(format!("unmet dependency on step {}", dep.step_id));
                }
            }
            None
        })
    }

    /// Returns a skip reason when the step's condition evaluates to false.
    fn condition_gate(&self, step: &WorkflowStep, execution: &ExecutionRef) -> Option<String> {
        let condition = step.condition.as_ref()?;
        let snapshot = execution.snapshot();
        if condition.evaluate(&snapshot) {
            None
        } else {
            Some("condition evaluated to false".to_string())
        }
    }

    /// One extra attempt against the configured fallback agent.
    async fn try_fallback(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        execution: &ExecutionRef,
        params: &Value,
    ) -> Option<Value> {
        let error_handling = &workflow.error_handling;
        if !error_handling.use_fallback_agent || error_handling.fallback_agent_id.is_empty() {
            return None;
        }

        let fallback_params = if error_handling.fallback_parameters.is_null() {
            params.clone()
        } else {
            execution.with(|exec| {
                self.interpolator.resolve(
                    &error_handling.fallback_parameters,
                    &exec.global_variables,
                    &exec.step_outputs,
                )
            })
        };

        info!(
            step_id = %step.step_id,
            fallback_agent = %error_handling.fallback_agent_id,
            "Falling back after exhausted retries"
        );

        let step_timeout = Duration::from_secs(step.timeout_seconds);
        let invocation = self.agent_service.execute(
            &error_handling.fallback_agent_id,
            &step.function_name,
            fallback_params,
            step_timeout,
        );
        match timeout(step_timeout, invocation).await {
            Ok(Ok(output)) => Some(output),
            Ok(Err(err)) => {
                warn!(
                    step_id = %step.step_id,
                    error = %err,
                    "Fallback agent failed"
                );
                None
            }
            Err(_) => {
                warn!(step_id = %step.step_id, "Fallback agent timed out");
                None
            }
        }
    }

    fn finish_completed(
        &self,
        step: &WorkflowStep,
        execution: &ExecutionRef,
        output: Value,
    ) -> StepStatus {
        execution.with_mut(|exec| {
            exec.step_outputs.insert(step.step_id.clone(), output.clone());
            if let Some(state) = exec.step_states.get_mut(&step.step_id) {
                state.status = StepStatus::Completed;
                state.output = Some(output);
                state.end_time = Some(Utc::now());
            }
            exec.completed_steps.push(step.step_id.clone());
            exec.update_progress();
        });
        info!(step_id = %step.step_id, "Step completed");
        StepStatus::Completed
    }

    fn finish_failed(
        &self,
        step: &WorkflowStep,
        execution: &ExecutionRef,
        error: String,
    ) -> StepStatus {
        execution.with_mut(|exec| {
            if let Some(state) = exec.step_states.get_mut(&step.step_id) {
                state.status = StepStatus::Failed;
                state.error_message = Some(error.clone());
                state.end_time = Some(Utc::now());
            }
            exec.failed_steps.push(step.step_id.clone());
            exec.update_progress();
        });
        warn!(step_id = %step.step_id, error = %error, "Step failed");
        StepStatus::Failed
    }

    fn finish_skipped(&self, step: &WorkflowStep, execution: &ExecutionRef) -> StepStatus {
        execution.with_mut(|exec| {
            if let Some(state) = exec.step_states.get_mut(&step.step_id) {
                state.status = StepStatus::Skipped;
                state.end_time = Some(Utc::now());
            }
            exec.update_progress();
        });
        StepStatus::Skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentService;
    use crate::condition::Condition;
    use crate::context::{Execution, ExecutionHandle};
    use crate::workflow::{ErrorHandling, StepDependency, WorkflowBuilder, WorkflowStep};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails `failures` times, then echoes its parameters.
    struct FlakyAgent {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentService for FlakyAgent {
        async fn execute(
            &self,
            agent_id: &str,
            _function_name: &str,
            params: Value,
            _deadline: Duration,
        ) -> Result<Value, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(AgentError::Execution(format!("induced failure {}", call)))
            } else {
                Ok(json!({"agent": agent_id, "params": params}))
            }
        }
    }

    fn harness(
        step: WorkflowStep,
        failures: u32,
    ) -> (Workflow, ExecutionRef, StepExecutor, Arc<FlakyAgent>) {
        let workflow = WorkflowBuilder::new("wf", "test").step(step).build();
        let execution = ExecutionHandle::new(Execution::new(
            "exec-1".into(),
            &workflow,
            HashMap::new(),
        ));
        let agent = Arc::new(FlakyAgent {
            failures,
            calls: AtomicU32::new(0),
        });
        let executor = StepExecutor::new(agent.clone());
        (workflow, execution, executor, agent)
    }

    #[tokio::test]
    async fn test_success_records_output() {
        let step = WorkflowStep::new("s1", "S1", "agent-a", "run")
            .with_parameters(json!({"x": 1}));
        let (workflow, execution, executor, _) = harness(step.clone(), 0);

        let status = executor
            .run_step(&workflow, &step, &execution, StepRunOptions::default())
            .await;

        assert_eq!(status, StepStatus::Completed);
        execution.with(|exec| {
            assert_eq!(exec.step_outputs["s1"]["agent"], json!("agent-a"));
            assert_eq!(exec.completed_steps, ["s1"]);
            let state = &exec.step_states["s1"];
            assert!(state.start_time.is_some() && state.end_time.is_some());
        });
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mut step = WorkflowStep::new("s1", "S1", "agent-a", "run");
        step.max_retries = 3;
        step.retry_delay_seconds = 0;
        let (workflow, execution, executor, agent) = harness(step.clone(), 2);

        let status = executor
            .run_step(&workflow, &step, &execution, StepRunOptions::default())
            .await;

        assert_eq!(status, StepStatus::Completed);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
        execution.with(|exec| {
            assert_eq!(exec.step_states["s1"].retry_count, 2);
        });
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_last_error() {
        let mut step = WorkflowStep::new("s1", "S1", "agent-a", "run");
        step.max_retries = 2;
        step.retry_delay_seconds = 0;
        let (workflow, execution, executor, agent) = harness(step.clone(), u32::MAX);

        let status = executor
            .run_step(&workflow, &step, &execution, StepRunOptions::default())
            .await;

        assert_eq!(status, StepStatus::Failed);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
        execution.with(|exec| {
            assert_eq!(exec.failed_steps, ["s1"]);
            let state = &exec.step_states["s1"];
            assert_eq!(state.retry_count, 2);
            assert!(state
                .error_message
                .as_deref()
                .unwrap()
                .contains("induced failure"));
        });
    }

    #[tokio::test]
    async fn test_unmet_required_dependency_skips() {
        let step = WorkflowStep::new("s2", "S2", "agent-a", "run")
            .with_dependency(StepDependency::success("s1"));
        let workflow = WorkflowBuilder::new("wf", "test")
            .step(WorkflowStep::new("s1", "S1", "agent-a", "run"))
            .step(step.clone())
            .build();
        let execution = ExecutionHandle::new(Execution::new(
            "exec-1".into(),
            &workflow,
            HashMap::new(),
        ));
        let executor = StepExecutor::new(Arc::new(FlakyAgent {
            failures: 0,
            calls: AtomicU32::new(0),
        }));

        // s1 is still pending, so s2's required success dependency is unmet.
        let status = executor
            .run_step(&workflow, &step, &execution, StepRunOptions::default())
            .await;
        assert_eq!(status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_false_condition_skips() {
        let step = WorkflowStep::new("s1", "S1", "agent-a", "run")
            .with_condition(Condition::expression("false"));
        let (workflow, execution, executor, agent) = harness(step.clone(), 0);

        let status = executor
            .run_step(&workflow, &step, &execution, StepRunOptions::default())
            .await;

        assert_eq!(status, StepStatus::Skipped);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_sleep_fails_promptly() {
        let mut step = WorkflowStep::new("s1", "S1", "agent-a", "run");
        step.max_retries = 5;
        step.retry_delay_seconds = 5;
        let (workflow, execution, executor, _) = harness(step.clone(), u32::MAX);

        let exec_clone = execution.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            exec_clone.trigger_cancel();
        });

        let started = std::time::Instant::now();
        let status = executor
            .run_step(&workflow, &step, &execution, StepRunOptions::default())
            .await;

        assert_eq!(status, StepStatus::Failed);
        assert!(started.elapsed() < Duration::from_secs(2));
        execution.with(|exec| {
            assert!(exec.step_states["s1"]
                .error_message
                .as_deref()
                .unwrap()
                .contains("cancelled"));
        });
    }

    #[tokio::test]
    async fn test_fallback_agent_rescues_step() {
        struct PrimaryFailsFallbackWorks;

        #[async_trait]
        impl AgentService for PrimaryFailsFallbackWorks {
            async fn execute(
                &self,
                agent_id: &str,
                _function_name: &str,
                _params: Value,
                _deadline: Duration,
            ) -> Result<Value, AgentError> {
                if agent_id == "backup" {
                    Ok(json!({"from": "backup"}))
                } else {
                    Err(AgentError::Execution("primary down".into()))
                }
            }
        }

        let mut step = WorkflowStep::new("s1", "S1", "primary", "run");
        step.max_retries = 1;
        step.retry_delay_seconds = 0;
        let workflow = WorkflowBuilder::new("wf", "test")
            .error_handling(ErrorHandling {
                use_fallback_agent: true,
                fallback_agent_id: "backup".into(),
                ..ErrorHandling::default()
            })
            .step(step.clone())
            .build();
        let execution = ExecutionHandle::new(Execution::new(
            "exec-1".into(),
            &workflow,
            HashMap::new(),
        ));
        let executor = StepExecutor::new(Arc::new(PrimaryFailsFallbackWorks));

        let status = executor
            .run_step(&workflow, &step, &execution, StepRunOptions::default())
            .await;

        assert_eq!(status, StepStatus::Completed);
        execution.with(|exec| {
            assert_eq!(exec.step_outputs["s1"], json!({"from": "backup"}));
        });
    }
}
