// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical workflow shapes built programmatically.

use crate::scheduler::CONSENSUS_STEP_ID;
use crate::workflow::{Discipline, StepDependency, Workflow, WorkflowStep};
use serde_json::json;

/// A chain of steps, each gated on the previous one's success.
pub fn sequential(name: &str, agent_functions: &[(&str, &str)]) -> Workflow {
    let mut workflow = Workflow::new(String::new(), name);
    workflow.discipline = Discipline::Sequential;
    for (i, (agent_id, function)) in agent_functions.iter().enumerate() {
        let mut step = WorkflowStep::new(
            format!("step_{}", i + 1),
            format!("Step {}", i + 1),
            *agent_id,
            *function,
        );
        if i > 0 {
            step.dependencies
                .push(StepDependency::success(format!("step_{}", i)));
        }
        workflow.steps.push(step);
    }
    workflow
}

/// Independent steps, all launched concurrently.
pub fn parallel(name: &str, agent_functions: &[(&str, &str)]) -> Workflow {
    let mut workflow = Workflow::new(String::new(), name);
    workflow.discipline = Discipline::Parallel;
    for (i, (agent_id, function)) in agent_functions.iter().enumerate() {
        workflow.steps.push(WorkflowStep::new(
            format!("step_{}", i + 1),
            format!("Step {}", i + 1),
            *agent_id,
            *function,
        ));
    }
    workflow
}

/// A chain where each step receives the previous step's output.
pub fn pipeline(name: &str, agent_functions: &[(&str, &str)]) -> Workflow {
    let mut workflow = Workflow::new(String::new(), name);
    workflow.discipline = Discipline::Pipeline;
    for (i, (agent_id, function)) in agent_functions.iter().enumerate() {
        let mut step = WorkflowStep::new(
            format!("step_{}", i + 1),
            format!("Step {}", i + 1),
            *agent_id,
            *function,
        );
        if i > 0 {
            step.dependencies
                .push(StepDependency::success(format!("step_{}", i)));
            step.parameters = json!({
                "input": format!("${{steps.step_{}.output}}", i)
            });
        }
        workflow.steps.push(step);
    }
    workflow
}

/// One voting step per agent plus the aggregation step. The aggregator
/// depends on every voter settling, successful or not.
pub fn consensus(name: &str, agent_ids: &[&str], decision_function: &str) -> Workflow {
    let mut workflow = Workflow::new(String::new(), name);
    workflow.discipline = Discipline::Consensus;

    for (i, agent_id) in agent_ids.iter().enumerate() {
        workflow.steps.push(WorkflowStep::new(
            format!("vote_{}", i + 1),
            format!("Vote {}", i + 1),
            *agent_id,
            decision_function,
        ));
    }

    if let Some(first_agent) = agent_ids.first() {
        let mut aggregator = WorkflowStep::new(
            CONSENSUS_STEP_ID,
            "Consensus Decision",
            *first_agent,
            "aggregate_votes",
        );
        for i in 0..agent_ids.len() {
            aggregator
                .dependencies
                .push(StepDependency::completion_optional(format!("vote_{}", i + 1)));
        }
        workflow.steps.push(aggregator);
    }

    workflow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::WorkflowDag;
    use crate::workflow::DependencyCondition;

    #[test]
    fn test_sequential_template_chains_steps() {
        let workflow = sequential("seq", &[("a", "f1"), ("b", "f2"), ("c", "f3")]);
        assert_eq!(workflow.steps.len(), 3);
        assert!(workflow.steps[0].dependencies.is_empty());
        assert_eq!(workflow.steps[2].dependencies[0].step_id, "step_2");
        assert!(workflow.validate().is_ok());

        let dag = WorkflowDag::from_workflow(&workflow).unwrap();
        assert_eq!(dag.execution_order(), ["step_1", "step_2", "step_3"]);
    }

    #[test]
    fn test_pipeline_template_feeds_outputs_forward() {
        let workflow = pipeline("pipe", &[("a", "extract"), ("b", "transform")]);
        assert_eq!(
            workflow.steps[1].parameters["input"],
            serde_json::json!("${steps.step_1.output}")
        );
    }

    #[test]
    fn test_consensus_template_shape() {
        let workflow = consensus("vote", &["a", "b", "c"], "decide");
        assert_eq!(workflow.steps.len(), 4);

        let aggregator = workflow.step(CONSENSUS_STEP_ID).unwrap();
        assert_eq!(aggregator.dependencies.len(), 3);
        assert!(aggregator
            .dependencies
            .iter()
            .all(|d| !d.required && d.condition == DependencyCondition::Completion));
    }

    #[test]
    fn test_parallel_template() {
        let workflow = parallel("par", &[("a", "f"), ("b", "f")]);
        assert_eq!(workflow.discipline, Discipline::Parallel);
        assert!(workflow.steps.iter().all(|s| s.dependencies.is_empty()));
    }
}
