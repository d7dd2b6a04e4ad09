// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dependency resolution: stable topological order and parallel grouping.

use crate::error::{EngineError, Result};
use crate::workflow::Workflow;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

/// Resolved execution structure of a workflow's step DAG.
///
/// The topological order is stable: ties are broken by definition order.
/// Parallel groups partition the steps so that group `k` only contains steps
/// whose dependencies live in groups `< k`; steps that forbid parallelism
/// occupy singleton groups at the earliest position where their dependencies
/// are resolved.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    order: Vec<String>,
    groups: Vec<Vec<String>>,
}

impl WorkflowDag {
    /// Builds the DAG for a workflow, failing on a dependency cycle.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let index_of: HashMap<&str, usize> = workflow
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.step_id.as_str(), i))
            .collect();

        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(workflow.steps.len(), 0);
        let nodes: Vec<NodeIndex> = (0..workflow.steps.len())
            .map(|i| graph.add_node(i))
            .collect();

        for (i, step) in workflow.steps.iter().enumerate() {
            for dep in &step.dependencies {
                let Some(&from) = index_of.get(dep.step_id.as_str()) else {
                    return Err(EngineError::Validation(format!(
                        "step {} depends on unknown step {}",
                        step.step_id, dep.step_id
                    )));
                };
                // A success and a completion dependency on the same upstream
                // step contribute one edge.
                graph.update_edge(nodes[from], nodes[i], ());
            }
        }

        let order = stable_topological_order(workflow, &graph, &nodes)?;
        let groups = partition_groups(workflow, &graph, &nodes);

        Ok(Self { order, groups })
    }

    /// Step ids in stable topological order.
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    /// Ordered parallel groups.
    pub fn parallel_groups(&self) -> &[Vec<String>] {
        &self.groups
    }
}

/// Kahn's algorithm, always popping the lowest definition index.
fn stable_topological_order(
    workflow: &Workflow,
    graph: &DiGraph<usize, ()>,
    nodes: &[NodeIndex],
) -> Result<Vec<String>> {
    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(workflow.steps.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(workflow.steps[next].step_id.clone());
        for succ in graph.neighbors_directed(nodes[next], Direction::Outgoing) {
            let i = graph[succ];
            in_degree[i] -= 1;
            if in_degree[i] == 0 {
                ready.insert(i);
            }
        }
    }

    if order.len() != workflow.steps.len() {
        let stuck = in_degree
            .iter()
            .enumerate()
            .find(|(_, &d)| d > 0)
            .map(|(i, _)| workflow.steps[i].step_id.clone());
        return Err(EngineError::CyclicDependency { cycle_hint: stuck });
    }
    Ok(order)
}

/// Round-based grouping over the resolved DAG. Each round takes every step
/// whose dependencies are already placed: non-parallel steps become singleton
/// groups (definition order), the rest form one shared group.
fn partition_groups(
    workflow: &Workflow,
    graph: &DiGraph<usize, ()>,
    nodes: &[NodeIndex],
) -> Vec<Vec<String>> {
    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut placed = vec![false; workflow.steps.len()];
    let mut groups = Vec::new();
    let mut remaining = workflow.steps.len();

    while remaining > 0 {
        let round: Vec<usize> = (0..workflow.steps.len())
            .filter(|&i| !placed[i] && in_degree[i] == 0)
            .collect();
        if round.is_empty() {
            // Unreachable after cycle validation; stop rather than spin.
            break;
        }

        let mut shared = Vec::new();
        for &i in &round {
            let step = &workflow.steps[i];
            if step.parallel_allowed {
                shared.push(step.step_id.clone());
            } else {
                groups.push(vec![step.step_id.clone()]);
            }
        }
        if !shared.is_empty() {
            groups.push(shared);
        }

        for &i in &round {
            placed[i] = true;
            remaining -= 1;
            for succ in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
                in_degree[graph[succ]] -= 1;
            }
        }
    }

    groups
}
