// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine error types.

use thiserror::Error;

/// Error type for engine and registry operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Workflow definition failed validation.
    #[error("Workflow validation failed: {0}")]
    Validation(String),

    /// The step dependency graph contains a cycle.
    #[error("Workflow contains circular dependencies")]
    CyclicDependency {
        /// Step id on the detected cycle, if known.
        cycle_hint: Option<String>,
    },

    /// No workflow registered under the given id.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No execution (active or historical) under the given id.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// The workflow has an active execution and cannot be mutated or re-run.
    #[error("Workflow {0} has an active execution")]
    WorkflowBusy(String),

    /// The pending queue is at its high-water mark.
    #[error("Execution queue is full ({capacity} pending)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The engine is not running.
    #[error("Engine is not running")]
    EngineStopped,

    /// The execution is not in a state that permits the requested transition.
    #[error("Invalid state for {operation}: execution {execution_id} is {status}")]
    InvalidTransition {
        /// The requested operation (pause, resume, ...).
        operation: &'static str,
        /// Target execution id.
        execution_id: String,
        /// Current status, lowercase wire form.
        status: String,
    },

    /// Failure while loading a workflow document.
    #[error("Failed to load workflow from {file}: {reason}")]
    Load {
        /// Offending file.
        file: String,
        /// Diagnostic, including the document path where available.
        reason: String,
    },

    /// Persistence backend failure surfaced to a caller.
    #[error("State persistence error: {0}")]
    Persistence(#[from] crate::persist::PersistError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
