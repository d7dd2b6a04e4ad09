// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Agent service contract.
//!
//! The engine treats agents as an opaque function-invocation service; it
//! never owns agent lifecycle.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Error returned by an agent invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// The invocation exceeded its deadline.
    #[error("Agent invocation timed out after {0:?}")]
    Timeout(Duration),

    /// No agent registered under the given id.
    #[error("Agent not found: {0}")]
    AgentMissing(String),

    /// The agent does not expose the requested function.
    #[error("Function not found: {0}")]
    FunctionMissing(String),

    /// The agent ran the function and it failed (includes cancellation).
    #[error("Agent execution failed: {0}")]
    Execution(String),
}

impl AgentError {
    /// Conventional error for a cancelled invocation.
    pub fn cancelled() -> Self {
        AgentError::Execution("cancelled".to_string())
    }
}

/// A service that runs named functions on named agents.
///
/// Implementations must be safe to invoke concurrently from many workers.
/// When the caller abandons the invocation (deadline or cancellation), the
/// service releases resources on its side.
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Invokes `function_name` on `agent_id` with JSON `params`.
    ///
    /// `deadline` is the caller's per-attempt budget; implementations may
    /// enforce it themselves or rely on the caller's timeout.
    async fn execute(
        &self,
        agent_id: &str,
        function_name: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, AgentError>;
}

/// Arc-wrapped agent service.
pub type AgentServiceRef = Arc<dyn AgentService>;
