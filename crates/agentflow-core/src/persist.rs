// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! State persistence interface.
//!
//! Backends snapshot executions so queued and in-flight work survives a
//! process restart. Writes are best-effort from the engine's point of view:
//! failures are logged, never allowed to block scheduling.

use crate::context::Execution;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Error type for persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid snapshot {path}: {reason}")]
    InvalidSnapshot { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PersistError>;

/// Durable snapshot store, one record per execution.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Writes (or replaces) the snapshot for one execution.
    async fn save(&self, execution: &Execution) -> Result<()>;

    /// Loads every stored snapshot. Backends tolerate an empty or missing
    /// store and skip unreadable records with a warning.
    async fn load_all(&self) -> Result<Vec<Execution>>;

    /// Removes the snapshot for one execution, if present.
    async fn remove(&self, execution_id: &str) -> Result<()>;
}

/// Arc-wrapped state store.
pub type StateStoreRef = Arc<dyn StateStore>;
