// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aggregated execution metrics.

use crate::context::{ExecStatus, Execution};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Read-only metrics snapshot.
///
/// `running` counts every non-terminal active execution; `failed` includes
/// wall-time timeouts. The four counts always sum to `total`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub avg_execution_time_ms: f64,
    pub success_rate_pct: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            total: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            avg_execution_time_ms: 0.0,
            success_rate_pct: 0.0,
            last_updated: Utc::now(),
        }
    }
}

impl EngineMetrics {
    /// Recomputes the snapshot from the active statuses and history records.
    pub fn compute<'a>(
        active: impl Iterator<Item = ExecStatus>,
        history: impl Iterator<Item = &'a Execution>,
    ) -> Self {
        let mut metrics = Self::default();

        for status in active {
            metrics.total += 1;
            match status {
                ExecStatus::Completed => metrics.completed += 1,
                ExecStatus::Failed | ExecStatus::Timeout => metrics.failed += 1,
                ExecStatus::Cancelled => metrics.cancelled += 1,
                _ => metrics.running += 1,
            }
        }

        let mut terminal = 0usize;
        let mut duration_sum = 0.0;
        let mut duration_count = 0usize;
        for execution in history {
            metrics.total += 1;
            terminal += 1;
            match execution.status {
                ExecStatus::Completed => metrics.completed += 1,
                ExecStatus::Cancelled => metrics.cancelled += 1,
                // Anything else in history counts as failed, timeouts included.
                _ => metrics.failed += 1,
            }
            if let Some(ms) = execution.duration_ms() {
                duration_sum += ms as f64;
                duration_count += 1;
            }
        }

        if duration_count > 0 {
            metrics.avg_execution_time_ms = duration_sum / duration_count as f64;
        }
        if terminal > 0 {
            metrics.success_rate_pct = metrics.completed as f64 / terminal as f64 * 100.0;
        }
        metrics.last_updated = Utc::now();
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;
    use chrono::Duration;
    use std::collections::HashMap;

    fn history_entry(status: ExecStatus, duration_ms: i64) -> Execution {
        let workflow = Workflow::new("wf", "w");
        let mut execution = Execution::new("exec".into(), &workflow, HashMap::new());
        execution.status = status;
        let start = Utc::now();
        execution.start_time = Some(start);
        execution.end_time = Some(start + Duration::milliseconds(duration_ms));
        execution
    }

    #[test]
    fn test_counts_sum_to_total() {
        let history = vec![
            history_entry(ExecStatus::Completed, 100),
            history_entry(ExecStatus::Failed, 50),
            history_entry(ExecStatus::Timeout, 200),
            history_entry(ExecStatus::Cancelled, 10),
        ];
        let active = vec![ExecStatus::Running, ExecStatus::Paused, ExecStatus::Pending];

        let metrics = EngineMetrics::compute(active.into_iter(), history.iter());
        assert_eq!(metrics.total, 7);
        assert_eq!(metrics.running, 3);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 2);
        assert_eq!(metrics.cancelled, 1);
        assert_eq!(
            metrics.running + metrics.completed + metrics.failed + metrics.cancelled,
            metrics.total
        );
    }

    #[test]
    fn test_average_duration_and_success_rate() {
        let history = vec![
            history_entry(ExecStatus::Completed, 100),
            history_entry(ExecStatus::Completed, 300),
            history_entry(ExecStatus::Failed, 200),
        ];
        let metrics = EngineMetrics::compute(std::iter::empty(), history.iter());
        assert_eq!(metrics.avg_execution_time_ms, 200.0);
        assert!((metrics.success_rate_pct - 66.66).abs() < 1.0);
    }

    #[test]
    fn test_empty_snapshot() {
        let metrics = EngineMetrics::compute(std::iter::empty(), std::iter::empty());
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.success_rate_pct, 0.0);
        assert_eq!(metrics.avg_execution_time_ms, 0.0);
    }
}
