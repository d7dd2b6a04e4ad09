// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policy with multiplicative backoff.

use crate::workflow::{ErrorHandling, WorkflowStep};
use std::time::Duration;

const DEFAULT_MULTIPLIER: f64 = 1.5;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry policy for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Effective policy for a step: the step's own budget when set, otherwise
    /// the workflow default (which only applies when retry_on_failure is on).
    pub fn for_step(step: &WorkflowStep, error_handling: &ErrorHandling) -> Self {
        let max_retries = if step.max_retries > 0 {
            step.max_retries
        } else if error_handling.retry_on_failure {
            error_handling.max_retries
        } else {
            0
        };

        let initial_delay = if step.retry_delay_seconds > 0 {
            Duration::from_secs(step.retry_delay_seconds)
        } else if step.max_retries == 0 && error_handling.retry_delay_seconds > 0 {
            Duration::from_secs(error_handling.retry_delay_seconds)
        } else {
            Duration::ZERO
        };

        Self {
            max_retries,
            initial_delay,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Backoff before retry attempt `attempt` (1-based), capped at max_delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStep;

    #[test]
    fn test_step_budget_wins() {
        let mut step = WorkflowStep::new("s", "S", "a", "f");
        step.max_retries = 5;
        step.retry_delay_seconds = 2;
        let policy = RetryPolicy::for_step(&step, &ErrorHandling::default());
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_workflow_default_applies_when_step_unset() {
        let mut step = WorkflowStep::new("s", "S", "a", "f");
        step.max_retries = 0;
        let policy = RetryPolicy::for_step(&step, &ErrorHandling::default());
        assert_eq!(policy.max_retries, 3);
    }

    #[test]
    fn test_no_retries_when_retry_on_failure_off() {
        let mut step = WorkflowStep::new("s", "S", "a", "f");
        step.max_retries = 0;
        let error_handling = ErrorHandling {
            retry_on_failure: false,
            ..ErrorHandling::default()
        };
        let policy = RetryPolicy::for_step(&step, &error_handling);
        assert_eq!(policy.max_retries, 0);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), 1.5, Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2250));
        // Far along the curve the cap takes over.
        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_delay_stays_zero() {
        let policy = RetryPolicy::new(3, Duration::ZERO, 1.5, Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(4), Duration::ZERO);
    }
}
