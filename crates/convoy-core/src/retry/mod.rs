//! Retry bookkeeping shared by all backends.
//!
//! A failed attempt consumes retry budget; while budget remains the task is
//! reset to pending with an exponentially increasing delay, otherwise it
//! becomes terminally failed.

use std::collections::HashMap;
use std::time::Duration;

/// Retry policy knobs. Defaults match the deployed configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Whether delays grow geometrically.
    pub exponential_backoff: bool,
    /// Growth factor when backoff is enabled.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            exponential_backoff: true,
            backoff_multiplier: 2.0,
        }
    }
}

/// Per-task attempt counters against a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryManager {
    policy: RetryPolicy,
    retry_counts: HashMap<String, u32>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_counts: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether the task still has retry budget.
    pub fn should_retry(&self, task_id: &str) -> bool {
        self.retry_count(task_id) < self.policy.max_retries
    }

    /// Record a retry attempt; returns the new count.
    pub fn record_attempt(&mut self, task_id: &str) -> u32 {
        let count = self.retry_counts.entry(task_id.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    /// Delay before the next retry of this task.
    ///
    /// With backoff enabled the delay is `base * multiplier^retries`, so the
    /// first retry waits `base`, the second `base * multiplier`, and so on.
    pub fn delay_for(&self, task_id: &str) -> Duration {
        if !self.policy.exponential_backoff {
            return self.policy.base_delay;
        }
        let attempts = self.retry_count(task_id);
        let factor = self.policy.backoff_multiplier.powi(attempts as i32);
        self.policy.base_delay.mul_f64(factor)
    }

    /// Number of retries recorded so far (0 if never failed).
    pub fn retry_count(&self, task_id: &str) -> u32 {
        self.retry_counts.get(task_id).copied().unwrap_or(0)
    }

    /// Attempts used per task, for reporting.
    pub fn attempts_used(&self) -> &HashMap<String, u32> {
        &self.retry_counts
    }
}
