//! Failure classification and the bounded retry state machine for
//! provisioning operations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Local state references resources that no longer exist.
    StaleState,
    /// A shared resource is briefly held by something else.
    TransientConflict,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub conflict_backoff_secs: u64,
    pub stale_patterns: Vec<String>,
    pub conflict_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            conflict_backoff_secs: 15,
            stale_patterns: ["not found", "404", "does not exist", "could not find"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            conflict_patterns: [
                "already allocated",
                "already in use",
                "in use",
                "resource busy",
                "is busy",
                "409",
                "conflict",
                "still attached",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// Case-insensitive substring match; stale patterns are checked first.
    pub fn classify(&self, stderr: &str) -> FailureClass {
        let lowered = stderr.to_lowercase();
        let hit = |patterns: &[String]| {
            patterns
                .iter()
                .any(|p| lowered.contains(&p.to_lowercase()))
        };
        if hit(&self.stale_patterns) {
            FailureClass::StaleState
        } else if hit(&self.conflict_patterns) {
            FailureClass::TransientConflict
        } else {
            FailureClass::Fatal
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryStep {
    /// Clear local state, then run attempt `attempt`.
    ResetAndRetry { attempt: u32 },
    /// Wait `delay`, then run attempt `attempt`.
    BackoffAndRetry { attempt: u32, delay: Duration },
    GiveUp { class: FailureClass, attempts: u32 },
}

/// Attempt counter for one operation, starting at 1. Created per
/// operation.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryMachine {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            policy: policy.clone(),
            attempt: 1,
        }
    }

    /// Decides what follows a failed attempt whose diagnostics are `stderr`.
    pub fn on_failure(&mut self, stderr: &str) -> RetryStep {
        let class = self.policy.classify(stderr);
        let failed = self.attempt;
        if class == FailureClass::Fatal || failed >= self.policy.max_attempts.max(1) {
            return RetryStep::GiveUp {
                class,
                attempts: failed,
            };
        }
        self.attempt += 1;
        match class {
            FailureClass::StaleState => RetryStep::ResetAndRetry {
                attempt: self.attempt,
            },
            _ => RetryStep::BackoffAndRetry {
                attempt: self.attempt,
                delay: Duration::from_secs(self.policy.conflict_backoff_secs * u64::from(failed)),
            },
        }
    }
}
