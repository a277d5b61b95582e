//! Task state machine and retry policy.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued; eligible for dequeue once its eligibility time has passed.
    Waiting,
    /// Held by exactly one dispatcher worker.
    Active,
    /// Agent returned successfully.
    Completed,
    /// Routing failed, retries were exhausted, or the agent rejected the task.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        Self::Waiting,
        Self::Active,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            // From Waiting
            (Waiting, Active) | (Waiting, Cancelled) |
            // From Active (retry and capacity release go back to Waiting)
            (Active, Waiting) | (Active, Completed) |
            (Active, Failed) | (Active, Cancelled)
        )
    }

    /// States from which `target` is reachable in one step.
    pub fn sources_of(target: TaskState) -> Vec<TaskState> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state '{s}'"))
    }
}

/// Fixed retry policy: a bounded number of attempts with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total execution attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles for each later one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Whether a task that has used `attempts` attempts may run again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt after the `attempt`-th one failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}
