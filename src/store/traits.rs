//! `Database` trait: single async interface for task and result persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::task::{AgentResult, Task, TaskState};

/// Number of task records per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.cancelled
    }

    pub(crate) fn add(&mut self, state: TaskState, count: u64) {
        match state {
            TaskState::Waiting => self.waiting += count,
            TaskState::Active => self.active += count,
            TaskState::Completed => self.completed += count,
            TaskState::Failed => self.failed += count,
            TaskState::Cancelled => self.cancelled += count,
        }
    }
}

/// Tasks moved by a liveness recovery sweep.
#[derive(Debug, Clone, Default)]
pub struct RecoveredTasks {
    /// Returned to the waiting set.
    pub requeued: Vec<Task>,
    /// Had already consumed their final attempt; now failed.
    pub failed: Vec<Task>,
}

impl RecoveredTasks {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Backend-agnostic persistence for the durable queue and the result store.
///
/// Every state-changing task operation is conditional on the task's current
/// state. Operations that move a task out of `active` return `None` when the
/// task is no longer active (for example it was cancelled mid-flight).
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Persist a new task, assigning the next admission sequence number.
    async fn insert_task(&self, task: &Task) -> Result<Task, DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Atomically claim the highest-priority, oldest eligible waiting task,
    /// marking it active and consuming one attempt.
    async fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<Task>, DatabaseError>;

    /// Like [`Database::claim_next_task`], skipping tasks assigned to `agent`.
    async fn claim_next_task_except(
        &self,
        now: DateTime<Utc>,
        agent: &str,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Earliest `eligible_at` among waiting tasks.
    async fn next_eligible_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Active → waiting, ineligible until `eligible_at`. Keeps priority and seq.
    async fn reschedule_task(
        &self,
        id: Uuid,
        eligible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Active → waiting immediately, moved to the back of its priority band.
    /// The attempt consumed by the claim is given back.
    async fn requeue_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Active → completed or failed, storing `result` with the transition.
    /// A task that is no longer active keeps no result.
    async fn finish_task(
        &self,
        id: Uuid,
        state: TaskState,
        error: Option<&str>,
        result: &AgentResult,
        result_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Waiting or active → cancelled. `None` if the task was not cancellable.
    async fn cancel_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Record the agent an active task was (re)routed to.
    async fn set_task_agent(&self, id: Uuid, agent: &str) -> Result<(), DatabaseError>;

    /// Refresh the liveness heartbeat of an active task.
    async fn touch_heartbeat(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Return active tasks with a heartbeat older than `stale_before` to
    /// waiting, or fail them if `attempts >= max_attempts`. Failed tasks get
    /// a failure result expiring at `result_expires_at`.
    async fn recover_stale_tasks(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
        result_expires_at: DateTime<Utc>,
    ) -> Result<RecoveredTasks, DatabaseError>;

    /// Most recently admitted tasks first, optionally filtered by state.
    async fn list_tasks(
        &self,
        state: Option<TaskState>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    async fn count_tasks_by_state(&self) -> Result<TaskCounts, DatabaseError>;

    /// Delete terminal tasks last updated before `before`.
    async fn prune_terminal_tasks(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Results ─────────────────────────────────────────────────────

    /// Store a result. Results are immutable: a second write for the same
    /// task is ignored and `false` is returned.
    async fn put_result(
        &self,
        result: &AgentResult,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Get an unexpired result.
    async fn get_result(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AgentResult>, DatabaseError>;

    /// Delete expired results.
    async fn purge_expired_results(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
