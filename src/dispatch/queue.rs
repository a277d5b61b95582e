//! Durable queue: persisted priority queue of tasks with lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::{Database, RecoveredTasks, TaskCounts};
use crate::task::{AgentResult, NewTask, Task, TaskState, TaskStatus};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Upper bound on the tasks included in a sync event.
const SYNC_LIMIT: usize = 500;

/// Lifecycle events pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Every waiting and active task (sent on connect and after lag).
    TasksSync { tasks: Vec<TaskStatus> },
    /// A task changed state.
    TaskUpdate { task: TaskStatus },
}

/// Persisted task queue.
///
/// Ordering is priority DESC then admission sequence ASC. Idle workers park
/// in [`DurableQueue::wait_for_work`] and are woken when a task is admitted or
/// rescheduled.
pub struct DurableQueue {
    db: Arc<dyn Database>,
    work: Notify,
    tx: broadcast::Sender<QueueEvent>,
}

impl DurableQueue {
    pub fn new(db: Arc<dyn Database>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            db,
            work: Notify::new(),
            tx,
        })
    }

    /// Subscribe to task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, task: &Task) {
        // Ok if nobody is listening
        let _ = self.tx.send(QueueEvent::TaskUpdate {
            task: TaskStatus::from(task),
        });
    }

    /// Admit a routed task in `waiting` and wake one idle worker.
    pub async fn enqueue(&self, new: NewTask, agent: String) -> Result<Task, DatabaseError> {
        let task = self.db.insert_task(&Task::from_new(new, Some(agent))).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            agent = task.agent.as_deref().unwrap_or_default(),
            priority = task.priority,
            "Task enqueued"
        );
        self.publish(&task);
        self.work.notify_one();
        Ok(task)
    }

    /// Admit a task directly in `failed`; it is never dequeued.
    pub async fn admit_failed(&self, new: NewTask, reason: &str) -> Result<Task, DatabaseError> {
        let agent = new.agent.clone();
        let mut task = Task::from_new(new, agent);
        task.state = TaskState::Failed;
        task.error = Some(reason.to_string());
        let task = self.db.insert_task(&task).await?;
        warn!(task_id = %task.id, task_type = %task.task_type, reason, "Task admitted as failed");
        self.publish(&task);
        Ok(task)
    }

    /// Pop the highest-priority eligible task, marking it active.
    pub async fn dequeue(&self) -> Result<Option<Task>, DatabaseError> {
        let task = self.db.claim_next_task(Utc::now()).await?;
        if let Some(ref task) = task {
            debug!(task_id = %task.id, attempt = task.attempts, "Task dequeued");
            self.publish(task);
        }
        Ok(task)
    }

    /// Like [`DurableQueue::dequeue`], passing over tasks assigned to `agent`.
    pub async fn dequeue_except(&self, agent: &str) -> Result<Option<Task>, DatabaseError> {
        let task = self.db.claim_next_task_except(Utc::now(), agent).await?;
        if let Some(ref task) = task {
            debug!(task_id = %task.id, attempt = task.attempts, skipped = agent, "Task dequeued");
            self.publish(task);
        }
        Ok(task)
    }

    /// Return an active task to waiting after `delay`.
    pub async fn reschedule(
        &self,
        id: Uuid,
        delay: Duration,
        error: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let eligible_at = Utc::now()
            + chrono::TimeDelta::from_std(delay).unwrap_or(chrono::TimeDelta::zero());
        let task = self.db.reschedule_task(id, eligible_at, error).await?;
        if let Some(ref task) = task {
            info!(task_id = %id, attempt = task.attempts, delay_ms = delay.as_millis() as u64, "Task rescheduled");
            self.publish(task);
            // A sleeping worker may need to shorten its wait.
            self.work.notify_one();
        }
        Ok(task)
    }

    /// Give an active task back without consuming its attempt. The task goes
    /// to the back of its priority band and is eligible immediately; no worker
    /// is woken, since capacity (not work) is what is missing.
    pub async fn release(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let task = self.db.requeue_task(id).await?;
        if let Some(ref task) = task {
            debug!(task_id = %id, seq = task.seq, "Task released back to queue");
            self.publish(task);
        }
        Ok(task)
    }

    /// Mark an active task completed. `result` is stored before the
    /// completion is published.
    pub async fn complete(
        &self,
        id: Uuid,
        result: &AgentResult,
        result_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        let task = self
            .db
            .finish_task(id, TaskState::Completed, None, result, result_expires_at)
            .await?;
        if let Some(ref task) = task {
            info!(task_id = %id, attempts = task.attempts, "Task completed");
            self.publish(task);
        }
        Ok(task)
    }

    pub async fn fail(
        &self,
        id: Uuid,
        reason: &str,
        result: &AgentResult,
        result_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        let task = self
            .db
            .finish_task(id, TaskState::Failed, Some(reason), result, result_expires_at)
            .await?;
        if let Some(ref task) = task {
            warn!(task_id = %id, attempts = task.attempts, reason, "Task failed");
            self.publish(task);
        }
        Ok(task)
    }

    /// Cancel a waiting or active task. `None` if it was not cancellable.
    pub async fn cancel(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let task = self.db.cancel_task(id).await?;
        if let Some(ref task) = task {
            info!(task_id = %id, "Task cancelled");
            self.publish(task);
        }
        Ok(task)
    }

    pub async fn assign_agent(&self, id: Uuid, agent: &str) -> Result<(), DatabaseError> {
        self.db.set_task_agent(id, agent).await
    }

    pub async fn heartbeat(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.db.touch_heartbeat(id, Utc::now()).await
    }

    /// Recover active tasks whose heartbeat is older than `liveness_timeout`.
    /// Tasks out of attempts fail with a result expiring at `result_expires_at`.
    pub async fn recover_stale(
        &self,
        liveness_timeout: Duration,
        max_attempts: u32,
        result_expires_at: DateTime<Utc>,
    ) -> Result<RecoveredTasks, DatabaseError> {
        let stale_before = Utc::now()
            - chrono::TimeDelta::from_std(liveness_timeout).unwrap_or(chrono::TimeDelta::zero());
        let recovered = self
            .db
            .recover_stale_tasks(stale_before, max_attempts, result_expires_at)
            .await?;
        for task in recovered.requeued.iter().chain(recovered.failed.iter()) {
            self.publish(task);
        }
        if !recovered.requeued.is_empty() {
            self.work.notify_waiters();
        }
        Ok(recovered)
    }

    /// Time until the next waiting task becomes eligible (zero if one already is).
    pub async fn next_eligible_in(&self) -> Result<Option<Duration>, DatabaseError> {
        let next = self.db.next_eligible_at().await?;
        Ok(next.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)))
    }

    /// Park until new work arrives, the next delayed task becomes eligible,
    /// or `max_wait` elapses.
    pub async fn wait_for_work(&self, max_wait: Duration) -> Result<(), DatabaseError> {
        let wait = match self.next_eligible_in().await? {
            Some(until) => until.min(max_wait),
            None => max_wait,
        };
        if wait.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.work.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.db.get_task(id).await
    }

    pub async fn list(
        &self,
        state: Option<TaskState>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.db.list_tasks(state, limit).await
    }

    pub async fn counts(&self) -> Result<TaskCounts, DatabaseError> {
        self.db.count_tasks_by_state().await
    }

    /// Delete terminal task records last touched more than `retention` ago.
    pub async fn prune(&self, retention: Duration) -> Result<usize, DatabaseError> {
        let before = chrono::TimeDelta::from_std(retention)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.db.prune_terminal_tasks(before).await
    }

    /// Sync event with every waiting and active task.
    pub async fn sync_event(&self) -> Result<QueueEvent, DatabaseError> {
        let mut tasks = Vec::new();
        for state in [TaskState::Active, TaskState::Waiting] {
            tasks.extend(
                self.db
                    .list_tasks(Some(state), SYNC_LIMIT)
                    .await?
                    .iter()
                    .map(TaskStatus::from),
            );
        }
        Ok(QueueEvent::TasksSync { tasks })
    }
}
