//! Submission API: the façade transports and embedders talk to.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::agents::{AgentDescriptor, AgentRegistry, AgentStatus};
use crate::dispatch::{DurableQueue, QueueEvent, ResultStore};
use crate::error::{DispatchError, Result};
use crate::store::TaskCounts;
use crate::task::{AgentResult, Submission, TaskRequest, TaskState, TaskStatus};

/// Default page size for task listings.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Largest page a listing may request.
pub const MAX_LIST_LIMIT: usize = 500;

/// Task counts plus the live state of every agent.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub tasks: TaskCounts,
    pub agents: Vec<AgentStatus>,
}

#[derive(Clone)]
pub struct Orchestrator {
    queue: Arc<DurableQueue>,
    registry: Arc<AgentRegistry>,
    results: Arc<ResultStore>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<DurableQueue>,
        registry: Arc<AgentRegistry>,
        results: Arc<ResultStore>,
    ) -> Self {
        Self {
            queue,
            registry,
            results,
        }
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    /// Validate, route and admit a task.
    ///
    /// When no enabled agent can serve the task it is admitted directly as
    /// failed and the submission carries the reason.
    pub async fn submit(&self, request: TaskRequest) -> Result<Submission> {
        let new = request.validate()?;

        match self.registry.route(new.task_type, new.agent.as_deref()).await {
            Ok(agent) => {
                let task = self.queue.enqueue(new, agent).await?;
                Ok(Submission {
                    task_id: task.id,
                    agent: task.agent,
                    state: task.state,
                    reason: None,
                })
            }
            Err(e @ DispatchError::NoAgentAvailable { .. }) => {
                let reason = e.to_string();
                let task = self.queue.admit_failed(new, &reason).await?;
                Ok(Submission {
                    task_id: task.id,
                    agent: None,
                    state: task.state,
                    reason: Some(reason),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn status(&self, id: Uuid) -> Result<TaskStatus> {
        let task = self
            .queue
            .get(id)
            .await?
            .ok_or_else(|| DispatchError::task_not_found(id))?;
        Ok(TaskStatus::from(&task))
    }

    /// The stored result, or `None` if the task has not finished, never
    /// produced one, or the result has expired.
    pub async fn result(&self, id: Uuid) -> Result<Option<AgentResult>> {
        Ok(self.results.get(id).await?)
    }

    /// Cancel a waiting or active task. A task that is already terminal is
    /// left unchanged and its current status returned.
    pub async fn cancel(&self, id: Uuid) -> Result<TaskStatus> {
        if let Some(task) = self.queue.cancel(id).await? {
            return Ok(TaskStatus::from(&task));
        }
        self.status(id).await
    }

    pub async fn list_agents(&self) -> Vec<AgentDescriptor> {
        self.registry.list().await
    }

    pub async fn describe_agent(&self, name: &str) -> Result<AgentDescriptor> {
        Ok(self.registry.describe(name).await?)
    }

    pub async fn set_agent_enabled(&self, name: &str, enabled: bool) -> Result<AgentDescriptor> {
        Ok(self.registry.set_enabled(name, enabled).await?)
    }

    pub async fn set_agent_max_concurrent(&self, name: &str, max: usize) -> Result<AgentDescriptor> {
        if max == 0 {
            return Err(DispatchError::Validation("max_concurrent must be at least 1".into()).into());
        }
        Ok(self.registry.set_max_concurrent(name, max).await?)
    }

    pub async fn agent_status(&self, name: &str) -> Result<AgentStatus> {
        Ok(self.registry.status(name).await?)
    }

    /// Most recently admitted tasks first. `limit` is clamped to
    /// [`MAX_LIST_LIMIT`].
    pub async fn list_tasks(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<TaskStatus>> {
        let tasks = self.queue.list(state, limit.clamp(1, MAX_LIST_LIMIT)).await?;
        Ok(tasks.iter().map(TaskStatus::from).collect())
    }

    pub async fn system_status(&self) -> Result<SystemStatus> {
        Ok(SystemStatus {
            tasks: self.queue.counts().await?,
            agents: self.registry.statuses().await,
        })
    }

    /// Subscribe to task lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }
}
