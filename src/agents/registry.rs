//! Agent registry: process-wide agent configuration and execution handles.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};

use super::executor::AgentExecutor;
use super::router;
use crate::error::DispatchError;
use crate::task::TaskType;

/// Snapshot of an agent's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub enabled: bool,
    /// Task-type strings this agent can serve.
    pub capabilities: BTreeSet<String>,
    pub max_concurrent: usize,
}

impl AgentDescriptor {
    pub fn new<I, S>(name: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            enabled: true,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            max_concurrent: 1,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn serves(&self, task_type: TaskType) -> bool {
        self.capabilities.contains(task_type.as_str())
    }
}

/// Runtime counters for one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub enabled: bool,
    pub max_concurrent: usize,
    pub current_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub avg_duration_ms: u64,
}

/// A registered agent. Mutable fields are individual atomics so flag flips
/// never contend with in-flight dispatch.
pub struct RegisteredAgent {
    name: String,
    capabilities: BTreeSet<String>,
    enabled: AtomicBool,
    max_concurrent: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
    executor: Arc<dyn AgentExecutor>,
    capacity: Arc<Notify>,
}

impl RegisteredAgent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn serves(&self, task_type: TaskType) -> bool {
        self.capabilities.contains(task_type.as_str())
    }

    pub fn executor(&self) -> &Arc<dyn AgentExecutor> {
        &self.executor
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            name: self.name.clone(),
            enabled: self.is_enabled(),
            capabilities: self.capabilities.clone(),
            max_concurrent: self.max_concurrent.load(Ordering::SeqCst),
        }
    }

    /// Reserve one execution slot, or `None` if the agent is at its cap.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AgentPermit> {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= self.max_concurrent.load(Ordering::SeqCst) {
                return None;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(AgentPermit {
                        agent: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn record_success(&self, duration: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, duration: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn status(&self) -> AgentStatus {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let avg_duration_ms = if finished == 0 {
            0
        } else {
            self.total_duration_ms.load(Ordering::Relaxed) / finished
        };
        AgentStatus {
            name: self.name.clone(),
            enabled: self.is_enabled(),
            max_concurrent: self.max_concurrent.load(Ordering::SeqCst),
            current_tasks: self.in_flight(),
            completed_tasks: completed,
            failed_tasks: failed,
            avg_duration_ms,
        }
    }
}

/// Execution slot on an agent; released on drop.
pub struct AgentPermit {
    agent: Arc<RegisteredAgent>,
}

impl AgentPermit {
    pub fn agent(&self) -> &Arc<RegisteredAgent> {
        &self.agent
    }
}

impl Drop for AgentPermit {
    fn drop(&mut self) {
        self.agent.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.agent.capacity.notify_waiters();
    }
}

/// Registry of agents, kept in registration order.
pub struct AgentRegistry {
    agents: RwLock<Vec<Arc<RegisteredAgent>>>,
    /// Signalled whenever any permit is released.
    capacity: Arc<Notify>,
}

impl AgentRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(Vec::new()),
            capacity: Arc::new(Notify::new()),
        }
    }

    /// Register an agent, replacing any existing entry with the same name.
    /// A replacement keeps the original registration position.
    pub async fn register(&self, descriptor: AgentDescriptor, executor: Arc<dyn AgentExecutor>) {
        let entry = Arc::new(RegisteredAgent {
            name: descriptor.name.clone(),
            capabilities: descriptor.capabilities,
            enabled: AtomicBool::new(descriptor.enabled),
            max_concurrent: AtomicUsize::new(descriptor.max_concurrent),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            executor,
            capacity: Arc::clone(&self.capacity),
        });

        let mut agents = self.agents.write().await;
        if let Some(slot) = agents.iter_mut().find(|a| a.name == descriptor.name) {
            *slot = entry;
            tracing::debug!(agent = %descriptor.name, "Replaced agent registration");
        } else {
            agents.push(entry);
            tracing::debug!(agent = %descriptor.name, "Registered agent");
        }
    }

    /// Get a registered agent by name.
    pub async fn get(&self, name: &str) -> Option<Arc<RegisteredAgent>> {
        self.agents
            .read()
            .await
            .iter()
            .find(|a| a.name == name)
            .cloned()
    }

    async fn require(&self, name: &str) -> Result<Arc<RegisteredAgent>, DispatchError> {
        self.get(name)
            .await
            .ok_or_else(|| DispatchError::agent_not_found(name))
    }

    /// Enable or disable an agent. Visible to the next routing decision.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<AgentDescriptor, DispatchError> {
        let agent = self.require(name).await?;
        agent.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(agent = %name, enabled, "Agent availability changed");
        Ok(agent.descriptor())
    }

    /// Change an agent's concurrency cap. Running executions are unaffected.
    pub async fn set_max_concurrent(&self, name: &str, max: usize) -> Result<AgentDescriptor, DispatchError> {
        let agent = self.require(name).await?;
        agent.max_concurrent.store(max, Ordering::SeqCst);
        self.capacity.notify_waiters();
        tracing::info!(agent = %name, max_concurrent = max, "Agent concurrency changed");
        Ok(agent.descriptor())
    }

    pub async fn describe(&self, name: &str) -> Result<AgentDescriptor, DispatchError> {
        Ok(self.require(name).await?.descriptor())
    }

    pub async fn status(&self, name: &str) -> Result<AgentStatus, DispatchError> {
        Ok(self.require(name).await?.status())
    }

    /// All agents in registration order.
    pub async fn list(&self) -> Vec<AgentDescriptor> {
        self.agents
            .read()
            .await
            .iter()
            .map(|a| a.descriptor())
            .collect()
    }

    /// Runtime counters of every agent, in registration order.
    pub async fn statuses(&self) -> Vec<AgentStatus> {
        self.agents
            .read()
            .await
            .iter()
            .map(|a| a.status())
            .collect()
    }

    /// Route against the live registry state.
    pub async fn route(&self, task_type: TaskType, requested: Option<&str>) -> Result<String, DispatchError> {
        router::route(task_type, requested, &self.list().await)
    }

    /// Wait until some agent releases capacity.
    pub async fn capacity_released(&self) {
        self.capacity.notified().await;
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
