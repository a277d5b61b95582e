//! Dispatcher: worker pool that executes queued tasks through the registry.
//!
//! Each worker loops: dequeue → resolve agent → reserve a slot → execute with
//! optional timeout while refreshing the task heartbeat → record the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::queue::DurableQueue;
use super::results::ResultStore;
use crate::agents::{AgentRegistry, RegisteredAgent};
use crate::config::{DispatcherConfig, MaintenanceConfig};
use crate::error::{AgentError, DatabaseError, DispatchError};
use crate::task::{AgentResult, Task, UNASSIGNED};

/// What happened to a dequeued task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Scheduled for another attempt after `delay`.
    Retrying { delay: Duration },
    Failed,
    /// `agent` was at its concurrency cap; task returned to the queue.
    Released { agent: String },
    /// Cancelled while executing; the outcome was discarded.
    Discarded,
}

/// Counts from one maintenance sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub interrupted: usize,
    pub purged_results: usize,
    pub pruned_tasks: usize,
}

/// Shortest period handed to `tokio::time::interval`, which rejects zero.
const MIN_TICK: Duration = Duration::from_millis(1);

pub struct Dispatcher {
    queue: Arc<DurableQueue>,
    registry: Arc<AgentRegistry>,
    results: Arc<ResultStore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<DurableQueue>,
        registry: Arc<AgentRegistry>,
        results: Arc<ResultStore>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            registry,
            results,
            config,
        })
    }

    /// Run the worker pool until `shutdown` flips to true.
    ///
    /// A store failure in any worker stops the whole pool and is returned.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), DatabaseError> {
        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers {
            workers.spawn(Arc::clone(&self).worker_loop(worker, shutdown.clone()));
        }
        info!(workers = self.config.workers, "Dispatcher started");

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Worker stopped on store error, shutting down pool");
                    workers.abort_all();
                    return Err(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Worker panicked"),
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DatabaseError> {
        debug!(worker, "Worker started");
        while !*shutdown.borrow() {
            let mut outcome = self.run_once().await?;
            // Other agents' tasks get a turn before parking on capacity.
            if let Some(TaskOutcome::Released { agent }) = &outcome
                && let Some(other) = self.run_once_except(agent).await?
            {
                outcome = Some(other);
            }
            match outcome {
                Some(TaskOutcome::Released { .. }) => {
                    tokio::select! {
                        _ = self.registry.capacity_released() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        changed = shutdown.changed() => if changed.is_err() { break },
                    }
                }
                Some(_) => {}
                None => {
                    tokio::select! {
                        waited = self.queue.wait_for_work(self.config.poll_interval) => waited?,
                        changed = shutdown.changed() => if changed.is_err() { break },
                    }
                }
            }
        }
        debug!(worker, "Worker stopped");
        Ok(())
    }

    /// Dequeue and process at most one task.
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>, DatabaseError> {
        match self.queue.dequeue().await? {
            Some(task) => self.process(task).await.map(Some),
            None => Ok(None),
        }
    }

    /// Dequeue and process at most one task not assigned to `agent`.
    pub async fn run_once_except(&self, agent: &str) -> Result<Option<TaskOutcome>, DatabaseError> {
        match self.queue.dequeue_except(agent).await? {
            Some(task) => self.process(task).await.map(Some),
            None => Ok(None),
        }
    }

    async fn process(&self, task: Task) -> Result<TaskOutcome, DatabaseError> {
        let agent = match self.resolve_agent(&task).await {
            Ok(agent) => agent,
            Err(e) => {
                let reason = e.to_string();
                let agent = task.agent.as_deref().unwrap_or(UNASSIGNED);
                return self
                    .finish_failed(&task, agent, &reason, Duration::ZERO)
                    .await;
            }
        };

        let Some(permit) = agent.try_acquire() else {
            debug!(task_id = %task.id, agent = agent.name(), "Agent at capacity, releasing task");
            self.queue.release(task.id).await?;
            return Ok(TaskOutcome::Released {
                agent: agent.name().to_string(),
            });
        };

        let mut task = task;
        if task.agent.as_deref() != Some(agent.name()) {
            info!(
                task_id = %task.id,
                from = task.agent.as_deref().unwrap_or(UNASSIGNED),
                to = agent.name(),
                "Task rerouted"
            );
            self.queue.assign_agent(task.id, agent.name()).await?;
            task.agent = Some(agent.name().to_string());
        }

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            agent = agent.name(),
            attempt = task.attempts,
            "Executing task"
        );
        let started = Instant::now();
        let outcome = self.execute(&agent, &task).await?;
        let elapsed = started.elapsed();
        drop(permit);

        match outcome {
            Ok(output) => {
                agent.record_success(elapsed);
                let result = AgentResult::success(task.id, agent.name(), output, elapsed);
                if self
                    .queue
                    .complete(task.id, &result, self.results.expires_at())
                    .await?
                    .is_none()
                {
                    info!(task_id = %task.id, "Task cancelled during execution, discarding output");
                    return Ok(TaskOutcome::Discarded);
                }
                Ok(TaskOutcome::Completed)
            }
            Err(e) => {
                agent.record_failure(elapsed);
                let reason = e.to_string();
                if e.is_retryable() && self.config.retry.allows_retry(task.attempts) {
                    let delay = self.config.retry.backoff(task.attempts);
                    warn!(task_id = %task.id, attempt = task.attempts, error = %reason, "Task attempt failed, retrying");
                    if self.queue.reschedule(task.id, delay, &reason).await?.is_none() {
                        return Ok(TaskOutcome::Discarded);
                    }
                    Ok(TaskOutcome::Retrying { delay })
                } else {
                    self.finish_failed(&task, agent.name(), &reason, elapsed).await
                }
            }
        }
    }

    /// The assigned agent if it can still serve the task, otherwise a fresh
    /// routing decision.
    async fn resolve_agent(&self, task: &Task) -> Result<Arc<RegisteredAgent>, DispatchError> {
        if let Some(name) = task.agent.as_deref()
            && let Some(agent) = self.registry.get(name).await
            && agent.is_enabled()
            && agent.serves(task.task_type)
        {
            return Ok(agent);
        }

        let name = self.registry.route(task.task_type, None).await?;
        self.registry
            .get(&name)
            .await
            .ok_or_else(|| DispatchError::agent_not_found(&name))
    }

    /// Execute while keeping the task heartbeat fresh.
    async fn execute(
        &self,
        agent: &RegisteredAgent,
        task: &Task,
    ) -> Result<Result<serde_json::Value, AgentError>, DatabaseError> {
        let call = AssertUnwindSafe(agent.executor().execute(task)).catch_unwind();
        let execution = async {
            let result = match task.timeout() {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(AgentError::Timeout {
                            agent: agent.name().to_string(),
                            timeout: limit,
                        });
                    }
                },
                None => call.await,
            };
            result.unwrap_or_else(|_| {
                Err(AgentError::ExecutionFailed {
                    agent: agent.name().to_string(),
                    reason: "agent panicked".into(),
                })
            })
        };
        tokio::pin!(execution);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval.max(MIN_TICK));
        heartbeat.tick().await;
        loop {
            tokio::select! {
                result = &mut execution => return Ok(result),
                _ = heartbeat.tick() => self.queue.heartbeat(task.id).await?,
            }
        }
    }

    async fn finish_failed(
        &self,
        task: &Task,
        agent: &str,
        reason: &str,
        elapsed: Duration,
    ) -> Result<TaskOutcome, DatabaseError> {
        let result = AgentResult::failure(task.id, agent, reason, elapsed);
        if self
            .queue
            .fail(task.id, reason, &result, self.results.expires_at())
            .await?
            .is_none()
        {
            return Ok(TaskOutcome::Discarded);
        }
        Ok(TaskOutcome::Failed)
    }

    /// Recover interrupted tasks, purge expired results and prune old task rows.
    pub async fn sweep(&self, maintenance: &MaintenanceConfig) -> Result<SweepReport, DatabaseError> {
        let recovered = self
            .queue
            .recover_stale(
                maintenance.liveness_timeout,
                self.config.retry.max_attempts,
                self.results.expires_at(),
            )
            .await?;

        let report = SweepReport {
            requeued: recovered.requeued.len(),
            interrupted: recovered.failed.len(),
            purged_results: self.results.purge_expired().await?,
            pruned_tasks: self.queue.prune(maintenance.task_retention).await?,
        };
        if report != SweepReport::default() {
            info!(?report, "Maintenance sweep");
        }
        Ok(report)
    }

    /// Spawn the periodic maintenance sweep. The first sweep runs one
    /// interval after spawning.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        maintenance: MaintenanceConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), DatabaseError>> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(maintenance.interval.max(MIN_TICK));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        dispatcher.sweep(&maintenance).await?;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
        })
    }
}
