//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Queue transitions are
//! conditional `UPDATE … RETURNING` statements, so concurrent workers sharing
//! the connection never observe or claim the same task twice. Terminal
//! transitions write the task's result before the state change becomes
//! visible and remove it again if the transition misses.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Rows, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, RecoveredTasks, TaskCounts};
use crate::task::{
    AgentResult, ResultStatus, Task, TaskContext, TaskState, TaskType, UNASSIGNED,
};

/// Error recorded on tasks failed by the recovery sweep.
const INTERRUPTED: &str = "interrupted: worker stopped responding";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
/// Terminal transitions span several statements and hold `transitions`.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    transitions: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            transitions: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Claim the next eligible task, optionally skipping one agent's tasks.
    async fn claim(
        &self,
        now: DateTime<Utc>,
        skip_agent: Option<&str>,
    ) -> Result<Option<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks SET state = 'active', attempts = attempts + 1, heartbeat_at = ?1, updated_at = ?2 \
                     WHERE state = 'waiting' AND id = ( \
                         SELECT id FROM tasks WHERE state = 'waiting' AND eligible_at <= ?1 \
                         AND (?3 IS NULL OR agent IS NULL OR agent != ?3) \
                         ORDER BY priority DESC, seq ASC LIMIT 1 \
                     ) RETURNING {TASK_COLUMNS}"
                ),
                params![now.timestamp_millis(), timestamp(now), opt_text(skip_agent)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next_task: {e}")))?;
        first_task(rows, "claim_next_task").await
    }

    /// Insert `result` if its task is still active. Returns whether a row was
    /// written. Callers hold `transitions`.
    async fn stage_result(
        &self,
        result: &AgentResult,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO results (task_id, agent, status, output, error, duration_ms, created_at, expires_at) \
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8 \
                 WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ?1 AND state = 'active')",
                result_values(result, expires_at)?,
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stage_result: {e}")))?;
        Ok(inserted > 0)
    }

    /// Drop a staged result whose transition missed.
    async fn unstage_result(&self, task_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM results WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("unstage_result: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, task_type, agent, payload, context, priority, attempts, state, timeout_ms, error, seq, eligible_at, created_at, updated_at";

const RESULT_COLUMNS: &str = "task_id, agent, status, output, error, duration_ms";

/// Canonical timestamp format; fixed width so text comparison orders correctly.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<u64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n as i64),
        None => libsql::Value::Null,
    }
}

/// Bind values for a `results` row, in insert column order.
fn result_values(
    result: &AgentResult,
    expires_at: DateTime<Utc>,
) -> Result<Vec<libsql::Value>, DatabaseError> {
    let output = result
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("result {} output: {e}", result.task_id)))?;

    Ok(vec![
        libsql::Value::Text(result.task_id.to_string()),
        libsql::Value::Text(result.agent.clone()),
        libsql::Value::Text(result.status.as_str().to_string()),
        opt_text_owned(output),
        opt_text(result.error.as_deref()),
        libsql::Value::Integer(result.duration_ms as i64),
        libsql::Value::Text(timestamp(Utc::now())),
        libsql::Value::Integer(expires_at.timestamp_millis()),
    ])
}

/// Map a libsql Row to a Task.
///
/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));

    let id_str: String = row.get(0).map_err(parse_err)?;
    let type_str: String = row.get(1).map_err(parse_err)?;
    let payload_str: String = row.get(3).map_err(parse_err)?;
    let context_str: Option<String> = row.get(4).ok();
    let state_str: String = row.get(7).map_err(parse_err)?;
    let created_str: String = row.get(12).map_err(parse_err)?;
    let updated_str: String = row.get(13).map_err(parse_err)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task id '{id_str}': {e}")))?;
    let task_type: TaskType = type_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("task {id} type: {e}")))?;
    let state: TaskState = state_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("task {id} state: {e}")))?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("task {id} payload: {e}")))?;
    let context: Option<TaskContext> = match context_str {
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("task {id} context: {e}")))?,
        ),
        None => None,
    };

    Ok(Task {
        id,
        task_type,
        agent: row.get(2).ok(),
        payload,
        context,
        priority: row.get(5).map_err(parse_err)?,
        attempts: row.get::<i64>(6).map_err(parse_err)? as u32,
        state,
        timeout_ms: row.get::<i64>(8).ok().map(|ms| ms as u64),
        error: row.get(9).ok(),
        seq: row.get(10).map_err(parse_err)?,
        eligible_at: from_millis(row.get(11).map_err(parse_err)?),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an AgentResult. Column order matches RESULT_COLUMNS.
fn row_to_result(row: &libsql::Row) -> Result<AgentResult, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("result row parse: {e}"));

    let id_str: String = row.get(0).map_err(parse_err)?;
    let status_str: String = row.get(2).map_err(parse_err)?;
    let output_str: Option<String> = row.get(3).ok();

    let task_id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("result task id '{id_str}': {e}")))?;
    let status = match status_str.as_str() {
        "success" => ResultStatus::Success,
        "failure" => ResultStatus::Failure,
        other => {
            return Err(DatabaseError::Serialization(format!(
                "result {task_id} status: unknown '{other}'"
            )));
        }
    };
    let output = match output_str {
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("result {task_id} output: {e}")))?,
        ),
        None => None,
    };

    Ok(AgentResult {
        task_id,
        agent: row.get(1).map_err(parse_err)?,
        status,
        output,
        error: row.get(4).ok(),
        duration_ms: row.get::<i64>(5).map_err(parse_err)? as u64,
    })
}

async fn collect_tasks(mut rows: Rows, op: &str) -> Result<Vec<Task>, DatabaseError> {
    let mut tasks = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => tasks.push(row_to_task(&row)?),
            Ok(None) => return Ok(tasks),
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

async fn first_task(rows: Rows, op: &str) -> Result<Option<Task>, DatabaseError> {
    Ok(collect_tasks(rows, op).await?.into_iter().next())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<Task, DatabaseError> {
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| DatabaseError::Serialization(format!("insert_task payload: {e}")))?;
        let context = task
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("insert_task context: {e}")))?;

        let rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO tasks (id, task_type, agent, payload, context, priority, attempts, state, timeout_ms, error, seq, eligible_at, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, (SELECT COALESCE(MAX(seq), 0) + 1 FROM tasks), ?11, ?12, ?13) \
                     RETURNING {TASK_COLUMNS}"
                ),
                params![
                    task.id.to_string(),
                    task.task_type.as_str(),
                    opt_text(task.agent.as_deref()),
                    payload,
                    opt_text_owned(context),
                    task.priority,
                    task.attempts as i64,
                    task.state.as_str(),
                    opt_int(task.timeout_ms),
                    opt_text(task.error.as_deref()),
                    task.eligible_at.timestamp_millis(),
                    timestamp(task.created_at),
                    timestamp(task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        let stored = first_task(rows, "insert_task")
            .await?
            .ok_or_else(|| DatabaseError::Query("insert_task: no row returned".into()))?;
        debug!(task_id = %stored.id, seq = stored.seq, state = %stored.state, "Task inserted into DB");
        Ok(stored)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;
        first_task(rows, "get_task").await
    }

    async fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<Task>, DatabaseError> {
        self.claim(now, None).await
    }

    async fn claim_next_task_except(
        &self,
        now: DateTime<Utc>,
        agent: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        self.claim(now, Some(agent)).await
    }

    async fn next_eligible_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT MIN(eligible_at) FROM tasks WHERE state = 'waiting'", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("next_eligible_at: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).ok().map(from_millis)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("next_eligible_at: {e}"))),
        }
    }

    async fn reschedule_task(
        &self,
        id: Uuid,
        eligible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks SET state = 'waiting', eligible_at = ?1, error = ?2, heartbeat_at = NULL, updated_at = ?3 \
                     WHERE id = ?4 AND state = 'active' RETURNING {TASK_COLUMNS}"
                ),
                params![
                    eligible_at.timestamp_millis(),
                    error,
                    timestamp(Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_task: {e}")))?;
        first_task(rows, "reschedule_task").await
    }

    async fn requeue_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let now = Utc::now();
        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks SET state = 'waiting', attempts = MAX(attempts - 1, 0), \
                     seq = (SELECT MAX(seq) + 1 FROM tasks), eligible_at = ?1, heartbeat_at = NULL, updated_at = ?2 \
                     WHERE id = ?3 AND state = 'active' RETURNING {TASK_COLUMNS}"
                ),
                params![now.timestamp_millis(), timestamp(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_task: {e}")))?;
        first_task(rows, "requeue_task").await
    }

    async fn finish_task(
        &self,
        id: Uuid,
        state: TaskState,
        error: Option<&str>,
        result: &AgentResult,
        result_expires_at: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        if !matches!(state, TaskState::Completed | TaskState::Failed) {
            return Err(DatabaseError::Query(format!(
                "finish_task: {state} is not a completion state"
            )));
        }
        if result.task_id != id {
            return Err(DatabaseError::Query(format!(
                "finish_task: result belongs to task {}, not {id}",
                result.task_id
            )));
        }

        let _guard = self.transitions.lock().await;
        let staged = self.stage_result(result, result_expires_at).await?;
        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks SET state = ?1, error = ?2, heartbeat_at = NULL, updated_at = ?3 \
                     WHERE id = ?4 AND state = 'active' RETURNING {TASK_COLUMNS}"
                ),
                params![
                    state.as_str(),
                    opt_text(error),
                    timestamp(Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_task: {e}")))?;
        let task = first_task(rows, "finish_task").await?;

        if task.is_none() && staged {
            debug!(task_id = %id, "Task left active before finishing; dropping its result");
            self.unstage_result(id).await?;
        }
        Ok(task)
    }

    async fn cancel_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks SET state = 'cancelled', heartbeat_at = NULL, updated_at = ?1 \
                     WHERE id = ?2 AND state IN ('waiting', 'active') RETURNING {TASK_COLUMNS}"
                ),
                params![timestamp(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_task: {e}")))?;
        first_task(rows, "cancel_task").await
    }

    async fn set_task_agent(&self, id: Uuid, agent: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET agent = ?1, updated_at = ?2 WHERE id = ?3 AND state = 'active'",
                params![agent, timestamp(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task_agent: {e}")))?;
        Ok(())
    }

    async fn touch_heartbeat(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET heartbeat_at = ?1 WHERE id = ?2 AND state = 'active'",
                params![now.timestamp_millis(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_heartbeat: {e}")))?;
        Ok(())
    }

    async fn recover_stale_tasks(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
        result_expires_at: DateTime<Utc>,
    ) -> Result<RecoveredTasks, DatabaseError> {
        let now = Utc::now();
        let cutoff = stale_before.timestamp_millis();
        let _guard = self.transitions.lock().await;

        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE state = 'active' AND COALESCE(heartbeat_at, 0) < ?1 AND attempts >= ?2"
                ),
                params![cutoff, max_attempts as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_stale_tasks: {e}")))?;
        let exhausted = collect_tasks(rows, "recover_stale_tasks").await?;

        let mut failed = Vec::with_capacity(exhausted.len());
        for task in exhausted {
            let agent = task.agent.as_deref().unwrap_or(UNASSIGNED);
            let result = AgentResult::failure(task.id, agent, INTERRUPTED, Duration::ZERO);
            let staged = self.stage_result(&result, result_expires_at).await?;

            let rows = self
                .conn()
                .query(
                    &format!(
                        "UPDATE tasks SET state = 'failed', error = ?1, heartbeat_at = NULL, updated_at = ?2 \
                         WHERE id = ?3 AND state = 'active' AND COALESCE(heartbeat_at, 0) < ?4 \
                         RETURNING {TASK_COLUMNS}"
                    ),
                    params![INTERRUPTED, timestamp(now), task.id.to_string(), cutoff],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("recover_stale_tasks: {e}")))?;
            match first_task(rows, "recover_stale_tasks").await? {
                Some(task) => failed.push(task),
                None if staged => self.unstage_result(task.id).await?,
                None => {}
            }
        }

        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks SET state = 'waiting', eligible_at = ?1, heartbeat_at = NULL, updated_at = ?2 \
                     WHERE state = 'active' AND COALESCE(heartbeat_at, 0) < ?3 AND attempts < ?4 \
                     RETURNING {TASK_COLUMNS}"
                ),
                params![now.timestamp_millis(), timestamp(now), cutoff, max_attempts as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_stale_tasks: {e}")))?;
        let requeued = collect_tasks(rows, "recover_stale_tasks").await?;

        if !failed.is_empty() || !requeued.is_empty() {
            warn!(
                requeued = requeued.len(),
                failed = failed.len(),
                "Recovered interrupted tasks"
            );
        }
        Ok(RecoveredTasks { requeued, failed })
    }

    async fn list_tasks(
        &self,
        state: Option<TaskState>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let rows = match state {
            Some(state) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {TASK_COLUMNS} FROM tasks WHERE state = ?1 ORDER BY seq DESC LIMIT ?2"
                        ),
                        params![state.as_str(), limit as i64],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY seq DESC LIMIT ?1"),
                        params![limit as i64],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;
        collect_tasks(rows, "list_tasks").await
    }

    async fn count_tasks_by_state(&self) -> Result<TaskCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT state, COUNT(*) FROM tasks GROUP BY state", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_tasks_by_state: {e}")))?;

        let mut counts = TaskCounts::default();
        while let Ok(Some(row)) = rows.next().await {
            let state_str: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            if let Ok(state) = state_str.parse::<TaskState>() {
                counts.add(state, count as u64);
            }
        }
        Ok(counts)
    }

    async fn prune_terminal_tasks(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM tasks WHERE state IN ('completed', 'failed', 'cancelled') AND updated_at < ?1",
                params![timestamp(before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_terminal_tasks: {e}")))?;

        if count > 0 {
            info!(count, "Pruned terminal tasks from DB");
        }
        Ok(count as usize)
    }

    // ── Results ─────────────────────────────────────────────────────

    async fn put_result(
        &self,
        result: &AgentResult,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO results (task_id, agent, status, output, error, duration_ms, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                result_values(result, expires_at)?,
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_result: {e}")))?;

        if inserted == 0 {
            warn!(task_id = %result.task_id, "Result already stored; ignoring second write");
        }
        Ok(inserted > 0)
    }

    async fn get_result(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AgentResult>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RESULT_COLUMNS} FROM results WHERE task_id = ?1 AND expires_at > ?2"),
                params![task_id.to_string(), now.timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_result: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_result(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_result: {e}"))),
        }
    }

    async fn purge_expired_results(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM results WHERE expires_at <= ?1",
                params![now.timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired_results: {e}")))?;

        if count > 0 {
            info!(count, "Purged expired results");
        }
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRequest;
    use chrono::Duration;
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_task(task_type: TaskType, priority: i64) -> Task {
        let new = TaskRequest::new(task_type, json!({"file": "main.rs"}))
            .with_priority(priority)
            .validate()
            .unwrap();
        Task::from_new(new, Some("codex".into()))
    }

    async fn insert(db: &LibSqlBackend, priority: i64) -> Task {
        db.insert_task(&make_task(TaskType::GenerateCode, priority))
            .await
            .unwrap()
    }

    fn in_a_minute() -> DateTime<Utc> {
        Utc::now() + Duration::seconds(60)
    }

    fn output_of(id: Uuid) -> AgentResult {
        AgentResult::success(id, "codex", json!({"ok": true}), std::time::Duration::ZERO)
    }

    async fn complete(db: &LibSqlBackend, id: Uuid) -> Option<Task> {
        db.finish_task(id, TaskState::Completed, None, &output_of(id), in_a_minute())
            .await
            .unwrap()
    }

    // ── Task tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_by_id() {
        let db = test_db().await;
        let mut task = make_task(TaskType::Analyze, 3);
        task.context = Some(TaskContext {
            files: vec!["src/lib.rs".into()],
            ..Default::default()
        });
        task.timeout_ms = Some(1500);
        let stored = db.insert_task(&task).await.unwrap();

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched, stored);
        assert_eq!(fetched.task_type, TaskType::Analyze);
        assert_eq!(fetched.priority, 3);
        assert_eq!(fetched.payload["file"], "main.rs");
        assert_eq!(fetched.context.unwrap().files, vec!["src/lib.rs"]);
        assert_eq!(fetched.timeout_ms, Some(1500));
        assert_eq!(fetched.state, TaskState::Waiting);
    }

    #[tokio::test]
    async fn get_by_id_not_found() {
        let db = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seq_is_monotonic() {
        let db = test_db().await;
        let a = insert(&db, 1).await;
        let b = insert(&db, 1).await;
        let c = insert(&db, 9).await;
        assert!(a.seq < b.seq && b.seq < c.seq);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_seq() {
        let db = test_db().await;
        let low_a = insert(&db, 1).await;
        let low_b = insert(&db, 1).await;
        let high = insert(&db, 5).await;

        let now = Utc::now();
        let order: Vec<Uuid> = [
            db.claim_next_task(now).await.unwrap().unwrap(),
            db.claim_next_task(now).await.unwrap().unwrap(),
            db.claim_next_task(now).await.unwrap().unwrap(),
        ]
        .iter()
        .map(|t| t.id)
        .collect();
        assert_eq!(order, vec![high.id, low_a.id, low_b.id]);
        assert!(db.claim_next_task(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_marks_active_and_counts_attempt() {
        let db = test_db().await;
        let task = insert(&db, 1).await;

        let claimed = db.claim_next_task(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.state, TaskState::Active);
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn claim_skips_ineligible() {
        let db = test_db().await;
        insert(&db, 1).await;
        let claimed = db.claim_next_task(Utc::now()).await.unwrap().unwrap();

        let later = Utc::now() + Duration::seconds(30);
        db.reschedule_task(claimed.id, later, "boom").await.unwrap().unwrap();

        assert!(db.claim_next_task(Utc::now()).await.unwrap().is_none());
        let next = db.next_eligible_at().await.unwrap().unwrap();
        assert_eq!(next.timestamp_millis(), later.timestamp_millis());

        let again = db
            .claim_next_task(later + Duration::milliseconds(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(again.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_task() {
        let db = Arc::new(test_db().await);
        for _ in 0..20 {
            insert(&db, 1).await;
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = db.claim_next_task(Utc::now()).await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn requeue_moves_to_back_of_band() {
        let db = test_db().await;
        let first = insert(&db, 1).await;
        let second = insert(&db, 1).await;

        let claimed = db.claim_next_task(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        let released = db.requeue_task(first.id).await.unwrap().unwrap();
        assert_eq!(released.attempts, 0);
        assert!(released.seq > second.seq);

        let next = db.claim_next_task(Utc::now()).await.unwrap().unwrap();
        assert_eq!(next.id, second.id);
    }

    #[tokio::test]
    async fn finish_only_from_active() {
        let db = test_db().await;
        let task = insert(&db, 1).await;

        assert!(complete(&db, task.id).await.is_none());
        assert!(db.get_result(task.id, Utc::now()).await.unwrap().is_none());

        db.claim_next_task(Utc::now()).await.unwrap();
        let failure = AgentResult::failure(task.id, "codex", "agent exploded", std::time::Duration::ZERO);
        let done = db
            .finish_task(task.id, TaskState::Failed, Some("agent exploded"), &failure, in_a_minute())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.state, TaskState::Failed);
        assert_eq!(done.error.as_deref(), Some("agent exploded"));
        assert_eq!(db.get_result(task.id, Utc::now()).await.unwrap(), Some(failure));

        // Terminal rows are immutable.
        assert!(complete(&db, task.id).await.is_none());
        assert!(db.cancel_task(task.id).await.unwrap().is_none());
        assert!(
            db.finish_task(task.id, TaskState::Waiting, None, &output_of(task.id), in_a_minute())
                .await
                .is_err()
        );
        let stored = db.get_result(task.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(stored.status, ResultStatus::Failure);
    }

    #[tokio::test]
    async fn finish_stores_result_with_transition() {
        let db = test_db().await;
        let task = insert(&db, 1).await;
        db.claim_next_task(Utc::now()).await.unwrap();

        let done = complete(&db, task.id).await.unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(
            db.get_result(task.id, Utc::now()).await.unwrap(),
            Some(output_of(task.id))
        );
    }

    #[tokio::test]
    async fn finish_rejects_result_for_other_task() {
        let db = test_db().await;
        let task = insert(&db, 1).await;
        db.claim_next_task(Utc::now()).await.unwrap();

        let stray = output_of(Uuid::new_v4());
        assert!(
            db.finish_task(task.id, TaskState::Completed, None, &stray, in_a_minute())
                .await
                .is_err()
        );
        assert_eq!(db.get_task(task.id).await.unwrap().unwrap().state, TaskState::Active);
    }

    #[tokio::test]
    async fn cancel_blocks_later_transitions() {
        let db = test_db().await;
        let task = insert(&db, 1).await;
        db.claim_next_task(Utc::now()).await.unwrap();

        let cancelled = db.cancel_task(task.id).await.unwrap().unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        assert!(complete(&db, task.id).await.is_none());
        assert!(db.get_result(task.id, Utc::now()).await.unwrap().is_none());
        assert!(db.reschedule_task(task.id, Utc::now(), "x").await.unwrap().is_none());
        assert!(db.requeue_task(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_requeues_or_fails_stale_tasks() {
        let db = test_db().await;
        let fresh = insert(&db, 1).await;
        let exhausted = insert(&db, 1).await;

        db.claim_next_task(Utc::now()).await.unwrap();
        db.claim_next_task(Utc::now()).await.unwrap();
        let long_ago = (Utc::now() - Duration::minutes(10)).timestamp_millis();
        db.conn()
            .execute("UPDATE tasks SET heartbeat_at = ?1", params![long_ago])
            .await
            .unwrap();
        db.conn()
            .execute(
                "UPDATE tasks SET attempts = 3 WHERE id = ?1",
                params![exhausted.id.to_string()],
            )
            .await
            .unwrap();

        let recovered = db
            .recover_stale_tasks(Utc::now() - Duration::minutes(1), 3, in_a_minute())
            .await
            .unwrap();
        assert_eq!(recovered.requeued.len(), 1);
        assert_eq!(recovered.requeued[0].id, fresh.id);
        assert_eq!(recovered.requeued[0].state, TaskState::Waiting);
        assert_eq!(recovered.failed.len(), 1);
        assert_eq!(recovered.failed[0].id, exhausted.id);
        assert_eq!(recovered.failed[0].error.as_deref(), Some(INTERRUPTED));

        let result = db.get_result(exhausted.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.agent, "codex");
        assert_eq!(result.error.as_deref(), Some(INTERRUPTED));
        assert!(db.get_result(fresh.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_except_skips_named_agent() {
        let db = test_db().await;
        let busy = insert(&db, 5).await;
        let mut other = make_task(TaskType::GenerateCode, 1);
        other.agent = Some("gemini".into());
        let other = db.insert_task(&other).await.unwrap();

        let claimed = db
            .claim_next_task_except(Utc::now(), "codex")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, other.id);
        assert!(db.claim_next_task_except(Utc::now(), "codex").await.unwrap().is_none());
        assert_eq!(db.claim_next_task(Utc::now()).await.unwrap().unwrap().id, busy.id);
    }

    #[tokio::test]
    async fn heartbeat_keeps_task_alive() {
        let db = test_db().await;
        let task = insert(&db, 1).await;
        db.claim_next_task(Utc::now()).await.unwrap();
        let long_ago = (Utc::now() - Duration::minutes(10)).timestamp_millis();
        db.conn()
            .execute("UPDATE tasks SET heartbeat_at = ?1", params![long_ago])
            .await
            .unwrap();
        db.touch_heartbeat(task.id, Utc::now()).await.unwrap();

        let recovered = db
            .recover_stale_tasks(Utc::now() - Duration::minutes(1), 3, in_a_minute())
            .await
            .unwrap();
        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn list_and_count_by_state() {
        let db = test_db().await;
        insert(&db, 1).await;
        insert(&db, 1).await;
        let cancelled = insert(&db, 1).await;
        db.cancel_task(cancelled.id).await.unwrap();

        let waiting = db.list_tasks(Some(TaskState::Waiting), 10).await.unwrap();
        assert_eq!(waiting.len(), 2);
        assert!(waiting[0].seq > waiting[1].seq);
        assert_eq!(db.list_tasks(None, 1).await.unwrap().len(), 1);

        let counts = db.count_tasks_by_state().await.unwrap();
        assert_eq!(counts.waiting, 2);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn prune_removes_only_old_terminal_tasks() {
        let db = test_db().await;
        let waiting = insert(&db, 1).await;
        let cancelled = insert(&db, 1).await;
        db.cancel_task(cancelled.id).await.unwrap();

        assert_eq!(db.prune_terminal_tasks(Utc::now() - Duration::days(1)).await.unwrap(), 0);
        assert_eq!(db.prune_terminal_tasks(Utc::now() + Duration::seconds(1)).await.unwrap(), 1);
        assert!(db.get_task(waiting.id).await.unwrap().is_some());
        assert!(db.get_task(cancelled.id).await.unwrap().is_none());
    }

    // ── Result tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn result_roundtrip_and_passive_expiry() {
        let db = test_db().await;
        let id = Uuid::new_v4();
        let result = AgentResult::success(
            id,
            "codex",
            json!({"code": "fn main() {}"}),
            std::time::Duration::from_millis(42),
        );
        let expires = Utc::now() + Duration::seconds(60);
        assert!(db.put_result(&result, expires).await.unwrap());

        let fetched = db.get_result(id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(fetched, result);

        // Past the expiry the row is invisible even though it has not been purged.
        assert!(db.get_result(id, expires).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn results_are_write_once() {
        let db = test_db().await;
        let id = Uuid::new_v4();
        let expires = Utc::now() + Duration::seconds(60);
        let first = AgentResult::failure(id, "amp", "timeout", std::time::Duration::ZERO);
        let second = AgentResult::success(id, "amp", json!({}), std::time::Duration::ZERO);

        assert!(db.put_result(&first, expires).await.unwrap());
        assert!(!db.put_result(&second, expires).await.unwrap());
        let stored = db.get_result(id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(stored.status, ResultStatus::Failure);
    }

    #[tokio::test]
    async fn purge_deletes_expired_results() {
        let db = test_db().await;
        let old = AgentResult::success(Uuid::new_v4(), "gemini", json!({}), std::time::Duration::ZERO);
        let live = AgentResult::success(Uuid::new_v4(), "gemini", json!({}), std::time::Duration::ZERO);
        db.put_result(&old, Utc::now() - Duration::seconds(1)).await.unwrap();
        db.put_result(&live, Utc::now() + Duration::seconds(60)).await.unwrap();

        assert_eq!(db.purge_expired_results(Utc::now()).await.unwrap(), 1);
        assert!(db.get_result(live.task_id, Utc::now()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn waiting_tasks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            insert(&db, 2).await.id
        };

        let reopened = LibSqlBackend::new_local(&path).await.unwrap();
        let task = reopened.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Waiting);
        assert_eq!(task.priority, 2);
        let claimed = reopened.claim_next_task(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }
}
