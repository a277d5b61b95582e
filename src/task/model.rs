//! Task and result data model.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TaskState;
use crate::error::DispatchError;

/// Default priority for tasks that do not declare one.
pub const DEFAULT_PRIORITY: i64 = 1;

/// Agent name recorded on results of tasks that never reached an agent.
pub const UNASSIGNED: &str = "unassigned";

/// Kind of work a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    CodeReview,
    GenerateCode,
    Refactor,
    Analyze,
    Document,
    ComplexTask,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        Self::CodeReview,
        Self::GenerateCode,
        Self::Refactor,
        Self::Analyze,
        Self::Document,
        Self::ComplexTask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeReview => "code-review",
            Self::GenerateCode => "generate-code",
            Self::Refactor => "refactor",
            Self::Analyze => "analyze",
            Self::Document => "document",
            Self::ComplexTask => "complex-task",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|t| t.as_str()).collect();
                DispatchError::Validation(format!(
                    "invalid task type '{s}', must be one of: {}",
                    valid.join(", ")
                ))
            })
    }
}

/// Auxiliary data handed to the agent untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// A unit of work owned by the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Routed (or operator-forced) agent.
    pub agent: Option<String>,
    pub payload: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TaskContext>,
    pub priority: i64,
    pub attempts: u32,
    pub state: TaskState,
    /// Wall-clock budget for one execution call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Last failure reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Admission order; breaks ties within a priority band.
    pub seq: i64,
    pub eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a task from a validated request. Id, state and ordering fields are
    /// provisional until the queue admits it.
    pub fn from_new(new: NewTask, agent: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: new.task_type,
            agent,
            payload: new.payload,
            context: new.context,
            priority: new.priority,
            attempts: 0,
            state: TaskState::Waiting,
            timeout_ms: new.timeout_ms,
            error: None,
            seq: 0,
            eligible_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Raw submission as it arrives from a transport; nothing is trusted yet.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub agent: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub context: Option<TaskContext>,
    pub priority: Option<i64>,
    pub timeout_ms: Option<u64>,
}

/// A submission that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: TaskType,
    pub agent: Option<String>,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub context: Option<TaskContext>,
    pub priority: i64,
    pub timeout_ms: Option<u64>,
}

impl TaskRequest {
    pub fn new(task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            task_type: Some(task_type.as_str().to_string()),
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Check required fields and enumerations.
    pub fn validate(self) -> Result<NewTask, DispatchError> {
        let type_str = self
            .task_type
            .ok_or_else(|| DispatchError::Validation("missing required field: type".into()))?;
        let task_type: TaskType = type_str.parse()?;

        let payload = match self.payload {
            Some(serde_json::Value::Object(map)) => map,
            Some(_) => {
                return Err(DispatchError::Validation(
                    "payload must be a JSON object".into(),
                ));
            }
            None => {
                return Err(DispatchError::Validation(
                    "missing required field: payload".into(),
                ));
            }
        };

        if self.timeout_ms == Some(0) {
            return Err(DispatchError::Validation(
                "timeout_ms must be greater than zero".into(),
            ));
        }

        let agent = self
            .agent
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        Ok(NewTask {
            task_type,
            agent,
            payload,
            context: self.context,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            timeout_ms: self.timeout_ms,
        })
    }
}

/// Outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Immutable record of a task's terminal attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub task_id: Uuid,
    pub agent: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AgentResult {
    pub fn success(task_id: Uuid, agent: &str, output: serde_json::Value, duration: Duration) -> Self {
        Self {
            task_id,
            agent: agent.to_string(),
            status: ResultStatus::Success,
            output: Some(output),
            error: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failure(task_id: Uuid, agent: &str, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id,
            agent: agent.to_string(),
            status: ResultStatus::Failure,
            output: None,
            error: Some(error.into()),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Public view of a task's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub agent: Option<String>,
    pub state: TaskState,
    pub attempts: u32,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskStatus {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            agent: task.agent.clone(),
            state: task.state,
            attempts: task.attempts,
            priority: task.priority,
            error: task.error.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// What the submitter learns synchronously.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub task_id: Uuid,
    pub agent: Option<String>,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
