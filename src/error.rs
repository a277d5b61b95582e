//! Error types for the orchestrator.

use std::time::Duration;

use crate::task::TaskType;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors. Any of these means the durable store is unusable.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced synchronously by the submission API.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid task: {0}")]
    Validation(String),

    #[error("No enabled agent can serve task type {task_type}")]
    NoAgentAvailable { task_type: TaskType },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl DispatchError {
    pub fn task_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "Task",
            id: id.to_string(),
        }
    }

    pub fn agent_not_found(name: impl ToString) -> Self {
        Self::NotFound {
            entity: "Agent",
            id: name.to_string(),
        }
    }
}

/// Errors raised by an agent's execution call.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {agent} execution failed: {reason}")]
    ExecutionFailed { agent: String, reason: String },

    /// The agent refused the task outright; retrying cannot help.
    #[error("Agent {agent} rejected the task: {reason}")]
    Rejected { agent: String, reason: String },

    #[error("Agent {agent} timed out after {timeout:?}")]
    Timeout { agent: String, timeout: Duration },

    #[error("Agent {agent} request failed: {reason}")]
    Http { agent: String, reason: String },
}

impl AgentError {
    /// Whether the dispatcher may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
