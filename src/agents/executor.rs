//! Agent execution capability.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::error::AgentError;
use crate::task::Task;

/// Default HTTP request timeout for remote agents.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Uniform execution interface every agent backend implements.
///
/// Any returned error is treated as retryable unless it is
/// [`AgentError::Rejected`].
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, AgentError>;
}

/// Local executor that acknowledges the task without doing any work.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, AgentError> {
        let agent = task.agent.as_deref().unwrap_or("unassigned");
        Ok(json!({
            "message": format!("Task {} processed by {}", task.id, agent),
        }))
    }
}

/// Executor that forwards the task to a remote agent endpoint as JSON.
pub struct HttpExecutor {
    name: String,
    endpoint: String,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, AgentError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Http {
                agent: name.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            name,
            endpoint: endpoint.into(),
            api_key,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AgentExecutor for HttpExecutor {
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, AgentError> {
        let body = json!({
            "task_id": task.id,
            "type": task.task_type,
            "payload": task.payload,
            "context": task.context,
            "attempt": task.attempts,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| AgentError::Http {
            agent: self.name.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| AgentError::ExecutionFailed {
                    agent: self.name.clone(),
                    reason: format!("Invalid response body: {e}"),
                });
        }

        let text = response.text().await.unwrap_or_default();
        let reason = format!("HTTP {status}: {}", text.trim());
        if status.is_client_error()
            && status != StatusCode::REQUEST_TIMEOUT
            && status != StatusCode::TOO_MANY_REQUESTS
        {
            Err(AgentError::Rejected {
                agent: self.name.clone(),
                reason,
            })
        } else {
            Err(AgentError::ExecutionFailed {
                agent: self.name.clone(),
                reason,
            })
        }
    }
}
