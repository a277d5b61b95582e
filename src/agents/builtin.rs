//! Built-in agent catalogue.

use std::sync::Arc;

use super::executor::{AgentExecutor, EchoExecutor, HttpExecutor};
use super::registry::{AgentDescriptor, AgentRegistry};
use crate::config::AgentSettings;
use crate::error::AgentError;

/// The closed set of agents the orchestrator ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinAgent {
    Continue,
    OpenCode,
    Codex,
    Amp,
    Gemini,
}

impl BuiltinAgent {
    /// Registration order. The general-purpose agent comes first so it is
    /// preferred whenever it is enabled.
    pub const ALL: [BuiltinAgent; 5] = [
        Self::Continue,
        Self::OpenCode,
        Self::Codex,
        Self::Amp,
        Self::Gemini,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::OpenCode => "opencode",
            Self::Codex => "codex",
            Self::Amp => "amp",
            Self::Gemini => "gemini",
        }
    }

    /// Prefix of this agent's environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::OpenCode => "OPENCODE",
            Self::Codex => "CODEX",
            Self::Amp => "AMP",
            Self::Gemini => "GEMINI",
        }
    }

    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::Continue => &[
                "code-review",
                "generate-code",
                "refactor",
                "analyze",
                "document",
                "chat",
                "explain",
                "debug",
            ],
            Self::OpenCode => &["code-review"],
            Self::Codex => &["generate-code"],
            Self::Amp => &["complex-task", "refactor"],
            Self::Gemini => &["analyze", "document"],
        }
    }

    pub fn descriptor(&self, settings: &AgentSettings) -> AgentDescriptor {
        AgentDescriptor::new(self.name(), self.capabilities().iter().copied())
            .enabled(settings.enabled)
            .max_concurrent(settings.max_concurrent)
    }

    /// Remote executor when an endpoint is configured, local echo otherwise.
    pub fn executor(&self, settings: &AgentSettings) -> Result<Arc<dyn AgentExecutor>, AgentError> {
        match settings.endpoint {
            Some(ref url) => Ok(Arc::new(HttpExecutor::new(
                self.name(),
                url.clone(),
                settings.api_key.clone(),
            )?)),
            None => Ok(Arc::new(EchoExecutor)),
        }
    }
}

/// Register every built-in agent with its settings.
pub async fn register_builtin_agents(
    registry: &AgentRegistry,
    settings: impl Fn(BuiltinAgent) -> AgentSettings,
) -> Result<(), AgentError> {
    for agent in BuiltinAgent::ALL {
        let agent_settings = settings(agent);
        let executor = agent.executor(&agent_settings)?;
        tracing::info!(
            agent = agent.name(),
            enabled = agent_settings.enabled,
            max_concurrent = agent_settings.max_concurrent,
            remote = agent_settings.endpoint.is_some(),
            "Agent configured"
        );
        registry
            .register(agent.descriptor(&agent_settings), executor)
            .await;
    }
    Ok(())
}
