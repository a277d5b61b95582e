//! Routing policy: picks the agent for a task from registry state.

use super::registry::AgentDescriptor;
use crate::error::DispatchError;
use crate::task::TaskType;

/// Choose an agent for `task_type`.
///
/// An explicitly requested agent wins when it is enabled and declares the
/// capability. Otherwise the first enabled, capable agent in registration
/// order is chosen. There is no fallback to an agent lacking the capability.
pub fn route(
    task_type: TaskType,
    requested: Option<&str>,
    agents: &[AgentDescriptor],
) -> Result<String, DispatchError> {
    let qualifies = |a: &AgentDescriptor| a.enabled && a.serves(task_type);

    if let Some(name) = requested {
        if let Some(agent) = agents.iter().find(|a| a.name == name && qualifies(a)) {
            return Ok(agent.name.clone());
        }
        tracing::debug!(
            requested = %name,
            task_type = %task_type,
            "Requested agent cannot serve task, falling back to registry scan"
        );
    }

    agents
        .iter()
        .find(|a| qualifies(a))
        .map(|a| a.name.clone())
        .ok_or(DispatchError::NoAgentAvailable { task_type })
}
