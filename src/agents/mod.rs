//! Agents: registry, routing policy and execution backends.

pub mod builtin;
pub mod executor;
pub mod registry;
pub mod router;

pub use builtin::{BuiltinAgent, register_builtin_agents};
pub use executor::{AgentExecutor, EchoExecutor, HttpExecutor};
pub use registry::{AgentDescriptor, AgentPermit, AgentRegistry, AgentStatus, RegisteredAgent};
pub use router::route;
