//! MCP Orchestrator: task dispatch and lifecycle engine.

pub mod agents;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod service;
pub mod store;
pub mod task;

pub use service::Orchestrator;
