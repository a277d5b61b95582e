//! HTTP + WebSocket transport over the submission API.

pub mod routes;
pub mod ws;

pub use routes::{AppState, api_routes};
