//! Task model and lifecycle.
//!
//! - `model`: Task, requests, results and status views
//! - `state`: state machine (Waiting → Active → Completed/Failed/Cancelled) and retry policy

pub mod model;
pub mod state;

pub use model::{
    AgentResult, DEFAULT_PRIORITY, NewTask, ResultStatus, Submission, Task, TaskContext,
    TaskRequest, TaskStatus, TaskType, UNASSIGNED,
};
pub use state::{RetryPolicy, TaskState};
