//! Task dispatch: durable queue, result store and the worker pool.

pub mod dispatcher;
pub mod queue;
pub mod results;

pub use dispatcher::{Dispatcher, SweepReport, TaskOutcome};
pub use queue::{DurableQueue, QueueEvent};
pub use results::ResultStore;
