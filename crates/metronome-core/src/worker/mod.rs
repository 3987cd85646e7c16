//! Worker runtime: claim, execute, complete, heartbeat, recover

mod completer;
mod runtime;

pub use completer::Completer;
pub use runtime::{Worker, WorkerConfig, WorkerError};
