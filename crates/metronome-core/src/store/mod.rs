//! Durable state: the execution store trait and its implementations

mod memory;
mod postgres;
#[allow(clippy::module_inception)]
mod store;

pub use memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;
pub use store::{
    ExecutionStore, FailOutcome, QueueWakeup, RecoveredWork, StoreError,
};
