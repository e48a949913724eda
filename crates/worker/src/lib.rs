//! `worker` crate — the `TaskExecutor` trait, built-in executors and a test
//! double.
//!
//! Anything that runs tasks for the engine implements [`TaskExecutor`]. The
//! queue crate picks an executor by task type and turns its outcome into the
//! `TaskExecutionResult` the scheduler reads back.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod traits;

pub use builtin::{EchoExecutor, ShellExecutor};
pub use error::WorkerError;
pub use mock::MockExecutor;
pub use traits::{ExecutionContext, TaskExecutor};
