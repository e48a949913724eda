//! `queue` crate — an in-process worker fleet behind the engine's
//! execution boundary.
//!
//! [`WorkerPool`] accepts dispatched tasks on a bounded channel, runs them
//! on a fixed set of tokio workers through the executor registered for
//! their task type, and writes each outcome back to the run store.

pub mod error;
pub mod pool;
pub mod registry;

pub use error::QueueError;
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use registry::ExecutorRegistry;
