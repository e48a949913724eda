//! `db` crate — the coordination-store boundary.
//!
//! Defines the [`CoordinationStore`] contract the scheduler persists run state
//! through (versioned key-value, fenced writes, leased locks, change
//! notification) and [`MemoryStore`], an in-process implementation.
//! No workflow logic lives here; values are opaque strings.

pub mod error;
pub mod memory;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use store::{ChangeEvent, ChangeKind, CoordinationStore, Expect, Fence, Versioned};
