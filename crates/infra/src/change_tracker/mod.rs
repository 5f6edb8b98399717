//! Transaction-scoped change tracking boundary.
//!
//! The storage engine itself is an external collaborator; this module defines
//! what the unit of work needs from it and ships an in-memory implementation
//! for tests and development.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::{EntryState, InMemoryContext, InMemoryDatabase, TrackingError};
pub use r#trait::{ChangeTracker, PersistenceError};
