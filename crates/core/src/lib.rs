//! `tessera-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the entity base that queues lifecycle events, and the domain
//! error model.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::{Entity, EntityBase, EventKind, PendingEvent};
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, EventId, UserId};
