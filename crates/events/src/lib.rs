//! `tessera-events`: domain event mechanics (no storage assumptions).
//!
//! - [`DomainEvent`]: lifecycle notice sharing the affected entity
//! - [`DomainEventHandler`]: typed reaction to one entity type's events
//! - [`EventDispatcher`]: publish boundary consumed by the unit of work
//! - [`Mediator`]: in-process registry dispatcher (sequential fan-out)

pub mod dispatcher;
pub mod event;
pub mod handler;
pub mod mediator;

pub use dispatcher::{EventDispatcher, PublishError};
pub use event::{AnyDomainEvent, DomainEvent, EntityRef, EventKey, EventMeta};
pub use handler::{DomainEventHandler, HandlerError};
pub use mediator::Mediator;
