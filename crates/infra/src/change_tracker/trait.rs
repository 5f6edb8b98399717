use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use tessera_core::EventId;
use tessera_events::AnyDomainEvent;

/// Storage write failure.
///
/// These are **infrastructure errors** surfaced unchanged to the caller of a
/// commit; no domain event is drained or published when one occurs.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Concurrent modification or constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connectivity or backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cancellation was observed before the write started.
    #[error("save cancelled before write")]
    Cancelled,
}

/// Transaction-scoped storage context (the change-tracking collaborator).
///
/// The context tracks entities for the lifetime of one unit of work and
/// accumulates their pending domain events as a side effect of mutation.
/// Only the owning unit of work drains or clears those events.
///
/// ## Contract
///
/// - `save_changes`: durable, atomic write of every tracked change; returns the
///   number of affected records (0 means nothing changed).
/// - `domain_events`: every pending event across tracked entities, entities in
///   tracking order and events in append order. Does not clear anything.
/// - `clear_domain_events`: drop all pending events; idempotent.
/// - `acknowledge`: drop only the listed events (already delivered).
#[async_trait]
pub trait ChangeTracker: Send + Sync {
    async fn save_changes(&self, cancel: &CancellationToken) -> Result<usize, PersistenceError>;

    fn domain_events(&self) -> Vec<Arc<dyn AnyDomainEvent>>;

    fn clear_domain_events(&self);

    fn acknowledge(&self, event_ids: &[EventId]);
}

#[async_trait]
impl<C> ChangeTracker for Arc<C>
where
    C: ChangeTracker + ?Sized,
{
    async fn save_changes(&self, cancel: &CancellationToken) -> Result<usize, PersistenceError> {
        (**self).save_changes(cancel).await
    }

    fn domain_events(&self) -> Vec<Arc<dyn AnyDomainEvent>> {
        (**self).domain_events()
    }

    fn clear_domain_events(&self) {
        (**self).clear_domain_events()
    }

    fn acknowledge(&self, event_ids: &[EventId]) {
        (**self).acknowledge(event_ids)
    }
}
