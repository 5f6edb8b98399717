//! Event publishing abstraction (mechanics only).
//!
//! The unit of work hands every drained domain event to an [`EventDispatcher`],
//! one call per event, and waits for each call before issuing the next one.
//! How handlers are looked up is up to the implementation; [`crate::Mediator`]
//! is the in-process registry.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{AnyDomainEvent, HandlerError};

/// Failure while publishing a single event.
#[derive(Debug, Error)]
pub enum PublishError {
    /// A registered handler returned an error; later handlers for the same
    /// event were not invoked.
    #[error("handler `{handler}` failed: {source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: HandlerError,
    },

    /// Cancellation was requested before the event was handed to its handlers.
    #[error("publish cancelled")]
    Cancelled,
}

/// Publish-subscribe notifier.
///
/// `publish` covers exactly one event and invokes every handler registered for
/// the event's runtime type.
///
/// ## Delivery Guarantees
///
/// Callers (the unit of work) provide **at-least-once** delivery: events left
/// pending after a failure are published again on a later commit. No
/// deduplication happens here.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn publish(
        &self,
        event: &dyn AnyDomainEvent,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError>;
}

#[async_trait]
impl<D> EventDispatcher for Arc<D>
where
    D: EventDispatcher + ?Sized,
{
    async fn publish(
        &self,
        event: &dyn AnyDomainEvent,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        (**self).publish(event, cancel).await
    }
}
