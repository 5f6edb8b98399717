//! In-process mediator: routes each event to the handlers registered for its
//! entity type and kind.
//!
//! Registration is start-up wiring (`&mut self`); once built, the mediator is
//! shared read-only (typically behind an `Arc`).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tessera_core::{Entity, EventKind};

use crate::{AnyDomainEvent, DomainEventHandler, EventDispatcher, EventKey, HandlerError, PublishError};

#[async_trait]
trait ErasedHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        event: &dyn AnyDomainEvent,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

struct Typed<T, H> {
    handler: Arc<H>,
    _entity: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> ErasedHandler for Typed<T, H>
where
    T: Entity,
    H: DomainEventHandler<T>,
{
    fn name(&self) -> &'static str {
        self.handler.name()
    }

    async fn handle(
        &self,
        event: &dyn AnyDomainEvent,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        // Routing is keyed by entity TypeId, so a mismatch means nothing to do.
        match event.downcast_ref::<T>() {
            Some(typed) => self.handler.handle(typed, cancel).await,
            None => Ok(()),
        }
    }
}

/// Registry-based [`EventDispatcher`].
///
/// - One event → every handler registered for `(entity type, kind)`
/// - Handlers run sequentially, in registration order
/// - The first handler error aborts the publish of that event
/// - Once an event is handed to its handlers they all run; cancellation is
///   only observed before the first one starts
#[derive(Default)]
pub struct Mediator {
    handlers: HashMap<EventKey, Vec<Arc<dyn ErasedHandler>>>,
}

impl Mediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind` on entity type `T`.
    pub fn on<T, H>(&mut self, kind: EventKind, handler: H) -> &mut Self
    where
        T: Entity,
        H: DomainEventHandler<T>,
    {
        self.register::<T, H>(&[kind], Arc::new(handler))
    }

    pub fn on_inserted<T, H>(&mut self, handler: H) -> &mut Self
    where
        T: Entity,
        H: DomainEventHandler<T>,
    {
        self.on::<T, H>(EventKind::Inserted, handler)
    }

    pub fn on_updated<T, H>(&mut self, handler: H) -> &mut Self
    where
        T: Entity,
        H: DomainEventHandler<T>,
    {
        self.on::<T, H>(EventKind::Updated, handler)
    }

    pub fn on_deleted<T, H>(&mut self, handler: H) -> &mut Self
    where
        T: Entity,
        H: DomainEventHandler<T>,
    {
        self.on::<T, H>(EventKind::Deleted, handler)
    }

    /// Register one handler instance for all three kinds on entity type `T`.
    pub fn on_any<T, H>(&mut self, handler: H) -> &mut Self
    where
        T: Entity,
        H: DomainEventHandler<T>,
    {
        self.register::<T, H>(&EventKind::ALL, Arc::new(handler))
    }

    /// Number of handlers registered for a key.
    pub fn handler_count(&self, key: EventKey) -> usize {
        self.handlers.get(&key).map(Vec::len).unwrap_or(0)
    }

    fn register<T, H>(&mut self, kinds: &[EventKind], handler: Arc<H>) -> &mut Self
    where
        T: Entity,
        H: DomainEventHandler<T>,
    {
        let erased: Arc<dyn ErasedHandler> = Arc::new(Typed::<T, H> {
            handler,
            _entity: PhantomData,
        });
        for kind in kinds {
            self.handlers
                .entry(EventKey::of::<T>(*kind))
                .or_default()
                .push(Arc::clone(&erased));
        }
        self
    }
}

impl core::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let registered: usize = self.handlers.values().map(Vec::len).sum();
        f.debug_struct("Mediator")
            .field("keys", &self.handlers.len())
            .field("registered", &registered)
            .finish()
    }
}

#[async_trait]
impl EventDispatcher for Mediator {
    async fn publish(
        &self,
        event: &dyn AnyDomainEvent,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }

        let Some(handlers) = self.handlers.get(&event.key()) else {
            trace!(
                event_id = %event.event_id(),
                entity_type = event.entity_type(),
                kind = %event.kind(),
                "no handlers registered"
            );
            return Ok(());
        };

        for handler in handlers {
            debug!(
                handler = handler.name(),
                event_id = %event.event_id(),
                entity_type = event.entity_type(),
                kind = %event.kind(),
                "invoking domain event handler"
            );
            handler
                .handle(event, cancel)
                .await
                .map_err(|source| PublishError::Handler {
                    handler: handler.name(),
                    source,
                })?;
        }

        Ok(())
    }
}
