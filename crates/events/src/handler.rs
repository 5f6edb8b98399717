use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tessera_core::Entity;

use crate::DomainEvent;

/// Error raised by a domain event handler.
///
/// Wraps any error type; handlers written with `anyhow` convert with `?`.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct HandlerError(Box<dyn std::error::Error + Send + Sync + 'static>);

impl HandlerError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        Self(msg.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(value: anyhow::Error) -> Self {
        Self(value.into())
    }
}

/// Reacts to domain events of one entity type (audit trail, cache
/// invalidation, email trigger, ...).
///
/// Handlers must be idempotent: under partial dispatch failure an event can be
/// delivered again on a later commit (at-least-once). The event id is stable
/// across redeliveries and can be used to deduplicate.
#[async_trait]
pub trait DomainEventHandler<T: Entity>: Send + Sync + 'static {
    async fn handle(
        &self,
        event: &DomainEvent<T>,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
impl<T, H> DomainEventHandler<T> for std::sync::Arc<H>
where
    T: Entity,
    H: DomainEventHandler<T> + ?Sized,
{
    async fn handle(
        &self,
        event: &DomainEvent<T>,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        (**self).handle(event, cancel).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
