use std::any::{Any, TypeId};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use tessera_core::{Entity, EntityId, EventId, EventKind, PendingEvent};

/// Shared handle to a tracked entity.
///
/// Events hold this handle instead of a copy of the entity, so a consumer
/// observes the entity as it is when the event is dispatched (commit time),
/// not as it was when the mutation was recorded.
///
/// Guards returned by [`read`](Self::read)/[`write`](Self::write) are not
/// `Send`; they cannot be held across an `.await` in a handler.
pub struct EntityRef<T>(Arc<RwLock<T>>);

impl<T: Entity> EntityRef<T> {
    pub fn new(entity: T) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> EntityId {
        self.read().id()
    }

    /// Clone the entity's current state.
    pub fn snapshot(&self) -> T
    where
        T: Clone,
    {
        self.read().clone()
    }

    /// Whether both handles point at the same tracked instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Entity> core::fmt::Debug for EntityRef<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityRef")
            .field("entity_type", &T::entity_type())
            .field("id", &self.id())
            .finish()
    }
}

/// Metadata every domain event carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub event_id: EventId,
    pub entity_id: EntityId,
    pub occurred_at: DateTime<Utc>,
}

/// Immutable notice that an entity went through a lifecycle transition.
///
/// Built by the tracking context from the entity's [`PendingEvent`]s when the
/// unit of work drains them; the event id is the pending event's id, so a
/// redelivered event is recognisable.
pub enum DomainEvent<T> {
    Inserted { meta: EventMeta, entity: EntityRef<T> },
    Updated { meta: EventMeta, entity: EntityRef<T> },
    Deleted { meta: EventMeta, entity: EntityRef<T> },
}

impl<T: Entity> DomainEvent<T> {
    pub fn new(kind: EventKind, meta: EventMeta, entity: EntityRef<T>) -> Self {
        match kind {
            EventKind::Inserted => DomainEvent::Inserted { meta, entity },
            EventKind::Updated => DomainEvent::Updated { meta, entity },
            EventKind::Deleted => DomainEvent::Deleted { meta, entity },
        }
    }

    pub fn from_pending(pending: &PendingEvent, entity_id: EntityId, entity: EntityRef<T>) -> Self {
        let meta = EventMeta {
            event_id: pending.id,
            entity_id,
            occurred_at: pending.occurred_at,
        };
        Self::new(pending.kind, meta, entity)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::Inserted { .. } => EventKind::Inserted,
            DomainEvent::Updated { .. } => EventKind::Updated,
            DomainEvent::Deleted { .. } => EventKind::Deleted,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            DomainEvent::Inserted { meta, .. }
            | DomainEvent::Updated { meta, .. }
            | DomainEvent::Deleted { meta, .. } => meta,
        }
    }

    pub fn entity(&self) -> &EntityRef<T> {
        match self {
            DomainEvent::Inserted { entity, .. }
            | DomainEvent::Updated { entity, .. }
            | DomainEvent::Deleted { entity, .. } => entity,
        }
    }
}

impl<T> Clone for DomainEvent<T> {
    fn clone(&self) -> Self {
        match self {
            DomainEvent::Inserted { meta, entity } => DomainEvent::Inserted {
                meta: *meta,
                entity: entity.clone(),
            },
            DomainEvent::Updated { meta, entity } => DomainEvent::Updated {
                meta: *meta,
                entity: entity.clone(),
            },
            DomainEvent::Deleted { meta, entity } => DomainEvent::Deleted {
                meta: *meta,
                entity: entity.clone(),
            },
        }
    }
}

impl<T: Entity> core::fmt::Debug for DomainEvent<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainEvent")
            .field("kind", &self.kind())
            .field("entity_type", &T::entity_type())
            .field("meta", self.meta())
            .finish()
    }
}

/// Routing key: entity type + event kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    entity: TypeId,
    kind: EventKind,
}

impl EventKey {
    pub fn of<T: Entity>(kind: EventKind) -> Self {
        Self {
            entity: TypeId::of::<T>(),
            kind,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Type-erased domain event, so one publish call can carry any entity type.
pub trait AnyDomainEvent: Send + Sync + 'static {
    fn event_id(&self) -> EventId;
    fn kind(&self) -> EventKind;
    fn occurred_at(&self) -> DateTime<Utc>;
    fn entity_id(&self) -> EntityId;
    fn entity_type(&self) -> &'static str;
    fn key(&self) -> EventKey;
    fn as_any(&self) -> &dyn Any;
}

impl dyn AnyDomainEvent {
    /// Recover the typed event, if this event concerns entity type `T`.
    pub fn downcast_ref<T: Entity>(&self) -> Option<&DomainEvent<T>> {
        self.as_any().downcast_ref::<DomainEvent<T>>()
    }
}

impl core::fmt::Debug for dyn AnyDomainEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AnyDomainEvent")
            .field("event_id", &self.event_id())
            .field("kind", &self.kind())
            .field("entity_type", &self.entity_type())
            .field("entity_id", &self.entity_id())
            .finish()
    }
}

impl<T: Entity> AnyDomainEvent for DomainEvent<T> {
    fn event_id(&self) -> EventId {
        self.meta().event_id
    }

    fn kind(&self) -> EventKind {
        DomainEvent::kind(self)
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.meta().occurred_at
    }

    fn entity_id(&self) -> EntityId {
        self.meta().entity_id
    }

    fn entity_type(&self) -> &'static str {
        T::entity_type()
    }

    fn key(&self) -> EventKey {
        EventKey::of::<T>(DomainEvent::kind(self))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
