//! Entity trait and the shared entity base.
//!
//! Every persisted object embeds an [`EntityBase`]: its immutable identity plus
//! the queue of lifecycle events recorded since the last clear. Events are
//! appended by whichever mutation entry point touched the entity and are
//! drained only by the coordinator that owns the tracking context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{EntityId, EventId};

/// Lifecycle transition an entity went through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Inserted,
    Updated,
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Inserted, EventKind::Updated, EventKind::Deleted];

    /// Stable name (e.g. for logging and metrics labels).
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Inserted => "inserted",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event recorded on an entity but not yet published.
///
/// Only the fact is kept here; the entity itself is attached when the
/// tracking context materialises the event for dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub id: EventId,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
}

/// Identity plus pending-event queue shared by every entity.
///
/// # Invariants
/// - `id` never changes after construction.
/// - `pending` keeps insertion order (oldest first).
/// - Any number of events (zero, one, many) may be pending at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityBase {
    id: EntityId,
    pending: Vec<PendingEvent>,
}

impl EntityBase {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Append a lifecycle event, returning its id.
    pub fn record(&mut self, kind: EventKind) -> EventId {
        self.record_at(kind, Utc::now())
    }

    pub fn record_at(&mut self, kind: EventKind, occurred_at: DateTime<Utc>) -> EventId {
        let id = EventId::new();
        self.pending.push(PendingEvent {
            id,
            kind,
            occurred_at,
        });
        id
    }

    pub fn pending_events(&self) -> &[PendingEvent] {
        &self.pending
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop every pending event. Idempotent.
    pub fn clear_events(&mut self) {
        self.pending.clear();
    }

    /// Drop only the listed events (already delivered), keeping the rest in order.
    ///
    /// Returns how many events were removed.
    pub fn acknowledge(&mut self, ids: &[EventId]) -> usize {
        let before = self.pending.len();
        self.pending.retain(|e| !ids.contains(&e.id));
        before - self.pending.len()
    }
}

/// Entity marker + minimal interface.
///
/// Implementors embed an [`EntityBase`] and expose it; identity and the event
/// queue come from there.
pub trait Entity: Send + Sync + 'static {
    /// Stable entity type name (e.g. "customer").
    fn entity_type() -> &'static str
    where
        Self: Sized;

    fn base(&self) -> &EntityBase;

    fn base_mut(&mut self) -> &mut EntityBase;

    /// Returns the entity identifier.
    fn id(&self) -> EntityId {
        self.base().id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_preserves_append_order() {
        let mut base = EntityBase::new(EntityId::new());
        base.record(EventKind::Inserted);
        base.record(EventKind::Updated);
        base.record(EventKind::Updated);

        let kinds: Vec<_> = base.pending_events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Inserted, EventKind::Updated, EventKind::Updated]
        );
    }

    #[test]
    fn clear_is_idempotent() {
        let mut base = EntityBase::new(EntityId::new());
        base.record(EventKind::Deleted);
        base.clear_events();
        base.clear_events();
        assert!(!base.has_pending_events());
    }

    #[test]
    fn acknowledge_removes_only_listed_events() {
        let mut base = EntityBase::new(EntityId::new());
        let first = base.record(EventKind::Inserted);
        let second = base.record(EventKind::Updated);
        let third = base.record(EventKind::Deleted);

        assert_eq!(base.acknowledge(&[first, third]), 2);
        let remaining: Vec<_> = base.pending_events().iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![second]);

        // Unknown ids are ignored.
        assert_eq!(base.acknowledge(&[first]), 0);
    }

    #[test]
    fn id_is_stable_across_events() {
        let id = EntityId::new();
        let mut base = EntityBase::new(id);
        base.record(EventKind::Updated);
        base.clear_events();
        assert_eq!(base.id(), id);
    }
}
