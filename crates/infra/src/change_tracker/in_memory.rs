//! In-memory change tracker and backing database.
//!
//! Intended for tests/dev. `InMemoryDatabase` plays the durable store (shared
//! across transactions); `InMemoryContext` is the per-transaction tracking
//! context that records entity lifecycle events as entities are mutated.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tessera_core::{Entity, EntityId, EventId, EventKind};
use tessera_events::{AnyDomainEvent, DomainEvent, EntityRef};

use super::r#trait::{ChangeTracker, PersistenceError};

type RowKey = (TypeId, EntityId);
type Row = Arc<dyn Any + Send + Sync>;

enum RowWrite {
    Upsert(RowKey, Row),
    Delete(RowKey),
}

/// Durable side of the in-memory backend: one row per persisted entity.
#[derive(Default)]
pub struct InMemoryDatabase {
    rows: RwLock<HashMap<RowKey, Row>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Persisted state of an entity, if a row exists.
    pub fn get<T: Entity + Clone>(&self, id: EntityId) -> Option<T> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.get(&(TypeId::of::<T>(), id))
            .and_then(|row| row.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains<T: Entity>(&self, id: EntityId) -> bool {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.contains_key(&(TypeId::of::<T>(), id))
    }

    pub fn count<T: Entity>(&self) -> usize {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.keys().filter(|(ty, _)| *ty == TypeId::of::<T>()).count()
    }

    /// Apply a batch under one write lock (all or nothing). Returns affected rows.
    fn apply(&self, writes: Vec<RowWrite>) -> usize {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let mut affected = 0;
        for write in writes {
            match write {
                RowWrite::Upsert(key, row) => {
                    rows.insert(key, row);
                    affected += 1;
                }
                RowWrite::Delete(key) => {
                    if rows.remove(&key).is_some() {
                        affected += 1;
                    }
                }
            }
        }
        affected
    }
}

impl core::fmt::Debug for InMemoryDatabase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("InMemoryDatabase")
            .field("rows", &rows.len())
            .finish()
    }
}

/// Misuse of the tracking context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    #[error("{entity_type} {id} is already tracked")]
    AlreadyTracked { entity_type: &'static str, id: EntityId },

    #[error("{entity_type} {id} is not tracked by this context")]
    NotTracked { entity_type: &'static str, id: EntityId },

    #[error("{entity_type} {id} has been removed")]
    Removed { entity_type: &'static str, id: EntityId },
}

/// Lifecycle of a tracked entry relative to the durable store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// Matches the stored row.
    Unchanged,
    /// New; written on next save.
    Added,
    /// Changed since load/save; written on next save.
    Modified,
    /// Row deleted on next save.
    Deleted,
    /// No longer backed by a row; kept only so pending events can drain.
    Detached,
}

trait TrackedEntity: Send + Sync {
    fn key(&self) -> RowKey;
    fn row(&self) -> Row;
    fn domain_events(&self) -> Vec<Arc<dyn AnyDomainEvent>>;
    fn clear_events(&self);
    fn acknowledge(&self, event_ids: &[EventId]);
}

impl<T: Entity + Clone> TrackedEntity for EntityRef<T> {
    fn key(&self) -> RowKey {
        (TypeId::of::<T>(), self.id())
    }

    fn row(&self) -> Row {
        Arc::new(self.snapshot())
    }

    fn domain_events(&self) -> Vec<Arc<dyn AnyDomainEvent>> {
        let entity = self.read();
        let id = entity.id();
        entity
            .base()
            .pending_events()
            .iter()
            .map(|pending| {
                Arc::new(DomainEvent::from_pending(pending, id, self.clone()))
                    as Arc<dyn AnyDomainEvent>
            })
            .collect()
    }

    fn clear_events(&self) {
        self.write().base_mut().clear_events();
    }

    fn acknowledge(&self, event_ids: &[EventId]) {
        self.write().base_mut().acknowledge(event_ids);
    }
}

struct Entry {
    entity: Box<dyn TrackedEntity>,
    state: EntryState,
}

#[derive(Default)]
struct Entries {
    list: Vec<Entry>,
    index: HashMap<RowKey, usize>,
}

/// Per-transaction tracking context over an [`InMemoryDatabase`].
///
/// Mutations go through the context (`add`, `update`, `remove`) so that the
/// matching lifecycle event is recorded on the entity and the entry is marked
/// dirty. Entity handles stay readable by the caller between mutations.
///
/// Closures passed to `update`/`try_update` must not call back into the
/// context for the same entity (the entity's write lock is held).
pub struct InMemoryContext {
    db: Arc<InMemoryDatabase>,
    entries: Mutex<Entries>,
    fail_next_save: Mutex<Option<String>>,
}

impl InMemoryContext {
    pub fn new(db: Arc<InMemoryDatabase>) -> Self {
        Self {
            db,
            entries: Mutex::new(Entries::default()),
            fail_next_save: Mutex::new(None),
        }
    }

    pub fn database(&self) -> &Arc<InMemoryDatabase> {
        &self.db
    }

    /// Start tracking a new entity and record `Inserted` on it.
    pub fn add<T: Entity + Clone>(&self, mut entity: T) -> Result<EntityRef<T>, TrackingError> {
        let key = (TypeId::of::<T>(), entity.id());
        let mut entries = self.lock_entries();
        if entries.index.contains_key(&key) {
            return Err(TrackingError::AlreadyTracked {
                entity_type: T::entity_type(),
                id: key.1,
            });
        }

        entity.base_mut().record(EventKind::Inserted);
        let handle = EntityRef::new(entity);
        Self::push(&mut entries, key, handle.clone(), EntryState::Added);
        Ok(handle)
    }

    /// Track an already-persisted entity without recording any event.
    pub fn attach<T: Entity + Clone>(&self, entity: T) -> Result<EntityRef<T>, TrackingError> {
        let key = (TypeId::of::<T>(), entity.id());
        let mut entries = self.lock_entries();
        if entries.index.contains_key(&key) {
            return Err(TrackingError::AlreadyTracked {
                entity_type: T::entity_type(),
                id: key.1,
            });
        }

        let handle = EntityRef::new(entity);
        Self::push(&mut entries, key, handle.clone(), EntryState::Unchanged);
        Ok(handle)
    }

    /// Mutate a tracked entity and record `Updated` on it.
    pub fn update<T, R>(
        &self,
        handle: &EntityRef<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, TrackingError>
    where
        T: Entity + Clone,
    {
        self.try_update(handle, |entity| Ok::<R, TrackingError>(f(entity)))
    }

    /// Like [`update`](Self::update), but a failing closure records nothing and
    /// leaves the entry state untouched.
    pub fn try_update<T, R, E>(
        &self,
        handle: &EntityRef<T>,
        f: impl FnOnce(&mut T) -> Result<R, E>,
    ) -> Result<R, E>
    where
        T: Entity + Clone,
        E: From<TrackingError>,
    {
        let key = (TypeId::of::<T>(), handle.id());
        self.ensure_live::<T>(key)?;

        let out = {
            let mut entity = handle.write();
            let out = f(&mut *entity)?;
            entity.base_mut().record(EventKind::Updated);
            out
        };

        let mut entries = self.lock_entries();
        if let Some(&i) = entries.index.get(&key) {
            let entry = &mut entries.list[i];
            if entry.state == EntryState::Unchanged {
                entry.state = EntryState::Modified;
            }
        }
        Ok(out)
    }

    /// Record `Deleted` and schedule the row for deletion.
    ///
    /// Removing an entity that was added in this same context and never saved
    /// just detaches it (nothing to delete).
    pub fn remove<T: Entity + Clone>(&self, handle: &EntityRef<T>) -> Result<(), TrackingError> {
        let key = (TypeId::of::<T>(), handle.id());
        self.ensure_live::<T>(key)?;

        handle.write().base_mut().record(EventKind::Deleted);

        let mut entries = self.lock_entries();
        if let Some(&i) = entries.index.get(&key) {
            let entry = &mut entries.list[i];
            entry.state = match entry.state {
                EntryState::Added => EntryState::Detached,
                _ => EntryState::Deleted,
            };
        }
        Ok(())
    }

    pub fn state_of<T: Entity>(&self, handle: &EntityRef<T>) -> Option<EntryState> {
        let entries = self.lock_entries();
        entries
            .index
            .get(&(TypeId::of::<T>(), handle.id()))
            .map(|i| entries.list[*i].state)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock_entries().list.len()
    }

    /// Make the next `save_changes` fail with a storage error (tests).
    pub fn fail_next_save(&self, reason: impl Into<String>) {
        *self
            .fail_next_save
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    fn ensure_live<T: Entity>(&self, key: RowKey) -> Result<(), TrackingError> {
        let entries = self.lock_entries();
        match entries.index.get(&key).map(|i| entries.list[*i].state) {
            None => Err(TrackingError::NotTracked {
                entity_type: T::entity_type(),
                id: key.1,
            }),
            Some(EntryState::Deleted | EntryState::Detached) => Err(TrackingError::Removed {
                entity_type: T::entity_type(),
                id: key.1,
            }),
            Some(_) => Ok(()),
        }
    }

    fn push<T: Entity + Clone>(
        entries: &mut Entries,
        key: RowKey,
        handle: EntityRef<T>,
        state: EntryState,
    ) {
        entries.index.insert(key, entries.list.len());
        entries.list.push(Entry {
            entity: Box::new(handle),
            state,
        });
    }

    fn lock_entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for InMemoryContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryContext")
            .field("tracked", &self.tracked_count())
            .field("db", &self.db)
            .finish()
    }
}

#[async_trait]
impl ChangeTracker for InMemoryContext {
    async fn save_changes(&self, cancel: &CancellationToken) -> Result<usize, PersistenceError> {
        if cancel.is_cancelled() {
            return Err(PersistenceError::Cancelled);
        }

        let injected = self
            .fail_next_save
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reason) = injected {
            return Err(PersistenceError::Storage(reason));
        }

        let mut entries = self.lock_entries();
        let writes = entries
            .list
            .iter()
            .filter_map(|entry| match entry.state {
                EntryState::Added | EntryState::Modified => {
                    Some(RowWrite::Upsert(entry.entity.key(), entry.entity.row()))
                }
                EntryState::Deleted => Some(RowWrite::Delete(entry.entity.key())),
                EntryState::Unchanged | EntryState::Detached => None,
            })
            .collect();

        let affected = self.db.apply(writes);

        for entry in entries.list.iter_mut() {
            entry.state = match entry.state {
                EntryState::Added | EntryState::Modified => EntryState::Unchanged,
                EntryState::Deleted => EntryState::Detached,
                other => other,
            };
        }

        debug!(affected, tracked = entries.list.len(), "changes saved");
        Ok(affected)
    }

    fn domain_events(&self) -> Vec<Arc<dyn AnyDomainEvent>> {
        let entries = self.lock_entries();
        entries
            .list
            .iter()
            .flat_map(|entry| entry.entity.domain_events())
            .collect()
    }

    fn clear_domain_events(&self) {
        let entries = self.lock_entries();
        for entry in &entries.list {
            entry.entity.clear_events();
        }
    }

    fn acknowledge(&self, event_ids: &[EventId]) {
        let entries = self.lock_entries();
        for entry in &entries.list {
            entry.entity.acknowledge(event_ids);
        }
    }
}
