//! Unit of work: commit storage changes, then announce them.
//!
//! ## Commit Flow
//!
//! ```text
//! commit(cancel)
//!   ↓
//! 1. Save changes (durable write; on failure return, events untouched)
//!   ↓
//! 2. Count == 0 → return 0 (nothing drained, nothing published)
//!   ↓
//! 3. Drain pending events (tracking order, then append order)
//!   ↓
//! 4. Publish each event, one at a time, awaiting each
//!   ↓
//! 5. Clear the drained events, return count
//! ```
//!
//! ## Failure Semantics
//!
//! Storage success strictly precedes event visibility. A dispatch failure
//! surfaces after the write is durable; there is no retry and no compensating
//! rollback. Events published before the failure are acknowledged (dropped
//! from their entities), the failing event and everything after it stay
//! pending and are drained again by the next successful commit
//! (**at-least-once**, no deduplication here).

use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use tessera_core::{EventId, EventKind};
use tessera_events::{EventDispatcher, PublishError};

use crate::change_tracker::{ChangeTracker, PersistenceError};

#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// The storage write failed; nothing was published.
    #[error("persisting changes failed: {0}")]
    Persistence(#[from] PersistenceError),

    /// A handler failed after the write was committed.
    #[error(
        "publishing {kind} event {event_id} for {entity_type} failed \
         ({published} published, {pending} left pending): {source}"
    )]
    Dispatch {
        event_id: EventId,
        entity_type: &'static str,
        kind: EventKind,
        published: usize,
        pending: usize,
        #[source]
        source: PublishError,
    },

    /// Cancelled before the storage write started; nothing happened.
    #[error("commit cancelled before saving")]
    Cancelled,

    /// Cancelled after the write was committed; unpublished events stay pending.
    #[error("dispatch cancelled ({published} published, {pending} left pending)")]
    DispatchCancelled { published: usize, pending: usize },
}

/// Coordinator for one logical transaction.
///
/// Holds no durable state of its own. Create one per transaction scope and
/// drop it afterwards; `commit` takes `&mut self`, so one instance cannot be
/// driven by two callers at once.
///
/// ## Generic Parameters
///
/// - `C`: change-tracking context (storage collaborator)
/// - `D`: event dispatcher
#[derive(Debug)]
pub struct UnitOfWork<C, D> {
    tracker: C,
    dispatcher: D,
}

impl<C, D> UnitOfWork<C, D> {
    pub fn new(tracker: C, dispatcher: D) -> Self {
        Self {
            tracker,
            dispatcher,
        }
    }

    pub fn tracker(&self) -> &C {
        &self.tracker
    }

    pub fn into_parts(self) -> (C, D) {
        (self.tracker, self.dispatcher)
    }
}

impl<C, D> UnitOfWork<C, D>
where
    C: ChangeTracker,
    D: EventDispatcher,
{
    /// Persist tracked changes and, if anything changed, publish pending events.
    ///
    /// Returns the number of persisted changes.
    ///
    /// Events are published strictly sequentially; handlers relying on
    /// Inserted-before-Updated-before-Deleted ordering across related entities
    /// see exactly the order in which mutations were recorded.
    ///
    /// A zero change count leaves any pending events in place, even events
    /// recorded without a persisted change; they go out with the next commit
    /// that writes something.
    ///
    /// Only the drained events are cleared. Events that handlers record during
    /// dispatch (e.g. by mutating another tracked entity) stay pending for the
    /// next commit.
    #[instrument(skip_all, err)]
    pub async fn commit(&mut self, cancel: &CancellationToken) -> Result<usize, UnitOfWorkError> {
        if cancel.is_cancelled() {
            return Err(UnitOfWorkError::Cancelled);
        }

        let changes = self.tracker.save_changes(cancel).await?;
        if changes == 0 {
            debug!("no changes persisted; skipping event dispatch");
            return Ok(0);
        }

        let events = self.tracker.domain_events();
        let total = events.len();
        let started = Instant::now();
        let mut published: Vec<EventId> = Vec::with_capacity(total);

        for event in &events {
            if cancel.is_cancelled() {
                return Err(self.cancelled_mid_dispatch(&published, total));
            }

            match self.dispatcher.publish(event.as_ref(), cancel).await {
                Ok(()) => {
                    debug!(
                        event_id = %event.event_id(),
                        entity_type = event.entity_type(),
                        kind = %event.kind(),
                        "domain event published"
                    );
                    published.push(event.event_id());
                }
                Err(PublishError::Cancelled) => {
                    return Err(self.cancelled_mid_dispatch(&published, total));
                }
                Err(source) => {
                    self.tracker.acknowledge(&published);
                    let pending = total - published.len();
                    warn!(
                        event_id = %event.event_id(),
                        entity_type = event.entity_type(),
                        kind = %event.kind(),
                        published = published.len(),
                        pending,
                        error = %source,
                        "domain event dispatch failed after commit"
                    );
                    return Err(UnitOfWorkError::Dispatch {
                        event_id: event.event_id(),
                        entity_type: event.entity_type(),
                        kind: event.kind(),
                        published: published.len(),
                        pending,
                        source,
                    });
                }
            }
        }

        self.tracker.acknowledge(&published);
        debug!(
            changes,
            events = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "commit complete"
        );
        Ok(changes)
    }

    /// Raw passthrough to the storage context: no events are drained,
    /// published or cleared. For bookkeeping writes whose side effects must be
    /// suppressed.
    pub async fn save_changes(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<usize, UnitOfWorkError> {
        Ok(self.tracker.save_changes(cancel).await?)
    }

    fn cancelled_mid_dispatch(&self, published: &[EventId], total: usize) -> UnitOfWorkError {
        self.tracker.acknowledge(published);
        let pending = total - published.len();
        warn!(
            published = published.len(),
            pending, "commit cancelled during dispatch; remaining events left pending"
        );
        UnitOfWorkError::DispatchCancelled {
            published: published.len(),
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tessera_core::{Entity, EntityBase, EntityId};
    use tessera_events::{
        AnyDomainEvent, DomainEvent, DomainEventHandler, EntityRef, EventKey, HandlerError,
        Mediator,
    };

    use super::*;
    use crate::change_tracker::{InMemoryContext, InMemoryDatabase};

    #[derive(Debug, Clone)]
    struct Order {
        base: EntityBase,
        total: i64,
    }

    impl Order {
        fn new(total: i64) -> Self {
            Self {
                base: EntityBase::new(EntityId::new()),
                total,
            }
        }
    }

    impl Entity for Order {
        fn entity_type() -> &'static str {
            "order"
        }

        fn base(&self) -> &EntityBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut EntityBase {
            &mut self.base
        }
    }

    /// Records `(entity id, kind, total seen at dispatch)` for every event.
    #[derive(Default)]
    struct Audit {
        seen: Mutex<Vec<(EntityId, EventKind, i64)>>,
    }

    impl Audit {
        fn seen(&self) -> Vec<(EntityId, EventKind, i64)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DomainEventHandler<Order> for Audit {
        async fn handle(
            &self,
            event: &DomainEvent<Order>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            let total = event.entity().read().total;
            self.seen
                .lock()
                .unwrap()
                .push((event.meta().entity_id, event.kind(), total));
            Ok(())
        }
    }

    /// Fails on the n-th call (1-based), succeeds otherwise.
    struct FailOnCall {
        fail_on: usize,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl DomainEventHandler<Order> for FailOnCall {
        async fn handle(
            &self,
            _event: &DomainEvent<Order>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls == self.fail_on {
                return Err(HandlerError::msg("mailer down"));
            }
            Ok(())
        }
    }

    /// Cancels the shared token after handling its first event.
    struct CancelAfterFirst {
        token: CancellationToken,
    }

    #[async_trait]
    impl DomainEventHandler<Order> for CancelAfterFirst {
        async fn handle(
            &self,
            _event: &DomainEvent<Order>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            self.token.cancel();
            Ok(())
        }
    }

    /// Counts publish calls regardless of handlers.
    #[derive(Default)]
    struct CountingDispatcher {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl EventDispatcher for CountingDispatcher {
        async fn publish(
            &self,
            _event: &dyn AnyDomainEvent,
            _cancel: &CancellationToken,
        ) -> Result<(), PublishError> {
            *self.calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn context() -> Arc<InMemoryContext> {
        Arc::new(InMemoryContext::new(InMemoryDatabase::arc()))
    }

    fn audited(audit: Arc<Audit>) -> Arc<Mediator> {
        let mut mediator = Mediator::new();
        mediator.on_any::<Order, _>(audit);
        Arc::new(mediator)
    }

    #[tokio::test]
    async fn insert_then_two_updates_publishes_three_events_in_order() {
        let ctx = context();
        let audit = Arc::new(Audit::default());
        let mut uow = UnitOfWork::new(ctx.clone(), audited(audit.clone()));

        let order = ctx.add(Order::new(10)).unwrap();
        ctx.update(&order, |o| o.total = 20).unwrap();
        ctx.update(&order, |o| o.total = 30).unwrap();

        let changes = uow.commit(&CancellationToken::new()).await.unwrap();

        assert_eq!(changes, 1);
        let id = order.id();
        // Handlers see the entity as of commit time.
        assert_eq!(
            audit.seen(),
            vec![
                (id, EventKind::Inserted, 30),
                (id, EventKind::Updated, 30),
                (id, EventKind::Updated, 30),
            ]
        );
        assert!(ctx.domain_events().is_empty());
    }

    #[tokio::test]
    async fn zero_changes_publish_nothing_and_keep_pending_events() {
        let ctx = context();
        let dispatcher = Arc::new(CountingDispatcher::default());
        let mut uow = UnitOfWork::new(ctx.clone(), dispatcher.clone());

        let order = ctx.attach(Order::new(5)).unwrap();
        // Event appended outside the context: no persisted change.
        order.write().base_mut().record(EventKind::Updated);

        assert_eq!(uow.commit(&CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(*dispatcher.calls.lock().unwrap(), 0);
        assert_eq!(ctx.domain_events().len(), 1);
    }

    #[tokio::test]
    async fn stale_events_ride_along_with_the_next_real_change() {
        let ctx = context();
        let audit = Arc::new(Audit::default());
        let mut uow = UnitOfWork::new(ctx.clone(), audited(audit.clone()));

        let stale = ctx.attach(Order::new(1)).unwrap();
        stale.write().base_mut().record(EventKind::Updated);
        assert_eq!(uow.commit(&CancellationToken::new()).await.unwrap(), 0);
        assert!(audit.seen().is_empty());

        let fresh = ctx.add(Order::new(2)).unwrap();
        assert_eq!(uow.commit(&CancellationToken::new()).await.unwrap(), 1);

        let kinds: Vec<_> = audit.seen().iter().map(|(id, k, _)| (*id, *k)).collect();
        assert_eq!(
            kinds,
            vec![
                (stale.id(), EventKind::Updated),
                (fresh.id(), EventKind::Inserted)
            ]
        );
    }

    #[tokio::test]
    async fn persistence_failure_touches_no_events() {
        let ctx = context();
        let dispatcher = Arc::new(CountingDispatcher::default());
        let mut uow = UnitOfWork::new(ctx.clone(), dispatcher.clone());

        ctx.add(Order::new(1)).unwrap();
        ctx.fail_next_save("unique constraint");

        let err = uow.commit(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            UnitOfWorkError::Persistence(PersistenceError::Storage(_))
        ));
        assert_eq!(*dispatcher.calls.lock().unwrap(), 0);
        assert_eq!(ctx.domain_events().len(), 1);
    }

    #[tokio::test]
    async fn failure_on_kth_event_keeps_k_through_n_pending() {
        let ctx = context();
        let audit = Arc::new(Audit::default());
        let mut mediator = Mediator::new();
        mediator
            .on_any::<Order, _>(audit.clone())
            .on_any::<Order, _>(FailOnCall {
                fail_on: 3,
                calls: Mutex::new(0),
            });
        let mut uow = UnitOfWork::new(ctx.clone(), Arc::new(mediator));

        let orders: Vec<_> = (0..5).map(|i| ctx.add(Order::new(i)).unwrap()).collect();
        let all: Vec<EventId> = ctx.domain_events().iter().map(|e| e.event_id()).collect();

        let err = uow.commit(&CancellationToken::new()).await.unwrap_err();

        match err {
            UnitOfWorkError::Dispatch {
                event_id,
                entity_type,
                kind,
                published,
                pending,
                ..
            } => {
                assert_eq!(event_id, all[2]);
                assert_eq!(entity_type, "order");
                assert_eq!(kind, EventKind::Inserted);
                assert_eq!(published, 2);
                assert_eq!(pending, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Handlers observed events 1..=3 (the audit runs before the failing one).
        assert_eq!(audit.seen().len(), 3);
        let remaining: Vec<EventId> = ctx.domain_events().iter().map(|e| e.event_id()).collect();
        assert_eq!(remaining, all[2..].to_vec());
        // The write itself is durable.
        assert_eq!(ctx.database().count::<Order>(), orders.len());
    }

    #[tokio::test]
    async fn redelivery_after_partial_failure_publishes_only_the_rest() {
        let ctx = context();
        let audit = Arc::new(Audit::default());
        let mut mediator = Mediator::new();
        mediator
            .on_any::<Order, _>(FailOnCall {
                fail_on: 2,
                calls: Mutex::new(0),
            })
            .on_any::<Order, _>(audit.clone());
        let mut uow = UnitOfWork::new(ctx.clone(), Arc::new(mediator));

        let a = ctx.add(Order::new(1)).unwrap();
        let b = ctx.add(Order::new(2)).unwrap();
        assert!(uow.commit(&CancellationToken::new()).await.is_err());
        assert_eq!(audit.seen().len(), 1);

        ctx.update(&a, |o| o.total = 3).unwrap();
        assert_eq!(uow.commit(&CancellationToken::new()).await.unwrap(), 1);

        let delivered: Vec<_> = audit.seen().iter().map(|(id, k, _)| (*id, *k)).collect();
        assert_eq!(
            delivered,
            vec![
                (a.id(), EventKind::Inserted),
                (a.id(), EventKind::Updated),
                (b.id(), EventKind::Inserted),
            ]
        );
        assert!(ctx.domain_events().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_commit_does_nothing() {
        let ctx = context();
        let dispatcher = Arc::new(CountingDispatcher::default());
        let mut uow = UnitOfWork::new(ctx.clone(), dispatcher.clone());
        ctx.add(Order::new(1)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            uow.commit(&cancel).await,
            Err(UnitOfWorkError::Cancelled)
        ));
        assert_eq!(ctx.database().count::<Order>(), 0);
        assert_eq!(ctx.domain_events().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_mid_dispatch_leaves_rest_pending() {
        let ctx = context();
        let cancel = CancellationToken::new();
        let mut mediator = Mediator::new();
        mediator.on_any::<Order, _>(CancelAfterFirst {
            token: cancel.clone(),
        });
        let mut uow = UnitOfWork::new(ctx.clone(), Arc::new(mediator));

        ctx.add(Order::new(1)).unwrap();
        ctx.add(Order::new(2)).unwrap();
        ctx.add(Order::new(3)).unwrap();

        let err = uow.commit(&cancel).await.unwrap_err();

        assert!(matches!(
            err,
            UnitOfWorkError::DispatchCancelled {
                published: 1,
                pending: 2
            }
        ));
        assert_eq!(ctx.domain_events().len(), 2);
        assert_eq!(ctx.database().count::<Order>(), 3);
    }

    /// Bumps another tracked order whenever an order is inserted.
    struct BumpOnInsert {
        ctx: Arc<InMemoryContext>,
        target: EntityRef<Order>,
    }

    #[async_trait]
    impl DomainEventHandler<Order> for BumpOnInsert {
        async fn handle(
            &self,
            _event: &DomainEvent<Order>,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            self.ctx
                .update(&self.target, |o| o.total += 1)
                .map_err(HandlerError::new)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_recorded_during_dispatch_survive_the_commit() {
        let ctx = context();
        let target = ctx.attach(Order::new(0)).unwrap();
        let audit = Arc::new(Audit::default());
        let mut mediator = Mediator::new();
        mediator
            .on_inserted::<Order, _>(BumpOnInsert {
                ctx: ctx.clone(),
                target: target.clone(),
            })
            .on_any::<Order, _>(audit.clone());
        let mut uow = UnitOfWork::new(ctx.clone(), Arc::new(mediator));

        ctx.add(Order::new(5)).unwrap();
        assert_eq!(uow.commit(&CancellationToken::new()).await.unwrap(), 1);

        let pending: Vec<_> = ctx
            .domain_events()
            .iter()
            .map(|e| (e.entity_id(), e.kind()))
            .collect();
        assert_eq!(pending, vec![(target.id(), EventKind::Updated)]);

        // The follow-up commit persists the bump and publishes its event.
        assert_eq!(uow.commit(&CancellationToken::new()).await.unwrap(), 1);
        assert_eq!(
            audit.seen().last().map(|(id, k, total)| (*id, *k, *total)),
            Some((target.id(), EventKind::Updated, 1))
        );
        assert!(ctx.domain_events().is_empty());
    }

    #[tokio::test]
    async fn save_changes_passthrough_publishes_nothing() {
        let ctx = context();
        let dispatcher = Arc::new(CountingDispatcher::default());
        let mut uow = UnitOfWork::new(ctx.clone(), dispatcher.clone());
        ctx.add(Order::new(1)).unwrap();

        assert_eq!(uow.save_changes(&CancellationToken::new()).await.unwrap(), 1);
        assert_eq!(*dispatcher.calls.lock().unwrap(), 0);
        assert_eq!(ctx.domain_events().len(), 1);
    }

    #[test]
    fn handlers_are_keyed_per_entity_type() {
        let mediator = audited(Arc::new(Audit::default()));
        assert_eq!(
            mediator.handler_count(EventKey::of::<Order>(EventKind::Deleted)),
            1
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Add,
            Update(usize),
            Remove(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                Just(Op::Add),
                (0usize..8).prop_map(Op::Update),
                (0usize..8).prop_map(Op::Remove),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                .. ProptestConfig::default()
            })]

            #[test]
            fn every_pending_event_is_published_once_in_order(ops in prop::collection::vec(op(), 1..24)) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let ctx = context();
                    let audit = Arc::new(Audit::default());
                    let mut uow = UnitOfWork::new(ctx.clone(), audited(audit.clone()));

                    let mut live = Vec::new();
                    for op in &ops {
                        match op {
                            Op::Add => live.push(ctx.add(Order::new(0)).unwrap()),
                            Op::Update(i) if !live.is_empty() => {
                                let h = &live[i % live.len()];
                                ctx.update(h, |o| o.total += 1).unwrap();
                            }
                            Op::Remove(i) if !live.is_empty() => {
                                let h = live.remove(i % live.len());
                                ctx.remove(&h).unwrap();
                            }
                            _ => {}
                        }
                    }

                    let expected: Vec<_> = ctx
                        .domain_events()
                        .iter()
                        .map(|e| (e.entity_id(), e.kind()))
                        .collect();

                    let changes = uow.commit(&CancellationToken::new()).await.unwrap();
                    let seen: Vec<_> = audit.seen().iter().map(|(id, k, _)| (*id, *k)).collect();

                    if changes == 0 {
                        prop_assert!(seen.is_empty());
                        prop_assert_eq!(ctx.domain_events().len(), expected.len());
                    } else {
                        prop_assert_eq!(seen, expected);
                        prop_assert!(ctx.domain_events().is_empty());
                    }
                    Ok::<(), TestCaseError>(())
                })?;
            }
        }
    }
}
