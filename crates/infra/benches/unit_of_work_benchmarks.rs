use std::sync::Arc;

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio_util::sync::CancellationToken;

use tessera_core::{Entity, EntityBase, EntityId};
use tessera_events::{DomainEvent, DomainEventHandler, HandlerError, Mediator};
use tessera_infra::UnitOfWork;
use tessera_infra::change_tracker::{InMemoryContext, InMemoryDatabase};

#[derive(Debug, Clone)]
struct Counter {
    base: EntityBase,
    value: u64,
}

impl Entity for Counter {
    fn entity_type() -> &'static str {
        "counter"
    }

    fn base(&self) -> &EntityBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EntityBase {
        &mut self.base
    }
}

struct Noop;

#[async_trait]
impl DomainEventHandler<Counter> for Noop {
    async fn handle(
        &self,
        event: &DomainEvent<Counter>,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        black_box(event.meta().event_id);
        Ok(())
    }
}

fn mediator() -> Arc<Mediator> {
    let mut mediator = Mediator::new();
    mediator.on_any::<Counter, _>(Noop);
    Arc::new(mediator)
}

/// Commit N freshly added entities (N rows, N events).
fn bench_commit_inserts(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let dispatcher = mediator();
    let mut group = c.benchmark_group("commit_inserts");

    for n in [1usize, 10, 100, 1_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let ctx = Arc::new(InMemoryContext::new(InMemoryDatabase::arc()));
                let mut uow = UnitOfWork::new(ctx.clone(), dispatcher.clone());
                for i in 0..n {
                    ctx.add(Counter {
                        base: EntityBase::new(EntityId::new()),
                        value: i as u64,
                    })
                    .expect("add");
                }
                rt.block_on(uow.commit(&CancellationToken::new()))
                    .expect("commit")
            });
        });
    }

    group.finish();
}

/// One entity with N updates before commit (1 row, N + 1 events).
fn bench_commit_event_fan_in(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let dispatcher = mediator();
    let mut group = c.benchmark_group("commit_event_fan_in");

    for n in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(n as u64 + 1));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let ctx = Arc::new(InMemoryContext::new(InMemoryDatabase::arc()));
                let mut uow = UnitOfWork::new(ctx.clone(), dispatcher.clone());
                let counter = ctx
                    .add(Counter {
                        base: EntityBase::new(EntityId::new()),
                        value: 0,
                    })
                    .expect("add");
                for _ in 0..n {
                    ctx.update(&counter, |c| c.value += 1).expect("update");
                }
                rt.block_on(uow.commit(&CancellationToken::new()))
                    .expect("commit")
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_commit_inserts, bench_commit_event_fan_in);
criterion_main!(benches);
