//! Lock-contention benchmarks for the transaction engine.
//!
//! Performance regression tests:
//! - Read-only transaction throughput under no contention.
//! - Write-transaction commit latency with concurrent readers.
//! - Entity allocation throughput across a growth boundary.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ecs_core::{AddRemove, Component, Ecs, Read, Write};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Default, Clone, Debug, PartialEq)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}
impl Component for Position {}

#[derive(Default, Clone, Debug, PartialEq)]
struct Velocity {
    dx: f32,
    dy: f32,
}
impl Component for Velocity {}

type World = Ecs<(Position, Velocity)>;

fn populated_world(entity_count: usize) -> World {
    let ecs = World::with_default_config();
    let txn = ecs.begin_transaction::<AddRemove>().unwrap();
    for i in 0..entity_count {
        let e = txn.new_entity().unwrap();
        txn.set(
            e,
            Position {
                x: i as f32,
                y: 0.0,
                z: 0.0,
            },
        )
        .unwrap();
    }
    drop(txn);
    ecs
}

fn benchmark_read_transaction_throughput(c: &mut Criterion) {
    let ecs = populated_world(10_000);

    let mut group = c.benchmark_group("read_transaction_throughput");
    group.warm_up_time(Duration::from_millis(500));
    group.bench_function("entities_with_position", |b| {
        b.iter(|| {
            let txn = ecs.begin_transaction::<Read<Position>>().unwrap();
            black_box(txn.entities_with::<Position>().unwrap().len())
        });
    });
    group.finish();
}

fn benchmark_writer_commit_under_reader_contention(c: &mut Criterion) {
    let ecs = Arc::new(populated_world(1_000));
    let stop = Arc::new(AtomicBool::new(false));

    let reader_ecs = ecs.clone();
    let reader_stop = stop.clone();
    let reader = thread::spawn(move || {
        while !reader_stop.load(Ordering::Relaxed) {
            if let Ok(txn) = reader_ecs.begin_transaction::<Read<Position>>() {
                let _ = txn.entities_with::<Position>();
            }
        }
    });

    let mut group = c.benchmark_group("writer_commit_under_reader_contention");
    group.sample_size(30);
    group.bench_function("single_write_with_100_readers", |b| {
        b.iter(|| {
            let txn = ecs.begin_transaction::<Write<Position>>().unwrap();
            let entities = txn.entities_with::<Position>().unwrap();
            if let Some(&e) = entities.first() {
                txn.set(e, Position { x: 1.0, y: 2.0, z: 3.0 }).unwrap();
            }
        });
    });
    group.finish();

    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();
}

fn benchmark_entity_allocation_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("entity_allocation_growth");
    for &count in &[100usize, 1_000, 5_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let ecs = World::with_default_config();
                let txn = ecs.begin_transaction::<AddRemove>().unwrap();
                for _ in 0..count {
                    black_box(txn.new_entity().unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_read_transaction_throughput,
    benchmark_writer_commit_under_reader_contention,
    benchmark_entity_allocation_growth,
);
criterion_main!(benches);
