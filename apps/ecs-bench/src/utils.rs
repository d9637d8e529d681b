use ecs_core::{AddRemove, Component, Ecs};

/// Benchmark component: a small POD payload representative of a typical
/// hot-path component, mirroring the shapes used in the storage engine's
/// own lock-contention benchmarks.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}
impl Component for Position {}

#[derive(Default, Clone, Debug, PartialEq)]
pub struct Velocity {
    pub dx: f32,
    pub dy: f32,
}
impl Component for Velocity {}

pub type World = Ecs<(Position, Velocity)>;

/// Builds a world pre-populated with `entity_count` entities, each carrying
/// a `Position`.
pub fn populated_world(entity_count: usize) -> World {
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

/// Parses a comma-separated string into a vector of `usize`.
pub fn parse_comma_separated(input: &str) -> Vec<usize> {
    input
        .split(',')
        .map(|s| {
            s.trim()
                .parse()
                .expect("Invalid value: must be a positive integer")
        })
        .collect()
}

/// Runs every performance regression test in sequence.
pub fn run_all_benchmarks() {
    use crate::benchmarks;

    println!("Running all performance regression tests...");
    println!("{}", "=".repeat(60));

    println!("\n1. Transaction Throughput Test");
    println!("{}", "-".repeat(40));
    benchmarks::transaction_throughput::run_transaction_throughput_test(100_000, 50_000);

    println!("\n2. Writer Priority Test");
    println!("{}", "-".repeat(40));
    benchmarks::writer_priority::run_writer_priority_test(16, 1_000);

    println!("\n3. Entity Growth Test");
    println!("{}", "-".repeat(40));
    benchmarks::entity_growth::run_entity_growth_test(&[1_000, 10_000, 100_000]);

    println!("\n{}", "=".repeat(60));
    println!("All tests completed.");
}
