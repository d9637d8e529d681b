use crate::utils::{populated_world, Position};
use ecs_core::Read;
use std::time::Instant;

/// Runs the read-transaction throughput test.
pub fn run_transaction_throughput_test(entity_count: usize, iterations: usize) {
    println!("Running read-transaction throughput test...");
    println!("Entity count: {}, Iterations: {}", entity_count, iterations);

    println!("Pre-populating {} entities...", entity_count);
    let start_populate = Instant::now();
    let ecs = populated_world(entity_count);
    println!("Pre-population complete in {:?}", start_populate.elapsed());

    println!("Starting transaction benchmark...");
    let start = Instant::now();

    for _ in 0..iterations {
        let txn = ecs.begin_transaction::<Read<Position>>().unwrap();
        let result = txn.entities_with::<Position>().unwrap().len();
        let _ = std::hint::black_box(result);
    }

    let elapsed = start.elapsed();
    if elapsed > std::time::Duration::from_secs(30) {
        println!("Warning: test took longer than 30 seconds");
    }
    let txns_per_sec = if elapsed.as_secs_f64() == 0.0 {
        0.0
    } else {
        iterations as f64 / elapsed.as_secs_f64()
    };

    println!("Results:");
    println!("  Total time: {:?}", elapsed);
    println!("  Transactions per second: {:.2}", txns_per_sec);
    println!("  Target: >100,000 read transactions/sec/core");

    if txns_per_sec > 100_000.0 {
        println!("  \u{2705} PASS: Read-transaction throughput meets target");
    } else {
        println!("  \u{274c} FAIL: Read-transaction throughput below target");
        println!(
            "     Performance: {:.2} txns/sec (target: >100,000 txns/sec/core)",
            txns_per_sec
        );
    }
}
