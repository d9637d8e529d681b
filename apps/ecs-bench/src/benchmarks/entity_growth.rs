use crate::utils::World;
use ecs_core::AddRemove;
use std::time::Instant;

/// Runs the entity allocation/growth throughput test across a list of
/// target entity counts, exercising the free-list reuse and batch-growth
/// path at each boundary.
pub fn run_entity_growth_test(entity_counts: &[usize]) {
    println!("Running entity allocation/growth throughput test...");
    println!("Entity counts: {:?}", entity_counts);

    let mut failed = Vec::new();

    for &count in entity_counts {
        println!("\nAllocating {} entities...", count);
        let ecs = World::with_default_config();

        let start = Instant::now();
        {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            for _ in 0..count {
                let _ = std::hint::black_box(txn.new_entity().unwrap());
            }
        }
        let elapsed = start.elapsed();

        let allocs_per_sec = if elapsed.as_secs_f64() == 0.0 {
            0.0
        } else {
            count as f64 / elapsed.as_secs_f64()
        };

        println!("  Total time: {:?}", elapsed);
        println!("  Allocations per second: {:.2}", allocs_per_sec);
        println!("  Target: >1,000,000 allocations/sec");

        if allocs_per_sec > 1_000_000.0 {
            println!("  \u{2705} PASS: Entity allocation throughput meets target");
        } else {
            println!("  \u{274c} FAIL: Entity allocation throughput below target");
            failed.push(count);
        }
    }

    if failed.is_empty() {
        println!("\nAll entity counts met the allocation throughput target.");
    } else {
        println!("\nEntity counts below target: {:?}", failed);
    }
}
