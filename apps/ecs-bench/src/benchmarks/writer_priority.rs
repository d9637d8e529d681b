use crate::utils::{populated_world, Position};
use ecs_core::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Runs the writer-priority-under-contention test: `readers` threads hammer
/// read transactions continuously while the main thread commits `writes`
/// writer transactions, verifying the writer is never starved.
pub fn run_writer_priority_test(readers: usize, writes: usize) {
    println!("Running writer-priority-under-contention test...");
    println!("Reader threads: {}, Writer commits: {}", readers, writes);

    let ecs = Arc::new(populated_world(1_000));
    let stop = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let reader_ecs = ecs.clone();
            let reader_stop = stop.clone();
            thread::spawn(move || {
                while !reader_stop.load(Ordering::Relaxed) {
                    if let Ok(txn) = reader_ecs.begin_transaction::<Read<Position>>() {
                        let _ = std::hint::black_box(txn.entities_with::<Position>());
                    }
                }
            })
        })
        .collect();

    println!("Starting writer commits against {} continuously-reading threads...", readers);
    let start = Instant::now();

    for _ in 0..writes {
        let txn = ecs.begin_transaction::<Write<Position>>().unwrap();
        let entities = txn.entities_with::<Position>().unwrap();
        if let Some(&e) = entities.first() {
            txn.set(e, Position { x: 1.0, y: 2.0, z: 3.0 }).unwrap();
        }
    }

    let elapsed = start.elapsed();
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().expect("reader thread panicked");
    }

    let avg_commit = elapsed / writes as u32;
    let writes_per_sec = if elapsed.as_secs_f64() == 0.0 {
        0.0
    } else {
        writes as f64 / elapsed.as_secs_f64()
    };

    println!("Results:");
    println!("  Total time: {:?}", elapsed);
    println!("  Average commit latency: {:?}", avg_commit);
    println!("  Writes per second: {:.2}", writes_per_sec);
    println!("  Target: average commit latency <10ms under {} readers", readers);

    if avg_commit < std::time::Duration::from_millis(10) {
        println!("  \u{2705} PASS: Writer was not starved by continuous readers");
    } else {
        println!("  \u{274c} FAIL: Writer commit latency exceeded target");
        println!(
            "     Average commit latency: {:?} (target: <10ms)",
            avg_commit
        );
    }
}
