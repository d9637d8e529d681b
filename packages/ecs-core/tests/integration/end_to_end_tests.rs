//! Six concrete end-to-end scenarios covering the public API surface.

use ntest::timeout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use ecs_core::{AddRemove, Component, Ecs, EcsError, Read, Write};

#[derive(Default, Clone, Copy, Debug, PartialEq)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}
impl Component for Position {}

#[derive(Default, Clone, Copy, Debug, PartialEq)]
struct Count(u32);
impl Component for Count {}

type World = Ecs<(Position, Count)>;

/// Scenario 1: insert-read round trip.
#[test]
#[timeout(2000)]
fn insert_read_round_trip() {
    let ecs = World::with_default_config();

    let (e0, e2) = {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        let e0 = txn.new_entity().unwrap();
        let e1 = txn.new_entity().unwrap();
        let e2 = txn.new_entity().unwrap();
        txn.set(e0, Position { x: 1.0, y: 2.0, z: 3.0 }).unwrap();
        txn.set(e2, Position { x: 1.0, y: 2.0, z: 3.0 }).unwrap();
        let _ = e1;
        (e0, e2)
    };

    let txn = ecs.begin_transaction::<Read<Position>>().unwrap();
    let mut with_position = txn.entities_with::<Position>().unwrap();
    with_position.sort();
    let mut expected = [e0, e2];
    expected.sort();
    assert_eq!(with_position, expected);
    assert_eq!(*txn.get::<Position>(e0).unwrap(), Position { x: 1.0, y: 2.0, z: 3.0 });
}

/// Scenario 2: double-buffer isolation.
#[test]
#[timeout(2000)]
fn double_buffer_isolation() {
    let ecs = Arc::new(World::with_default_config());
    let e = {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        let e = txn.new_entity().unwrap();
        txn.set(e, Count(5)).unwrap();
        e
    };

    let reader_sees_five = Arc::new(AtomicBool::new(false));

    {
        let txn = ecs.begin_transaction::<Write<Count>>().unwrap();
        assert_eq!(*txn.get::<Count>(e).unwrap(), Count(5));
        txn.set(e, Count(7)).unwrap();
        assert_eq!(*txn.get_previous::<Count>(e).unwrap(), Count(5));
        assert_eq!(*txn.get::<Count>(e).unwrap(), Count(7));

        // A concurrent reader on another thread sees the pre-commit value
        // while the writer still holds its write lock: reads stay admitted
        // right up until `CommitLock` is taken.
        let reader_ecs = ecs.clone();
        let reader_seen = reader_sees_five.clone();
        thread::spawn(move || {
            let read_txn = reader_ecs.begin_transaction::<Read<Count>>().unwrap();
            if *read_txn.get::<Count>(e).unwrap() == Count(5) {
                reader_seen.store(true, Ordering::SeqCst);
            }
        })
        .join()
        .unwrap();
    }

    let txn = ecs.begin_transaction::<Read<Count>>().unwrap();
    assert_eq!(*txn.get::<Count>(e).unwrap(), Count(7));
    assert!(reader_sees_five.load(Ordering::SeqCst));
}

/// Scenario 3: writer priority at commit.
#[test]
#[timeout(5000)]
fn writer_priority_at_commit() {
    let ecs = Arc::new(World::with_default_config());
    let e = {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        let e = txn.new_entity().unwrap();
        txn.set(e, Count(0)).unwrap();
        e
    };

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..16)
        .map(|_| {
            let ecs = ecs.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Ok(txn) = ecs.begin_transaction::<Read<Count>>() {
                        let _ = txn.get::<Count>(e);
                    }
                }
            })
        })
        .collect();

    {
        let txn = ecs.begin_transaction::<Write<Count>>().unwrap();
        txn.set(e, Count(99)).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }

    let txn = ecs.begin_transaction::<Read<Count>>().unwrap();
    assert_eq!(*txn.get::<Count>(e).unwrap(), Count(99));
}

/// Scenario 4: stale handle after destroy-then-reallocate.
#[test]
#[timeout(2000)]
fn stale_handle_after_destroy_and_reuse() {
    let ecs = World::with_default_config();
    let old = {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        let e = txn.new_entity().unwrap();
        txn.destroy(e).unwrap();
        e
    };

    let new = {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        txn.new_entity().unwrap()
    };
    assert_eq!(new.index(), old.index());
    assert!(new.generation() > old.generation());

    let txn = ecs.begin_transaction::<Read<Position>>().unwrap();
    assert!(matches!(txn.get::<Position>(old), Err(EcsError::StaleEntity { .. })));
    assert!(txn.has::<Position>(new).is_ok());
}

/// Scenario 5: observer FIFO across a sequence of commits.
#[test]
#[timeout(2000)]
fn observer_fifo_across_commits() {
    let ecs = World::with_default_config();
    let e = {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        txn.new_entity().unwrap()
    };

    let observer = {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        txn.register_observer::<Count>().unwrap()
    };

    {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        txn.set(e, Count(1)).unwrap();
    }
    {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        txn.set(e, Count(2)).unwrap();
    }
    {
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        txn.unset::<Count>(e).unwrap();
    }

    use ecs_core::observer::Event;
    assert!(matches!(observer.poll().unwrap(), Some(Event::Added(_, _))));
    assert!(matches!(observer.poll().unwrap(), Some(Event::Modified(_))));
    assert!(matches!(observer.poll().unwrap(), Some(Event::Removed(_))));
    assert!(observer.poll().unwrap().is_none());
}

/// Scenario 6: foreign entity rejection across two `Ecs` instances.
#[test]
#[timeout(2000)]
fn foreign_entity_rejected_across_instances() {
    let a = World::with_default_config();
    let b = World::with_default_config();

    let e = {
        let txn = a.begin_transaction::<AddRemove>().unwrap();
        txn.new_entity().unwrap()
    };

    let txn = b.begin_transaction::<AddRemove>().unwrap();
    assert!(matches!(txn.get::<Position>(e), Err(EcsError::ForeignEntity { .. })));
    assert!(matches!(
        txn.set(e, Position::default()),
        Err(EcsError::ForeignEntity { .. })
    ));
    assert!(matches!(txn.destroy(e), Err(EcsError::ForeignEntity { .. })));
}
