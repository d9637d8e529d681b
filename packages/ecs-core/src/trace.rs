//! Best-effort lock-event trace ring.
//!
//! CSV export and any other consumption of these events is left to external
//! tooling; the core only exposes the ring buffer and the `start`/`stop`
//! hook that fills it. Collection is a runtime toggle (`Ecs::start_tracing`/
//! `stop_tracing`), not a compile-time feature, since a process may want to
//! flip it on only for the span of a single suspicious run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// One entry of the lock-event trace ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    ReadLockWait,
    ReadLock,
    ReadUnlock,
    WriteLockWait,
    WriteLock,
    CommitLockWait,
    CommitLock,
    CommitUnlock,
    WriteUnlock,
}

/// A recorded [`LockEvent`] tagged with the component/store name, the
/// thread that produced it, and a monotonic timestamp.
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord {
    pub event: LockEvent,
    pub component: &'static str,
    pub thread_id: std::thread::ThreadId,
    pub at: Instant,
}

/// A fixed-size, best-effort event ring. Events recorded past `capacity`
/// (default 10 000) are silently dropped rather than reallocating or
/// blocking -- tracing must never become the thing that slows down the
/// lock protocol it is observing.
pub struct Tracer {
    enabled: std::sync::atomic::AtomicBool,
    capacity: usize,
    records: Mutex<Vec<TraceRecord>>,
    dropped: AtomicUsize,
}

impl Tracer {
    pub fn new(capacity: usize) -> Self {
        Self {
            enabled: std::sync::atomic::AtomicBool::new(false),
            capacity,
            records: Mutex::new(Vec::new()),
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn start(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Records one event if tracing is enabled and the ring has room.
    /// Never blocks: a momentarily contended mutex is treated as "drop the
    /// event", matching the "best-effort" contract.
    pub fn record(&self, event: LockEvent, component: &'static str) {
        if !self.is_enabled() {
            return;
        }
        let record = TraceRecord {
            event,
            component,
            thread_id: std::thread::current().id(),
            at: Instant::now(),
        };
        if let Some(mut records) = self.records.try_lock() {
            if records.len() < self.capacity {
                records.push(record);
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drains all currently recorded events. Intended for the trace-export
    /// collaborator to consume and reset the ring between collection runs.
    pub fn drain(&self) -> Vec<TraceRecord> {
        let mut records = self.records.lock();
        std::mem::take(&mut *records)
    }

    /// Number of events dropped because the ring was at capacity.
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
