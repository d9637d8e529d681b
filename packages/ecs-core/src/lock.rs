//! `ComponentMutex`: the reader/writer/commit lock protocol shared by the
//! entity metadata store and every per-type component store.
//!
//! New readers are admitted throughout a write, right up until commit
//! begins; this keeps writers from starving readers while still letting
//! commit reach mutual exclusion. `commit_lock` raises the writer state to
//! `COMMIT` *before* waiting on readers to drain, so any reader that arrives
//! during commit sees `COMMIT` and must wait -- this gives writers priority
//! exactly at publication.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::EcsConfig;
use crate::trace::{LockEvent, Tracer};

const READERS_FREE: u32 = 0;
const READERS_LOCKED: u32 = u32::MAX;

const WRITER_FREE: u32 = 0;
const WRITER_HELD: u32 = 1;
const WRITER_COMMIT: u32 = 2;

/// The reader/writer/commit state machine shared by every locked store.
///
/// Holds two atomic counters: `readers` (a count, or `READERS_LOCKED` while
/// a commit is draining existing readers) and `writer` (free / held /
/// committing). No component-value mutex exists here -- fine-grained
/// concurrency inside a single component value is the caller's
/// responsibility.
#[derive(Debug)]
pub struct ComponentMutex {
    readers: AtomicU32,
    writer: AtomicU32,
    name: &'static str,
}

/// A fatal lock-protocol violation: a commit/unlock call made without its
/// required precondition. Always indicates a bug in the caller (never in
/// well-formed transaction code) and is unconditionally fatal.
#[derive(Debug)]
pub struct LockProtocolViolation(pub &'static str);

impl std::fmt::Display for LockProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock protocol violation: {}", self.0)
    }
}

impl std::error::Error for LockProtocolViolation {}

fn fatal(name: &str, msg: &'static str) -> ! {
    tracing::error!(component = name, "{}", msg);
    panic!("{}", LockProtocolViolation(msg));
}

impl ComponentMutex {
    pub fn new(name: &'static str) -> Self {
        Self {
            readers: AtomicU32::new(READERS_FREE),
            writer: AtomicU32::new(WRITER_FREE),
            name,
        }
    }

    /// Acquire a read lock. Succeeds whenever `readers != LOCKED` and
    /// `writer != COMMIT`. If `block` is `false`, returns `false` instead of
    /// spinning.
    pub fn read_lock(&self, config: &EcsConfig, tracer: &Tracer, block: bool) -> bool {
        let mut retry = 0u32;
        let mut waited = false;
        loop {
            let current_readers = self.readers.load(Ordering::Relaxed);
            let current_writer = self.writer.load(Ordering::Relaxed);
            if current_readers != READERS_LOCKED && current_writer != WRITER_COMMIT {
                let next = current_readers + 1;
                if self
                    .readers
                    .compare_exchange_weak(
                        current_readers,
                        next,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    tracer.record(LockEvent::ReadLock, self.name);
                    return true;
                }
                continue;
            }

            if !block {
                return false;
            }

            if !waited {
                tracer.record(LockEvent::ReadLockWait, self.name);
                waited = true;
            }
            Self::spin_then_wait_named(self.name, config, &mut retry, "readers");
        }
    }

    fn spin_then_wait_named(name: &str, config: &EcsConfig, retry: &mut u32, waiting_on: &'static str) {
        *retry += 1;
        if *retry > config.spinlock_retry_yield {
            *retry = 0;
            tracing::trace!(component = name, wait = waiting_on, "lock backoff yield");
            std::thread::yield_now();
        }
    }

    /// Release a read lock acquired via `read_lock`.
    pub fn read_unlock(&self, tracer: &Tracer) {
        let previous = self.readers.fetch_sub(1, Ordering::Release);
        if previous == READERS_FREE || previous == READERS_LOCKED {
            fatal(self.name, "read_unlock called outside of read_lock");
        }
        tracer.record(LockEvent::ReadUnlock, self.name);
    }

    /// Acquire the single writer slot. Readers may still acquire or hold
    /// read locks concurrently with a held write lock.
    pub fn write_lock(&self, config: &EcsConfig, tracer: &Tracer, block: bool) -> bool {
        let mut retry = 0u32;
        let mut waited = false;
        loop {
            let current = self.writer.load(Ordering::Relaxed);
            if current == WRITER_FREE {
                if self
                    .writer
                    .compare_exchange_weak(current, WRITER_HELD, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    tracer.record(LockEvent::WriteLock, self.name);
                    return true;
                }
                continue;
            }

            if !block {
                return false;
            }

            if !waited {
                tracer.record(LockEvent::WriteLockWait, self.name);
                waited = true;
            }
            Self::spin_then_wait_named(self.name, config, &mut retry, "writer");
        }
    }

    /// Transition from a held write lock to a commit lock: raise
    /// `writer = COMMIT` (blocking new readers), then wait for existing
    /// readers to drain to zero. Precondition: `writer == WRITER_HELD`.
    pub fn commit_lock(&self, config: &EcsConfig, tracer: &Tracer) {
        let current = self.writer.load(Ordering::Relaxed);
        if current != WRITER_HELD {
            fatal(self.name, "commit_lock called outside of write_lock");
        }
        if self
            .writer
            .compare_exchange(current, WRITER_COMMIT, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            fatal(self.name, "writer changed unexpectedly during commit_lock");
        }

        let mut retry = 0u32;
        let mut waited = false;
        loop {
            let current_readers = self.readers.load(Ordering::Relaxed);
            if current_readers == READERS_FREE
                && self
                    .readers
                    .compare_exchange_weak(
                        current_readers,
                        READERS_LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                tracer.record(LockEvent::CommitLock, self.name);
                return;
            }
            if !waited {
                tracer.record(LockEvent::CommitLockWait, self.name);
                waited = true;
            }
            Self::spin_then_wait_named(self.name, config, &mut retry, "readers draining");
        }
    }

    /// Release readers (new readers now observe the just-committed values)
    /// and drop back from `COMMIT` to `WRITER_HELD`.
    pub fn commit_unlock(&self, tracer: &Tracer) {
        let readers_current = self.readers.load(Ordering::Relaxed);
        if readers_current != READERS_LOCKED {
            fatal(self.name, "commit_unlock called outside of commit_lock");
        }
        if self
            .readers
            .compare_exchange(readers_current, READERS_FREE, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            fatal(self.name, "readers changed unexpectedly during commit_unlock");
        }

        let writer_current = self.writer.load(Ordering::Relaxed);
        if writer_current != WRITER_COMMIT {
            fatal(self.name, "commit_unlock called outside of commit_lock");
        }
        if self
            .writer
            .compare_exchange(writer_current, WRITER_HELD, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            fatal(self.name, "writer changed unexpectedly during commit_unlock");
        }
        tracer.record(LockEvent::CommitUnlock, self.name);
    }

    /// Release the writer slot, from either `WRITER_HELD` (no writes were
    /// committed) or `WRITER_COMMIT` (commit_unlock was skipped because the
    /// holder chose not to publish).
    pub fn write_unlock(&self, tracer: &Tracer) {
        let readers_current = self.readers.load(Ordering::Relaxed);
        if readers_current == READERS_LOCKED {
            if self
                .readers
                .compare_exchange(readers_current, READERS_FREE, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                fatal(self.name, "readers changed unexpectedly during write_unlock");
            }
        }

        let writer_current = self.writer.load(Ordering::Relaxed);
        if writer_current != WRITER_HELD && writer_current != WRITER_COMMIT {
            fatal(self.name, "write_unlock called outside of write_lock");
        }
        if self
            .writer
            .compare_exchange(writer_current, WRITER_FREE, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            fatal(self.name, "writer changed unexpectedly during write_unlock");
        }
        tracer.record(LockEvent::WriteUnlock, self.name);
    }

    #[cfg(test)]
    pub(crate) fn is_write_held(&self) -> bool {
        self.writer.load(Ordering::Relaxed) != WRITER_FREE
    }

    #[cfg(test)]
    pub(crate) fn reader_count(&self) -> u32 {
        let v = self.readers.load(Ordering::Relaxed);
        if v == READERS_LOCKED {
            0
        } else {
            v
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;
    use std::sync::Arc;
    use std::thread;

    fn cfg() -> EcsConfig {
        EcsConfig::default()
    }

    fn tracer() -> Tracer {
        Tracer::new(1000)
    }

    #[test]
    #[timeout(1000)]
    fn read_lock_then_unlock_round_trips() {
        let m = ComponentMutex::new("t");
        assert!(m.read_lock(&cfg(), &tracer(), true));
        assert_eq!(m.reader_count(), 1);
        m.read_unlock(&tracer());
        assert_eq!(m.reader_count(), 0);
    }

    #[test]
    #[timeout(1000)]
    fn multiple_readers_concurrently() {
        let m = ComponentMutex::new("t");
        assert!(m.read_lock(&cfg(), &tracer(), true));
        assert!(m.read_lock(&cfg(), &tracer(), true));
        assert_eq!(m.reader_count(), 2);
        m.read_unlock(&tracer());
        m.read_unlock(&tracer());
    }

    #[test]
    #[timeout(1000)]
    fn write_lock_excludes_second_writer_nonblocking() {
        let m = ComponentMutex::new("t");
        assert!(m.write_lock(&cfg(), &tracer(), true));
        assert!(!m.write_lock(&cfg(), &tracer(), false));
        m.write_unlock(&tracer());
    }

    #[test]
    #[timeout(1000)]
    fn readers_still_admitted_while_write_held_but_not_during_commit() {
        let m = ComponentMutex::new("t");
        assert!(m.write_lock(&cfg(), &tracer(), true));
        assert!(m.read_lock(&cfg(), &tracer(), false), "readers allowed during plain write");
        m.read_unlock(&tracer());

        m.commit_lock(&cfg(), &tracer());
        assert!(
            !m.read_lock(&cfg(), &tracer(), false),
            "readers must be blocked once commit has begun"
        );
        m.commit_unlock(&tracer());
        m.write_unlock(&tracer());
    }

    #[test]
    #[timeout(1000)]
    #[should_panic(expected = "lock protocol violation")]
    fn commit_lock_without_write_lock_is_fatal() {
        let m = ComponentMutex::new("t");
        m.commit_lock(&cfg(), &tracer());
    }

    #[test]
    #[timeout(1000)]
    #[should_panic(expected = "lock protocol violation")]
    fn read_unlock_without_read_lock_is_fatal() {
        let m = ComponentMutex::new("t");
        m.read_unlock(&tracer());
    }

    #[test]
    #[timeout(2000)]
    fn writer_priority_blocks_new_readers_at_commit() {
        // A continuous stream of readers should not starve a writer once it
        // raises COMMIT.
        let m = Arc::new(ComponentMutex::new("t"));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader_m = m.clone();
        let reader_stop = stop.clone();
        let reader = thread::spawn(move || {
            let reader_tracer = tracer();
            while !reader_stop.load(Ordering::Relaxed) {
                if reader_m.read_lock(&EcsConfig::default(), &reader_tracer, false) {
                    reader_m.read_unlock(&reader_tracer);
                }
            }
        });

        assert!(m.write_lock(&cfg(), &tracer(), true));
        m.commit_lock(&cfg(), &tracer());
        m.commit_unlock(&tracer());
        m.write_unlock(&tracer());

        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }
}
