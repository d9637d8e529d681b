//! Per-component-type double-buffered storage and its commit algorithm.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::component::Component;
use crate::config::EcsConfig;
use crate::lock::ComponentMutex;
use crate::storage::DenseList;

/// Below this fraction of `write`'s length, commit copies only the entries
/// named by `writeValid` one at a time; at or above it, commit does a
/// single bulk `clone_from_slice` over the whole vector instead, since a
/// full linear copy beats scattered random-access writes once enough of
/// the buffer changed.
pub const BULK_COPY_DENOMINATOR: usize = 6;

/// `read`/`write` parallel vectors of `T`, their dense "has this
/// component" lists, the per-type lock, and the write-access bit that lets
/// commit skip entirely when nothing was written.
///
/// All interior mutation happens through `UnsafeCell`: the synchronization
/// discipline is entirely the job of `mutex` (a [`ComponentMutex`]), driven
/// by the owning [`crate::transaction::Transaction`] rather than a
/// `std`/`parking_lot` `RwLock`.
pub struct ComponentStore<T: Component> {
    name: &'static str,
    mutex: ComponentMutex,
    read: UnsafeCell<Vec<T>>,
    write: UnsafeCell<Vec<T>>,
    read_valid: UnsafeCell<DenseList>,
    write_valid: UnsafeCell<DenseList>,
    dirty: UnsafeCell<Vec<u32>>,
    write_access: AtomicBool,
}

// SAFETY: all interior mutation is gated by `mutex`, which enforces the
// single-writer/many-reader/exclusive-commit discipline. Callers reach
// these cells only via `Transaction`, which acquired the matching lock
// state on construction.
unsafe impl<T: Component> Sync for ComponentStore<T> {}

impl<T: Component> ComponentStore<T> {
    pub fn new(name: &'static str, _config: &EcsConfig) -> Self {
        Self {
            name,
            mutex: ComponentMutex::new(name),
            read: UnsafeCell::new(Vec::new()),
            write: UnsafeCell::new(Vec::new()),
            read_valid: UnsafeCell::new(DenseList::new()),
            write_valid: UnsafeCell::new(DenseList::new()),
            dirty: UnsafeCell::new(Vec::new()),
            write_access: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mutex(&self) -> &ComponentMutex {
        &self.mutex
    }

    /// Appends `additional` default-initialized slots to both buffers.
    /// Called by `NewEntity`'s batch growth for every registered type,
    /// regardless of whether `T` is the type being allocated for.
    pub fn grow_by(&self, additional: usize) {
        // SAFETY: only called while the owning transaction holds the EMS
        // writer lock for an AddRemove transaction, which this store's
        // mutex is also held as writer/committer for at that point.
        unsafe {
            let read = &mut *self.read.get();
            let write = &mut *self.write.get();
            for _ in 0..additional {
                read.push(T::default());
                write.push(T::default());
            }
            if let Some(last_index) = write.len().checked_sub(1) {
                let read_valid = &mut *self.read_valid.get();
                let write_valid = &mut *self.write_valid.get();
                read_valid.reserve_slot(last_index as u32);
                write_valid.reserve_slot(last_index as u32);
            }
        }
    }

    /// `Has<T>(e)` when `AddRemove` is held: current (write-buffer)
    /// presence.
    pub fn write_has(&self, slot: u32) -> bool {
        unsafe { (*self.write_valid.get()).contains(slot) }
    }

    /// `Has<T>(e)` otherwise, and `Had<T>(e)`: read-buffer (pre-transaction)
    /// presence.
    pub fn read_has(&self, slot: u32) -> bool {
        unsafe { (*self.read_valid.get()).contains(slot) }
    }

    /// `GetPrevious<T>(e)`: const ref into the read buffer.
    ///
    /// # Safety
    /// Caller must hold at least a read lock on this store and must have
    /// verified `read_has(slot)`.
    pub unsafe fn read_slot(&self, slot: u32) -> &T {
        &(*self.read.get())[slot as usize]
    }

    /// `Get<T>(e)` without write access: same as `read_slot`.
    ///
    /// # Safety
    /// Caller must hold at least a read lock on this store.
    pub unsafe fn write_slot_shared(&self, slot: u32) -> &T {
        &(*self.write.get())[slot as usize]
    }

    /// `Get<T>(e)`/`Set<T>(e, v)` with write access: mutable ref into the
    /// write buffer. Marks the store dirty so commit actually runs.
    ///
    /// # Safety
    /// Caller must hold the write lock on this store.
    pub unsafe fn write_slot_mut(&self, slot: u32) -> &mut T {
        self.write_access.store(true, Ordering::Relaxed);
        &mut (*self.write.get())[slot as usize]
    }

    /// Marks `slot` present in the write buffer's dense list and records it
    /// as explicitly written this transaction (drives `Modified` events).
    /// Used by `Set`/auto-insert-on-`Get`.
    ///
    /// # Safety
    /// Caller must hold the write lock on this store.
    pub unsafe fn mark_present(&self, slot: u32) {
        (*self.write_valid.get()).insert(slot);
        (*self.dirty.get()).push(slot);
        self.write_access.store(true, Ordering::Relaxed);
    }

    /// `Unset<T>(e)`: clears presence and default-reinitializes the write
    /// slot.
    ///
    /// # Safety
    /// Caller must hold the write lock on this store (implied by
    /// `AddRemove`).
    pub unsafe fn unset(&self, slot: u32) {
        (*self.write_valid.get()).remove(slot);
        (*self.write.get())[slot as usize] = T::default();
        self.write_access.store(true, Ordering::Relaxed);
    }

    pub fn write_valid_items(&self) -> Vec<u32> {
        unsafe { (*self.write_valid.get()).items().to_vec() }
    }

    pub fn read_valid_items(&self) -> Vec<u32> {
        unsafe { (*self.read_valid.get()).items().to_vec() }
    }

    /// Entities present in whichever buffer `EntitiesWith<T>` should read
    /// from.
    pub fn entities_with(&self, add_remove_view: bool) -> Vec<u32> {
        if add_remove_view {
            self.write_valid_items()
        } else {
            self.read_valid_items()
        }
    }

    /// Non-destructive peek at the write-access bit, so a caller can decide
    /// whether to acquire the commit lock at all: if held as writer with no
    /// writes, a plain `WriteUnlock` skips `CommitLock` entirely rather
    /// than taking it just to find nothing to publish.
    pub fn has_write_access(&self) -> bool {
        self.write_access.load(Ordering::Relaxed)
    }

    /// Runs the commit algorithm for this type. Returns the (deduplicated)
    /// set of entity slots that were explicitly `Set` this
    /// transaction, for the caller to correlate with `Added`/`Removed`
    /// diffs when building observer events; `None` if commit was skipped
    /// because no writes were observed (plain-write case only).
    ///
    /// # Safety
    /// Caller must hold the commit lock on this store (i.e. have called
    /// `ComponentMutex::commit_lock`).
    pub unsafe fn commit(&self, add_remove: bool) -> Option<Vec<u32>> {
        if !add_remove && !self.write_access.swap(false, Ordering::Relaxed) {
            return None;
        }
        self.write_access.store(false, Ordering::Relaxed);

        let write = &*self.write.get();
        let read = &mut *self.read.get();
        let write_valid = &*self.write_valid.get();
        let read_valid = &mut *self.read_valid.get();

        if add_remove {
            read.clear();
            read.extend_from_slice(write);
            read_valid.copy_from(write_valid);
        } else {
            let entries = write_valid.items();
            if entries.len() > write.len() / BULK_COPY_DENOMINATOR.max(1) {
                read.clear();
                read.extend_from_slice(write);
            } else {
                for &slot in entries {
                    read[slot as usize] = write[slot as usize].clone();
                }
            }
            read_valid.copy_from(write_valid);
        }

        let dirty = &mut *self.dirty.get();
        let mut result = std::mem::take(dirty);
        result.sort_unstable();
        result.dedup();
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Clone, PartialEq, Debug)]
    struct Position {
        x: f32,
        y: f32,
        z: f32,
    }
    impl Component for Position {}

    fn cfg() -> EcsConfig {
        EcsConfig::default()
    }

    #[test]
    fn grow_then_set_then_commit_publishes_value() {
        let store = ComponentStore::<Position>::new("Position", &cfg());
        store.grow_by(4);
        unsafe {
            *store.write_slot_mut(1) = Position { x: 1.0, y: 2.0, z: 3.0 };
            store.mark_present(1);
        }
        assert!(store.write_has(1));
        assert!(!store.read_has(1));

        unsafe {
            store.commit(false);
        }
        assert!(store.read_has(1));
        unsafe {
            assert_eq!(*store.read_slot(1), Position { x: 1.0, y: 2.0, z: 3.0 });
        }
    }

    #[test]
    fn commit_is_skipped_without_writes_in_plain_mode() {
        let store = ComponentStore::<Position>::new("Position", &cfg());
        store.grow_by(2);
        let result = unsafe { store.commit(false) };
        assert!(result.is_none());
    }

    #[test]
    fn unset_clears_presence_and_commits() {
        let store = ComponentStore::<Position>::new("Position", &cfg());
        store.grow_by(2);
        unsafe {
            store.mark_present(0);
            store.commit(false);
        }
        assert!(store.read_has(0));

        unsafe {
            store.unset(0);
            store.commit(true);
        }
        assert!(!store.read_has(0));
    }
}
