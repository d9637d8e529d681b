//! Entity metadata store (EMS): per-slot generation/validity bitset,
//! double-buffered, plus the free list entity allocation draws from.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::EcsConfig;
use crate::entity::Entity;
use crate::lock::ComponentMutex;
use crate::storage::DenseList;

/// Bit 0 of a slot's validity bitset: "this slot is alive". Per-component
/// presence is tracked by each `ComponentStore<T>`'s own dense validity
/// list, not by this bitset -- see `ComponentStore::write_has`/`read_has`.
pub const ALIVE_BIT: u64 = 1;

#[derive(Default)]
struct EntitySnapshot {
    generation: Vec<u32>,
    validity: Vec<u64>,
    live: DenseList,
}

impl EntitySnapshot {
    fn grow_to(&mut self, len: usize) {
        self.generation.resize(len, 1);
        self.validity.resize(len, 0);
    }
}

/// The EMS. Only ever held as *writer* by an `AddRemove` transaction
/// (everything else holds it as reader), so its commit path is always a
/// full copy rather than the per-entry variant component stores can take.
pub struct EntityMetaStore {
    mutex: ComponentMutex,
    read: UnsafeCell<EntitySnapshot>,
    write: UnsafeCell<EntitySnapshot>,
    free_list: Mutex<Vec<u32>>,
    write_access: AtomicBool,
}

// SAFETY: see `ComponentStore`'s equivalent impl -- all mutation is gated
// by `mutex`.
unsafe impl Sync for EntityMetaStore {}

impl EntityMetaStore {
    pub fn new() -> Self {
        Self {
            mutex: ComponentMutex::new("__entity_meta_store__"),
            read: UnsafeCell::new(EntitySnapshot::default()),
            write: UnsafeCell::new(EntitySnapshot::default()),
            free_list: Mutex::new(Vec::new()),
            write_access: AtomicBool::new(false),
        }
    }

    pub fn mutex(&self) -> &ComponentMutex {
        &self.mutex
    }

    /// Number of allocated slots (including ones on the free list) in
    /// whichever snapshot `current` selects.
    ///
    /// # Safety
    /// Caller must hold at least a read lock (for `current = false`) or
    /// the write lock (for `current = true`).
    pub unsafe fn capacity(&self, current: bool) -> usize {
        let snapshot = if current { &*self.write.get() } else { &*self.read.get() };
        snapshot.generation.len()
    }

    /// Allocates a fresh entity, growing by `config.entity_allocation_batch_size`
    /// if the free list is empty. Returns the new handle plus
    /// `Some(additional)` if a growth occurred, so the caller can grow
    /// every component store by the same amount.
    ///
    /// # Safety
    /// Caller must hold the EMS write lock (implied by an `AddRemove`
    /// transaction).
    pub unsafe fn allocate(&self, config: &EcsConfig, ecs_id: u8) -> (Entity, Option<usize>) {
        let mut grown = None;
        let index = {
            let mut free_list = self.free_list.lock();
            if free_list.is_empty() {
                let batch = config.entity_allocation_batch_size.max(1);
                let write = &mut *self.write.get();
                let old_len = write.generation.len();
                let reserve_zero = old_len == 0;
                write.grow_to(old_len + batch);
                let first_new = if reserve_zero { 1 } else { old_len };
                for i in first_new..(old_len + batch) {
                    free_list.push(i as u32);
                }
                grown = Some(batch);
                tracing::debug!(batch, new_capacity = old_len + batch, "entity store grew");
            }
            free_list.pop().expect("free list repopulated above")
        };

        let write = &mut *self.write.get();
        write.validity[index as usize] |= ALIVE_BIT;
        write.live.insert(index);
        self.write_access.store(true, Ordering::Relaxed);

        let generation_value = write.generation[index as usize];
        (Entity::new(index, generation_value, ecs_id), grown)
    }

    /// Destroys an entity: clears its validity bitset, removes it from the
    /// live list, and increments its generation so stale handles fail
    /// validation.
    ///
    /// # Safety
    /// Caller must hold the EMS write lock and must have already validated
    /// `entity` against the current write-buffer generation.
    pub unsafe fn destroy(&self, entity: Entity) {
        let write = &mut *self.write.get();
        let index = entity.index();
        write.validity[index as usize] = 0;
        write.live.remove(index);
        write.generation[index as usize] = write.generation[index as usize].wrapping_add(1).max(1);
        self.free_list.lock().push(index);
        self.write_access.store(true, Ordering::Relaxed);
    }

    /// # Safety
    /// Caller must hold at least a read lock (for `current = false`) or
    /// the write lock (for `current = true`).
    pub unsafe fn is_alive(&self, index: u32, current: bool) -> bool {
        let snapshot = if current { &*self.write.get() } else { &*self.read.get() };
        snapshot
            .validity
            .get(index as usize)
            .map(|bits| bits & ALIVE_BIT != 0)
            .unwrap_or(false)
    }

    /// # Safety
    /// Caller must hold at least a read lock (for `current = false`) or
    /// the write lock (for `current = true`).
    pub unsafe fn generation(&self, index: u32, current: bool) -> u32 {
        let snapshot = if current { &*self.write.get() } else { &*self.read.get() };
        snapshot.generation.get(index as usize).copied().unwrap_or(0)
    }

    pub fn live_entities_write(&self) -> Vec<u32> {
        unsafe { (*self.write.get()).live.items().to_vec() }
    }

    pub fn live_entities_read(&self) -> Vec<u32> {
        unsafe { (*self.read.get()).live.items().to_vec() }
    }

    /// Non-destructive peek at the write-access bit (see
    /// `ComponentStore::has_write_access`).
    pub fn has_write_access(&self) -> bool {
        self.write_access.load(Ordering::Relaxed)
    }

    /// Runs the EMS commit: a full copy of generation/validity/live-list
    /// from write into read. Returns `false` (and does nothing else) if no
    /// mutation occurred this transaction.
    ///
    /// # Safety
    /// Caller must hold the EMS commit lock.
    pub unsafe fn commit(&self) -> bool {
        if !self.write_access.swap(false, Ordering::Relaxed) {
            return false;
        }
        let write = &*self.write.get();
        let read = &mut *self.read.get();
        read.generation.clear();
        read.generation.extend_from_slice(&write.generation);
        read.validity.clear();
        read.validity.extend_from_slice(&write.validity);
        read.live.copy_from(&write.live);
        true
    }
}

impl Default for EntityMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EcsConfig {
        EcsConfig::default()
    }

    #[test]
    fn allocate_grows_and_reserves_slot_zero() {
        let ems = EntityMetaStore::new();
        let (e1, grown) = unsafe { ems.allocate(&cfg(), 0) };
        assert_eq!(grown, Some(1000));
        assert_ne!(e1.index(), 0, "slot 0 is reserved and never handed out");
        assert!(unsafe { ems.is_alive(e1.index(), true) });
    }

    #[test]
    fn destroy_then_reallocate_bumps_generation() {
        let ems = EntityMetaStore::new();
        let (e1, _) = unsafe { ems.allocate(&cfg(), 0) };
        unsafe { ems.destroy(e1) };
        assert!(!unsafe { ems.is_alive(e1.index(), true) });

        let (e2, grown) = unsafe { ems.allocate(&cfg(), 0) };
        assert!(grown.is_none(), "batch had spare slots, no growth expected");
        assert_eq!(e2.index(), e1.index(), "freed slot is reused");
        assert!(e2.generation_value() > e1.generation_value());
    }

    #[test]
    fn commit_publishes_write_buffer_into_read() {
        let ems = EntityMetaStore::new();
        let (e1, _) = unsafe { ems.allocate(&cfg(), 0) };
        assert!(!unsafe { ems.is_alive(e1.index(), false) });
        unsafe { ems.commit() };
        assert!(unsafe { ems.is_alive(e1.index(), false) });
    }
}
