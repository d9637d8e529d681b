//! `Transaction<P, R>`: the live handle returned by `Ecs::begin_transaction`.
//!
//! Construction acquires the EMS lock plus, for every registered component
//! type, whichever of read/write/none the permission set `P` implies, in
//! declaration order. `Drop` releases everything in the reverse order,
//! running the per-type (and, for `AddRemove`, the EMS) commit in between
//! and dispatching observer events for whatever changed. A transaction
//! handle is meant to be opened, used, and dropped on a single thread; nothing
//! about it needs `Sync`.

use std::any::TypeId;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::component::Component;
use crate::ecs::{mark_transaction_closed, Ecs};
use crate::entity::Entity;
use crate::error::{EcsError, EcsResult};
use crate::observer::Observer;
use crate::permissions::{is_subset, PermissionSet};
use crate::registry::{ForEachStore, HasStore, Registry};
use crate::storage::component_store::ComponentStore;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LockMode {
    None,
    Read,
    Write,
}

fn lock_mode_for<P: PermissionSet>(type_id: TypeId) -> LockMode {
    if P::is_write_allowed(type_id) || P::ADD_REMOVE {
        LockMode::Write
    } else if P::is_read_allowed(type_id) {
        LockMode::Read
    } else {
        LockMode::None
    }
}

pub struct Transaction<'a, P: PermissionSet, R: Registry>
where
    R::Storages: ForEachStore,
{
    ecs: &'a Ecs<R>,
    held: Vec<LockMode>,
    pending_removed: Rc<RefCell<Vec<(usize, Entity)>>>,
    owns_locks: bool,
    _marker: PhantomData<P>,
}

impl<'a, P: PermissionSet, R: Registry> Transaction<'a, P, R>
where
    R::Storages: ForEachStore,
{
    /// Blocks until every lock this permission set requires is held.
    pub(crate) fn new(ecs: &'a Ecs<R>, _txn_id: u64) -> Self {
        let config = ecs.config();
        let tracer = ecs.tracer();
        if P::ADD_REMOVE {
            ecs.ems_mutex().write_lock(config, tracer, true);
        } else {
            ecs.ems_mutex().read_lock(config, tracer, true);
        }

        let stores = ecs.stores();
        let mut held = Vec::with_capacity(stores.len());
        for (store, meta) in stores.iter().zip(ecs.metas()) {
            let mode = lock_mode_for::<P>(meta.type_id);
            match mode {
                LockMode::Write => {
                    store.mutex().write_lock(config, tracer, true);
                }
                LockMode::Read => {
                    store.mutex().read_lock(config, tracer, true);
                }
                LockMode::None => {}
            }
            held.push(mode);
        }

        Self {
            ecs,
            held,
            pending_removed: Rc::new(RefCell::new(Vec::new())),
            owns_locks: true,
            _marker: PhantomData,
        }
    }

    /// Non-blocking variant of [`Transaction::new`]: rolls back and returns
    /// `None` if any required lock is unavailable right now.
    pub(crate) fn try_new(ecs: &'a Ecs<R>, _txn_id: u64) -> Option<Self> {
        let config = ecs.config();
        let tracer = ecs.tracer();
        let ems_ok = if P::ADD_REMOVE {
            ecs.ems_mutex().write_lock(config, tracer, false)
        } else {
            ecs.ems_mutex().read_lock(config, tracer, false)
        };
        if !ems_ok {
            return None;
        }

        let stores = ecs.stores();
        let mut held = Vec::with_capacity(stores.len());
        for (store, meta) in stores.iter().zip(ecs.metas()) {
            let mode = lock_mode_for::<P>(meta.type_id);
            let ok = match mode {
                LockMode::Write => store.mutex().write_lock(config, tracer, false),
                LockMode::Read => store.mutex().read_lock(config, tracer, false),
                LockMode::None => true,
            };
            if !ok {
                // Unwind everything acquired so far, in reverse order.
                for (acquired_store, acquired_mode) in stores.iter().zip(held.iter()).rev() {
                    match acquired_mode {
                        LockMode::Write => acquired_store.mutex().write_unlock(tracer),
                        LockMode::Read => acquired_store.mutex().read_unlock(tracer),
                        LockMode::None => {}
                    }
                }
                if P::ADD_REMOVE {
                    ecs.ems_mutex().write_unlock(tracer);
                } else {
                    ecs.ems_mutex().read_unlock(tracer);
                }
                return None;
            }
            held.push(mode);
        }

        Some(Self {
            ecs,
            held,
            pending_removed: Rc::new(RefCell::new(Vec::new())),
            owns_locks: true,
            _marker: PhantomData,
        })
    }

    /// A narrowed view of this transaction under a smaller permission set.
    /// Asserted once, here, against the registered component list; borrows
    /// the same underlying locks rather than acquiring anything new, so it
    /// is a relabeling, not a second transaction.
    pub fn subset<P2: PermissionSet>(&self) -> Transaction<'a, P2, R> {
        debug_assert!(
            is_subset::<P2, P>(&self.ecs.all_type_ids()),
            "subset permission set is not held by the parent transaction"
        );
        self.derive()
    }

    /// Like [`Transaction::subset`], but returns `None` instead of asserting
    /// when `P2` is not actually implied by `P`. `TryLock<AddRemove>` from a
    /// transaction that does not itself hold `AddRemove` always returns
    /// `None`, since `AddRemove` requires the EMS write lock this
    /// transaction never acquired.
    pub fn try_lock<P2: PermissionSet>(&self) -> Option<Transaction<'a, P2, R>> {
        if !is_subset::<P2, P>(&self.ecs.all_type_ids()) {
            return None;
        }
        Some(self.derive())
    }

    fn derive<P2: PermissionSet>(&self) -> Transaction<'a, P2, R> {
        Transaction {
            ecs: self.ecs,
            held: self.held.clone(),
            pending_removed: self.pending_removed.clone(),
            owns_locks: false,
            _marker: PhantomData,
        }
    }

    /// A view that always reads the pre-transaction buffer, even for
    /// component types this transaction holds `Write` or `AddRemove` on.
    pub fn read_only(&self) -> ReadOnlyView<'a, P, R> {
        ReadOnlyView { txn: self.derive() }
    }

    fn require_read<T: Component>(&self) -> EcsResult<()> {
        if P::is_read_allowed(TypeId::of::<T>()) {
            Ok(())
        } else {
            Err(EcsError::InsufficientPermissions)
        }
    }

    fn require_write<T: Component>(&self) -> EcsResult<()> {
        if P::is_write_allowed(TypeId::of::<T>()) {
            Ok(())
        } else {
            Err(EcsError::InsufficientPermissions)
        }
    }

    fn require_add_remove(&self) -> EcsResult<()> {
        if P::ADD_REMOVE {
            Ok(())
        } else {
            Err(EcsError::InsufficientPermissions)
        }
    }

    /// Whether this transaction holds `T`'s own `ComponentMutex` as writer,
    /// i.e. whether `Get`/`Has`/`Set`/`EntitiesWith` on `T` should act on its
    /// write buffer rather than its last-published read buffer. This is
    /// `AddRemove` OR plain `Write<T>` -- distinct from `P::ADD_REMOVE`,
    /// which only answers whether the *EMS* is held as writer.
    fn held_as_writer<T: Component>(&self) -> bool {
        P::ADD_REMOVE || P::is_write_allowed(TypeId::of::<T>())
    }

    fn component_index<T: Component>() -> usize {
        R::metas()
            .iter()
            .position(|m| m.type_id == TypeId::of::<T>())
            .expect("T is not a component registered with this Ecs instance")
    }

    /// Borrowed from `&self`, not `'a`: the returned reference must not
    /// outlive this transaction, since `Drop` releases the lock that makes
    /// reading it sound.
    fn store<T: Component>(&self) -> &ComponentStore<T>
    where
        R::Storages: HasStore<T>,
    {
        HasStore::<T>::store(self.ecs.storages())
    }

    fn entity_for_slot(&self, slot: u32, current: bool) -> Entity {
        let generation = unsafe { self.ecs.ems().generation(slot, current) };
        Entity::new(slot, generation, self.ecs.instance_id())
    }

    /// Validates `entity` against this ECS instance and the appropriate
    /// generation buffer, returning its slot index. `want_previous` forces
    /// the read (pre-transaction) generation even on an `AddRemove`
    /// transaction, for `Had`/`GetPrevious`. In checked mode (the default),
    /// also rejects an index past the end of that buffer with `OutOfBounds`;
    /// `EcsConfig::unchecked_mode` elides that check for maximum throughput
    /// in trusted deployments.
    fn validate(&self, entity: Entity, want_previous: bool) -> EcsResult<u32> {
        if entity.ecs_id() != self.ecs.instance_id() {
            return Err(EcsError::foreign_entity(entity));
        }
        let use_current = P::ADD_REMOVE && !want_previous;
        let index = entity.index();
        if !self.ecs.config().unchecked_mode {
            let capacity = unsafe { self.ecs.ems().capacity(use_current) };
            if index as usize >= capacity {
                return Err(EcsError::out_of_bounds(index as usize, capacity));
            }
        }
        let generation = unsafe { self.ecs.ems().generation(index, use_current) };
        if generation != entity.generation_value() {
            return Err(EcsError::stale_entity(entity));
        }
        Ok(index)
    }

    pub fn has<T: Component>(&self, entity: Entity) -> EcsResult<bool>
    where
        R::Storages: HasStore<T>,
    {
        self.require_read::<T>()?;
        let slot = self.validate(entity, false)?;
        let store = self.store::<T>();
        Ok(if self.held_as_writer::<T>() {
            store.write_has(slot)
        } else {
            store.read_has(slot)
        })
    }

    /// Presence as of the start of this transaction, ignoring anything
    /// written since.
    pub fn had<T: Component>(&self, entity: Entity) -> EcsResult<bool>
    where
        R::Storages: HasStore<T>,
    {
        self.require_read::<T>()?;
        let slot = self.validate(entity, true)?;
        Ok(self.store::<T>().read_has(slot))
    }

    /// Reads `T` on `entity`. Under `AddRemove`, a missing component is
    /// default-constructed and marked present rather than failing.
    pub fn get<T: Component>(&self, entity: Entity) -> EcsResult<&T>
    where
        R::Storages: HasStore<T>,
    {
        self.require_read::<T>()?;
        let slot = self.validate(entity, false)?;
        let store = self.store::<T>();
        let as_writer = self.held_as_writer::<T>();
        let present = if as_writer {
            store.write_has(slot)
        } else {
            store.read_has(slot)
        };
        if present {
            return Ok(unsafe {
                if as_writer {
                    store.write_slot_shared(slot)
                } else {
                    store.read_slot(slot)
                }
            });
        }
        if !P::ADD_REMOVE {
            return Err(EcsError::missing_component(entity, T::type_name()));
        }
        unsafe {
            *store.write_slot_mut(slot) = T::default();
            store.mark_present(slot);
        }
        Ok(unsafe { store.write_slot_shared(slot) })
    }

    /// Reads `T` as it was before this transaction began.
    pub fn get_previous<T: Component>(&self, entity: Entity) -> EcsResult<&T>
    where
        R::Storages: HasStore<T>,
    {
        self.require_read::<T>()?;
        let slot = self.validate(entity, true)?;
        let store = self.store::<T>();
        if !store.read_has(slot) {
            return Err(EcsError::missing_component(entity, T::type_name()));
        }
        Ok(unsafe { store.read_slot(slot) })
    }

    /// Writes `value` into `T` on `entity`. If `entity` does not currently
    /// have `T`, this requires `AddRemove` (plain `Write<T>` can only
    /// overwrite a component that is already present).
    pub fn set<T: Component>(&self, entity: Entity, value: T) -> EcsResult<()>
    where
        R::Storages: HasStore<T>,
    {
        self.require_write::<T>()?;
        let slot = self.validate(entity, false)?;
        let store = self.store::<T>();
        let already_present = if self.held_as_writer::<T>() {
            store.write_has(slot)
        } else {
            store.read_has(slot)
        };
        if !already_present && !P::ADD_REMOVE {
            return Err(EcsError::missing_component(entity, T::type_name()));
        }
        unsafe {
            *store.write_slot_mut(slot) = value;
            store.mark_present(slot);
        }
        Ok(())
    }

    /// Removes `T` from `entity`. Requires `AddRemove`.
    pub fn unset<T: Component>(&self, entity: Entity) -> EcsResult<()>
    where
        R::Storages: HasStore<T>,
    {
        self.require_add_remove()?;
        let slot = self.validate(entity, false)?;
        let store = self.store::<T>();
        if store.write_has(slot) {
            unsafe { store.unset(slot) };
            self.pending_removed
                .borrow_mut()
                .push((Self::component_index::<T>(), entity));
        }
        Ok(())
    }

    /// Every entity currently holding `T`, in the buffer this transaction's
    /// permission set reads from.
    pub fn entities_with<T: Component>(&self) -> EcsResult<Vec<Entity>>
    where
        R::Storages: HasStore<T>,
    {
        self.require_read::<T>()?;
        let store = self.store::<T>();
        Ok(store
            .entities_with(self.held_as_writer::<T>())
            .into_iter()
            .map(|slot| self.entity_for_slot(slot, P::ADD_REMOVE))
            .collect())
    }

    /// Allocates a fresh entity. Requires `AddRemove`.
    pub fn new_entity(&self) -> EcsResult<Entity> {
        self.require_add_remove()?;
        let (entity, grown) = unsafe { self.ecs.ems().allocate(self.ecs.config(), self.ecs.instance_id()) };
        if let Some(additional) = grown {
            for store in self.ecs.stores() {
                store.grow_by(additional);
            }
        }
        Ok(entity)
    }

    /// Destroys `entity`: every component it currently holds is recorded as
    /// removed (for observer dispatch), then its slot's generation is
    /// bumped so existing handles become stale. Requires `AddRemove`.
    pub fn destroy(&self, entity: Entity) -> EcsResult<()> {
        self.require_add_remove()?;
        let slot = self.validate(entity, false)?;
        for (idx, store) in self.ecs.stores().into_iter().enumerate() {
            if store.write_has(slot) {
                self.pending_removed.borrow_mut().push((idx, entity));
            }
            unsafe { store.clear_slot(slot) };
        }
        unsafe { self.ecs.ems().destroy(entity) };
        Ok(())
    }

    /// Registers a fresh observer for `T`. Requires `AddRemove`.
    pub fn register_observer<T: Component>(&self) -> EcsResult<Observer<T>> {
        self.require_add_remove()?;
        Ok(self.ecs.observers().register::<T>())
    }

    /// Stops delivery to a previously registered observer. Requires
    /// `AddRemove`.
    pub fn close_observer<T: Component>(&self, observer: &Observer<T>) -> EcsResult<()> {
        self.require_add_remove()?;
        observer.close();
        Ok(())
    }

    /// Whether `T` is present on the engine-wide singleton slot. Requires
    /// `Read<T>` or `Write<T>`. `T` must be a global component, addressed
    /// without an entity handle.
    pub fn has_global<T: Component>(&self) -> EcsResult<bool>
    where
        R::Storages: HasStore<T>,
    {
        debug_assert!(T::IS_GLOBAL, "has_global called on a non-global component");
        self.require_read::<T>()?;
        let store = self.store::<T>();
        Ok(if self.held_as_writer::<T>() {
            store.write_has(0)
        } else {
            store.read_has(0)
        })
    }

    /// Reads the singleton value of global component `T`. Under `AddRemove`,
    /// a missing global is default-constructed and marked present, exactly
    /// like `Get` on a per-entity component.
    pub fn get_global<T: Component>(&self) -> EcsResult<&T>
    where
        R::Storages: HasStore<T>,
    {
        debug_assert!(T::IS_GLOBAL, "get_global called on a non-global component");
        self.require_read::<T>()?;
        let store = self.store::<T>();
        let as_writer = self.held_as_writer::<T>();
        let present = if as_writer { store.write_has(0) } else { store.read_has(0) };
        if present {
            return Ok(unsafe {
                if as_writer {
                    store.write_slot_shared(0)
                } else {
                    store.read_slot(0)
                }
            });
        }
        if !P::ADD_REMOVE {
            return Err(EcsError::missing_global(T::type_name()));
        }
        unsafe {
            *store.write_slot_mut(0) = T::default();
            store.mark_present(0);
        }
        Ok(unsafe { store.write_slot_shared(0) })
    }

    /// Writes the singleton value of global component `T`. Missing-plus-no-
    /// `AddRemove` fails `MissingComponent`, mirroring `Set`.
    pub fn set_global<T: Component>(&self, value: T) -> EcsResult<()>
    where
        R::Storages: HasStore<T>,
    {
        debug_assert!(T::IS_GLOBAL, "set_global called on a non-global component");
        self.require_write::<T>()?;
        let store = self.store::<T>();
        let already_present = if self.held_as_writer::<T>() {
            store.write_has(0)
        } else {
            store.read_has(0)
        };
        if !already_present && !P::ADD_REMOVE {
            return Err(EcsError::missing_global(T::type_name()));
        }
        unsafe {
            *store.write_slot_mut(0) = value;
            store.mark_present(0);
        }
        Ok(())
    }

    /// Clears global component `T`. Requires `AddRemove`.
    pub fn unset_global<T: Component>(&self) -> EcsResult<()>
    where
        R::Storages: HasStore<T>,
    {
        debug_assert!(T::IS_GLOBAL, "unset_global called on a non-global component");
        self.require_add_remove()?;
        let store = self.store::<T>();
        if store.write_has(0) {
            unsafe { store.unset(0) };
            self.pending_removed
                .borrow_mut()
                .push((Self::component_index::<T>(), Entity::invalid()));
        }
        Ok(())
    }
}

impl<'a, P: PermissionSet, R: Registry> Drop for Transaction<'a, P, R>
where
    R::Storages: ForEachStore,
{
    fn drop(&mut self) {
        if !self.owns_locks {
            return;
        }
        commit_and_release(self.ecs, &self.held, P::ADD_REMOVE, &self.pending_removed);
        mark_transaction_closed(self.ecs.instance_id());
    }
}

/// Shared commit/release path for both a static [`Transaction`] and a
/// [`DynamicTransaction`]: releases every held lock in reverse declaration
/// order, committing each type that was held as writer and actually
/// written to, then does the same for the EMS and dispatches whatever
/// observer events the commit produced.
fn commit_and_release<R: Registry>(
    ecs: &Ecs<R>,
    held: &[LockMode],
    add_remove: bool,
    pending_removed: &Rc<RefCell<Vec<(usize, Entity)>>>,
) where
    R::Storages: ForEachStore,
{
    let config = ecs.config();
    let tracer = ecs.tracer();
    let stores = ecs.stores();

    for (idx, store) in stores.iter().enumerate().rev() {
        match held[idx] {
            LockMode::Write => {
                if store.has_write_access() {
                    // Snapshot read-buffer presence before `commit`
                    // overwrites it in place, so dirty slots can be told
                    // apart as newly-present (`Added`) vs already-present
                    // (`Modified`).
                    let before_present: std::collections::HashSet<u32> =
                        store.read_valid_items().into_iter().collect();
                    store.mutex().commit_lock(config, tracer);
                    let dirty = unsafe { store.commit(add_remove) };
                    store.mutex().commit_unlock(tracer);
                    store.mutex().write_unlock(tracer);
                    if let Some(slots) = dirty {
                        dispatch_added_or_modified(ecs, add_remove, &before_present, idx, &slots);
                    }
                } else {
                    store.mutex().write_unlock(tracer);
                }
            }
            LockMode::Read => store.mutex().read_unlock(tracer),
            LockMode::None => {}
        }
    }

    if add_remove {
        if ecs.ems().has_write_access() {
            ecs.ems_mutex().commit_lock(config, tracer);
            unsafe { ecs.ems().commit() };
            ecs.ems_mutex().commit_unlock(tracer);
            ecs.ems_mutex().write_unlock(tracer);
        } else {
            ecs.ems_mutex().write_unlock(tracer);
        }
        dispatch_removed(ecs, pending_removed);
    } else {
        ecs.ems_mutex().read_unlock(tracer);
    }
}

/// Slot `0` is the reserved global-component slot and never corresponds
/// to a real entity handle -- `AddRemove`'s own entity creation
/// never hands it out (see `EntityMetaStore::allocate`) -- so dirty slot 0
/// is reported under [`Entity::invalid`] rather than a recomputed handle.
fn dispatch_added_or_modified<R: Registry>(
    ecs: &Ecs<R>,
    add_remove: bool,
    before_present: &std::collections::HashSet<u32>,
    component_index: usize,
    slots: &[u32],
) where
    R::Storages: ForEachStore,
{
    let type_id = ecs.metas()[component_index].type_id;
    for &slot in slots {
        let entity = if slot == 0 {
            Entity::invalid()
        } else {
            let generation = unsafe { ecs.ems().generation(slot, add_remove) };
            Entity::new(slot, generation, ecs.instance_id())
        };
        if before_present.contains(&slot) {
            ecs.observers().dispatch_modified_by_id(type_id, entity);
        } else {
            ecs.observers().dispatch_added_by_id(type_id, entity);
        }
    }
}

fn dispatch_removed<R: Registry>(ecs: &Ecs<R>, pending_removed: &Rc<RefCell<Vec<(usize, Entity)>>>)
where
    R::Storages: ForEachStore,
{
    for (component_index, entity) in pending_removed.borrow_mut().drain(..) {
        let type_id = ecs.metas()[component_index].type_id;
        ecs.observers().dispatch_removed_by_id(type_id, entity);
    }
}

/// A runtime (rather than type-level) permission set, for a foreign-
/// interface collaborator that cannot express permissions as Rust types:
/// `1 + n` read bits and `1 + n` write bits, index `0` of the write side
/// standing for `AddRemove`. A C ABI boundary can pack this same shape as
/// a pair of bitsets and send them across as plain integers.
#[derive(Debug, Clone)]
pub struct DynamicPermissions {
    add_remove: bool,
    read: Vec<bool>,
    write: Vec<bool>,
}

impl DynamicPermissions {
    /// No access at all to `component_count` registered types.
    pub fn empty(component_count: usize) -> Self {
        Self {
            add_remove: false,
            read: vec![false; component_count],
            write: vec![false; component_count],
        }
    }

    /// `AddRemove`: implies write (and therefore read) access to every type.
    pub fn with_add_remove(mut self) -> Self {
        self.add_remove = true;
        self.read.iter_mut().for_each(|r| *r = true);
        self.write.iter_mut().for_each(|w| *w = true);
        self
    }

    pub fn with_read(mut self, component_index: usize) -> Self {
        self.read[component_index] = true;
        self
    }

    pub fn with_write(mut self, component_index: usize) -> Self {
        self.read[component_index] = true;
        self.write[component_index] = true;
        self
    }

    pub fn add_remove_allowed(&self) -> bool {
        self.add_remove
    }

    pub fn read_allowed(&self, component_index: usize) -> bool {
        self.read[component_index]
    }

    pub fn write_allowed(&self, component_index: usize) -> bool {
        self.write[component_index]
    }
}

/// A transaction opened with a [`DynamicPermissions`] bitset rather than a
/// compile-time [`PermissionSet`]. Used by collaborators -- chiefly a C
/// ABI boundary -- that cannot express permissions as
/// Rust generic types. Narrows to a static, compile-time-checked
/// [`Transaction`] via [`DynamicTransaction::try_lock`]; there is no other
/// way to read or write component data through it.
pub struct DynamicTransaction<'a, R: Registry>
where
    R::Storages: ForEachStore,
{
    ecs: &'a Ecs<R>,
    held: Vec<LockMode>,
    pending_removed: Rc<RefCell<Vec<(usize, Entity)>>>,
    add_remove_held: bool,
}

impl<'a, R: Registry> DynamicTransaction<'a, R>
where
    R::Storages: ForEachStore,
{
    pub(crate) fn new(ecs: &'a Ecs<R>, perms: &DynamicPermissions) -> Self {
        let config = ecs.config();
        let tracer = ecs.tracer();
        if perms.add_remove_allowed() {
            ecs.ems_mutex().write_lock(config, tracer, true);
        } else {
            ecs.ems_mutex().read_lock(config, tracer, true);
        }

        let stores = ecs.stores();
        let mut held = Vec::with_capacity(stores.len());
        for store in stores.iter() {
            let idx = held.len();
            let mode = if perms.write_allowed(idx) || perms.add_remove_allowed() {
                store.mutex().write_lock(config, tracer, true);
                LockMode::Write
            } else if perms.read_allowed(idx) {
                store.mutex().read_lock(config, tracer, true);
                LockMode::Read
            } else {
                LockMode::None
            };
            held.push(mode);
        }

        Self {
            ecs,
            held,
            pending_removed: Rc::new(RefCell::new(Vec::new())),
            add_remove_held: perms.add_remove_allowed(),
        }
    }

    pub(crate) fn try_new(ecs: &'a Ecs<R>, perms: &DynamicPermissions) -> Option<Self> {
        let config = ecs.config();
        let tracer = ecs.tracer();
        let ems_ok = if perms.add_remove_allowed() {
            ecs.ems_mutex().write_lock(config, tracer, false)
        } else {
            ecs.ems_mutex().read_lock(config, tracer, false)
        };
        if !ems_ok {
            return None;
        }

        let stores = ecs.stores();
        let mut held = Vec::with_capacity(stores.len());
        for store in stores.iter() {
            let idx = held.len();
            let (ok, mode) = if perms.write_allowed(idx) || perms.add_remove_allowed() {
                (store.mutex().write_lock(config, tracer, false), LockMode::Write)
            } else if perms.read_allowed(idx) {
                (store.mutex().read_lock(config, tracer, false), LockMode::Read)
            } else {
                (true, LockMode::None)
            };
            if !ok {
                for (acquired_store, acquired_mode) in stores.iter().zip(held.iter()).rev() {
                    match acquired_mode {
                        LockMode::Write => acquired_store.mutex().write_unlock(tracer),
                        LockMode::Read => acquired_store.mutex().read_unlock(tracer),
                        LockMode::None => {}
                    }
                }
                if perms.add_remove_allowed() {
                    ecs.ems_mutex().write_unlock(tracer);
                } else {
                    ecs.ems_mutex().read_unlock(tracer);
                }
                return None;
            }
            held.push(mode);
        }

        Some(Self {
            ecs,
            held,
            pending_removed: Rc::new(RefCell::new(Vec::new())),
            add_remove_held: perms.add_remove_allowed(),
        })
    }

    /// Narrows to a compile-time-checked [`Transaction<P, R>`] if every
    /// lock `P` requires is actually held by this dynamic transaction;
    /// otherwise `None`. The returned handle borrows the same locks rather
    /// than acquiring new ones, exactly like
    /// [`Transaction::subset`].
    pub fn try_lock<P: PermissionSet>(&self) -> Option<Transaction<'a, P, R>> {
        if P::ADD_REMOVE && !self.add_remove_held {
            return None;
        }
        for (idx, meta) in self.ecs.metas().iter().enumerate() {
            let type_id = meta.type_id;
            let mode = self.held[idx];
            if P::is_write_allowed(type_id) && mode != LockMode::Write {
                return None;
            }
            if P::is_read_allowed(type_id) && mode == LockMode::None {
                return None;
            }
        }
        Some(Transaction {
            ecs: self.ecs,
            held: self.held.clone(),
            pending_removed: self.pending_removed.clone(),
            owns_locks: false,
            _marker: PhantomData,
        })
    }

    pub fn add_remove_held(&self) -> bool {
        self.add_remove_held
    }

    pub fn read_held(&self, component_index: usize) -> bool {
        self.held[component_index] != LockMode::None
    }

    pub fn write_held(&self, component_index: usize) -> bool {
        self.held[component_index] == LockMode::Write
    }
}

impl<'a, R: Registry> Drop for DynamicTransaction<'a, R>
where
    R::Storages: ForEachStore,
{
    fn drop(&mut self) {
        commit_and_release(self.ecs, &self.held, self.add_remove_held, &self.pending_removed);
        mark_transaction_closed(self.ecs.instance_id());
    }
}

/// A read-only narrowing of a transaction, returned by
/// [`Transaction::read_only`]. Always reads the pre-transaction buffer, even
/// for component types the parent transaction holds `Write`/`AddRemove` on.
pub struct ReadOnlyView<'a, P: PermissionSet, R: Registry>
where
    R::Storages: ForEachStore,
{
    txn: Transaction<'a, P, R>,
}

impl<'a, P: PermissionSet, R: Registry> ReadOnlyView<'a, P, R>
where
    R::Storages: ForEachStore,
{
    pub fn has<T: Component>(&self, entity: Entity) -> EcsResult<bool>
    where
        R::Storages: HasStore<T>,
    {
        self.txn.require_read::<T>()?;
        let slot = self.txn.validate(entity, true)?;
        Ok(self.txn.store::<T>().read_has(slot))
    }

    pub fn get<T: Component>(&self, entity: Entity) -> EcsResult<&T>
    where
        R::Storages: HasStore<T>,
    {
        self.txn.require_read::<T>()?;
        let slot = self.txn.validate(entity, true)?;
        let store = self.txn.store::<T>();
        if !store.read_has(slot) {
            return Err(EcsError::missing_component(entity, T::type_name()));
        }
        Ok(unsafe { store.read_slot(slot) })
    }

    pub fn entities_with<T: Component>(&self) -> EcsResult<Vec<Entity>>
    where
        R::Storages: HasStore<T>,
    {
        self.txn.require_read::<T>()?;
        let store = self.txn.store::<T>();
        Ok(store
            .entities_with(false)
            .into_iter()
            .map(|slot| self.txn.entity_for_slot(slot, false))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::Ecs;
    use crate::permissions::{AddRemove, Read, ReadAll, Write};

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }
    impl Component for Position {}

    #[derive(Default, Clone, Debug, PartialEq)]
    struct Velocity {
        dx: f32,
    }
    impl Component for Velocity {}

    type World = Ecs<(Position, Velocity)>;

    #[test]
    fn new_entity_then_get_sees_default_under_add_remove() {
        let ecs = World::with_default_config();
        let txn = ecs.begin_transaction::<AddRemove>().unwrap();
        let e = txn.new_entity().unwrap();
        assert_eq!(*txn.get::<Position>(e).unwrap(), Position::default());
        assert!(txn.has::<Position>(e).unwrap());
    }

    #[test]
    fn plain_read_of_missing_component_fails() {
        let ecs = World::with_default_config();
        let e = {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            txn.new_entity().unwrap()
        };
        let txn = ecs.begin_transaction::<Read<Position>>().unwrap();
        assert!(matches!(
            txn.get::<Position>(e),
            Err(EcsError::MissingComponent { .. })
        ));
    }

    #[test]
    fn destroy_then_reuse_makes_old_handle_stale() {
        let ecs = World::with_default_config();
        let e = {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            let e = txn.new_entity().unwrap();
            txn.destroy(e).unwrap();
            e
        };
        let txn = ecs.begin_transaction::<ReadAll>().unwrap();
        assert!(matches!(txn.has::<Position>(e), Err(EcsError::StaleEntity { .. })));
    }

    #[test]
    fn foreign_entity_from_another_instance_is_rejected() {
        let a = World::with_default_config();
        let b = World::with_default_config();
        let e = {
            let txn = a.begin_transaction::<AddRemove>().unwrap();
            txn.new_entity().unwrap()
        };
        let txn = b.begin_transaction::<ReadAll>().unwrap();
        assert!(matches!(txn.has::<Position>(e), Err(EcsError::ForeignEntity { .. })));
    }

    #[test]
    fn index_past_allocated_slots_is_out_of_bounds_in_checked_mode() {
        let ecs = World::with_default_config();
        let e = {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            txn.new_entity().unwrap()
        };
        let far = Entity::new(u32::MAX, e.generation_value(), e.ecs_id());
        let txn = ecs.begin_transaction::<ReadAll>().unwrap();
        assert!(matches!(txn.has::<Position>(far), Err(EcsError::OutOfBounds { .. })));
    }

    #[test]
    fn unchecked_mode_elides_the_bounds_check() {
        let mut config = crate::config::EcsConfig::default();
        config.unchecked_mode = true;
        let ecs = World::new(config);
        let e = {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            txn.new_entity().unwrap()
        };
        let far = Entity::new(u32::MAX, e.generation_value(), e.ecs_id());
        let txn = ecs.begin_transaction::<ReadAll>().unwrap();
        // No bounds check at all in unchecked mode; the generation lookup
        // itself still falls back to 0 for an unallocated index, so the
        // handle is simply stale rather than out-of-bounds.
        assert!(matches!(txn.has::<Position>(far), Err(EcsError::StaleEntity { .. })));
    }

    #[test]
    fn subset_still_sees_same_data() {
        let ecs = World::with_default_config();
        let e = {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            let e = txn.new_entity().unwrap();
            txn.set(e, Position { x: 3.0, y: 4.0 }).unwrap();
            e
        };
        let txn = ecs.begin_transaction::<(Read<Position>, Write<Velocity>)>().unwrap();
        let narrowed = txn.subset::<Read<Position>>();
        assert_eq!(*narrowed.get::<Position>(e).unwrap(), Position { x: 3.0, y: 4.0 });
    }

    #[test]
    fn try_lock_add_remove_from_plain_write_is_none() {
        let ecs = World::with_default_config();
        let txn = ecs.begin_transaction::<Write<Position>>().unwrap();
        assert!(txn.try_lock::<AddRemove>().is_none());
    }

    #[derive(Default, Clone, Debug, PartialEq)]
    struct GameClock {
        tick: u64,
    }
    impl Component for GameClock {
        const IS_GLOBAL: bool = true;
    }

    type GlobalWorld = Ecs<(Position, GameClock)>;

    #[test]
    fn global_component_readable_without_any_entity() {
        let ecs = GlobalWorld::with_default_config();
        let txn = ecs.begin_transaction::<Read<GameClock>>().unwrap();
        assert!(!txn.has_global::<GameClock>().unwrap());
        assert!(matches!(
            txn.get_global::<GameClock>(),
            Err(EcsError::MissingComponent { .. })
        ));
    }

    #[test]
    fn global_component_set_then_read_round_trips() {
        let ecs = GlobalWorld::with_default_config();
        {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            txn.set_global(GameClock { tick: 1 }).unwrap();
        }
        let txn = ecs.begin_transaction::<Read<GameClock>>().unwrap();
        assert!(txn.has_global::<GameClock>().unwrap());
        assert_eq!(*txn.get_global::<GameClock>().unwrap(), GameClock { tick: 1 });
    }

    #[test]
    fn global_component_unset_clears_presence() {
        let ecs = GlobalWorld::with_default_config();
        {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            txn.set_global(GameClock { tick: 7 }).unwrap();
        }
        {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            txn.unset_global::<GameClock>().unwrap();
        }
        let txn = ecs.begin_transaction::<Read<GameClock>>().unwrap();
        assert!(!txn.has_global::<GameClock>().unwrap());
    }

    #[test]
    fn dynamic_transaction_narrows_to_held_static_permissions() {
        let ecs = World::with_default_config();
        let perms = ecs.empty_dynamic_permissions().with_read(0);
        let dyn_txn = ecs.begin_transaction_dynamic(&perms).unwrap();
        assert!(dyn_txn.read_held(0));
        assert!(!dyn_txn.write_held(0));
        assert!(dyn_txn.try_lock::<Read<Position>>().is_some());
        assert!(dyn_txn.try_lock::<Write<Position>>().is_none());
        assert!(dyn_txn.try_lock::<AddRemove>().is_none());
    }

    #[test]
    fn dynamic_transaction_with_add_remove_narrows_to_everything() {
        let ecs = World::with_default_config();
        let perms = ecs.empty_dynamic_permissions().with_add_remove();
        let dyn_txn = ecs.begin_transaction_dynamic(&perms).unwrap();
        assert!(dyn_txn.add_remove_held());
        let txn = dyn_txn.try_lock::<AddRemove>().unwrap();
        let e = txn.new_entity().unwrap();
        txn.set(e, Position { x: 1.0, y: 1.0 }).unwrap();
        assert!(txn.has::<Position>(e).unwrap());
    }
}
