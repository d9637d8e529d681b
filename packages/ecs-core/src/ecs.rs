//! The `Ecs<R>` instance: owns the entity metadata store, one
//! `ComponentStore<T>` per registered type, the observer registry, and the
//! lock-event tracer. Every `Transaction` borrows one of these for its
//! whole lifetime.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::config::EcsConfig;
use crate::entity::Entity;
use crate::error::{EcsError, EcsResult};
use crate::lock::ComponentMutex;
use crate::observer::ObserverRegistry;
use crate::permissions::PermissionSet;
use crate::registry::{ComponentMeta, ErasedComponentStore, ForEachStore, Registry};
use crate::storage::entity_store::EntityMetaStore;
use crate::trace::Tracer;
use crate::transaction::{DynamicPermissions, DynamicTransaction, Transaction};

/// Ids start at 1 so a never-allocated [`Entity::invalid`] handle, whose
/// embedded id is 0, is rejected as foreign by every real instance without
/// a separate null check.
static NEXT_ECS_ID: AtomicU8 = AtomicU8::new(1);

thread_local! {
    static OPEN_TRANSACTIONS: RefCell<HashSet<u8>> = RefCell::new(HashSet::new());
}

pub(crate) fn thread_has_open_transaction(ecs_id: u8) -> bool {
    OPEN_TRANSACTIONS.with(|set| set.borrow().contains(&ecs_id))
}

pub(crate) fn mark_transaction_open(ecs_id: u8) {
    OPEN_TRANSACTIONS.with(|set| set.borrow_mut().insert(ecs_id));
}

pub(crate) fn mark_transaction_closed(ecs_id: u8) {
    OPEN_TRANSACTIONS.with(|set| {
        set.borrow_mut().remove(&ecs_id);
    });
}

/// A storage engine instance parameterized by a fixed, ordered list of
/// component types `R`. Clients typically declare one type alias per
/// world they need (e.g. `type World = Ecs<(Position, Velocity, Health)>`)
/// and share it behind an `Arc`.
pub struct Ecs<R: Registry>
where
    R::Storages: ForEachStore,
{
    id: u8,
    config: EcsConfig,
    ems: EntityMetaStore,
    storages: R::Storages,
    observers: ObserverRegistry,
    tracer: Tracer,
    next_txn_id: AtomicU64,
}

impl<R: Registry> Ecs<R>
where
    R::Storages: ForEachStore,
{
    pub fn new(config: EcsConfig) -> Self {
        let storages = R::new_storages(&config);
        // Global components are addressed at slot 0 without ever going
        // through `NewEntity`, so their storage must exist from
        // construction rather than waiting on the first entity allocation
        // to grow it.
        storages.for_each(&mut |idx, store| {
            if R::metas()[idx].is_global {
                store.grow_by(1);
            }
        });
        let tracer = Tracer::new(config.performance_tracing_max_events);
        Self {
            id: NEXT_ECS_ID.fetch_add(1, Ordering::Relaxed),
            config,
            ems: EntityMetaStore::new(),
            storages,
            observers: ObserverRegistry::new(),
            tracer,
            next_txn_id: AtomicU64::new(0),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(EcsConfig::default())
    }

    /// A value uniquely identifying this instance among every other `Ecs`
    /// created in the process, embedded in the high bits of every entity
    /// handle it produces.
    pub fn instance_id(&self) -> u8 {
        self.id
    }

    pub fn config(&self) -> &EcsConfig {
        &self.config
    }

    pub fn component_count(&self) -> usize {
        R::metas().len()
    }

    pub fn component_name(&self, index: usize) -> Option<&'static str> {
        R::metas().get(index).map(|m| m.name)
    }

    /// Sum of `size_of::<T>()` across every registered component type, the
    /// per-entity footprint of one fully-populated row.
    pub fn bytes_per_entity(&self) -> usize {
        R::metas().iter().map(|m| m.size_bytes).sum()
    }

    pub fn metas(&self) -> &'static [ComponentMeta] {
        R::metas()
    }

    pub fn start_tracing(&self) {
        self.tracer.start();
    }

    pub fn stop_tracing(&self) {
        self.tracer.stop();
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub(crate) fn ems(&self) -> &EntityMetaStore {
        &self.ems
    }

    pub(crate) fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    pub(crate) fn storages(&self) -> &R::Storages {
        &self.storages
    }

    pub(crate) fn stores(&self) -> Vec<&dyn ErasedComponentStore> {
        let mut out: Vec<&dyn ErasedComponentStore> = Vec::with_capacity(R::metas().len());
        self.storages.for_each(&mut |_idx, store| out.push(store));
        out
    }

    fn type_ids(&self) -> Vec<TypeId> {
        R::metas().iter().map(|m| m.type_id).collect()
    }

    /// Opens a new static-permission transaction. Blocks until the EMS lock
    /// (and every per-type lock the permission set requires) is acquired.
    /// Fails with [`EcsError::NestedTransaction`] if this thread already
    /// holds an open transaction against this instance.
    pub fn begin_transaction<P: PermissionSet>(&self) -> EcsResult<Transaction<'_, P, R>> {
        if thread_has_open_transaction(self.id) {
            return Err(EcsError::NestedTransaction);
        }
        let txn = Transaction::new(self, self.next_txn_id.fetch_add(1, Ordering::Relaxed));
        mark_transaction_open(self.id);
        Ok(txn)
    }

    /// Like [`Ecs::begin_transaction`] but fails instead of blocking if any
    /// required lock is currently held elsewhere.
    pub fn try_begin_transaction<P: PermissionSet>(&self) -> EcsResult<Option<Transaction<'_, P, R>>> {
        if thread_has_open_transaction(self.id) {
            return Err(EcsError::NestedTransaction);
        }
        match Transaction::try_new(self, self.next_txn_id.fetch_add(1, Ordering::Relaxed)) {
            Some(txn) => {
                mark_transaction_open(self.id);
                Ok(Some(txn))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn ems_mutex(&self) -> &ComponentMutex {
        self.ems.mutex()
    }

    pub(crate) fn all_type_ids(&self) -> Vec<TypeId> {
        self.type_ids()
    }

    /// An all-`false` [`DynamicPermissions`] sized for this instance's
    /// registered component count, for callers (chiefly the C ABI
    /// collaborator) building up a runtime permission set one type at a
    /// time.
    pub fn empty_dynamic_permissions(&self) -> DynamicPermissions {
        DynamicPermissions::empty(self.component_count())
    }

    /// Opens a transaction with a runtime-checked [`DynamicPermissions`]
    /// bitset instead of a compile-time [`PermissionSet`]. Blocks until
    /// every lock `perms` requires is acquired.
    pub fn begin_transaction_dynamic(&self, perms: &DynamicPermissions) -> EcsResult<DynamicTransaction<'_, R>> {
        if thread_has_open_transaction(self.id) {
            return Err(EcsError::NestedTransaction);
        }
        let txn = DynamicTransaction::new(self, perms);
        mark_transaction_open(self.id);
        Ok(txn)
    }

    /// Like [`Ecs::begin_transaction_dynamic`] but fails instead of
    /// blocking if any required lock is currently held elsewhere.
    pub fn try_begin_transaction_dynamic(
        &self,
        perms: &DynamicPermissions,
    ) -> EcsResult<Option<DynamicTransaction<'_, R>>> {
        if thread_has_open_transaction(self.id) {
            return Err(EcsError::NestedTransaction);
        }
        match DynamicTransaction::try_new(self, perms) {
            Some(txn) => {
                mark_transaction_open(self.id);
                Ok(Some(txn))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::permissions::{AddRemove, Read, Write};

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
    fn new_ecs_reports_registered_components() {
        let ecs = World::with_default_config();
        assert_eq!(ecs.component_count(), 2);
        assert_eq!(ecs.component_name(0), Some("Position"));
        assert_eq!(ecs.bytes_per_entity(), std::mem::size_of::<Position>() + std::mem::size_of::<Velocity>());
    }

    #[test]
    fn two_instances_get_distinct_ids() {
        let a = World::with_default_config();
        let b = World::with_default_config();
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn nested_transaction_on_same_thread_fails() {
        let ecs = World::with_default_config();
        let _outer = ecs.begin_transaction::<AddRemove>().unwrap();
        let inner = ecs.begin_transaction::<Read<Position>>();
        assert!(matches!(inner, Err(EcsError::NestedTransaction)));
    }

    #[test]
    fn create_set_and_read_round_trips() {
        let ecs = World::with_default_config();
        let entity = {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            let e = txn.new_entity().unwrap();
            txn.set(e, Position { x: 1.0, y: 2.0 }).unwrap();
            e
        };

        let txn = ecs.begin_transaction::<Read<Position>>().unwrap();
        assert_eq!(txn.get::<Position>(entity).unwrap(), &Position { x: 1.0, y: 2.0 });
    }

    #[test]
    fn write_permission_rejects_untouched_component() {
        let ecs = World::with_default_config();
        let entity = {
            let txn = ecs.begin_transaction::<AddRemove>().unwrap();
            txn.new_entity().unwrap()
        };
        let txn = ecs.begin_transaction::<Write<Velocity>>().unwrap();
        assert!(matches!(
            txn.set(entity, Velocity { dx: 1.0 }),
            Err(EcsError::MissingComponent { .. })
        ));
    }
}
