//! The fixed, ordered component-type list an [`crate::ecs::Ecs`] instance is
//! parameterized by.
//!
//! One storage slot is instantiated per type as a tuple of concrete
//! `Component` types plus a small set of trait impls, generated once per
//! tuple arity by the macro at the bottom of this file, that let a
//! [`crate::transaction::Transaction`] borrow the one [`ComponentStore<T>`]
//! it needs out of the tuple without any dynamic dispatch.

use std::any::TypeId;

use crate::component::Component;
use crate::config::EcsConfig;
use crate::lock::ComponentMutex;
use crate::storage::component_store::ComponentStore;

/// Metadata about one registered component type, used for diagnostics
/// (`Ecs::component_name`, `Ecs::bytes_per_entity`).
#[derive(Debug, Clone, Copy)]
pub struct ComponentMeta {
    pub type_id: TypeId,
    pub name: &'static str,
    pub size_bytes: usize,
    pub is_global: bool,
}

/// A fixed, ordered list of component types. Implemented for tuples
/// `(T0, ..., Tn)` of up to eight [`Component`] types by the macro below;
/// larger registries can be nested (`((T0,...,T7), (T8,...))`).
pub trait Registry: Send + Sync + 'static {
    /// Owns one [`ComponentStore<Ti>`] per declared type, in declaration
    /// order. The declaration order is the order component mutexes are
    /// acquired in and released in reverse.
    type Storages: Send + Sync;

    fn new_storages(config: &EcsConfig) -> Self::Storages;
    fn metas() -> &'static [ComponentMeta];
}

/// Implemented for `Self::Storages` by a `Registry`'s own storages tuple:
/// lets a [`crate::transaction::Transaction`] fetch the `ComponentStore<T>`
/// belonging to a specific registered type `T` out of the tuple, and lets
/// the commit/allocation paths iterate every store generically.
pub trait HasStore<T: Component>: Send + Sync {
    fn store(&self) -> &ComponentStore<T>;
}

/// Applies a closure to every component store in a storages tuple, in
/// declaration order, passing each store's declaration index alongside it.
/// Used by `NewEntity`'s batch growth and by a transaction's commit/release
/// pass, which must drive each store's lock and commit by index without
/// knowing its component type.
pub trait ForEachStore: Send + Sync {
    fn for_each(&self, f: &mut dyn FnMut(usize, &dyn ErasedComponentStore));
}

/// Type-erased view of a [`ComponentStore<T>`] sufficient for the handful
/// of operations that must run over *every* store without knowing `T`:
/// growing on `NewEntity`'s batch allocation, reporting bytes-per-entity,
/// and driving a transaction's own lock/commit/release sequence.
pub trait ErasedComponentStore: Send + Sync {
    fn grow_by(&self, additional: usize);
    fn size_bytes(&self) -> usize;
    fn type_name(&self) -> &'static str;
    fn mutex(&self) -> &ComponentMutex;
    fn has_write_access(&self) -> bool;

    /// Current (write-buffer) presence at `slot`, used by `Destroy` to
    /// figure out which component types to report as `Removed` without
    /// knowing any concrete `T`.
    fn write_has(&self, slot: u32) -> bool;

    /// Slots present in the read (pre-commit) buffer, used to classify a
    /// freshly committed slot as `Added` or `Modified` without knowing any
    /// concrete `T`. Must be read before `commit` runs, since `commit`
    /// overwrites the read buffer in place.
    fn read_valid_items(&self) -> Vec<u32>;

    /// # Safety
    /// Caller must hold the commit lock on this store.
    unsafe fn commit(&self, add_remove: bool) -> Option<Vec<u32>>;

    /// # Safety
    /// Caller must hold the write lock on this store.
    unsafe fn clear_slot(&self, slot: u32);
}

impl<T: Component> ErasedComponentStore for ComponentStore<T> {
    fn grow_by(&self, additional: usize) {
        ComponentStore::grow_by(self, additional);
    }
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<T>()
    }
    fn type_name(&self) -> &'static str {
        T::type_name()
    }
    fn mutex(&self) -> &ComponentMutex {
        ComponentStore::mutex(self)
    }
    fn has_write_access(&self) -> bool {
        ComponentStore::has_write_access(self)
    }
    fn write_has(&self, slot: u32) -> bool {
        ComponentStore::write_has(self, slot)
    }
    fn read_valid_items(&self) -> Vec<u32> {
        ComponentStore::read_valid_items(self)
    }
    unsafe fn commit(&self, add_remove: bool) -> Option<Vec<u32>> {
        ComponentStore::commit(self, add_remove)
    }
    unsafe fn clear_slot(&self, slot: u32) {
        ComponentStore::unset(self, slot)
    }
}

macro_rules! impl_registry_tuple {
    ($($T:ident => $idx:tt),+) => {
        impl<$($T: Component),+> Registry for ($($T,)+) {
            type Storages = ($(ComponentStore<$T>,)+);

            fn new_storages(config: &EcsConfig) -> Self::Storages {
                ($(ComponentStore::<$T>::new(stringify!($T), config),)+)
            }

            fn metas() -> &'static [ComponentMeta] {
                static METAS: std::sync::OnceLock<Vec<ComponentMeta>> = std::sync::OnceLock::new();
                METAS.get_or_init(|| vec![
                    $(ComponentMeta {
                        type_id: TypeId::of::<$T>(),
                        name: $T::type_name(),
                        size_bytes: std::mem::size_of::<$T>(),
                        is_global: $T::IS_GLOBAL,
                    }),+
                ])
            }
        }

        impl<$($T: Component),+> ForEachStore for ($(ComponentStore<$T>,)+) {
            fn for_each(&self, f: &mut dyn FnMut(usize, &dyn ErasedComponentStore)) {
                $(f($idx, &self.$idx);)+
            }
        }

        impl_registry_tuple!(@has_store [$($T),+]; $($T => $idx),+);
    };

    (@has_store [$($All:ident),+]; $($T:ident => $idx:tt),+) => {
        $(
            impl<$($All: Component),+> HasStore<$T> for ($(ComponentStore<$All>,)+) {
                fn store(&self) -> &ComponentStore<$T> {
                    &self.$idx
                }
            }
        )+
    };
}

impl_registry_tuple!(T0 => 0);
impl_registry_tuple!(T0 => 0, T1 => 1);
impl_registry_tuple!(T0 => 0, T1 => 1, T2 => 2);
impl_registry_tuple!(T0 => 0, T1 => 1, T2 => 2, T3 => 3);
impl_registry_tuple!(T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4);
impl_registry_tuple!(T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4, T5 => 5);
impl_registry_tuple!(T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4, T5 => 5, T6 => 6);
impl_registry_tuple!(T0 => 0, T1 => 1, T2 => 2, T3 => 3, T4 => 4, T5 => 5, T6 => 6, T7 => 7);
