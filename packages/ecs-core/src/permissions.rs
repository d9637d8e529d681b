//! The permission algebra: compile-time-checked marker types describing what
//! a transaction may read, write, and whether it may create/destroy entities
//! or add/remove components.
//!
//! Permission sets are ordinary Rust types (`Read<Position>`,
//! `(Read<Position>, Write<Velocity>)`, `AddRemove`, ...), not values. The
//! access predicates are associated functions on the [`PermissionSet`]
//! trait; for a fixed `(P, T)` pair they monomorphize to a single code
//! path, so the compiler folds away everything but the branches that can
//! actually be taken -- there is no runtime permission value to mismatch.

use std::any::TypeId;
use std::marker::PhantomData;

use crate::component::Component;

/// A compile-time permission set. Implemented by the primitives below and,
/// via the tuple impls at the bottom of this module, by combinations of
/// them.
pub trait PermissionSet: Send + Sync + 'static {
    /// Implies [`PermissionSet::is_write_allowed`] for every registered
    /// type, plus entity creation/destruction and component add/remove.
    const ADD_REMOVE: bool = false;

    /// Whether `AddRemove` is present only as an [`Optional`] sub-permission.
    const ADD_REMOVE_OPTIONAL: bool = false;

    /// Read access to the component identified by `type_id`.
    fn is_read_allowed(type_id: TypeId) -> bool;

    /// Write access to the component identified by `type_id`.
    fn is_write_allowed(type_id: TypeId) -> bool;

    /// Whether read access to `type_id`, if present at all, is wrapped in
    /// [`Optional`].
    fn is_read_optional(type_id: TypeId) -> bool {
        let _ = type_id;
        false
    }

    /// Whether write access to `type_id`, if present at all, is wrapped in
    /// [`Optional`].
    fn is_write_optional(type_id: TypeId) -> bool {
        let _ = type_id;
        false
    }
}

/// Read access to component type `T`.
pub struct Read<T>(PhantomData<fn() -> T>);

impl<T: Component> PermissionSet for Read<T> {
    fn is_read_allowed(type_id: TypeId) -> bool {
        type_id == TypeId::of::<T>()
    }
    fn is_write_allowed(_type_id: TypeId) -> bool {
        false
    }
}

/// Read and write access to component type `T`.
pub struct Write<T>(PhantomData<fn() -> T>);

impl<T: Component> PermissionSet for Write<T> {
    fn is_read_allowed(type_id: TypeId) -> bool {
        type_id == TypeId::of::<T>()
    }
    fn is_write_allowed(type_id: TypeId) -> bool {
        type_id == TypeId::of::<T>()
    }
}

/// Read access to every component type registered with the owning
/// [`crate::ecs::Ecs`] instance.
pub struct ReadAll;

impl PermissionSet for ReadAll {
    fn is_read_allowed(_type_id: TypeId) -> bool {
        true
    }
    fn is_write_allowed(_type_id: TypeId) -> bool {
        false
    }
}

/// Read and write access to every registered component type. Does not by
/// itself allow creating/destroying entities or adding/removing
/// components -- see [`AddRemove`].
pub struct WriteAll;

impl PermissionSet for WriteAll {
    fn is_read_allowed(_type_id: TypeId) -> bool {
        true
    }
    fn is_write_allowed(_type_id: TypeId) -> bool {
        true
    }
}

/// Implies [`WriteAll`] and additionally allows `NewEntity`, `Destroy`,
/// `Unset`, and registering/closing observers.
pub struct AddRemove;

impl PermissionSet for AddRemove {
    const ADD_REMOVE: bool = true;
    fn is_read_allowed(_type_id: TypeId) -> bool {
        true
    }
    fn is_write_allowed(_type_id: TypeId) -> bool {
        true
    }
}

/// Wraps a sub-permission that may or may not hold at runtime. Used on the
/// dynamic (runtime-bitset) transaction path, where a requested permission
/// might not be grantable (e.g. two dynamic transactions racing for the
/// same write lock) without failing the whole transaction.
pub struct Optional<P>(PhantomData<fn() -> P>);

impl<P: PermissionSet> PermissionSet for Optional<P> {
    const ADD_REMOVE: bool = P::ADD_REMOVE;
    const ADD_REMOVE_OPTIONAL: bool = P::ADD_REMOVE;

    fn is_read_allowed(type_id: TypeId) -> bool {
        P::is_read_allowed(type_id)
    }
    fn is_write_allowed(type_id: TypeId) -> bool {
        P::is_write_allowed(type_id)
    }
    fn is_read_optional(type_id: TypeId) -> bool {
        P::is_read_allowed(type_id)
    }
    fn is_write_optional(type_id: TypeId) -> bool {
        P::is_write_allowed(type_id)
    }
}

/// The empty permission set: no component access, no add/remove. A
/// transaction opened with `()` still holds the EMS read lock for its
/// duration.
impl PermissionSet for () {
    fn is_read_allowed(_type_id: TypeId) -> bool {
        false
    }
    fn is_write_allowed(_type_id: TypeId) -> bool {
        false
    }
}

macro_rules! impl_permission_tuple {
    ($($P:ident),+) => {
        impl<$($P: PermissionSet),+> PermissionSet for ($($P,)+) {
            const ADD_REMOVE: bool = { let mut any = false; $(any = any || $P::ADD_REMOVE;)+ any };
            const ADD_REMOVE_OPTIONAL: bool = {
                let mut any_optional = false;
                let mut any_required = false;
                $(
                    if $P::ADD_REMOVE {
                        if $P::ADD_REMOVE_OPTIONAL {
                            any_optional = true;
                        } else {
                            any_required = true;
                        }
                    }
                )+
                any_optional && !any_required
            };

            #[allow(unused_variables, unused_mut)]
            fn is_read_allowed(type_id: TypeId) -> bool {
                let mut any = false;
                $(any = any || $P::is_read_allowed(type_id);)+
                any
            }

            #[allow(unused_variables, unused_mut)]
            fn is_write_allowed(type_id: TypeId) -> bool {
                let mut any = false;
                $(any = any || $P::is_write_allowed(type_id);)+
                any
            }

            #[allow(unused_variables)]
            fn is_read_optional(type_id: TypeId) -> bool {
                let mut any_optional = false;
                let mut any_required = false;
                $(
                    if $P::is_read_allowed(type_id) {
                        if $P::is_read_optional(type_id) {
                            any_optional = true;
                        } else {
                            any_required = true;
                        }
                    }
                )+
                any_optional && !any_required
            }

            #[allow(unused_variables)]
            fn is_write_optional(type_id: TypeId) -> bool {
                let mut any_optional = false;
                let mut any_required = false;
                $(
                    if $P::is_write_allowed(type_id) {
                        if $P::is_write_optional(type_id) {
                            any_optional = true;
                        } else {
                            any_required = true;
                        }
                    }
                )+
                any_optional && !any_required
            }
        }
    };
}

impl_permission_tuple!(P0);
impl_permission_tuple!(P0, P1);
impl_permission_tuple!(P0, P1, P2);
impl_permission_tuple!(P0, P1, P2, P3);
impl_permission_tuple!(P0, P1, P2, P3, P4);
impl_permission_tuple!(P0, P1, P2, P3, P4, P5);
impl_permission_tuple!(P0, P1, P2, P3, P4, P5, P6);
impl_permission_tuple!(P0, P1, P2, P3, P4, P5, P6, P7);

/// `is_subset(Child, Parent)`: true iff every required permission of
/// `Child` is required by `Parent`, checked against the fixed list of
/// registered component types `all_types`. Drives `Transaction::subset` --
/// the compiler still enforces that `Child`/`Parent` are valid
/// `PermissionSet`s, but *which* types are "all registered types" is only
/// known once the owning [`crate::ecs::Ecs`]'s registry is fixed, so the
/// check itself runs once at construction over that small, static list.
pub fn is_subset<Child: PermissionSet, Parent: PermissionSet>(all_types: &[TypeId]) -> bool {
    if Child::ADD_REMOVE && !Parent::ADD_REMOVE {
        return false;
    }
    for &type_id in all_types {
        if Child::is_read_allowed(type_id) && !Parent::is_read_allowed(type_id) {
            return false;
        }
        if Child::is_write_allowed(type_id) && !Parent::is_write_allowed(type_id) {
            return false;
        }
    }
    true
}
