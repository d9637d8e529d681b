//! The `Component` trait: the one thing a type must implement to be stored
//! in an [`crate::ecs::Ecs`] instance.

/// A typed data record associated with at most one entity (or a singleton,
/// for global components).
///
/// There is no derive macro here deliberately: the engine is parameterized
/// at build time by a fixed, ordered list of component types, and that list
/// is expressed as a tuple of concrete `Component` types passed to
/// [`crate::ecs::Ecs::new`] -- see that type's documentation for the
/// ordering rules the lock protocol depends on.
pub trait Component: Default + Clone + Send + Sync + 'static {
    /// A singleton component is accessed without an entity handle; only
    /// slot 0 of its storage is ever used. Defaults to `false`.
    const IS_GLOBAL: bool = false;

    /// Name used in diagnostics and [`crate::ecs::Ecs::component_name`].
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}
