//! Thread-safe, transactional entity-component-system storage engine.
//!
//! An [`Ecs`] instance owns a fixed, ordered list of component types, one
//! double-buffered store per type plus an entity metadata store, and hands
//! out [`Transaction`] handles whose compile-time [`PermissionSet`] decides
//! exactly which locks get acquired and in what mode. See the module docs
//! below for the pieces that make that up.

pub mod component;
pub mod config;
pub mod ecs;
pub mod entity;
pub mod error;
pub mod lock;
pub mod observer;
pub mod permissions;
pub mod registry;
pub mod storage;
pub mod trace;
pub mod transaction;

pub use component::Component;
pub use config::EcsConfig;
pub use ecs::Ecs;
pub use entity::Entity;
pub use error::{EcsError, EcsResult};
pub use observer::{Event, Observer};
pub use permissions::{AddRemove, Optional, PermissionSet, Read, ReadAll, Write, WriteAll};
pub use registry::Registry;
pub use transaction::{DynamicPermissions, DynamicTransaction, ReadOnlyView, Transaction};
