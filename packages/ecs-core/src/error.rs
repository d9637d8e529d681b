//! Storage engine error types.

use thiserror::Error;

/// Recoverable storage engine errors.
///
/// `LockProtocolViolation` is deliberately not a variant here: per the
/// engine's contract a commit/unlock called without its expected
/// precondition indicates a bug rather than a caller mistake, so
/// [`crate::lock::ComponentMutex`] raises it as a panic instead of a
/// `Result`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// A thread tried to open a second transaction on the same `Ecs` instance.
    #[error("thread already holds an open transaction on this ECS instance")]
    NestedTransaction,

    /// A dynamic-permission transaction was narrowed to a static permission
    /// set it does not actually hold.
    #[error("transaction does not hold the requested permissions")]
    InsufficientPermissions,

    /// `Get`/`GetPrevious` on a component that is not present, with no
    /// `AddRemove` permission to auto-insert it.
    #[error("component '{component}' missing on entity {entity}")]
    MissingComponent {
        entity: String,
        component: &'static str,
    },

    /// An entity handle was produced by a different `Ecs` instance.
    #[error("entity {entity} does not belong to this ECS instance")]
    ForeignEntity { entity: String },

    /// An entity handle's generation does not match the slot's current
    /// generation.
    #[error("entity {entity} refers to a destroyed (stale) slot")]
    StaleEntity { entity: String },

    /// An index or offset fell outside the valid range (checked mode only).
    #[error("index {index} out of bounds (len {len})")]
    OutOfBounds { index: usize, len: usize },

    /// `Poll` was called on an observer that was explicitly stopped.
    #[error("observer was closed")]
    ObserverClosed,
}

impl EcsError {
    pub fn missing_component(entity: impl std::fmt::Display, component: &'static str) -> Self {
        EcsError::MissingComponent {
            entity: entity.to_string(),
            component,
        }
    }

    /// `MissingComponent` for a global component, which has no entity
    /// handle of its own.
    pub fn missing_global(component: &'static str) -> Self {
        EcsError::MissingComponent {
            entity: "global".to_string(),
            component,
        }
    }

    pub fn foreign_entity(entity: impl std::fmt::Display) -> Self {
        EcsError::ForeignEntity {
            entity: entity.to_string(),
        }
    }

    pub fn stale_entity(entity: impl std::fmt::Display) -> Self {
        EcsError::StaleEntity {
            entity: entity.to_string(),
        }
    }

    pub fn out_of_bounds(index: usize, len: usize) -> Self {
        EcsError::OutOfBounds { index, len }
    }
}

pub type EcsResult<T> = Result<T, EcsError>;
