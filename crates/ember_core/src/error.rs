//! # World Error Types
//!
//! All errors that can occur in the world core.
//!
//! Stale handles are NOT errors: lookups return `None`. These types cover
//! rejected structural mutations, failed lifecycle hooks and bad input.

use ember_shared::StreamError;
use thiserror::Error;

use crate::ecs::{ComponentHandle, GameObjectHandle};

/// Rejected hierarchy mutations.
///
/// Every variant leaves the hierarchy exactly as it was before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HierarchyError {
    /// The handle does not resolve in this world.
    #[error("stale or invalid game object handle {0:?}")]
    StaleHandle(GameObjectHandle),

    /// The handle was minted by another world.
    #[error("handle {handle:?} belongs to world {owner}, not world {world}")]
    ForeignHandle {
        /// Offending handle.
        handle: GameObjectHandle,
        /// World id carried by the handle.
        owner: u16,
        /// Id of the world the call was made on.
        world: u16,
    },

    /// The new parent is the child itself or one of its descendants.
    #[error("re-parenting {child:?} under {parent:?} would create a cycle")]
    Cycle {
        /// Object being re-parented.
        child: GameObjectHandle,
        /// Requested parent.
        parent: GameObjectHandle,
    },

    /// A static object cannot be attached under a dynamic parent.
    #[error("static object {child:?} cannot be attached to dynamic parent {parent:?}")]
    StaticUnderDynamic {
        /// Object being re-parented.
        child: GameObjectHandle,
        /// Requested parent.
        parent: GameObjectHandle,
    },

    /// The global key is already used by another object.
    #[error("global key {0:?} is already in use")]
    DuplicateGlobalKey(String),

    /// The persistent id is already used by another object.
    #[error("persistent id {0:#018x} is already in use")]
    DuplicatePersistentId(u64),
}

/// Component storage and lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    /// The component type was never registered.
    #[error("component type '{0}' is not registered")]
    Unregistered(&'static str),

    /// The component handle does not resolve.
    #[error("stale or invalid component handle {0:?}")]
    StaleHandle(ComponentHandle),

    /// A boxed component did not match the storage it was inserted into.
    #[error("component type mismatch: expected '{expected}'")]
    TypeMismatch {
        /// Type the storage holds.
        expected: &'static str,
    },

    /// The component type has no default constructor.
    #[error("component type '{0}' cannot be default-constructed")]
    NoDefault(&'static str),

    /// `initialize` failed; the component is now inert.
    #[error("component initialization failed: {0}")]
    InitFailed(String),
}

/// World module errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// The module type was never registered.
    #[error("module type '{0}' is not registered")]
    Unregistered(&'static str),

    /// `startup` or `reinit` failed; the module is now inert.
    #[error("module startup failed: {0}")]
    StartupFailed(String),

    /// The module is currently running and cannot be re-entered.
    #[error("module '{0}' is busy")]
    Busy(&'static str),
}

/// Type registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The same type (or name) was registered twice.
    #[error("type '{0}' is already registered")]
    Duplicate(&'static str),

    /// Dense type ids are exhausted.
    #[error("too many registered types while adding '{0}'")]
    TooManyTypes(&'static str),

    /// A handler names a component type that was never registered.
    #[error("component type '{0}' is not registered")]
    UnknownComponent(&'static str),

    /// A handler names a message type that was never registered.
    #[error("message type '{0}' is not registered")]
    UnknownMessage(&'static str),

    /// An update function was declared for a phase it cannot run in.
    #[error("update function '{0}' cannot run in the requested phase")]
    InvalidUpdate(&'static str),
}

/// Configuration loading errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The TOML could not be parsed.
    #[error("failed to parse world config: {0}")]
    Parse(String),

    /// A field holds an unusable value.
    #[error("invalid world config: {0}")]
    Invalid(String),
}

/// Task scheduling errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The dependency graph contains a cycle.
    #[error("task graph contains a cycle through '{0}'")]
    Cycle(&'static str),

    /// A dependency edge names a task that was not submitted to the group.
    #[error("unknown task handle {0}")]
    UnknownTask(usize),

    /// The worker pool could not be built.
    #[error("failed to build worker pool: {0}")]
    PoolBuild(String),
}

/// Top-level world error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    /// Hierarchy mutation rejected.
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    /// Component operation failed.
    #[error(transparent)]
    Component(#[from] ComponentError),

    /// Module operation failed.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Registry misuse.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Bad configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Task scheduling failed.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Serialization stream failure.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Read markers are outstanding; the frame was not started.
    #[error("cannot update: {0} read marker(s) outstanding")]
    ReadersActive(usize),

    /// Timed out waiting for the write marker.
    #[error("timed out waiting for exclusive world access")]
    Timeout,
}

/// Result type for world operations.
pub type WorldResult<T> = Result<T, WorldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_convert_into_world_error() {
        let err: WorldError = HierarchyError::DuplicateGlobalKey("player".into()).into();
        assert!(matches!(err, WorldError::Hierarchy(_)));
        assert_eq!(err.to_string(), "global key \"player\" is already in use");

        let err: WorldError = StreamError::InvalidUtf8.into();
        assert!(matches!(err, WorldError::Stream(StreamError::InvalidUtf8)));
    }
}
