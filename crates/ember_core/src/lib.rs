//! # EMBER Core
//!
//! The entity/component world of the EMBER engine:
//! - Generation-checked handles for objects and components
//! - A game object hierarchy with lazily propagated transforms
//! - Per-type component storage, compact or address-stable
//! - Per-world modules, typed messages and a phased frame update
//!
//! ## Architecture Rules
//!
//! 1. **Handles, not references** - nothing outside the world keeps a pointer
//!    into it across frames
//! 2. **Deferred mutation** - component code queues commands; the world
//!    replays them at sequential points
//! 3. **One barrier per frame** - async work runs between PreAsync and
//!    PostAsync against a frozen view
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ember_core::{GameObjectDesc, InlineScheduler, TypeRegistry, World, WorldConfig};
//!
//! let registry = Arc::new(TypeRegistry::new());
//! let mut world = World::new(WorldConfig::named("sandbox"), registry, Arc::new(InlineScheduler))?;
//! let root = world.create_object(GameObjectDesc::new("root"))?;
//! world.update(std::time::Duration::from_millis(16));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod diagnostics;
pub mod ecs;
pub mod error;
pub mod sync;
pub mod task;

pub use config::WorldConfig;
pub use diagnostics::{Diagnostic, DiagnosticReceiver, DropReason};
pub use ecs::{
    AsyncContext, ChildChange, ChildrenChanged, Clock, CommandSender, Commands, Component, ComponentChange,
    ComponentContext, ComponentDescriptor, ComponentHandle, ComponentState, ComponentStorage, ComponentTypeId,
    ComponentsChanged, DeleteObject, FramePhase, FrameStats, GameObject, GameObjectDesc, GameObjectHandle, Handle,
    HandleTable, HierarchyEvent, Message, MessageContext, MessageQueue, MessageTarget, MessageTypeId,
    ModuleAsyncContext, ModuleContext, ModuleDescriptor, ModuleState, ModuleTypeId, ParentChange, ParentChanged,
    ParentPreserve, StoragePolicy, TypeRegistry, UpdateFunction, UpdatePhase, World, WorldCommand, WorldModule,
    WorldView, WORLD_FORMAT_VERSION, WORLD_MAGIC,
};
pub use error::{
    ComponentError, ConfigError, HierarchyError, ModuleError, RegistryError, TaskError, WorldError, WorldResult,
};
pub use sync::{ReadMarker, SharedWorld, WriteMarker};
#[cfg(feature = "parallel")]
pub use task::RayonScheduler;
pub use task::{InlineScheduler, TaskGroup, TaskScheduler};
