//! # Entity/Component World
//!
//! Game objects form a transform hierarchy; behavior lives in components
//! attached to them, and per-world singletons live in modules.
//!
//! ## Design Rules
//!
//! - Everything is addressed through generation-checked handles; a stale
//!   handle resolves to `None`, never to another object
//! - One storage per component type, dense type ids, no per-object maps
//! - Component code never holds `&mut World`; it queues commands
//! - Only the async phase runs on worker threads, against a frozen view

mod clock;
mod command;
mod component;
mod context;
mod frame;
mod handle;
mod message;
mod module;
mod object;
mod registry;
mod schedule;
mod serialize;
mod storage;
mod view;
mod world;

pub use clock::Clock;
pub use command::{CommandBuffer, CommandSender, Commands, PostedMessage, WorldCommand};
pub use component::{Component, ComponentHandle, ComponentState, Message, StoragePolicy};
pub use context::{AsyncContext, ComponentContext};
pub use frame::{FramePhase, FrameStats};
pub use handle::{Handle, HandleTable};
pub use message::{
    ChildChange, ChildrenChanged, ComponentChange, ComponentsChanged, DeleteObject, MessageQueue,
    MessageTarget, ParentChange, ParentChanged,
};
pub use module::{HierarchyEvent, ModuleAsyncContext, ModuleContext, ModuleState, WorldModule};
pub use object::{GameObject, GameObjectDesc, GameObjectHandle, ObjectTable, ParentPreserve};
pub use registry::{
    AsyncUpdateFn, ComponentDescriptor, ComponentTypeId, MessageTypeId, ModuleDescriptor, ModuleTypeId,
    SyncUpdateFn, TypeRegistry,
};
pub use schedule::{UpdateFunction, UpdatePhase};
pub use serialize::{WORLD_FORMAT_VERSION, WORLD_MAGIC};
pub use storage::{ComponentStorage, Entry, STABLE_BLOCK_SIZE};
pub use view::WorldView;
pub use world::World;

/// Context passed to message handlers.
pub type MessageContext<'a> = ComponentContext<'a>;
