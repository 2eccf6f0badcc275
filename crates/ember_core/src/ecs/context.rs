//! # Update and Handler Contexts
//!
//! Components never get `&mut World`. Lifecycle hooks, message handlers and
//! sequential update functions receive a [`ComponentContext`]; async update
//! functions receive an [`AsyncContext`]. Both can read the hierarchy and
//! queue commands, which the world applies at its next sequential point.

use std::time::Duration;

use ember_shared::Transform;

use super::clock::Clock;
use super::command::{CommandBuffer, CommandSender, Commands, WorldCommand};
use super::component::ComponentHandle;
use super::object::{GameObject, GameObjectHandle, ObjectTable};
use super::view::WorldView;

/// Context for sequential component code.
pub struct ComponentContext<'a> {
    owner: GameObjectHandle,
    this: ComponentHandle,
    objects: &'a ObjectTable,
    clock: &'a Clock,
    commands: &'a mut CommandBuffer,
    depth: u32,
}

impl<'a> ComponentContext<'a> {
    pub(crate) fn new(
        owner: GameObjectHandle,
        this: ComponentHandle,
        objects: &'a ObjectTable,
        clock: &'a Clock,
        commands: &'a mut CommandBuffer,
        depth: u32,
    ) -> Self {
        Self {
            owner,
            this,
            objects,
            clock,
            commands,
            depth,
        }
    }

    /// Object the component is attached to.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> GameObjectHandle {
        self.owner
    }

    /// The component being called.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> ComponentHandle {
        self.this
    }

    /// Resolves any object of the world.
    #[must_use]
    pub fn object(&self, handle: GameObjectHandle) -> Option<&GameObject> {
        self.objects.get(handle)
    }

    /// The owner object.
    #[must_use]
    pub fn owner_object(&self) -> Option<&GameObject> {
        self.objects.get(self.owner)
    }

    /// Cached world transform of an object; may be stale until propagation.
    #[must_use]
    pub fn cached_world_transform(&self, handle: GameObjectHandle) -> Option<Transform> {
        self.objects.cached_world_transform(handle)
    }

    /// All objects of the world.
    #[must_use]
    pub fn objects(&self) -> &ObjectTable {
        self.objects
    }

    /// Simulated time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Simulated frame delta.
    #[must_use]
    pub fn delta(&self) -> Duration {
        self.clock.delta()
    }

    /// Re-post depth of the message being handled (0 outside handlers).
    #[must_use]
    pub fn message_depth(&self) -> u32 {
        self.depth
    }
}

impl Commands for ComponentContext<'_> {
    fn depth(&self) -> u32 {
        self.depth
    }

    fn queue(&mut self, command: WorldCommand) {
        self.commands.queue(command);
    }
}

/// Context for async component updates.
pub struct AsyncContext<'a> {
    view: &'a WorldView<'a>,
    commands: CommandSender,
    owner: GameObjectHandle,
    this: ComponentHandle,
}

impl<'a> AsyncContext<'a> {
    pub(crate) fn new(view: &'a WorldView<'a>) -> Self {
        Self {
            view,
            commands: view.commands(),
            owner: GameObjectHandle::NULL,
            this: ComponentHandle::NULL,
        }
    }

    pub(crate) fn bind(&mut self, owner: GameObjectHandle, this: ComponentHandle) {
        self.owner = owner;
        self.this = this;
    }

    /// Frozen view of the world.
    #[must_use]
    pub fn view(&self) -> &WorldView<'a> {
        self.view
    }

    /// Object the component is attached to.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> GameObjectHandle {
        self.owner
    }

    /// The component being updated.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> ComponentHandle {
        self.this
    }

    /// Simulated frame delta.
    #[must_use]
    pub fn delta(&self) -> Duration {
        self.view.delta()
    }
}

impl Commands for AsyncContext<'_> {
    fn queue(&mut self, command: WorldCommand) {
        self.commands.queue(command);
    }
}
