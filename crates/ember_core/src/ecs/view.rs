//! # World View
//!
//! Read-only snapshot handed to async tasks. Nothing in the hierarchy can
//! change while a view exists; mutations go through the view's
//! [`CommandSender`] and are replayed after the async barrier.

use std::time::Duration;

use ember_shared::Transform;

use super::clock::Clock;
use super::command::CommandSender;
use super::object::{GameObject, GameObjectHandle, ObjectTable};
use super::registry::TypeRegistry;

/// Frozen, shareable view of one world during the async phase.
pub struct WorldView<'w> {
    objects: &'w ObjectTable,
    clock: &'w Clock,
    registry: &'w TypeRegistry,
    commands: CommandSender,
    frame: u64,
}

impl<'w> WorldView<'w> {
    pub(crate) fn new(
        objects: &'w ObjectTable,
        clock: &'w Clock,
        registry: &'w TypeRegistry,
        commands: CommandSender,
        frame: u64,
    ) -> Self {
        Self {
            objects,
            clock,
            registry,
            commands,
            frame,
        }
    }

    /// Resolves an object.
    #[must_use]
    pub fn object(&self, handle: GameObjectHandle) -> Option<&'w GameObject> {
        self.objects.get(handle)
    }

    /// All objects.
    #[must_use]
    pub fn objects(&self) -> &'w ObjectTable {
        self.objects
    }

    /// Cached world transform. Propagation has not run yet this frame.
    #[must_use]
    pub fn cached_world_transform(&self, handle: GameObjectHandle) -> Option<Transform> {
        self.objects.cached_world_transform(handle)
    }

    /// Looks up an object by global key.
    #[must_use]
    pub fn find_by_global_key(&self, key: &str) -> Option<GameObjectHandle> {
        self.objects.find_by_global_key(key)
    }

    /// Type registry of the world.
    #[must_use]
    pub fn registry(&self) -> &'w TypeRegistry {
        self.registry
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

    /// Frame number being updated.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// A sender for deferred commands.
    #[must_use]
    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }
}
