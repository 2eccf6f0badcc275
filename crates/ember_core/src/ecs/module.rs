//! # World Modules
//!
//! A module is a per-world singleton subsystem (physics scene, wind volumes,
//! AI blackboard). The world owns at most one instance per registered type.
//!
//! ## Lifecycle
//!
//! ```text
//! Unstarted ─startup ok─▶ Active ─delete/teardown─▶ ShuttingDown ─▶ Destroyed
//!     │                   │  ▲
//!     │        reinit err │  │ reinit ok
//!     └──startup err───▶ Inert
//! ```
//!
//! Modules start lazily on first `get_module`, or at world creation when
//! marked always-on. Teardown shuts modules down in reverse creation order.
//!
//! While a module runs (startup, update, hierarchy callback) it is taken out
//! of its slot, so it can receive `&mut World` without aliasing itself.

use std::time::Duration;

use downcast_rs::{impl_downcast, Downcast};

use super::command::{CommandSender, Commands, WorldCommand};
use super::component::ComponentHandle;
use super::object::GameObjectHandle;
use super::registry::ModuleTypeId;
use super::schedule::UpdatePhase;
use super::view::WorldView;
use super::world::World;
use crate::error::ModuleError;

/// A per-world subsystem.
pub trait WorldModule: Downcast + Send + Sync + 'static {
    /// Called once before the first use.
    ///
    /// # Errors
    ///
    /// A failure leaves the module inert: it stays reachable but is never
    /// updated.
    fn startup(&mut self, _world: &mut World) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Called once before the module is freed.
    fn shutdown(&mut self, _world: &mut World) {}

    /// Restarts the module in place, e.g. after a backend swap.
    ///
    /// # Errors
    ///
    /// Same as [`Self::startup`].
    fn reinit(&mut self, world: &mut World) -> Result<(), ModuleError> {
        self.shutdown(world);
        self.startup(world)
    }

    /// Runs a sequential update function declared in the descriptor.
    fn update(&mut self, _ctx: &mut ModuleContext<'_>) {}

    /// Runs an async update function declared in the descriptor.
    fn update_async(&mut self, _ctx: &mut ModuleAsyncContext<'_>) {}

    /// Hierarchy notification, for modules registered as observers.
    fn on_hierarchy_event(&mut self, _world: &World, _event: &HierarchyEvent) {}

    /// Every object of the world was destroyed by `World::clear`.
    fn world_cleared(&mut self, _world: &mut World) {}
}
impl_downcast!(WorldModule);

/// Lifecycle state of one module slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModuleState {
    /// Never requested.
    #[default]
    Unstarted,
    /// Started and updated every frame.
    Active,
    /// `shutdown` is running.
    ShuttingDown,
    /// Shut down and freed.
    Destroyed,
    /// Startup or reinit failed; never updated.
    Inert,
}

/// Structural change delivered to observing modules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HierarchyEvent {
    /// An object was created.
    ObjectCreated(GameObjectHandle),
    /// An object is about to be freed; its children are already gone.
    ObjectDestroyed(GameObjectHandle),
    /// An object moved in the tree.
    ParentChanged {
        /// Re-parented object.
        child: GameObjectHandle,
        /// Previous parent.
        old_parent: Option<GameObjectHandle>,
        /// New parent.
        new_parent: Option<GameObjectHandle>,
    },
    /// A component was attached.
    ComponentAdded {
        /// Owner object.
        owner: GameObjectHandle,
        /// The new component.
        component: ComponentHandle,
    },
    /// A component was detached.
    ComponentRemoved {
        /// Owner object.
        owner: GameObjectHandle,
        /// The removed component; already stale.
        component: ComponentHandle,
    },
    /// The object's effective active state flipped.
    ActiveChanged {
        /// Affected object.
        object: GameObjectHandle,
        /// New effective state.
        active: bool,
    },
}

/// Passed to [`WorldModule::update`].
pub struct ModuleContext<'a> {
    world: &'a mut World,
    function: &'static str,
    phase: UpdatePhase,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(world: &'a mut World, function: &'static str, phase: UpdatePhase) -> Self {
        Self { world, function, phase }
    }

    /// Name of the update function being run.
    #[must_use]
    pub fn function(&self) -> &'static str {
        self.function
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// The world, read-only.
    #[must_use]
    pub fn world(&self) -> &World {
        self.world
    }

    /// The world. Sequential phases allow every structural mutation.
    pub fn world_mut(&mut self) -> &mut World {
        self.world
    }

    /// Simulated frame delta.
    #[must_use]
    pub fn delta(&self) -> Duration {
        self.world.clock().delta()
    }
}

/// Passed to [`WorldModule::update_async`].
pub struct ModuleAsyncContext<'a> {
    view: &'a WorldView<'a>,
    commands: CommandSender,
    function: &'static str,
}

impl<'a> ModuleAsyncContext<'a> {
    pub(crate) fn new(view: &'a WorldView<'a>, function: &'static str) -> Self {
        Self {
            view,
            commands: view.commands(),
            function,
        }
    }

    /// Name of the update function being run.
    #[must_use]
    pub fn function(&self) -> &'static str {
        self.function
    }

    /// Frozen view of the world.
    #[must_use]
    pub fn view(&self) -> &WorldView<'a> {
        self.view
    }

    /// Simulated frame delta.
    #[must_use]
    pub fn delta(&self) -> Duration {
        self.view.delta()
    }
}

impl Commands for ModuleAsyncContext<'_> {
    fn queue(&mut self, command: WorldCommand) {
        self.commands.queue(command);
    }
}

pub(crate) struct ModuleSlot {
    pub state: ModuleState,
    /// `None` while unstarted, destroyed, or taken out to run.
    pub instance: Option<Box<dyn WorldModule>>,
}

/// Module instances of one world, indexed by type id.
pub(crate) struct ModuleSet {
    slots: Vec<ModuleSlot>,
    creation_order: Vec<ModuleTypeId>,
}

impl ModuleSet {
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count)
                .map(|_| ModuleSlot {
                    state: ModuleState::Unstarted,
                    instance: None,
                })
                .collect(),
            creation_order: Vec::new(),
        }
    }

    pub fn slot(&self, id: ModuleTypeId) -> Option<&ModuleSlot> {
        self.slots.get(usize::from(id.0))
    }

    pub fn slot_mut(&mut self, id: ModuleTypeId) -> Option<&mut ModuleSlot> {
        self.slots.get_mut(usize::from(id.0))
    }

    pub fn state(&self, id: ModuleTypeId) -> ModuleState {
        self.slot(id).map_or(ModuleState::Unstarted, |s| s.state)
    }

    /// Takes an instance out to run it.
    pub fn take(&mut self, id: ModuleTypeId) -> Option<Box<dyn WorldModule>> {
        self.slot_mut(id)?.instance.take()
    }

    /// Puts a taken instance back.
    pub fn restore(&mut self, id: ModuleTypeId, module: Box<dyn WorldModule>) {
        if let Some(slot) = self.slot_mut(id) {
            debug_assert!(slot.instance.is_none(), "module slot refilled while occupied");
            slot.instance = Some(module);
        }
    }

    pub fn set_state(&mut self, id: ModuleTypeId, state: ModuleState) {
        if let Some(slot) = self.slot_mut(id) {
            slot.state = state;
        }
    }

    pub fn record_created(&mut self, id: ModuleTypeId) {
        self.creation_order.retain(|m| *m != id);
        self.creation_order.push(id);
    }

    pub fn forget(&mut self, id: ModuleTypeId) {
        self.creation_order.retain(|m| *m != id);
    }

    /// Started modules, oldest first.
    pub fn creation_order(&self) -> &[ModuleTypeId] {
        &self.creation_order
    }

    /// True if the module should get update calls.
    pub fn is_runnable(&self, id: ModuleTypeId) -> bool {
        self.slot(id)
            .is_some_and(|s| s.state == ModuleState::Active && s.instance.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Wind {
        strength: f32,
    }
    impl WorldModule for Wind {}

    #[test]
    fn test_take_and_restore() {
        let id = ModuleTypeId(0);
        let mut set = ModuleSet::new(1);
        assert_eq!(set.state(id), ModuleState::Unstarted);
        assert!(!set.is_runnable(id));

        set.restore(id, Box::new(Wind { strength: 2.0 }));
        set.set_state(id, ModuleState::Active);
        set.record_created(id);
        assert!(set.is_runnable(id));

        let taken = set.take(id).unwrap();
        assert!(!set.is_runnable(id));
        assert_eq!(taken.downcast_ref::<Wind>().map(|w| w.strength), Some(2.0));
        set.restore(id, taken);
        assert_eq!(set.creation_order(), &[id]);
    }

    #[test]
    fn test_out_of_range_is_unstarted() {
        let set = ModuleSet::new(0);
        assert_eq!(set.state(ModuleTypeId(9)), ModuleState::Unstarted);
    }
}
