//! # World
//!
//! One simulation instance: the object hierarchy, one storage per registered
//! component type, the module instances, the message queues and the clock.
//!
//! ## Mutation Rules
//!
//! - World methods apply structural changes immediately and fail closed.
//! - Component code (hooks, handlers, updates) never sees `&mut World`; it
//!   queues [`WorldCommand`]s, which the world replays as soon as the call
//!   returns.
//! - Async tasks queue commands through a channel, replayed at the start of
//!   PostAsync.
//!
//! The frame loop lives in `frame.rs`, persistence in `serialize.rs`.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use ember_shared::{Quat, Transform, Vec3};
use smallvec::SmallVec;

use super::clock::Clock;
use super::command::{command_channel, CommandBuffer, CommandSender, PostedMessage, WorldCommand};
use super::component::{Component, ComponentHandle, ComponentState, Message};
use super::context::ComponentContext;
use super::frame::FramePhase;
use super::handle::Handle;
use super::message::{
    ChildChange, ChildrenChanged, ComponentChange, ComponentsChanged, DeleteObject, MessageQueue,
    MessageRouter, MessageTarget, ParentChange, ParentChanged,
};
use super::module::{HierarchyEvent, ModuleSet, ModuleState, WorldModule};
use super::object::{GameObject, GameObjectDesc, GameObjectHandle, ObjectTable, ParentPreserve};
use super::registry::{ComponentTypeId, MessageTypeId, ModuleTypeId, TypeRegistry};
use super::schedule::{Schedule, UpdateTarget};
use super::storage::{ComponentStorage, ErasedStorage};
use crate::config::WorldConfig;
use crate::diagnostics::{self, Diagnostic, DiagnosticReceiver, DiagnosticSender, DropReason};
use crate::error::{ComponentError, HierarchyError, ModuleError, RegistryError, WorldResult};
use crate::task::TaskScheduler;

static NEXT_WORLD_ID: AtomicU16 = AtomicU16::new(1);

fn next_world_id() -> u16 {
    loop {
        // 0 is the null handle tag
        let id = NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Ids of the messages the world sends itself.
#[derive(Clone, Copy, Debug)]
pub(super) struct BuiltinMessages {
    pub parent_changed: MessageTypeId,
    pub children_changed: MessageTypeId,
    pub components_changed: MessageTypeId,
    pub delete_object: MessageTypeId,
}

impl BuiltinMessages {
    fn resolve(registry: &TypeRegistry) -> Result<Self, RegistryError> {
        fn id<M: Any>(registry: &TypeRegistry) -> Result<MessageTypeId, RegistryError> {
            registry
                .message_type_id::<M>()
                .ok_or(RegistryError::UnknownMessage(type_name::<M>()))
        }
        Ok(Self {
            parent_changed: id::<ParentChanged>(registry)?,
            children_changed: id::<ChildrenChanged>(registry)?,
            components_changed: id::<ComponentsChanged>(registry)?,
            delete_object: id::<DeleteObject>(registry)?,
        })
    }
}

/// One simulation instance.
///
/// # Example
///
/// ```rust,ignore
/// let registry = Arc::new(registry);
/// let mut world = World::new(WorldConfig::named("level"), registry, Arc::new(InlineScheduler))?;
///
/// let a = world.create_object(GameObjectDesc::new("a"))?;
/// let b = world.create_object(GameObjectDesc::new("b").with_parent(a))?;
/// world.add_component(b, Health::default())?;
/// world.update(Duration::from_millis(16));
/// ```
pub struct World {
    pub(super) id: u16,
    pub(super) config: WorldConfig,
    pub(super) registry: Arc<TypeRegistry>,
    pub(super) scheduler: Arc<dyn TaskScheduler>,
    pub(super) objects: ObjectTable,
    /// Indexed by component type id.
    pub(super) storages: Vec<Box<dyn ErasedStorage>>,
    pub(super) modules: ModuleSet,
    pub(super) observers: Vec<ModuleTypeId>,
    pub(super) schedule: Schedule,
    pub(super) router: MessageRouter,
    pub(super) builtin: BuiltinMessages,
    pub(super) clock: Clock,
    pub(super) commands: CommandBuffer,
    pub(super) async_sender: CommandSender,
    pub(super) async_commands: Receiver<WorldCommand>,
    pub(super) diagnostics: DiagnosticSender,
    pub(super) diagnostics_rx: DiagnosticReceiver,
    pub(super) phase: FramePhase,
    pub(super) frame: u64,
    pub(super) simulating: bool,
    pub(super) pending_init: Vec<ComponentHandle>,
    pub(super) pending_destroys: Vec<GameObjectHandle>,
    pub(super) commands_applied: usize,
    pub(super) read_markers: Arc<AtomicUsize>,
}

impl World {
    /// Creates a world and starts its always-on modules.
    ///
    /// # Errors
    ///
    /// Fails on an invalid config. Module startup failures do not fail the
    /// world; those modules go inert and are reported on the diagnostics
    /// channel.
    pub fn new(
        config: WorldConfig,
        registry: Arc<TypeRegistry>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> WorldResult<Self> {
        config.validate()?;
        let id = next_world_id();
        let builtin = BuiltinMessages::resolve(&registry)?;
        let (diagnostics, diagnostics_rx) = diagnostics::channel(config.diagnostics_capacity);
        let (async_sender, async_commands) = command_channel();

        let storages = registry
            .components()
            .map(|(type_id, info)| (info.make_storage)(type_id, info.policy, info.thread_safe))
            .collect();

        let candidates = registry
            .components()
            .flat_map(|(type_id, info)| {
                info.updates.iter().enumerate().map(move |(index, update)| {
                    (UpdateTarget::Component { type_id, index }, &update.function)
                })
            })
            .chain(registry.modules().flat_map(|(module, info)| {
                info.updates
                    .iter()
                    .map(move |function| (UpdateTarget::Module(module), function))
            }));
        let (schedule, unresolved) = Schedule::build(candidates);
        for missing in unresolved {
            tracing::warn!(
                function = missing.function,
                missing = missing.missing,
                "update function not scheduled: unresolved dependency"
            );
            diagnostics.report(Diagnostic::UnresolvedDependency {
                function: missing.function,
                missing: missing.missing,
            });
        }

        let observers = registry
            .modules()
            .filter(|(_, info)| info.observes_hierarchy)
            .map(|(module, _)| module)
            .collect();
        let always_on: Vec<ModuleTypeId> = registry
            .modules()
            .filter(|(_, info)| info.always_on)
            .map(|(module, _)| module)
            .collect();

        let mut world = Self {
            id,
            objects: ObjectTable::new(id, config.object_capacity, config.seed),
            storages,
            modules: ModuleSet::new(registry.module_count()),
            observers,
            schedule,
            router: MessageRouter::default(),
            builtin,
            clock: Clock::new(config.clock_speed),
            commands: CommandBuffer::new(),
            async_sender,
            async_commands,
            diagnostics,
            diagnostics_rx,
            phase: FramePhase::Idle,
            frame: 0,
            simulating: config.simulate,
            pending_init: Vec::new(),
            pending_destroys: Vec::new(),
            commands_applied: 0,
            read_markers: Arc::new(AtomicUsize::new(0)),
            scheduler,
            registry,
            config,
        };
        tracing::info!(
            world = world.id,
            name = %world.config.name,
            scheduler = world.scheduler.name(),
            functions = world.schedule.len(),
            "world created"
        );

        for module in always_on {
            // Failures leave the module inert and are already reported.
            // Modules started by an earlier startup are skipped.
            let _ = world.start_module(module);
        }
        Ok(world)
    }

    // =========================================================================
    // Identity and state
    // =========================================================================

    /// Process-unique id; also the tag of every object handle of this world.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Name from the config.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Config the world was created with.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Type registry shared with other worlds.
    #[must_use]
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Simulated clock.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Simulated clock, mutably (speed, pause).
    pub fn clock_mut(&mut self) -> &mut Clock {
        &mut self.clock
    }

    /// True unless simulation was disabled.
    #[must_use]
    pub fn is_simulating(&self) -> bool {
        self.simulating
    }

    /// Disabled simulation freezes the clock and skips update functions
    /// marked "only when simulating".
    pub fn set_simulation_enabled(&mut self, enabled: bool) {
        self.simulating = enabled;
    }

    /// Number of frames started.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Phase currently running; `Idle` between frames.
    #[must_use]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Receiving end of the diagnostics channel.
    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticReceiver {
        self.diagnostics_rx.clone()
    }

    /// Read markers currently held on this world.
    #[must_use]
    pub fn outstanding_read_markers(&self) -> usize {
        self.read_markers.load(Ordering::Acquire)
    }

    pub(crate) fn read_marker_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.read_markers)
    }

    pub(super) fn report(&self, diagnostic: Diagnostic) {
        self.diagnostics.report(diagnostic);
    }

    /// Outside the async phase, returns false and does nothing. Inside it,
    /// queues `command` for the PostAsync replay and returns true.
    pub(super) fn defer_during_async(&self, operation: &'static str, command: impl FnOnce() -> WorldCommand) -> bool {
        if self.phase != FramePhase::Async {
            return false;
        }
        debug_assert!(false, "{operation} called during the async phase");
        tracing::warn!(operation, "mutation during the async phase deferred to PostAsync");
        self.async_sender.send(command());
        true
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Creates an object. Called during the async phase, the creation is
    /// queued for PostAsync and the returned handle is null.
    ///
    /// # Errors
    ///
    /// Rejects stale or foreign parents and duplicate global keys or
    /// persistent ids.
    pub fn create_object(&mut self, desc: GameObjectDesc) -> WorldResult<GameObjectHandle> {
        if self.phase == FramePhase::Async {
            self.defer_during_async("create_object", || WorldCommand::CreateObject(desc));
            return Ok(Handle::NULL);
        }
        let handle = self.create_object_impl(desc).map_err(|error| {
            tracing::warn!(%error, "create_object rejected");
            error
        })?;
        self.apply_commands();
        Ok(handle)
    }

    /// Destroys an object, its subtree and every attached component now.
    ///
    /// # Errors
    ///
    /// Rejects stale or foreign handles.
    pub fn destroy_object(&mut self, object: GameObjectHandle) -> WorldResult<()> {
        if self.defer_during_async("destroy_object", || WorldCommand::DestroyObject(object)) {
            return Ok(());
        }
        self.destroy_object_impl(object)?;
        self.apply_commands();
        Ok(())
    }

    /// Destroys an object at the next dead-object sync point.
    ///
    /// # Errors
    ///
    /// Rejects stale or foreign handles.
    pub fn destroy_object_deferred(&mut self, object: GameObjectHandle) -> WorldResult<()> {
        self.objects.check(object)?;
        if !self.pending_destroys.contains(&object) {
            self.pending_destroys.push(object);
        }
        Ok(())
    }

    /// Re-parents keeping the local transform.
    ///
    /// # Errors
    ///
    /// See [`Self::set_parent_with`].
    pub fn set_parent(&mut self, child: GameObjectHandle, parent: Option<GameObjectHandle>) -> WorldResult<()> {
        self.set_parent_with(child, parent, ParentPreserve::KeepLocal)
    }

    /// Re-parents `child` under `parent`, or makes it a root.
    ///
    /// # Errors
    ///
    /// Rejects stale or foreign handles, cycles, and static objects under
    /// dynamic parents. The hierarchy is untouched on error.
    pub fn set_parent_with(
        &mut self,
        child: GameObjectHandle,
        parent: Option<GameObjectHandle>,
        preserve: ParentPreserve,
    ) -> WorldResult<()> {
        if self.defer_during_async("set_parent", || WorldCommand::SetParent {
            child,
            parent,
            preserve,
        }) {
            return Ok(());
        }
        self.set_parent_impl(child, parent, preserve).map_err(|error| {
            tracing::warn!(%error, "set_parent rejected");
            error
        })?;
        self.apply_commands();
        Ok(())
    }

    /// Sets the object's own active flag.
    ///
    /// # Errors
    ///
    /// Rejects stale or foreign handles.
    pub fn set_active(&mut self, object: GameObjectHandle, active: bool) -> WorldResult<()> {
        if self.defer_during_async("set_active", || WorldCommand::SetActive(object, active)) {
            return Ok(());
        }
        self.set_active_impl(object, active)?;
        self.apply_commands();
        Ok(())
    }

    /// Sets or clears the object's global key.
    ///
    /// # Errors
    ///
    /// Rejects stale handles and keys used by another object.
    pub fn set_global_key(&mut self, object: GameObjectHandle, key: Option<String>) -> WorldResult<()> {
        if self.phase == FramePhase::Async {
            self.defer_during_async("set_global_key", || WorldCommand::SetGlobalKey(object, key));
            return Ok(());
        }
        Ok(self.objects.set_global_key(object, key)?)
    }

    /// Replaces the local transform; the subtree goes dirty.
    pub fn set_local_transform(&mut self, object: GameObjectHandle, local: Transform) -> bool {
        if self.defer_during_async("set_local_transform", || WorldCommand::SetLocalTransform(object, local)) {
            return true;
        }
        self.objects.set_local_transform(object, local)
    }

    /// Sets the local position.
    pub fn set_position(&mut self, object: GameObjectHandle, position: Vec3) -> bool {
        self.modify_local(object, |t| t.position = position)
    }

    /// Sets the local rotation.
    pub fn set_rotation(&mut self, object: GameObjectHandle, rotation: Quat) -> bool {
        self.modify_local(object, |t| t.rotation = rotation)
    }

    /// Sets the local scale.
    pub fn set_scale(&mut self, object: GameObjectHandle, scale: Vec3) -> bool {
        self.modify_local(object, |t| t.scale = scale)
    }

    fn modify_local(&mut self, object: GameObjectHandle, edit: impl FnOnce(&mut Transform)) -> bool {
        let Some(mut local) = self.local_transform(object) else {
            return false;
        };
        edit(&mut local);
        self.set_local_transform(object, local)
    }

    /// Local transform.
    #[must_use]
    pub fn local_transform(&self, object: GameObjectHandle) -> Option<Transform> {
        self.objects.get(object).map(|o| *o.local_transform())
    }

    /// World transform, recomputed if dirty.
    pub fn world_transform(&mut self, object: GameObjectHandle) -> Option<Transform> {
        self.objects.world_transform(object)
    }

    /// World transform as last computed; stale until propagation.
    #[must_use]
    pub fn cached_world_transform(&self, object: GameObjectHandle) -> Option<Transform> {
        self.objects.cached_world_transform(object)
    }

    /// Resolves an object.
    #[must_use]
    pub fn object(&self, object: GameObjectHandle) -> Option<&GameObject> {
        self.objects.get(object)
    }

    /// The object table.
    #[must_use]
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Parent of an object.
    #[must_use]
    pub fn parent(&self, object: GameObjectHandle) -> Option<GameObjectHandle> {
        self.objects.get(object).and_then(GameObject::parent)
    }

    /// Children in order; empty for stale handles.
    #[must_use]
    pub fn children(&self, object: GameObjectHandle) -> &[GameObjectHandle] {
        self.objects.get(object).map_or(&[][..], GameObject::children)
    }

    /// Components in attachment order; empty for stale handles.
    #[must_use]
    pub fn components(&self, object: GameObjectHandle) -> &[ComponentHandle] {
        self.objects.get(object).map_or(&[][..], GameObject::components)
    }

    /// Looks up an object by global key.
    #[must_use]
    pub fn find_by_global_key(&self, key: &str) -> Option<GameObjectHandle> {
        self.objects.find_by_global_key(key)
    }

    /// Looks up an object by persistent id.
    #[must_use]
    pub fn find_by_persistent_id(&self, id: u64) -> Option<GameObjectHandle> {
        self.objects.find_by_persistent_id(id)
    }

    // =========================================================================
    // Components
    // =========================================================================

    /// Attaches a component. It is initialized at the next init point.
    /// Called during the async phase, the attach is queued for PostAsync
    /// and the returned handle is null.
    ///
    /// # Errors
    ///
    /// Rejects stale owners and unregistered types.
    pub fn add_component<C: Component>(&mut self, owner: GameObjectHandle, value: C) -> WorldResult<Handle<C>> {
        if self.phase == FramePhase::Async {
            self.defer_during_async("add_component", || WorldCommand::AddComponent {
                owner,
                component: Box::new(value),
            });
            return Ok(Handle::NULL);
        }
        self.objects.check(owner)?;
        let type_id = self
            .registry
            .component_type_id::<C>()
            .ok_or(ComponentError::Unregistered(type_name::<C>()))?;
        let storage = self
            .storages
            .get_mut(usize::from(type_id.0))
            .and_then(|s| s.downcast_mut::<ComponentStorage<C>>())
            .ok_or(ComponentError::TypeMismatch {
                expected: type_name::<C>(),
            })?;
        let handle = storage.create(owner, value);
        self.attach(owner, handle.erase());
        self.apply_commands();
        Ok(handle)
    }

    /// Attaches an already boxed component.
    ///
    /// # Errors
    ///
    /// Rejects stale owners and unregistered types.
    pub fn add_component_boxed(
        &mut self,
        owner: GameObjectHandle,
        component: Box<dyn Component>,
    ) -> WorldResult<ComponentHandle> {
        if self.phase == FramePhase::Async {
            self.defer_during_async("add_component", || WorldCommand::AddComponent { owner, component });
            return Ok(Handle::NULL);
        }
        let handle = self.add_boxed_impl(owner, component)?;
        self.apply_commands();
        Ok(handle)
    }

    /// Attaches a default-constructed component of a registered type.
    ///
    /// # Errors
    ///
    /// Fails if the type has no default constructor.
    pub fn add_default_component(
        &mut self,
        owner: GameObjectHandle,
        type_id: ComponentTypeId,
    ) -> WorldResult<ComponentHandle> {
        let name = self.registry.component_name(type_id).unwrap_or("<unregistered>");
        let component = self
            .registry
            .create_default(type_id)
            .ok_or(ComponentError::NoDefault(name))?;
        self.add_component_boxed(owner, component)
    }

    /// Deinitializes and detaches a component. The handle is stale
    /// immediately; memory is reclaimed at the next sync point.
    ///
    /// # Errors
    ///
    /// Rejects stale handles.
    pub fn remove_component(&mut self, component: ComponentHandle) -> WorldResult<()> {
        if self.defer_during_async("remove_component", || WorldCommand::RemoveComponent(component)) {
            return Ok(());
        }
        self.remove_component_impl(component, true)?;
        self.apply_commands();
        Ok(())
    }

    /// Typed storage of `C`.
    #[must_use]
    pub fn storage<C: Component>(&self) -> Option<&ComponentStorage<C>> {
        let type_id = self.registry.component_type_id::<C>()?;
        self.storages
            .get(usize::from(type_id.0))?
            .downcast_ref::<ComponentStorage<C>>()
    }

    /// Typed storage of `C`, mutably. Removals through it skip the
    /// lifecycle; prefer [`Self::remove_component`].
    pub fn storage_mut<C: Component>(&mut self) -> Option<&mut ComponentStorage<C>> {
        let type_id = self.registry.component_type_id::<C>()?;
        self.storages
            .get_mut(usize::from(type_id.0))?
            .downcast_mut::<ComponentStorage<C>>()
    }

    /// Resolves a typed component handle.
    #[must_use]
    pub fn component<C: Component>(&self, handle: Handle<C>) -> Option<&C> {
        self.storage::<C>()?.resolve(handle)
    }

    /// Resolves a typed component handle mutably.
    pub fn component_mut<C: Component>(&mut self, handle: Handle<C>) -> Option<&mut C> {
        self.storage_mut::<C>()?.resolve_mut(handle)
    }

    /// Resolves an erased component handle.
    #[must_use]
    pub fn component_dyn(&self, handle: ComponentHandle) -> Option<&dyn Component> {
        self.storages
            .get(usize::from(handle.component_type().0))?
            .get_dyn(handle)
    }

    /// First component of type `C` on an object.
    #[must_use]
    pub fn find_component<C: Component>(&self, object: GameObjectHandle) -> Option<Handle<C>> {
        let type_id = self.registry.component_type_id::<C>()?;
        self.components(object)
            .iter()
            .find_map(|handle| handle.downcast::<C>(type_id))
    }

    /// Lifecycle state of a component.
    #[must_use]
    pub fn component_state(&self, handle: ComponentHandle) -> Option<ComponentState> {
        self.storages
            .get(usize::from(handle.component_type().0))?
            .state_of(handle)
    }

    /// Owner of a component.
    #[must_use]
    pub fn component_owner(&self, handle: ComponentHandle) -> Option<GameObjectHandle> {
        self.storages
            .get(usize::from(handle.component_type().0))?
            .owner_of(handle)
    }

    /// Live components across all types.
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.storages.iter().map(|s| s.live_count()).sum()
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Delivers a message to one component right away.
    ///
    /// Returns `false` when the component has no handler for `M` (not an
    /// error) or the handle is stale.
    pub fn send<M: Message>(&mut self, target: ComponentHandle, message: M) -> bool {
        let Some(message_type) = self.message_type::<M>() else {
            return false;
        };
        let handled = self.deliver(target, message_type, &message, 0);
        self.apply_commands();
        handled
    }

    /// Delivers a message to every component of an object, in attachment
    /// order. Returns the number of handlers that ran.
    pub fn send_to_object<M: Message>(&mut self, object: GameObjectHandle, message: M) -> usize {
        let Some(message_type) = self.message_type::<M>() else {
            return 0;
        };
        let handled = self.broadcast(object, message_type, &message, 0);
        self.apply_commands();
        handled
    }

    /// Like [`Self::send_to_object`], then the subtree depth first.
    pub fn send_recursive<M: Message>(&mut self, object: GameObjectHandle, message: M) -> usize {
        let Some(message_type) = self.message_type::<M>() else {
            return 0;
        };
        let mut handled = 0;
        for node in self.objects.subtree_pre_order(object) {
            handled += self.broadcast(node, message_type, &message, 0);
        }
        self.apply_commands();
        handled
    }

    /// Queues a message for the `NextFrame` drain once `delay` of simulated
    /// time has passed.
    pub fn post<M: Message>(&mut self, target: impl Into<MessageTarget>, message: M, delay: Duration) -> bool {
        self.post_to_queue(target, message, delay, MessageQueue::NextFrame)
    }

    /// Queues a message for a specific drain point.
    pub fn post_to_queue<M: Message>(
        &mut self,
        target: impl Into<MessageTarget>,
        message: M,
        delay: Duration,
        queue: MessageQueue,
    ) -> bool {
        self.enqueue(target.into(), PostedMessage::new(message), delay, queue, 0)
    }

    /// Messages waiting in all queues.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.router.total_len()
    }

    fn message_type<M: Message>(&self) -> Option<MessageTypeId> {
        let id = self.registry.message_type_id::<M>();
        if id.is_none() {
            tracing::debug!(message = type_name::<M>(), "unregistered message type dropped");
            self.report(Diagnostic::MessageDropped {
                message: type_name::<M>(),
                reason: DropReason::Unregistered,
            });
        }
        id
    }

    pub(super) fn enqueue(
        &mut self,
        target: MessageTarget,
        message: PostedMessage,
        delay: Duration,
        queue: MessageQueue,
        depth: u32,
    ) -> bool {
        if depth > self.config.max_repost_depth {
            tracing::warn!(message = message.type_name, depth, "repost limit exceeded, message dropped");
            self.report(Diagnostic::RepostLimitExceeded {
                message: message.type_name,
                depth,
            });
            return false;
        }
        let Some(message_type) = self.registry.message_id_of(message.type_id) else {
            tracing::debug!(message = message.type_name, "unregistered message type dropped");
            self.report(Diagnostic::MessageDropped {
                message: message.type_name,
                reason: DropReason::Unregistered,
            });
            return false;
        };
        let due = self.clock.now().saturating_add(delay);
        self.router
            .push(queue, due, target, message_type, message.type_name, message.payload, depth);
        true
    }

    /// Runs the handler of `target` for one message.
    pub(super) fn deliver(
        &mut self,
        target: ComponentHandle,
        message_type: MessageTypeId,
        payload: &dyn Any,
        depth: u32,
    ) -> bool {
        let Some(handler) = self.registry.handler(target.component_type(), message_type) else {
            return false;
        };
        let Some(storage) = self.storages.get_mut(usize::from(target.component_type().0)) else {
            return false;
        };
        let Some((owner, state, component)) = storage.get_dyn_mut(target) else {
            tracing::debug!(?target, "message to stale component ignored");
            return false;
        };
        if matches!(state, ComponentState::Inert | ComponentState::Deinitialized) {
            return false;
        }
        let mut ctx = ComponentContext::new(owner, target, &self.objects, &self.clock, &mut self.commands, depth);
        handler(component, payload, &mut ctx);
        true
    }

    pub(super) fn broadcast(
        &mut self,
        object: GameObjectHandle,
        message_type: MessageTypeId,
        payload: &dyn Any,
        depth: u32,
    ) -> usize {
        let components: SmallVec<[ComponentHandle; 8]> = self.components(object).iter().copied().collect();
        components
            .into_iter()
            .filter(|&component| self.deliver(component, message_type, payload, depth))
            .count()
    }

    // =========================================================================
    // Modules
    // =========================================================================

    /// The module of type `M`, started on first request.
    ///
    /// Inert modules are returned too; check [`Self::module_state`] when it
    /// matters. `None` if `M` is unregistered or currently running.
    pub fn get_module<M: WorldModule>(&mut self) -> Option<&mut M> {
        let id = self.registry.module_type_id::<M>()?;
        if matches!(self.modules.state(id), ModuleState::Unstarted | ModuleState::Destroyed) {
            // A failed startup leaves the instance inert but reachable
            let _ = self.start_module(id);
        }
        self.modules.slot_mut(id)?.instance.as_mut()?.downcast_mut::<M>()
    }

    /// The module of type `M` if it already exists.
    #[must_use]
    pub fn try_module<M: WorldModule>(&self) -> Option<&M> {
        let id = self.registry.module_type_id::<M>()?;
        self.modules.slot(id)?.instance.as_ref()?.downcast_ref::<M>()
    }

    /// Lifecycle state of module `M`.
    #[must_use]
    pub fn module_state<M: WorldModule>(&self) -> ModuleState {
        self.registry
            .module_type_id::<M>()
            .map_or(ModuleState::Unstarted, |id| self.modules.state(id))
    }

    /// Restarts module `M` in place; starts it if it never ran. An inert
    /// module gets another `startup` attempt.
    ///
    /// # Errors
    ///
    /// Returns the `reinit` failure (the module is inert afterwards), or
    /// [`ModuleError::Busy`] if the module is running.
    pub fn reinit_module<M: WorldModule>(&mut self) -> Result<(), ModuleError> {
        let id = self
            .registry
            .module_type_id::<M>()
            .ok_or(ModuleError::Unregistered(type_name::<M>()))?;
        let name = self.module_name(id);
        let was_active = match self.modules.state(id) {
            ModuleState::Unstarted | ModuleState::Destroyed => return self.start_module(id),
            ModuleState::ShuttingDown => return Err(ModuleError::Busy(name)),
            ModuleState::Active => true,
            ModuleState::Inert => false,
        };
        let mut module = self.modules.take(id).ok_or(ModuleError::Busy(name))?;
        // An inert module never started, so there is nothing to shut down
        let result = if was_active {
            module.reinit(self)
        } else {
            module.startup(self)
        };
        self.finish_startup(id, &result);
        self.modules.restore(id, module);
        self.apply_commands();
        result
    }

    /// Shuts down and frees module `M`. Returns `false` if it was not
    /// running. A later `get_module` creates a fresh instance.
    ///
    /// # Errors
    ///
    /// [`ModuleError::Busy`] if the module is running.
    pub fn delete_module<M: WorldModule>(&mut self) -> Result<bool, ModuleError> {
        let id = self
            .registry
            .module_type_id::<M>()
            .ok_or(ModuleError::Unregistered(type_name::<M>()))?;
        let name = self.module_name(id);
        match self.modules.state(id) {
            ModuleState::Unstarted | ModuleState::Destroyed => return Ok(false),
            ModuleState::ShuttingDown => return Err(ModuleError::Busy(name)),
            ModuleState::Active | ModuleState::Inert => {}
        }
        let module = self.modules.take(id).ok_or(ModuleError::Busy(name))?;
        self.shutdown_module(id, module);
        Ok(true)
    }

    fn module_name(&self, id: ModuleTypeId) -> &'static str {
        self.registry.module(id).map_or("<unregistered>", |info| info.name)
    }

    /// Starts module `id` unless an instance already exists. A module can be
    /// started from inside another module's `startup`.
    pub(super) fn start_module(&mut self, id: ModuleTypeId) -> Result<(), ModuleError> {
        if !matches!(self.modules.state(id), ModuleState::Unstarted | ModuleState::Destroyed) {
            return Ok(());
        }
        let registry = Arc::clone(&self.registry);
        let info = registry
            .module(id)
            .ok_or(ModuleError::Unregistered("<unknown module id>"))?;
        let mut module = (info.factory)();
        // Empty slot while starting: re-entrant requests see a busy module
        self.modules.set_state(id, ModuleState::Active);
        let result = module.startup(self);
        self.finish_startup(id, &result);
        self.modules.restore(id, module);
        self.apply_commands();
        result
    }

    fn finish_startup(&mut self, id: ModuleTypeId, result: &Result<(), ModuleError>) {
        let name = self.module_name(id);
        match result {
            Ok(()) => {
                tracing::debug!(world = self.id, module = name, "module started");
                self.modules.set_state(id, ModuleState::Active);
                self.modules.record_created(id);
            }
            Err(error) => {
                tracing::error!(world = self.id, module = name, %error, "module startup failed, module is inert");
                self.modules.set_state(id, ModuleState::Inert);
                self.modules.forget(id);
                self.report(Diagnostic::ModuleStartupFailed {
                    module: name,
                    reason: error.to_string(),
                });
            }
        }
    }

    fn shutdown_module(&mut self, id: ModuleTypeId, mut module: Box<dyn WorldModule>) {
        let was_active = self.modules.state(id) == ModuleState::Active;
        self.modules.set_state(id, ModuleState::ShuttingDown);
        if was_active {
            module.shutdown(self);
        }
        self.modules.set_state(id, ModuleState::Destroyed);
        self.modules.forget(id);
        tracing::debug!(world = self.id, module = self.module_name(id), "module shut down");
        drop(module);
        self.apply_commands();
    }

    pub(super) fn notify_modules(&mut self, event: HierarchyEvent) {
        for i in 0..self.observers.len() {
            let id = self.observers[i];
            if self.modules.state(id) != ModuleState::Active {
                continue;
            }
            // A running module does not observe its own changes
            let Some(mut module) = self.modules.take(id) else {
                continue;
            };
            module.on_hierarchy_event(self, &event);
            self.modules.restore(id, module);
        }
    }

    // =========================================================================
    // Clearing
    // =========================================================================

    /// Destroys every object and drops queued messages. Modules stay alive
    /// and are told through [`WorldModule::world_cleared`].
    pub fn clear(&mut self) {
        if self.defer_during_async("clear", || WorldCommand::Clear) {
            return;
        }
        self.destroy_all_objects();
        let mut i = 0;
        while let Some(&id) = self.modules.creation_order().get(i) {
            if let Some(mut module) = self.modules.take(id) {
                module.world_cleared(self);
                self.modules.restore(id, module);
            }
            i += 1;
        }
        self.apply_commands();
        tracing::info!(world = self.id, "world cleared");
    }

    fn destroy_all_objects(&mut self) {
        let roots: Vec<GameObjectHandle> = self.objects.roots().collect();
        for root in roots {
            let _ = self.destroy_object_impl(root);
        }
        self.apply_commands();
        self.pending_destroys.clear();
        self.pending_init.clear();
        self.router.clear();
        for storage in &mut self.storages {
            storage.flush();
        }
    }

    // =========================================================================
    // Structural changes (no command replay)
    // =========================================================================

    pub(super) fn create_object_impl(&mut self, desc: GameObjectDesc) -> Result<GameObjectHandle, HierarchyError> {
        let parent = desc.parent;
        let handle = self.objects.insert(desc)?;
        self.notify_modules(HierarchyEvent::ObjectCreated(handle));
        if let Some(parent) = parent {
            let message = ChildrenChanged {
                kind: ChildChange::Added,
                parent,
                child: handle,
            };
            self.broadcast(parent, self.builtin.children_changed, &message, 0);
        }
        Ok(handle)
    }

    pub(super) fn destroy_object_impl(&mut self, root: GameObjectHandle) -> Result<(), HierarchyError> {
        self.objects.check(root)?;
        let parent = self.parent(root);
        for object in self.objects.subtree_post_order(root) {
            let components: SmallVec<[ComponentHandle; 8]> = self.components(object).iter().copied().collect();
            for component in components {
                let _ = self.remove_component_impl(component, false);
            }
            self.notify_modules(HierarchyEvent::ObjectDestroyed(object));
            self.objects.remove(object);
        }
        self.pending_destroys.retain(|h| self.objects.contains(*h));
        if let Some(parent) = parent {
            let message = ChildrenChanged {
                kind: ChildChange::Removed,
                parent,
                child: root,
            };
            self.broadcast(parent, self.builtin.children_changed, &message, 0);
        }
        Ok(())
    }

    pub(super) fn set_parent_impl(
        &mut self,
        child: GameObjectHandle,
        parent: Option<GameObjectHandle>,
        preserve: ParentPreserve,
    ) -> Result<(), HierarchyError> {
        let outcome = self.objects.set_parent(child, parent, preserve)?;
        if !outcome.changed {
            return Ok(());
        }
        if let Some(old) = outcome.old_parent {
            let unlinked = ParentChanged {
                kind: ParentChange::Unlinked,
                parent: old,
            };
            self.broadcast(child, self.builtin.parent_changed, &unlinked, 0);
            let removed = ChildrenChanged {
                kind: ChildChange::Removed,
                parent: old,
                child,
            };
            self.broadcast(old, self.builtin.children_changed, &removed, 0);
        }
        if let Some(new) = parent {
            let linked = ParentChanged {
                kind: ParentChange::Linked,
                parent: new,
            };
            self.broadcast(child, self.builtin.parent_changed, &linked, 0);
            let added = ChildrenChanged {
                kind: ChildChange::Added,
                parent: new,
                child,
            };
            self.broadcast(new, self.builtin.children_changed, &added, 0);
        }
        self.apply_activity(outcome.activity);
        self.notify_modules(HierarchyEvent::ParentChanged {
            child,
            old_parent: outcome.old_parent,
            new_parent: parent,
        });
        Ok(())
    }

    pub(super) fn set_active_impl(&mut self, object: GameObjectHandle, active: bool) -> Result<(), HierarchyError> {
        self.objects.check(object)?;
        let changes = self.objects.set_active(object, active);
        self.apply_activity(changes);
        Ok(())
    }

    fn apply_activity(&mut self, changes: Vec<(GameObjectHandle, bool)>) {
        for (object, active) in changes {
            let components: SmallVec<[ComponentHandle; 8]> = self.components(object).iter().copied().collect();
            for component in components {
                if let Some(storage) = self.storages.get_mut(usize::from(component.component_type().0)) {
                    storage.set_active(component, active);
                }
            }
            self.notify_modules(HierarchyEvent::ActiveChanged { object, active });
        }
    }

    pub(super) fn add_boxed_impl(&mut self, owner: GameObjectHandle, component: Box<dyn Component>) -> WorldResult<ComponentHandle> {
        self.objects.check(owner)?;
        let name = component.type_name();
        let type_id = self
            .registry
            .component_id_of((*component).as_any().type_id())
            .ok_or(ComponentError::Unregistered(name))?;
        let storage = self
            .storages
            .get_mut(usize::from(type_id.0))
            .ok_or(ComponentError::Unregistered(name))?;
        let handle = storage
            .insert_boxed(owner, component)
            .map_err(|_| ComponentError::TypeMismatch { expected: name })?;
        self.attach(owner, handle);
        Ok(handle)
    }

    fn attach(&mut self, owner: GameObjectHandle, component: ComponentHandle) {
        let active = self.objects.get(owner).is_some_and(GameObject::is_active);
        if let Some(storage) = self.storages.get_mut(usize::from(component.component_type().0)) {
            storage.set_active(component, active);
        }
        self.objects.attach_component(owner, component);
        self.pending_init.push(component);

        let message = ComponentsChanged {
            kind: ComponentChange::Added,
            owner,
            component,
        };
        self.broadcast(owner, self.builtin.components_changed, &message, 0);
        self.notify_modules(HierarchyEvent::ComponentAdded { owner, component });
    }

    pub(super) fn remove_component_impl(&mut self, component: ComponentHandle, notify: bool) -> Result<(), ComponentError> {
        let Some(storage) = self.storages.get_mut(usize::from(component.component_type().0)) else {
            return Err(ComponentError::StaleHandle(component));
        };
        let Some((owner, state, value)) = storage.get_dyn_mut(component) else {
            tracing::debug!(?component, "remove_component with stale handle ignored");
            return Err(ComponentError::StaleHandle(component));
        };
        if state == ComponentState::Initialized {
            let mut ctx = ComponentContext::new(owner, component, &self.objects, &self.clock, &mut self.commands, 0);
            value.deinitialize(&mut ctx);
        }
        storage.set_state(component, ComponentState::Deinitialized);
        storage.defer_destroy_dyn(component);
        self.objects.detach_component(owner, component);

        if notify {
            let message = ComponentsChanged {
                kind: ComponentChange::Removed,
                owner,
                component,
            };
            self.broadcast(owner, self.builtin.components_changed, &message, 0);
            self.notify_modules(HierarchyEvent::ComponentRemoved { owner, component });
        }
        Ok(())
    }

    /// Runs `initialize` on every component added since the last call.
    pub(super) fn initialize_pending(&mut self) -> usize {
        let mut initialized = 0;
        while !self.pending_init.is_empty() {
            for component in std::mem::take(&mut self.pending_init) {
                let Some(storage) = self.storages.get_mut(usize::from(component.component_type().0)) else {
                    continue;
                };
                let Some((owner, state, value)) = storage.get_dyn_mut(component) else {
                    continue;
                };
                if state != ComponentState::Uninitialized {
                    continue;
                }
                let mut ctx = ComponentContext::new(owner, component, &self.objects, &self.clock, &mut self.commands, 0);
                let result = value.initialize(&mut ctx);
                let type_name = value.type_name();
                let state = match result {
                    Ok(()) => {
                        initialized += 1;
                        ComponentState::Initialized
                    }
                    Err(error) => {
                        tracing::error!(?component, component_type = type_name, %error, "component initialization failed, component is inert");
                        self.diagnostics.report(Diagnostic::ComponentInitFailed {
                            component,
                            type_name,
                            reason: error.to_string(),
                        });
                        ComponentState::Inert
                    }
                };
                storage.set_state(component, state);
            }
            // Components added by initializers are handled in the next round
            self.apply_commands();
        }
        initialized
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Replays every queued command, including those queued while replaying.
    pub(super) fn apply_commands(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let batch = self.commands.take();
            if batch.is_empty() {
                break;
            }
            for command in batch {
                self.apply_command(command);
                applied += 1;
            }
        }
        self.commands_applied += applied;
        applied
    }

    /// Replays commands sent from async tasks.
    pub(super) fn apply_async_commands(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.async_commands.try_recv() {
            self.apply_command(command);
            applied += 1;
        }
        self.commands_applied += applied;
        applied + self.apply_commands()
    }

    fn apply_command(&mut self, command: WorldCommand) {
        let result: WorldResult<()> = match command {
            WorldCommand::CreateObject(desc) => self.create_object_impl(desc).map(drop).map_err(Into::into),
            WorldCommand::DestroyObject(object) => self.destroy_object_impl(object).map_err(Into::into),
            WorldCommand::AddComponent { owner, component } => self.add_boxed_impl(owner, component).map(drop),
            WorldCommand::RemoveComponent(component) => {
                self.remove_component_impl(component, true).map_err(Into::into)
            }
            WorldCommand::SetParent {
                child,
                parent,
                preserve,
            } => self.set_parent_impl(child, parent, preserve).map_err(Into::into),
            WorldCommand::SetGlobalKey(object, key) => self.objects.set_global_key(object, key).map_err(Into::into),
            WorldCommand::SetLocalTransform(object, local) => {
                self.objects.set_local_transform(object, local);
                Ok(())
            }
            WorldCommand::SetActive(object, active) => self.set_active_impl(object, active).map_err(Into::into),
            WorldCommand::Post {
                target,
                message,
                delay,
                queue,
                depth,
            } => {
                self.enqueue(target, message, delay, queue, depth);
                Ok(())
            }
            WorldCommand::Load(bytes) => self.load_bytes(&bytes).map(drop),
            WorldCommand::Clear => {
                self.clear();
                Ok(())
            }
        };
        if let Err(error) = result {
            tracing::warn!(%error, "queued command rejected");
        }
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("objects", &self.objects.len())
            .field("frame", &self.frame)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.phase = FramePhase::Idle;
        self.destroy_all_objects();
        // Reverse creation order: dependents go before their dependencies
        while let Some(&id) = self.modules.creation_order().last() {
            match self.modules.take(id) {
                Some(module) => self.shutdown_module(id, module),
                None => self.modules.forget(id),
            }
        }
        tracing::info!(world = self.id, name = %self.config.name, "world destroyed");
    }
}
