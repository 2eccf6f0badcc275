//! # Type Registry
//!
//! Every component, message and module type gets a dense id at registration.
//! The registry also owns:
//! - component descriptors (storage policy, version, update functions)
//! - module descriptors (factory, flags, update functions)
//! - the message handler table, indexed `[component type][message type]`
//!
//! The registry is built once, wrapped in an `Arc` and handed to every world
//! that should know these types.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;

use super::component::{Component, StoragePolicy};
use super::context::{AsyncContext, ComponentContext};
use super::message::{ChildrenChanged, ComponentsChanged, DeleteObject, ParentChanged};
use super::module::WorldModule;
use super::schedule::{UpdateFunction, UpdatePhase};
use super::storage::{ComponentStorage, ErasedStorage};
use crate::error::RegistryError;

/// Dense id of a registered component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub u16);

/// Dense id of a registered message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTypeId(pub u16);

/// Dense id of a registered module type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleTypeId(pub u16);

/// Update function run sequentially with world access through the context.
pub type SyncUpdateFn<C> = fn(&mut C, &mut ComponentContext<'_>);

/// Update function run from an async task against a read-only view.
pub type AsyncUpdateFn<C> = fn(&mut C, &mut AsyncContext<'_>);

/// Type-erased message handler.
pub(crate) type ErasedHandler =
    Box<dyn Fn(&mut dyn Component, &dyn Any, &mut ComponentContext<'_>) + Send + Sync>;

type StorageFactory = fn(ComponentTypeId, StoragePolicy, bool) -> Box<dyn ErasedStorage>;

/// A component update function and its erased function pointer.
pub(crate) struct ComponentUpdate {
    pub function: UpdateFunction,
    /// `SyncUpdateFn<C>` or `AsyncUpdateFn<C>`, depending on the phase.
    pub run: Box<dyn Any + Send + Sync>,
}

/// Describes a component type before registration.
///
/// # Example
///
/// ```rust,ignore
/// registry.register_component(
///     ComponentDescriptor::<Health>::new("Health")
///         .with_default()
///         .update(UpdateFunction::new("regen", UpdatePhase::PreAsync), Health::regen),
/// )?;
/// ```
pub struct ComponentDescriptor<C: Component> {
    name: &'static str,
    version: u32,
    policy: StoragePolicy,
    thread_safe: bool,
    create_default: Option<fn() -> Box<dyn Component>>,
    updates: Vec<ComponentUpdate>,
    _marker: PhantomData<fn() -> C>,
}

impl<C: Component> ComponentDescriptor<C> {
    /// Starts a descriptor. `name` is the stable name written to streams.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            version: 1,
            policy: StoragePolicy::Compact,
            thread_safe: false,
            create_default: None,
            updates: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Sets the serialization version.
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sets the storage policy.
    #[must_use]
    pub fn policy(mut self, policy: StoragePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Declares that instances may be updated from several threads at once.
    #[must_use]
    pub fn thread_safe(mut self) -> Self {
        self.thread_safe = true;
        self
    }

    /// Adds a sequential update function.
    #[must_use]
    pub fn update(mut self, function: UpdateFunction, run: SyncUpdateFn<C>) -> Self {
        self.updates.push(ComponentUpdate {
            function,
            run: Box::new(run),
        });
        self
    }

    /// Adds an async update function. Implies [`Self::thread_safe`].
    #[must_use]
    pub fn async_update(mut self, function: UpdateFunction, run: AsyncUpdateFn<C>) -> Self {
        self.thread_safe = true;
        self.updates.push(ComponentUpdate {
            function: function.in_phase(UpdatePhase::Async),
            run: Box::new(run),
        });
        self
    }
}

impl<C: Component + Default> ComponentDescriptor<C> {
    /// Allows construction by name, needed for deserialization.
    #[must_use]
    pub fn with_default(mut self) -> Self {
        self.create_default = Some(|| -> Box<dyn Component> { Box::new(C::default()) });
        self
    }
}

/// Registered component type.
pub(crate) struct ComponentInfo {
    pub name: &'static str,
    pub version: u32,
    pub policy: StoragePolicy,
    pub thread_safe: bool,
    pub create_default: Option<fn() -> Box<dyn Component>>,
    pub make_storage: StorageFactory,
    pub updates: Vec<ComponentUpdate>,
}

/// Describes a module type before registration.
pub struct ModuleDescriptor<M: WorldModule> {
    name: &'static str,
    always_on: bool,
    observes_hierarchy: bool,
    factory: Box<dyn Fn() -> Box<dyn WorldModule> + Send + Sync>,
    updates: Vec<UpdateFunction>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: WorldModule + Default> ModuleDescriptor<M> {
    /// Starts a descriptor for a default-constructible module.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self::with_factory(name, M::default)
    }
}

impl<M: WorldModule> ModuleDescriptor<M> {
    /// Starts a descriptor with a custom constructor.
    #[must_use]
    pub fn with_factory(name: &'static str, factory: impl Fn() -> M + Send + Sync + 'static) -> Self {
        Self {
            name,
            always_on: false,
            observes_hierarchy: false,
            factory: Box::new(move || -> Box<dyn WorldModule> { Box::new(factory()) }),
            updates: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Creates and starts the module together with every world.
    #[must_use]
    pub fn always_on(mut self) -> Self {
        self.always_on = true;
        self
    }

    /// Delivers [`HierarchyEvent`](crate::HierarchyEvent)s to the module.
    #[must_use]
    pub fn observes_hierarchy(mut self) -> Self {
        self.observes_hierarchy = true;
        self
    }

    /// Adds an update function. The module's `update` (or `update_async`
    /// for the async phase) is called with the function's name.
    #[must_use]
    pub fn update(mut self, function: UpdateFunction) -> Self {
        self.updates.push(function);
        self
    }
}

/// Registered module type.
pub(crate) struct ModuleInfo {
    pub name: &'static str,
    pub always_on: bool,
    pub observes_hierarchy: bool,
    pub factory: Box<dyn Fn() -> Box<dyn WorldModule> + Send + Sync>,
    pub updates: Vec<UpdateFunction>,
}

/// The reflection substitute shared by worlds.
pub struct TypeRegistry {
    components: Vec<ComponentInfo>,
    component_ids: HashMap<TypeId, ComponentTypeId>,
    component_names: HashMap<&'static str, ComponentTypeId>,
    /// Rust type names, indexed by message type id.
    messages: Vec<&'static str>,
    message_ids: HashMap<TypeId, MessageTypeId>,
    modules: Vec<ModuleInfo>,
    module_ids: HashMap<TypeId, ModuleTypeId>,
    module_names: HashMap<&'static str, ModuleTypeId>,
    handlers: Vec<Vec<Option<ErasedHandler>>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Creates a registry holding only the built-in message types.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            components: Vec::new(),
            component_ids: HashMap::new(),
            component_names: HashMap::new(),
            messages: Vec::new(),
            message_ids: HashMap::new(),
            modules: Vec::new(),
            module_ids: HashMap::new(),
            module_names: HashMap::new(),
            handlers: Vec::new(),
        };
        // Built-ins cannot collide in an empty registry
        let _ = registry.register_message::<ParentChanged>();
        let _ = registry.register_message::<ChildrenChanged>();
        let _ = registry.register_message::<ComponentsChanged>();
        let _ = registry.register_message::<DeleteObject>();
        registry
    }

    /// Registers a component type.
    pub fn register_component<C: Component>(
        &mut self,
        descriptor: ComponentDescriptor<C>,
    ) -> Result<ComponentTypeId, RegistryError> {
        if self.component_ids.contains_key(&TypeId::of::<C>())
            || self.component_names.contains_key(descriptor.name)
        {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        for update in &descriptor.updates {
            let is_async = update.function.phase() == UpdatePhase::Async;
            let fits = if is_async {
                update.run.is::<AsyncUpdateFn<C>>()
            } else {
                update.run.is::<SyncUpdateFn<C>>()
            };
            if !fits {
                return Err(RegistryError::InvalidUpdate(update.function.name()));
            }
        }
        let id = ComponentTypeId(
            u16::try_from(self.components.len()).map_err(|_| RegistryError::TooManyTypes(descriptor.name))?,
        );

        self.components.push(ComponentInfo {
            name: descriptor.name,
            version: descriptor.version,
            policy: descriptor.policy,
            thread_safe: descriptor.thread_safe,
            create_default: descriptor.create_default,
            make_storage: make_storage::<C>,
            updates: descriptor.updates,
        });
        self.component_ids.insert(TypeId::of::<C>(), id);
        self.component_names.insert(descriptor.name, id);
        self.handlers.push(Vec::new());
        tracing::debug!(name = descriptor.name, id = id.0, "component type registered");
        Ok(id)
    }

    /// Registers a message type.
    pub fn register_message<M: Any + Send + Sync>(&mut self) -> Result<MessageTypeId, RegistryError> {
        let type_name = type_name::<M>();
        if self.message_ids.contains_key(&TypeId::of::<M>()) {
            return Err(RegistryError::Duplicate(type_name));
        }
        let id = MessageTypeId(
            u16::try_from(self.messages.len()).map_err(|_| RegistryError::TooManyTypes(type_name))?,
        );
        self.messages.push(type_name);
        self.message_ids.insert(TypeId::of::<M>(), id);
        Ok(id)
    }

    /// Registers a handler for message `M` on component `C`.
    ///
    /// Both types must already be registered. A pair has at most one handler.
    pub fn register_handler<C, M>(
        &mut self,
        handler: impl Fn(&mut C, &M, &mut ComponentContext<'_>) + Send + Sync + 'static,
    ) -> Result<(), RegistryError>
    where
        C: Component,
        M: Any + Send + Sync,
    {
        let component = self
            .component_type_id::<C>()
            .ok_or(RegistryError::UnknownComponent(type_name::<C>()))?;
        let message = self
            .message_type_id::<M>()
            .ok_or(RegistryError::UnknownMessage(type_name::<M>()))?;

        let row = &mut self.handlers[usize::from(component.0)];
        let column = usize::from(message.0);
        if row.len() <= column {
            row.resize_with(column + 1, || None);
        }
        if row[column].is_some() {
            return Err(RegistryError::Duplicate(type_name::<M>()));
        }
        row[column] = Some(Box::new(
            move |component: &mut dyn Component, payload: &dyn Any, ctx: &mut ComponentContext<'_>| {
                if let (Some(component), Some(message)) =
                    (component.downcast_mut::<C>(), payload.downcast_ref::<M>())
                {
                    handler(component, message, ctx);
                }
            },
        ));
        Ok(())
    }

    /// Registers a module type.
    pub fn register_module<M: WorldModule>(
        &mut self,
        descriptor: ModuleDescriptor<M>,
    ) -> Result<ModuleTypeId, RegistryError> {
        if self.module_ids.contains_key(&TypeId::of::<M>()) || self.module_names.contains_key(descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        let id = ModuleTypeId(
            u16::try_from(self.modules.len()).map_err(|_| RegistryError::TooManyTypes(descriptor.name))?,
        );
        self.modules.push(ModuleInfo {
            name: descriptor.name,
            always_on: descriptor.always_on,
            observes_hierarchy: descriptor.observes_hierarchy,
            factory: descriptor.factory,
            updates: descriptor.updates,
        });
        self.module_ids.insert(TypeId::of::<M>(), id);
        self.module_names.insert(descriptor.name, id);
        tracing::debug!(name = descriptor.name, id = id.0, "module type registered");
        Ok(id)
    }

    /// Id of component type `C`.
    #[must_use]
    pub fn component_type_id<C: Component>(&self) -> Option<ComponentTypeId> {
        self.component_ids.get(&TypeId::of::<C>()).copied()
    }

    /// Id of the component type registered under `name`.
    #[must_use]
    pub fn component_type_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.component_names.get(name).copied()
    }

    /// Registered name of a component type.
    #[must_use]
    pub fn component_name(&self, id: ComponentTypeId) -> Option<&'static str> {
        self.component(id).map(|info| info.name)
    }

    /// Registered version of a component type.
    #[must_use]
    pub fn component_version(&self, id: ComponentTypeId) -> Option<u32> {
        self.component(id).map(|info| info.version)
    }

    /// Storage policy of a component type.
    #[must_use]
    pub fn component_policy(&self, id: ComponentTypeId) -> Option<StoragePolicy> {
        self.component(id).map(|info| info.policy)
    }

    /// Number of registered component types.
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Id of message type `M`.
    #[must_use]
    pub fn message_type_id<M: Any>(&self) -> Option<MessageTypeId> {
        self.message_ids.get(&TypeId::of::<M>()).copied()
    }

    /// Rust type name of a message type.
    #[must_use]
    pub fn message_name(&self, id: MessageTypeId) -> Option<&'static str> {
        self.messages.get(usize::from(id.0)).copied()
    }

    /// Number of registered message types, built-ins included.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Id of module type `M`.
    #[must_use]
    pub fn module_type_id<M: WorldModule>(&self) -> Option<ModuleTypeId> {
        self.module_ids.get(&TypeId::of::<M>()).copied()
    }

    /// Number of registered module types.
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Creates a default instance of a component type, if it allows that.
    #[must_use]
    pub fn create_default(&self, id: ComponentTypeId) -> Option<Box<dyn Component>> {
        self.component(id).and_then(|info| info.create_default).map(|create| create())
    }

    /// True if component type `component` handles message type `message`.
    #[must_use]
    pub fn has_handler(&self, component: ComponentTypeId, message: MessageTypeId) -> bool {
        self.handler(component, message).is_some()
    }

    pub(crate) fn handler(&self, component: ComponentTypeId, message: MessageTypeId) -> Option<&ErasedHandler> {
        self.handlers
            .get(usize::from(component.0))?
            .get(usize::from(message.0))?
            .as_ref()
    }

    pub(crate) fn component_id_of(&self, type_id: TypeId) -> Option<ComponentTypeId> {
        self.component_ids.get(&type_id).copied()
    }

    pub(crate) fn message_id_of(&self, type_id: TypeId) -> Option<MessageTypeId> {
        self.message_ids.get(&type_id).copied()
    }

    pub(crate) fn component(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.components.get(usize::from(id.0))
    }

    pub(crate) fn components(&self) -> impl Iterator<Item = (ComponentTypeId, &ComponentInfo)> + '_ {
        self.components
            .iter()
            .enumerate()
            .map(|(i, info)| (ComponentTypeId(i as u16), info))
    }

    pub(crate) fn module(&self, id: ModuleTypeId) -> Option<&ModuleInfo> {
        self.modules.get(usize::from(id.0))
    }

    pub(crate) fn modules(&self) -> impl Iterator<Item = (ModuleTypeId, &ModuleInfo)> + '_ {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, info)| (ModuleTypeId(i as u16), info))
    }
}

fn make_storage<C: Component>(
    id: ComponentTypeId,
    policy: StoragePolicy,
    thread_safe: bool,
) -> Box<dyn ErasedStorage> {
    Box::new(ComponentStorage::<C>::new(id, policy, thread_safe))
}
