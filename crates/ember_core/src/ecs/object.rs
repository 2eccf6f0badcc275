//! # Game Objects and the Hierarchy
//!
//! A game object is a node in the world's parent/child tree. It carries a
//! local transform, a lazily recomputed world transform, and the handles of
//! the components attached to it.
//!
//! ## Dirty Transforms
//!
//! World transforms are only recomputed when read. The table keeps one
//! invariant: **a clean node only has clean ancestors**. Marking a node dirty
//! therefore stops at nodes that are already dirty, and a read walks up to
//! the first clean ancestor and composes back down, caching every level.

use std::collections::HashMap;

use ember_shared::Transform;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use smallvec::SmallVec;

use super::component::ComponentHandle;
use super::handle::{Handle, HandleTable};
use crate::error::HierarchyError;

/// Handle to a game object. The tag is the owning world's id.
pub type GameObjectHandle = Handle<GameObject>;

/// Seed used when the config leaves `seed` at 0.
const DEFAULT_ID_SEED: u64 = 0x454d_4245_525f_4944;

/// How a re-parent treats the object's transform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParentPreserve {
    /// Keep the local transform; the world transform follows the new parent.
    #[default]
    KeepLocal,
    /// Keep the world transform; the local transform is recomputed.
    KeepGlobal,
}

/// Everything needed to create a game object.
#[derive(Clone, Debug, PartialEq)]
pub struct GameObjectDesc {
    /// Display name.
    pub name: String,
    /// Parent, if any.
    pub parent: Option<GameObjectHandle>,
    /// Local transform.
    pub local: Transform,
    /// Own active flag.
    pub active: bool,
    /// Dynamic objects may move every frame. Forced on under a dynamic parent.
    pub dynamic: bool,
    /// Stable id. `0` generates one.
    pub persistent_id: u64,
    /// Unique lookup key.
    pub global_key: Option<String>,
}

impl Default for GameObjectDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            parent: None,
            local: Transform::IDENTITY,
            active: true,
            dynamic: false,
            persistent_id: 0,
            global_key: None,
        }
    }
}

impl GameObjectDesc {
    /// Creates a description with a name and defaults for the rest.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the parent.
    #[must_use]
    pub fn with_parent(mut self, parent: GameObjectHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets the local transform.
    #[must_use]
    pub fn with_transform(mut self, local: Transform) -> Self {
        self.local = local;
        self
    }

    /// Sets the local position.
    #[must_use]
    pub fn with_position(mut self, position: ember_shared::Vec3) -> Self {
        self.local.position = position;
        self
    }

    /// Marks the object dynamic.
    #[must_use]
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Creates the object inactive.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Sets the persistent id.
    #[must_use]
    pub fn with_persistent_id(mut self, id: u64) -> Self {
        self.persistent_id = id;
        self
    }

    /// Sets the global key.
    #[must_use]
    pub fn with_global_key(mut self, key: impl Into<String>) -> Self {
        self.global_key = Some(key.into());
        self
    }
}

/// Outcome of a successful re-parent.
#[derive(Debug, Default)]
pub(crate) struct Reparented {
    /// False if the object already had the requested parent.
    pub changed: bool,
    pub old_parent: Option<GameObjectHandle>,
    /// Objects whose effective active state flipped.
    pub activity: Vec<(GameObjectHandle, bool)>,
}

/// A node in the world hierarchy.
#[derive(Clone, Debug)]
pub struct GameObject {
    handle: GameObjectHandle,
    name: String,
    local: Transform,
    world: Transform,
    dirty: bool,
    parent: GameObjectHandle,
    children: SmallVec<[GameObjectHandle; 4]>,
    components: SmallVec<[ComponentHandle; 4]>,
    active: bool,
    active_state: bool,
    dynamic: bool,
    persistent_id: u64,
    global_key: Option<String>,
}

impl GameObject {
    /// Handle of this object.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> GameObjectHandle {
        self.handle
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local transform.
    #[inline]
    #[must_use]
    pub fn local_transform(&self) -> &Transform {
        &self.local
    }

    /// Cached world transform; may be stale while [`Self::is_transform_dirty`].
    #[inline]
    #[must_use]
    pub fn cached_world_transform(&self) -> &Transform {
        &self.world
    }

    /// True if the cached world transform needs recomputing.
    #[inline]
    #[must_use]
    pub fn is_transform_dirty(&self) -> bool {
        self.dirty
    }

    /// Parent handle, if any.
    #[must_use]
    pub fn parent(&self) -> Option<GameObjectHandle> {
        (!self.parent.is_null()).then_some(self.parent)
    }

    /// Children in attachment order.
    #[must_use]
    pub fn children(&self) -> &[GameObjectHandle] {
        &self.children
    }

    /// Components in attachment order.
    #[must_use]
    pub fn components(&self) -> &[ComponentHandle] {
        &self.components
    }

    /// Own active flag.
    #[must_use]
    pub fn is_active_flag_set(&self) -> bool {
        self.active
    }

    /// Effective active state: own flag and every ancestor's flag.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active_state
    }

    /// True for dynamic objects.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Stable cross-session id.
    #[must_use]
    pub fn persistent_id(&self) -> u64 {
        self.persistent_id
    }

    /// Global key, if set.
    #[must_use]
    pub fn global_key(&self) -> Option<&str> {
        self.global_key.as_deref()
    }
}

/// All game objects of one world plus their lookup indices.
#[derive(Debug)]
pub struct ObjectTable {
    objects: HandleTable<GameObject>,
    by_key: HashMap<String, GameObjectHandle>,
    by_persistent_id: HashMap<u64, GameObjectHandle>,
    id_rng: ChaCha8Rng,
    world_id: u16,
}

impl ObjectTable {
    /// Creates an empty table for world `world_id`.
    #[must_use]
    pub fn new(world_id: u16, capacity: usize, seed: u64) -> Self {
        let seed = if seed == 0 { DEFAULT_ID_SEED } else { seed };
        Self {
            objects: HandleTable::with_capacity(world_id, capacity),
            by_key: HashMap::new(),
            by_persistent_id: HashMap::with_capacity(capacity),
            id_rng: ChaCha8Rng::seed_from_u64(seed),
            world_id,
        }
    }

    /// Id of the owning world.
    #[must_use]
    pub fn world_id(&self) -> u16 {
        self.world_id
    }

    /// Number of live objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if there are no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Resolves a handle.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: GameObjectHandle) -> Option<&GameObject> {
        self.objects.resolve(handle)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, handle: GameObjectHandle) -> Option<&mut GameObject> {
        self.objects.resolve_mut(handle)
    }

    /// True if the handle resolves.
    #[must_use]
    pub fn contains(&self, handle: GameObjectHandle) -> bool {
        self.objects.contains(handle)
    }

    /// Iterates objects in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (GameObjectHandle, &GameObject)> + '_ {
        self.objects.iter()
    }

    /// Objects without a parent, in slot order.
    pub fn roots(&self) -> impl Iterator<Item = GameObjectHandle> + '_ {
        self.objects
            .iter()
            .filter(|(_, object)| object.parent.is_null())
            .map(|(handle, _)| handle)
    }

    /// Looks up an object by global key.
    #[must_use]
    pub fn find_by_global_key(&self, key: &str) -> Option<GameObjectHandle> {
        self.by_key.get(key).copied()
    }

    /// Looks up an object by persistent id.
    #[must_use]
    pub fn find_by_persistent_id(&self, id: u64) -> Option<GameObjectHandle> {
        self.by_persistent_id.get(&id).copied()
    }

    /// Cached world transform, without recomputing.
    #[must_use]
    pub fn cached_world_transform(&self, handle: GameObjectHandle) -> Option<Transform> {
        self.get(handle).map(|object| object.world)
    }

    /// Checks that `handle` belongs to this world and resolves.
    pub fn check(&self, handle: GameObjectHandle) -> Result<(), HierarchyError> {
        if !handle.is_null() && handle.tag() != self.world_id {
            return Err(HierarchyError::ForeignHandle {
                handle,
                owner: handle.tag(),
                world: self.world_id,
            });
        }
        if !self.objects.contains(handle) {
            return Err(HierarchyError::StaleHandle(handle));
        }
        Ok(())
    }

    /// True if `ancestor` is `node` or one of its ancestors.
    #[must_use]
    pub fn is_ancestor_or_self(&self, ancestor: GameObjectHandle, node: GameObjectHandle) -> bool {
        let mut current = node;
        while let Some(object) = self.get(current) {
            if current == ancestor {
                return true;
            }
            current = object.parent;
        }
        false
    }

    /// The object and all its descendants, parents before children.
    #[must_use]
    pub fn subtree_pre_order(&self, root: GameObjectHandle) -> Vec<GameObjectHandle> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(handle) = stack.pop() {
            let Some(object) = self.get(handle) else {
                continue;
            };
            out.push(handle);
            stack.extend(object.children.iter().rev().copied());
        }
        out
    }

    /// The object and all its descendants, children before parents.
    #[must_use]
    pub fn subtree_post_order(&self, root: GameObjectHandle) -> Vec<GameObjectHandle> {
        let mut out = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((handle, expanded)) = stack.pop() {
            let Some(object) = self.get(handle) else {
                continue;
            };
            if expanded {
                out.push(handle);
            } else {
                stack.push((handle, true));
                stack.extend(object.children.iter().rev().map(|&c| (c, false)));
            }
        }
        out
    }

    /// Inserts a new object. The parent, if any, must already be checked.
    pub(crate) fn insert(&mut self, desc: GameObjectDesc) -> Result<GameObjectHandle, HierarchyError> {
        let parent = match desc.parent {
            Some(parent) => {
                self.check(parent)?;
                parent
            }
            None => GameObjectHandle::NULL,
        };
        if let Some(key) = &desc.global_key {
            if self.by_key.contains_key(key) {
                return Err(HierarchyError::DuplicateGlobalKey(key.clone()));
            }
        }
        let persistent_id = if desc.persistent_id == 0 {
            self.generate_persistent_id()
        } else if self.by_persistent_id.contains_key(&desc.persistent_id) {
            return Err(HierarchyError::DuplicatePersistentId(desc.persistent_id));
        } else {
            desc.persistent_id
        };

        let (parent_dynamic, parent_active) = self
            .get(parent)
            .map_or((false, true), |p| (p.dynamic, p.active_state));

        let handle = self.objects.allocate(GameObject {
            handle: GameObjectHandle::NULL,
            name: desc.name,
            local: desc.local,
            world: desc.local,
            dirty: true,
            parent,
            children: SmallVec::new(),
            components: SmallVec::new(),
            active: desc.active,
            active_state: desc.active && parent_active,
            dynamic: desc.dynamic || parent_dynamic,
            persistent_id,
            global_key: desc.global_key.clone(),
        });
        if let Some(object) = self.objects.resolve_mut(handle) {
            object.handle = handle;
        }
        if let Some(parent) = self.objects.resolve_mut(parent) {
            parent.children.push(handle);
        }
        if let Some(key) = desc.global_key {
            self.by_key.insert(key, handle);
        }
        self.by_persistent_id.insert(persistent_id, handle);
        Ok(handle)
    }

    /// Removes one object, unlinking it from its parent.
    ///
    /// Children must already be gone.
    pub(crate) fn remove(&mut self, handle: GameObjectHandle) -> Option<GameObject> {
        let object = self.objects.deallocate(handle)?;
        debug_assert!(object.children.is_empty(), "object removed before its children");
        if let Some(parent) = self.objects.resolve_mut(object.parent) {
            parent.children.retain(|c| *c != handle);
        }
        if let Some(key) = &object.global_key {
            self.by_key.remove(key);
        }
        self.by_persistent_id.remove(&object.persistent_id);
        Some(object)
    }

    /// Moves `child` under `parent` (or to the root when `None`).
    ///
    /// Nothing changes on error.
    pub(crate) fn set_parent(
        &mut self,
        child: GameObjectHandle,
        parent: Option<GameObjectHandle>,
        preserve: ParentPreserve,
    ) -> Result<Reparented, HierarchyError> {
        self.check(child)?;
        let new_parent = parent.unwrap_or(GameObjectHandle::NULL);
        if let Some(parent) = parent {
            self.check(parent)?;
            if self.is_ancestor_or_self(child, parent) {
                return Err(HierarchyError::Cycle { child, parent });
            }
            let child_dynamic = self.get(child).is_some_and(|c| c.dynamic);
            let parent_dynamic = self.get(parent).is_some_and(|p| p.dynamic);
            if parent_dynamic && !child_dynamic {
                return Err(HierarchyError::StaticUnderDynamic { child, parent });
            }
        }

        let old_parent = self.get(child).map_or(GameObjectHandle::NULL, |c| c.parent);
        if old_parent == new_parent {
            return Ok(Reparented::default());
        }

        if preserve == ParentPreserve::KeepGlobal {
            let world = self.world_transform(child).unwrap_or_default();
            let parent_world = self.world_transform(new_parent).unwrap_or_default();
            if let Some(object) = self.get_mut(child) {
                object.local = world.relative_to(&parent_world);
            }
        }

        if let Some(old) = self.get_mut(old_parent) {
            old.children.retain(|c| *c != child);
        }
        if let Some(new) = self.get_mut(new_parent) {
            new.children.push(child);
        }
        if let Some(object) = self.get_mut(child) {
            object.parent = new_parent;
        }
        self.mark_dirty(child);
        let activity = self.refresh_active_state(child);
        Ok(Reparented {
            changed: true,
            old_parent: (!old_parent.is_null()).then_some(old_parent),
            activity,
        })
    }

    /// Overwrites the local transform and dirties the subtree.
    pub(crate) fn set_local_transform(&mut self, handle: GameObjectHandle, local: Transform) -> bool {
        let Some(object) = self.get_mut(handle) else {
            return false;
        };
        object.local = local;
        self.mark_dirty(handle);
        true
    }

    /// Marks the subtree's world transforms dirty.
    ///
    /// O(1) when the node is already dirty.
    pub(crate) fn mark_dirty(&mut self, handle: GameObjectHandle) {
        let mut stack: SmallVec<[GameObjectHandle; 16]> = SmallVec::new();
        stack.push(handle);
        while let Some(current) = stack.pop() {
            let Some(object) = self.get_mut(current) else {
                continue;
            };
            if object.dirty {
                continue;
            }
            object.dirty = true;
            stack.extend(object.children.iter().copied());
        }
    }

    /// Returns the world transform, recomputing dirty ancestors first.
    pub fn world_transform(&mut self, handle: GameObjectHandle) -> Option<Transform> {
        let object = self.get(handle)?;
        if !object.dirty {
            return Some(object.world);
        }

        // Walk up to the first clean ancestor
        let mut chain: SmallVec<[GameObjectHandle; 16]> = SmallVec::new();
        let mut parent_world = Transform::IDENTITY;
        let mut current = handle;
        while let Some(object) = self.get(current) {
            if !object.dirty {
                parent_world = object.world;
                break;
            }
            chain.push(current);
            current = object.parent;
        }

        // Compose back down, caching every level
        for &node in chain.iter().rev() {
            if let Some(object) = self.get_mut(node) {
                object.world = parent_world.mul_transform(&object.local);
                object.dirty = false;
                parent_world = object.world;
            }
        }
        Some(parent_world)
    }

    /// Recomputes every dirty world transform. Returns how many were updated.
    pub(crate) fn propagate_transforms(&mut self) -> usize {
        let dirty: Vec<GameObjectHandle> = self
            .objects
            .iter()
            .filter(|(_, object)| object.dirty)
            .map(|(handle, _)| handle)
            .collect();
        for &handle in &dirty {
            self.world_transform(handle);
        }
        dirty.len()
    }

    /// Sets the own active flag. Returns every object whose effective state
    /// changed.
    pub(crate) fn set_active(&mut self, handle: GameObjectHandle, active: bool) -> Vec<(GameObjectHandle, bool)> {
        match self.get_mut(handle) {
            Some(object) if object.active != active => object.active = active,
            _ => return Vec::new(),
        }
        self.refresh_active_state(handle)
    }

    /// Recomputes effective active state for a subtree.
    fn refresh_active_state(&mut self, root: GameObjectHandle) -> Vec<(GameObjectHandle, bool)> {
        let mut changed = Vec::new();
        for handle in self.subtree_pre_order(root) {
            let parent_active = self
                .get(handle)
                .and_then(|o| self.get(o.parent))
                .map_or(true, |p| p.active_state);
            if let Some(object) = self.get_mut(handle) {
                let state = object.active && parent_active;
                if state != object.active_state {
                    object.active_state = state;
                    changed.push((handle, state));
                }
            }
        }
        changed
    }

    /// Sets or clears the global key.
    pub(crate) fn set_global_key(
        &mut self,
        handle: GameObjectHandle,
        key: Option<String>,
    ) -> Result<(), HierarchyError> {
        self.check(handle)?;
        if let Some(key) = &key {
            match self.by_key.get(key) {
                Some(&owner) if owner == handle => return Ok(()),
                Some(_) => return Err(HierarchyError::DuplicateGlobalKey(key.clone())),
                None => {}
            }
        }
        let Some(object) = self.get_mut(handle) else {
            return Err(HierarchyError::StaleHandle(handle));
        };
        let old = std::mem::replace(&mut object.global_key, key.clone());
        if let Some(old) = old {
            self.by_key.remove(&old);
        }
        if let Some(key) = key {
            self.by_key.insert(key, handle);
        }
        Ok(())
    }

    pub(crate) fn attach_component(&mut self, owner: GameObjectHandle, component: ComponentHandle) {
        if let Some(object) = self.get_mut(owner) {
            object.components.push(component);
        }
    }

    pub(crate) fn detach_component(&mut self, owner: GameObjectHandle, component: ComponentHandle) {
        if let Some(object) = self.get_mut(owner) {
            object.components.retain(|c| *c != component);
        }
    }

    fn generate_persistent_id(&mut self) -> u64 {
        loop {
            let id = self.id_rng.next_u64();
            if id != 0 && !self.by_persistent_id.contains_key(&id) {
                return id;
            }
        }
    }
}
