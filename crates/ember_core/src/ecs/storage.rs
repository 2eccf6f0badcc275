//! # Component Storage
//!
//! One storage per component type. Handles resolve through a generation
//! checked lookup table to the entry's current position.
//!
//! ## Policies
//!
//! - **Compact**: entries live in one dense `Vec`. Removing an entry moves
//!   the last one into the hole and patches its lookup slot. Iteration is
//!   cache friendly; positions are not stable.
//! - **Stable**: entries live in fixed blocks of [`STABLE_BLOCK_SIZE`] and
//!   never move. Freed slots are reused LIFO.
//!
//! ## Deferred Removal
//!
//! `defer_destroy` invalidates the handle immediately but keeps the entry
//! (flagged) until `flush_removals`, so a removal requested mid-iteration
//! never tears the collection.

use std::any::Any;

use downcast_rs::{impl_downcast, Downcast};

use super::clock::Clock;
use super::command::CommandBuffer;
use super::component::{Component, ComponentHandle, ComponentState, StoragePolicy};
use super::context::{AsyncContext, ComponentContext};
use super::handle::{Handle, HandleTable};
use super::object::{GameObjectHandle, ObjectTable};
use super::registry::{AsyncUpdateFn, ComponentTypeId, SyncUpdateFn};
use super::view::WorldView;
use crate::task::Task;

/// Entries per block in stable storage.
pub const STABLE_BLOCK_SIZE: usize = 64;

/// One component instance and its bookkeeping.
#[derive(Debug)]
pub struct Entry<C> {
    handle: Handle<C>,
    owner: GameObjectHandle,
    value: C,
    state: ComponentState,
    active: bool,
    removed: bool,
}

impl<C> Entry<C> {
    /// Handle of this entry.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> Handle<C> {
        self.handle
    }

    /// Owning object.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> GameObjectHandle {
        self.owner
    }

    /// The component.
    #[inline]
    #[must_use]
    pub fn get(&self) -> &C {
        &self.value
    }

    /// The component, mutably.
    #[inline]
    pub fn get_mut(&mut self) -> &mut C {
        &mut self.value
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ComponentState {
        self.state
    }

    /// False while the owner is inactive.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True if update functions should run on this entry.
    #[inline]
    #[must_use]
    pub fn is_updatable(&self) -> bool {
        !self.removed && self.active && self.state == ComponentState::Initialized
    }
}

#[derive(Debug)]
struct StableBlocks<C> {
    blocks: Vec<Box<[Option<Entry<C>>]>>,
    free: Vec<u32>,
    pending: Vec<u32>,
    high_water: u32,
}

impl<C> StableBlocks<C> {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
            pending: Vec::new(),
            high_water: 0,
        }
    }

    fn insert(&mut self, entry: Entry<C>) -> u32 {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                if self.high_water as usize == self.blocks.len() * STABLE_BLOCK_SIZE {
                    let block: Vec<Option<Entry<C>>> = (0..STABLE_BLOCK_SIZE).map(|_| None).collect();
                    self.blocks.push(block.into_boxed_slice());
                }
                self.high_water += 1;
                self.high_water - 1
            }
        };
        if let Some(cell) = self.cell_mut(slot) {
            *cell = Some(entry);
        }
        slot
    }

    fn cell_mut(&mut self, slot: u32) -> Option<&mut Option<Entry<C>>> {
        let slot = slot as usize;
        self.blocks
            .get_mut(slot / STABLE_BLOCK_SIZE)?
            .get_mut(slot % STABLE_BLOCK_SIZE)
    }

    fn get(&self, slot: u32) -> Option<&Entry<C>> {
        let slot = slot as usize;
        self.blocks
            .get(slot / STABLE_BLOCK_SIZE)?
            .get(slot % STABLE_BLOCK_SIZE)?
            .as_ref()
    }

    fn get_mut(&mut self, slot: u32) -> Option<&mut Entry<C>> {
        self.cell_mut(slot)?.as_mut()
    }

    fn take(&mut self, slot: u32) -> Option<Entry<C>> {
        let entry = self.cell_mut(slot)?.take()?;
        self.free.push(slot);
        Some(entry)
    }

    fn clear(&mut self) {
        self.blocks.clear();
        self.free.clear();
        self.pending.clear();
        self.high_water = 0;
    }
}

#[derive(Debug)]
enum Layout<C> {
    Compact(Vec<Entry<C>>),
    Stable(StableBlocks<C>),
}

/// Storage for every instance of component type `C` in one world.
#[derive(Debug)]
pub struct ComponentStorage<C: Component> {
    type_id: ComponentTypeId,
    policy: StoragePolicy,
    thread_safe: bool,
    lookup: HandleTable<u32>,
    layout: Layout<C>,
    pending_removals: usize,
}

impl<C: Component> ComponentStorage<C> {
    /// Creates an empty storage.
    ///
    /// # Arguments
    ///
    /// * `type_id` - Registered id of `C`, stamped into every handle
    /// * `policy` - Compact or stable layout
    /// * `thread_safe` - Whether parallel iteration is allowed
    #[must_use]
    pub fn new(type_id: ComponentTypeId, policy: StoragePolicy, thread_safe: bool) -> Self {
        let layout = match policy {
            StoragePolicy::Compact => Layout::Compact(Vec::new()),
            StoragePolicy::Stable => Layout::Stable(StableBlocks::new()),
        };
        Self {
            type_id,
            policy,
            thread_safe,
            lookup: HandleTable::new(type_id.0),
            layout,
            pending_removals: 0,
        }
    }

    /// Registered type id.
    #[must_use]
    pub fn component_type(&self) -> ComponentTypeId {
        self.type_id
    }

    /// Storage policy.
    #[must_use]
    pub fn policy(&self) -> StoragePolicy {
        self.policy
    }

    /// True if the type was declared thread-update-safe.
    #[must_use]
    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Number of live (not pending-removal) components.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    /// True if there are no live components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// Entries flagged for removal but not yet freed.
    #[must_use]
    pub fn pending_removals(&self) -> usize {
        self.pending_removals
    }

    /// Stores a new, uninitialized component owned by `owner`.
    pub fn create(&mut self, owner: GameObjectHandle, value: C) -> Handle<C> {
        let handle: Handle<C> = self.lookup.allocate(0).cast();
        let entry = Entry {
            handle,
            owner,
            value,
            state: ComponentState::Uninitialized,
            active: true,
            removed: false,
        };
        let position = match &mut self.layout {
            Layout::Compact(entries) => {
                entries.push(entry);
                (entries.len() - 1) as u32
            }
            Layout::Stable(blocks) => blocks.insert(entry),
        };
        if let Some(slot) = self.lookup.resolve_mut(handle.cast()) {
            *slot = position;
        }
        handle
    }

    /// Removes a component immediately and returns it.
    pub fn destroy(&mut self, handle: Handle<C>) -> Option<C> {
        let position = self.lookup.deallocate(handle.cast())?;
        match &mut self.layout {
            Layout::Compact(entries) => {
                let index = position as usize;
                if index >= entries.len() {
                    return None;
                }
                let entry = entries.swap_remove(index);
                if let Some(moved) = entries.get(index) {
                    if let Some(slot) = self.lookup.resolve_mut(moved.handle.cast()) {
                        *slot = position;
                    }
                }
                Some(entry.value)
            }
            Layout::Stable(blocks) => blocks.take(position).map(|entry| entry.value),
        }
    }

    /// Invalidates the handle now; the memory is freed by
    /// [`Self::flush_removals`].
    pub fn defer_destroy(&mut self, handle: Handle<C>) -> bool {
        let Some(position) = self.lookup.deallocate(handle.cast()) else {
            tracing::debug!(?handle, "defer_destroy with stale handle ignored");
            return false;
        };
        match &mut self.layout {
            Layout::Compact(entries) => {
                if let Some(entry) = entries.get_mut(position as usize) {
                    entry.removed = true;
                }
            }
            Layout::Stable(blocks) => {
                if let Some(entry) = blocks.get_mut(position) {
                    entry.removed = true;
                }
                blocks.pending.push(position);
            }
        }
        self.pending_removals += 1;
        true
    }

    /// Frees every entry flagged by [`Self::defer_destroy`].
    pub fn flush_removals(&mut self) -> usize {
        if self.pending_removals == 0 {
            return 0;
        }
        let mut freed = 0;
        match &mut self.layout {
            Layout::Compact(entries) => {
                // Back to front: everything past `index` is already live
                let mut index = entries.len();
                while index > 0 {
                    index -= 1;
                    if !entries[index].removed {
                        continue;
                    }
                    entries.swap_remove(index);
                    freed += 1;
                    if let Some(moved) = entries.get(index) {
                        if let Some(slot) = self.lookup.resolve_mut(moved.handle.cast()) {
                            *slot = index as u32;
                        }
                    }
                }
            }
            Layout::Stable(blocks) => {
                for slot in std::mem::take(&mut blocks.pending) {
                    if blocks.take(slot).is_some() {
                        freed += 1;
                    }
                }
            }
        }
        self.pending_removals = 0;
        freed
    }

    /// Resolves a handle.
    #[inline]
    #[must_use]
    pub fn resolve(&self, handle: Handle<C>) -> Option<&C> {
        self.entry(handle).map(Entry::get)
    }

    /// Resolves a handle mutably.
    #[inline]
    #[must_use]
    pub fn resolve_mut(&mut self, handle: Handle<C>) -> Option<&mut C> {
        self.entry_mut(handle).map(Entry::get_mut)
    }

    /// Checks if the handle resolves.
    #[must_use]
    pub fn contains(&self, handle: Handle<C>) -> bool {
        self.lookup.contains(handle.cast())
    }

    /// Owner of a component.
    #[must_use]
    pub fn owner(&self, handle: Handle<C>) -> Option<GameObjectHandle> {
        self.entry(handle).map(Entry::owner)
    }

    /// Lifecycle state of a component.
    #[must_use]
    pub fn state(&self, handle: Handle<C>) -> Option<ComponentState> {
        self.entry(handle).map(Entry::state)
    }

    /// Resolves a handle to its full entry.
    #[must_use]
    pub fn entry(&self, handle: Handle<C>) -> Option<&Entry<C>> {
        let position = *self.lookup.resolve(handle.cast())?;
        let entry = match &self.layout {
            Layout::Compact(entries) => entries.get(position as usize),
            Layout::Stable(blocks) => blocks.get(position),
        }?;
        debug_assert_eq!(entry.handle, handle, "lookup points at the wrong entry");
        Some(entry)
    }

    fn entry_mut(&mut self, handle: Handle<C>) -> Option<&mut Entry<C>> {
        let position = *self.lookup.resolve(handle.cast())?;
        match &mut self.layout {
            Layout::Compact(entries) => entries.get_mut(position as usize),
            Layout::Stable(blocks) => blocks.get_mut(position),
        }
    }

    /// Iterates live entries in storage order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Entry<C>> + '_> {
        match &self.layout {
            Layout::Compact(entries) => Box::new(entries.iter().filter(|e| !e.removed)),
            Layout::Stable(blocks) => Box::new(
                blocks
                    .blocks
                    .iter()
                    .flat_map(|block| block.iter().flatten())
                    .filter(|e| !e.removed),
            ),
        }
    }

    /// Iterates live entries mutably in storage order.
    pub fn iter_mut(&mut self) -> Box<dyn Iterator<Item = &mut Entry<C>> + '_> {
        match &mut self.layout {
            Layout::Compact(entries) => Box::new(entries.iter_mut().filter(|e| !e.removed)),
            Layout::Stable(blocks) => Box::new(
                blocks
                    .blocks
                    .iter_mut()
                    .flat_map(|block| block.iter_mut().flatten())
                    .filter(|e| !e.removed),
            ),
        }
    }

    /// Calls `f` on every live component in storage order.
    pub fn for_each(&mut self, mut f: impl FnMut(Handle<C>, &mut C)) {
        for entry in self.iter_mut() {
            f(entry.handle, &mut entry.value);
        }
    }

    /// Calls `f` on every live component, in parallel for thread-safe types.
    #[cfg(feature = "parallel")]
    pub fn for_each_parallel<F>(&mut self, f: F)
    where
        F: Fn(Handle<C>, &mut C) + Send + Sync,
    {
        use rayon::prelude::*;

        if !self.thread_safe {
            self.for_each(f);
            return;
        }
        match &mut self.layout {
            Layout::Compact(entries) => entries
                .par_iter_mut()
                .filter(|e| !e.removed)
                .for_each(|e| f(e.handle, &mut e.value)),
            Layout::Stable(blocks) => blocks.blocks.par_iter_mut().for_each(|block| {
                for entry in block.iter_mut().flatten().filter(|e| !e.removed) {
                    f(entry.handle, &mut entry.value);
                }
            }),
        }
    }

    /// Calls `f` on every live component.
    #[cfg(not(feature = "parallel"))]
    pub fn for_each_parallel<F>(&mut self, f: F)
    where
        F: Fn(Handle<C>, &mut C) + Send + Sync,
    {
        self.for_each(f);
    }

    /// Splits live entries into disjoint batches of at most `granularity`.
    ///
    /// `0` yields a single batch.
    pub fn chunks_mut(&mut self, granularity: usize) -> Vec<Vec<&mut Entry<C>>> {
        let size = if granularity == 0 { usize::MAX } else { granularity };
        let mut batches = Vec::new();
        let mut current = Vec::new();
        for entry in self.iter_mut() {
            current.push(entry);
            if current.len() == size {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Drops every component and invalidates every handle.
    pub fn clear(&mut self) {
        self.lookup.clear();
        match &mut self.layout {
            Layout::Compact(entries) => entries.clear(),
            Layout::Stable(blocks) => blocks.clear(),
        }
        self.pending_removals = 0;
    }
}

/// World state a sequential update may read, plus the command queue.
pub(crate) struct SyncEnv<'a> {
    pub objects: &'a ObjectTable,
    pub clock: &'a Clock,
    pub commands: &'a mut CommandBuffer,
}

/// Type-erased storage interface used by the world.
pub(crate) trait ErasedStorage: Downcast + Send + Sync {
    fn live_count(&self) -> usize;
    fn owner_of(&self, handle: ComponentHandle) -> Option<GameObjectHandle>;
    fn state_of(&self, handle: ComponentHandle) -> Option<ComponentState>;
    fn set_state(&mut self, handle: ComponentHandle, state: ComponentState) -> bool;
    fn set_active(&mut self, handle: ComponentHandle, active: bool) -> bool;
    fn insert_boxed(
        &mut self,
        owner: GameObjectHandle,
        component: Box<dyn Component>,
    ) -> Result<ComponentHandle, Box<dyn Component>>;
    fn get_dyn(&self, handle: ComponentHandle) -> Option<&dyn Component>;
    fn get_dyn_mut(&mut self, handle: ComponentHandle) -> Option<(GameObjectHandle, ComponentState, &mut dyn Component)>;
    fn defer_destroy_dyn(&mut self, handle: ComponentHandle) -> bool;
    fn flush(&mut self) -> usize;
    /// Runs a `SyncUpdateFn<C>` over every updatable entry.
    fn run_sync_update(&mut self, update: &(dyn Any + Send + Sync), env: &mut SyncEnv<'_>) -> usize;
    /// Builds one task per batch running the given `AsyncUpdateFn<C>`s.
    fn async_tasks<'s>(
        &'s mut self,
        updates: &[&'s (dyn Any + Send + Sync)],
        granularity: usize,
        view: &'s WorldView<'s>,
    ) -> Vec<Task<'s>>;
}
impl_downcast!(ErasedStorage);

impl<C: Component> ErasedStorage for ComponentStorage<C> {
    fn live_count(&self) -> usize {
        self.len()
    }

    fn owner_of(&self, handle: ComponentHandle) -> Option<GameObjectHandle> {
        self.owner(handle.cast())
    }

    fn state_of(&self, handle: ComponentHandle) -> Option<ComponentState> {
        self.state(handle.cast())
    }

    fn set_state(&mut self, handle: ComponentHandle, state: ComponentState) -> bool {
        self.entry_mut(handle.cast()).map(|e| e.state = state).is_some()
    }

    fn set_active(&mut self, handle: ComponentHandle, active: bool) -> bool {
        self.entry_mut(handle.cast()).map(|e| e.active = active).is_some()
    }

    fn insert_boxed(
        &mut self,
        owner: GameObjectHandle,
        component: Box<dyn Component>,
    ) -> Result<ComponentHandle, Box<dyn Component>> {
        let value = component.downcast::<C>()?;
        Ok(self.create(owner, *value).erase())
    }

    fn get_dyn(&self, handle: ComponentHandle) -> Option<&dyn Component> {
        self.resolve(handle.cast()).map(|c| c as &dyn Component)
    }

    fn get_dyn_mut(&mut self, handle: ComponentHandle) -> Option<(GameObjectHandle, ComponentState, &mut dyn Component)> {
        self.entry_mut(handle.cast())
            .map(|e| (e.owner, e.state, &mut e.value as &mut dyn Component))
    }

    fn defer_destroy_dyn(&mut self, handle: ComponentHandle) -> bool {
        self.defer_destroy(handle.cast())
    }

    fn flush(&mut self) -> usize {
        self.flush_removals()
    }

    fn run_sync_update(&mut self, update: &(dyn Any + Send + Sync), env: &mut SyncEnv<'_>) -> usize {
        let Some(&run) = update.downcast_ref::<SyncUpdateFn<C>>() else {
            debug_assert!(false, "sync update registered with the wrong signature");
            return 0;
        };
        let mut updated = 0;
        for entry in self.iter_mut().filter(|e| e.is_updatable()) {
            let mut ctx = ComponentContext::new(
                entry.owner,
                entry.handle.erase(),
                env.objects,
                env.clock,
                &mut *env.commands,
                0,
            );
            run(&mut entry.value, &mut ctx);
            updated += 1;
        }
        updated
    }

    fn async_tasks<'s>(
        &'s mut self,
        updates: &[&'s (dyn Any + Send + Sync)],
        granularity: usize,
        view: &'s WorldView<'s>,
    ) -> Vec<Task<'s>> {
        let runs: Vec<AsyncUpdateFn<C>> = updates
            .iter()
            .filter_map(|u| u.downcast_ref::<AsyncUpdateFn<C>>().copied())
            .collect();
        if runs.is_empty() {
            return Vec::new();
        }
        self.chunks_mut(granularity)
            .into_iter()
            .map(|mut batch| {
                let runs = runs.clone();
                let task: Task<'s> = Box::new(move || {
                    let mut ctx = AsyncContext::new(view);
                    for run in &runs {
                        for entry in batch.iter_mut().filter(|e| e.is_updatable()) {
                            ctx.bind(entry.owner, entry.handle.erase());
                            run(&mut entry.value, &mut ctx);
                        }
                    }
                });
                task
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Health(u32);
    impl Component for Health {}

    fn owner(i: u32) -> GameObjectHandle {
        Handle::new(i, 0, 1)
    }

    fn storage(policy: StoragePolicy) -> ComponentStorage<Health> {
        ComponentStorage::new(ComponentTypeId(3), policy, true)
    }

    #[test]
    fn test_compact_destroy_keeps_other_handles() {
        let mut health = storage(StoragePolicy::Compact);
        let handles: Vec<_> = (0..100).map(|i| health.create(owner(i), Health(i))).collect();

        assert_eq!(health.destroy(handles[36]), Some(Health(36)));
        assert_eq!(health.len(), 99);
        for (i, &h) in handles.iter().enumerate() {
            if i == 36 {
                assert!(health.resolve(h).is_none());
            } else {
                assert_eq!(health.resolve(h), Some(&Health(i as u32)));
                assert_eq!(health.owner(h), Some(owner(i as u32)));
            }
        }

        let reused = health.create(owner(500), Health(500));
        assert_eq!(reused.index(), handles[36].index());
        assert_eq!(reused.generation(), handles[36].generation() + 1);
        assert_eq!(reused.tag(), 3);
    }

    #[test]
    fn test_stable_entries_do_not_move() {
        let mut health = storage(StoragePolicy::Stable);
        let handles: Vec<_> = (0..130).map(|i| health.create(owner(i), Health(i))).collect();
        let before = health.resolve(handles[129]).map(|h| h as *const Health);

        health.destroy(handles[0]);
        health.destroy(handles[64]);
        assert_eq!(health.resolve(handles[129]).map(|h| h as *const Health), before);

        // LIFO slot reuse
        let a = health.create(owner(1000), Health(1000));
        assert_eq!(a.index(), handles[64].index());
    }

    #[test]
    fn test_deferred_removal_until_flush() {
        for policy in [StoragePolicy::Compact, StoragePolicy::Stable] {
            let mut health = storage(policy);
            let a = health.create(owner(0), Health(1));
            let b = health.create(owner(1), Health(2));
            let c = health.create(owner(2), Health(3));

            assert!(health.defer_destroy(a));
            assert!(!health.defer_destroy(a));
            assert!(health.resolve(a).is_none());
            assert_eq!(health.len(), 2);
            assert_eq!(health.pending_removals(), 1);
            assert_eq!(health.iter().count(), 2);

            assert_eq!(health.flush_removals(), 1);
            assert_eq!(health.resolve(b), Some(&Health(2)));
            assert_eq!(health.resolve(c), Some(&Health(3)));
        }
    }

    #[test]
    fn test_immediate_destroy_moves_pending_entry() {
        let mut health = storage(StoragePolicy::Compact);
        let a = health.create(owner(0), Health(1));
        let b = health.create(owner(1), Health(2));
        let c = health.create(owner(2), Health(3));
        health.defer_destroy(c);
        // Swap-remove pulls the pending `c` into a's slot
        health.destroy(a);
        assert_eq!(health.flush_removals(), 1);
        assert_eq!(health.resolve(b), Some(&Health(2)));
        assert_eq!(health.iter().count(), 1);
    }

    #[test]
    fn test_chunks_cover_all_entries() {
        let mut health = storage(StoragePolicy::Compact);
        for i in 0..10 {
            health.create(owner(i), Health(i));
        }
        let sizes: Vec<usize> = health.chunks_mut(4).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(health.chunks_mut(0).len(), 1);
    }

    #[test]
    fn test_for_each_parallel_visits_everything() {
        let mut health = storage(StoragePolicy::Stable);
        for i in 0..200 {
            health.create(owner(i), Health(i));
        }
        health.for_each_parallel(|_, h| h.0 += 1);
        let total: u32 = health.iter().map(|e| e.get().0).sum();
        assert_eq!(total, (1..=200).sum());
    }

    #[test]
    fn test_erased_insert_checks_type() {
        #[derive(Default)]
        struct Other;
        impl Component for Other {}

        let mut health = storage(StoragePolicy::Compact);
        let erased: &mut dyn ErasedStorage = &mut health;
        assert!(erased.insert_boxed(owner(0), Box::new(Other)).is_err());
        let Ok(h) = erased.insert_boxed(owner(0), Box::new(Health(7))) else {
            panic!("matching type rejected");
        };
        assert_eq!(h.component_type(), ComponentTypeId(3));
        assert_eq!(erased.state_of(h), Some(ComponentState::Uninitialized));
        assert!(erased.get_dyn(h).is_some());
    }
}
