//! # Frame Loop
//!
//! One call to [`World::update`] runs a full frame:
//!
//! ```text
//! ┌──────────┐   ┌───────┐   ┌───────────┐   ┌───────────┐   ┌───────────────┐
//! │ PreAsync │──▶│ Async │──▶│ PostAsync │──▶│ Transform │──▶│ PostTransform │
//! └──────────┘   └───────┘   └───────────┘   └───────────┘   └───────────────┘
//!  flush dead     parallel    replay async    propagate       drain queue
//!  init pending   tasks on    commands,       dirty world     sequential
//!  drain queue    a frozen    drain queue,    transforms      updates,
//!  sequential     view        sequential,                     init pending
//!  updates                    flush dead
//! ```
//!
//! The async phase is the only part that runs off the calling thread, and
//! `TaskScheduler::execute` returning is its barrier.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use super::message::{MessageQueue, MessageTarget, QueuedMessage};
use super::module::{ModuleAsyncContext, ModuleContext, WorldModule};
use super::registry::{ComponentTypeId, ModuleTypeId, TypeRegistry};
use super::schedule::{Schedule, UpdatePhase, UpdateTarget};
use super::storage::{ErasedStorage, SyncEnv};
use super::view::WorldView;
use super::world::World;
use crate::diagnostics::{Diagnostic, DropReason};
use crate::error::TaskError;
use crate::task::{InlineScheduler, TaskGroup, TaskHandle, TaskScheduler};

/// Where a world is inside its frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FramePhase {
    /// Between frames.
    #[default]
    Idle,
    /// Sequential work before the async tasks.
    PreAsync,
    /// Async tasks are running; the world is frozen.
    Async,
    /// Sequential work after the async barrier.
    PostAsync,
    /// Dirty world transforms are being recomputed.
    TransformPropagation,
    /// Sequential work after propagation.
    PostTransform,
}

/// Counters of one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frame number.
    pub frame: u64,
    /// Live objects at the end of the frame.
    pub objects: usize,
    /// Live components at the end of the frame.
    pub components: usize,
    /// Queued messages delivered to at least one handler.
    pub messages_delivered: usize,
    /// World commands replayed.
    pub commands_applied: usize,
    /// Tasks handed to the scheduler.
    pub async_tasks: usize,
    /// World transforms recomputed by propagation.
    pub transforms_propagated: usize,
    /// Wall-clock duration of the frame.
    pub elapsed: Duration,
}

impl World {
    /// Runs one frame.
    ///
    /// `dt` is real time; the clock scales it. With simulation disabled the
    /// clock does not advance.
    pub fn update(&mut self, dt: Duration) -> FrameStats {
        if self.phase != FramePhase::Idle {
            tracing::warn!(world = self.id, phase = ?self.phase, "update called re-entrantly, ignored");
            return FrameStats::default();
        }
        let started = Instant::now();
        let commands_before = self.commands_applied;
        self.frame += 1;
        let _frame = tracing::debug_span!("frame", world = self.id, frame = self.frame).entered();
        self.clock.update(if self.simulating { dt } else { Duration::ZERO });

        let mut stats = FrameStats {
            frame: self.frame,
            ..FrameStats::default()
        };

        {
            let _phase = self.enter(FramePhase::PreAsync);
            self.flush_dead();
            self.initialize_pending();
            stats.messages_delivered += self.drain_queue(MessageQueue::NextFrame);
            self.run_sequential(UpdatePhase::PreAsync);
        }
        {
            let _phase = self.enter(FramePhase::Async);
            stats.async_tasks = self.run_async_phase();
        }
        {
            let _phase = self.enter(FramePhase::PostAsync);
            self.apply_async_commands();
            stats.messages_delivered += self.drain_queue(MessageQueue::PostAsync);
            self.run_sequential(UpdatePhase::PostAsync);
            self.flush_dead();
        }
        {
            let _phase = self.enter(FramePhase::TransformPropagation);
            stats.transforms_propagated = self.objects.propagate_transforms();
        }
        {
            let _phase = self.enter(FramePhase::PostTransform);
            stats.messages_delivered += self.drain_queue(MessageQueue::PostTransform);
            self.run_sequential(UpdatePhase::PostTransform);
            self.initialize_pending();
        }
        self.phase = FramePhase::Idle;

        stats.objects = self.object_count();
        stats.components = self.component_count();
        stats.commands_applied = self.commands_applied - commands_before;
        stats.elapsed = started.elapsed();
        tracing::trace!(?stats, "frame finished");
        stats
    }

    fn enter(&mut self, phase: FramePhase) -> tracing::span::EnteredSpan {
        self.phase = phase;
        tracing::trace_span!("phase", ?phase).entered()
    }

    /// Destroys objects queued for deferred destruction and reclaims the
    /// memory of removed components.
    pub(super) fn flush_dead(&mut self) -> usize {
        for object in std::mem::take(&mut self.pending_destroys) {
            if self.objects.contains(object) {
                let _ = self.destroy_object_impl(object);
            }
        }
        self.apply_commands();
        self.storages.iter_mut().map(|storage| storage.flush()).sum()
    }

    /// Delivers every message of `queue` that is due and was posted before
    /// the drain started.
    fn drain_queue(&mut self, queue: MessageQueue) -> usize {
        let cutoff = self.router.drain_cutoff();
        let now = self.clock.now();
        let mut delivered = 0;
        while let Some(message) = self.router.pop_due(queue, now, cutoff) {
            if self.dispatch(message) > 0 {
                delivered += 1;
            }
            self.apply_commands();
        }
        delivered
    }

    fn dispatch(&mut self, message: QueuedMessage) -> usize {
        let QueuedMessage {
            target,
            message_type,
            type_name,
            payload,
            depth,
            ..
        } = message;
        let payload: &dyn Any = &*payload;

        let owner = match target {
            MessageTarget::Component(component) => self.component_owner(component),
            MessageTarget::Object(object) | MessageTarget::ObjectRecursive(object) => {
                self.objects.contains(object).then_some(object)
            }
        };
        let Some(owner) = owner else {
            tracing::debug!(message = type_name, ?target, "queued message target is gone");
            self.report(Diagnostic::MessageDropped {
                message: type_name,
                reason: DropReason::StaleTarget,
            });
            return 0;
        };

        let handled = match target {
            MessageTarget::Component(component) => usize::from(self.deliver(component, message_type, payload, depth)),
            MessageTarget::Object(object) => self.broadcast(object, message_type, payload, depth),
            MessageTarget::ObjectRecursive(object) => self
                .objects
                .subtree_pre_order(object)
                .into_iter()
                .map(|node| self.broadcast(node, message_type, payload, depth))
                .sum(),
        };

        if message_type == self.builtin.delete_object && !self.pending_destroys.contains(&owner) {
            self.pending_destroys.push(owner);
        }
        handled
    }

    /// Runs the sequential functions of `phase` in schedule order.
    fn run_sequential(&mut self, phase: UpdatePhase) {
        let registry = Arc::clone(&self.registry);
        for position in 0..self.schedule.phase(phase).len() {
            let update = &self.schedule.phase(phase)[position];
            let (name, target) = (update.name, update.target);
            if update.only_when_simulating && !self.simulating {
                continue;
            }
            let _span = tracing::trace_span!("update", function = name).entered();
            match target {
                UpdateTarget::Component { type_id, index } => {
                    let Some(update) = registry.component(type_id).and_then(|info| info.updates.get(index)) else {
                        continue;
                    };
                    let Some(storage) = self.storages.get_mut(usize::from(type_id.0)) else {
                        continue;
                    };
                    let mut env = SyncEnv {
                        objects: &self.objects,
                        clock: &self.clock,
                        commands: &mut self.commands,
                    };
                    storage.run_sync_update(&*update.run, &mut env);
                }
                UpdateTarget::Module(id) => {
                    if !self.modules.is_runnable(id) {
                        continue;
                    }
                    let Some(mut module) = self.modules.take(id) else {
                        continue;
                    };
                    module.update(&mut ModuleContext::new(self, name, phase));
                    self.modules.restore(id, module);
                }
            }
            self.apply_commands();
        }
    }

    /// Runs the async functions as one task group. Returns the number of
    /// tasks submitted.
    fn run_async_phase(&mut self) -> usize {
        let registry = Arc::clone(&self.registry);
        let units = plan_async_units(&self.schedule, &registry, self.simulating);
        if units.is_empty() {
            return 0;
        }

        let mut taken: Vec<(ModuleTypeId, Box<dyn WorldModule>)> = Vec::new();
        for unit in &units {
            if let UnitTarget::Module(id) = unit.target {
                if self.modules.is_runnable(id) {
                    if let Some(module) = self.modules.take(id) {
                        taken.push((id, module));
                    }
                }
            }
        }

        let fallback_granularity = self.config.async_granularity;
        let view = WorldView::new(
            &self.objects,
            &self.clock,
            &registry,
            self.async_sender.clone(),
            self.frame,
        );
        let mut storages: Vec<Option<&mut Box<dyn ErasedStorage>>> = self.storages.iter_mut().map(Some).collect();
        let mut modules: Vec<(ModuleTypeId, &mut Box<dyn WorldModule>)> =
            taken.iter_mut().map(|(id, module)| (*id, module)).collect();

        let mut group = TaskGroup::new();
        let mut unit_tasks: Vec<SmallVec<[TaskHandle; 4]>> = Vec::with_capacity(units.len());
        for unit in &units {
            let mut handles: SmallVec<[TaskHandle; 4]> = SmallVec::new();
            match unit.target {
                UnitTarget::Components(type_id) => {
                    if let Some(storage) = storages.get_mut(usize::from(type_id.0)).and_then(Option::take) {
                        let granularity = unit.granularity.unwrap_or(fallback_granularity).max(1);
                        for task in storage.async_tasks(&unit.runs, granularity, &view) {
                            handles.push(group.submit(unit.name, task));
                        }
                    }
                }
                UnitTarget::Module(id) => {
                    if let Some(position) = modules.iter().position(|(module_id, _)| *module_id == id) {
                        let (_, module) = modules.swap_remove(position);
                        let functions = unit.functions.clone();
                        let view = &view;
                        handles.push(group.submit(
                            unit.name,
                            Box::new(move || {
                                for function in functions {
                                    module.update_async(&mut ModuleAsyncContext::new(view, function));
                                }
                            }),
                        ));
                    }
                }
            }
            if handles.is_empty() {
                // Keeps edges through units with nothing to run
                handles.push(group.submit(unit.name, Box::new(|| {})));
            }
            unit_tasks.push(handles);
        }

        let task_count = group.len();
        let result = wire_unit_edges(&mut group, &units, &unit_tasks).and_then(|()| match group.find_cycle() {
            Some(task) => {
                tracing::warn!(task, "async unit graph has a cycle, running without edges");
                self.diagnostics.report(Diagnostic::AsyncPhaseFailed {
                    reason: format!("dependency cycle through '{task}'"),
                });
                group.clear_dependencies();
                InlineScheduler.execute(group)
            }
            None => self.scheduler.execute(group),
        });
        if let Err(error) = result {
            tracing::error!(%error, "async phase failed");
            self.diagnostics.report(Diagnostic::AsyncPhaseFailed {
                reason: error.to_string(),
            });
        }

        drop(storages);
        drop(view);
        for (id, module) in taken {
            self.modules.restore(id, module);
        }
        task_count
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitTarget {
    Components(ComponentTypeId),
    Module(ModuleTypeId),
}

/// Async work of one component type or one module.
struct AsyncUnit<'r> {
    target: UnitTarget,
    name: &'static str,
    /// `AsyncUpdateFn<C>`s, for component units.
    runs: Vec<&'r (dyn Any + Send + Sync)>,
    /// Function names, for module units.
    functions: Vec<&'static str>,
    granularity: Option<usize>,
    after: SmallVec<[usize; 4]>,
}

/// Groups the async functions by owner, in first-appearance order, and
/// lifts function dependencies to unit dependencies.
fn plan_async_units<'r>(schedule: &Schedule, registry: &'r TypeRegistry, simulating: bool) -> Vec<AsyncUnit<'r>> {
    let functions = schedule.phase(UpdatePhase::Async);
    let mut units: Vec<AsyncUnit<'r>> = Vec::new();
    let mut unit_of: Vec<Option<usize>> = vec![None; functions.len()];

    for (position, function) in functions.iter().enumerate() {
        if function.only_when_simulating && !simulating {
            continue;
        }
        let target = match function.target {
            UpdateTarget::Component { type_id, .. } => UnitTarget::Components(type_id),
            UpdateTarget::Module(id) => UnitTarget::Module(id),
        };
        let unit = match units.iter().position(|u| u.target == target) {
            Some(unit) => unit,
            None => {
                let name = match target {
                    UnitTarget::Components(type_id) => registry.component_name(type_id),
                    UnitTarget::Module(id) => registry.module(id).map(|info| info.name),
                };
                units.push(AsyncUnit {
                    target,
                    name: name.unwrap_or(function.name),
                    runs: Vec::new(),
                    functions: Vec::new(),
                    granularity: None,
                    after: SmallVec::new(),
                });
                units.len() - 1
            }
        };
        unit_of[position] = Some(unit);

        let entry = &mut units[unit];
        if let UpdateTarget::Component { type_id, index } = function.target {
            if let Some(update) = registry.component(type_id).and_then(|info| info.updates.get(index)) {
                entry.runs.push(&*update.run);
            }
        } else {
            entry.functions.push(function.name);
        }
        entry.granularity = match (entry.granularity, function.granularity) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        for &dependency in &function.depends_on {
            if let Some(before) = unit_of.get(dependency).copied().flatten() {
                if before != unit && !units[unit].after.contains(&before) {
                    units[unit].after.push(before);
                }
            }
        }
    }
    units
}

fn wire_unit_edges(
    group: &mut TaskGroup<'_>,
    units: &[AsyncUnit<'_>],
    unit_tasks: &[SmallVec<[TaskHandle; 4]>],
) -> Result<(), TaskError> {
    for (unit, tasks) in units.iter().zip(unit_tasks) {
        for &before in &unit.after {
            for &task in tasks {
                for &prerequisite in &unit_tasks[before] {
                    group.depends_on(task, prerequisite)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::component::Component;
    use crate::ecs::context::AsyncContext;
    use crate::ecs::registry::ComponentDescriptor;
    use crate::ecs::schedule::UpdateFunction;

    #[derive(Default)]
    struct Boid;
    impl Component for Boid {}

    #[derive(Default)]
    struct Flock;
    impl Component for Flock {}

    fn steer(_: &mut Boid, _: &mut AsyncContext<'_>) {}
    fn gather(_: &mut Flock, _: &mut AsyncContext<'_>) {}
    fn separate(_: &mut Boid, _: &mut AsyncContext<'_>) {}

    fn schedule(registry: &TypeRegistry) -> Schedule {
        let candidates = registry.components().flat_map(|(type_id, info)| {
            info.updates
                .iter()
                .enumerate()
                .map(move |(index, update)| (UpdateTarget::Component { type_id, index }, &update.function))
        });
        Schedule::build(candidates).0
    }

    #[test]
    fn test_units_group_functions_by_type() {
        let mut registry = TypeRegistry::new();
        registry
            .register_component(
                ComponentDescriptor::<Boid>::new("Boid")
                    .async_update(UpdateFunction::new("steer", UpdatePhase::Async).granularity(32), steer)
                    .async_update(
                        UpdateFunction::new("separate", UpdatePhase::Async).granularity(8).only_when_simulating(),
                        separate,
                    ),
            )
            .unwrap();
        registry
            .register_component(
                ComponentDescriptor::<Flock>::new("Flock")
                    .async_update(UpdateFunction::new("gather", UpdatePhase::Async).after("steer"), gather),
            )
            .unwrap();
        let schedule = schedule(&registry);

        let units = plan_async_units(&schedule, &registry, true);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].name, "Boid");
        assert_eq!(units[0].runs.len(), 2);
        assert_eq!(units[0].granularity, Some(8));
        assert_eq!(units[1].name, "Flock");
        assert_eq!(units[1].after.as_slice(), &[0]);

        let paused = plan_async_units(&schedule, &registry, false);
        assert_eq!(paused[0].runs.len(), 1);
        assert_eq!(paused[0].granularity, Some(32));
    }
}
