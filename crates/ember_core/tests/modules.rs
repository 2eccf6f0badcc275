//! # World Module Tests
//!
//! Lazy and always-on startup, inert modules, shutdown order, hierarchy
//! observers and module update functions.
//!
//! Run with: cargo test -p ember_core --test modules

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_core::{
    Commands, Component, ComponentDescriptor, Diagnostic, GameObjectDesc, HierarchyEvent, InlineScheduler,
    ModuleAsyncContext, ModuleContext, ModuleDescriptor, ModuleError, ModuleState, TypeRegistry, UpdateFunction,
    UpdatePhase, World, WorldConfig, WorldModule,
};

type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, line: &str) {
    log.lock().unwrap().push(line.to_string());
}

// ============================================================================
// TEST MODULES
// ============================================================================

struct Physics {
    log: Log,
    steps: u32,
}

impl WorldModule for Physics {
    fn startup(&mut self, _world: &mut World) -> Result<(), ModuleError> {
        push(&self.log, "physics up");
        Ok(())
    }

    fn shutdown(&mut self, _world: &mut World) {
        push(&self.log, "physics down");
    }

    fn update(&mut self, ctx: &mut ModuleContext<'_>) {
        self.steps += 1;
        if self.steps == 1 {
            let world = ctx.world_mut();
            let _ = world.create_object(GameObjectDesc::new("spawned").with_global_key("spawned"));
        }
    }
}

/// Needs [`Physics`] running before it can start.
struct Renderer {
    log: Log,
}

impl WorldModule for Renderer {
    fn startup(&mut self, world: &mut World) -> Result<(), ModuleError> {
        world
            .get_module::<Physics>()
            .ok_or_else(|| ModuleError::StartupFailed("physics unavailable".into()))?;
        push(&self.log, "renderer up");
        Ok(())
    }

    fn shutdown(&mut self, _world: &mut World) {
        push(&self.log, "renderer down");
    }
}

struct Broken {
    log: Log,
    updates: u32,
}

impl WorldModule for Broken {
    fn startup(&mut self, _world: &mut World) -> Result<(), ModuleError> {
        Err(ModuleError::StartupFailed("no device".into()))
    }

    fn shutdown(&mut self, _world: &mut World) {
        push(&self.log, "broken down");
    }

    fn update(&mut self, _ctx: &mut ModuleContext<'_>) {
        self.updates += 1;
    }
}

#[derive(Default)]
struct Census {
    events: Vec<HierarchyEvent>,
    clears: u32,
}

impl WorldModule for Census {
    fn on_hierarchy_event(&mut self, _world: &World, event: &HierarchyEvent) {
        self.events.push(*event);
    }

    fn world_cleared(&mut self, _world: &mut World) {
        self.clears += 1;
    }
}

#[derive(Default)]
struct Sampler {
    observed: Vec<usize>,
}

impl WorldModule for Sampler {
    fn update_async(&mut self, ctx: &mut ModuleAsyncContext<'_>) {
        self.observed.push(ctx.view().objects().len());
        if self.observed.len() == 1 {
            ctx.create_object(GameObjectDesc::new("sampled"));
        }
    }
}

/// Always on; starts [`Audio`] from its own startup.
struct Mixer {
    log: Log,
}

impl WorldModule for Mixer {
    fn startup(&mut self, world: &mut World) -> Result<(), ModuleError> {
        world
            .get_module::<Audio>()
            .ok_or_else(|| ModuleError::StartupFailed("audio unavailable".into()))?;
        push(&self.log, "mixer up");
        Ok(())
    }

    fn shutdown(&mut self, _world: &mut World) {
        push(&self.log, "mixer down");
    }
}

/// Always on, registered after [`Mixer`].
struct Audio {
    log: Log,
}

impl WorldModule for Audio {
    fn startup(&mut self, _world: &mut World) -> Result<(), ModuleError> {
        push(&self.log, "audio up");
        Ok(())
    }

    fn shutdown(&mut self, _world: &mut World) {
        push(&self.log, "audio down");
    }
}

#[derive(Default)]
struct Marker;
impl Component for Marker {}

fn world(log: &Log) -> World {
    let mut registry = TypeRegistry::new();
    registry.register_component(ComponentDescriptor::<Marker>::new("Marker")).unwrap();

    let physics_log = Arc::clone(log);
    registry
        .register_module(
            ModuleDescriptor::with_factory("Physics", move || Physics {
                log: Arc::clone(&physics_log),
                steps: 0,
            })
            .update(UpdateFunction::new("physics_step", UpdatePhase::PreAsync)),
        )
        .unwrap();
    let renderer_log = Arc::clone(log);
    registry
        .register_module(ModuleDescriptor::with_factory("Renderer", move || Renderer {
            log: Arc::clone(&renderer_log),
        }))
        .unwrap();
    let broken_log = Arc::clone(log);
    registry
        .register_module(
            ModuleDescriptor::with_factory("Broken", move || Broken {
                log: Arc::clone(&broken_log),
                updates: 0,
            })
            .update(UpdateFunction::new("broken_tick", UpdatePhase::PostAsync)),
        )
        .unwrap();
    registry
        .register_module(ModuleDescriptor::<Census>::new("Census").always_on().observes_hierarchy())
        .unwrap();
    registry
        .register_module(
            ModuleDescriptor::<Sampler>::new("Sampler")
                .always_on()
                .update(UpdateFunction::new("sample", UpdatePhase::Async)),
        )
        .unwrap();
    World::new(WorldConfig::named("modules"), Arc::new(registry), Arc::new(InlineScheduler)).unwrap()
}

fn lines(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn verify_modules_start_on_first_request() {
    let log = Log::default();
    let mut world = world(&log);
    assert_eq!(world.module_state::<Physics>(), ModuleState::Unstarted);
    assert_eq!(world.module_state::<Census>(), ModuleState::Active);
    assert!(world.try_module::<Physics>().is_none());

    assert!(world.get_module::<Physics>().is_some());
    assert!(world.get_module::<Physics>().is_some());
    assert_eq!(world.module_state::<Physics>(), ModuleState::Active);
    assert_eq!(lines(&log), vec!["physics up"]);
}

#[test]
fn verify_failed_startup_leaves_module_inert() {
    let log = Log::default();
    let mut world = world(&log);
    let diagnostics = world.diagnostics();

    assert!(world.get_module::<Broken>().is_some());
    assert_eq!(world.module_state::<Broken>(), ModuleState::Inert);
    assert!(diagnostics.drain().iter().any(|d| matches!(
        d,
        Diagnostic::ModuleStartupFailed { module: "Broken", .. }
    )));

    world.update(Duration::from_millis(16));
    assert_eq!(world.try_module::<Broken>().unwrap().updates, 0);

    assert_eq!(
        world.reinit_module::<Broken>(),
        Err(ModuleError::StartupFailed("no device".into()))
    );
    drop(world);
    // Inert modules are freed without a shutdown call
    assert!(!lines(&log).iter().any(|l| l == "broken down"));
}

#[test]
fn verify_delete_then_recreate() {
    let log = Log::default();
    let mut world = world(&log);
    world.get_module::<Physics>().unwrap().steps = 5;

    assert_eq!(world.delete_module::<Physics>(), Ok(true));
    assert_eq!(world.module_state::<Physics>(), ModuleState::Destroyed);
    assert!(world.try_module::<Physics>().is_none());
    assert_eq!(world.delete_module::<Physics>(), Ok(false));

    assert_eq!(world.get_module::<Physics>().unwrap().steps, 0);
    assert_eq!(lines(&log), vec!["physics up", "physics down", "physics up"]);
}

#[test]
fn verify_shutdown_runs_in_reverse_creation_order() {
    let log = Log::default();
    let mut world = world(&log);
    assert!(world.get_module::<Renderer>().is_some());
    assert_eq!(world.module_state::<Physics>(), ModuleState::Active);

    drop(world);
    assert_eq!(
        lines(&log),
        vec!["physics up", "renderer up", "renderer down", "physics down"]
    );
}

#[test]
fn verify_always_on_module_started_by_another_starts_once() {
    let log = Log::default();
    let mut registry = TypeRegistry::new();
    let mixer_log = Arc::clone(&log);
    registry
        .register_module(
            ModuleDescriptor::with_factory("Mixer", move || Mixer {
                log: Arc::clone(&mixer_log),
            })
            .always_on(),
        )
        .unwrap();
    let audio_log = Arc::clone(&log);
    registry
        .register_module(
            ModuleDescriptor::with_factory("Audio", move || Audio {
                log: Arc::clone(&audio_log),
            })
            .always_on(),
        )
        .unwrap();

    let world = World::new(WorldConfig::named("audio"), Arc::new(registry), Arc::new(InlineScheduler)).unwrap();
    assert_eq!(world.module_state::<Audio>(), ModuleState::Active);
    assert_eq!(world.module_state::<Mixer>(), ModuleState::Active);
    assert_eq!(lines(&log), vec!["audio up", "mixer up"]);

    drop(world);
    assert_eq!(lines(&log), vec!["audio up", "mixer up", "mixer down", "audio down"]);
}

#[test]
fn verify_reinit_restarts_in_place() {
    let log = Log::default();
    let mut world = world(&log);
    world.get_module::<Physics>().unwrap().steps = 3;

    assert_eq!(world.reinit_module::<Physics>(), Ok(()));
    assert_eq!(world.try_module::<Physics>().unwrap().steps, 3);
    assert_eq!(lines(&log), vec!["physics up", "physics down", "physics up"]);
}

// ============================================================================
// OBSERVERS
// ============================================================================

#[test]
fn verify_observer_sees_structural_changes() {
    let log = Log::default();
    let mut world = world(&log);
    let a = world.create_object(GameObjectDesc::new("a")).unwrap();
    let b = world.create_object(GameObjectDesc::new("b").with_parent(a)).unwrap();
    let marker = world.add_component(b, Marker).unwrap().erase();
    world.set_parent(b, None).unwrap();
    world.set_active(a, false).unwrap();
    world.remove_component(marker).unwrap();
    world.destroy_object(a).unwrap();

    let census = world.try_module::<Census>().unwrap();
    assert_eq!(
        census.events,
        vec![
            HierarchyEvent::ObjectCreated(a),
            HierarchyEvent::ObjectCreated(b),
            HierarchyEvent::ComponentAdded {
                owner: b,
                component: marker
            },
            HierarchyEvent::ParentChanged {
                child: b,
                old_parent: Some(a),
                new_parent: None
            },
            HierarchyEvent::ActiveChanged {
                object: a,
                active: false
            },
            HierarchyEvent::ComponentRemoved {
                owner: b,
                component: marker
            },
            HierarchyEvent::ObjectDestroyed(a),
        ]
    );
}

#[test]
fn verify_clear_notifies_modules() {
    let log = Log::default();
    let mut world = world(&log);
    world.create_object(GameObjectDesc::new("a")).unwrap();
    world.clear();
    assert_eq!(world.try_module::<Census>().unwrap().clears, 1);
    assert_eq!(world.module_state::<Census>(), ModuleState::Active);
}

// ============================================================================
// UPDATE FUNCTIONS
// ============================================================================

#[test]
fn verify_module_update_mutates_world() {
    let log = Log::default();
    let mut world = world(&log);
    world.update(Duration::from_millis(16));
    assert!(world.find_by_global_key("spawned").is_none());

    world.get_module::<Physics>().unwrap();
    world.update(Duration::from_millis(16));
    world.update(Duration::from_millis(16));
    assert_eq!(world.try_module::<Physics>().unwrap().steps, 2);
    assert!(world.find_by_global_key("spawned").is_some());
}

#[test]
fn verify_async_module_update_reads_view() {
    let log = Log::default();
    let mut world = world(&log);
    for i in 0..3 {
        world.create_object(GameObjectDesc::new(format!("o{i}"))).unwrap();
    }

    world.update(Duration::from_millis(16));
    assert_eq!(world.object_count(), 4);
    world.update(Duration::from_millis(16));
    assert_eq!(world.try_module::<Sampler>().unwrap().observed, vec![3, 4]);
}
