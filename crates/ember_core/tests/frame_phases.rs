//! # Frame Phase Tests
//!
//! Ordering guarantees of `World::update`: the async barrier, command
//! replay, initialization and the simulation switch.
//!
//! Run with: cargo test -p ember_core --test frame_phases

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ember_core::{
    AsyncContext, Commands, Component, ComponentContext, ComponentDescriptor, ComponentError, ComponentState,
    Diagnostic, FramePhase, GameObjectDesc, InlineScheduler, SharedWorld, TaskScheduler, TypeRegistry,
    UpdateFunction, UpdatePhase, World, WorldConfig,
};
use ember_shared::Vec3;

// ============================================================================
// TEST COMPONENTS
// ============================================================================

#[derive(Default)]
struct Mover {
    velocity: Vec3,
}
impl Component for Mover {}

fn integrate(mover: &mut Mover, ctx: &mut AsyncContext<'_>) {
    let owner = ctx.owner();
    let Some(mut local) = ctx.view().object(owner).map(|o| *o.local_transform()) else {
        return;
    };
    local.position += mover.velocity;
    ctx.set_local_transform(owner, local);
}

/// Records the owner's local position after the async barrier.
#[derive(Default)]
struct Tracker {
    seen: Vec<Vec3>,
}
impl Component for Tracker {}

fn track(tracker: &mut Tracker, ctx: &mut ComponentContext<'_>) {
    if let Some(object) = ctx.owner_object() {
        tracker.seen.push(object.local_transform().position);
    }
}

#[derive(Default)]
struct Ticker {
    ticks: u32,
}
impl Component for Ticker {}

fn tick(ticker: &mut Ticker, _: &mut ComponentContext<'_>) {
    ticker.ticks += 1;
}

/// Fails to initialize; must never be updated afterwards.
#[derive(Default)]
struct Fragile {
    updates: u32,
}
impl Component for Fragile {
    fn initialize(&mut self, _ctx: &mut ComponentContext<'_>) -> Result<(), ComponentError> {
        Err(ComponentError::InitFailed("missing asset".into()))
    }
}

fn poke(fragile: &mut Fragile, _: &mut ComponentContext<'_>) {
    fragile.updates += 1;
}

/// Spawns a sibling from its initializer.
#[derive(Default)]
struct Spawner;
impl Component for Spawner {
    fn initialize(&mut self, ctx: &mut ComponentContext<'_>) -> Result<(), ComponentError> {
        let owner = ctx.owner();
        ctx.add_component(owner, Ticker::default());
        Ok(())
    }
}

#[derive(Default)]
struct Particle {
    steps: u32,
}
impl Component for Particle {}

fn step(particle: &mut Particle, _: &mut AsyncContext<'_>) {
    particle.steps += 1;
}

fn registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry
        .register_component(
            ComponentDescriptor::<Mover>::new("Mover")
                .async_update(UpdateFunction::new("integrate", UpdatePhase::Async), integrate),
        )
        .unwrap();
    registry
        .register_component(
            ComponentDescriptor::<Tracker>::new("Tracker")
                .update(UpdateFunction::new("track", UpdatePhase::PostAsync).after("integrate"), track),
        )
        .unwrap();
    registry
        .register_component(
            ComponentDescriptor::<Ticker>::new("Ticker")
                .update(UpdateFunction::new("tick", UpdatePhase::PreAsync).only_when_simulating(), tick),
        )
        .unwrap();
    registry
        .register_component(
            ComponentDescriptor::<Fragile>::new("Fragile")
                .update(UpdateFunction::new("poke", UpdatePhase::PostTransform), poke),
        )
        .unwrap();
    registry.register_component(ComponentDescriptor::<Spawner>::new("Spawner")).unwrap();
    registry
        .register_component(
            ComponentDescriptor::<Particle>::new("Particle")
                .async_update(UpdateFunction::new("step", UpdatePhase::Async).granularity(16), step),
        )
        .unwrap();
    registry
}

fn world_on(scheduler: Arc<dyn TaskScheduler>) -> World {
    World::new(WorldConfig::named("frames"), Arc::new(registry()), scheduler).unwrap()
}

fn world() -> World {
    world_on(Arc::new(InlineScheduler))
}

// ============================================================================
// ASYNC BARRIER
// ============================================================================

#[test]
fn verify_async_writes_visible_after_barrier() {
    let mut world = world();
    let object = world.create_object(GameObjectDesc::new("ship")).unwrap();
    world
        .add_component(
            object,
            Mover {
                velocity: Vec3::new(1.0, 0.0, 0.0),
            },
        )
        .unwrap();
    let tracker = world.add_component(object, Tracker::default()).unwrap();

    let stats = world.update(Duration::from_millis(16));
    // Mover's batch plus a placeholder for the empty Particle unit
    assert_eq!(stats.async_tasks, 2);
    assert!(stats.commands_applied >= 1);
    world.update(Duration::from_millis(16));

    assert_eq!(
        world.component(tracker).unwrap().seen,
        vec![Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0)]
    );
    let cached = world.cached_world_transform(object).unwrap();
    assert!(cached.position.abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1e-5));
    assert_eq!(world.phase(), FramePhase::Idle);
}

#[cfg(feature = "parallel")]
#[test]
fn verify_rayon_scheduler_updates_every_batch() {
    let scheduler = ember_core::RayonScheduler::new(4).unwrap();
    let mut world = world_on(Arc::new(scheduler));
    let object = world.create_object(GameObjectDesc::new("emitter")).unwrap();
    let particles: Vec<_> = (0..200)
        .map(|_| world.add_component(object, Particle::default()).unwrap())
        .collect();

    // Components initialize at the start of the frame, so all run now
    let stats = world.update(Duration::from_millis(16));
    // 200 particles in batches of 16, plus the empty Mover unit
    assert_eq!(stats.async_tasks, 14);
    world.update(Duration::from_millis(16));
    for particle in particles {
        assert_eq!(world.component(particle).unwrap().steps, 2);
    }
}

// ============================================================================
// INITIALIZATION
// ============================================================================

#[test]
fn verify_failed_initialize_leaves_component_inert() {
    let mut world = world();
    let diagnostics = world.diagnostics();
    let object = world.create_object(GameObjectDesc::new("broken")).unwrap();
    let fragile = world.add_component(object, Fragile::default()).unwrap();

    world.update(Duration::from_millis(16));
    world.update(Duration::from_millis(16));

    assert_eq!(world.component_state(fragile.erase()), Some(ComponentState::Inert));
    assert_eq!(world.component(fragile).unwrap().updates, 0);
    assert!(diagnostics.drain().iter().any(|d| matches!(
        d,
        Diagnostic::ComponentInitFailed { component, .. } if *component == fragile.erase()
    )));
}

#[test]
fn verify_components_added_by_initializers_start_same_frame() {
    let mut world = world();
    let object = world.create_object(GameObjectDesc::new("nest")).unwrap();
    world.add_component(object, Spawner).unwrap();

    world.update(Duration::from_millis(16));
    let ticker = world.find_component::<Ticker>(object).unwrap();
    assert_eq!(world.component_state(ticker.erase()), Some(ComponentState::Initialized));
    assert_eq!(world.component(ticker).unwrap().ticks, 1);
}

#[test]
fn verify_inactive_objects_are_not_updated() {
    let mut world = world();
    let object = world.create_object(GameObjectDesc::new("sleeper")).unwrap();
    let ticker = world.add_component(object, Ticker::default()).unwrap();
    world.update(Duration::from_millis(16));

    world.set_active(object, false).unwrap();
    world.update(Duration::from_millis(16));
    assert_eq!(world.component(ticker).unwrap().ticks, 1);

    world.set_active(object, true).unwrap();
    world.update(Duration::from_millis(16));
    assert_eq!(world.component(ticker).unwrap().ticks, 2);
}

// ============================================================================
// SIMULATION SWITCH
// ============================================================================

#[test]
fn verify_simulation_gated_functions_pause() {
    let mut world = world();
    let object = world.create_object(GameObjectDesc::new("clock")).unwrap();
    let ticker = world.add_component(object, Ticker::default()).unwrap();

    world.update(Duration::from_millis(100));
    assert_eq!(world.clock().now(), Duration::from_millis(100));

    world.set_simulation_enabled(false);
    let stats = world.update(Duration::from_millis(100));
    assert_eq!(stats.frame, 2);
    assert_eq!(world.component(ticker).unwrap().ticks, 1);
    assert_eq!(world.clock().now(), Duration::from_millis(100));

    world.set_simulation_enabled(true);
    world.update(Duration::from_millis(100));
    assert_eq!(world.component(ticker).unwrap().ticks, 2);
}

// ============================================================================
// SHARED ACCESS
// ============================================================================

#[test]
fn verify_readers_see_consistent_frames() {
    let mut world = world();
    for i in 0..8 {
        let object = world.create_object(GameObjectDesc::new(format!("o{i}"))).unwrap();
        world.add_component(object, Ticker::default()).unwrap();
    }
    let shared = SharedWorld::new(world);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..50 {
                    let world = shared.acquire_read_marker();
                    assert_eq!(world.object_count(), 8);
                    assert_eq!(world.phase(), FramePhase::Idle);
                }
            });
        }
        for _ in 0..20 {
            shared.update(Duration::from_millis(16));
        }
    });

    assert_eq!(shared.reader_count(), 0);
    let world = shared.into_inner();
    assert_eq!(world.frame(), 20);
}
