//! # World Frame Benchmark
//!
//! Full `World::update` cost with a realistic mix of objects:
//! - deep hierarchies that need transform propagation
//! - sequential and async component updates
//! - queued messages
//!
//! Run with: `cargo bench --package ember_core --bench world_benchmark`

// Benchmarks don't need docs
#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ember_core::{
    AsyncContext, Commands, Component, ComponentContext, ComponentDescriptor, GameObjectDesc, GameObjectHandle,
    InlineScheduler, TaskScheduler, TypeRegistry, UpdateFunction, UpdatePhase, World, WorldConfig,
};
use ember_shared::{Transform, Vec3};

const FRAME: Duration = Duration::from_millis(16);

#[derive(Default)]
struct Spin {
    angle: f32,
}
impl Component for Spin {}

fn spin(spin: &mut Spin, ctx: &mut AsyncContext<'_>) {
    spin.angle += ctx.delta().as_secs_f32();
    let owner = ctx.owner();
    let position = Vec3::new(spin.angle.cos(), 0.0, spin.angle.sin());
    ctx.set_local_transform(owner, Transform::from_position(position));
}

#[derive(Default)]
struct Counter {
    frames: u64,
    pings: u64,
}
impl Component for Counter {}

fn count(counter: &mut Counter, _: &mut ComponentContext<'_>) {
    counter.frames += 1;
}

struct Ping;

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry
        .register_component(
            ComponentDescriptor::<Spin>::new("Spin").async_update(UpdateFunction::new("spin", UpdatePhase::Async), spin),
        )
        .expect("register Spin");
    registry
        .register_component(
            ComponentDescriptor::<Counter>::new("Counter")
                .update(UpdateFunction::new("count", UpdatePhase::PostAsync), count),
        )
        .expect("register Counter");
    registry.register_message::<Ping>().expect("register Ping");
    registry
        .register_handler::<Counter, Ping>(|counter, _, _| counter.pings += 1)
        .expect("register handler");
    Arc::new(registry)
}

/// Builds `chains` chains of `depth` objects, each carrying both components.
fn populate(world: &mut World, chains: usize, depth: usize) -> Vec<GameObjectHandle> {
    let mut leaves = Vec::with_capacity(chains);
    for chain in 0..chains {
        let mut parent: Option<GameObjectHandle> = None;
        for level in 0..depth {
            let mut desc = GameObjectDesc::new(format!("c{chain}-{level}"))
                .with_position(Vec3::new(1.0, 0.0, 0.0));
            if let Some(parent) = parent {
                desc = desc.with_parent(parent);
            }
            let object = world.create_object(desc).expect("create object");
            world.add_component(object, Spin::default()).expect("add Spin");
            world.add_component(object, Counter::default()).expect("add Counter");
            parent = Some(object);
        }
        leaves.extend(parent);
    }
    leaves
}

fn scheduler() -> Arc<dyn TaskScheduler> {
    #[cfg(feature = "parallel")]
    {
        Arc::new(ember_core::RayonScheduler::new(0).expect("rayon pool"))
    }
    #[cfg(not(feature = "parallel"))]
    {
        Arc::new(InlineScheduler)
    }
}

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_update");
    for objects in [1_000usize, 10_000] {
        for (label, scheduler) in [("inline", Arc::new(InlineScheduler) as Arc<dyn TaskScheduler>), ("pool", scheduler())] {
            let mut world = World::new(WorldConfig::named("bench"), registry(), scheduler).expect("world");
            populate(&mut world, objects / 8, 8);
            world.update(FRAME);
            group.bench_with_input(BenchmarkId::new(label, objects), &objects, |b, _| {
                b.iter(|| black_box(world.update(FRAME)));
            });
        }
    }
    group.finish();
}

fn bench_messages(c: &mut Criterion) {
    let mut world = World::new(WorldConfig::named("bench"), registry(), Arc::new(InlineScheduler)).expect("world");
    let leaves = populate(&mut world, 1_000, 1);
    world.update(FRAME);
    c.bench_function("post_and_drain_1k", |b| {
        b.iter(|| {
            for &leaf in &leaves {
                world.post(leaf, Ping, Duration::ZERO);
            }
            black_box(world.update(FRAME).messages_delivered)
        });
    });
}

criterion_group!(benches, bench_frame, bench_messages);
criterion_main!(benches);
