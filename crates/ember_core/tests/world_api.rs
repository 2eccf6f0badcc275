//! # World API Tests
//!
//! Handle lifetimes, object and component bookkeeping, storage policies.
//!
//! Run with: cargo test -p ember_core --test world_api

use std::sync::Arc;
use std::time::Duration;

use ember_core::{
    Component, ComponentDescriptor, ComponentError, ComponentState, ComponentStorage, DeleteObject, GameObjectDesc, HierarchyError,
    InlineScheduler, StoragePolicy, TypeRegistry, World, WorldConfig, WorldError,
};

#[derive(Debug, Default, PartialEq)]
struct Health {
    hp: u32,
}
impl Component for Health {}

#[derive(Debug, Default, PartialEq)]
struct Collider {
    radius: f32,
}
impl Component for Collider {}

#[derive(Debug, Default)]
struct Unregistered;
impl Component for Unregistered {}

fn world() -> World {
    let mut registry = TypeRegistry::new();
    registry
        .register_component(ComponentDescriptor::<Health>::new("Health").with_default())
        .unwrap();
    registry
        .register_component(ComponentDescriptor::<Collider>::new("Collider").policy(StoragePolicy::Stable))
        .unwrap();
    World::new(WorldConfig::named("api"), Arc::new(registry), Arc::new(InlineScheduler)).unwrap()
}

// ============================================================================
// HANDLES
// ============================================================================

#[test]
fn verify_compact_slot_reuse_bumps_generation() {
    let mut world = world();
    let owner = world.create_object(GameObjectDesc::new("crowd")).unwrap();
    let handles: Vec<_> = (0..100)
        .map(|hp| world.add_component(owner, Health { hp }).unwrap())
        .collect();

    let victim = handles[36];
    world.remove_component(victim.erase()).unwrap();
    assert!(world.component(victim).is_none());
    world.update(Duration::from_millis(16));
    assert_eq!(world.storage::<Health>().unwrap().len(), 99);

    let replacement = world.add_component(owner, Health { hp: 1000 }).unwrap();
    assert_eq!(replacement.index(), victim.index());
    assert_eq!(replacement.generation(), victim.generation() + 1);
    assert!(world.component(victim).is_none());
    assert_eq!(world.component(replacement), Some(&Health { hp: 1000 }));

    // Entries moved by the compact removal still resolve through their handles
    for (hp, handle) in handles.iter().enumerate().filter(|(i, _)| *i != 36) {
        assert_eq!(world.component(*handle).map(|h| h.hp), Some(hp as u32));
    }
}

#[test]
fn verify_destroyed_object_handle_goes_stale() {
    let mut world = world();
    let first = world.create_object(GameObjectDesc::new("first")).unwrap();
    world.destroy_object(first).unwrap();
    assert!(world.object(first).is_none());

    let second = world.create_object(GameObjectDesc::new("second")).unwrap();
    assert_eq!(second.index(), first.index());
    assert_ne!(second.generation(), first.generation());
    assert!(world.object(first).is_none());
    assert_eq!(world.object(second).map(|o| o.name()), Some("second"));
    assert!(matches!(
        world.destroy_object(first),
        Err(WorldError::Hierarchy(HierarchyError::StaleHandle(_)))
    ));
}

#[test]
fn verify_stable_storage_never_moves_entries() {
    let mut world = world();
    let owner = world.create_object(GameObjectDesc::new("rigid")).unwrap();
    let pinned = world.add_component(owner, Collider { radius: 0.5 }).unwrap();
    let address: *const Collider = world.component(pinned).unwrap();

    let others: Vec<_> = (0..300)
        .map(|i| world.add_component(owner, Collider { radius: i as f32 }).unwrap())
        .collect();
    for handle in others.iter().step_by(2) {
        world.remove_component(handle.erase()).unwrap();
    }
    world.update(Duration::from_millis(16));

    let after: *const Collider = world.component(pinned).unwrap();
    assert_eq!(address, after);
    assert_eq!(world.component(pinned).unwrap().radius, 0.5);
    assert_eq!(world.storage::<Collider>().unwrap().policy(), StoragePolicy::Stable);
}

// ============================================================================
// COMPONENTS
// ============================================================================

#[test]
fn verify_component_lifecycle_state() {
    let mut world = world();
    let owner = world.create_object(GameObjectDesc::new("o")).unwrap();
    let health = world.add_component(owner, Health { hp: 3 }).unwrap();
    assert_eq!(world.component_state(health.erase()), Some(ComponentState::Uninitialized));

    world.update(Duration::ZERO);
    assert_eq!(world.component_state(health.erase()), Some(ComponentState::Initialized));
    assert_eq!(world.component_owner(health.erase()), Some(owner));
    assert_eq!(world.find_component::<Health>(owner), Some(health));
    assert_eq!(world.find_component::<Collider>(owner), None);
}

#[test]
fn verify_component_errors() {
    let mut world = world();
    let owner = world.create_object(GameObjectDesc::new("o")).unwrap();

    assert_eq!(
        world.add_component(owner, Unregistered).err(),
        Some(WorldError::Component(ComponentError::Unregistered(std::any::type_name::<Unregistered>())))
    );

    let collider = world.registry().component_type_by_name("Collider").unwrap();
    assert_eq!(
        world.add_default_component(owner, collider).err(),
        Some(WorldError::Component(ComponentError::NoDefault("Collider")))
    );

    world.destroy_object(owner).unwrap();
    assert!(matches!(
        world.add_component(owner, Health::default()),
        Err(WorldError::Hierarchy(HierarchyError::StaleHandle(_)))
    ));
}

#[test]
fn verify_destroy_object_removes_subtree_components() {
    let mut world = world();
    let root = world.create_object(GameObjectDesc::new("root")).unwrap();
    let child = world.create_object(GameObjectDesc::new("child").with_parent(root)).unwrap();
    let grandchild = world
        .create_object(GameObjectDesc::new("grandchild").with_parent(child))
        .unwrap();
    let health = world.add_component(grandchild, Health { hp: 1 }).unwrap();
    world.add_component(child, Collider::default()).unwrap();

    world.destroy_object(child).unwrap();
    assert!(world.object(grandchild).is_none());
    assert!(world.component(health).is_none());
    assert!(world.children(root).is_empty());
    assert_eq!(world.component_count(), 0);
    assert_eq!(world.object_count(), 1);
}

#[test]
fn verify_storage_iteration() {
    let mut world = world();
    for i in 0..10 {
        let object = world.create_object(GameObjectDesc::new(format!("o{i}"))).unwrap();
        world.add_component(object, Health { hp: i }).unwrap();
    }
    let storage: &mut ComponentStorage<Health> = world.storage_mut::<Health>().unwrap();
    storage.for_each(|_, health| health.hp *= 2);
    let total: u32 = world.storage::<Health>().unwrap().iter().map(|e| e.get().hp).sum();
    assert_eq!(total, 90);
}

// ============================================================================
// LOOKUPS
// ============================================================================

#[test]
fn verify_global_keys_and_persistent_ids() {
    let mut world = world();
    let player = world
        .create_object(GameObjectDesc::new("player").with_global_key("player").with_persistent_id(42))
        .unwrap();
    assert_eq!(world.find_by_global_key("player"), Some(player));
    assert_eq!(world.find_by_persistent_id(42), Some(player));

    assert_eq!(
        world
            .create_object(GameObjectDesc::new("clone").with_global_key("player"))
            .err(),
        Some(WorldError::Hierarchy(HierarchyError::DuplicateGlobalKey("player".into())))
    );
    assert_eq!(
        world.create_object(GameObjectDesc::new("twin").with_persistent_id(42)).err(),
        Some(WorldError::Hierarchy(HierarchyError::DuplicatePersistentId(42)))
    );

    world.set_global_key(player, None).unwrap();
    assert_eq!(world.find_by_global_key("player"), None);
    let generated = world.create_object(GameObjectDesc::new("npc")).unwrap();
    assert_ne!(world.object(generated).unwrap().persistent_id(), 0);
}

#[test]
fn verify_clear_keeps_world_usable() {
    let mut world = world();
    let root = world.create_object(GameObjectDesc::new("root")).unwrap();
    world.add_component(root, Health { hp: 5 }).unwrap();
    assert!(world.post(root, DeleteObject, Duration::from_secs(1)));
    assert_eq!(world.pending_messages(), 1);

    world.clear();
    assert_eq!(world.object_count(), 0);
    assert_eq!(world.component_count(), 0);
    assert_eq!(world.pending_messages(), 0);

    let again = world.create_object(GameObjectDesc::new("again")).unwrap();
    assert!(world.object(again).is_some());
}
