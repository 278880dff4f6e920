//! End-to-end coverage of the world surface: creation, mutation, state,
//! queries and teardown.

use std::sync::Arc;
use std::thread;

use archon::{init, init_with, EcsError, Size, State, WorldConfig, World};

#[derive(Debug, PartialEq)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, PartialEq)]
struct Velocity {
    dx: f32,
    dy: f32,
}

#[derive(Debug, PartialEq)]
struct Health(u32);

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    Running,
}

impl State for Phase {
    fn ordinal(&self) -> u32 {
        *self as u32
    }
}

fn small_world() -> World {
    World::new(WorldConfig::new("test", Size::Small))
}

#[test]
fn create_and_read_back() {
    // Given
    let world = small_world();

    // When
    let entity = world
        .create_entity((Position { x: 1.0, y: 2.0 }, Velocity { dx: 0.5, dy: 0.0 }))
        .unwrap();

    // Then
    assert!(entity.has::<Position>());
    assert!(entity.has::<Velocity>());
    assert!(!entity.has::<Health>());
    assert_eq!(entity.get::<Position>().unwrap().x, 1.0);
    assert_eq!(entity.get::<Velocity>().unwrap().dx, 0.5);
    assert!(entity.contains(&Position { x: 1.0, y: 2.0 }));
    assert!(!entity.contains(&Position { x: 9.0, y: 2.0 }));
}

#[test]
fn component_argument_order_does_not_matter() {
    // Given - the canonical column order is fixed by an earlier entity
    let world = small_world();
    world
        .create_entity((Position { x: 0.0, y: 0.0 }, Velocity { dx: 0.0, dy: 0.0 }, Health(1)))
        .unwrap();

    // When - another entity supplies the same types in a different order
    let entity = world
        .create_entity((Health(42), Position { x: 7.0, y: 8.0 }, Velocity { dx: 1.0, dy: 2.0 }))
        .unwrap();

    // Then - each type reads back the value supplied for it
    assert_eq!(entity.get::<Health>().unwrap().0, 42);
    assert_eq!(entity.get::<Position>().unwrap().x, 7.0);
    assert_eq!(entity.get::<Velocity>().unwrap().dy, 2.0);
}

#[test]
fn duplicate_component_types_are_rejected() {
    // Given
    let world = small_world();

    // When
    let result = world.create_entity((Health(1), Health(2)));

    // Then - no entity was created
    assert!(matches!(result, Err(EcsError::DuplicateComponent(_))));
    assert_eq!(world.size(), 0);
}

#[test]
fn empty_entities_are_allowed() {
    let world = small_world();
    let entity = world.create_entity(()).unwrap();
    assert!(!entity.is_deleted());
    assert!(!entity.has::<Health>());
}

#[test]
fn add_migrates_to_the_superset_composition() {
    // Given - an {Position, Velocity} entity
    let world = small_world();
    let entity = world
        .create_entity((Position { x: 1.0, y: 1.0 }, Velocity { dx: 0.0, dy: 0.0 }))
        .unwrap();

    // When
    assert!(entity.add(Health(10)).unwrap());

    // Then - reachable through the three-component query
    let found: Vec<_> = world
        .find_components::<(Position, Velocity, Health)>()
        .iter()
        .collect();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity, entity);
    assert_eq!(found[0].comp3.0, 10);
    // And the values survived the migration
    assert_eq!(entity.get::<Position>().unwrap().x, 1.0);

    // And the old composition's root tenant no longer holds it
    let index = world.class_index();
    let old_ids = vec![
        index.index_of::<Position>().unwrap(),
        index.index_of::<Velocity>().unwrap(),
    ];
    let old = world.repository().get_or_create(old_ids).unwrap();
    assert_eq!(old.tenant().iter().count(), 0);
}

#[test]
fn add_existing_type_replaces_the_value_in_place() {
    // Given
    let world = small_world();
    let entity = world.create_entity((Health(1),)).unwrap();

    // When
    assert!(entity.add(Health(2)).unwrap());

    // Then - same composition, new value
    assert_eq!(entity.get::<Health>().unwrap().0, 2);
    assert_eq!(world.repository().composition_count(), 1);
}

#[test]
fn add_then_remove_returns_to_the_original_composition() {
    // Given
    let world = small_world();
    let entity = world
        .create_entity((Position { x: 3.0, y: 4.0 }, Velocity { dx: 1.0, dy: 1.0 }))
        .unwrap();

    // When
    entity.add(Health(5)).unwrap();
    assert!(entity.remove::<Health>().unwrap());

    // Then
    assert!(!entity.has::<Health>());
    assert_eq!(entity.get::<Position>().unwrap().y, 4.0);
    let index = world.class_index();
    let original = world
        .repository()
        .get_or_create(vec![
            index.index_of::<Position>().unwrap(),
            index.index_of::<Velocity>().unwrap(),
        ])
        .unwrap();
    assert_eq!(original.tenant().iter().count(), 1);
}

#[test]
fn removing_an_absent_type_is_a_no_op() {
    let world = small_world();
    let entity = world.create_entity((Health(1),)).unwrap();
    assert!(!entity.remove::<Velocity>().unwrap());
    assert!(entity.has::<Health>());
}

#[test]
fn destroy_releases_and_recycles_the_id() {
    // Given
    let world = small_world();
    let first = world.create_entity((Health(1),)).unwrap();
    let first_id = first.id();

    // When
    assert!(world.destroy_entity(&first));

    // Then
    assert!(first.is_deleted());
    assert!(!world.destroy_entity(&first));
    assert_eq!(world.size(), 0);
    // Mutations on the dead handle are sentinel no-ops
    assert!(!first.add(Health(9)).unwrap());
    assert!(!first.remove::<Health>().unwrap());
    assert!(!first.set_state(Some(Phase::Idle)).unwrap());
    assert!(first.get::<Health>().is_none());

    // And the id is reused by the next entity of that composition
    let second = world.create_entity((Health(2),)).unwrap();
    assert_eq!(second.id(), first_id);
}

#[test]
fn queries_iterate_each_matching_entity_exactly_once() {
    // Given - entities across two matching compositions
    let world = small_world();
    let mut expected = Vec::new();
    for i in 0..40 {
        let entity = if i % 2 == 0 {
            world
                .create_entity((Position { x: i as f32, y: 0.0 },))
                .unwrap()
        } else {
            world
                .create_entity((Position { x: i as f32, y: 0.0 }, Health(i)))
                .unwrap()
        };
        expected.push(entity);
    }
    // And one entity that must not match
    world.create_entity((Health(99),)).unwrap();

    // When
    let mut seen: Vec<f32> = world
        .find_components::<(Position,)>()
        .iter()
        .map(|found| found.comp.x)
        .collect();

    // Then
    seen.sort_by(f32::total_cmp);
    assert_eq!(seen.len(), 40);
    for (i, x) in seen.iter().enumerate() {
        assert_eq!(*x, i as f32);
    }
}

#[test]
fn disabled_entities_are_filtered_from_queries() {
    // Given - 1000 single-component entities, half disabled
    let world = small_world();
    let entities: Vec<_> = (0..1000)
        .map(|i| world.create_entity((Health(i),)).unwrap())
        .collect();
    for entity in entities.iter().step_by(2) {
        entity.set_enabled(false);
    }

    // When
    let seen: Vec<u32> = world
        .find_components::<(Health,)>()
        .iter()
        .map(|found| found.comp.0)
        .collect();

    // Then - the 500 enabled ones, each exactly once
    assert_eq!(seen.len(), 500);
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 500);
    assert!(sorted.iter().all(|h| h % 2 == 1));

    // And a re-enabled entity shows up again
    entities[0].set_enabled(true);
    assert_eq!(world.find_components::<(Health,)>().iter().count(), 501);
}

#[test]
fn for_each_fuses_the_projection() {
    // Given
    let world = small_world();
    for i in 0..10 {
        world
            .create_entity((Position { x: i as f32, y: 0.0 }, Velocity { dx: 1.0, dy: 0.0 }))
            .unwrap();
    }

    // When
    let mut total = 0.0;
    let mut visits = 0;
    world
        .find_components::<(Position, Velocity)>()
        .for_each(|(position, velocity, _entity)| {
            total += position.x * velocity.dx;
            visits += 1;
        });

    // Then
    assert_eq!(visits, 10);
    assert_eq!(total, 45.0);
}

#[test]
fn unregistered_query_types_match_nothing() {
    struct NeverAttached;
    let world = small_world();
    world.create_entity((Health(1),)).unwrap();
    assert_eq!(world.find_components::<(NeverAttached,)>().iter().count(), 0);
}

#[test]
fn component_refs_outlive_the_entity() {
    // Given
    let world = small_world();
    let entity = world.create_entity((Health(7),)).unwrap();
    let health = entity.get::<Health>().unwrap();

    // When - the entity dies while the ref is held
    world.destroy_entity(&entity);

    // Then
    assert_eq!(health.0, 7);
}

#[test]
fn state_round_trip() {
    // Given
    let world = small_world();
    let entity = world.create_entity((Health(1),)).unwrap();

    // When
    assert!(entity.set_state(Some(Phase::Running)).unwrap());

    // Then - present in exactly the Running state tenant
    let index = world.class_index();
    let composition = world
        .repository()
        .get_or_create(vec![index.index_of::<Health>().unwrap()])
        .unwrap();
    let running_key = index.state_key(&Phase::Running).unwrap();
    let running = composition.state_tenant(&running_key).unwrap();
    assert_eq!(running.iter().count(), 1);

    // When - switching states
    assert!(entity.set_state(Some(Phase::Idle)).unwrap());

    // Then - moved between state tenants, root untouched
    assert_eq!(running.iter().count(), 0);
    let idle_key = index.state_key(&Phase::Idle).unwrap();
    let idle = composition.state_tenant(&idle_key).unwrap();
    assert_eq!(idle.iter().count(), 1);
    assert_eq!(composition.tenant().iter().count(), 1);

    // When - clearing the state
    assert!(entity.set_state(None::<Phase>).unwrap());

    // Then - in no state tenant, still queryable
    assert_eq!(idle.iter().count(), 0);
    assert_eq!(world.find_components::<(Health,)>().iter().count(), 1);
}

#[test]
fn state_survives_composition_migration() {
    // Given - a stateful entity
    let world = small_world();
    let entity = world.create_entity((Health(1),)).unwrap();
    entity.set_state(Some(Phase::Running)).unwrap();

    // When - its composition changes
    entity.add(Position { x: 0.0, y: 0.0 }).unwrap();

    // Then - the state followed it into the new composition
    let index = world.class_index();
    let target = world
        .repository()
        .get_or_create(vec![
            index.index_of::<Health>().unwrap(),
            index.index_of::<Position>().unwrap(),
        ])
        .unwrap();
    let key = index.state_key(&Phase::Running).unwrap();
    assert_eq!(target.state_tenant(&key).unwrap().iter().count(), 1);
}

#[test]
fn create_entity_as_shares_the_prefab_components() {
    // Given
    let world = small_world();
    let prefab = world
        .create_entity((Position { x: 5.0, y: 5.0 }, Velocity { dx: 0.0, dy: 0.0 }))
        .unwrap();

    // When
    let clone = world.create_entity_as(&prefab, (Health(3),)).unwrap();

    // Then - the union of components, values shared with the prefab
    assert_eq!(clone.get::<Position>().unwrap().x, 5.0);
    assert_eq!(clone.get::<Health>().unwrap().0, 3);
    assert!(prefab.get::<Health>().is_none());
    let shared: *const Position = &*clone.get::<Position>().unwrap();
    let original: *const Position = &*prefab.get::<Position>().unwrap();
    assert_eq!(shared, original);

    // And overlapping extras are rejected
    assert!(matches!(
        world.create_entity_as(&prefab, (Position { x: 0.0, y: 0.0 },)),
        Err(EcsError::DuplicateComponent(_))
    ));
}

#[test]
fn provider_discovery() {
    // The default name resolves; unknown names surface not-found.
    let world = init();
    assert!(world.create_entity((Health(1),)).is_ok());
    assert!(matches!(
        init_with("missing-engine", WorldConfig::default()),
        Err(EcsError::ProviderNotFound(_))
    ));
}

#[test]
fn close_releases_the_pool() {
    // Given
    let world = small_world();
    let entity = world.create_entity((Health(1),)).unwrap();

    // When
    world.close();

    // Then - handles stay safe, lookups resolve to nothing
    assert_eq!(world.size(), 0);
    assert!(entity.get::<Health>().is_none());
    assert_eq!(world.find_components::<(Health,)>().iter().count(), 0);
    assert!(world.create_entity((Health(2),)).is_err());
}

#[test]
fn random_destruction_order_keeps_queries_exact() {
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
    use std::collections::HashSet;

    // Given - 200 entities destroyed in a shuffled order
    let world = small_world();
    let mut entities: Vec<_> = (0..200u32)
        .map(|i| world.create_entity((Health(i),)).unwrap())
        .collect();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    entities.shuffle(&mut rng);

    // When - half of them die, in that order
    let mut live = HashSet::new();
    for (i, entity) in entities.iter().enumerate() {
        if i % 2 == 0 {
            assert!(world.destroy_entity(entity));
        } else {
            live.insert(entity.get::<Health>().unwrap().0);
        }
    }

    // Then - queries see exactly the survivors
    let seen: HashSet<u32> = world
        .find_components::<(Health,)>()
        .iter()
        .map(|found| found.comp.0)
        .collect();
    assert_eq!(seen, live);
    assert_eq!(world.size(), 100);
}

#[test]
fn queries_racing_new_compositions_see_every_match() {
    struct M0;
    struct M1;
    struct M2;
    struct M3;
    struct M4;
    struct M5;
    struct M6;
    struct M7;

    // Each creator thread mints a brand-new composition (Position plus its
    // own marker) while a finder races the node build for {Position}. A
    // dropped (composition, node) link would make the settled query below
    // miss an entity permanently.
    for _ in 0..8 {
        let world = Arc::new(small_world());

        let creators: Vec<_> = (0..8)
            .map(|t| {
                let world = Arc::clone(&world);
                thread::spawn(move || {
                    let position = Position {
                        x: t as f32,
                        y: 0.0,
                    };
                    match t {
                        0 => world.create_entity((position, M0)).unwrap(),
                        1 => world.create_entity((position, M1)).unwrap(),
                        2 => world.create_entity((position, M2)).unwrap(),
                        3 => world.create_entity((position, M3)).unwrap(),
                        4 => world.create_entity((position, M4)).unwrap(),
                        5 => world.create_entity((position, M5)).unwrap(),
                        6 => world.create_entity((position, M6)).unwrap(),
                        _ => world.create_entity((position, M7)).unwrap(),
                    }
                })
            })
            .collect();
        let finder = {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                for _ in 0..100 {
                    let _ = world.find_components::<(Position,)>().iter().count();
                }
            })
        };
        for creator in creators {
            creator.join().unwrap();
        }
        finder.join().unwrap();

        // Quiesced: every creator's entity is found exactly once.
        let mut seen: Vec<f32> = world
            .find_components::<(Position,)>()
            .iter()
            .map(|found| found.comp.x)
            .collect();
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen.len(), 8);
        for (i, x) in seen.iter().enumerate() {
            assert_eq!(*x, i as f32);
        }
    }
}

#[test]
fn concurrent_create_and_destroy_settle_consistently() {
    // Given
    let world = Arc::new(small_world());
    let threads = 8;
    let per_thread = 500;

    // When - mixed create/mutate/destroy traffic
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let world = Arc::clone(&world);
            thread::spawn(move || {
                let mut kept: u32 = 0;
                for i in 0..per_thread {
                    let entity = world
                        .create_entity((Position { x: t as f32, y: i as f32 },))
                        .unwrap();
                    if i % 5 == 0 {
                        entity.add(Health(i)).unwrap();
                        kept += 1;
                    } else if i % 2 == 0 {
                        world.destroy_entity(&entity);
                    } else {
                        kept += 1;
                    }
                }
                kept
            })
        })
        .collect();
    let expected: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // Then - every surviving entity is found exactly once
    let found = world.find_components::<(Position,)>().iter().count() as u32;
    assert_eq!(found, expected);
    assert_eq!(world.size(), expected);
}
