//! Property tests for world storage.
//!
//! Random sequences of structural operations are applied to a world and to a
//! plain model; after every step the world must agree with the model and keep
//! every archetype dense.

use std::collections::{HashMap, HashSet};

use colonnade_ecs::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Pos(i32);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Vel(i32);

#[derive(Debug, Clone, Default, PartialEq)]
struct Name(String);

#[derive(Debug, Clone, Default, PartialEq)]
struct Model {
    pos: Option<Pos>,
    vel: Option<Vel>,
    name: Option<Name>,
}

#[derive(Debug, Clone)]
enum Op {
    Spawn(Option<i32>, Option<i32>),
    Despawn(usize),
    SetPos(usize, i32),
    SetVel(usize, i32),
    SetName(usize, String),
    RemovePos(usize),
    RemoveVel(usize),
    RemoveName(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (proptest::option::of(any::<i32>()), proptest::option::of(any::<i32>()))
            .prop_map(|(p, v)| Op::Spawn(p, v)),
        (0..64usize).prop_map(Op::Despawn),
        (0..64usize, any::<i32>()).prop_map(|(i, v)| Op::SetPos(i, v)),
        (0..64usize, any::<i32>()).prop_map(|(i, v)| Op::SetVel(i, v)),
        (0..64usize, "[a-z]{0,8}").prop_map(|(i, s)| Op::SetName(i, s)),
        (0..64usize).prop_map(Op::RemovePos),
        (0..64usize).prop_map(Op::RemoveVel),
        (0..64usize).prop_map(Op::RemoveName),
    ]
}

fn pick(alive: &[Entity], i: usize) -> Option<Entity> {
    if alive.is_empty() {
        None
    } else {
        Some(alive[i % alive.len()])
    }
}

fn check(world: &World, model: &HashMap<Entity, Model>) -> Result<(), TestCaseError> {
    prop_assert_eq!(world.entity_count(), model.len());

    // Every live entity appears exactly once across all archetypes.
    let all = world.entities_matching(&ComponentMask::new()).unwrap();
    prop_assert_eq!(all.len(), model.len());
    let unique: HashSet<Entity> = all.iter().copied().collect();
    prop_assert_eq!(unique.len(), all.len());

    let rows: usize = world.archetypes().iter().map(|a| a.len()).sum();
    prop_assert_eq!(rows, model.len());

    for (&e, m) in model {
        prop_assert!(world.is_alive(e));
        prop_assert_eq!(world.get_component::<Pos>(e), m.pos);
        prop_assert_eq!(world.get_component::<Vel>(e), m.vel);
        prop_assert_eq!(world.get_component::<Name>(e), m.name.clone());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn random_ops_keep_world_and_model_in_sync(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let world = World::with_config(WorldConfig::default().with_validation(false));
        let mut model: HashMap<Entity, Model> = HashMap::new();
        let mut alive: Vec<Entity> = Vec::new();

        for op in ops {
            match op {
                Op::Spawn(p, v) => {
                    let mut bundle = ComponentBundle::new();
                    if let Some(p) = p {
                        bundle.add(Pos(p));
                    }
                    if let Some(v) = v {
                        bundle.add(Vel(v));
                    }
                    let e = world.spawn(bundle);
                    model.insert(e, Model { pos: p.map(Pos), vel: v.map(Vel), name: None });
                    alive.push(e);
                }
                Op::Despawn(i) => {
                    if let Some(e) = pick(&alive, i) {
                        world.despawn(e).unwrap();
                        model.remove(&e);
                        alive.retain(|x| *x != e);
                        prop_assert!(!world.is_alive(e));
                    }
                }
                Op::SetPos(i, v) => {
                    if let Some(e) = pick(&alive, i) {
                        world.set_component(e, Pos(v)).unwrap();
                        model.get_mut(&e).unwrap().pos = Some(Pos(v));
                    }
                }
                Op::SetVel(i, v) => {
                    if let Some(e) = pick(&alive, i) {
                        world.add_component(e, Vel(v)).unwrap();
                        model.get_mut(&e).unwrap().vel = Some(Vel(v));
                    }
                }
                Op::SetName(i, s) => {
                    if let Some(e) = pick(&alive, i) {
                        world.set_component(e, Name(s.clone())).unwrap();
                        model.get_mut(&e).unwrap().name = Some(Name(s));
                    }
                }
                Op::RemovePos(i) => {
                    if let Some(e) = pick(&alive, i) {
                        world.remove_component::<Pos>(e).unwrap();
                        model.get_mut(&e).unwrap().pos = None;
                    }
                }
                Op::RemoveVel(i) => {
                    if let Some(e) = pick(&alive, i) {
                        world.remove_component::<Vel>(e).unwrap();
                        model.get_mut(&e).unwrap().vel = None;
                    }
                }
                Op::RemoveName(i) => {
                    if let Some(e) = pick(&alive, i) {
                        world.unset_component::<Name>(e).unwrap();
                        model.get_mut(&e).unwrap().name = None;
                    }
                }
            }
            check(&world, &model)?;
        }
    }

    #[test]
    fn add_then_remove_restores_archetype_and_values(
        start in any::<i32>(),
        vel in any::<i32>(),
        name in "[a-z]{0,6}",
    ) {
        let world = World::with_config(WorldConfig::default().with_validation(true));
        let e = world.spawn(ComponentBundle::new().with(Pos(start)));
        let home = world.archetype_of(e);

        world.add_component(e, Vel(vel)).unwrap();
        world.add_component(e, Name(name)).unwrap();
        world.remove_component::<Name>(e).unwrap();
        world.remove_component::<Vel>(e).unwrap();

        prop_assert_eq!(world.archetype_of(e), home);
        prop_assert_eq!(world.get_component::<Pos>(e), Some(Pos(start)));
    }

    #[test]
    fn issued_handles_are_never_reused(ops in prop::collection::vec(any::<bool>(), 1..200)) {
        let world = World::new();
        let mut issued: HashSet<Entity> = HashSet::new();
        let mut alive: Vec<Entity> = Vec::new();
        let mut dead: Vec<Entity> = Vec::new();

        for spawn in ops {
            if spawn || alive.is_empty() {
                let e = world.create_entity();
                prop_assert!(issued.insert(e), "handle {e:?} issued twice");
                prop_assert!(e.generation() >= 1);
                alive.push(e);
            } else {
                let e = alive.remove(0);
                world.despawn(e).unwrap();
                dead.push(e);
            }
        }
        for e in dead {
            prop_assert!(!world.is_alive(e));
        }
        for e in alive {
            prop_assert!(world.is_alive(e));
            prop_assert_eq!(Entity::from_bits(e.to_bits()), e);
        }
    }
}
