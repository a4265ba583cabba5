//! Property tests for deferred structural changes.
//!
//! The same operation sequence is applied to two worlds: directly to one, and
//! to the other while the entities' archetype is locked. The locked world must
//! report the same virtual view during the lock and the same committed state
//! after it is released.

use colonnade_ecs::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Pos(i32);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Vel(i32);

#[derive(Debug, Clone, Default, PartialEq)]
struct Label(String);

struct Marked;

#[derive(Debug, Clone)]
enum Op {
    Spawn(i32),
    Despawn(usize),
    AddVel(usize, i32),
    AddVelById(usize),
    RemoveVel(usize),
    SetLabel(usize, String),
    RemoveLabel(usize),
    SetPos(usize, i32),
    Mark(usize),
    Unmark(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<i32>().prop_map(Op::Spawn),
        (0..16usize).prop_map(Op::Despawn),
        (0..16usize, any::<i32>()).prop_map(|(i, v)| Op::AddVel(i, v)),
        (0..16usize).prop_map(Op::AddVelById),
        (0..16usize).prop_map(Op::RemoveVel),
        (0..16usize, "[a-z]{1,4}").prop_map(|(i, s)| Op::SetLabel(i, s)),
        (0..16usize).prop_map(Op::RemoveLabel),
        (0..16usize, any::<i32>()).prop_map(|(i, v)| Op::SetPos(i, v)),
        (0..16usize).prop_map(Op::Mark),
        (0..16usize).prop_map(Op::Unmark),
    ]
}

/// Index of the `i`-th live entity, wrapping.
fn target(i: usize, alive: &[bool]) -> Option<usize> {
    let live: Vec<usize> = (0..alive.len()).filter(|&k| alive[k]).collect();
    if live.is_empty() {
        None
    } else {
        Some(live[i % live.len()])
    }
}

fn apply(world: &World, entities: &mut Vec<Entity>, alive: &mut Vec<bool>, op: &Op) {
    let marked = tag_id::<Marked>();
    match op {
        Op::Spawn(p) => {
            entities.push(world.spawn(ComponentBundle::new().with(Pos(*p))));
            alive.push(true);
        }
        Op::Despawn(i) => {
            if let Some(k) = target(*i, alive) {
                world.despawn(entities[k]).unwrap();
                alive[k] = false;
            }
        }
        Op::AddVel(i, v) => {
            if let Some(k) = target(*i, alive) {
                world.add_component(entities[k], Vel(*v)).unwrap();
            }
        }
        Op::AddVelById(i) => {
            if let Some(k) = target(*i, alive) {
                world
                    .add_component_by_id(entities[k], component_id::<Vel>())
                    .unwrap();
            }
        }
        Op::RemoveVel(i) => {
            if let Some(k) = target(*i, alive) {
                world.remove_component::<Vel>(entities[k]).unwrap();
            }
        }
        Op::SetLabel(i, s) => {
            if let Some(k) = target(*i, alive) {
                world.set_component(entities[k], Label(s.clone())).unwrap();
            }
        }
        Op::RemoveLabel(i) => {
            if let Some(k) = target(*i, alive) {
                world.unset_component::<Label>(entities[k]).unwrap();
            }
        }
        Op::SetPos(i, v) => {
            if let Some(k) = target(*i, alive) {
                world.set_component(entities[k], Pos(*v)).unwrap();
            }
        }
        Op::Mark(i) => {
            if let Some(k) = target(*i, alive) {
                world.add_tag(entities[k], marked).unwrap();
            }
        }
        Op::Unmark(i) => {
            if let Some(k) = target(*i, alive) {
                world.remove_tag(entities[k], marked).unwrap();
            }
        }
    }
}

fn assert_same(
    direct: &World,
    direct_entities: &[Entity],
    deferred: &World,
    deferred_entities: &[Entity],
) -> Result<(), TestCaseError> {
    prop_assert_eq!(direct.entity_count(), deferred.entity_count());
    let marked = tag_id::<Marked>();
    for (&a, &b) in direct_entities.iter().zip(deferred_entities) {
        prop_assert_eq!(direct.is_alive(a), deferred.is_alive(b));
        if !direct.is_alive(a) {
            continue;
        }
        prop_assert_eq!(direct.get_component::<Pos>(a), deferred.get_component::<Pos>(b));
        prop_assert_eq!(direct.get_component::<Vel>(a), deferred.get_component::<Vel>(b));
        prop_assert_eq!(direct.get_component::<Label>(a), deferred.get_component::<Label>(b));
        prop_assert_eq!(direct.has_tag(a, marked), deferred.has_tag(b, marked));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn buffered_ops_fold_to_the_direct_result(
        initial in prop::collection::vec(any::<i32>(), 1..8),
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let config = WorldConfig::default().with_validation(false);
        let direct = World::with_config(config.clone());
        let deferred = World::with_config(config);

        let mut direct_entities: Vec<Entity> =
            initial.iter().map(|&p| direct.spawn(ComponentBundle::new().with(Pos(p)))).collect();
        let mut deferred_entities: Vec<Entity> =
            initial.iter().map(|&p| deferred.spawn(ComponentBundle::new().with(Pos(p)))).collect();
        let mut direct_alive = vec![true; initial.len()];
        let mut deferred_alive = vec![true; initial.len()];

        let home = deferred.archetype_of(deferred_entities[0]).unwrap();
        let before = deferred.archetype(home).unwrap().len();
        {
            let _lock = deferred.lock_archetype(home).unwrap();
            for op in &ops {
                apply(&direct, &mut direct_entities, &mut direct_alive, op);
                apply(&deferred, &mut deferred_entities, &mut deferred_alive, op);
                // Rows of the locked archetype never move.
                prop_assert_eq!(deferred.archetype(home).unwrap().len(), before);
                assert_same(&direct, &direct_entities, &deferred, &deferred_entities)?;
            }
        }
        prop_assert!(!deferred.archetype(home).unwrap().is_locked());
        assert_same(&direct, &direct_entities, &deferred, &deferred_entities)?;

        // Every surviving pair ends up with the same schema.
        for (&a, &b) in direct_entities.iter().zip(&deferred_entities) {
            if !direct.is_alive(a) {
                continue;
            }
            let da = direct.archetype(direct.archetype_of(a).unwrap()).unwrap();
            let db = deferred.archetype(deferred.archetype_of(b).unwrap()).unwrap();
            let na: Vec<&str> = da.definition().infos().iter().map(|i| i.name).collect();
            let nb: Vec<&str> = db.definition().infos().iter().map(|i| i.name).collect();
            prop_assert_eq!(na, nb);
        }
    }
}
