//! Filter completeness: the entities produced by a cached filter equal a
//! brute-force evaluation of the mask predicate over every entity's schema.

use std::collections::HashSet;

use colonnade_ecs::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy, Default)]
struct K0(u8);
#[derive(Debug, Clone, Copy, Default)]
struct K1(u8);
#[derive(Debug, Clone, Copy, Default)]
struct K2(u8);
#[derive(Debug, Clone, Copy, Default)]
struct K3(u8);
#[derive(Debug, Clone, Default)]
struct K4(String);

const KINDS: usize = 5;

fn ids() -> [ComponentId; KINDS] {
    [
        component_id::<K0>(),
        component_id::<K1>(),
        component_id::<K2>(),
        component_id::<K3>(),
        component_id::<K4>(),
    ]
}

fn members(bits: u8) -> Vec<ComponentId> {
    let ids = ids();
    (0..KINDS).filter(|k| bits & (1 << k) != 0).map(|k| ids[k]).collect()
}

#[derive(Debug, Clone)]
struct MaskShape {
    has: u8,
    exclude: u8,
    some: Vec<u8>,
    not_all: Vec<u8>,
}

impl MaskShape {
    fn build(&self) -> ComponentMask {
        let mut mask = ComponentMask::new();
        for id in members(self.has) {
            mask = mask.has_id(id);
        }
        for id in members(self.exclude) {
            mask = mask.exclude_id(id);
        }
        for &g in &self.some {
            mask = mask.some(members(g));
        }
        for &g in &self.not_all {
            mask = mask.not_all(members(g));
        }
        mask
    }

    fn is_valid(&self) -> bool {
        self.has & self.exclude == 0
            && self.some.iter().all(|&g| g != 0)
            && self.not_all.iter().all(|&g| g != 0)
    }

    fn matches(&self, schema: u8) -> bool {
        self.has & schema == self.has
            && self.exclude & schema == 0
            && self.some.iter().all(|&g| g & schema != 0)
            && self.not_all.iter().all(|&g| g & schema != g)
    }
}

fn mask_strategy() -> impl Strategy<Value = MaskShape> {
    let group = 0u8..(1 << KINDS);
    (
        group.clone(),
        group.clone(),
        prop::collection::vec(group.clone(), 0..3),
        prop::collection::vec(group, 0..3),
    )
        .prop_map(|(has, exclude, some, not_all)| MaskShape {
            has,
            exclude,
            some,
            not_all,
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn filter_matches_brute_force(
        schemas in prop::collection::vec(0u8..(1 << KINDS), 0..40),
        masks in prop::collection::vec(mask_strategy(), 1..6),
        late in prop::collection::vec(0u8..(1 << KINDS), 0..10),
    ) {
        let world = World::new();
        let mut population: Vec<(Entity, u8)> = Vec::new();
        for &schema in &schemas {
            population.push((world.spawn_schema(&members(schema)).unwrap(), schema));
        }

        // Build filters first so later archetypes exercise incremental offers.
        for shape in &masks {
            if shape.is_valid() {
                world.filter(&shape.build()).unwrap();
            }
        }
        for &schema in &late {
            population.push((world.spawn_schema(&members(schema)).unwrap(), schema));
        }

        for shape in &masks {
            let mask = shape.build();
            if !shape.is_valid() {
                prop_assert!(world.entities_matching(&mask).is_err());
                continue;
            }
            let found: HashSet<Entity> =
                world.entities_matching(&mask).unwrap().into_iter().collect();
            let expected: HashSet<Entity> = population
                .iter()
                .filter(|(_, schema)| shape.matches(*schema))
                .map(|(e, _)| *e)
                .collect();
            prop_assert_eq!(found, expected);

            let filter = world.filter(&mask).unwrap();
            let brute = world
                .archetypes()
                .iter()
                .filter(|a| mask.matches(a.mask()))
                .count();
            prop_assert_eq!(filter.len(), brute);
        }
    }
}
