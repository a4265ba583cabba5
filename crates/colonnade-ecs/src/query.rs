//! Scans over the archetypes matching a [`ComponentMask`].
//!
//! A scan locks one archetype (so structural changes to its entities are
//! buffered), negotiates column access for the mask's read and write sets,
//! and hands the caller an [`ArchetypeScan`] with contiguous column slices.
//!
//! ## Soundness
//!
//! Column slices are valid for the lifetime of the scan because a locked
//! archetype's storage is never reallocated or reordered. Aliasing is ruled
//! out by the column access states: a written column is held exclusively by
//! one scan and each write slice is handed out at most once.
//!
//! The typed [`World::for_each`] family derives its mask from a tuple of
//! `&T` / `&mut T` items (up to five) and runs a per-row callback.

use std::cell::RefCell;
use std::sync::Arc;

use rayon::prelude::*;

use crate::access::AccessGuard;
use crate::archetype::{Archetype, Storage};
use crate::bitmask::BitMask;
use crate::component::{component_info, Component, TagBits};
use crate::entity::Entity;
use crate::mask::{ComponentMask, TagMask};
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ArchetypeScan
// ---------------------------------------------------------------------------

/// One locked archetype with negotiated column access.
pub struct ArchetypeScan<'a> {
    world: &'a World,
    archetype: &'a Archetype,
    storage: &'a Storage,
    access: AccessGuard<'a>,
    /// Write columns already handed out.
    handed_out: RefCell<BitMask>,
    len: usize,
}

impl<'a> ArchetypeScan<'a> {
    /// Negotiate access on a locked `archetype`.
    fn new(world: &'a World, archetype: &'a Archetype, mask: &ComponentMask) -> Self {
        debug_assert!(archetype.is_locked());
        let tags = component_info::<TagBits>().id;
        let mut reads = Vec::new();
        let mut writes = Vec::new();
        for (column, info) in archetype.definition().infos().iter().enumerate() {
            let bit = info.id.index();
            if mask.write_mask().get(bit) {
                writes.push(column);
            } else if mask.has_mask().get(bit)
                || mask.some_masks().iter().any(|g| g.get(bit))
                || info.id == tags
            {
                reads.push(column);
            }
        }
        let access = archetype.borrows.acquire(&reads, &writes);
        // SAFETY: the archetype is locked, so its storage is not mutated
        // structurally until the lock is released after this scan.
        let storage = unsafe { archetype.storage() };
        Self {
            world,
            archetype,
            storage,
            access,
            handed_out: RefCell::new(BitMask::new()),
            len: storage.count,
        }
    }

    pub fn archetype(&self) -> &Archetype {
        self.archetype
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entities in row order.
    pub fn entities(&self) -> &[Entity] {
        &self.storage.entities[..self.len]
    }

    /// Read-only slice of column `T`.
    ///
    /// `T` must be declared as read (not write) in the scan's mask.
    pub fn read<T: Component>(&self) -> Result<&[T], EcsError> {
        let ptr = self.column_ptr::<T>(false)?;
        // SAFETY: `len` initialised rows; column held for reading.
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.len) })
    }

    /// Mutable slice of column `T`. Each write column is handed out once.
    #[allow(clippy::mut_from_ref)]
    pub fn write<T: Component>(&self) -> Result<&mut [T], EcsError> {
        let ptr = self.column_ptr::<T>(true)?;
        // SAFETY: `len` initialised rows; column held exclusively and handed
        // out only once.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.len) })
    }

    /// Base pointer of column `T` after checking the declared access.
    pub(crate) fn column_ptr<T: Component>(&self, write: bool) -> Result<*mut T, EcsError> {
        let info = component_info::<T>();
        let column = self.archetype.column_index(info.id).ok_or_else(|| {
            EcsError::InvalidArgument(format!(
                "archetype {:?} has no column {}",
                self.archetype.id(),
                info.name
            ))
        })?;
        if write {
            if !self.access.writes(column) {
                return Err(EcsError::InvalidArgument(format!(
                    "column {} not declared for write",
                    info.name
                )));
            }
            let mut handed_out = self.handed_out.borrow_mut();
            if handed_out.get(column) {
                return Err(EcsError::InvalidArgument(format!(
                    "column {} already handed out for write",
                    info.name
                )));
            }
            handed_out.set(column);
        } else if !self.access.reads(column) {
            return Err(EcsError::InvalidArgument(format!(
                "column {} not declared for read",
                info.name
            )));
        }
        Ok(self.storage.columns[column].data_ptr::<T>())
    }

    /// Whether the entity at `row` has `T`, counting buffered changes.
    pub fn has_component<T: Component>(&self, row: usize) -> bool {
        self.world.has_component::<T>(self.entities()[row])
    }

    /// Buffered value of `T` for the entity at `row`.
    pub fn pending_component<T: Component>(&self, row: usize) -> Option<T> {
        self.world.pending_component::<T>(self.entities()[row])
    }

    /// Rows whose committed tags satisfy `tags`.
    pub fn matching_rows(&self, tags: &TagMask) -> Result<Vec<usize>, EcsError> {
        tags.validate()?;
        let Some(column) = self.archetype.column_index(component_info::<TagBits>().id) else {
            let rows = if tags.matches(&TagBits::default()) {
                (0..self.len).collect()
            } else {
                Vec::new()
            };
            return Ok(rows);
        };
        if self.access.writes(column) {
            return Err(EcsError::InvalidArgument(
                "tags column is declared for write in this scan".into(),
            ));
        }
        let bits = self.storage.columns[column].data_ptr::<TagBits>();
        // SAFETY: `len` initialised rows; the tags column is always read.
        let bits = unsafe { std::slice::from_raw_parts(bits, self.len) };
        Ok((0..self.len).filter(|&row| tags.matches(&bits[row])).collect())
    }
}

impl std::fmt::Debug for ArchetypeScan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchetypeScan")
            .field("archetype", &self.archetype.id())
            .field("len", &self.len)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// World scan entry points
// ---------------------------------------------------------------------------

impl World {
    fn scan_archetype<F>(
        &self,
        archetype: &Arc<Archetype>,
        mask: &ComponentMask,
        f: F,
    ) -> Result<(), EcsError>
    where
        F: FnOnce(&ArchetypeScan<'_>) -> Result<(), EcsError>,
    {
        let _lock = self.lock_archetype_arc(archetype);
        let scan = ArchetypeScan::new(self, archetype, mask);
        f(&scan)
    }

    /// Run `f` once per non-empty archetype matching `mask`.
    ///
    /// Structural changes made from inside `f` are buffered and applied when
    /// the archetype is released. Reading a column through
    /// [`World::get_component`] that this scan holds for write deadlocks.
    pub fn query<F>(&self, mask: &ComponentMask, mut f: F) -> Result<(), EcsError>
    where
        F: FnMut(&ArchetypeScan<'_>) -> Result<(), EcsError>,
    {
        let filter = self.filter(mask)?;
        for archetype in filter.archetypes() {
            if archetype.is_empty() {
                continue;
            }
            self.scan_archetype(&archetype, mask, &mut f)?;
        }
        Ok(())
    }

    /// [`World::query`] with one rayon task per archetype.
    pub fn query_parallel<F>(&self, mask: &ComponentMask, f: F) -> Result<(), EcsError>
    where
        F: Fn(&ArchetypeScan<'_>) -> Result<(), EcsError> + Send + Sync,
    {
        let filter = self.filter(mask)?;
        filter
            .archetypes()
            .par_iter()
            .filter(|archetype| !archetype.is_empty())
            .try_for_each(|archetype| self.scan_archetype(archetype, mask, &f))
    }

    /// Entities in archetypes matching `mask`.
    pub fn entities_matching(&self, mask: &ComponentMask) -> Result<Vec<Entity>, EcsError> {
        let mut out = Vec::new();
        self.query(mask, |scan| {
            out.extend_from_slice(scan.entities());
            Ok(())
        })?;
        Ok(out)
    }

    /// Entities matching `mask` whose tags satisfy `tags`.
    pub fn entities_matching_tags(
        &self,
        mask: &ComponentMask,
        tags: &TagMask,
    ) -> Result<Vec<Entity>, EcsError> {
        tags.validate()?;
        let mut out = Vec::new();
        self.query(mask, |scan| {
            let entities = scan.entities();
            out.extend(scan.matching_rows(tags)?.into_iter().map(|row| entities[row]));
            Ok(())
        })?;
        Ok(out)
    }

    /// Call `f` for every entity that has the components named by `Q`.
    ///
    /// ```
    /// use colonnade_ecs::prelude::*;
    ///
    /// #[derive(Debug, Clone, Default, PartialEq)]
    /// struct Position(f32);
    /// #[derive(Debug, Clone, Default, PartialEq)]
    /// struct Velocity(f32);
    ///
    /// let world = World::new();
    /// let e = world.spawn(ComponentBundle::new().with(Position(0.0)).with(Velocity(2.0)));
    /// world
    ///     .for_each::<(&mut Position, &Velocity), _>(|_, (p, v): (&mut Position, &Velocity)| {
    ///         p.0 += v.0;
    ///     })
    ///     .unwrap();
    /// assert_eq!(world.get_component::<Position>(e), Some(Position(2.0)));
    /// ```
    pub fn for_each<Q, F>(&self, f: F) -> Result<(), EcsError>
    where
        Q: Query,
        F: for<'r> FnMut(Entity, Q::Item<'r>),
    {
        self.for_each_with::<Q, F>(&ComponentMask::new(), f)
    }

    /// [`World::for_each`] restricted further by `mask`.
    pub fn for_each_with<Q, F>(&self, mask: &ComponentMask, mut f: F) -> Result<(), EcsError>
    where
        Q: Query,
        F: for<'r> FnMut(Entity, Q::Item<'r>),
    {
        let mask = Q::mask().merge(mask);
        self.query(&mask, |scan| {
            let ptrs = Q::ptrs(scan)?;
            for (row, &entity) in scan.entities().iter().enumerate() {
                // SAFETY: `row < len` and the pointers were checked against
                // the scan's negotiated access.
                f(entity, unsafe { Q::fetch(ptrs, row) });
            }
            Ok(())
        })
    }

    /// [`World::for_each`] with one rayon task per archetype.
    pub fn par_for_each<Q, F>(&self, f: F) -> Result<(), EcsError>
    where
        Q: Query,
        F: for<'r> Fn(Entity, Q::Item<'r>) + Send + Sync,
    {
        self.query_parallel(&Q::mask(), |scan| {
            let ptrs = Q::ptrs(scan)?;
            for (row, &entity) in scan.entities().iter().enumerate() {
                // SAFETY: as in `for_each_with`.
                f(entity, unsafe { Q::fetch(ptrs, row) });
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// QueryItem / Query
// ---------------------------------------------------------------------------

/// One element of a typed query: `&T` (read) or `&mut T` (write).
pub trait QueryItem {
    /// Per-row output.
    type Item<'r>;
    /// The component type accessed.
    type Value: Component;
    /// Whether this item borrows mutably.
    const MUTABLE: bool;

    /// # Safety
    ///
    /// `ptr` must be a column base pointer obtained from a live scan with the
    /// matching access, and `row` below the scan's length.
    unsafe fn fetch<'r>(ptr: *mut Self::Value, row: usize) -> Self::Item<'r>;
}

impl<T: Component> QueryItem for &T {
    type Item<'r> = &'r T;
    type Value = T;
    const MUTABLE: bool = false;

    unsafe fn fetch<'r>(ptr: *mut T, row: usize) -> &'r T {
        &*ptr.add(row)
    }
}

impl<T: Component> QueryItem for &mut T {
    type Item<'r> = &'r mut T;
    type Value = T;
    const MUTABLE: bool = true;

    unsafe fn fetch<'r>(ptr: *mut T, row: usize) -> &'r mut T {
        &mut *ptr.add(row)
    }
}

/// A tuple of one to five [`QueryItem`]s.
pub trait Query {
    /// Per-row output tuple.
    type Item<'r>;
    /// Column base pointers for one archetype.
    type Ptrs: Copy;

    /// Mask selecting archetypes that have every item's component.
    fn mask() -> ComponentMask;

    /// Resolve column pointers, failing if two items alias a written column.
    fn ptrs(scan: &ArchetypeScan<'_>) -> Result<Self::Ptrs, EcsError>;

    /// # Safety
    ///
    /// `ptrs` must come from [`Query::ptrs`] on a scan that is still alive and
    /// `row` must be below its length.
    unsafe fn fetch<'r>(ptrs: Self::Ptrs, row: usize) -> Self::Item<'r>;
}

macro_rules! impl_query {
    ($($item:ident $idx:tt),+) => {
        impl<$($item: QueryItem),+> Query for ($($item,)+) {
            type Item<'r> = ($($item::Item<'r>,)+);
            type Ptrs = ($(*mut $item::Value,)+);

            fn mask() -> ComponentMask {
                let mask = ComponentMask::new();
                $(
                    let mask = if $item::MUTABLE {
                        mask.write::<$item::Value>()
                    } else {
                        mask.has::<$item::Value>()
                    };
                )+
                mask
            }

            fn ptrs(scan: &ArchetypeScan<'_>) -> Result<Self::Ptrs, EcsError> {
                Ok(($(scan.column_ptr::<$item::Value>($item::MUTABLE)?,)+))
            }

            unsafe fn fetch<'r>(ptrs: Self::Ptrs, row: usize) -> Self::Item<'r> {
                ($(<$item as QueryItem>::fetch(ptrs.$idx, row),)+)
            }
        }
    };
}

impl_query!(A 0);
impl_query!(A 0, B 1);
impl_query!(A 0, B 1, C 2);
impl_query!(A 0, B 1, C 2, D 3);
impl_query!(A 0, B 1, C 2, D 3, E 4);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::tag_id;
    use crate::config::WorldConfig;
    use crate::world::ComponentBundle;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Pos(f32);
    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Vel(f32);
    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Mass(f32);
    #[derive(Debug, Clone, Default, PartialEq)]
    struct Label(String);

    struct Asleep;

    fn world() -> World {
        World::with_config(WorldConfig::default().with_validation(true))
    }

    fn moving(world: &World, n: usize) -> Vec<Entity> {
        (0..n)
            .map(|i| world.spawn(ComponentBundle::new().with(Pos(i as f32)).with(Vel(1.0))))
            .collect()
    }

    // -- slices ---------------------------------------------------------------

    #[test]
    fn scan_reads_and_writes_columns() {
        let world = world();
        let entities = moving(&world, 4);
        let mask = ComponentMask::new().write::<Pos>().has::<Vel>();
        world
            .query(&mask, |scan| {
                let vel = scan.read::<Vel>()?;
                let pos = scan.write::<Pos>()?;
                for (p, v) in pos.iter_mut().zip(vel) {
                    p.0 += v.0;
                }
                Ok(())
            })
            .unwrap();
        for (i, e) in entities.iter().enumerate() {
            assert_eq!(world.get_component::<Pos>(*e), Some(Pos(i as f32 + 1.0)));
        }
    }

    #[test]
    fn undeclared_and_double_write_access_is_rejected() {
        let world = world();
        moving(&world, 1);
        let mask = ComponentMask::new().write::<Pos>();
        world
            .query(&mask, |scan| {
                assert!(scan.read::<Pos>().is_err());
                assert!(scan.read::<Vel>().is_err());
                assert!(scan.write::<Vel>().is_err());
                let _pos = scan.write::<Pos>()?;
                assert!(scan.write::<Pos>().is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn errors_from_the_callback_propagate() {
        let world = world();
        moving(&world, 1);
        let err = world
            .query(&ComponentMask::new().has::<Pos>(), |scan| {
                scan.read::<Mass>().map(|_| ())
            })
            .unwrap_err();
        assert!(matches!(err, EcsError::InvalidArgument(_)));
        // The archetype was released on the error path.
        assert!(world.archetypes().iter().all(|a| !a.is_locked()));
    }

    // -- deferred structural changes -----------------------------------------

    #[test]
    fn structural_changes_inside_a_scan_are_deferred() {
        let world = world();
        let entities = moving(&world, 3);
        world
            .query(&ComponentMask::new().has::<Pos>(), |scan| {
                for (row, &e) in scan.entities().iter().enumerate() {
                    world.add_component(e, Mass(row as f32))?;
                    assert!(scan.has_component::<Mass>(row));
                    assert_eq!(scan.pending_component::<Mass>(row), Some(Mass(row as f32)));
                }
                // Rows have not moved yet.
                assert_eq!(scan.len(), 3);
                Ok(())
            })
            .unwrap();
        for (i, e) in entities.iter().enumerate() {
            assert_eq!(world.get_component::<Mass>(*e), Some(Mass(i as f32)));
            assert_eq!(world.get_component::<Pos>(*e), Some(Pos(i as f32)));
        }
    }

    #[test]
    fn add_then_remove_under_lock_never_moves() {
        let world = world();
        let e = moving(&world, 1)[0];
        let before = world.archetype_of(e);
        world
            .query(&ComponentMask::new().has::<Pos>(), |_| {
                world.add_component(e, Label("x".into()))?;
                world.remove_component::<Label>(e)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(world.archetype_of(e), before);
        assert!(!world.has_component::<Label>(e));
    }

    #[test]
    fn spawn_and_despawn_inside_a_scan() {
        let world = world();
        let entities = moving(&world, 2);
        let mut spawned = None;
        world
            .query(&ComponentMask::new().has::<Pos>(), |_| {
                let e = world.spawn(ComponentBundle::new().with(Pos(7.0)).with(Vel(0.0)));
                assert!(world.is_alive(e));
                assert_eq!(world.get_component::<Pos>(e), Some(Pos(7.0)));
                world.despawn(entities[0])?;
                assert!(!world.is_alive(entities[0]));
                spawned = Some(e);
                Ok(())
            })
            .unwrap();
        let spawned = spawned.unwrap();
        assert_eq!(world.get_component::<Pos>(spawned), Some(Pos(7.0)));
        assert!(!world.is_alive(entities[0]));
        assert_eq!(world.get_component::<Pos>(entities[1]), Some(Pos(1.0)));
        assert_eq!(world.entity_count(), 2);
    }

    // -- typed iteration ------------------------------------------------------

    #[test]
    fn for_each_over_tuples() {
        let world = world();
        let entities = moving(&world, 5);
        world
            .for_each::<(&mut Pos, &Vel), _>(|_, (p, v): (&mut Pos, &Vel)| p.0 += v.0 * 2.0)
            .unwrap();
        let mut seen = 0;
        world
            .for_each::<(&Pos,), _>(|_, (_p,): (&Pos,)| seen += 1)
            .unwrap();
        assert_eq!(seen, 5);
        assert_eq!(world.get_component::<Pos>(entities[4]), Some(Pos(6.0)));
    }

    #[test]
    fn for_each_rejects_aliasing_writes() {
        let world = world();
        moving(&world, 1);
        let result =
            world.for_each::<(&mut Pos, &Pos), _>(|_, (_a, _b): (&mut Pos, &Pos)| {});
        assert!(result.is_err());
    }

    #[test]
    fn for_each_with_extra_exclusion() {
        let world = world();
        let entities = moving(&world, 3);
        world.add_component(entities[1], Mass(1.0)).unwrap();
        let mut hit = Vec::new();
        world
            .for_each_with::<(&Pos,), _>(
                &ComponentMask::new().exclude::<Mass>(),
                |e, (_p,): (&Pos,)| hit.push(e),
            )
            .unwrap();
        hit.sort();
        let mut expected = vec![entities[0], entities[2]];
        expected.sort();
        assert_eq!(hit, expected);
    }

    #[test]
    fn par_for_each_updates_every_row() {
        let world = world();
        for i in 0..40 {
            let mut bundle = ComponentBundle::new().with(Pos(0.0)).with(Vel(1.0));
            if i % 2 == 0 {
                bundle.add(Mass(1.0));
            }
            world.spawn(bundle);
        }
        world
            .par_for_each::<(&mut Pos, &Vel), _>(|_, (p, v): (&mut Pos, &Vel)| p.0 += v.0)
            .unwrap();
        let mut total = 0.0;
        world
            .for_each::<(&Pos,), _>(|_, (p,): (&Pos,)| total += p.0)
            .unwrap();
        assert_eq!(total, 40.0);
    }

    // -- tags ------------------------------------------------------------------

    #[test]
    fn tag_filtered_entities() {
        let world = world();
        let entities = moving(&world, 4);
        let asleep = tag_id::<Asleep>();
        world.add_tag(entities[0], asleep).unwrap();
        world.add_tag(entities[2], asleep).unwrap();

        let mask = ComponentMask::new().has::<Pos>();
        let mut sleeping = world
            .entities_matching_tags(&mask, &TagMask::new().has::<Asleep>())
            .unwrap();
        sleeping.sort();
        assert_eq!(sleeping, vec![entities[0], entities[2]]);

        let awake = world
            .entities_matching_tags(&mask, &TagMask::new().exclude::<Asleep>())
            .unwrap();
        assert_eq!(awake.len(), 2);
        assert!(awake.contains(&entities[1]) && awake.contains(&entities[3]));
    }

    #[test]
    fn entities_matching_collects_across_archetypes() {
        let world = world();
        let entities = moving(&world, 2);
        world.add_component(entities[0], Mass(1.0)).unwrap();
        let all = world
            .entities_matching(&ComponentMask::new().has::<Pos>())
            .unwrap();
        assert_eq!(all.len(), 2);
        let heavy = world
            .entities_matching(&ComponentMask::new().has::<Mass>())
            .unwrap();
        assert_eq!(heavy, vec![entities[0]]);
    }
}
