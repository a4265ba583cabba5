//! Archetype storage.
//!
//! An [`Archetype`] stores every entity that has exactly one particular set
//! of component types. Each component gets its own [`Column`] (SoA layout),
//! and all columns plus the entity column always have the same length
//! (`capacity`). Rows `0..len` are occupied; removal swaps the last row into
//! the hole so occupied rows stay contiguous.
//!
//! Besides the data, an archetype carries the state the world uses to make
//! structural changes safe during scans: a lock count, per-column access
//! states and a deferred command buffer.

use std::cell::UnsafeCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::access::ColumnBorrows;
use crate::bitmask::BitMask;
use crate::column::Column;
use crate::command::ArchetypeCommandBuffer;
use crate::component::{ComponentId, ComponentInfo};
use crate::entity::Entity;

/// Smallest non-zero capacity an archetype grows to.
pub const MIN_CAPACITY: usize = 4;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Index of an archetype within its world.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    /// The archetype with no components.
    pub const EMPTY: ArchetypeId = ArchetypeId(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ArchetypeDefinition
// ---------------------------------------------------------------------------

/// Canonical schema: component infos sorted by id without duplicates, plus a
/// content hash.
#[derive(Clone)]
pub struct ArchetypeDefinition {
    infos: Vec<&'static ComponentInfo>,
    hash: u64,
}

impl ArchetypeDefinition {
    pub fn new(infos: impl IntoIterator<Item = &'static ComponentInfo>) -> Self {
        let mut infos: Vec<_> = infos.into_iter().collect();
        infos.sort_by_key(|info| info.id);
        infos.dedup_by_key(|info| info.id);
        let mut hasher = DefaultHasher::new();
        for info in &infos {
            info.id.hash(&mut hasher);
        }
        Self {
            hash: hasher.finish(),
            infos,
        }
    }

    /// The empty schema.
    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// This schema plus `info`.
    pub fn with(&self, info: &'static ComponentInfo) -> Self {
        Self::new(self.infos.iter().copied().chain(std::iter::once(info)))
    }

    /// This schema minus component `id`.
    pub fn without(&self, id: ComponentId) -> Self {
        Self::new(self.infos.iter().copied().filter(|info| info.id != id))
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.position(id).is_some()
    }

    /// Column index of `id` in an archetype with this schema.
    #[inline]
    pub fn position(&self, id: ComponentId) -> Option<usize> {
        self.infos.binary_search_by_key(&id, |info| info.id).ok()
    }

    pub fn infos(&self) -> &[&'static ComponentInfo] {
        &self.infos
    }

    pub fn ids(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.infos.iter().map(|info| info.id)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Bit mask with one bit per component id.
    pub fn mask(&self) -> BitMask {
        self.ids().map(ComponentId::index).collect()
    }
}

impl PartialEq for ArchetypeDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.ids().eq(other.ids())
    }
}

impl Eq for ArchetypeDefinition {}

impl Hash for ArchetypeDefinition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for ArchetypeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.infos.iter().map(|info| info.name))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Rows of an archetype. `entities.len()` is the capacity.
pub(crate) struct Storage {
    pub entities: Vec<Entity>,
    pub columns: Vec<Column>,
    pub count: usize,
}

impl Storage {
    fn new(definition: &ArchetypeDefinition) -> Self {
        Self {
            entities: Vec::new(),
            columns: definition
                .infos()
                .iter()
                .map(|&info| info.new_column(0))
                .collect(),
            count: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entities.len()
    }

    /// Grow every column in lock-step so at least `needed` rows fit.
    pub fn ensure_capacity(&mut self, needed: usize) {
        let capacity = self.capacity();
        if needed <= capacity {
            return;
        }
        let new_capacity = needed
            .max(capacity * 2)
            .max(MIN_CAPACITY)
            .next_power_of_two();
        for column in &mut self.columns {
            column.grow_to(new_capacity);
        }
        self.entities.resize(new_capacity, Entity::PLACEHOLDER);
    }

    /// Append `entity` with default values in every column. Returns its row.
    pub fn append(&mut self, entity: Entity) -> usize {
        self.ensure_capacity(self.count + 1);
        let row = self.count;
        self.entities[row] = entity;
        self.count += 1;
        row
    }

    /// Remove `row` by moving the last row into it. Returns the entity that
    /// now occupies `row`, if one was moved.
    pub fn swap_remove(&mut self, row: usize) -> Option<Entity> {
        debug_assert!(row < self.count);
        let last = self.count - 1;
        for column in &mut self.columns {
            column.fill_hole(row, last);
        }
        self.entities[row] = self.entities[last];
        self.entities[last] = Entity::PLACEHOLDER;
        self.count = last;
        (row != last).then(|| self.entities[row])
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Cached neighbours for one component id.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Edge {
    pub add: Option<ArchetypeId>,
    pub remove: Option<ArchetypeId>,
}

/// Direction of a schema transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Add,
    Remove,
}

impl Transition {
    pub fn inverse(self) -> Self {
        match self {
            Transition::Add => Transition::Remove,
            Transition::Remove => Transition::Add,
        }
    }
}

/// All entities sharing one exact component schema.
pub struct Archetype {
    id: ArchetypeId,
    definition: ArchetypeDefinition,
    mask: BitMask,
    storage: UnsafeCell<Storage>,
    /// Mirrors of `storage.count` and `storage.capacity()`, readable without
    /// touching the storage.
    len: AtomicUsize,
    capacity: AtomicUsize,
    lock_count: AtomicU32,
    pub(crate) borrows: ColumnBorrows,
    edges: RwLock<HashMap<ComponentId, Edge>>,
    pub(crate) buffer: Mutex<ArchetypeCommandBuffer>,
}

// SAFETY: `storage` is only mutated through `storage_mut`, whose callers hold
// the world's structural mutex while the lock count is zero, which excludes
// every reader. Readers go through `storage`, which requires the archetype to
// be locked, and write column values only under exclusive column access.
unsafe impl Sync for Archetype {}

impl Archetype {
    pub(crate) fn new(id: ArchetypeId, definition: ArchetypeDefinition) -> Self {
        Self {
            id,
            mask: definition.mask(),
            storage: UnsafeCell::new(Storage::new(&definition)),
            len: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            lock_count: AtomicU32::new(0),
            borrows: ColumnBorrows::new(definition.len()),
            edges: RwLock::new(HashMap::new()),
            buffer: Mutex::new(ArchetypeCommandBuffer::default()),
            definition,
        }
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn definition(&self) -> &ArchetypeDefinition {
        &self.definition
    }

    /// One bit per component id in this archetype.
    pub fn mask(&self) -> &BitMask {
        &self.mask
    }

    /// Number of occupied rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any scan currently holds this archetype locked.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock_count.load(Ordering::Acquire) > 0
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Acquire)
    }

    /// Column index of component `id`, if present.
    #[inline]
    pub fn column_index(&self, id: ComponentId) -> Option<usize> {
        self.definition.position(id)
    }

    pub fn has_component(&self, id: ComponentId) -> bool {
        self.mask.get(id.index())
    }

    /// Allocated rows per column.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Increment the lock count. Caller holds the structural mutex.
    pub(crate) fn lock(&self) {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the lock count, returning `true` when it reached zero.
    /// Caller holds the structural mutex.
    pub(crate) fn unlock(&self) -> bool {
        let previous = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unlocking an archetype that is not locked");
        previous == 1
    }

    /// Shared view of the rows.
    ///
    /// # Safety
    ///
    /// The archetype must stay locked for the lifetime of the reference.
    /// Column values may only be read or written under matching access.
    #[inline]
    pub(crate) unsafe fn storage(&self) -> &Storage {
        &*self.storage.get()
    }

    /// Exclusive view of the rows.
    ///
    /// # Safety
    ///
    /// Caller holds the structural mutex (or `&mut World`) and the archetype
    /// is not locked. No other reference into the storage may be live.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn storage_mut(&self) -> &mut Storage {
        debug_assert!(!self.is_locked(), "structural change to a locked archetype");
        &mut *self.storage.get()
    }

    /// Publish the storage row count and capacity. Caller holds the
    /// structural mutex.
    pub(crate) fn sync_len(&self, storage: &Storage) {
        self.len.store(storage.count, Ordering::Release);
        self.capacity.store(storage.capacity(), Ordering::Release);
    }

    pub(crate) fn edge(&self, id: ComponentId, transition: Transition) -> Option<ArchetypeId> {
        let edges = self.edges.read();
        let edge = edges.get(&id)?;
        match transition {
            Transition::Add => edge.add,
            Transition::Remove => edge.remove,
        }
    }

    pub(crate) fn cache_edge(&self, id: ComponentId, transition: Transition, target: ArchetypeId) {
        let mut edges = self.edges.write();
        let edge = edges.entry(id).or_default();
        match transition {
            Transition::Add => edge.add = Some(target),
            Transition::Remove => edge.remove = Some(target),
        }
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("components", &self.definition)
            .field("len", &self.len())
            .field("locks", &self.lock_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{component_id, component_info};

    #[derive(Clone, Copy, Default, Debug, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Clone, Default, Debug, PartialEq)]
    struct Label(String);

    fn entity(i: u32) -> Entity {
        Entity::new(i, 1, 0)
    }

    fn definition() -> ArchetypeDefinition {
        ArchetypeDefinition::new([component_info::<Label>(), component_info::<Position>()])
    }

    #[test]
    fn definition_is_sorted_and_deduplicated() {
        let pos = component_info::<Position>();
        let label = component_info::<Label>();
        let a = ArchetypeDefinition::new([pos, label, pos]);
        let b = ArchetypeDefinition::new([label, pos]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        let ids: Vec<_> = a.ids().collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn with_and_without_are_inverse() {
        let pos = component_info::<Position>();
        let base = ArchetypeDefinition::new([component_info::<Label>()]);
        let grown = base.with(pos);
        assert!(grown.contains(pos.id));
        assert_eq!(grown.without(pos.id), base);
        assert_ne!(grown, base);
    }

    #[test]
    fn capacity_grows_in_powers_of_two() {
        let mut storage = Storage::new(&definition());
        storage.ensure_capacity(1);
        assert_eq!(storage.capacity(), MIN_CAPACITY);
        for i in 0..5 {
            storage.append(entity(i));
        }
        assert_eq!(storage.capacity(), 8);
        storage.ensure_capacity(20);
        assert_eq!(storage.capacity(), 32);
        assert!(storage.columns.iter().all(|c| c.capacity() == 32));
    }

    #[test]
    fn swap_remove_keeps_rows_dense() {
        let def = definition();
        let pos_col = def.position(component_id::<Position>()).unwrap();
        let label_col = def.position(component_id::<Label>()).unwrap();
        let mut storage = Storage::new(&def);
        for i in 0..3 {
            let row = storage.append(entity(i));
            storage.columns[pos_col].set(row, Position { x: i as f32, y: 0.0 });
            storage.columns[label_col].set(row, Label(format!("e{i}")));
        }

        let moved = storage.swap_remove(0);
        assert_eq!(moved, Some(entity(2)));
        assert_eq!(storage.count, 2);
        assert_eq!(storage.entities[0], entity(2));
        assert_eq!(storage.columns[pos_col].get::<Position>(0).x, 2.0);
        assert_eq!(storage.columns[label_col].get::<Label>(0).0, "e2");
        assert_eq!(storage.columns[label_col].get::<Label>(2).0, "");

        assert_eq!(storage.swap_remove(1), None);
        assert_eq!(storage.count, 1);
    }

    #[test]
    fn lock_count_reports_last_unlock() {
        let arch = Archetype::new(ArchetypeId(1), definition());
        arch.lock();
        arch.lock();
        assert!(arch.is_locked());
        assert!(!arch.unlock());
        assert!(arch.unlock());
        assert!(!arch.is_locked());
    }

    #[test]
    fn edges_are_cached_per_direction() {
        let arch = Archetype::new(ArchetypeId(1), definition());
        let id = component_id::<Position>();
        assert_eq!(arch.edge(id, Transition::Add), None);
        arch.cache_edge(id, Transition::Remove, ArchetypeId(3));
        assert_eq!(arch.edge(id, Transition::Remove), Some(ArchetypeId(3)));
        assert_eq!(arch.edge(id, Transition::Add), None);
        assert_eq!(Transition::Add.inverse(), Transition::Remove);
    }
}
