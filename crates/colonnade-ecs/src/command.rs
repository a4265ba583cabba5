//! Deferred structural changes.
//!
//! While an archetype is locked by a scan its rows must not move, so every
//! structural request that touches one of its entities is recorded in the
//! archetype's [`ArchetypeCommandBuffer`] instead of being applied. The buffer
//! keeps enough state to answer "has component" and "get component" as if the
//! requests had already been applied.
//!
//! When the last lock is released the world replays the buffer: each entity's
//! operation log is folded into a single target archetype, the entity is moved
//! there once, buffered values are committed and tag changes applied. If the
//! entity's current or target archetype is itself locked, the remaining work
//! is handed to that archetype's buffer instead. A buffer only ever hands work
//! to a different, locked buffer, so chains of deferred moves terminate.

use std::any::Any;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::archetype::{Archetype, ArchetypeId, Transition};
use crate::bitmask::BitMask;
use crate::column::Column;
use crate::component::{component_info, Component, ComponentId, ComponentInfo, TagBits, TagId};
use crate::entity::{Entity, EntityRecord};
use crate::event::WorldEvent;
use crate::sparse_set::SparseSet;
use crate::world::World;

// ---------------------------------------------------------------------------
// BufferedOp
// ---------------------------------------------------------------------------

/// One entry of an entity's operation log.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BufferedOp {
    Add(&'static ComponentInfo),
    Remove(&'static ComponentInfo),
    AddTag(TagId),
    RemoveTag(TagId),
}

impl BufferedOp {
    fn is_tag(&self) -> bool {
        matches!(self, BufferedOp::AddTag(_) | BufferedOp::RemoveTag(_))
    }
}

// ---------------------------------------------------------------------------
// VirtualColumn
// ---------------------------------------------------------------------------

/// Type-erased per-component store of buffered values, keyed by entity slot.
pub(crate) trait VirtualColumn: Send {
    fn contains(&self, key: u32) -> bool;
    fn evict(&mut self, key: u32);
    fn insert_boxed(&mut self, key: u32, value: Box<dyn Any + Send>);
    /// Move the value for `key` (if any) into `column[row]`.
    fn commit(&mut self, key: u32, column: &mut Column, row: usize);
    /// Move the value for `key` (if any) into another store of the same type.
    fn transfer(&mut self, key: u32, dest: &mut dyn VirtualColumn);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> VirtualColumn for SparseSet<T> {
    fn contains(&self, key: u32) -> bool {
        SparseSet::contains(self, key)
    }

    fn evict(&mut self, key: u32) {
        self.remove(key);
    }

    fn insert_boxed(&mut self, key: u32, value: Box<dyn Any + Send>) {
        let value = value
            .downcast::<T>()
            .unwrap_or_else(|_| panic!("boxed value is not a {}", std::any::type_name::<T>()));
        self.insert(key, *value);
    }

    fn commit(&mut self, key: u32, column: &mut Column, row: usize) {
        if let Some(value) = self.remove(key) {
            column.set::<T>(row, value);
        }
    }

    fn transfer(&mut self, key: u32, dest: &mut dyn VirtualColumn) {
        if let Some(value) = self.remove(key) {
            dest.as_any_mut()
                .downcast_mut::<SparseSet<T>>()
                .expect("virtual column type mismatch")
                .insert(key, value);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// ArchetypeCommandBuffer
// ---------------------------------------------------------------------------

/// Deferred operations for the entities owned by one locked archetype.
///
/// All bit sets are indexed by entity slot.
#[derive(Default)]
pub(crate) struct ArchetypeCommandBuffer {
    /// Touched this epoch.
    known: BitMask,
    created: BitMask,
    destroyed: BitMask,
    /// Arrived from another buffer whose replay could not land them.
    moved_in: BitMask,
    entities: SparseSet<Entity>,
    ops: SparseSet<Vec<BufferedOp>>,
    /// Per component id: entities whose presence flipped an odd number of times.
    flips: SparseSet<BitMask>,
    /// Per component id: buffered values.
    values: SparseSet<Box<dyn VirtualColumn>>,
    /// Schema to fold from, for entities whose logical schema differs from
    /// their physical archetype.
    destinations: SparseSet<ArchetypeId>,
    pending_creates: u32,
    reserve: usize,
}

impl ArchetypeCommandBuffer {
    pub fn is_empty(&self) -> bool {
        self.known.is_empty() && self.reserve == 0
    }

    /// Number of entities with buffered work.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    fn touch(&mut self, entity: Entity) {
        self.known.set(entity.index() as usize);
        self.entities.insert(entity.index(), entity);
    }

    fn log(&mut self, entity: Entity, op: BufferedOp) {
        self.touch(entity);
        match self.ops.get_mut(entity.index()) {
            Some(log) => log.push(op),
            None => {
                self.ops.insert(entity.index(), vec![op]);
            }
        }
    }

    fn flip(&mut self, entity: Entity, id: ComponentId) {
        let key = id.0;
        if !self.flips.contains(key) {
            self.flips.insert(key, BitMask::new());
        }
        if let Some(bits) = self.flips.get_mut(key) {
            bits.flip(entity.index() as usize);
        }
    }

    fn store(&mut self, entity: Entity, info: &'static ComponentInfo, value: Box<dyn Any + Send>) {
        let key = info.id.0;
        if !self.values.contains(key) {
            self.values.insert(key, (info.vtable.new_virtual)());
        }
        if let Some(store) = self.values.get_mut(key) {
            store.insert_boxed(entity.index(), value);
        }
    }

    /// Row the next buffered creation will notionally occupy.
    pub fn next_virtual_row(&self, committed: usize) -> u32 {
        committed as u32 + self.pending_creates
    }

    pub fn create(&mut self, entity: Entity) {
        self.touch(entity);
        self.created.set(entity.index() as usize);
        self.pending_creates += 1;
    }

    pub fn add(
        &mut self,
        entity: Entity,
        info: &'static ComponentInfo,
        value: Option<Box<dyn Any + Send>>,
    ) {
        self.log(entity, BufferedOp::Add(info));
        self.flip(entity, info.id);
        // A value-less add lands as the default, even over a row that still
        // holds an older value from before a buffered remove.
        let value = value.unwrap_or_else(info.vtable.default_boxed);
        self.store(entity, info, value);
    }

    /// Buffer a new value for a component the entity (virtually) has.
    pub fn set(&mut self, entity: Entity, info: &'static ComponentInfo, value: Box<dyn Any + Send>) {
        self.touch(entity);
        self.store(entity, info, value);
    }

    pub fn remove(&mut self, entity: Entity, info: &'static ComponentInfo) {
        self.log(entity, BufferedOp::Remove(info));
        self.flip(entity, info.id);
        if let Some(store) = self.values.get_mut(info.id.0) {
            store.evict(entity.index());
        }
    }

    pub fn destroy(&mut self, entity: Entity) {
        self.touch(entity);
        self.destroyed.set(entity.index() as usize);
    }

    pub fn add_tag(&mut self, entity: Entity, tag: TagId) {
        self.log(entity, BufferedOp::AddTag(tag));
    }

    pub fn remove_tag(&mut self, entity: Entity, tag: TagId) {
        self.log(entity, BufferedOp::RemoveTag(tag));
    }

    pub fn request_reserve(&mut self, additional: usize) {
        self.reserve += additional;
    }

    pub fn is_created(&self, entity: Entity) -> bool {
        self.created.get(entity.index() as usize)
    }

    pub fn is_destroyed(&self, entity: Entity) -> bool {
        self.destroyed.get(entity.index() as usize)
    }

    /// Archetype whose schema the entity's log folds from.
    pub fn base(&self, record: &EntityRecord, entity: Entity) -> ArchetypeId {
        self.destinations
            .get(entity.index())
            .copied()
            .unwrap_or(record.archetype)
    }

    /// Virtual presence of `id`, given its presence in the base schema.
    pub fn has(&self, entity: Entity, id: ComponentId, base: bool) -> bool {
        let flipped = self
            .flips
            .get(id.0)
            .is_some_and(|bits| bits.get(entity.index() as usize));
        base ^ flipped
    }

    /// Buffered value of `T` for `entity`.
    pub fn value<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.values
            .get(component_info::<T>().id.0)?
            .as_any()
            .downcast_ref::<SparseSet<T>>()?
            .get(entity.index())
    }

    /// Buffered tag operations for `entity`, in order.
    pub fn tag_ops(&self, entity: Entity) -> impl Iterator<Item = BufferedOp> + '_ {
        self.ops
            .get(entity.index())
            .into_iter()
            .flatten()
            .copied()
            .filter(BufferedOp::is_tag)
    }

    /// Accept an entity handed over by another buffer's replay.
    fn receive(&mut self, entity: Entity, destination: ArchetypeId, tag_ops: Vec<BufferedOp>) {
        self.touch(entity);
        self.moved_in.set(entity.index() as usize);
        self.destinations.insert(entity.index(), destination);
        for op in tag_ops {
            self.log(entity, op);
        }
    }

    fn transfer_values(&mut self, key: u32, dest: &mut ArchetypeCommandBuffer) {
        for i in 0..self.values.len() {
            let component = self.values.keys()[i];
            let Some(store) = self.values.get_mut(component) else {
                continue;
            };
            if !store.contains(key) {
                continue;
            }
            if !dest.values.contains(component) {
                let info = crate::component::component_info_by_id(ComponentId(component))
                    .expect("buffered component is registered");
                dest.values.insert(component, (info.vtable.new_virtual)());
            }
            if let Some(target) = dest.values.get_mut(component) {
                store.transfer(key, &mut **target);
            }
        }
    }

    fn drop_values(&mut self, key: u32) {
        for i in 0..self.values.len() {
            let component = self.values.keys()[i];
            if let Some(store) = self.values.get_mut(component) {
                store.evict(key);
            }
        }
    }

    fn commit_values(&mut self, key: u32, archetype: &Archetype, columns: &mut [Column], row: usize) {
        for i in 0..self.values.len() {
            let component = self.values.keys()[i];
            let Some(store) = self.values.get_mut(component) else {
                continue;
            };
            match archetype.column_index(ComponentId(component)) {
                Some(col) => store.commit(key, &mut columns[col], row),
                None => store.evict(key),
            }
        }
    }
}

impl fmt::Debug for ArchetypeCommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchetypeCommandBuffer")
            .field("known", &self.known)
            .field("created", &self.created)
            .field("destroyed", &self.destroyed)
            .field("moved_in", &self.moved_in)
            .field("reserve", &self.reserve)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Per-entity state pulled out of a buffer at replay.
struct EntityWork {
    entity: Entity,
    created: bool,
    destroyed: bool,
    destination: Option<ArchetypeId>,
    ops: Vec<BufferedOp>,
}

impl World {
    /// Apply everything buffered on `archetype`. Caller holds the structural
    /// mutex and has just released the archetype's last lock.
    pub(crate) fn replay(&self, archetype: &Arc<Archetype>) {
        let mut buffer = std::mem::take(&mut *archetype.buffer.lock());
        if buffer.is_empty() {
            return;
        }
        trace!(
            archetype = archetype.id().0,
            entities = buffer.len(),
            "replaying command buffer"
        );

        if buffer.reserve > 0 {
            // SAFETY: structural mutex held, lock count is zero.
            let storage = unsafe { archetype.storage_mut() };
            storage.ensure_capacity(storage.count + buffer.reserve);
            archetype.sync_len(storage);
        }

        let slots: Vec<u32> = buffer.known.iter_ones().map(|i| i as u32).collect();
        let mut landed = 0usize;
        for slot in slots {
            let Some(&entity) = buffer.entities.get(slot) else {
                continue;
            };
            let work = EntityWork {
                entity,
                created: buffer.created.get(slot as usize),
                destroyed: buffer.destroyed.get(slot as usize),
                destination: if buffer.moved_in.get(slot as usize) {
                    buffer.destinations.remove(slot)
                } else {
                    None
                },
                ops: buffer.ops.remove(slot).unwrap_or_default(),
            };
            if self.replay_entity(archetype, &mut buffer, work) {
                landed += 1;
            }
        }

        trace!(archetype = archetype.id().0, landed, "replay finished");
    }

    /// Replay one entity. Returns `true` if its work was applied here rather
    /// than dropped or handed to another buffer.
    fn replay_entity(
        &self,
        owner: &Arc<Archetype>,
        buffer: &mut ArchetypeCommandBuffer,
        work: EntityWork,
    ) -> bool {
        let entity = work.entity;
        let slot = entity.index();
        let record = self
            .entities
            .read()
            .get(entity)
            .copied()
            .filter(|r| r.pending == Some(owner.id()));
        let Some(mut record) = record else {
            warn!(%entity, archetype = owner.id().0, "dropping buffered operations for stale entity");
            buffer.drop_values(slot);
            return false;
        };

        if work.destroyed {
            buffer.drop_values(slot);
            if work.created {
                self.entities.write().free(entity);
                self.pending_destroys.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
            let home = self.archetype_arc(record.archetype);
            if home.is_locked() {
                home.buffer.lock().destroy(entity);
                self.set_pending(entity, Some(home.id()));
                trace!(%entity, to = home.id().0, "handing destroy to locked archetype");
                return false;
            }
            self.destroy_now(&home, entity, record.row as usize);
            self.pending_destroys.fetch_sub(1, Ordering::Relaxed);
            return true;
        }

        if work.created {
            // SAFETY: structural mutex held; `owner` is no longer locked.
            let storage = unsafe { owner.storage_mut() };
            let row = storage.append(entity);
            owner.sync_len(storage);
            record.archetype = owner.id();
            record.row = row as u32;
            if let Some(rec) = self.entities.write().get_mut(entity) {
                rec.archetype = owner.id();
                rec.row = row as u32;
            }
            self.events.emit(WorldEvent::EntityCreated(entity));
        }

        // Fold the log into one target schema.
        let tags_info = component_info::<TagBits>();
        let mut target = self.archetype_arc(work.destination.unwrap_or(record.archetype));
        let mut tag_ops = Vec::new();
        for op in work.ops {
            match op {
                BufferedOp::Add(info) if !target.has_component(info.id) => {
                    target = self.variant(&target, info, Transition::Add);
                }
                BufferedOp::Remove(info) if target.has_component(info.id) => {
                    target = self.variant(&target, info, Transition::Remove);
                }
                BufferedOp::AddTag(_) | BufferedOp::RemoveTag(_) => {
                    if matches!(op, BufferedOp::AddTag(_)) && !target.has_component(tags_info.id) {
                        target = self.variant(&target, tags_info, Transition::Add);
                    }
                    tag_ops.push(op);
                }
                _ => {}
            }
        }

        let home = self.archetype_arc(record.archetype);
        if home.id() != owner.id() && home.is_locked() {
            self.forward(buffer, entity, &home, target.id(), tag_ops);
            return false;
        }
        if target.id() != home.id() && target.is_locked() {
            self.forward(buffer, entity, &target, target.id(), tag_ops);
            return false;
        }

        let row = if target.id() != home.id() {
            self.move_entity(&home, &target, entity, record.row as usize)
        } else {
            record.row as usize
        };

        // SAFETY: structural mutex held; `target` is not locked.
        let storage = unsafe { target.storage_mut() };
        buffer.commit_values(slot, &target, &mut storage.columns, row);
        if !tag_ops.is_empty() {
            if let Some(col) = target.column_index(tags_info.id) {
                let bits = storage.columns[col].get_mut::<TagBits>(row);
                for op in tag_ops {
                    match op {
                        BufferedOp::AddTag(tag) if bits.set(tag) => {
                            self.events.emit(WorldEvent::TagAdded { entity, tag });
                        }
                        BufferedOp::RemoveTag(tag) if bits.clear(tag) => {
                            self.events.emit(WorldEvent::TagRemoved { entity, tag });
                        }
                        _ => {}
                    }
                }
            }
        }

        if target.id() != home.id() {
            self.emit_schema_change(entity, &home, &target);
        }
        self.set_pending(entity, None);
        true
    }

    /// Hand `entity`'s remaining work to the locked archetype `to`.
    fn forward(
        &self,
        buffer: &mut ArchetypeCommandBuffer,
        entity: Entity,
        to: &Archetype,
        destination: ArchetypeId,
        tag_ops: Vec<BufferedOp>,
    ) {
        let mut dest = to.buffer.lock();
        dest.receive(entity, destination, tag_ops);
        buffer.transfer_values(entity.index(), &mut dest);
        drop(dest);
        self.set_pending(entity, Some(to.id()));
        trace!(%entity, to = to.id().0, destination = destination.0, "handing move to locked archetype");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
