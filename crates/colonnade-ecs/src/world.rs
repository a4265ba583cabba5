//! The [`World`] owns the entity index, every archetype, the archetype
//! registry and the filter cache, and orchestrates structural changes.
//!
//! Structural entry points take `&self` so they can be called from inside a
//! scan. They all serialise on one structural mutex. When the entity's
//! archetype is locked by a scan the request goes to that archetype's command
//! buffer and is applied when the last lock is released; otherwise it is
//! applied immediately.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::archetype::{Archetype, ArchetypeDefinition, ArchetypeId, Transition};
use crate::command::{ArchetypeCommandBuffer, BufferedOp};
use crate::component::{
    component_info, component_info_by_id, Component, ComponentId, ComponentInfo, TagBits, TagId,
};
use crate::config::WorldConfig;
use crate::entity::{Entity, EntityIndex, EntityRecord};
use crate::event::{EventHub, EventKinds, WorldEvent};
use crate::filter::ArchetypeFilter;
use crate::mask::ComponentMask;
use crate::EcsError;

/// Maximum number of worlds alive at once.
pub const MAX_WORLDS: usize = 256;

// ---------------------------------------------------------------------------
// World ids
// ---------------------------------------------------------------------------

/// Recycled world ids, each with the highest entity generation any world
/// holding that id has issued.
#[derive(Default)]
struct WorldIds {
    next: usize,
    free: VecDeque<u8>,
    floors: Vec<u32>,
}

impl WorldIds {
    /// A free id and the generation its new world must start above.
    fn acquire(&mut self) -> (u8, u32) {
        if let Some(id) = self.free.pop_front() {
            return (id, self.floors[id as usize]);
        }
        assert!(self.next < MAX_WORLDS, "at most {MAX_WORLDS} worlds may be alive at once");
        let id = self.next as u8;
        self.next += 1;
        self.floors.push(0);
        (id, 0)
    }

    fn release(&mut self, id: u8, issued: u32) {
        let floor = &mut self.floors[id as usize];
        *floor = (*floor).max(issued);
        self.free.push_back(id);
    }
}

fn world_ids() -> &'static Mutex<WorldIds> {
    static IDS: OnceLock<Mutex<WorldIds>> = OnceLock::new();
    IDS.get_or_init(|| Mutex::new(WorldIds::default()))
}

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

/// A set of component values to spawn an entity with.
///
/// ```
/// use colonnade_ecs::prelude::*;
///
/// #[derive(Debug, Clone, Default, PartialEq)]
/// struct Position { x: f32, y: f32 }
///
/// let world = World::new();
/// let e = world.spawn(ComponentBundle::new().with(Position { x: 1.0, y: 2.0 }));
/// assert_eq!(world.get_component::<Position>(e), Some(Position { x: 1.0, y: 2.0 }));
/// ```
#[derive(Default)]
pub struct ComponentBundle {
    entries: Vec<(&'static ComponentInfo, Box<dyn Any + Send>)>,
}

impl ComponentBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ComponentBundle::add`].
    pub fn with<T: Component>(mut self, value: T) -> Self {
        self.add(value);
        self
    }

    /// Add a component value. A second value of the same type replaces the
    /// first.
    pub fn add<T: Component>(&mut self, value: T) {
        let info = component_info::<T>();
        match self.entries.iter_mut().find(|(i, _)| i.id == info.id) {
            Some(entry) => entry.1 = Box::new(value),
            None => self.entries.push((info, Box::new(value))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn definition(&self) -> ArchetypeDefinition {
        ArchetypeDefinition::new(self.entries.iter().map(|(info, _)| *info))
    }
}

// ---------------------------------------------------------------------------
// JSON setters
// ---------------------------------------------------------------------------

type DeserializeFn = fn(&serde_json::Value) -> Result<Box<dyn Any + Send>, serde_json::Error>;

fn deserialize_boxed<T: Component + DeserializeOwned>(
    value: &serde_json::Value,
) -> Result<Box<dyn Any + Send>, serde_json::Error> {
    Ok(Box::new(T::deserialize(value)?))
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Where a structural request for an entity goes.
pub(crate) enum Route {
    /// Apply now to the entity's (unlocked) archetype.
    Direct(Arc<Archetype>),
    /// Record in this archetype's command buffer.
    Buffered(Arc<Archetype>),
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The top-level entity store.
pub struct World {
    id: u8,
    config: WorldConfig,
    /// Serialises every structural change and every lock count change.
    structure: Mutex<()>,
    pub(crate) entities: RwLock<EntityIndex>,
    /// Destroys recorded in a command buffer but not yet applied.
    pub(crate) pending_destroys: AtomicUsize,
    archetypes: RwLock<Vec<Arc<Archetype>>>,
    archetype_index: RwLock<HashMap<ArchetypeDefinition, ArchetypeId>>,
    /// Indexed by component id: archetype -> column index. Used to pair
    /// source and destination columns when an entity moves.
    component_index: RwLock<Vec<HashMap<ArchetypeId, usize>>>,
    filters: RwLock<HashMap<ComponentMask, Arc<ArchetypeFilter>>>,
    json: RwLock<HashMap<String, (&'static ComponentInfo, DeserializeFn)>>,
    pub(crate) events: EventHub,
}

impl World {
    /// Create a world with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if [`MAX_WORLDS`] worlds are already alive.
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        let (id, floor) = world_ids().lock().acquire();
        let world = Self {
            id,
            structure: Mutex::new(()),
            entities: RwLock::new(EntityIndex::new(config.entity_capacity, floor)),
            pending_destroys: AtomicUsize::new(0),
            archetypes: RwLock::new(Vec::new()),
            archetype_index: RwLock::new(HashMap::new()),
            component_index: RwLock::new(Vec::new()),
            filters: RwLock::new(HashMap::new()),
            json: RwLock::new(HashMap::new()),
            events: EventHub::new(config.events),
            config,
        };
        {
            let _guard = world.structure.lock();
            world.get_or_create_archetype(ArchetypeDefinition::empty());
        }
        world
    }

    /// Id stamped into every handle this world issues.
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // -- internal helpers ----------------------------------------------------

    /// Run `f` under the structural mutex, then deliver queued events.
    fn structural<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let _guard = self.structure.lock();
            f()
        };
        self.events.dispatch();
        result
    }

    pub(crate) fn archetype_arc(&self, id: ArchetypeId) -> Arc<Archetype> {
        Arc::clone(&self.archetypes.read()[id.index()])
    }

    pub(crate) fn set_pending(&self, entity: Entity, owner: Option<ArchetypeId>) {
        if let Some(rec) = self.entities.write().get_mut(entity) {
            rec.pending = owner;
        }
    }

    /// Decide where a request for `entity` goes. Caller holds the structural
    /// mutex.
    pub(crate) fn route(&self, entity: Entity) -> Result<(EntityRecord, Route), EcsError> {
        if entity.world() != self.id {
            return Err(EcsError::InvalidEntity(entity));
        }
        let record = self
            .entities
            .read()
            .get(entity)
            .copied()
            .ok_or(EcsError::InvalidEntity(entity))?;
        if let Some(owner) = record.pending {
            let owner = self.archetype_arc(owner);
            if owner.buffer.lock().is_destroyed(entity) {
                return Err(EcsError::InvalidEntity(entity));
            }
            return Ok((record, Route::Buffered(owner)));
        }
        let home = self.archetype_arc(record.archetype);
        if home.is_locked() {
            Ok((record, Route::Buffered(home)))
        } else {
            Ok((record, Route::Direct(home)))
        }
    }

    /// Presence of `id` as seen through `buffer`.
    pub(crate) fn virtual_has(
        &self,
        record: &EntityRecord,
        buffer: &ArchetypeCommandBuffer,
        entity: Entity,
        id: ComponentId,
    ) -> bool {
        let base = self.archetype_arc(buffer.base(record, entity));
        buffer.has(entity, id, base.has_component(id))
    }

    /// Find or create the archetype for `definition`. Caller holds the
    /// structural mutex.
    pub(crate) fn get_or_create_archetype(&self, definition: ArchetypeDefinition) -> Arc<Archetype> {
        let existing = self.archetype_index.read().get(&definition).copied();
        if let Some(id) = existing {
            return self.archetype_arc(id);
        }

        let id = ArchetypeId(self.archetypes.read().len() as u32);
        let archetype = Arc::new(Archetype::new(id, definition.clone()));
        {
            let mut index = self.component_index.write();
            for (column, info) in definition.infos().iter().enumerate() {
                let slot = info.id.index();
                if index.len() <= slot {
                    index.resize_with(slot + 1, HashMap::new);
                }
                index[slot].insert(id, column);
            }
        }
        self.archetypes.write().push(Arc::clone(&archetype));
        self.archetype_index.write().insert(definition, id);

        let mut matched = 0usize;
        for filter in self.filters.read().values() {
            if filter.offer(&archetype) {
                matched += 1;
            }
        }
        debug!(
            archetype = id.0,
            components = ?archetype.definition(),
            filters = matched,
            "created archetype"
        );
        archetype
    }

    /// Archetype reached from `src` by adding or removing `info`, creating it
    /// and caching the edge in both directions on first use.
    pub(crate) fn variant(
        &self,
        src: &Archetype,
        info: &'static ComponentInfo,
        transition: Transition,
    ) -> Arc<Archetype> {
        if let Some(id) = src.edge(info.id, transition) {
            return self.archetype_arc(id);
        }
        let definition = match transition {
            Transition::Add => src.definition().with(info),
            Transition::Remove => src.definition().without(info.id),
        };
        let target = self.get_or_create_archetype(definition);
        src.cache_edge(info.id, transition, target.id());
        target.cache_edge(info.id, transition.inverse(), src.id());
        target
    }

    /// Move `entity` from `src[row]` to a new row of `dst`, copying shared
    /// columns and hole-filling `src`. Returns the new row.
    ///
    /// Caller holds the structural mutex and neither archetype is locked.
    pub(crate) fn move_entity(
        &self,
        src: &Archetype,
        dst: &Archetype,
        entity: Entity,
        row: usize,
    ) -> usize {
        debug_assert_ne!(src.id(), dst.id());
        // SAFETY: structural mutex held, both unlocked, distinct archetypes.
        let (from, to) = unsafe { (src.storage_mut(), dst.storage_mut()) };
        let new_row = to.append(entity);
        let index = self.component_index.read();
        for (column, info) in src.definition().infos().iter().enumerate() {
            let dest_column = index
                .get(info.id.index())
                .and_then(|columns| columns.get(&dst.id()));
            if let Some(&dest_column) = dest_column {
                from.columns[column].copy_row(row, &mut to.columns[dest_column], new_row);
            }
        }
        drop(index);
        let moved = from.swap_remove(row);
        src.sync_len(from);
        dst.sync_len(to);

        let mut entities = self.entities.write();
        if let Some(rec) = entities.get_mut(entity) {
            rec.archetype = dst.id();
            rec.row = new_row as u32;
        }
        if let Some(moved) = moved {
            if let Some(rec) = entities.get_mut(moved) {
                rec.row = row as u32;
            }
        }
        new_row
    }

    /// Swap-remove `entity` and free its slot. Caller holds the structural
    /// mutex and `home` is not locked.
    pub(crate) fn destroy_now(&self, home: &Archetype, entity: Entity, row: usize) {
        // SAFETY: structural mutex held, `home` unlocked.
        let storage = unsafe { home.storage_mut() };
        let moved = storage.swap_remove(row);
        home.sync_len(storage);
        let mut entities = self.entities.write();
        if let Some(moved) = moved {
            if let Some(rec) = entities.get_mut(moved) {
                rec.row = row as u32;
            }
        }
        entities.free(entity);
        drop(entities);
        self.events.emit(WorldEvent::EntityDestroyed(entity));
    }

    /// Emit component events for the difference between two schemas.
    pub(crate) fn emit_schema_change(&self, entity: Entity, from: &Archetype, to: &Archetype) {
        let wanted = EventKinds::COMPONENT_ADDED | EventKinds::COMPONENT_REMOVED;
        if !self.events.enabled().intersects(wanted) {
            return;
        }
        for id in to.definition().ids().filter(|id| !from.has_component(*id)) {
            self.events.emit(WorldEvent::ComponentAdded {
                entity,
                component: id,
            });
        }
        for id in from.definition().ids().filter(|id| !to.has_component(*id)) {
            self.events.emit(WorldEvent::ComponentRemoved {
                entity,
                component: id,
            });
        }
    }

    fn write_value(
        archetype: &Archetype,
        info: &'static ComponentInfo,
        row: usize,
        value: Box<dyn Any + Send>,
    ) {
        let Some(column) = archetype.column_index(info.id) else {
            return;
        };
        // SAFETY: structural mutex held and `archetype` is not locked.
        let storage = unsafe { archetype.storage_mut() };
        (info.vtable.write_boxed)(&mut storage.columns[column], row, value);
    }

    /// Increment `archetype`'s lock count. Caller holds the structural mutex.
    fn lock_arc(&self, archetype: Arc<Archetype>) -> ArchetypeLock<'_> {
        archetype.lock();
        ArchetypeLock {
            world: self,
            archetype,
        }
    }

    /// Decrement the lock count and replay the buffer if it reached zero.
    pub(crate) fn release(&self, archetype: &Arc<Archetype>) {
        self.structural(|| {
            if archetype.unlock() {
                self.replay(archetype);
            }
        });
    }

    // -- entity lifecycle ----------------------------------------------------

    /// Create an entity with no components.
    pub fn create_entity(&self) -> Entity {
        self.spawn_in(ArchetypeDefinition::empty(), Vec::new())
    }

    /// Create an entity with the bundle's components.
    pub fn spawn(&self, bundle: ComponentBundle) -> Entity {
        let definition = bundle.definition();
        self.spawn_in(definition, bundle.entries)
    }

    /// Create an entity with default values for the given components.
    pub fn spawn_schema(&self, ids: &[ComponentId]) -> Result<Entity, EcsError> {
        let definition = Self::definition_of(ids)?;
        Ok(self.spawn_in(definition, Vec::new()))
    }

    fn definition_of(ids: &[ComponentId]) -> Result<ArchetypeDefinition, EcsError> {
        let infos = ids
            .iter()
            .map(|&id| {
                component_info_by_id(id)
                    .ok_or_else(|| EcsError::InvalidArgument(format!("unknown component {id:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ArchetypeDefinition::new(infos))
    }

    fn spawn_in(
        &self,
        definition: ArchetypeDefinition,
        values: Vec<(&'static ComponentInfo, Box<dyn Any + Send>)>,
    ) -> Entity {
        self.structural(|| {
            let archetype = self.get_or_create_archetype(definition);
            if archetype.is_locked() {
                let mut buffer = archetype.buffer.lock();
                let row = buffer.next_virtual_row(archetype.len());
                let entity = {
                    let mut entities = self.entities.write();
                    let entity = entities.allocate(self.id, archetype.id(), row);
                    if let Some(rec) = entities.get_mut(entity) {
                        rec.pending = Some(archetype.id());
                    }
                    entity
                };
                buffer.create(entity);
                for (info, value) in values {
                    buffer.set(entity, info, value);
                }
                return entity;
            }

            // SAFETY: structural mutex held, archetype unlocked.
            let storage = unsafe { archetype.storage_mut() };
            let row = storage.count;
            let entity = self
                .entities
                .write()
                .allocate(self.id, archetype.id(), row as u32);
            storage.append(entity);
            archetype.sync_len(storage);
            for (info, value) in values {
                Self::write_value(&archetype, info, row, value);
            }
            self.events.emit(WorldEvent::EntityCreated(entity));
            entity
        })
    }

    /// Destroy `entity`. Deferred while its archetype is locked.
    pub fn despawn(&self, entity: Entity) -> Result<(), EcsError> {
        self.structural(|| {
            let (record, route) = self.route(entity)?;
            match route {
                Route::Buffered(owner) => {
                    owner.buffer.lock().destroy(entity);
                    self.set_pending(entity, Some(owner.id()));
                    self.pending_destroys.fetch_add(1, Ordering::Relaxed);
                }
                Route::Direct(home) => self.destroy_now(&home, entity, record.row as usize),
            }
            Ok(())
        })
    }

    /// Whether `entity` is alive. An entity with a pending destroy is not.
    pub fn is_alive(&self, entity: Entity) -> bool {
        let _guard = self.structure.lock();
        self.route(entity).is_ok()
    }

    // -- components ----------------------------------------------------------

    /// Add `value` to `entity`.
    ///
    /// Fails with [`EcsError::DuplicateComponent`] if the entity already has a
    /// `T` and validation is on; otherwise the value is overwritten.
    pub fn add_component<T: Component>(&self, entity: Entity, value: T) -> Result<(), EcsError> {
        self.add_boxed(entity, component_info::<T>(), Some(Box::new(value)))
    }

    /// Type-erased add with the component's default value.
    pub fn add_component_by_id(&self, entity: Entity, id: ComponentId) -> Result<(), EcsError> {
        let info = component_info_by_id(id)
            .ok_or_else(|| EcsError::InvalidArgument(format!("unknown component {id:?}")))?;
        self.add_boxed(entity, info, None)
    }

    fn add_boxed(
        &self,
        entity: Entity,
        info: &'static ComponentInfo,
        value: Option<Box<dyn Any + Send>>,
    ) -> Result<(), EcsError> {
        self.structural(|| {
            let (record, route) = self.route(entity)?;
            match route {
                Route::Buffered(owner) => {
                    let mut buffer = owner.buffer.lock();
                    if self.virtual_has(&record, &buffer, entity, info.id) {
                        if self.config.validate {
                            return Err(EcsError::DuplicateComponent {
                                entity,
                                component: info.name,
                            });
                        }
                        if let Some(value) = value {
                            buffer.set(entity, info, value);
                        }
                    } else {
                        buffer.add(entity, info, value);
                    }
                    drop(buffer);
                    self.set_pending(entity, Some(owner.id()));
                }
                Route::Direct(home) => {
                    let row = record.row as usize;
                    if home.has_component(info.id) {
                        if self.config.validate {
                            return Err(EcsError::DuplicateComponent {
                                entity,
                                component: info.name,
                            });
                        }
                        if let Some(value) = value {
                            Self::write_value(&home, info, row, value);
                        }
                        return Ok(());
                    }
                    let target = self.variant(&home, info, Transition::Add);
                    let row = self.move_entity(&home, &target, entity, row);
                    if let Some(value) = value {
                        Self::write_value(&target, info, row, value);
                    }
                    self.events.emit(WorldEvent::ComponentAdded {
                        entity,
                        component: info.id,
                    });
                }
            }
            Ok(())
        })
    }

    /// Remove `T` from `entity`.
    ///
    /// Fails with [`EcsError::MissingComponent`] if the entity has no `T` and
    /// validation is on; otherwise nothing happens.
    pub fn remove_component<T: Component>(&self, entity: Entity) -> Result<(), EcsError> {
        self.remove_info(entity, component_info::<T>(), true).map(|_| ())
    }

    pub fn remove_component_by_id(&self, entity: Entity, id: ComponentId) -> Result<(), EcsError> {
        let info = component_info_by_id(id)
            .ok_or_else(|| EcsError::InvalidArgument(format!("unknown component {id:?}")))?;
        self.remove_info(entity, info, true).map(|_| ())
    }

    /// Remove `T` if present. Returns whether it was present.
    pub fn unset_component<T: Component>(&self, entity: Entity) -> Result<bool, EcsError> {
        self.remove_info(entity, component_info::<T>(), false)
    }

    fn remove_info(
        &self,
        entity: Entity,
        info: &'static ComponentInfo,
        strict: bool,
    ) -> Result<bool, EcsError> {
        let missing = || {
            if strict && self.config.validate {
                Err(EcsError::MissingComponent {
                    entity,
                    component: info.name,
                })
            } else {
                Ok(false)
            }
        };
        self.structural(|| {
            let (record, route) = self.route(entity)?;
            match route {
                Route::Buffered(owner) => {
                    let mut buffer = owner.buffer.lock();
                    if !self.virtual_has(&record, &buffer, entity, info.id) {
                        return missing();
                    }
                    buffer.remove(entity, info);
                    drop(buffer);
                    self.set_pending(entity, Some(owner.id()));
                }
                Route::Direct(home) => {
                    if !home.has_component(info.id) {
                        return missing();
                    }
                    let target = self.variant(&home, info, Transition::Remove);
                    self.move_entity(&home, &target, entity, record.row as usize);
                    self.events.emit(WorldEvent::ComponentRemoved {
                        entity,
                        component: info.id,
                    });
                }
            }
            Ok(true)
        })
    }

    /// Set `T` on `entity`, adding it if missing.
    pub fn set_component<T: Component>(&self, entity: Entity, value: T) -> Result<(), EcsError> {
        self.set_boxed(entity, component_info::<T>(), Box::new(value))
    }

    fn set_boxed(
        &self,
        entity: Entity,
        info: &'static ComponentInfo,
        value: Box<dyn Any + Send>,
    ) -> Result<(), EcsError> {
        self.structural(|| {
            let (record, route) = self.route(entity)?;
            match route {
                Route::Buffered(owner) => {
                    let mut buffer = owner.buffer.lock();
                    if self.virtual_has(&record, &buffer, entity, info.id) {
                        buffer.set(entity, info, value);
                    } else {
                        buffer.add(entity, info, Some(value));
                    }
                    drop(buffer);
                    self.set_pending(entity, Some(owner.id()));
                }
                Route::Direct(home) => {
                    let row = record.row as usize;
                    if home.has_component(info.id) {
                        Self::write_value(&home, info, row, value);
                    } else {
                        let target = self.variant(&home, info, Transition::Add);
                        let row = self.move_entity(&home, &target, entity, row);
                        Self::write_value(&target, info, row, value);
                        self.events.emit(WorldEvent::ComponentAdded {
                            entity,
                            component: info.id,
                        });
                    }
                }
            }
            Ok(())
        })
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        self.has_component_by_id(entity, component_info::<T>().id)
    }

    /// Whether `entity` has component `id`, including buffered changes.
    pub fn has_component_by_id(&self, entity: Entity, id: ComponentId) -> bool {
        let _guard = self.structure.lock();
        match self.route(entity) {
            Ok((record, Route::Buffered(owner))) => {
                let buffer = owner.buffer.lock();
                self.virtual_has(&record, &buffer, entity, id)
            }
            Ok((_, Route::Direct(home))) => home.has_component(id),
            Err(_) => false,
        }
    }

    /// A copy of `entity`'s `T`, including buffered changes.
    ///
    /// Reading a column that the calling thread is writing in a scan
    /// deadlocks; use the scan's slices there instead.
    pub fn get_component<T: Component>(&self, entity: Entity) -> Option<T> {
        let info = component_info::<T>();
        let lock = {
            let _guard = self.structure.lock();
            let (record, route) = self.route(entity).ok()?;
            let home = self.archetype_arc(record.archetype);
            if let Route::Buffered(owner) = &route {
                let buffer = owner.buffer.lock();
                if !self.virtual_has(&record, &buffer, entity, info.id) {
                    return None;
                }
                if let Some(value) = buffer.value::<T>(entity) {
                    return Some(value.clone());
                }
                if buffer.is_created(entity) || !home.has_component(info.id) {
                    return Some(T::default());
                }
            } else if !home.has_component(info.id) {
                return None;
            }
            (self.lock_arc(home), record.row as usize)
        };
        let (lock, row) = lock;
        let column = lock.archetype.column_index(info.id)?;
        let _access = lock.archetype.borrows.acquire(&[column], &[]);
        // SAFETY: the archetype is locked and the column is held for reading.
        let storage = unsafe { lock.archetype.storage() };
        Some(storage.columns[column].get::<T>(row).clone())
    }

    /// Buffered value of `T` for `entity`, if a locked scan recorded one.
    pub fn pending_component<T: Component>(&self, entity: Entity) -> Option<T> {
        let _guard = self.structure.lock();
        match self.route(entity).ok()? {
            (_, Route::Buffered(owner)) => owner.buffer.lock().value::<T>(entity).cloned(),
            (_, Route::Direct(_)) => None,
        }
    }

    /// Mutable access to `entity`'s `T`.
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let record = *self.entities.get_mut().get(entity)?;
        if record.pending.is_some() {
            return None;
        }
        let archetype = &self.archetypes.get_mut()[record.archetype.index()];
        let column = archetype.column_index(component_info::<T>().id)?;
        // SAFETY: `&mut self` excludes scans, locks and other world calls.
        let storage = unsafe { archetype.storage_mut() };
        Some(storage.columns[column].get_mut::<T>(record.row as usize))
    }

    // -- tags ----------------------------------------------------------------

    /// Set `tag` on `entity`.
    pub fn add_tag(&self, entity: Entity, tag: TagId) -> Result<(), EcsError> {
        self.structural(|| {
            let (record, route) = self.route(entity)?;
            match route {
                Route::Buffered(owner) => {
                    owner.buffer.lock().add_tag(entity, tag);
                    self.set_pending(entity, Some(owner.id()));
                }
                Route::Direct(home) => {
                    let tags = component_info::<TagBits>();
                    let (archetype, row) = if home.has_component(tags.id) {
                        (home, record.row as usize)
                    } else {
                        let target = self.variant(&home, tags, Transition::Add);
                        let row = self.move_entity(&home, &target, entity, record.row as usize);
                        self.events.emit(WorldEvent::ComponentAdded {
                            entity,
                            component: tags.id,
                        });
                        (target, row)
                    };
                    if self.update_tags(&archetype, row, |bits| bits.set(tag)) {
                        self.events.emit(WorldEvent::TagAdded { entity, tag });
                    }
                }
            }
            Ok(())
        })
    }

    /// Clear `tag` on `entity`.
    pub fn remove_tag(&self, entity: Entity, tag: TagId) -> Result<(), EcsError> {
        self.structural(|| {
            let (record, route) = self.route(entity)?;
            match route {
                Route::Buffered(owner) => {
                    owner.buffer.lock().remove_tag(entity, tag);
                    self.set_pending(entity, Some(owner.id()));
                }
                Route::Direct(home) => {
                    if self.update_tags(&home, record.row as usize, |bits| bits.clear(tag)) {
                        self.events.emit(WorldEvent::TagRemoved { entity, tag });
                    }
                }
            }
            Ok(())
        })
    }

    fn update_tags(
        &self,
        archetype: &Archetype,
        row: usize,
        f: impl FnOnce(&mut TagBits) -> bool,
    ) -> bool {
        let Some(column) = archetype.column_index(component_info::<TagBits>().id) else {
            return false;
        };
        // SAFETY: structural mutex held and `archetype` is not locked.
        let storage = unsafe { archetype.storage_mut() };
        f(storage.columns[column].get_mut::<TagBits>(row))
    }

    /// `entity`'s tags, including buffered tag changes.
    pub fn tags(&self, entity: Entity) -> TagBits {
        let mut bits = self.get_component::<TagBits>(entity).unwrap_or_default();
        let _guard = self.structure.lock();
        if let Ok((_, Route::Buffered(owner))) = self.route(entity) {
            for op in owner.buffer.lock().tag_ops(entity) {
                match op {
                    BufferedOp::AddTag(tag) => {
                        bits.set(tag);
                    }
                    BufferedOp::RemoveTag(tag) => {
                        bits.clear(tag);
                    }
                    _ => {}
                }
            }
        }
        bits
    }

    pub fn has_tag(&self, entity: Entity, tag: TagId) -> bool {
        self.tags(entity).get(tag)
    }

    // -- capacity ------------------------------------------------------------

    /// Make room for `additional` more entities with the given schema.
    /// Deferred while that archetype is locked.
    pub fn reserve(&self, ids: &[ComponentId], additional: usize) -> Result<(), EcsError> {
        let definition = Self::definition_of(ids)?;
        self.structural(|| {
            let archetype = self.get_or_create_archetype(definition);
            if archetype.is_locked() {
                archetype.buffer.lock().request_reserve(additional);
            } else {
                // SAFETY: structural mutex held, archetype unlocked.
                let storage = unsafe { archetype.storage_mut() };
                storage.ensure_capacity(storage.count + additional);
                archetype.sync_len(storage);
            }
        });
        Ok(())
    }

    // -- JSON ----------------------------------------------------------------

    /// Make `T` settable by `name` through [`World::set_component_json`].
    pub fn register_json<T: Component + DeserializeOwned>(&self, name: &str) {
        self.json
            .write()
            .insert(name.to_owned(), (component_info::<T>(), deserialize_boxed::<T>));
    }

    /// Set a component from a JSON value, looked up by registered name.
    pub fn set_component_json(
        &self,
        entity: Entity,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), EcsError> {
        let entry = self.json.read().get(name).copied();
        let Some((info, deserialize)) = entry else {
            let mut registered: Vec<String> = self.json.read().keys().cloned().collect();
            registered.sort();
            return Err(EcsError::UnknownComponent {
                name: name.to_owned(),
                registered: registered.join(", "),
            });
        };
        let boxed = deserialize(value).map_err(|e| EcsError::ComponentDeserialization {
            component: name.to_owned(),
            details: e.to_string(),
        })?;
        self.set_boxed(entity, info, boxed)
    }

    // -- events --------------------------------------------------------------

    /// Change which event kinds are delivered.
    pub fn set_events(&self, kinds: EventKinds) {
        self.events.set_enabled(kinds);
    }

    /// Register `observer` for the given kinds. Kinds must also be enabled
    /// with [`World::set_events`] or in the config.
    pub fn observe(&self, kinds: EventKinds, observer: impl Fn(&WorldEvent) + Send + Sync + 'static) {
        self.events.observe(kinds, Box::new(observer));
    }

    // -- archetypes and filters ---------------------------------------------

    /// Lock archetype `id` until the returned guard is dropped. Structural
    /// changes to its entities are buffered meanwhile.
    pub fn lock_archetype(&self, id: ArchetypeId) -> Option<ArchetypeLock<'_>> {
        let archetype = Arc::clone(self.archetypes.read().get(id.index())?);
        let _guard = self.structure.lock();
        Some(self.lock_arc(archetype))
    }

    pub(crate) fn lock_archetype_arc(&self, archetype: &Arc<Archetype>) -> ArchetypeLock<'_> {
        let _guard = self.structure.lock();
        self.lock_arc(Arc::clone(archetype))
    }

    /// The cached filter for `mask`, built on first request.
    pub fn filter(&self, mask: &ComponentMask) -> Result<Arc<ArchetypeFilter>, EcsError> {
        mask.validate()?;
        let cached = self.filters.read().get(mask).cloned();
        if let Some(filter) = cached {
            return Ok(filter);
        }
        let _guard = self.structure.lock();
        let cached = self.filters.read().get(mask).cloned();
        if let Some(filter) = cached {
            return Ok(filter);
        }
        let filter = Arc::new(ArchetypeFilter::new(mask.clone()));
        for archetype in self.archetypes.read().iter() {
            filter.offer(archetype);
        }
        self.filters.write().insert(mask.clone(), Arc::clone(&filter));
        debug!(archetypes = filter.len(), "created archetype filter");
        Ok(filter)
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<Arc<Archetype>> {
        self.archetypes.read().get(id.index()).cloned()
    }

    /// Archetype `entity` currently lives in.
    pub fn archetype_of(&self, entity: Entity) -> Option<ArchetypeId> {
        self.entities.read().get(entity).map(|rec| rec.archetype)
    }

    /// Column of `component` in `archetype`, if it has one.
    pub fn column_index(&self, archetype: ArchetypeId, component: ComponentId) -> Option<usize> {
        self.component_index
            .read()
            .get(component.index())?
            .get(&archetype)
            .copied()
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.read().len()
    }

    /// Live entities. Buffered creates count; buffered destroys do not.
    pub fn entity_count(&self) -> usize {
        let alive = self.entities.read().alive();
        alive.saturating_sub(self.pending_destroys.load(Ordering::Relaxed))
    }

    /// Snapshot of every archetype.
    pub fn archetypes(&self) -> Vec<Arc<Archetype>> {
        self.archetypes.read().clone()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        let issued = self.entities.get_mut().issued();
        world_ids().lock().release(self.id, issued);
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id)
            .field("entities", &self.entity_count())
            .field("archetypes", &self.archetype_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ArchetypeLock
// ---------------------------------------------------------------------------

/// Holds an archetype locked. Dropping the last lock replays its buffer.
pub struct ArchetypeLock<'w> {
    world: &'w World,
    pub(crate) archetype: Arc<Archetype>,
}

impl ArchetypeLock<'_> {
    pub fn archetype(&self) -> &Archetype {
        &self.archetype
    }
}

impl Drop for ArchetypeLock<'_> {
    fn drop(&mut self) {
        self.world.release(&self.archetype);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
