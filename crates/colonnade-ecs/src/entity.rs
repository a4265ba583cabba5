//! Entity handles and the entity index.
//!
//! An [`Entity`] names a slot in a world's entity index together with the
//! generation the slot had when the handle was issued. The index record
//! stores the generation as a signed number: positive while the slot is alive,
//! negated when the entity is destroyed. Reusing a slot moves it to the next
//! generation, so a stale handle can never match a recycled slot.
//!
//! A world that reuses the id of a dropped world starts its slots above the
//! highest generation the dropped world issued, so the dropped world's handles
//! stay dead as well.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::archetype::ArchetypeId;

/// Largest generation a handle can carry (24 bits).
///
/// Generations are unique per slot (and per world id across dropped worlds)
/// until this value is reached. The next generation after it wraps back to 1,
/// so a handle held across 2^24 reuses of one slot may match again.
pub const MAX_GENERATION: u32 = 0x00FF_FFFF;

#[inline]
fn next_generation(previous: u32) -> u32 {
    if previous >= MAX_GENERATION {
        1
    } else {
        previous + 1
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Stable handle to an entity.
///
/// Packed layout (see [`Entity::to_bits`]): `[world: 8 | generation: 24 | index: 32]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    index: u32,
    generation: u32,
    world: u8,
}

impl Entity {
    /// Filler for unoccupied archetype rows. Never issued.
    pub(crate) const PLACEHOLDER: Entity = Entity {
        index: u32::MAX,
        generation: 0,
        world: 0,
    };

    #[inline]
    pub(crate) fn new(index: u32, generation: u32, world: u8) -> Self {
        debug_assert!((1..=MAX_GENERATION).contains(&generation));
        Self {
            index,
            generation,
            world,
        }
    }

    /// Slot in the entity index.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Id of the world that issued this handle.
    #[inline]
    pub fn world(self) -> u8 {
        self.world
    }

    /// Pack into a `u64`.
    #[inline]
    pub fn to_bits(self) -> u64 {
        (self.world as u64) << 56 | (self.generation as u64 & MAX_GENERATION as u64) << 32 | self.index as u64
    }

    /// Unpack a value produced by [`Entity::to_bits`].
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32 & MAX_GENERATION,
            world: (bits >> 56) as u8,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{}@w{})", self.index, self.generation, self.world)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// Where an entity lives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntityRecord {
    pub archetype: ArchetypeId,
    pub row: u32,
    /// Positive while alive, negated once destroyed.
    pub generation: i32,
    /// Archetype whose command buffer currently owns this entity's deferred
    /// operations, if any.
    pub pending: Option<ArchetypeId>,
}

impl EntityRecord {
    #[inline]
    pub fn matches(&self, entity: Entity) -> bool {
        self.generation > 0 && self.generation as u32 == entity.generation
    }
}

// ---------------------------------------------------------------------------
// EntityIndex
// ---------------------------------------------------------------------------

/// One record per ever-allocated slot plus a FIFO free list.
#[derive(Debug, Default)]
pub(crate) struct EntityIndex {
    records: Vec<EntityRecord>,
    free: VecDeque<u32>,
    alive: usize,
    /// Fresh slots start at the generation after this one.
    base: u32,
    /// Highest generation issued so far.
    issued: u32,
}

impl EntityIndex {
    /// An index whose fresh slots start above generation `base`.
    pub fn new(capacity: usize, base: u32) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            free: VecDeque::new(),
            alive: 0,
            base,
            issued: base,
        }
    }

    /// Allocate a slot for an entity living at `(archetype, row)`.
    pub fn allocate(&mut self, world: u8, archetype: ArchetypeId, row: u32) -> Entity {
        self.alive += 1;
        if let Some(index) = self.free.pop_front() {
            let rec = &mut self.records[index as usize];
            debug_assert!(rec.generation < 0, "free slot {index} is alive");
            let generation = next_generation(rec.generation.unsigned_abs());
            self.issued = self.issued.max(generation);
            *rec = EntityRecord {
                archetype,
                row,
                generation: generation as i32,
                pending: None,
            };
            return Entity::new(index, generation, world);
        }
        let index = self.records.len() as u32;
        let generation = next_generation(self.base);
        self.issued = self.issued.max(generation);
        self.records.push(EntityRecord {
            archetype,
            row,
            generation: generation as i32,
            pending: None,
        });
        Entity::new(index, generation, world)
    }

    /// Mark `entity`'s slot destroyed and queue it for reuse.
    pub fn free(&mut self, entity: Entity) {
        let rec = &mut self.records[entity.index as usize];
        debug_assert!(rec.matches(entity));
        rec.generation = -rec.generation;
        rec.pending = None;
        self.free.push_back(entity.index);
        self.alive -= 1;
    }

    /// The record for a live handle.
    pub fn get(&self, entity: Entity) -> Option<&EntityRecord> {
        self.records
            .get(entity.index as usize)
            .filter(|rec| rec.matches(entity))
    }

    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut EntityRecord> {
        self.records
            .get_mut(entity.index as usize)
            .filter(|rec| rec.matches(entity))
    }

    /// Number of live entities.
    pub fn alive(&self) -> usize {
        self.alive
    }

    /// Highest generation this index has issued, or its base if none.
    pub fn issued(&self) -> u32 {
        self.issued
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
