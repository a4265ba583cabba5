//! Colonnade ECS -- archetype-based in-memory entity store with deferred
//! structural changes.
//!
//! Entities with the same set of component types share an archetype, which
//! stores each component in a dense column. Adding or removing a component
//! moves the entity between archetypes along a cached transition graph.
//! Scans lock the archetypes they visit; structural changes made while a scan
//! is running are recorded in the archetype's command buffer and replayed when
//! the last lock is released. Concurrent scans negotiate per-column read and
//! write access so scans over disjoint columns of one archetype run together.
//!
//! # Quick Start
//!
//! ```
//! use colonnade_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let world = World::new();
//! let entity = world.spawn(
//!     ComponentBundle::new()
//!         .with(Position { x: 0.0, y: 0.0 })
//!         .with(Velocity { dx: 1.0, dy: 0.0 }),
//! );
//!
//! let mask = ComponentMask::new().write::<Position>().has::<Velocity>();
//! world
//!     .query(&mask, |scan| {
//!         let vel = scan.read::<Velocity>()?;
//!         for (p, v) in scan.write::<Position>()?.iter_mut().zip(vel) {
//!             p.x += v.dx;
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert_eq!(world.get_component::<Position>(entity), Some(Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

pub mod access;
#[allow(unsafe_code)]
pub mod archetype;
pub mod bitmask;
#[allow(unsafe_code)]
pub mod column;
#[allow(unsafe_code)]
pub mod command;
pub mod component;
pub mod config;
pub mod entity;
pub mod event;
pub mod filter;
pub mod mask;
#[allow(unsafe_code)]
pub mod query;
pub mod sparse_set;
#[allow(unsafe_code)]
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// Add of a component the entity already has (validation on).
    #[error("entity {entity} already has component {component}")]
    DuplicateComponent {
        entity: entity::Entity,
        component: &'static str,
    },

    /// Remove of a component the entity does not have (validation on).
    #[error("entity {entity} has no component {component}")]
    MissingComponent {
        entity: entity::Entity,
        component: &'static str,
    },

    /// The handle is destroyed, recycled, pending destruction or foreign.
    #[error("entity {0:?} does not exist (stale or never allocated)")]
    InvalidEntity(entity::Entity),

    /// Malformed mask, undeclared column access or unknown component id.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A component name was used that has not been registered for JSON.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent {
        name: String,
        registered: String,
    },

    /// Deserialization of a component value failed.
    #[error("failed to deserialize component '{component}': {details}")]
    ComponentDeserialization {
        component: String,
        details: String,
    },

    /// World configuration could not be parsed.
    #[error("invalid world configuration: {0}")]
    Config(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeDefinition, ArchetypeId};
    pub use crate::bitmask::BitMask;
    pub use crate::component::{
        component_id, component_info, tag_id, Component, ComponentId, ComponentInfo, StorageKind,
        TagBits, TagId,
    };
    pub use crate::config::WorldConfig;
    pub use crate::entity::Entity;
    pub use crate::event::{EventKinds, WorldEvent};
    pub use crate::filter::ArchetypeFilter;
    pub use crate::mask::{ComponentMask, TagMask};
    pub use crate::query::{ArchetypeScan, Query, QueryItem};
    pub use crate::world::{ArchetypeLock, ComponentBundle, World};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
