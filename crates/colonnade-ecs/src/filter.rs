//! Live archetype filters.
//!
//! An [`ArchetypeFilter`] caches the archetypes matching a [`ComponentMask`].
//! The world evaluates each existing archetype once when the filter is built
//! and then offers every newly created archetype to every filter, so a filter
//! never rescans.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::archetype::Archetype;
use crate::mask::ComponentMask;

/// Cached list of archetypes matching a mask.
#[derive(Debug)]
pub struct ArchetypeFilter {
    mask: ComponentMask,
    archetypes: RwLock<Vec<Arc<Archetype>>>,
}

impl ArchetypeFilter {
    pub(crate) fn new(mask: ComponentMask) -> Self {
        Self {
            mask,
            archetypes: RwLock::new(Vec::new()),
        }
    }

    /// Add `archetype` if it matches. Returns whether it was added.
    pub(crate) fn offer(&self, archetype: &Arc<Archetype>) -> bool {
        if !self.mask.matches(archetype.mask()) {
            return false;
        }
        self.archetypes.write().push(Arc::clone(archetype));
        true
    }

    pub fn mask(&self) -> &ComponentMask {
        &self.mask
    }

    /// Snapshot of the matching archetypes, in creation order.
    pub fn archetypes(&self) -> Vec<Arc<Archetype>> {
        self.archetypes.read().clone()
    }

    /// Number of matching archetypes.
    pub fn len(&self) -> usize {
        self.archetypes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.archetypes.read().is_empty()
    }

    /// Rows across all matching archetypes.
    pub fn entity_count(&self) -> usize {
        self.archetypes.read().iter().map(|a| a.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{ArchetypeDefinition, ArchetypeId};
    use crate::component::component_info;

    #[derive(Clone, Default)]
    struct Speed(f32);
    #[derive(Clone, Default)]
    struct Mass(f32);

    #[test]
    fn offer_keeps_only_matches() {
        let filter = ArchetypeFilter::new(ComponentMask::new().has::<Speed>());
        let speed = Arc::new(Archetype::new(
            ArchetypeId(1),
            ArchetypeDefinition::new([component_info::<Speed>()]),
        ));
        let mass = Arc::new(Archetype::new(
            ArchetypeId(2),
            ArchetypeDefinition::new([component_info::<Mass>()]),
        ));
        assert!(filter.offer(&speed));
        assert!(!filter.offer(&mass));
        assert_eq!(filter.len(), 1);
        assert_eq!(filter.archetypes()[0].id(), ArchetypeId(1));
        assert_eq!(filter.entity_count(), 0);
    }
}
