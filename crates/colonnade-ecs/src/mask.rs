//! Compiled query predicates.
//!
//! A [`ComponentMask`] is matched against an archetype's component bits; a
//! [`TagMask`] applies the same algebra to a single entity's [`TagBits`].
//!
//! For a target `M` a mask matches when
//! `has ⊆ M`, `exclude ∩ M = ∅`, every `some` group intersects `M`, and no
//! `not_all` group is fully contained in `M`.

use crate::bitmask::BitMask;
use crate::component::{component_id, tag_id, Component, ComponentId, TagBits, TagId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentMask
// ---------------------------------------------------------------------------

/// Archetype-level predicate plus the columns a scan intends to write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ComponentMask {
    has: BitMask,
    write: BitMask,
    exclude: BitMask,
    some: Vec<BitMask>,
    not_all: Vec<BitMask>,
}

impl ComponentMask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `T` (read access).
    pub fn has<T: Component>(self) -> Self {
        self.has_id(component_id::<T>())
    }

    pub fn has_id(mut self, id: ComponentId) -> Self {
        self.has.set(id.index());
        self
    }

    /// Require `T` with exclusive write access.
    pub fn write<T: Component>(self) -> Self {
        self.write_id(component_id::<T>())
    }

    pub fn write_id(mut self, id: ComponentId) -> Self {
        self.has.set(id.index());
        self.write.set(id.index());
        self
    }

    /// Reject archetypes containing `T`.
    pub fn exclude<T: Component>(self) -> Self {
        self.exclude_id(component_id::<T>())
    }

    pub fn exclude_id(mut self, id: ComponentId) -> Self {
        self.exclude.set(id.index());
        self
    }

    /// Require at least one of `ids`.
    pub fn some(mut self, ids: impl IntoIterator<Item = ComponentId>) -> Self {
        self.some.push(ids.into_iter().map(ComponentId::index).collect());
        self
    }

    /// Reject archetypes containing all of `ids`.
    pub fn not_all(mut self, ids: impl IntoIterator<Item = ComponentId>) -> Self {
        self.not_all
            .push(ids.into_iter().map(ComponentId::index).collect());
        self
    }

    /// Union of both predicates and both access declarations.
    pub fn merge(mut self, other: &ComponentMask) -> Self {
        self.has.or_with(&other.has);
        self.write.or_with(&other.write);
        self.exclude.or_with(&other.exclude);
        self.some.extend(other.some.iter().cloned());
        self.not_all.extend(other.not_all.iter().cloned());
        self
    }

    /// Reject masks that can never match or are ambiguous.
    pub fn validate(&self) -> Result<(), EcsError> {
        if self.some.iter().chain(&self.not_all).any(BitMask::is_empty) {
            return Err(EcsError::InvalidArgument(
                "empty some/not_all group in component mask".into(),
            ));
        }
        if self.has.any_set_in(&self.exclude) {
            return Err(EcsError::InvalidArgument(
                "component mask both requires and excludes a component".into(),
            ));
        }
        Ok(())
    }

    /// Evaluate the predicate against an archetype's component bits.
    pub fn matches(&self, archetype: &BitMask) -> bool {
        self.has.all_set_in(archetype)
            && !self.exclude.any_set_in(archetype)
            && self.some.iter().all(|g| g.any_set_in(archetype))
            && self.not_all.iter().all(|g| !g.all_set_in(archetype))
    }

    pub fn has_mask(&self) -> &BitMask {
        &self.has
    }

    pub fn write_mask(&self) -> &BitMask {
        &self.write
    }

    pub fn exclude_mask(&self) -> &BitMask {
        &self.exclude
    }

    /// The "some-of" groups. Present members are readable in a scan.
    pub fn some_masks(&self) -> &[BitMask] {
        &self.some
    }
}

// ---------------------------------------------------------------------------
// TagMask
// ---------------------------------------------------------------------------

/// Entity-level predicate over tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagMask {
    has: TagBits,
    exclude: TagBits,
    some: Vec<TagBits>,
    not_all: Vec<TagBits>,
}

fn tag_group(tags: impl IntoIterator<Item = TagId>) -> TagBits {
    let mut bits = TagBits::default();
    for tag in tags {
        bits.set(tag);
    }
    bits
}

impl TagMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has<T: 'static>(self) -> Self {
        self.has_id(tag_id::<T>())
    }

    pub fn has_id(mut self, tag: TagId) -> Self {
        self.has.set(tag);
        self
    }

    pub fn exclude<T: 'static>(self) -> Self {
        self.exclude_id(tag_id::<T>())
    }

    pub fn exclude_id(mut self, tag: TagId) -> Self {
        self.exclude.set(tag);
        self
    }

    pub fn some(mut self, tags: impl IntoIterator<Item = TagId>) -> Self {
        self.some.push(tag_group(tags));
        self
    }

    pub fn not_all(mut self, tags: impl IntoIterator<Item = TagId>) -> Self {
        self.not_all.push(tag_group(tags));
        self
    }

    pub fn validate(&self) -> Result<(), EcsError> {
        if self.some.iter().chain(&self.not_all).any(TagBits::is_empty) {
            return Err(EcsError::InvalidArgument(
                "empty some/not_all group in tag mask".into(),
            ));
        }
        if self.has.any_set_in(&self.exclude) {
            return Err(EcsError::InvalidArgument(
                "tag mask both requires and excludes a tag".into(),
            ));
        }
        Ok(())
    }

    /// Evaluate against one entity's tags.
    pub fn matches(&self, tags: &TagBits) -> bool {
        self.has.all_set_in(tags)
            && !self.exclude.any_set_in(tags)
            && self.some.iter().all(|g| g.any_set_in(tags))
            && self.not_all.iter().all(|g| !g.all_set_in(tags))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct A;
    #[derive(Clone, Default)]
    struct B;
    #[derive(Clone, Default)]
    struct C;

    struct Red;
    struct Blue;

    fn bits(ids: &[ComponentId]) -> BitMask {
        ids.iter().map(|id| id.index()).collect()
    }

    #[test]
    fn has_and_exclude() {
        let (a, b, c) = (component_id::<A>(), component_id::<B>(), component_id::<C>());
        let mask = ComponentMask::new().has::<A>().exclude::<C>();
        assert!(mask.matches(&bits(&[a])));
        assert!(mask.matches(&bits(&[a, b])));
        assert!(!mask.matches(&bits(&[a, c])));
        assert!(!mask.matches(&bits(&[b])));
    }

    #[test]
    fn some_and_not_all_groups() {
        let (a, b, c) = (component_id::<A>(), component_id::<B>(), component_id::<C>());
        let mask = ComponentMask::new().some([a, b]).not_all([b, c]);
        assert!(mask.matches(&bits(&[a])));
        assert!(mask.matches(&bits(&[b])));
        assert!(!mask.matches(&bits(&[c])));
        assert!(!mask.matches(&bits(&[b, c])));
        assert!(mask.matches(&bits(&[a, c])));
    }

    #[test]
    fn write_implies_has() {
        let mask = ComponentMask::new().write::<A>();
        assert!(mask.has_mask().get(component_id::<A>().index()));
        assert!(mask.write_mask().get(component_id::<A>().index()));
    }

    #[test]
    fn validate_rejects_malformed_masks() {
        assert!(ComponentMask::new().has::<A>().exclude::<A>().validate().is_err());
        assert!(ComponentMask::new().some([]).validate().is_err());
        assert!(ComponentMask::new().has::<A>().exclude::<B>().validate().is_ok());
    }

    #[test]
    fn merge_unions_everything() {
        let merged = ComponentMask::new()
            .has::<A>()
            .merge(&ComponentMask::new().write::<B>().exclude::<C>());
        assert_eq!(
            merged,
            ComponentMask::new().has::<A>().write::<B>().exclude::<C>()
        );
    }

    #[test]
    fn tag_mask_matches_entity_bits() {
        let (red, blue) = (tag_id::<Red>(), tag_id::<Blue>());
        let mut tags = TagBits::default();
        tags.set(red);
        assert!(TagMask::new().has::<Red>().matches(&tags));
        assert!(!TagMask::new().has::<Blue>().matches(&tags));
        assert!(!TagMask::new().exclude::<Red>().matches(&tags));
        assert!(TagMask::new().some([red, blue]).matches(&tags));
        tags.set(blue);
        assert!(!TagMask::new().not_all([red, blue]).matches(&tags));
        assert!(TagMask::new().some([]).validate().is_err());
    }
}
