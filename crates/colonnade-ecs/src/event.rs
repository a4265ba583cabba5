//! Opt-in structural change notifications.
//!
//! Each event kind is enabled individually through [`EventKinds`]; disabled
//! kinds cost one atomic load per structural change. Events are queued while
//! the world's structural mutex is held and delivered to observers after it is
//! released, so observers may call back into the world. Registering a new
//! observer from inside an observer deadlocks.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::component::{ComponentId, TagId};
use crate::entity::Entity;

// ---------------------------------------------------------------------------
// WorldEvent
// ---------------------------------------------------------------------------

/// A structural change that has been applied to the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldEvent {
    EntityCreated(Entity),
    EntityDestroyed(Entity),
    ComponentAdded { entity: Entity, component: ComponentId },
    ComponentRemoved { entity: Entity, component: ComponentId },
    TagAdded { entity: Entity, tag: TagId },
    TagRemoved { entity: Entity, tag: TagId },
}

impl WorldEvent {
    pub fn kind(&self) -> EventKinds {
        match self {
            WorldEvent::EntityCreated(_) => EventKinds::ENTITY_CREATED,
            WorldEvent::EntityDestroyed(_) => EventKinds::ENTITY_DESTROYED,
            WorldEvent::ComponentAdded { .. } => EventKinds::COMPONENT_ADDED,
            WorldEvent::ComponentRemoved { .. } => EventKinds::COMPONENT_REMOVED,
            WorldEvent::TagAdded { .. } => EventKinds::TAG_ADDED,
            WorldEvent::TagRemoved { .. } => EventKinds::TAG_REMOVED,
        }
    }
}

// ---------------------------------------------------------------------------
// EventKinds
// ---------------------------------------------------------------------------

/// Set of event kinds.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKinds(u8);

impl EventKinds {
    pub const NONE: EventKinds = EventKinds(0);
    pub const ENTITY_CREATED: EventKinds = EventKinds(1 << 0);
    pub const ENTITY_DESTROYED: EventKinds = EventKinds(1 << 1);
    pub const COMPONENT_ADDED: EventKinds = EventKinds(1 << 2);
    pub const COMPONENT_REMOVED: EventKinds = EventKinds(1 << 3);
    pub const TAG_ADDED: EventKinds = EventKinds(1 << 4);
    pub const TAG_REMOVED: EventKinds = EventKinds(1 << 5);
    pub const ALL: EventKinds = EventKinds(0b11_1111);

    #[inline]
    pub fn contains(self, other: EventKinds) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: EventKinds) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for EventKinds {
    type Output = EventKinds;

    fn bitor(self, rhs: EventKinds) -> EventKinds {
        EventKinds(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventKinds {
    fn bitor_assign(&mut self, rhs: EventKinds) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventKinds({:#08b})", self.0)
    }
}

// ---------------------------------------------------------------------------
// EventHub
// ---------------------------------------------------------------------------

type Observer = Box<dyn Fn(&WorldEvent) + Send + Sync>;

/// Queue and observer list owned by a world.
pub(crate) struct EventHub {
    enabled: AtomicU8,
    observers: RwLock<Vec<(EventKinds, Observer)>>,
    pending: Mutex<Vec<WorldEvent>>,
}

impl EventHub {
    pub fn new(enabled: EventKinds) -> Self {
        Self {
            enabled: AtomicU8::new(enabled.0),
            observers: RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn enabled(&self) -> EventKinds {
        EventKinds(self.enabled.load(Ordering::Relaxed))
    }

    pub fn set_enabled(&self, kinds: EventKinds) {
        self.enabled.store(kinds.0, Ordering::Relaxed);
    }

    pub fn observe(&self, kinds: EventKinds, observer: Observer) {
        self.observers.write().push((kinds, observer));
    }

    /// Queue `event` if its kind is enabled.
    #[inline]
    pub fn emit(&self, event: WorldEvent) {
        if self.enabled().intersects(event.kind()) {
            self.pending.lock().push(event);
        }
    }

    /// Deliver every queued event. Call without holding the structural mutex.
    pub fn dispatch(&self) {
        let events = std::mem::take(&mut *self.pending.lock());
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read();
        for event in &events {
            let kind = event.kind();
            for (kinds, observer) in observers.iter() {
                if kinds.intersects(kind) {
                    observer(event);
                }
            }
        }
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("enabled", &self.enabled())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn kinds_combine() {
        let kinds = EventKinds::ENTITY_CREATED | EventKinds::TAG_ADDED;
        assert!(kinds.contains(EventKinds::TAG_ADDED));
        assert!(!kinds.contains(EventKinds::TAG_REMOVED));
        assert!(EventKinds::ALL.contains(kinds));
        assert!(EventKinds::NONE.is_empty());
    }

    #[test]
    fn disabled_kinds_are_not_queued() {
        let hub = EventHub::new(EventKinds::ENTITY_DESTROYED);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hub.observe(
            EventKinds::ALL,
            Box::new(move |e: &WorldEvent| sink.lock().push(*e)),
        );

        let e = Entity::new(0, 1, 0);
        hub.emit(WorldEvent::EntityCreated(e));
        hub.emit(WorldEvent::EntityDestroyed(e));
        hub.dispatch();
        assert_eq!(*seen.lock(), vec![WorldEvent::EntityDestroyed(e)]);
    }

    #[test]
    fn observers_filter_by_kind() {
        let hub = EventHub::new(EventKinds::ALL);
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        hub.observe(
            EventKinds::ENTITY_CREATED,
            Box::new(move |_: &WorldEvent| *sink.lock() += 1),
        );
        let e = Entity::new(3, 1, 0);
        hub.emit(WorldEvent::EntityCreated(e));
        hub.emit(WorldEvent::EntityDestroyed(e));
        hub.dispatch();
        hub.dispatch();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn kinds_serialize_as_bits() {
        let json = serde_json::to_string(&EventKinds::ALL).unwrap();
        assert_eq!(json, "63");
        let back: EventKinds = serde_json::from_str("5").unwrap();
        assert_eq!(back, EventKinds::ENTITY_CREATED | EventKinds::COMPONENT_ADDED);
    }
}
