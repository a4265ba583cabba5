//! World configuration.

use serde::{Deserialize, Serialize};

use crate::event::EventKinds;
use crate::EcsError;

/// Settings fixed at world construction.
///
/// Missing JSON fields take their default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Check for duplicate adds and missing removes. When off, a duplicate add
    /// overwrites the value and a missing remove does nothing. Defaults to on
    /// in debug builds only.
    pub validate: bool,
    /// Event kinds delivered to observers.
    pub events: EventKinds,
    /// Entity slots to pre-allocate.
    pub entity_capacity: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            validate: cfg!(debug_assertions),
            events: EventKinds::NONE,
            entity_capacity: 0,
        }
    }
}

impl WorldConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, EcsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_events(mut self, events: EventKinds) -> Self {
        self.events = events;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = WorldConfig::from_json(r#"{ "entity_capacity": 128 }"#).unwrap();
        assert_eq!(cfg.entity_capacity, 128);
        assert_eq!(cfg.validate, cfg!(debug_assertions));
        assert_eq!(cfg.events, EventKinds::NONE);
    }

    #[test]
    fn full_json() {
        let cfg = WorldConfig::from_json(r#"{ "validate": true, "events": 3 }"#).unwrap();
        assert!(cfg.validate);
        assert_eq!(
            cfg.events,
            EventKinds::ENTITY_CREATED | EventKinds::ENTITY_DESTROYED
        );
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = WorldConfig::from_json("{ validate: ").unwrap_err();
        assert!(matches!(err, EcsError::Config(_)));
    }
}
