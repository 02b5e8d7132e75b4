//! Relationship construction and hub synthesis

use crate::identity::{deterministic_id, random_id};
use crate::model::{Entity, Relationship, StixId, RELATIONSHIP_TYPE};
use serde_json::{Map, Value};

/// Edge direction relative to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// hub → peripheral
    #[default]
    Forward,
    /// peripheral → hub
    Reversed,
}

impl Relationship {
    /// Create an edge. With `force_deterministic` the identifier is derived
    /// from `(source_ref, target_ref, relationship_type)`.
    pub fn new(
        source_ref: &StixId,
        target_ref: &StixId,
        relationship_type: &str,
        force_deterministic: bool,
    ) -> Self {
        let id = if force_deterministic {
            let mut fields = Map::new();
            fields.insert("source_ref".into(), Value::String(source_ref.to_string()));
            fields.insert("target_ref".into(), Value::String(target_ref.to_string()));
            fields.insert(
                "relationship_type".into(),
                Value::String(relationship_type.to_string()),
            );
            deterministic_id(RELATIONSHIP_TYPE, &fields)
                .unwrap_or_else(|| random_id(RELATIONSHIP_TYPE))
        } else {
            random_id(RELATIONSHIP_TYPE)
        };

        Self {
            id,
            source_ref: source_ref.clone(),
            target_ref: target_ref.clone(),
            relationship_type: relationship_type.to_string(),
            force_deterministic,
        }
    }

    /// Deterministic edge between two entities
    pub fn link(source: &Entity, target: &Entity, relationship_type: &str) -> Self {
        Self::new(source.id(), target.id(), relationship_type, true)
    }
}

/// Emit one deterministic edge per peripheral entity
pub fn synthesize<'a, I>(
    hub: &Entity,
    peripherals: I,
    relationship_type: &str,
    direction: Direction,
) -> Vec<Relationship>
where
    I: IntoIterator<Item = &'a Entity>,
{
    peripherals
        .into_iter()
        .map(|peripheral| match direction {
            Direction::Forward => Relationship::link(hub, peripheral, relationship_type),
            Direction::Reversed => Relationship::link(peripheral, hub, relationship_type),
        })
        .collect()
}
