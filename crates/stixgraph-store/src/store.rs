//! Object store for one analysis graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use stixgraph_core::model::{Entity, Relationship, StixId, StixObject};
use tracing::debug;

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New identifier
    Inserted,
    /// Identifier present with equal content
    Unchanged,
    /// Identifier present with different content; content replaced in place
    Replaced,
}

/// Keyed container of entities and relationships.
///
/// Iteration follows first-insertion order. Removal while walking the store
/// must go through [`ObjectStore::snapshot`].
#[derive(Debug, Clone)]
pub struct ObjectStore {
    /// All stored objects, keyed by identifier
    objects: HashMap<StixId, StixObject>,
    /// Identifiers in first-insertion order
    order: Vec<StixId>,
    /// Timestamp stamped on exported domain objects
    created_at: DateTime<Utc>,
}

impl ObjectStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::with_timestamp(Utc::now())
    }

    pub fn with_timestamp(created_at: DateTime<Utc>) -> Self {
        Self {
            objects: HashMap::new(),
            order: Vec::new(),
            created_at,
        }
    }

    /// Idempotent upsert keyed by identifier
    pub fn add<T: Into<StixObject>>(&mut self, item: T) -> AddOutcome {
        let item = item.into();
        match self.objects.get_mut(item.id()) {
            Some(existing) if *existing == item => AddOutcome::Unchanged,
            Some(existing) => {
                debug!(id = %item.id(), "replacing stored object content");
                *existing = item;
                AddOutcome::Replaced
            }
            None => {
                self.order.push(item.id().clone());
                self.objects.insert(item.id().clone(), item);
                AddOutcome::Inserted
            }
        }
    }

    /// Insert many items, returning how many identifiers were new
    pub fn add_all<I, T>(&mut self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
        T: Into<StixObject>,
    {
        items
            .into_iter()
            .map(|item| self.add(item))
            .filter(|outcome| *outcome == AddOutcome::Inserted)
            .count()
    }

    pub fn get(&self, id: &StixId) -> Option<&StixObject> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &StixId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn entity_mut(&mut self, id: &StixId) -> Option<&mut Entity> {
        self.objects.get_mut(id).and_then(StixObject::as_entity_mut)
    }

    /// Remove an object; no-op if absent
    pub fn remove(&mut self, id: &StixId) -> Option<StixObject> {
        let removed = self.objects.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    /// Remove every listed object, compacting the insertion order once.
    /// Returns how many were present.
    pub fn remove_all<'a, I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = &'a StixId>,
    {
        let removed = ids
            .into_iter()
            .filter(|id| self.objects.remove(*id).is_some())
            .count();
        if removed > 0 {
            let objects = &self.objects;
            self.order.retain(|id| objects.contains_key(id));
        }
        removed
    }

    /// Point-in-time copy of the identifiers, safe to iterate while mutating
    pub fn snapshot(&self) -> Vec<StixId> {
        self.order.clone()
    }

    /// Objects in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &StixObject> {
        self.order.iter().filter_map(|id| self.objects.get(id))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.iter().filter_map(StixObject::as_entity)
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.iter().filter_map(StixObject::as_relationship)
    }

    /// Relationships with an endpoint missing from the store
    pub fn dangling_relationships(&self) -> Vec<StixId> {
        self.relationships()
            .filter(|rel| !self.contains(&rel.source_ref) || !self.contains(&rel.target_ref))
            .map(|rel| rel.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get statistics
    pub fn statistics(&self) -> StoreStatistics {
        let mut by_type = BTreeMap::new();
        for object in self.iter() {
            *by_type.entry(object.id().object_type().to_string()).or_insert(0) += 1;
        }

        StoreStatistics {
            total_objects: self.len(),
            entities: self.entities().count(),
            relationships: self.relationships().count(),
            by_type,
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total_objects: usize,
    pub entities: usize,
    pub relationships: usize,
    pub by_type: BTreeMap<String, usize>,
}

impl StoreStatistics {
    pub fn count_of(&self, object_type: &str) -> usize {
        self.by_type.get(object_type).copied().unwrap_or(0)
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}
