//! Benign baseline filtering
//!
//! A reference table of content-derived identifiers seen in graphs built
//! from known-clean sandbox runs. Anything in a new graph that matches is
//! incidental to the sandbox and gets removed, together with every edge
//! touching it.

use crate::bundle::Bundle;
use crate::error::{StoreError, StoreResult};
use crate::store::ObjectStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use stixgraph_core::model::StixId;
use tracing::{debug, info};

/// Software names describing the sandbox platform itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineSoftware {
    patterns: Vec<String>,
}

impl BaselineSoftware {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// A name matches when it contains any pattern
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| name.contains(pattern.as_str()))
    }

    fn is_baseline_object(&self, object: &Value) -> bool {
        object.get("type").and_then(Value::as_str) == Some("software")
            && object
                .get("name")
                .and_then(Value::as_str)
                .map(|name| self.matches(name))
                .unwrap_or(false)
    }
}

impl Default for BaselineSoftware {
    fn default() -> Self {
        Self::new(["KVM", "win10", "ubuntu22"])
    }
}

/// Known-benign identifiers by object type
#[derive(Debug, Clone, Default)]
pub struct BenignTable {
    by_type: HashMap<String, HashSet<StixId>>,
}

impl BenignTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index an identifier. Opaque identifiers never recur and are refused.
    pub fn insert(&mut self, id: StixId) -> bool {
        if !id.is_content_derived() {
            return false;
        }
        self.by_type
            .entry(id.object_type().to_string())
            .or_default()
            .insert(id)
    }

    pub fn contains(&self, id: &StixId) -> bool {
        self.by_type
            .get(id.object_type())
            .map(|ids| ids.contains(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_counts(&self) -> BTreeMap<String, usize> {
        self.by_type
            .iter()
            .map(|(object_type, ids)| (object_type.clone(), ids.len()))
            .collect()
    }

    /// Index every eligible object of a baseline bundle
    pub fn index_bundle(&mut self, bundle: &Bundle, baseline: &BaselineSoftware) -> usize {
        bundle
            .objects
            .iter()
            .filter(|object| !baseline.is_baseline_object(object))
            .filter_map(|object| object.get("id").and_then(Value::as_str))
            .filter_map(|raw| raw.parse::<StixId>().ok())
            .filter(|id| self.insert(id.clone()))
            .count()
    }

    /// Build the table from every `*.json` bundle in `dir`.
    ///
    /// Any unreadable or unparsable bundle fails the whole load.
    pub async fn load_dir(dir: &Path, baseline: &BaselineSoftware) -> StoreResult<Self> {
        let mut table = Self::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| StoreError::Corpus {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let bundle = Bundle::read_from(&path).await.map_err(|e| StoreError::Corpus {
                path: path.clone(),
                message: e.to_string(),
            })?;
            let added = table.index_bundle(&bundle, baseline);
            debug!(path = %path.display(), added, "indexed benign bundle");
        }

        info!(identifiers = table.len(), "benign table loaded");
        Ok(table)
    }
}

/// Counts removed by one filtering run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOutcome {
    pub entities_removed: usize,
    pub relationships_removed: usize,
    /// Embedded `*_ref` attributes dropped because their target was removed
    pub references_cleared: usize,
}

/// Remove benign entities, then every relationship touching a benign or
/// missing endpoint, then embedded references to removed entities.
/// Each pass decides from a snapshot and removes in one batch.
pub fn filter_benign(store: &mut ObjectStore, table: &BenignTable) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();

    let benign: Vec<StixId> = store
        .entities()
        .filter(|entity| table.contains(entity.id()))
        .map(|entity| entity.id().clone())
        .collect();
    outcome.entities_removed = store.remove_all(&benign);

    let stale: Vec<StixId> = store
        .relationships()
        .filter(|rel| {
            table.contains(&rel.source_ref)
                || table.contains(&rel.target_ref)
                || !store.contains(&rel.source_ref)
                || !store.contains(&rel.target_ref)
        })
        .map(|rel| rel.id.clone())
        .collect();
    outcome.relationships_removed = store.remove_all(&stale);

    let dangling: Vec<(StixId, String)> = store
        .entities()
        .flat_map(|entity| {
            entity
                .references()
                .filter(|(_, target)| !store.contains(target))
                .map(|(key, _)| (entity.id().clone(), key.to_string()))
                .collect::<Vec<_>>()
        })
        .collect();
    for (id, key) in &dangling {
        if let Some(entity) = store.entity_mut(id) {
            debug!(id = %id, key = %key, "clearing reference to filtered object");
            entity.remove_attribute(key);
            outcome.references_cleared += 1;
        }
    }

    debug!(
        entities = outcome.entities_removed,
        relationships = outcome.relationships_removed,
        references = outcome.references_cleared,
        "benign filter applied"
    );
    outcome
}
