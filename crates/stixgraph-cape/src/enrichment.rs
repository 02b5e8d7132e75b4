//! Pre-fetched third-party context consumed by the mappers

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// ATT&CK technique fields for one technique id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechniqueFields {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kill_chain_phases: Vec<Value>,
    #[serde(default)]
    pub external_references: Vec<Value>,
    /// `x_mitre_*` properties, carried through the mitre extension
    #[serde(default)]
    pub x_mitre: Map<String, Value>,
}

/// Lookup results resolved before mapping starts.
///
/// Absent data means "no data": the mappers still emit their entities.
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub reputation_tags: Option<Vec<String>>,
    pub techniques: HashMap<String, TechniqueFields>,
}

impl Enrichment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn technique(&self, id: &str) -> Option<&TechniqueFields> {
        self.techniques.get(id)
    }
}
