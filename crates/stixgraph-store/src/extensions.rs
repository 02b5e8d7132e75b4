//! Extension usage tracking for one graph

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use stixgraph_core::identity::{deterministic_id, random_id};
use stixgraph_core::model::{Entity, StixId, SPEC_VERSION};

pub const EXTENSION_DEFINITION_TYPE: &str = "extension-definition";
pub const IDENTITY_TYPE: &str = "identity";
/// Name of the identity credited with the extension definitions
pub const PRODUCER_NAME: &str = "stixgraph";

fn producer_fields() -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("name".into(), Value::String(PRODUCER_NAME.into()));
    fields.insert("identity_class".into(), Value::String("system".into()));
    fields
}

/// Stable identifier of the producing system
pub fn producer_id() -> StixId {
    deterministic_id(IDENTITY_TYPE, &producer_fields()).unwrap_or_else(|| random_id(IDENTITY_TYPE))
}

/// `identity` object referenced by `created_by_ref` of every definition
pub fn producer_identity(timestamp: &str) -> Value {
    let mut object = Map::new();
    object.insert("type".into(), json!(IDENTITY_TYPE));
    object.insert("spec_version".into(), json!(SPEC_VERSION));
    object.insert("id".into(), json!(producer_id().to_string()));
    object.insert("created".into(), json!(timestamp));
    object.insert("modified".into(), json!(timestamp));
    object.extend(producer_fields());
    Value::Object(object)
}

/// Property extensions the converter knows how to attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extension {
    /// Reputation tags from MalwareBazaar
    MalwareBazaar,
    /// MITRE ATT&CK technique properties
    Mitre,
}

impl Extension {
    pub fn name(&self) -> &'static str {
        match self {
            Extension::MalwareBazaar => "malware_bazaar",
            Extension::Mitre => "mitre",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Extension::MalwareBazaar => "Reputation tags reported by MalwareBazaar for a sample hash",
            Extension::Mitre => "MITRE ATT&CK properties for attack patterns",
        }
    }

    fn schema(&self) -> &'static str {
        match self {
            Extension::MalwareBazaar => "https://bazaar.abuse.ch/api/",
            Extension::Mitre => "https://github.com/mitre/cti",
        }
    }

    /// Stable identifier of the extension definition
    pub fn definition_id(&self) -> StixId {
        let mut fields = Map::new();
        fields.insert("name".into(), Value::String(self.name().into()));
        deterministic_id(EXTENSION_DEFINITION_TYPE, &fields)
            .unwrap_or_else(|| random_id(EXTENSION_DEFINITION_TYPE))
    }

    /// `extension-definition` object
    pub fn definition(&self, timestamp: &str) -> Value {
        json!({
            "type": EXTENSION_DEFINITION_TYPE,
            "spec_version": SPEC_VERSION,
            "id": self.definition_id().to_string(),
            "created_by_ref": producer_id().to_string(),
            "created": timestamp,
            "modified": timestamp,
            "name": self.name(),
            "description": self.description(),
            "schema": self.schema(),
            "version": "1.0",
            "extension_types": ["property-extension"],
        })
    }
}

/// Extensions exercised while building one graph
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    used: BTreeSet<Extension>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Extension) {
        self.used.insert(extension);
    }

    pub fn is_used(&self, extension: Extension) -> bool {
        self.used.contains(&extension)
    }

    pub fn used(&self) -> impl Iterator<Item = Extension> + '_ {
        self.used.iter().copied()
    }

    /// Attach `properties` to `entity` under `extension` and record the usage.
    ///
    /// Empty property sets attach nothing.
    pub fn attach(&mut self, entity: &mut Entity, extension: Extension, properties: Map<String, Value>) {
        let properties: Map<String, Value> = properties
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();
        if properties.is_empty() {
            return;
        }

        let mut body = Map::new();
        body.insert("extension_type".into(), Value::String("property-extension".into()));
        body.extend(properties);

        let mut extensions = entity
            .attribute("extensions")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        extensions.insert(extension.definition_id().to_string(), Value::Object(body));
        entity.set_attribute("extensions", Value::Object(extensions));

        self.register(extension);
    }

    /// Definitions of every used extension, preceded by the producer
    /// identity they are credited to. Empty when nothing was used.
    pub fn definitions(&self, timestamp: &str) -> Vec<Value> {
        if self.used.is_empty() {
            return Vec::new();
        }
        std::iter::once(producer_identity(timestamp))
            .chain(self.used.iter().map(|ext| ext.definition(timestamp)))
            .collect()
    }
}
