//! Graph data models for STIX analysis graphs

use crate::error::GraphError;
use crate::identity::IdentityMode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// STIX specification version stamped on every exported object
pub const SPEC_VERSION: &str = "2.1";

/// Object type used for relationship identifiers
pub const RELATIONSHIP_TYPE: &str = "relationship";

/// Closed set of entity types produced by the converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeTag {
    Process,
    Malware,
    MalwareAnalysis,
    Software,
    File,
    Directory,
    RegistryKey,
    Mutex,
    DomainName,
    Ipv4Address,
    NetworkTraffic,
    Location,
    AttackPattern,
    Report,
}

impl TypeTag {
    pub const ALL: [TypeTag; 14] = [
        TypeTag::Process,
        TypeTag::Malware,
        TypeTag::MalwareAnalysis,
        TypeTag::Software,
        TypeTag::File,
        TypeTag::Directory,
        TypeTag::RegistryKey,
        TypeTag::Mutex,
        TypeTag::DomainName,
        TypeTag::Ipv4Address,
        TypeTag::NetworkTraffic,
        TypeTag::Location,
        TypeTag::AttackPattern,
        TypeTag::Report,
    ];

    /// STIX wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::Process => "process",
            TypeTag::Malware => "malware",
            TypeTag::MalwareAnalysis => "malware-analysis",
            TypeTag::Software => "software",
            TypeTag::File => "file",
            TypeTag::Directory => "directory",
            TypeTag::RegistryKey => "windows-registry-key",
            TypeTag::Mutex => "mutex",
            TypeTag::DomainName => "domain-name",
            TypeTag::Ipv4Address => "ipv4-addr",
            TypeTag::NetworkTraffic => "network-traffic",
            TypeTag::Location => "location",
            TypeTag::AttackPattern => "attack-pattern",
            TypeTag::Report => "report",
        }
    }

    /// Domain objects carry `created`/`modified`; observables do not
    pub fn is_domain_object(&self) -> bool {
        matches!(
            self,
            TypeTag::Malware
                | TypeTag::MalwareAnalysis
                | TypeTag::Location
                | TypeTag::AttackPattern
                | TypeTag::Report
        )
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypeTag {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TypeTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| GraphError::UnknownType(s.to_string()))
    }
}

/// `<object-type>--<uuid>` identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StixId {
    object_type: String,
    uuid: Uuid,
}

impl StixId {
    pub fn new<S: Into<String>>(object_type: S, uuid: Uuid) -> Self {
        Self {
            object_type: object_type.into(),
            uuid,
        }
    }

    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        self.object_type.parse().ok()
    }

    /// True for UUIDv5 identifiers, the only ones that recur across runs
    pub fn is_content_derived(&self) -> bool {
        self.uuid.get_version_num() == 5 && self.uuid.get_variant() == uuid::Variant::RFC4122
    }
}

impl fmt::Display for StixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}--{}", self.object_type, self.uuid)
    }
}

impl FromStr for StixId {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (object_type, uuid) = s
            .split_once("--")
            .ok_or_else(|| GraphError::ParseId(s.to_string()))?;

        let valid_type = !object_type.is_empty()
            && object_type
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_type {
            return Err(GraphError::ParseId(s.to_string()));
        }

        let uuid = Uuid::parse_str(uuid).map_err(|_| GraphError::ParseId(s.to_string()))?;
        Ok(StixId::new(object_type, uuid))
    }
}

impl Serialize for StixId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StixId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Typed node of the analysis graph
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: StixId,
    type_tag: TypeTag,
    attributes: Map<String, Value>,
}

impl Entity {
    /// Build an entity, resolving its identifier through `mode`.
    ///
    /// Null attributes are dropped. Returns `None` when no identity is possible.
    pub fn new(type_tag: TypeTag, mode: IdentityMode, attributes: Map<String, Value>) -> Option<Self> {
        let attributes: Map<String, Value> = attributes
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();
        let id = mode.resolve(type_tag.as_str(), &attributes)?;

        Some(Self {
            id,
            type_tag,
            attributes,
        })
    }

    pub fn id(&self) -> &StixId {
        &self.id
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Set a non-contributing attribute; the identifier is not recomputed
    pub fn set_attribute<K: Into<String>>(&mut self, key: K, value: Value) {
        if value.is_null() {
            return;
        }
        self.attributes.insert(key.into(), value);
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// Embedded single-object references (`*_ref` attributes)
    pub fn references(&self) -> impl Iterator<Item = (&str, StixId)> + '_ {
        self.attributes
            .iter()
            .filter(|(key, _)| key.ends_with("_ref"))
            .filter_map(|(key, value)| {
                let target = value.as_str()?.parse().ok()?;
                Some((key.as_str(), target))
            })
    }

    /// STIX JSON rendering; domain objects are stamped with `timestamp`
    pub fn to_stix(&self, timestamp: &str) -> Value {
        let mut object = Map::new();
        object.insert("type".into(), Value::String(self.type_tag.as_str().into()));
        object.insert("spec_version".into(), Value::String(SPEC_VERSION.into()));
        object.insert("id".into(), Value::String(self.id.to_string()));
        if self.type_tag.is_domain_object() {
            object.insert("created".into(), Value::String(timestamp.into()));
            object.insert("modified".into(), Value::String(timestamp.into()));
        }
        for (key, value) in &self.attributes {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }
}

/// Typed directed edge of the analysis graph
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relationship {
    pub id: StixId,
    pub source_ref: StixId,
    pub target_ref: StixId,
    pub relationship_type: String,
    pub force_deterministic: bool,
}

impl Relationship {
    pub fn to_stix(&self, timestamp: &str) -> Value {
        serde_json::json!({
            "type": RELATIONSHIP_TYPE,
            "spec_version": SPEC_VERSION,
            "id": self.id.to_string(),
            "created": timestamp,
            "modified": timestamp,
            "relationship_type": self.relationship_type,
            "source_ref": self.source_ref.to_string(),
            "target_ref": self.target_ref.to_string(),
        })
    }

    /// True when either endpoint is `id`
    pub fn touches(&self, id: &StixId) -> bool {
        &self.source_ref == id || &self.target_ref == id
    }
}

/// Anything the object store can hold
#[derive(Debug, Clone, PartialEq)]
pub enum StixObject {
    Entity(Entity),
    Relationship(Relationship),
}

impl StixObject {
    pub fn id(&self) -> &StixId {
        match self {
            StixObject::Entity(entity) => entity.id(),
            StixObject::Relationship(rel) => &rel.id,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            StixObject::Entity(entity) => Some(entity),
            StixObject::Relationship(_) => None,
        }
    }

    pub fn as_entity_mut(&mut self) -> Option<&mut Entity> {
        match self {
            StixObject::Entity(entity) => Some(entity),
            StixObject::Relationship(_) => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&Relationship> {
        match self {
            StixObject::Relationship(rel) => Some(rel),
            StixObject::Entity(_) => None,
        }
    }

    pub fn to_stix(&self, timestamp: &str) -> Value {
        match self {
            StixObject::Entity(entity) => entity.to_stix(timestamp),
            StixObject::Relationship(rel) => rel.to_stix(timestamp),
        }
    }
}

impl From<Entity> for StixObject {
    fn from(entity: Entity) -> Self {
        StixObject::Entity(entity)
    }
}

impl From<Relationship> for StixObject {
    fn from(rel: Relationship) -> Self {
        StixObject::Relationship(rel)
    }
}

/// Build an attribute map from `(key, value)` pairs
pub fn attributes<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
