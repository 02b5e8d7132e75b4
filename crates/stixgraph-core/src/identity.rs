//! Identity engine
//!
//! Content-derived identifiers are UUIDv5 values in the STIX cyber-observable
//! namespace, hashed over a canonical JSON rendering of the contributing
//! fields. Opaque identifiers are random UUIDv4 values.

use crate::model::StixId;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Namespace used by STIX 2.1 for deterministic cyber-observable identifiers
pub const STIX_NAMESPACE: Uuid = Uuid::from_u128(0x00abedb4_aa42_466c_9c01_fed23315a9b7);

/// How an entity constructor obtains its identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    /// Derived from the listed attributes; no identity when none of them is present
    ContentDerived(&'static [&'static str]),
    /// Derived from the listed attributes, random when none of them is present
    ContentOrOpaque(&'static [&'static str]),
    /// Always random
    Opaque,
}

impl IdentityMode {
    /// Resolve an identifier for `object_type` carrying `attributes`
    pub fn resolve(&self, object_type: &str, attributes: &Map<String, Value>) -> Option<StixId> {
        match self {
            IdentityMode::ContentDerived(keys) => {
                deterministic_id(object_type, &contributing_fields(keys, attributes))
            }
            IdentityMode::ContentOrOpaque(keys) => {
                deterministic_id(object_type, &contributing_fields(keys, attributes))
                    .or_else(|| Some(random_id(object_type)))
            }
            IdentityMode::Opaque => Some(random_id(object_type)),
        }
    }
}

/// Select the contributing attributes, dropping absent and null ones
pub fn contributing_fields(keys: &[&str], attributes: &Map<String, Value>) -> Map<String, Value> {
    keys.iter()
        .filter_map(|key| match attributes.get(*key) {
            Some(Value::Null) | None => None,
            Some(value) => Some((key.to_string(), value.clone())),
        })
        .collect()
}

/// Derive a deterministic identifier from canonical fields.
///
/// Returns `None` when `fields` is empty or any field is null.
pub fn deterministic_id(object_type: &str, fields: &Map<String, Value>) -> Option<StixId> {
    if fields.is_empty() || fields.values().any(Value::is_null) {
        return None;
    }

    let mut canonical = String::new();
    write_canonical(&Value::Object(fields.clone()), &mut canonical);
    let uuid = Uuid::new_v5(&STIX_NAMESPACE, canonical.as_bytes());
    Some(StixId::new(object_type, uuid))
}

/// Generate a random identifier
pub fn random_id(object_type: &str) -> StixId {
    StixId::new(object_type, Uuid::new_v4())
}

/// Canonical JSON: sorted keys, no insignificant whitespace
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_deterministic_id_is_stable() {
        let a = deterministic_id("mutex", &fields(json!({"name": "Global\\abc"}))).unwrap();
        let b = deterministic_id("mutex", &fields(json!({"name": "Global\\abc"}))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.uuid().get_version_num(), 5);
    }

    #[test]
    fn test_deterministic_id_ignores_key_order() {
        let a = deterministic_id("file", &fields(json!({"name": "a.exe", "size": 10}))).unwrap();
        let b = deterministic_id("file", &fields(json!({"size": 10, "name": "a.exe"}))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_deterministic_id_depends_on_type() {
        let a = deterministic_id("domain-name", &fields(json!({"value": "x"}))).unwrap();
        let b = deterministic_id("mutex", &fields(json!({"value": "x"}))).unwrap();
        assert_eq!(a.uuid(), b.uuid());
        assert_ne!(a, b);
    }

    #[test]
    fn test_deterministic_id_rejects_null_or_empty() {
        assert!(deterministic_id("mutex", &Map::new()).is_none());
        assert!(deterministic_id("mutex", &fields(json!({"name": null}))).is_none());
    }

    #[test]
    fn test_hashes_compact_sorted_rendering() {
        let id = deterministic_id("ipv4-addr", &fields(json!({"value": "198.51.100.3"}))).unwrap();
        assert_eq!(id.uuid(), Uuid::new_v5(&STIX_NAMESPACE, br#"{"value":"198.51.100.3"}"#));
    }

    #[test]
    fn test_random_ids_do_not_collide() {
        assert_ne!(random_id("process"), random_id("process"));
        assert_eq!(random_id("process").uuid().get_version_num(), 4);
    }

    #[test]
    fn test_identity_modes() {
        let attrs = fields(json!({"name": "a.exe", "size": 1}));
        let derived = IdentityMode::ContentDerived(&["name"]).resolve("file", &attrs).unwrap();
        assert!(derived.is_content_derived());

        let empty = Map::new();
        assert!(IdentityMode::ContentDerived(&["name"]).resolve("file", &empty).is_none());

        let fallback = IdentityMode::ContentOrOpaque(&["name"]).resolve("file", &empty).unwrap();
        assert!(!fallback.is_content_derived());

        let opaque = IdentityMode::Opaque.resolve("process", &attrs).unwrap();
        assert!(!opaque.is_content_derived());
    }

    #[test]
    fn test_canonical_json_nested() {
        let value = json!({"b": [{"d": 1, "c": 2}], "a": "x"});
        assert_eq!(canonical_json(&value), r#"{"a":"x","b":[{"c":2,"d":1}]}"#);
    }

    proptest::proptest! {
        #[test]
        fn prop_same_fields_same_id(name in "\\PC{1,40}", size in 0u64..1_000_000) {
            let a = deterministic_id("file", &fields(json!({"name": name, "size": size})));
            let b = deterministic_id("file", &fields(json!({"size": size, "name": name})));
            proptest::prop_assert!(a.is_some());
            proptest::prop_assert_eq!(a, b);
        }
    }
}
