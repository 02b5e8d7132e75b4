//! STIX bundle export

use crate::error::StoreResult;
use crate::extensions::ExtensionRegistry;
use crate::store::ObjectStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use stixgraph_core::identity::random_id;
use stixgraph_core::model::StixId;
use stixgraph_core::time::format_timestamp;
use tracing::debug;

pub const BUNDLE_TYPE: &str = "bundle";

/// Serialized form of one analysis graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "type")]
    pub bundle_type: String,
    pub id: StixId,
    #[serde(default)]
    pub objects: Vec<Value>,
}

impl Bundle {
    /// Export every stored object in insertion order, followed by the
    /// definitions of the extensions used while building the graph
    pub fn export(store: &ObjectStore, extensions: &ExtensionRegistry) -> Self {
        let timestamp = format_timestamp(&store.created_at());
        let mut objects: Vec<Value> = store.iter().map(|obj| obj.to_stix(&timestamp)).collect();
        objects.extend(extensions.definitions(&timestamp));

        Self {
            bundle_type: BUNDLE_TYPE.to_string(),
            id: random_id(BUNDLE_TYPE),
            objects,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects of one STIX type
    pub fn objects_of_type<'a>(&'a self, object_type: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.objects
            .iter()
            .filter(move |obj| obj.get("type").and_then(Value::as_str) == Some(object_type))
    }

    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Write the bundle, creating parent directories as needed.
    ///
    /// Content goes to a hidden sibling first and is renamed into place, so
    /// `path` never holds a partial bundle.
    pub async fn write_to(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = self.to_json()?;
        let staging = Self::staging_path(path);

        let written = match tokio::fs::write(&staging, content).await {
            Ok(()) => tokio::fs::rename(&staging, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                debug!(path = %staging.display(), error = %cleanup, "no staging file to clean up");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// `dir/.name.partial` next to `path`
    pub fn staging_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| BUNDLE_TYPE.to_string());
        path.with_file_name(format!(".{}.partial", name))
    }

    pub async fn read_from(path: &Path) -> StoreResult<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }
}
