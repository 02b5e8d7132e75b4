//! External reputation and ATT&CK technique lookups
//!
//! Every call is bounded by a timeout. Failures and timeouts degrade to
//! "no data" and never abort a conversion.

use crate::error::{ConversionError, ConversionResult};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stixgraph_cape::{CapeReport, Enrichment, TechniqueFields};
use tracing::{debug, warn};

/// Reputation tags for a sample digest
#[async_trait]
pub trait ReputationLookup: Send + Sync {
    async fn reputation_tags(&self, sha256: &str) -> ConversionResult<Option<Vec<String>>>;
}

/// ATT&CK technique fields for a technique id such as `T1055`
#[async_trait]
pub trait TechniqueLookup: Send + Sync {
    async fn technique(&self, technique_id: &str) -> ConversionResult<Option<TechniqueFields>>;
}

/// Run a lookup under `limit`; errors and expiry yield `None`
pub async fn bounded<T, F>(limit: Duration, lookup: &str, future: F) -> Option<T>
where
    F: Future<Output = ConversionResult<Option<T>>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(lookup, error = %e, "lookup failed, continuing without data");
            None
        }
        Err(_) => {
            warn!(lookup, timeout_secs = limit.as_secs(), "lookup timed out, continuing without data");
            None
        }
    }
}

/// MalwareBazaar `get_info` client
pub struct MalwareBazaarClient {
    http_client: reqwest::Client,
    endpoint: String,
}

impl MalwareBazaarClient {
    pub const DEFAULT_ENDPOINT: &'static str = "https://mb-api.abuse.ch/api/v1/";

    pub fn new(timeout: Duration) -> ConversionResult<Self> {
        Self::with_endpoint(Self::DEFAULT_ENDPOINT, timeout)
    }

    pub fn with_endpoint(endpoint: &str, timeout: Duration) -> ConversionResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stixgraph/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConversionError::Lookup(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: endpoint.to_string(),
        })
    }

    /// Extract tags from a `get_info` response body
    pub fn parse_tags(body: &Value) -> Option<Vec<String>> {
        if body["query_status"] != "ok" {
            debug!(status = %body["query_status"], "MalwareBazaar returned no record");
            return None;
        }
        let tags = body["data"][0]["tags"].as_array()?;
        Some(
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        )
    }
}

#[async_trait]
impl ReputationLookup for MalwareBazaarClient {
    async fn reputation_tags(&self, sha256: &str) -> ConversionResult<Option<Vec<String>>> {
        let form = [("query", "get_info"), ("hash", sha256)];
        let response = self
            .http_client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| ConversionError::Lookup(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ConversionError::Lookup(format!(
                "MalwareBazaar responded with {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ConversionError::Lookup(e.to_string()))?;
        Ok(Self::parse_tags(&body))
    }
}

/// Offline index over an ATT&CK enterprise STIX bundle
#[derive(Debug, Clone, Default)]
pub struct AttackCatalog {
    techniques: HashMap<String, TechniqueFields>,
}

impl AttackCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(path: &Path) -> ConversionResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let bundle: Value = serde_json::from_str(&content)?;
        let catalog = Self::from_bundle(&bundle);
        debug!(path = %path.display(), techniques = catalog.len(), "loaded ATT&CK catalog");
        Ok(catalog)
    }

    /// Index live `attack-pattern` objects by their ATT&CK external id
    pub fn from_bundle(bundle: &Value) -> Self {
        let mut techniques = HashMap::new();
        let objects = bundle["objects"].as_array().map(Vec::as_slice).unwrap_or_default();

        for object in objects {
            if object["type"] != "attack-pattern"
                || object["revoked"] == true
                || object["x_mitre_deprecated"] == true
            {
                continue;
            }
            let Some(technique_id) = Self::external_id(object) else {
                continue;
            };
            let Some(name) = object["name"].as_str() else {
                continue;
            };

            let x_mitre: Map<String, Value> = object
                .as_object()
                .map(|fields| {
                    fields
                        .iter()
                        .filter(|(key, _)| key.starts_with("x_mitre_"))
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect()
                })
                .unwrap_or_default();

            techniques.insert(
                technique_id.to_string(),
                TechniqueFields {
                    name: name.to_string(),
                    description: object["description"].as_str().map(str::to_string),
                    kill_chain_phases: object["kill_chain_phases"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default(),
                    external_references: object["external_references"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default(),
                    x_mitre,
                },
            );
        }

        Self { techniques }
    }

    fn external_id(object: &Value) -> Option<&str> {
        object["external_references"]
            .as_array()?
            .iter()
            .find(|reference| reference["source_name"] == "mitre-attack")?["external_id"]
            .as_str()
    }

    pub fn get(&self, technique_id: &str) -> Option<&TechniqueFields> {
        self.techniques.get(technique_id)
    }

    pub fn len(&self) -> usize {
        self.techniques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.techniques.is_empty()
    }
}

#[async_trait]
impl TechniqueLookup for AttackCatalog {
    async fn technique(&self, technique_id: &str) -> ConversionResult<Option<TechniqueFields>> {
        Ok(self.get(technique_id).cloned())
    }
}

/// Resolves all lookups for one report before mapping starts
#[derive(Clone)]
pub struct Enricher {
    reputation: Option<Arc<dyn ReputationLookup>>,
    techniques: Option<Arc<dyn TechniqueLookup>>,
    timeout: Duration,
}

impl Enricher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            reputation: None,
            techniques: None,
            timeout,
        }
    }

    pub fn with_reputation(mut self, lookup: Arc<dyn ReputationLookup>) -> Self {
        self.reputation = Some(lookup);
        self
    }

    pub fn with_techniques(mut self, lookup: Arc<dyn TechniqueLookup>) -> Self {
        self.techniques = Some(lookup);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.reputation.is_none() && self.techniques.is_none()
    }

    pub async fn enrich(&self, report: &CapeReport) -> Enrichment {
        let mut enrichment = Enrichment::new();

        if let (Some(lookup), Some(sha256)) = (&self.reputation, report.sample_sha256()) {
            enrichment.reputation_tags =
                bounded(self.timeout, "reputation", lookup.reputation_tags(sha256)).await;
        }

        if let Some(lookup) = &self.techniques {
            let ids = report.technique_ids();
            let results = join_all(
                ids.iter()
                    .map(|id| bounded(self.timeout, "technique", lookup.technique(id))),
            )
            .await;
            enrichment.techniques = ids
                .into_iter()
                .zip(results)
                .filter_map(|(id, fields)| fields.map(|fields| (id, fields)))
                .collect();
        }

        enrichment
    }
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("reputation", &self.reputation.is_some())
            .field("techniques", &self.techniques.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct SlowLookup;

    #[async_trait]
    impl ReputationLookup for SlowLookup {
        async fn reputation_tags(&self, _sha256: &str) -> ConversionResult<Option<Vec<String>>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(vec!["late".into()]))
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl ReputationLookup for FailingLookup {
        async fn reputation_tags(&self, _sha256: &str) -> ConversionResult<Option<Vec<String>>> {
            Err(ConversionError::Lookup("connection refused".into()))
        }
    }

    fn catalog_bundle() -> Value {
        json!({
            "type": "bundle",
            "objects": [
                {
                    "type": "attack-pattern",
                    "name": "Process Injection",
                    "description": "Adversaries may inject code.",
                    "kill_chain_phases": [{"kill_chain_name": "mitre-attack", "phase_name": "defense-evasion"}],
                    "external_references": [{"source_name": "mitre-attack", "external_id": "T1055"}],
                    "x_mitre_platforms": ["Windows"]
                },
                {
                    "type": "attack-pattern",
                    "name": "Old Technique",
                    "revoked": true,
                    "external_references": [{"source_name": "mitre-attack", "external_id": "T9999"}]
                },
                {"type": "malware", "name": "not a technique"}
            ]
        })
    }

    fn report_with_sample() -> CapeReport {
        CapeReport::from_value(json!({
            "target": {"category": "file", "file": {"sha256": "abc"}},
            "ttps": [{"ttps": ["T1055", "T1112"]}]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_tags() {
        let ok = json!({"query_status": "ok", "data": [{"tags": ["exe", "AgentTesla"]}]});
        assert_eq!(
            MalwareBazaarClient::parse_tags(&ok),
            Some(vec!["exe".to_string(), "AgentTesla".to_string()])
        );

        let missing = json!({"query_status": "hash_not_found"});
        assert_eq!(MalwareBazaarClient::parse_tags(&missing), None);

        let no_tags = json!({"query_status": "ok", "data": [{}]});
        assert_eq!(MalwareBazaarClient::parse_tags(&no_tags), None);
    }

    #[test]
    fn test_catalog_indexes_live_techniques() {
        let catalog = AttackCatalog::from_bundle(&catalog_bundle());
        assert_eq!(catalog.len(), 1);

        let injection = catalog.get("T1055").unwrap();
        assert_eq!(injection.name, "Process Injection");
        assert_eq!(injection.kill_chain_phases.len(), 1);
        assert_eq!(injection.x_mitre["x_mitre_platforms"], json!(["Windows"]));
        assert!(catalog.get("T9999").is_none());
    }

    #[tokio::test]
    async fn test_catalog_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enterprise-attack.json");
        tokio::fs::write(&path, catalog_bundle().to_string()).await.unwrap();

        let catalog = AttackCatalog::load(&path).await.unwrap();
        assert!(catalog.technique("T1055").await.unwrap().is_some());
        assert!(catalog.technique("T0000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timeout_yields_no_data() {
        let enricher = Enricher::new(Duration::from_millis(20)).with_reputation(Arc::new(SlowLookup));
        let enrichment = enricher.enrich(&report_with_sample()).await;
        assert!(enrichment.reputation_tags.is_none());
    }

    #[tokio::test]
    async fn test_failure_yields_no_data() {
        let enricher = Enricher::new(Duration::from_secs(1)).with_reputation(Arc::new(FailingLookup));
        let enrichment = enricher.enrich(&report_with_sample()).await;
        assert!(enrichment.reputation_tags.is_none());
    }

    #[tokio::test]
    async fn test_enrich_resolves_known_techniques() {
        let catalog = AttackCatalog::from_bundle(&catalog_bundle());
        let enricher = Enricher::new(Duration::from_secs(1)).with_techniques(Arc::new(catalog));

        let enrichment = enricher.enrich(&report_with_sample()).await;
        assert_eq!(enrichment.techniques.len(), 1);
        assert!(enrichment.technique("T1055").is_some());
        assert!(enrichment.technique("T1112").is_none());
    }
}
