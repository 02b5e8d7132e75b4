//! Per-document conversion pipeline

use crate::config::ConverterConfig;
use crate::error::ConversionResult;
use crate::lookup::{AttackCatalog, Enricher, MalwareBazaarClient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use stixgraph_cape::{
    map_domains, map_files, map_malware, map_malware_analysis, map_malware_file, map_mutexes,
    map_network, map_processes, map_registry_keys, map_ttps, CapeReport, Enrichment, MapContext,
    Mapped,
};
use stixgraph_core::identity::IdentityMode;
use stixgraph_core::model::{attributes, Entity, TypeTag};
use stixgraph_core::relationship::{synthesize, Direction};
use stixgraph_core::time::{format_timestamp, normalize_timestamp};
use stixgraph_store::{
    filter_benign, BaselineSoftware, BenignTable, Bundle, ExtensionRegistry, ObjectStore,
};
use tracing::{debug, info, warn};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Loaded,
    MalwareIdentified,
    AnalysisMapped,
    Processes,
    MalwareFile,
    Files,
    Registry,
    Mutexes,
    Ttps,
    Domains,
    NetworkTraffic,
    BenignFiltered,
    Reported,
    Exported,
}

/// One executed stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Store size change caused by the stage (negative when filtering)
    pub objects_delta: i64,
}

/// Conversion statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionStats {
    pub entities: usize,
    pub relationships: usize,
    pub benign_entities_removed: usize,
    pub benign_relationships_removed: usize,
    pub execution_time_ms: u64,
}

/// Result of converting one document
#[derive(Debug, Clone)]
pub struct Conversion {
    pub bundle: Bundle,
    pub stats: ConversionStats,
    pub history: Vec<StageRecord>,
}

impl Conversion {
    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.history.iter().map(|record| record.stage)
    }
}

/// Graph under construction for one document
struct GraphBuilder {
    store: ObjectStore,
    history: Vec<StageRecord>,
}

impl GraphBuilder {
    fn new() -> Self {
        Self {
            store: ObjectStore::new(),
            history: Vec::new(),
        }
    }

    fn record(&mut self, stage: Stage, started_at: DateTime<Utc>, size_before: usize) {
        let objects_delta = self.store.len() as i64 - size_before as i64;
        debug!(?stage, objects_delta, "stage complete");
        self.history.push(StageRecord {
            stage,
            started_at,
            completed_at: Utc::now(),
            objects_delta,
        });
    }

    /// Store a mapper's output and link its peripheral entities to `hub`
    fn absorb(&mut self, hub: &Entity, mapped: Mapped, relationship_type: &str) {
        let edges = synthesize(hub, &mapped.peripheral, relationship_type, Direction::Forward);
        self.store.add_all(mapped.peripheral);
        self.store.add_all(mapped.objects);
        self.store.add_all(edges);
    }

    /// Run one mapping stage: absorb every section, then record it
    fn stage(&mut self, stage: Stage, hub: &Entity, sections: Vec<(Mapped, &'static str)>) {
        let started_at = Utc::now();
        let size_before = self.store.len();
        for (mapped, relationship_type) in sections {
            self.absorb(hub, mapped, relationship_type);
        }
        self.record(stage, started_at, size_before);
    }
}

/// Converts CAPE reports into STIX bundles
#[derive(Debug, Clone)]
pub struct Converter {
    config: ConverterConfig,
    benign: Option<Arc<BenignTable>>,
    enricher: Enricher,
}

impl Converter {
    pub fn new(config: ConverterConfig) -> Self {
        let timeout = config.lookup_timeout();
        Self {
            config,
            benign: None,
            enricher: Enricher::new(timeout),
        }
    }

    /// Build a converter with the lookups and benign table `config` asks for.
    ///
    /// Lookup sources and the benign corpus are best-effort: when they
    /// cannot be loaded the converter runs without them.
    pub async fn from_config(config: ConverterConfig) -> ConversionResult<Self> {
        config.validate()?;
        let mut converter = Self::new(config);
        let timeout = converter.config.lookup_timeout();

        if converter.config.fetch_reputation_tags {
            let client = MalwareBazaarClient::new(timeout)?;
            converter.enricher = converter.enricher.with_reputation(Arc::new(client));
        }

        if let Some(path) = converter.config.attack_catalog.clone() {
            match AttackCatalog::load(&path).await {
                Ok(catalog) => {
                    converter.enricher = converter.enricher.with_techniques(Arc::new(catalog));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ATT&CK catalog unavailable, techniques will carry ids only");
                }
            }
        }

        if let Some(dir) = converter.config.benign_dir.clone() {
            let baseline = BaselineSoftware::new(converter.config.baseline_software.clone());
            match BenignTable::load_dir(&dir, &baseline).await {
                Ok(table) => {
                    info!(dir = %dir.display(), entries = table.len(), "loaded benign table");
                    converter.benign = Some(Arc::new(table));
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "benign corpus failed to load, filtering disabled");
                }
            }
        }

        Ok(converter)
    }

    pub fn with_benign(mut self, table: Arc<BenignTable>) -> Self {
        self.benign = Some(table);
        self
    }

    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn has_benign_table(&self) -> bool {
        self.benign.is_some()
    }

    /// Map a validated report into a bundle. No I/O happens here.
    pub fn convert_report(
        &self,
        report: &CapeReport,
        enrichment: &Enrichment,
    ) -> ConversionResult<Conversion> {
        let start_time = std::time::Instant::now();
        report.validate()?;

        let mut graph = GraphBuilder::new();
        let mut extensions = ExtensionRegistry::new();
        graph.record(Stage::Loaded, Utc::now(), 0);

        let mut ctx = MapContext::new(report, enrichment, &mut extensions, self.config.allow_custom);

        // Every other section links to the hub, so it is identified first
        let started_at = Utc::now();
        let hub = map_malware(&mut ctx)?;
        graph.store.add(hub.clone());
        graph.record(Stage::MalwareIdentified, started_at, 0);

        graph.stage(
            Stage::AnalysisMapped,
            &hub,
            vec![(map_malware_analysis(&mut ctx), "dynamic-analysis-of")],
        );
        graph.stage(Stage::Processes, &hub, vec![(map_processes(&mut ctx), "creates")]);

        let summary = report.summary();
        if self.config.small {
            debug!("small mode, skipping file and registry sections");
        } else {
            graph.stage(
                Stage::MalwareFile,
                &hub,
                vec![(map_malware_file(&mut ctx), "related-to")],
            );
            graph.stage(
                Stage::Files,
                &hub,
                vec![
                    (map_files(&summary.read_files, true), "reads"),
                    (map_files(&summary.write_files, true), "modifies"),
                    (map_files(&summary.delete_files, true), "deletes"),
                ],
            );
            graph.stage(
                Stage::Registry,
                &hub,
                vec![
                    (map_registry_keys(&summary.read_keys), "reads"),
                    (map_registry_keys(&summary.write_keys), "modifies"),
                    (map_registry_keys(&summary.delete_keys), "deletes"),
                ],
            );
        }

        graph.stage(Stage::Mutexes, &hub, vec![(map_mutexes(&mut ctx), "creates")]);
        graph.stage(Stage::Ttps, &hub, vec![(map_ttps(&mut ctx), "uses")]);
        graph.stage(Stage::Domains, &hub, vec![(map_domains(&mut ctx), "uses")]);
        graph.stage(Stage::NetworkTraffic, &hub, vec![(map_network(&mut ctx), "uses")]);

        let mut stats = ConversionStats::default();
        if let Some(table) = &self.benign {
            let started_at = Utc::now();
            let size_before = graph.store.len();
            let outcome = filter_benign(&mut graph.store, table);
            stats.benign_entities_removed = outcome.entities_removed;
            stats.benign_relationships_removed = outcome.relationships_removed;
            graph.record(Stage::BenignFiltered, started_at, size_before);
        }

        if self.config.report_wrapper {
            let started_at = Utc::now();
            let size_before = graph.store.len();
            if let Some(wrapper) = report_wrapper(report, &hub, &graph.store) {
                graph.store.add(wrapper);
            }
            graph.record(Stage::Reported, started_at, size_before);
        }

        let started_at = Utc::now();
        let bundle = Bundle::export(&graph.store, &extensions);
        let statistics = graph.store.statistics();
        stats.entities = statistics.entities;
        stats.relationships = statistics.relationships;
        stats.execution_time_ms = start_time.elapsed().as_millis() as u64;
        let size = graph.store.len();
        graph.record(Stage::Exported, started_at, size);

        Ok(Conversion {
            bundle,
            stats,
            history: graph.history,
        })
    }

    /// Validate, enrich and map one in-memory document
    pub async fn convert_value(&self, value: Value) -> ConversionResult<Conversion> {
        let report = CapeReport::from_value(value)?;
        self.convert_parsed(report).await
    }

    /// Read, enrich and map one document from disk
    pub async fn convert_file(&self, input: &Path) -> ConversionResult<Conversion> {
        let content = tokio::fs::read_to_string(input).await?;
        let report = CapeReport::from_json(&content)?;
        self.convert_parsed(report).await
    }

    /// Convert `input`, writing the bundle to `output` when given
    pub async fn convert_path(
        &self,
        input: &Path,
        output: Option<&Path>,
    ) -> ConversionResult<Conversion> {
        let conversion = self.convert_file(input).await?;
        if let Some(output) = output {
            conversion.bundle.write_to(output).await?;
            info!(
                document = %input.display(),
                output = %output.display(),
                objects = conversion.bundle.len(),
                "wrote bundle"
            );
        }
        Ok(conversion)
    }

    async fn convert_parsed(&self, report: CapeReport) -> ConversionResult<Conversion> {
        let enrichment = if self.enricher.is_noop() {
            Enrichment::new()
        } else {
            self.enricher.enrich(&report).await
        };
        self.convert_report(&report, &enrichment)
    }
}

/// `report` object referencing every entity, or `None` for an empty graph
fn report_wrapper(report: &CapeReport, hub: &Entity, store: &ObjectStore) -> Option<Entity> {
    let object_refs: Vec<Value> = store
        .entities()
        .map(|entity| json!(entity.id().to_string()))
        .collect();
    if object_refs.is_empty() {
        warn!("no entities left, not generating report");
        return None;
    }

    let published = [report.info.ended.as_deref(), report.info.started.as_deref()]
        .into_iter()
        .flatten()
        .find_map(normalize_timestamp)
        .unwrap_or_else(|| format_timestamp(&store.created_at()));

    let name = hub
        .attribute("name")
        .and_then(Value::as_str)
        .map(|name| format!("CAPE analysis of {}", name))
        .unwrap_or_else(|| "CAPE analysis".to_string());

    Entity::new(
        TypeTag::Report,
        IdentityMode::Opaque,
        attributes([
            ("name", json!(name)),
            ("published", json!(published)),
            ("report_types", json!(["malware"])),
            ("object_refs", Value::Array(object_refs)),
        ]),
    )
}
