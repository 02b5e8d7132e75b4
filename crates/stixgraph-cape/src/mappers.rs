//! Section mappers: one function per report section
//!
//! Each mapper returns a [`Mapped`] value. `peripheral` entities are the
//! ones the driver links to the malware hub; `objects` are everything else
//! the section produced (internal edges, non-linked tree nodes).

use crate::enrichment::{Enrichment, TechniqueFields};
use crate::error::{MappingError, MappingResult};
use crate::network::{self, Protocol};
use crate::paths::{self, FILE_ID_FIELDS};
use crate::report::CapeReport;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use stixgraph_core::identity::IdentityMode;
use stixgraph_core::model::{attributes, Entity, Relationship, StixId, StixObject, TypeTag};
use stixgraph_core::time::normalize_timestamp;
use stixgraph_store::{Extension, ExtensionRegistry};

pub const SOFTWARE_ID_FIELDS: &[&str] = &["name", "cpe", "swid", "languages", "vendor", "version"];
pub const REGISTRY_KEY_ID_FIELDS: &[&str] = &["key", "values", "extensions"];
pub const MUTEX_ID_FIELDS: &[&str] = &["name"];

const ANALYSIS_PRODUCT: &str = "cape";
const ANALYSIS_RESULT: &str = "malware";
const ATTACK_SOURCE: &str = "mitre-attack";

/// Output of one section mapper
#[derive(Debug, Clone, Default)]
pub struct Mapped {
    pub peripheral: Vec<Entity>,
    pub objects: Vec<StixObject>,
    linked: HashSet<StixId>,
}

impl Mapped {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entity for a hub edge; repeated ids are linked once
    pub fn link(&mut self, entity: Entity) {
        if self.linked.insert(entity.id().clone()) {
            self.peripheral.push(entity);
        }
    }

    /// Queue an object that is stored but not linked to the hub
    pub fn include<T: Into<StixObject>>(&mut self, object: T) {
        self.objects.push(object.into());
    }

    pub fn merge(&mut self, other: Mapped) {
        for entity in other.peripheral {
            self.link(entity);
        }
        self.objects.extend(other.objects);
    }

    pub fn is_empty(&self) -> bool {
        self.peripheral.is_empty() && self.objects.is_empty()
    }
}

/// Shared state handed to every mapper for one document
pub struct MapContext<'a> {
    pub report: &'a CapeReport,
    pub enrichment: &'a Enrichment,
    pub extensions: &'a mut ExtensionRegistry,
    pub allow_custom: bool,
}

impl<'a> MapContext<'a> {
    pub fn new(
        report: &'a CapeReport,
        enrichment: &'a Enrichment,
        extensions: &'a mut ExtensionRegistry,
        allow_custom: bool,
    ) -> Self {
        Self {
            report,
            enrichment,
            extensions,
            allow_custom,
        }
    }

    /// Attach extension properties unless custom content is disallowed
    fn attach(&mut self, entity: &mut Entity, extension: Extension, properties: Map<String, Value>) {
        if self.allow_custom {
            self.extensions.attach(entity, extension, properties);
        }
    }
}

fn timestamp(raw: Option<&str>) -> Value {
    raw.and_then(normalize_timestamp)
        .map(Value::String)
        .unwrap_or(Value::Null)
}

fn software_entity(name: Option<&str>) -> Option<Entity> {
    let name = name.filter(|n| !n.is_empty())?;
    Entity::new(
        TypeTag::Software,
        IdentityMode::ContentDerived(SOFTWARE_ID_FIELDS),
        attributes([("name", json!(name))]),
    )
}

/// The malware hub every other section links to
pub fn map_malware(ctx: &mut MapContext<'_>) -> MappingResult<Entity> {
    let name = ctx
        .report
        .hub_name()
        .ok_or(MappingError::MissingField("info.ended"))?;

    let mut malware = Entity::new(
        TypeTag::Malware,
        IdentityMode::Opaque,
        attributes([("name", json!(name)), ("is_family", json!(false))]),
    )
    .ok_or(MappingError::MissingField("info.ended"))?;

    let enrichment = ctx.enrichment;
    if let Some(tags) = &enrichment.reputation_tags {
        let properties = attributes([("x_malware_bazaar_tags", json!(tags))]);
        ctx.attach(&mut malware, Extension::MalwareBazaar, properties);
    }

    Ok(malware)
}

/// Analysis run plus guest OS and hypervisor software
pub fn map_malware_analysis(ctx: &mut MapContext<'_>) -> Mapped {
    let info = &ctx.report.info;
    let machine = ctx.report.machine().cloned().unwrap_or_default();
    let os = software_entity(machine.name.as_deref());
    let hypervisor = software_entity(machine.manager.as_deref());

    let mut mapped = Mapped::new();
    let analysis = Entity::new(
        TypeTag::MalwareAnalysis,
        IdentityMode::Opaque,
        attributes([
            ("product", json!(ANALYSIS_PRODUCT)),
            ("version", json!(info.version)),
            ("modules", info.package.as_ref().map_or(Value::Null, |p| json!([p]))),
            ("submitted", timestamp(info.started.as_deref())),
            ("analysis_started", timestamp(machine.started_on.as_deref())),
            ("analysis_ended", timestamp(machine.shutdown_on.as_deref())),
            ("result", json!(ANALYSIS_RESULT)),
            ("operating_system_ref", os.as_ref().map_or(Value::Null, |e| json!(e.id().to_string()))),
            ("host_vm_ref", hypervisor.as_ref().map_or(Value::Null, |e| json!(e.id().to_string()))),
        ]),
    );

    if let (Some(os), Some(hypervisor)) = (&os, &hypervisor) {
        mapped.include(Relationship::link(os, hypervisor, "related-to"));
    }
    if let Some(analysis) = analysis {
        if let Some(os) = &os {
            mapped.include(Relationship::link(&analysis, os, "dynamic-analysis-of"));
        }
        mapped.link(analysis);
    }
    for software in [os, hypervisor].into_iter().flatten() {
        mapped.include(software);
    }

    mapped
}

/// The submitted sample as a file
pub fn map_malware_file(ctx: &mut MapContext<'_>) -> Mapped {
    let mut mapped = Mapped::new();
    let Some(file) = ctx.report.target_file() else {
        return mapped;
    };

    let hashes = file.hashes();
    let entity = Entity::new(
        TypeTag::File,
        IdentityMode::ContentOrOpaque(FILE_ID_FIELDS),
        attributes([
            ("name", json!(file.name)),
            ("size", json!(file.size)),
            ("hashes", if hashes.is_empty() { Value::Null } else { Value::Object(hashes) }),
        ]),
    );
    if let Some(entity) = entity {
        mapped.link(entity);
    }
    mapped
}

/// Process tree; `parent_ref` points at parents seen in the same report
pub fn map_processes(ctx: &mut MapContext<'_>) -> Mapped {
    let processes = ctx.report.processes();
    let mut by_pid: HashMap<u64, StixId> = HashMap::new();
    let mut entities = Vec::with_capacity(processes.len());

    for process in processes {
        let entity = Entity::new(
            TypeTag::Process,
            IdentityMode::Opaque,
            attributes([
                ("pid", json!(process.process_id)),
                ("command_line", json!(process.command_line())),
                (
                    "environment_variables",
                    if process.environ.is_empty() {
                        Value::Null
                    } else {
                        Value::Object(process.environ.clone())
                    },
                ),
            ]),
        );
        if let Some(entity) = entity {
            if let Some(pid) = process.process_id {
                by_pid.entry(pid).or_insert_with(|| entity.id().clone());
            }
            entities.push((process.parent_id, entity));
        }
    }

    let mut mapped = Mapped::new();
    for (parent_id, mut entity) in entities {
        if let Some(parent) = parent_id.and_then(|pid| by_pid.get(&pid)) {
            if parent != entity.id() {
                entity.set_attribute("parent_ref", json!(parent.to_string()));
            }
        }
        mapped.link(entity);
    }
    mapped
}

/// Directory/file tree over a list of paths
pub fn map_files(paths: &[String], link_all: bool) -> Mapped {
    paths::build_tree(paths).into_mapped(link_all)
}

pub fn map_registry_keys(keys: &[String]) -> Mapped {
    let mut mapped = Mapped::new();
    for key in keys.iter().filter(|k| !k.is_empty()) {
        let entity = Entity::new(
            TypeTag::RegistryKey,
            IdentityMode::ContentDerived(REGISTRY_KEY_ID_FIELDS),
            attributes([("key", json!(key))]),
        );
        if let Some(entity) = entity {
            mapped.link(entity);
        }
    }
    mapped
}

pub fn map_mutexes(ctx: &mut MapContext<'_>) -> Mapped {
    let mut mapped = Mapped::new();
    for name in ctx.report.summary().mutexes.iter().filter(|n| !n.is_empty()) {
        let entity = Entity::new(
            TypeTag::Mutex,
            IdentityMode::ContentDerived(MUTEX_ID_FIELDS),
            attributes([("name", json!(name))]),
        );
        if let Some(entity) = entity {
            mapped.link(entity);
        }
    }
    mapped
}

pub fn map_domains(ctx: &mut MapContext<'_>) -> Mapped {
    let mut mapped = Mapped::new();
    for domain in ctx.report.domains() {
        if let Some(entity) = network::domain_entity(domain) {
            mapped.link(entity);
        }
    }
    mapped
}

fn attack_url(technique_id: &str) -> String {
    format!(
        "https://attack.mitre.org/techniques/{}/",
        technique_id.replace('.', "/")
    )
}

fn attack_pattern(technique_id: &str, fields: Option<&TechniqueFields>) -> Option<Entity> {
    let external_references = match fields {
        Some(fields) if !fields.external_references.is_empty() => {
            json!(fields.external_references)
        }
        _ => json!([{
            "source_name": ATTACK_SOURCE,
            "external_id": technique_id,
            "url": attack_url(technique_id),
        }]),
    };

    Entity::new(
        TypeTag::AttackPattern,
        IdentityMode::Opaque,
        attributes([
            ("name", json!(fields.map_or(technique_id, |f| f.name.as_str()))),
            ("description", json!(fields.and_then(|f| f.description.as_ref()))),
            (
                "kill_chain_phases",
                match fields {
                    Some(f) if !f.kill_chain_phases.is_empty() => json!(f.kill_chain_phases),
                    _ => Value::Null,
                },
            ),
            ("external_references", external_references),
        ]),
    )
}

/// One attack pattern per distinct technique id
pub fn map_ttps(ctx: &mut MapContext<'_>) -> Mapped {
    let enrichment = ctx.enrichment;
    let mut mapped = Mapped::new();
    for technique_id in ctx.report.technique_ids() {
        let fields = enrichment.technique(&technique_id);
        if fields.is_none() {
            tracing::debug!(technique = %technique_id, "no ATT&CK data for technique");
        }
        let Some(mut entity) = attack_pattern(&technique_id, fields) else {
            continue;
        };
        if let Some(fields) = fields {
            ctx.attach(&mut entity, Extension::Mitre, fields.x_mitre.clone());
        }
        mapped.link(entity);
    }
    mapped
}

/// TCP and UDP flows plus aggregated hosts
pub fn map_network(ctx: &mut MapContext<'_>) -> Mapped {
    let mut mapped = network::map_traffic(ctx.report.tcp(), Protocol::Tcp);
    mapped.merge(network::map_traffic(ctx.report.udp(), Protocol::Udp));
    mapped.merge(network::map_hosts(ctx.report.hosts()));
    mapped
}
