//! Typed view of a CAPE sandbox report
//!
//! Only the sections the mappers read are modelled; every other key is
//! ignored. Sections that are absent or `null` deserialize to empty defaults.

use crate::error::{MappingError, MappingResult};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Treat an explicit `null` the same as a missing key
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapeReport {
    #[serde(default, deserialize_with = "null_as_default")]
    pub info: Info,
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub behavior: Behavior,
    #[serde(default, deserialize_with = "null_as_default")]
    pub network: Network,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ttps: Vec<TtpEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub ended: Option<String>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub machine: Option<Machine>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parent_sample: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Machine {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub manager: Option<String>,
    #[serde(default)]
    pub started_on: Option<String>,
    #[serde(default)]
    pub shutdown_on: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub file: Option<TargetFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub sha3_384: Option<String>,
    #[serde(default)]
    pub ssdeep: Option<String>,
    #[serde(default)]
    pub tlsh: Option<String>,
}

impl TargetFile {
    /// Hash map keyed by STIX hash algorithm names.
    ///
    /// Missing values are dropped and the TLSH version prefix `T1` is removed.
    pub fn hashes(&self) -> Map<String, Value> {
        let tlsh = self
            .tlsh
            .as_deref()
            .map(|value| value.strip_prefix("T1").unwrap_or(value));

        [
            ("MD5", self.md5.as_deref()),
            ("SHA-1", self.sha1.as_deref()),
            ("SHA-256", self.sha256.as_deref()),
            ("SHA3-384", self.sha3_384.as_deref()),
            ("SSDEEP", self.ssdeep.as_deref()),
            ("TLSH", tlsh),
        ]
        .into_iter()
        .filter_map(|(algorithm, value)| match value {
            Some(value) if !value.is_empty() => {
                Some((algorithm.to_string(), Value::String(value.to_string())))
            }
            _ => None,
        })
        .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Behavior {
    #[serde(default, deserialize_with = "null_as_default")]
    pub processes: Vec<Process>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: BehaviorSummary,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub process_id: Option<u64>,
    #[serde(default)]
    pub parent_id: Option<u64>,
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub environ: Map<String, Value>,
}

impl Process {
    pub fn command_line(&self) -> Option<&str> {
        self.environ.get("CommandLine").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BehaviorSummary {
    #[serde(default, deserialize_with = "null_as_default")]
    pub read_files: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub write_files: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub delete_files: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub read_keys: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub write_keys: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub delete_keys: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub mutexes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Network {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tcp: Vec<Connection>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub udp: Vec<Connection>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hosts: Vec<Host>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub domains: Vec<DomainRecord>,
}

/// One TCP or UDP flow
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub sport: Option<u16>,
    #[serde(default)]
    pub dport: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Host {
    #[serde(default, deserialize_with = "null_as_default")]
    pub ip: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub country_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hostname: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainRecord {
    #[serde(default)]
    pub domain: Option<String>,
}

/// Signature hit carrying ATT&CK technique ids.
///
/// Newer CAPE builds emit `ttps: [..]`, older ones a single `ttp`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TtpEntry {
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ttps: Vec<String>,
    #[serde(default)]
    pub ttp: Option<String>,
}

impl CapeReport {
    pub fn from_json(json: &str) -> MappingResult<Self> {
        let report: Self = serde_json::from_str(json)
            .map_err(|e| MappingError::InvalidReport(e.to_string()))?;
        report.validate()?;
        Ok(report)
    }

    pub fn from_value(value: Value) -> MappingResult<Self> {
        if !value.is_object() {
            return Err(MappingError::InvalidReport(
                "top-level value is not an object".into(),
            ));
        }
        let report: Self = serde_json::from_value(value)
            .map_err(|e| MappingError::InvalidReport(e.to_string()))?;
        report.validate()?;
        Ok(report)
    }

    /// A report must at least describe its target
    pub fn validate(&self) -> MappingResult<()> {
        let target = self.target.as_ref().ok_or(MappingError::MissingField("target"))?;
        if target.category.is_none() {
            return Err(MappingError::MissingField("target.category"));
        }
        Ok(())
    }

    pub fn category(&self) -> Option<&str> {
        self.target.as_ref()?.category.as_deref()
    }

    /// The analysed file, when the target is a file
    pub fn target_file(&self) -> Option<&TargetFile> {
        let target = self.target.as_ref()?;
        if target.category.as_deref() != Some("file") {
            return None;
        }
        target.file.as_ref()
    }

    pub fn sample_hashes(&self) -> Map<String, Value> {
        self.target_file().map(TargetFile::hashes).unwrap_or_default()
    }

    pub fn sample_sha256(&self) -> Option<&str> {
        self.target_file()?.sha256.as_deref()
    }

    /// Name of the malware hub: the parent sample digest, else the end time
    pub fn hub_name(&self) -> Option<String> {
        self.info
            .parent_sample
            .get("sha256")
            .and_then(Value::as_str)
            .filter(|digest| !digest.is_empty())
            .map(str::to_string)
            .or_else(|| self.info.ended.clone())
    }

    pub fn machine(&self) -> Option<&Machine> {
        self.info.machine.as_ref()
    }

    pub fn processes(&self) -> &[Process] {
        &self.behavior.processes
    }

    pub fn summary(&self) -> &BehaviorSummary {
        &self.behavior.summary
    }

    pub fn tcp(&self) -> &[Connection] {
        &self.network.tcp
    }

    pub fn udp(&self) -> &[Connection] {
        &self.network.udp
    }

    pub fn hosts(&self) -> &[Host] {
        &self.network.hosts
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.network
            .domains
            .iter()
            .filter_map(|record| record.domain.as_deref())
            .filter(|domain| !domain.is_empty())
    }

    /// ATT&CK technique ids in first-seen order, deduplicated
    pub fn technique_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.ttps
            .iter()
            .flat_map(|entry| entry.ttps.iter().chain(entry.ttp.iter()))
            .map(|id| id.trim())
            .filter(|id| id.starts_with('T'))
            .filter(|id| seen.insert(id.to_string()))
            .map(str::to_string)
            .collect()
    }
}
