//! Converter configuration

use crate::error::{ConversionError, ConversionResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings shared by every document in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Attach property extensions (custom content)
    pub allow_custom: bool,
    /// Viewable output: skip file, directory and registry-key mapping
    pub small: bool,
    /// Documents converted in parallel
    pub concurrency: usize,
    /// Reconvert inputs whose output already exists
    pub overwrite: bool,
    pub output_dir: PathBuf,
    /// Directory of trusted baseline bundles
    pub benign_dir: Option<PathBuf>,
    /// Software names excluded from the benign table
    pub baseline_software: Vec<String>,
    pub lookup_timeout_secs: u64,
    /// Emit a report object referencing every entity
    pub report_wrapper: bool,
    /// Query MalwareBazaar for sample tags
    pub fetch_reputation_tags: bool,
    /// ATT&CK STIX bundle for technique lookups
    pub attack_catalog: Option<PathBuf>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            allow_custom: true,
            small: false,
            concurrency: 5,
            overwrite: false,
            output_dir: PathBuf::from("output"),
            benign_dir: None,
            baseline_software: vec!["KVM".into(), "win10".into(), "ubuntu22".into()],
            lookup_timeout_secs: 20,
            report_wrapper: false,
            fetch_reputation_tags: false,
            attack_catalog: None,
        }
    }
}

impl ConverterConfig {
    /// Load from a JSON file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> ConversionResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConversionError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ConversionError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConversionResult<()> {
        if self.concurrency == 0 {
            return Err(ConversionError::Config("concurrency must be at least 1".into()));
        }
        if self.lookup_timeout_secs == 0 {
            return Err(ConversionError::Config("lookup timeout must be at least 1s".into()));
        }
        Ok(())
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_benign_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.benign_dir = Some(dir.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_attack_catalog(mut self, path: impl Into<PathBuf>) -> Self {
        self.attack_catalog = Some(path.into());
        self
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    /// Output location for an input file
    pub fn output_path_for(&self, input: &Path) -> PathBuf {
        match input.file_name() {
            Some(name) => self.output_dir.join(name),
            None => self.output_dir.join("bundle.json"),
        }
    }
}
