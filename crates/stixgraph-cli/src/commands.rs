//! CLI command definitions and handlers

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use stixgraph_engine::{BatchRunner, Converter, ConverterConfig};
use stixgraph_store::{BaselineSoftware, BenignTable};
use tracing::{debug, info};

/// Benign corpus location used by `--clean-benign` when no directory is given
pub const DEFAULT_BENIGN_DIR: &str = "benign";

/// Main CLI structure
#[derive(Parser)]
#[command(name = "stixgraph")]
#[command(about = "Convert CAPE sandbox reports into STIX 2.1 bundles")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Log level, used when RUST_LOG is not set
    #[arg(long, global = true, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Convert a report file, or every report in a directory
    Convert(ConvertArgs),

    /// Index a benign corpus and print entry counts per object type
    Benign {
        /// Directory of baseline STIX bundles
        #[arg(short, long)]
        dir: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,

        /// JSON configuration file supplying the baseline software names
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show build information
    Info,
}

/// Flags of the `convert` command. Flags override values from `--config`.
#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Report file or directory of reports, ie: ./report.json
    #[arg(short, long)]
    pub file: PathBuf,

    /// Skip files, directories and registry keys for a viewable graph
    #[arg(long)]
    pub small: bool,

    /// Overwrite existing output files
    #[arg(long)]
    pub overwrite: bool,

    /// Do not attach custom extension properties
    #[arg(long)]
    pub disallow_custom: bool,

    /// Remove known benign STIX data
    #[arg(long)]
    pub clean_benign: bool,

    /// Benign corpus directory (implies --clean-benign)
    #[arg(long)]
    pub benign_dir: Option<PathBuf>,

    /// Directory receiving the converted bundles
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Reports converted in parallel
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Wrap the graph in a report object
    #[arg(long)]
    pub report: bool,

    /// Fetch sample tags from MalwareBazaar
    #[arg(long)]
    pub fetch_tags: bool,

    /// ATT&CK STIX bundle used to describe techniques
    #[arg(long)]
    pub attack_catalog: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ConvertArgs {
    /// Merge the flags over the configuration file (or the defaults)
    pub fn to_config(&self) -> Result<ConverterConfig> {
        let mut config = match &self.config {
            Some(path) => ConverterConfig::from_file(path)?,
            None => ConverterConfig::default(),
        };

        if self.small {
            config.small = true;
        }
        if self.overwrite {
            config.overwrite = true;
        }
        if self.disallow_custom {
            config.allow_custom = false;
        }
        if self.report {
            config.report_wrapper = true;
        }
        if self.fetch_tags {
            config.fetch_reputation_tags = true;
        }
        if let Some(dir) = &self.output_dir {
            config = config.with_output_dir(dir);
        }
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        if let Some(path) = &self.attack_catalog {
            config = config.with_attack_catalog(path);
        }
        match &self.benign_dir {
            Some(dir) => config = config.with_benign_dir(dir),
            None if self.clean_benign && config.benign_dir.is_none() => {
                config = config.with_benign_dir(DEFAULT_BENIGN_DIR);
            }
            None => {}
        }

        config.validate()?;
        Ok(config)
    }
}

/// Log level choices
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    JsonPretty,
}

/// Command execution result
#[derive(Debug)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Command executor
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Execute a command
    pub async fn execute(&mut self, command: Commands) -> Result<CommandResult> {
        match command {
            Commands::Convert(args) => self.execute_convert(args).await,
            Commands::Benign { dir, format, config } => {
                self.execute_benign(dir, format, config).await
            }
            Commands::Info => self.execute_info(),
        }
    }

    async fn execute_convert(&self, args: ConvertArgs) -> Result<CommandResult> {
        let config = args.to_config()?;
        debug!(?config, "effective configuration");
        let converter = Converter::from_config(config).await?;
        let runner = BatchRunner::new(converter);

        let summary = match runner.run(&args.file).await {
            Ok(summary) => summary,
            Err(e) if e.is_usage_error() => {
                return Ok(CommandResult {
                    success: false,
                    message: format!(
                        "{}. Please add a valid path to a JSON file, ie: ./report.json",
                        e
                    ),
                    data: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let output_dir = runner.converter().config().output_dir.display().to_string();
        println!(
            "Converted {} report(s) into {} ({} failed, {} skipped)",
            summary.converted, output_dir, summary.failed, summary.skipped
        );

        Ok(CommandResult {
            success: true,
            message: format!("{} of {} report(s) converted", summary.converted, summary.total()),
            data: Some(serde_json::to_value(summary)?),
        })
    }

    async fn execute_benign(
        &self,
        dir: PathBuf,
        format: OutputFormat,
        config: Option<PathBuf>,
    ) -> Result<CommandResult> {
        // Same baseline the converter applies when it loads the corpus
        let config = match config {
            Some(path) => ConverterConfig::from_file(&path)?,
            None => ConverterConfig::default(),
        };
        let baseline = BaselineSoftware::new(config.baseline_software);
        let table = match BenignTable::load_dir(&dir, &baseline).await {
            Ok(table) => table,
            Err(e) => {
                return Ok(CommandResult {
                    success: false,
                    message: format!("cannot index {}: {}", dir.display(), e),
                    data: None,
                });
            }
        };

        let counts = table.type_counts();
        info!(dir = %dir.display(), entries = table.len(), "benign corpus indexed");
        let data = serde_json::to_value(&counts)?;

        match format {
            OutputFormat::Text => {
                for (object_type, count) in &counts {
                    println!("{:<24} {}", object_type, count);
                }
                println!("{:<24} {}", "total", table.len());
            }
            OutputFormat::Json => println!("{}", serde_json::to_string(&data)?),
            OutputFormat::JsonPretty => println!("{}", serde_json::to_string_pretty(&data)?),
        }

        Ok(CommandResult {
            success: true,
            message: format!("{} benign identifier(s) indexed", table.len()),
            data: Some(data),
        })
    }

    fn execute_info(&self) -> Result<CommandResult> {
        let info = serde_json::json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "description": env!("CARGO_PKG_DESCRIPTION"),
            "repository": env!("CARGO_PKG_REPOSITORY"),
            "stix_version": "2.1",
            "inputs": ["cape report.json"]
        });

        println!("{}", serde_json::to_string_pretty(&info)?);

        Ok(CommandResult {
            success: true,
            message: "System information".to_string(),
            data: Some(info),
        })
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}
