//! Bounded-concurrency batch conversion

use crate::error::{ConversionError, ConversionResult};
use crate::pipeline::Converter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Per-run outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub converted: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.converted + self.failed + self.skipped
    }
}

enum Outcome {
    Converted,
    Failed,
}

/// Runs a [`Converter`] over many documents
pub struct BatchRunner {
    converter: Arc<Converter>,
}

impl BatchRunner {
    pub fn new(converter: Converter) -> Self {
        Self {
            converter: Arc::new(converter),
        }
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    /// Convert a single file or every visible entry of a directory
    pub async fn run(&self, input: &Path) -> ConversionResult<BatchSummary> {
        let metadata = tokio::fs::metadata(input)
            .await
            .map_err(|_| ConversionError::InputNotFound(input.to_path_buf()))?;

        if metadata.is_dir() {
            let inputs = Self::list_inputs(input).await?;
            Ok(self.run_many(inputs).await)
        } else {
            Ok(self.run_many(vec![input.to_path_buf()]).await)
        }
    }

    /// Visible regular files of `dir`, sorted by name
    pub async fn list_inputs(dir: &Path) -> ConversionResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut inputs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if Self::is_hidden(&path) {
                debug!(path = %path.display(), "skipping hidden entry");
                continue;
            }
            if entry.file_type().await?.is_file() {
                inputs.push(path);
            }
        }

        inputs.sort();
        Ok(inputs)
    }

    fn is_hidden(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with('.'))
    }

    /// Convert `inputs` under the concurrency limit. Per-document failures
    /// are logged and counted, never propagated.
    pub async fn run_many(&self, inputs: Vec<PathBuf>) -> BatchSummary {
        let config = self.converter.config();
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut summary = BatchSummary::default();
        let mut handles = Vec::with_capacity(inputs.len());

        for input in inputs {
            let output = config.output_path_for(&input);
            if !config.overwrite && tokio::fs::try_exists(&output).await.unwrap_or(false) {
                debug!(document = %input.display(), output = %output.display(), "output exists, skipping");
                summary.skipped += 1;
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "concurrency limiter closed");
                    summary.failed += 1;
                    continue;
                }
            };
            let converter = Arc::clone(&self.converter);

            handles.push(tokio::spawn(async move {
                let outcome = match converter.convert_path(&input, Some(&output)).await {
                    Ok(conversion) => {
                        debug!(
                            document = %input.display(),
                            entities = conversion.stats.entities,
                            relationships = conversion.stats.relationships,
                            "converted"
                        );
                        Outcome::Converted
                    }
                    Err(e @ (ConversionError::Mapping(_) | ConversionError::Json(_))) => {
                        error!(document = %input.display(), kind = e.kind(), error = %e, "malformed report skipped");
                        Outcome::Failed
                    }
                    Err(e) => {
                        warn!(document = %input.display(), kind = e.kind(), error = %e, "document failed");
                        Outcome::Failed
                    }
                };
                drop(permit);
                outcome
            }));
        }

        for handle in futures::future::join_all(handles).await {
            match handle {
                Ok(Outcome::Converted) => summary.converted += 1,
                Ok(Outcome::Failed) => summary.failed += 1,
                Err(e) => {
                    error!(error = %e, "conversion task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            converted = summary.converted,
            failed = summary.failed,
            skipped = summary.skipped,
            "batch complete"
        );
        summary
    }
}
