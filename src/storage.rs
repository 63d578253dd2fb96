//! Batch and report persistence
//!
//! Batches are stored one file per phase as plain text: a `Medicion(V)` header
//! followed by one reading per line with six decimals. Each file is rendered
//! in memory, written to a sibling `.partial` file and renamed into place, so
//! readers see either the previous file or the complete new one.

use crate::analysis::AnalysisReport;
use crate::config::StorageConfig;
use crate::error::{AppResult, DaqError};
use crate::measurement::{ExperimentPhase, SampleBatch};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Header line of a batch file.
pub const BATCH_HEADER: &str = "Medicion(V)";

/// Destination for acquired batches and analysis reports.
#[async_trait]
pub trait BatchSink: Send {
    /// Persist the batch for `phase`, replacing any previous one.
    async fn save_batch(&mut self, phase: ExperimentPhase, batch: &SampleBatch)
        -> AppResult<PathBuf>;

    /// Persist the analysis report.
    async fn save_report(&mut self, report: &AnalysisReport) -> AppResult<PathBuf>;
}

/// Text files under one output directory
#[derive(Debug, Clone)]
pub struct TextFileStore {
    output_dir: PathBuf,
    generator_file: String,
    capacitor_file: String,
    report_file: String,
}

impl TextFileStore {
    /// Store with the default file names under `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let defaults = crate::config::FrhConfig::default().storage;
        Self {
            output_dir: output_dir.into(),
            generator_file: defaults.generator_file,
            capacitor_file: defaults.capacitor_file,
            report_file: defaults.report_file,
        }
    }

    /// Store described by the `[storage]` section.
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            generator_file: config.generator_file.clone(),
            capacitor_file: config.capacitor_file.clone(),
            report_file: config.report_file.clone(),
        }
    }

    /// File holding the batch of `phase`.
    pub fn batch_path(&self, phase: ExperimentPhase) -> PathBuf {
        let name = match phase {
            ExperimentPhase::GeneratorPhase => &self.generator_file,
            ExperimentPhase::CapacitorPhase => &self.capacitor_file,
        };
        self.output_dir.join(name)
    }

    /// File holding the analysis report.
    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(&self.report_file)
    }

    async fn ensure_dir(&self) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchSink for TextFileStore {
    async fn save_batch(
        &mut self,
        phase: ExperimentPhase,
        batch: &SampleBatch,
    ) -> AppResult<PathBuf> {
        self.ensure_dir().await?;
        let path = self.batch_path(phase);
        write_replacing(&path, render_batch(batch).as_bytes()).await?;
        info!(
            "Saved {} readings for {} phase to '{}'",
            batch.len(),
            phase,
            path.display()
        );
        Ok(path)
    }

    async fn save_report(&mut self, report: &AnalysisReport) -> AppResult<PathBuf> {
        self.ensure_dir().await?;
        let path = self.report_path();
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| DaqError::Analysis(format!("cannot serialize report: {}", e)))?;
        write_replacing(&path, json.as_bytes()).await?;
        info!("Saved analysis report to '{}'", path.display());
        Ok(path)
    }
}

/// Sibling file a write goes to before it is renamed over `path`.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Replace `path` with `contents` in one rename.
async fn write_replacing(path: &Path, contents: &[u8]) -> AppResult<()> {
    let partial = partial_path(path);
    tokio::fs::write(&partial, contents).await?;
    if let Err(e) = tokio::fs::rename(&partial, path).await {
        if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
            warn!("Could not remove '{}': {}", partial.display(), cleanup);
        }
        return Err(e.into());
    }
    Ok(())
}

/// Batch file contents.
pub fn render_batch(batch: &SampleBatch) -> String {
    let mut out = String::with_capacity(BATCH_HEADER.len() + 1 + batch.len() * 12);
    out.push_str(BATCH_HEADER);
    out.push('\n');
    for v in batch.readings() {
        // Writing to a String cannot fail.
        let _ = writeln!(out, "{:.6}", v);
    }
    out
}

/// Parse batch file contents. Blank lines are ignored.
pub fn parse_batch(contents: &str) -> AppResult<SampleBatch> {
    let mut lines = contents.lines();
    match lines.next().map(str::trim) {
        Some(BATCH_HEADER) => {}
        other => {
            return Err(invalid_data(format!(
                "expected header '{}', found {:?}",
                BATCH_HEADER, other
            )))
        }
    }

    let readings = lines
        .enumerate()
        .map(|(i, line)| (i + 2, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(n, line)| {
            line.parse::<f64>()
                .map_err(|e| invalid_data(format!("line {}: '{}' ({})", n, line, e)))
        })
        .collect::<AppResult<Vec<f64>>>()?;
    Ok(SampleBatch::new(readings))
}

/// Read a batch file written by [`TextFileStore`].
pub async fn read_batch(path: impl AsRef<Path>) -> AppResult<SampleBatch> {
    let contents = tokio::fs::read_to_string(path.as_ref()).await?;
    parse_batch(&contents)
}

fn invalid_data(reason: String) -> DaqError {
    DaqError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, reason))
}
