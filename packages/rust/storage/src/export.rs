//! Output sinks: JSON files on disk plus the run history in [`Storage`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use mineassembler_shared::{AssemblyError, BatchMetrics, Project, Result};

use crate::Storage;

/// Receives each finished batch. Every project handed over already satisfies
/// the data-model invariants.
#[async_trait]
pub trait ProjectSink: Send + Sync {
    async fn save(&self, projects: &[Arc<Project>], metrics: &BatchMetrics) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JsonExporter
// ---------------------------------------------------------------------------

/// Writes `run_<id>/batch_NNNN.json`, `run_<id>/projects.json` and
/// `reports/run_<id>.json` under the output directory.
pub struct JsonExporter {
    out_dir: PathBuf,
    run_id: String,
}

#[derive(Serialize)]
struct BatchFile<'a> {
    run_id: &'a str,
    metrics: &'a BatchMetrics,
    projects: &'a [Arc<Project>],
}

impl JsonExporter {
    pub fn new(out_dir: &Path, run_id: &str) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
            run_id: run_id.to_string(),
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.out_dir.join(format!("run_{}", self.run_id))
    }

    pub fn report_path(&self) -> PathBuf {
        self.out_dir
            .join("reports")
            .join(format!("run_{}.json", self.run_id))
    }

    /// Write one batch file.
    pub fn write_batch(&self, projects: &[Arc<Project>], metrics: &BatchMetrics) -> Result<PathBuf> {
        let path = self
            .run_dir()
            .join(format!("batch_{:04}.json", metrics.batch_id));
        write_json_atomic(
            &path,
            &BatchFile {
                run_id: &self.run_id,
                metrics,
                projects,
            },
        )?;
        Ok(path)
    }

    /// Write the final project set, ordered by identifier.
    pub fn write_projects(&self, projects: &[Arc<Project>]) -> Result<PathBuf> {
        let mut projects = projects.to_vec();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        let path = self.run_dir().join("projects.json");
        write_json_atomic(&path, &projects)?;
        info!(path = %path.display(), count = projects.len(), "projects written");
        Ok(path)
    }

    pub fn write_report<T: Serialize>(&self, report: &T) -> Result<PathBuf> {
        let path = self.report_path();
        write_json_atomic(&path, report)?;
        Ok(path)
    }
}

#[async_trait]
impl ProjectSink for JsonExporter {
    async fn save(&self, projects: &[Arc<Project>], metrics: &BatchMetrics) -> Result<()> {
        validate_all(projects)?;
        self.write_batch(projects, metrics)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunSink
// ---------------------------------------------------------------------------

/// The sink a pipeline run writes to: JSON files plus run history.
pub struct RunSink {
    run_id: String,
    storage: Arc<Storage>,
    exporter: JsonExporter,
}

impl RunSink {
    /// Start a new run with a fresh time-ordered id.
    pub async fn begin(
        storage: Arc<Storage>,
        out_dir: &Path,
        config_json: Option<&str>,
    ) -> Result<Self> {
        let run_id = Uuid::now_v7().to_string();
        storage.insert_run(&run_id, config_json).await?;
        info!(%run_id, out_dir = %out_dir.display(), "run started");
        Ok(Self {
            exporter: JsonExporter::new(out_dir, &run_id),
            run_id,
            storage,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn exporter(&self) -> &JsonExporter {
        &self.exporter
    }

    /// Write `projects.json` and the run report, and close the run record.
    ///
    /// `projects` is the final ledger content. Projects whose URLs grew after
    /// their batch was saved are stored again.
    #[instrument(skip_all, fields(run_id = %self.run_id, count = projects.len()))]
    pub async fn finish<T: Serialize + Sync>(
        &self,
        projects: &[Arc<Project>],
        summary: &T,
    ) -> Result<PathBuf> {
        validate_all(projects)?;
        for project in projects {
            self.storage.upsert_project(&self.run_id, project).await?;
        }
        self.exporter.write_projects(projects)?;
        let report = self.exporter.write_report(summary)?;
        let json = serde_json::to_string(summary)
            .map_err(|e| AssemblyError::validation(format!("JSON serialization failed: {e}")))?;
        self.storage.finish_run(&self.run_id, &json).await?;
        info!(report = %report.display(), "run finished");
        Ok(report)
    }
}

#[async_trait]
impl ProjectSink for RunSink {
    #[instrument(skip_all, fields(run_id = %self.run_id, batch_id = metrics.batch_id, count = projects.len()))]
    async fn save(&self, projects: &[Arc<Project>], metrics: &BatchMetrics) -> Result<()> {
        validate_all(projects)?;
        self.exporter.write_batch(projects, metrics)?;
        for project in projects {
            self.storage.upsert_project(&self.run_id, project).await?;
        }
        self.storage.record_batch(&self.run_id, metrics).await?;
        debug!("batch saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_all(projects: &[Arc<Project>]) -> Result<()> {
    projects.iter().try_for_each(|p| p.validate())
}

/// Write pretty JSON to a temp file next to `path`, then rename over it, so
/// readers never see a half-written file.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AssemblyError::validation(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| AssemblyError::io(dir, e))?;

    let json = serde_json::to_string_pretty(data)
        .map_err(|e| AssemblyError::validation(format!("JSON serialization failed: {e}")))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{file_name}.tmp"));
    std::fs::write(&temp, json).map_err(|e| AssemblyError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| AssemblyError::io(path, e))?;

    debug!(path = %path.display(), "wrote JSON file");
    Ok(())
}
