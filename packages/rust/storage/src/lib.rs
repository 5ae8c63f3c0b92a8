//! libSQL storage layer and output sinks.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the on-disk
//! geocode cache, run and batch history, and the index of assembled projects
//! used to resume interrupted runs. [`export`] turns finished batches into
//! JSON files.

pub mod export;
mod migrations;

use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use tracing::{debug, info};

use mineassembler_shared::{AssemblyError, BatchMetrics, Project, ProjectId, Result};

pub use export::{JsonExporter, ProjectSink, RunSink};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AssemblyError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        info!(path = %path.display(), "storage opened");
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    AssemblyError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Geocode cache
    // -----------------------------------------------------------------------

    /// Cached address JSON for a rounded coordinate bucket.
    pub async fn get_geocode(&self, bucket: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT address_json FROM geocode_cache WHERE bucket = ?1",
                params![bucket],
            )
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| AssemblyError::Storage(e.to_string()))?;
                Ok(Some(json))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(AssemblyError::Storage(e.to_string())),
        }
    }

    /// Store an address for a bucket (upserts).
    pub async fn put_geocode(&self, bucket: &str, address_json: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO geocode_cache (bucket, address_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(bucket) DO UPDATE SET
                   address_json = excluded.address_json,
                   created_at = excluded.created_at",
                params![bucket, address_json, now.as_str()],
            )
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;
        debug!(bucket, "geocode cached");
        Ok(())
    }

    /// Number of cached buckets.
    pub async fn geocode_cache_size(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM geocode_cache").await
    }

    // -----------------------------------------------------------------------
    // Runs and batches
    // -----------------------------------------------------------------------

    /// Record the start of a run.
    pub async fn insert_run(&self, run_id: &str, config_json: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at, config_json) VALUES (?1, ?2, ?3)",
                params![run_id, now.as_str(), config_json],
            )
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Mark a run finished with its summary.
    pub async fn finish_run(&self, run_id: &str, summary_json: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, summary_json = ?2 WHERE id = ?3",
                params![now.as_str(), summary_json, run_id],
            )
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Persist one batch's metrics.
    pub async fn record_batch(&self, run_id: &str, metrics: &BatchMetrics) -> Result<()> {
        let json = serde_json::to_string(metrics)
            .map_err(|e| AssemblyError::Storage(format!("metrics serialization failed: {e}")))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO batches (run_id, batch_id, attempted, succeeded, failed, metrics_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id, batch_id) DO UPDATE SET
                   attempted = excluded.attempted,
                   succeeded = excluded.succeeded,
                   failed = excluded.failed,
                   metrics_json = excluded.metrics_json,
                   recorded_at = excluded.recorded_at",
                params![
                    run_id,
                    metrics.batch_id as i64,
                    metrics.attempted as i64,
                    metrics.succeeded as i64,
                    metrics.failed() as i64,
                    json.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Metrics of every batch of a run, in batch order.
    pub async fn list_batches(&self, run_id: &str) -> Result<Vec<BatchMetrics>> {
        let mut rows = self
            .conn
            .query(
                "SELECT metrics_json FROM batches WHERE run_id = ?1 ORDER BY batch_id",
                params![run_id],
            )
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let json: String = row
                .get(0)
                .map_err(|e| AssemblyError::Storage(e.to_string()))?;
            let metrics = serde_json::from_str(&json)
                .map_err(|e| AssemblyError::Storage(format!("corrupt batch metrics: {e}")))?;
            results.push(metrics);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Insert or replace an assembled project.
    pub async fn upsert_project(&self, run_id: &str, project: &Project) -> Result<()> {
        let json = serde_json::to_string(project)
            .map_err(|e| AssemblyError::Storage(format!("project serialization failed: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO projects (id, run_id, project_json, complete, assembled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   run_id = excluded.run_id,
                   project_json = excluded.project_json,
                   complete = excluded.complete,
                   assembled_at = excluded.assembled_at",
                params![
                    project.id.as_str(),
                    run_id,
                    json.as_str(),
                    i64::from(project.complete),
                    project.assembled_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Load a stored project.
    pub async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        let mut rows = self
            .conn
            .query(
                "SELECT project_json FROM projects WHERE id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| AssemblyError::Storage(e.to_string()))?;
                let project = serde_json::from_str(&json)
                    .map_err(|e| AssemblyError::Storage(format!("corrupt project row: {e}")))?;
                Ok(Some(project))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(AssemblyError::Storage(e.to_string())),
        }
    }

    /// Identifiers of every project stored by any run.
    pub async fn completed_ids(&self) -> Result<BTreeSet<ProjectId>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM projects", params![])
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;

        let mut ids = BTreeSet::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| AssemblyError::Storage(e.to_string()))?;
            ids.insert(ProjectId::new(id));
        }
        Ok(ids)
    }

    /// Number of stored projects.
    pub async fn project_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM projects").await
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(sql, params![])
            .await
            .map_err(|e| AssemblyError::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map(|n| n.max(0) as u64)
                .map_err(|e| AssemblyError::Storage(e.to_string())),
            Ok(None) => Ok(0),
            Err(e) => Err(AssemblyError::Storage(e.to_string())),
        }
    }
}
