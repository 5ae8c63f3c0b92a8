//! SQL migration definitions for the assembly database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: geocode_cache, runs, batches, projects",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Reverse-geocoding results keyed by rounded coordinate bucket
CREATE TABLE IF NOT EXISTS geocode_cache (
    bucket       TEXT PRIMARY KEY,
    address_json TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

-- One row per pipeline run
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    config_json  TEXT,
    summary_json TEXT
);

-- Per-batch metrics
CREATE TABLE IF NOT EXISTS batches (
    run_id       TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    batch_id     INTEGER NOT NULL,
    attempted    INTEGER NOT NULL,
    succeeded    INTEGER NOT NULL,
    failed       INTEGER NOT NULL,
    metrics_json TEXT NOT NULL,
    recorded_at  TEXT NOT NULL,
    PRIMARY KEY (run_id, batch_id)
);

-- Assembled projects, last write wins
CREATE TABLE IF NOT EXISTS projects (
    id           TEXT PRIMARY KEY,
    run_id       TEXT NOT NULL,
    project_json TEXT NOT NULL,
    complete     INTEGER NOT NULL,
    assembled_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_projects_run ON projects(run_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
