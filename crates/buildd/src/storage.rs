//! SQLite storage for the build daemon.
//!
//! Holds the latest snapshot per project and an archive of runs.

use std::collections::BTreeMap;
use std::path::Path;

use build_core::{ErrorCategory, Id, ProjectId, Run, RunStatus, Snapshot, SnapshotFile, Stage};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use thiserror::Error;

const RUNS_COLUMNS: &str = "id, project_id, original_request, current_stage, status, \
    retry_counts_json, total_retries, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations. Safe to call more than once.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Snapshot operations ---

    /// Store a snapshot as the project's latest.
    ///
    /// Returns `false` when the stored snapshot already has the same content.
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<bool> {
        let digest = snapshot.digest();
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT digest FROM snapshots WHERE project_id = ?1")
                .bind(snapshot.project_id.as_ref())
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some_and(|(d,)| d == digest) {
            return Ok(false);
        }

        let files_json = serde_json::to_string(&snapshot.files)?;
        sqlx::query(
            r"
            INSERT INTO snapshots (project_id, digest, files_json, taken_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(project_id) DO UPDATE SET
                digest = excluded.digest,
                files_json = excluded.files_json,
                taken_at = excluded.taken_at
            ",
        )
        .bind(snapshot.project_id.as_ref())
        .bind(&digest)
        .bind(&files_json)
        .bind(snapshot.taken_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Latest snapshot for a project, if any.
    pub async fn latest_snapshot(&self, project_id: &ProjectId) -> Result<Option<Snapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT project_id, files_json, taken_at FROM snapshots WHERE project_id = ?1",
        )
        .bind(project_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SnapshotRow::into_snapshot).transpose()
    }

    // --- Run operations ---

    /// Insert a new run.
    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        let retry_counts_json = serde_json::to_string(&run.retry_counts)?;
        sqlx::query(
            r"
            INSERT INTO runs (id, project_id, original_request, current_stage, status,
                              retry_counts_json, total_retries, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )
        .bind(run.id.as_ref())
        .bind(run.project_id.as_ref())
        .bind(&run.original_request)
        .bind(run.current_stage.as_str())
        .bind(run.status.as_str())
        .bind(&retry_counts_json)
        .bind(i64::from(run.total_retries))
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist the mutable parts of a run.
    pub async fn update_run(&self, run: &Run) -> Result<()> {
        let retry_counts_json = serde_json::to_string(&run.retry_counts)?;
        let result = sqlx::query(
            "UPDATE runs SET current_stage = ?1, status = ?2, retry_counts_json = ?3, \
             total_retries = ?4, updated_at = ?5 WHERE id = ?6",
        )
        .bind(run.current_stage.as_str())
        .bind(run.status.as_str())
        .bind(&retry_counts_json)
        .bind(i64::from(run.total_retries))
        .bind(run.updated_at.timestamp_millis())
        .bind(run.id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run.id.to_string()));
        }
        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;

        row.into_run()
    }

    /// Most recent run for a project, if any.
    pub async fn latest_run(&self, project_id: &ProjectId) -> Result<Option<Run>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM runs WHERE project_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(project_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRow::into_run).transpose()
    }

    /// Mark runs left RUNNING by a previous process as failed.
    ///
    /// Their tasks died with that process, so nothing will finish them.
    pub async fn fail_interrupted_runs(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query("UPDATE runs SET status = ?1, updated_at = ?2 WHERE status = ?3")
            .bind(RunStatus::Failed.as_str())
            .bind(now)
            .bind(RunStatus::Running.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    project_id: String,
    files_json: String,
    taken_at: i64,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot> {
        let files: Vec<SnapshotFile> = serde_json::from_str(&self.files_json)?;
        Ok(Snapshot {
            project_id: ProjectId::from_string(self.project_id),
            files,
            taken_at: DateTime::from_timestamp_millis(self.taken_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    project_id: String,
    original_request: String,
    current_stage: String,
    status: String,
    retry_counts_json: String,
    total_retries: i64,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let current_stage = Stage::ALL
            .into_iter()
            .find(|s| s.as_str() == self.current_stage)
            .ok_or_else(|| StorageError::Corrupt(format!("stage '{}'", self.current_stage)))?;
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("status '{}'", self.status)))?;
        let retry_counts: BTreeMap<ErrorCategory, u32> =
            serde_json::from_str(&self.retry_counts_json)?;

        Ok(Run {
            id: Id::from_string(self.id),
            project_id: ProjectId::from_string(self.project_id),
            original_request: self.original_request,
            current_stage,
            retry_counts,
            total_retries: u32::try_from(self.total_retries).unwrap_or(0),
            status,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}
