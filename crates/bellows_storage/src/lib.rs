//! Persistence for the Bellows control plane.
//!
//! SQLite via sqlx. The control plane consumes this as a collaborator: errors
//! are surfaced to the caller, never retried here.

pub mod log_store;
pub mod models;

pub use log_store::{LogEntry, LogStore};
pub use models::{JobRecord, RepoRecord, TokenRecord, WorkerRecord};

use anyhow::{Context, Result};
use bellows_protocol::{JobStatus, WorkerId};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    repo_id     TEXT NOT NULL,
    ref_name    TEXT NOT NULL,
    branch      TEXT,
    tag         TEXT,
    commit_sha  TEXT NOT NULL,
    command     TEXT NOT NULL,
    env_json    TEXT NOT NULL DEFAULT '{}',
    labels_json TEXT NOT NULL DEFAULT '[]',
    forge_json  TEXT NOT NULL,
    author      TEXT NOT NULL DEFAULT '',
    trust       TEXT NOT NULL,
    is_fork     INTEGER NOT NULL DEFAULT 0,
    approved_by TEXT,
    status      TEXT NOT NULL,
    exit_code   INTEGER,
    worker_id   TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_worker_status ON jobs (worker_id, status);

CREATE TABLE IF NOT EXISTS workers (
    id          TEXT PRIMARY KEY,
    hostname    TEXT NOT NULL DEFAULT '',
    version     TEXT NOT NULL DEFAULT '',
    mode        TEXT NOT NULL DEFAULT 'personal',
    owner       TEXT,
    labels_json TEXT NOT NULL DEFAULT '[]',
    status      TEXT NOT NULL DEFAULT 'offline',
    last_seen   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repos (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    clone_url       TEXT NOT NULL,
    private         INTEGER NOT NULL DEFAULT 0,
    owner           TEXT NOT NULL DEFAULT '',
    build_command   TEXT NOT NULL DEFAULT '',
    release_command TEXT,
    max_retries     INTEGER NOT NULL DEFAULT 3
);

CREATE TABLE IF NOT EXISTS tokens (
    id          TEXT PRIMARY KEY,
    token_hash  TEXT NOT NULL UNIQUE,
    worker_id   TEXT,
    description TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL
);
"#;

/// Handle to the control-plane database.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) a database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .with_context(|| format!("Invalid database path: {}", path.display()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let storage = Self { pool };
        storage.init_schema().await?;
        info!("Database ready at {}", path.display());
        Ok(storage)
    }

    /// In-memory database for tests. Single connection so every query sees
    /// the same memory instance.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn create_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, repo_id, ref_name, branch, tag, commit_sha, command,
                env_json, labels_json, forge_json, author, trust, is_fork,
                approved_by, status, exit_code, worker_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.repo_id)
        .bind(&job.ref_name)
        .bind(&job.branch)
        .bind(&job.tag)
        .bind(&job.commit_sha)
        .bind(&job.command)
        .bind(&job.env_json)
        .bind(&job.labels_json)
        .bind(&job.forge_json)
        .bind(&job.author)
        .bind(&job.trust)
        .bind(job.is_fork)
        .bind(&job.approved_by)
        .bind(&job.status)
        .bind(job.exit_code)
        .bind(&job.worker_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Set job status, never downgrading a terminal status. Returns whether
    /// a row actually changed.
    pub async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        exit_code: Option<i64>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, exit_code = COALESCE(?, exit_code), updated_at = ?
            WHERE id = ? AND status NOT IN ('success', 'failed', 'error', 'cancelled')
            "#,
        )
        .bind(status.as_str())
        .bind(exit_code)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    pub async fn update_job_worker(&self, id: &str, worker_id: &WorkerId) -> Result<()> {
        sqlx::query("UPDATE jobs SET worker_id = ?, updated_at = ? WHERE id = ?")
            .bind(worker_id.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn approve_job(&self, id: &str, approver: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET approved_by = ?, updated_at = ? WHERE id = ?")
            .bind(approver)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Jobs persisted as assigned/running on the given worker. Used when a
    /// worker goes stale and its work has to be reconciled.
    pub async fn list_active_jobs_for_worker(&self, worker_id: &WorkerId) -> Result<Vec<JobRecord>> {
        let jobs = sqlx::query_as(
            "SELECT * FROM jobs WHERE worker_id = ? AND status IN ('assigned', 'running')",
        )
        .bind(worker_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    // ========================================================================
    // Workers
    // ========================================================================

    pub async fn get_worker(&self, id: &WorkerId) -> Result<Option<WorkerRecord>> {
        let worker = sqlx::query_as("SELECT * FROM workers WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(worker)
    }

    /// Insert or refresh the persisted record for a registering worker.
    pub async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, hostname, version, mode, owner, labels_json, status, last_seen)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                hostname = excluded.hostname,
                version = excluded.version,
                mode = excluded.mode,
                owner = excluded.owner,
                labels_json = excluded.labels_json,
                status = excluded.status,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.hostname)
        .bind(&worker.version)
        .bind(&worker.mode)
        .bind(&worker.owner)
        .bind(&worker.labels_json)
        .bind(&worker.status)
        .bind(worker.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_worker_status(&self, id: &WorkerId, status: &str) -> Result<()> {
        sqlx::query("UPDATE workers SET status = ?, last_seen = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_worker_last_seen(&self, id: &WorkerId) -> Result<()> {
        sqlx::query("UPDATE workers SET last_seen = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_worker_owner(&self, id: &WorkerId, owner: &str) -> Result<()> {
        sqlx::query("UPDATE workers SET owner = ? WHERE id = ?")
            .bind(owner)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Repos
    // ========================================================================

    pub async fn get_repo(&self, id: &str) -> Result<Option<RepoRecord>> {
        let repo = sqlx::query_as("SELECT * FROM repos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(repo)
    }

    pub async fn create_repo(&self, repo: &RepoRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repos (id, name, clone_url, private, owner, build_command, release_command, max_retries)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&repo.id)
        .bind(&repo.name)
        .bind(&repo.clone_url)
        .bind(repo.private)
        .bind(&repo.owner)
        .bind(&repo.build_command)
        .bind(&repo.release_command)
        .bind(repo.max_retries)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    pub async fn get_token_by_hash(&self, token_hash: &str) -> Result<Option<TokenRecord>> {
        let token = sqlx::query_as("SELECT * FROM tokens WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(token)
    }

    pub async fn create_token(&self, token: &TokenRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO tokens (id, token_hash, worker_id, description, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&token.id)
        .bind(&token.token_hash)
        .bind(&token.worker_id)
        .bind(&token.description)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bellows_protocol::JobId;

    fn sample_job(id: &str) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: id.to_string(),
            repo_id: "repo-1".to_string(),
            ref_name: "refs/heads/main".to_string(),
            branch: Some("main".to_string()),
            tag: None,
            commit_sha: "deadbeef".to_string(),
            command: "cargo test".to_string(),
            env_json: "{}".to_string(),
            labels_json: r#"["linux"]"#.to_string(),
            forge_json: r#"{"kind":"forgejo"}"#.to_string(),
            author: "alice".to_string(),
            trust: "owner".to_string(),
            is_fork: false,
            approved_by: None,
            status: "queued".to_string(),
            exit_code: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn job_lifecycle_roundtrip() {
        let storage = Storage::open_memory().await.unwrap();
        storage.create_job(&sample_job("j1")).await.unwrap();

        let job = storage.get_job("j1").await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.labels(), vec!["linux".to_string()]);

        storage
            .update_job_worker("j1", &WorkerId::new("w1"))
            .await
            .unwrap();
        storage
            .update_job_status("j1", JobStatus::Running, None)
            .await
            .unwrap();
        storage
            .update_job_status("j1", JobStatus::Success, Some(0))
            .await
            .unwrap();

        let job = storage.get_job("j1").await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Success);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn terminal_status_is_not_downgraded() {
        let storage = Storage::open_memory().await.unwrap();
        storage.create_job(&sample_job("j1")).await.unwrap();

        assert!(storage
            .update_job_status("j1", JobStatus::Error, None)
            .await
            .unwrap());
        // A late terminal frame from a misbehaving worker changes nothing.
        assert!(!storage
            .update_job_status("j1", JobStatus::Success, Some(0))
            .await
            .unwrap());

        let job = storage.get_job("j1").await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Error);
    }

    #[tokio::test]
    async fn active_jobs_for_worker() {
        let storage = Storage::open_memory().await.unwrap();
        for id in ["j1", "j2", "j3"] {
            storage.create_job(&sample_job(id)).await.unwrap();
            storage
                .update_job_worker(id, &WorkerId::new("w1"))
                .await
                .unwrap();
        }
        storage
            .update_job_status("j1", JobStatus::Running, None)
            .await
            .unwrap();
        storage
            .update_job_status("j2", JobStatus::Assigned, None)
            .await
            .unwrap();
        storage
            .update_job_status("j3", JobStatus::Success, Some(0))
            .await
            .unwrap();

        let active = storage
            .list_active_jobs_for_worker(&WorkerId::new("w1"))
            .await
            .unwrap();
        let mut ids: Vec<_> = active.iter().map(|j| j.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["j1".to_string(), "j2".to_string()]);
    }

    #[tokio::test]
    async fn worker_upsert_is_idempotent() {
        let storage = Storage::open_memory().await.unwrap();
        let mut record = WorkerRecord {
            id: "user:alice@example.com:box".to_string(),
            hostname: "box".to_string(),
            version: "0.1.0".to_string(),
            mode: "personal".to_string(),
            owner: Some("alice@example.com".to_string()),
            labels_json: r#"["linux"]"#.to_string(),
            status: "online".to_string(),
            last_seen: Utc::now(),
        };
        storage.upsert_worker(&record).await.unwrap();
        record.version = "0.2.0".to_string();
        storage.upsert_worker(&record).await.unwrap();

        let worker = storage
            .get_worker(&WorkerId::new("user:alice@example.com:box"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.version, "0.2.0");
        assert_eq!(worker.labels(), vec!["linux".to_string()]);
    }

    #[tokio::test]
    async fn token_lookup_by_hash() {
        let storage = Storage::open_memory().await.unwrap();
        storage
            .create_token(&TokenRecord {
                id: "tok-1".to_string(),
                token_hash: "abc123".to_string(),
                worker_id: Some("builder-1".to_string()),
                description: "ci box".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let token = storage.get_token_by_hash("abc123").await.unwrap().unwrap();
        assert_eq!(token.worker_id.as_deref(), Some("builder-1"));
        assert!(storage.get_token_by_hash("missing").await.unwrap().is_none());
    }

    #[test]
    fn job_id_interop() {
        // JobRecord ids and protocol JobIds share the same string space.
        let minted = JobId::mint();
        let record_id = minted.to_string();
        assert_eq!(JobId::from(record_id.as_str()), minted);
    }
}
