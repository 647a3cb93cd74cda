//! Database models.
//!
//! Uses derive macros for FromRow to map database rows to structs. JSON-typed
//! columns (labels, env, forge) are parsed at the boundary by the accessors
//! below.

use bellows_protocol::{Forge, JobStatus, TrustLevel, WorkerMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

/// One persisted CI job.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    pub id: String,
    pub repo_id: String,
    pub ref_name: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub commit_sha: String,
    pub command: String,
    pub env_json: String,
    pub labels_json: String,
    pub forge_json: String,
    pub author: String,
    pub trust: String,
    pub is_fork: bool,
    pub approved_by: Option<String>,
    pub status: String,
    pub exit_code: Option<i64>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn status(&self) -> JobStatus {
        self.status.parse().unwrap_or(JobStatus::Error)
    }

    pub fn trust_level(&self) -> TrustLevel {
        self.trust.parse().unwrap_or_default()
    }

    pub fn labels(&self) -> Vec<String> {
        serde_json::from_str(&self.labels_json).unwrap_or_default()
    }

    pub fn env(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.env_json).unwrap_or_default()
    }

    pub fn forge(&self) -> Forge {
        serde_json::from_str(&self.forge_json).unwrap_or(Forge::Forgejo)
    }
}

/// One known worker, connected or not.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerRecord {
    pub id: String,
    pub hostname: String,
    pub version: String,
    pub mode: String,
    pub owner: Option<String>,
    pub labels_json: String,
    pub status: String,
    pub last_seen: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn mode(&self) -> WorkerMode {
        self.mode.parse().unwrap_or_default()
    }

    pub fn labels(&self) -> Vec<String> {
        serde_json::from_str(&self.labels_json).unwrap_or_default()
    }
}

/// A repository known to the control plane.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RepoRecord {
    pub id: String,
    pub name: String,
    pub clone_url: String,
    pub private: bool,
    pub owner: String,
    pub build_command: String,
    pub release_command: Option<String>,
    /// 0 means retries are uncapped.
    pub max_retries: i64,
}

/// A stored worker connection token. Only the SHA-256 digest is persisted.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRecord {
    pub id: String,
    pub token_hash: String,
    /// Worker identity this token is bound to; the token id is used when
    /// absent.
    pub worker_id: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}
