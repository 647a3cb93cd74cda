//! Protocol payload types and canonical identifiers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Canonical identifiers (used across all crates)
// ============================================================================

/// Canonical job identifier across the system.
///
/// Minted once by the intake adapter; opaque everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Mint a fresh job id.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Worker identifier. Opaque string; human-owned workers are shaped as
/// `user:<email>:<hostname>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Identity for a user-signed connection before the hostname is known.
    pub fn for_user(subject: &str) -> Self {
        Self(format!("user:{}", subject))
    }

    /// Append the hostname reported at registration.
    pub fn with_hostname(&self, hostname: &str) -> Self {
        Self(format!("{}:{}", self.0, hostname))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relay identifier, minted by the server on relay accept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(String);

impl RelayId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id for one tunneled HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Canonical enums
// ============================================================================

/// Worker trust mode.
///
/// A personal worker runs only its owner's jobs; a shared worker accepts any
/// trusted (non-external) author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    #[default]
    Personal,
    Shared,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::Personal => "personal",
            WorkerMode::Shared => "shared",
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "personal" => Ok(WorkerMode::Personal),
            "shared" => Ok(WorkerMode::Shared),
            _ => Err(format!(
                "Invalid worker mode: '{}'. Expected: personal or shared",
                s
            )),
        }
    }
}

/// Classification of a job's author relative to the target repo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Full control of the repo.
    Owner,
    /// Push-capable on the repo.
    #[default]
    Collaborator,
    /// Fork contributor; runs only on the author's worker or after approval.
    External,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Owner => "owner",
            TrustLevel::Collaborator => "collaborator",
            TrustLevel::External => "external",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(TrustLevel::Owner),
            "collaborator" => Ok(TrustLevel::Collaborator),
            "external" => Ok(TrustLevel::External),
            _ => Err(format!(
                "Invalid trust level: '{}'. Expected: owner, collaborator, or external",
                s
            )),
        }
    }
}

/// Job lifecycle status. This is the CANONICAL definition - use this
/// everywhere a job status is persisted or put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the dispatcher queue.
    #[default]
    Queued,
    /// Sent to a worker, not yet started.
    Assigned,
    /// Worker reported JOB_STARTED.
    Running,
    /// Terminal: exit code 0.
    Success,
    /// Terminal: non-zero exit code.
    Failed,
    /// Terminal: infrastructure error (clone failure, retries exhausted,
    /// queue timeout, worker lost).
    Error,
    /// Terminal: cancelled before completion.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// A terminal status is reached exactly once per job; later terminal
    /// frames for the same job are ignored.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Map a worker exit code to the terminal status.
    pub fn from_exit_code(exit_code: i64) -> Self {
        if exit_code == 0 {
            JobStatus::Success
        } else {
            JobStatus::Failed
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "assigned" => Ok(JobStatus::Assigned),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "error" => Ok(JobStatus::Error),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: '{}'", s)),
        }
    }
}

/// Which output stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Phase in which a worker-side job error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPhase {
    Clone,
    Execute,
}

impl ErrorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPhase::Clone => "clone",
            ErrorPhase::Execute => "execute",
        }
    }
}

/// Which forge produced the event behind a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Forge {
    Github {
        /// GitHub App installation id, when the event came through an app.
        #[serde(skip_serializing_if = "Option::is_none")]
        installation: Option<i64>,
    },
    Gitlab,
    Forgejo,
}

impl Forge {
    pub fn kind(&self) -> &'static str {
        match self {
            Forge::Github { .. } => "github",
            Forge::Gitlab => "gitlab",
            Forge::Forgejo => "forgejo",
        }
    }
}

// ============================================================================
// Worker handshake payloads
// ============================================================================

/// Response to a successful connection token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOkPayload {
    pub worker_id: WorkerId,
}

/// Response to a missing or invalid connection token. The connection is
/// closed right after this frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailPayload {
    pub reason: String,
}

/// Capability flags a worker announces at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// A container runtime is available on the worker host.
    #[serde(default)]
    pub container: bool,
}

/// Worker -> Server: announce labels, capabilities, mode, owner, hostname
/// and version. Required before any job traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub mode: WorkerMode,
    /// Owner identity; empty for legacy tokens with no bound owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub hostname: String,
    pub version: String,
}

/// Server -> Worker: registration acknowledged under this id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub worker_id: WorkerId,
}

/// Worker -> Server heartbeat. Carries the worker's view of its active jobs,
/// which the server treats as authoritative for drift recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_jobs: Vec<JobId>,
}

// ============================================================================
// Job payloads
// ============================================================================

/// Pointer to the repository a job builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoPointer {
    pub id: String,
    pub name: String,
    pub clone_url: String,
}

/// The full immutable job descriptor, sent as the JOB_ASSIGN payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub repo: RepoPointer,
    /// Full git ref the event pointed at.
    pub ref_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub commit: String,
    /// Labels the executing worker must carry.
    #[serde(default)]
    pub labels: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Short-lived credential for the clone, when the repo is private.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_token: Option<String>,
    pub forge: Forge,
}

/// Minimal job reference used by ack/reject/start/cancel frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: JobId,
}

/// Worker -> Server: the worker refuses an assigned job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRejectPayload {
    pub job_id: JobId,
    pub reason: String,
}

/// Worker -> Server: one chunk of job output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunkPayload {
    pub job_id: JobId,
    pub stream: LogStream,
    pub data: String,
}

/// Worker -> Server: execution finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletePayload {
    pub job_id: JobId,
    pub exit_code: i64,
    pub duration_ms: u64,
}

/// Worker -> Server: execution could not finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorPayload {
    pub job_id: JobId,
    pub phase: ErrorPhase,
    pub error: String,
}

// ============================================================================
// Relay payloads
// ============================================================================

/// Server -> Relay: sent immediately on accept with the assigned relay id
/// and the public URL prefix for inbound webhook traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayReadyPayload {
    pub relay_id: RelayId,
    pub ingress_url: String,
}

/// Server -> Relay: one tunneled HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequestPayload {
    pub id: RequestId,
    pub method: String,
    /// Path suffix after the relay prefix, query string included.
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base64-encoded request body.
    #[serde(default)]
    pub body: String,
}

/// Relay -> Server: the response for one tunneled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponsePayload {
    pub id: RequestId,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base64-encoded response body.
    #[serde(default)]
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_mint_is_unique() {
        assert_ne!(JobId::mint(), JobId::mint());
    }

    #[test]
    fn worker_id_hostname_augmentation() {
        let id = WorkerId::for_user("alice@example.com");
        assert_eq!(id.as_str(), "user:alice@example.com");
        let full = id.with_hostname("buildbox");
        assert_eq!(full.as_str(), "user:alice@example.com:buildbox");
    }

    #[test]
    fn job_status_exit_code_mapping() {
        assert_eq!(JobStatus::from_exit_code(0), JobStatus::Success);
        assert_eq!(JobStatus::from_exit_code(1), JobStatus::Failed);
        assert_eq!(JobStatus::from_exit_code(137), JobStatus::Failed);
    }

    #[test]
    fn job_status_terminal_set() {
        for status in [
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Error,
            JobStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
        for status in [JobStatus::Queued, JobStatus::Assigned, JobStatus::Running] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn job_status_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Assigned,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Error,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn forge_tagged_encoding() {
        let forge = Forge::Github {
            installation: Some(42),
        };
        let json = serde_json::to_string(&forge).unwrap();
        assert_eq!(json, r#"{"kind":"github","installation":42}"#);

        let parsed: Forge = serde_json::from_str(r#"{"kind":"forgejo"}"#).unwrap();
        assert_eq!(parsed, Forge::Forgejo);
    }
}
