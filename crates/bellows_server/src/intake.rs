//! Job intake.
//!
//! The single entry point through which webhook collaborators inject work.
//! The webhook layer resolves the repo, the ref and the trust level, and
//! deduplicates by delivery id before calling in here.

use crate::dispatcher::{Dispatcher, QueuedJob};
use crate::metrics::METRICS;
use bellows_protocol::{Forge, JobId, JobSpec, JobStatus, RepoPointer, TrustLevel};
use bellows_storage::{JobRecord, RepoRecord, Storage};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Which of the repo's configured commands a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Build,
    /// Tag pushes; falls back to the build command when the repo has no
    /// release command configured.
    Release,
}

/// Everything the webhook layer hands over for one job.
pub struct EnqueueRequest {
    pub repo: RepoRecord,
    pub ref_name: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub commit: String,
    pub sender: String,
    pub trust: TrustLevel,
    pub is_fork: bool,
    pub approved_by: Option<String>,
    pub clone_token: Option<String>,
    pub command: CommandKind,
    pub env: HashMap<String, String>,
    pub labels: Vec<String>,
    pub forge: Forge,
}

pub struct Intake {
    storage: Storage,
    dispatcher: Arc<Dispatcher>,
}

impl Intake {
    pub fn new(storage: Storage, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            storage,
            dispatcher,
        }
    }

    /// Mint a job, persist it, and hand it to the dispatcher.
    pub async fn enqueue_job(&self, request: EnqueueRequest) -> Result<JobId> {
        let job_id = JobId::mint();
        let command = match request.command {
            CommandKind::Build => request.repo.build_command.clone(),
            CommandKind::Release => request
                .repo
                .release_command
                .clone()
                .unwrap_or_else(|| request.repo.build_command.clone()),
        };
        let now = Utc::now();

        let record = JobRecord {
            id: job_id.to_string(),
            repo_id: request.repo.id.clone(),
            ref_name: request.ref_name.clone(),
            branch: request.branch.clone(),
            tag: request.tag.clone(),
            commit_sha: request.commit.clone(),
            command: command.clone(),
            env_json: serde_json::to_string(&request.env)?,
            labels_json: serde_json::to_string(&request.labels)?,
            forge_json: serde_json::to_string(&request.forge)?,
            author: request.sender.clone(),
            trust: request.trust.as_str().to_string(),
            is_fork: request.is_fork,
            approved_by: request.approved_by.clone(),
            status: JobStatus::Queued.as_str().to_string(),
            exit_code: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.create_job(&record).await?;

        let job = QueuedJob {
            spec: JobSpec {
                id: job_id.clone(),
                repo: RepoPointer {
                    id: request.repo.id,
                    name: request.repo.name,
                    clone_url: request.repo.clone_url,
                },
                ref_name: request.ref_name,
                branch: request.branch,
                tag: request.tag,
                commit: request.commit,
                labels: request.labels,
                command,
                env: request.env,
                clone_token: request.clone_token,
                forge: request.forge,
            },
            author: request.sender,
            trust: request.trust,
            is_fork: request.is_fork,
            approved_by: request.approved_by,
            attempts: 0,
            max_retries: request.repo.max_retries.max(0) as u32,
            enqueued_at: Instant::now(),
        };

        info!(
            "Job {} enqueued for {}@{} by {}",
            job_id,
            job.spec.repo.name,
            &job.spec.commit[..job.spec.commit.len().min(12)],
            if job.author.is_empty() { "<untagged>" } else { &job.author }
        );
        METRICS.inc_jobs_enqueued();
        self.dispatcher.enqueue(job).await;
        Ok(job_id)
    }

    /// Record an approval for a held fork job and let the dispatcher retry
    /// it.
    pub async fn approve(&self, job_id: &JobId, approver: &str) -> Result<()> {
        self.storage.approve_job(job_id.as_str(), approver).await?;
        self.dispatcher.approve(job_id, approver);
        Ok(())
    }

    /// Cancel a queued or running job.
    pub async fn cancel(&self, job_id: &JobId) -> bool {
        self.dispatcher.cancel_job(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::log_fanout::LogFanout;
    use crate::status::NoopStatusPoster;
    use bellows_storage::LogStore;

    fn repo() -> RepoRecord {
        RepoRecord {
            id: "repo-1".to_string(),
            name: "widgets".to_string(),
            clone_url: "https://forge.example/widgets.git".to_string(),
            private: false,
            owner: "alice".to_string(),
            build_command: "make test".to_string(),
            release_command: Some("make dist".to_string()),
            max_retries: 3,
        }
    }

    fn request(command: CommandKind) -> EnqueueRequest {
        EnqueueRequest {
            repo: repo(),
            ref_name: "refs/heads/main".to_string(),
            branch: Some("main".to_string()),
            tag: None,
            commit: "deadbeefcafe".to_string(),
            sender: "alice".to_string(),
            trust: TrustLevel::Owner,
            is_fork: false,
            approved_by: None,
            clone_token: None,
            command,
            env: HashMap::new(),
            labels: vec!["linux".to_string()],
            forge: Forge::Forgejo,
        }
    }

    async fn test_intake() -> (Intake, Storage, Arc<Dispatcher>, tempfile::TempDir) {
        let storage = Storage::open_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogStore::new(dir.path().to_path_buf()).unwrap());
        let hub = Arc::new(Hub::new());
        let fanout = Arc::new(LogFanout::new());
        let dispatcher = Dispatcher::new(
            hub,
            storage.clone(),
            logs,
            fanout,
            Arc::new(NoopStatusPoster),
        );
        (
            Intake::new(storage.clone(), dispatcher.clone()),
            storage,
            dispatcher,
            dir,
        )
    }

    #[tokio::test]
    async fn enqueue_persists_and_queues() {
        let (intake, storage, dispatcher, _dir) = test_intake().await;
        let job_id = intake.enqueue_job(request(CommandKind::Build)).await.unwrap();

        let record = storage.get_job(job_id.as_str()).await.unwrap().unwrap();
        assert_eq!(record.status(), JobStatus::Queued);
        assert_eq!(record.command, "make test");
        assert_eq!(record.author, "alice");
        assert_eq!(record.labels(), vec!["linux".to_string()]);
        assert_eq!(dispatcher.queued_len(), 1);
    }

    #[tokio::test]
    async fn release_variant_selects_release_command() {
        let (intake, storage, _dispatcher, _dir) = test_intake().await;
        let job_id = intake
            .enqueue_job(request(CommandKind::Release))
            .await
            .unwrap();
        let record = storage.get_job(job_id.as_str()).await.unwrap().unwrap();
        assert_eq!(record.command, "make dist");
    }

    #[tokio::test]
    async fn release_falls_back_to_build_command() {
        let (intake, storage, _dispatcher, _dir) = test_intake().await;
        let mut req = request(CommandKind::Release);
        req.repo.release_command = None;
        let job_id = intake.enqueue_job(req).await.unwrap();
        let record = storage.get_job(job_id.as_str()).await.unwrap().unwrap();
        assert_eq!(record.command, "make test");
    }

    #[tokio::test]
    async fn approval_is_persisted() {
        let (intake, storage, _dispatcher, _dir) = test_intake().await;
        let mut req = request(CommandKind::Build);
        req.sender = "mallory".to_string();
        req.trust = TrustLevel::External;
        req.is_fork = true;
        let job_id = intake.enqueue_job(req).await.unwrap();

        intake.approve(&job_id, "alice").await.unwrap();
        let record = storage.get_job(job_id.as_str()).await.unwrap().unwrap();
        assert_eq!(record.approved_by.as_deref(), Some("alice"));
    }
}
