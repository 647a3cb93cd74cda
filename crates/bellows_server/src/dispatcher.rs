//! Job queue and assignment.
//!
//! One mutex guards the pending queue and the inflight table. The assignment
//! loop wakes on enqueue, on worker-available notifications (wired through
//! the hub callbacks) and on a one-second tick; a second loop sweeps stale
//! workers and timed-out queue entries every thirty seconds.

use crate::hub::{Hub, JobPolicy};
use crate::log_fanout::LogFanout;
use crate::metrics::METRICS;
use crate::status::StatusPoster;
use bellows_protocol::defaults::{DISPATCH_TICK, QUEUE_TIMEOUT, STALE_AFTER, SWEEP_INTERVAL};
use bellows_protocol::{Frame, JobId, JobSpec, JobStatus, TrustLevel};
use bellows_storage::{LogStore, Storage};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// A job waiting for, or holding, a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub spec: JobSpec,
    /// Author identity; empty for legacy/untagged jobs.
    pub author: String,
    pub trust: TrustLevel,
    pub is_fork: bool,
    pub approved_by: Option<String>,
    pub attempts: u32,
    /// 0 means retries are uncapped.
    pub max_retries: u32,
    pub enqueued_at: Instant,
}

impl QueuedJob {
    fn policy(&self) -> JobPolicy {
        JobPolicy {
            author: self.author.clone(),
            trust: self.trust,
            is_fork: self.is_fork,
            approved_by: self.approved_by.clone(),
        }
    }
}

struct Inflight {
    job: QueuedJob,
    worker: bellows_protocol::WorkerId,
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<QueuedJob>,
    inflight: HashMap<JobId, Inflight>,
}

pub struct Dispatcher {
    state: Mutex<DispatchState>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    hub: Arc<Hub>,
    storage: Storage,
    logs: Arc<LogStore>,
    fanout: Arc<LogFanout>,
    poster: Arc<dyn StatusPoster>,
}

impl Dispatcher {
    pub fn new(
        hub: Arc<Hub>,
        storage: Storage,
        logs: Arc<LogStore>,
        fanout: Arc<LogFanout>,
        poster: Arc<dyn StatusPoster>,
    ) -> Arc<Self> {
        // One slot: concurrent wakes coalesce into a single pass.
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Arc::new(Self {
            state: Mutex::new(DispatchState::default()),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            hub,
            storage,
            logs,
            fanout,
            poster,
        })
    }

    /// Kick the assignment loop. Safe from any thread, never blocks.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().expect("dispatcher lock poisoned").queue.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.state
            .lock()
            .expect("dispatcher lock poisoned")
            .inflight
            .len()
    }

    /// Append a job to the queue tail and kick the loop.
    pub async fn enqueue(&self, job: QueuedJob) {
        let job_id = job.spec.id.clone();
        if let Err(e) = self
            .storage
            .update_job_status(job_id.as_str(), JobStatus::Queued, None)
            .await
        {
            METRICS.inc_storage_errors();
            warn!("Failed to persist queued status for job {}: {}", job_id, e);
        }
        {
            let mut state = self.state.lock().expect("dispatcher lock poisoned");
            state.queue.push_back(job);
        }
        debug!("Job {} enqueued", job_id);
        self.wake();
    }

    /// Record an approval on a still-queued job and re-kick the loop.
    pub fn approve(&self, job_id: &JobId, approver: &str) -> bool {
        let found = {
            let mut state = self.state.lock().expect("dispatcher lock poisoned");
            match state.queue.iter_mut().find(|j| &j.spec.id == job_id) {
                Some(job) => {
                    job.approved_by = Some(approver.to_string());
                    true
                }
                None => false,
            }
        };
        if found {
            info!("Job {} approved by {}", job_id, approver);
            self.wake();
        }
        found
    }

    /// Assignment loop. Runs until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut wake_rx = self
            .wake_rx
            .lock()
            .expect("dispatcher lock poisoned")
            .take()
            .expect("dispatcher loop started twice");
        let mut tick = tokio::time::interval(DISPATCH_TICK);
        info!("Dispatcher loop started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {}
                _ = wake_rx.recv() => {}
            }
            self.dispatch_pass().await;
        }

        info!("Dispatcher loop stopped");
    }

    /// Sweep loop for stale workers and queue timeouts.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {}
            }
            self.sweep().await;
        }
    }

    /// One pass over the queue, front to back. Jobs with no eligible worker
    /// stay where they are; assigned jobs move to inflight before the frame
    /// is sent, so a worker is never double-booked within a pass.
    pub async fn dispatch_pass(&self) {
        let ids: Vec<JobId> = {
            let state = self.state.lock().expect("dispatcher lock poisoned");
            state.queue.iter().map(|j| j.spec.id.clone()).collect()
        };

        for job_id in ids {
            let Some((job, worker)) = self.try_claim(&job_id) else {
                continue;
            };

            if let Err(e) = self
                .storage
                .update_job_worker(job_id.as_str(), &worker.id)
                .await
            {
                METRICS.inc_storage_errors();
                warn!("Failed to persist worker for job {}: {}", job_id, e);
            }
            if let Err(e) = self
                .storage
                .update_job_status(job_id.as_str(), JobStatus::Assigned, None)
                .await
            {
                METRICS.inc_storage_errors();
                warn!("Failed to persist assigned status for job {}: {}", job_id, e);
            }

            self.hub.add_active_job(&worker.id, &job_id);

            match worker.send(Frame::JobAssign(job.spec.clone())) {
                Ok(()) => {
                    METRICS.inc_jobs_dispatched();
                    info!(
                        "Job {} dispatched to worker [{}] (attempt {})",
                        job_id,
                        worker.id,
                        job.attempts + 1
                    );
                }
                Err(e) => {
                    warn!(
                        "Failed to send job {} to worker [{}]: {}",
                        job_id, worker.id, e
                    );
                    self.hub.remove_active_job(&worker.id, &job_id);
                    let mut state = self.state.lock().expect("dispatcher lock poisoned");
                    state.inflight.remove(&job_id);
                    state.queue.push_front(job);
                }
            }
        }
    }

    /// Pop one job off the queue if a worker is eligible for it, recording it
    /// inflight. Returns None when the job vanished or nothing matches.
    fn try_claim(
        &self,
        job_id: &JobId,
    ) -> Option<(QueuedJob, Arc<crate::hub::ConnectedWorker>)> {
        let mut state = self.state.lock().expect("dispatcher lock poisoned");
        let pos = state.queue.iter().position(|j| &j.spec.id == job_id)?;
        let worker = self
            .hub
            .select_for_job(&state.queue[pos].spec.labels, &state.queue[pos].policy())?;
        let job = state.queue.remove(pos).expect("position just found");
        state.inflight.insert(
            job_id.clone(),
            Inflight {
                job: job.clone(),
                worker: worker.id.clone(),
            },
        );
        Some((job, worker))
    }

    /// Requeue an inflight job (worker rejected it, or its worker vanished).
    ///
    /// The job goes back to the queue front: it already paid its queuing
    /// latency once. When the attempt cap is hit the job is errored out
    /// instead. Returns false for jobs not inflight, which suppresses
    /// duplicates.
    pub async fn requeue_job(&self, job_id: &JobId, reason: &str) -> bool {
        let inflight = {
            let mut state = self.state.lock().expect("dispatcher lock poisoned");
            state.inflight.remove(job_id)
        };
        let Some(inflight) = inflight else {
            return false;
        };

        let mut job = inflight.job;
        job.attempts += 1;

        if job.max_retries > 0 && job.attempts >= job.max_retries {
            warn!(
                "Job {} gave out after {} attempts: {}",
                job_id, job.attempts, reason
            );
            METRICS.inc_jobs_failed();
            self.finalize_terminal(job_id, JobStatus::Error, None).await;
            return true;
        }

        info!(
            "Requeueing job {} (attempt {}): {}",
            job_id, job.attempts, reason
        );
        METRICS.inc_jobs_requeued();
        if let Err(e) = self
            .storage
            .update_job_status(job_id.as_str(), JobStatus::Queued, None)
            .await
        {
            METRICS.inc_storage_errors();
            warn!("Failed to persist queued status for job {}: {}", job_id, e);
        }
        {
            let mut state = self.state.lock().expect("dispatcher lock poisoned");
            state.queue.push_front(job);
        }
        self.wake();
        true
    }

    /// Requeue everything a vanished worker was holding.
    pub async fn requeue_worker_jobs(&self, job_ids: Vec<JobId>) {
        for job_id in job_ids {
            self.requeue_job(&job_id, "worker disconnected").await;
        }
        self.wake();
    }

    /// Remove a job from inflight on a terminal frame. Returns the job if it
    /// was actually tracked; None means a duplicate terminal frame.
    pub fn complete_job(&self, job_id: &JobId) -> Option<QueuedJob> {
        let mut state = self.state.lock().expect("dispatcher lock poisoned");
        state.inflight.remove(job_id).map(|inflight| inflight.job)
    }

    /// Cancel a job. Queued jobs are removed and finalized here; inflight
    /// jobs get a cancel frame forwarded to their worker, which reports the
    /// terminal state back.
    pub async fn cancel_job(&self, job_id: &JobId) -> bool {
        enum Found {
            Queued,
            Inflight(bellows_protocol::WorkerId),
            Missing,
        }

        let found = {
            let mut state = self.state.lock().expect("dispatcher lock poisoned");
            if let Some(pos) = state.queue.iter().position(|j| &j.spec.id == job_id) {
                state.queue.remove(pos);
                Found::Queued
            } else if let Some(inflight) = state.inflight.get(job_id) {
                Found::Inflight(inflight.worker.clone())
            } else {
                Found::Missing
            }
        };

        match found {
            Found::Queued => {
                info!("Job {} cancelled while queued", job_id);
                self.finalize_terminal(job_id, JobStatus::Cancelled, None).await;
                true
            }
            Found::Inflight(worker_id) => {
                info!("Forwarding cancel for job {} to worker [{}]", job_id, worker_id);
                if let Some(worker) = self.hub.get(&worker_id) {
                    if let Err(e) = worker.send(Frame::JobCancel(bellows_protocol::JobRef {
                        job_id: job_id.clone(),
                    })) {
                        warn!("Failed to forward cancel for job {}: {}", job_id, e);
                    }
                }
                true
            }
            Found::Missing => false,
        }
    }

    fn is_tracked(&self, job_id: &JobId) -> bool {
        let state = self.state.lock().expect("dispatcher lock poisoned");
        state.inflight.contains_key(job_id)
            || state.queue.iter().any(|j| &j.spec.id == job_id)
    }

    /// Drive a job to its terminal state everywhere outside the dispatcher:
    /// persist the status, close the log file, notify subscribers, post the
    /// commit status. Storage failures are logged and the rest proceeds.
    pub async fn finalize_terminal(
        &self,
        job_id: &JobId,
        status: JobStatus,
        exit_code: Option<i64>,
    ) {
        match self
            .storage
            .update_job_status(job_id.as_str(), status, exit_code)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Job {} already terminal in storage", job_id);
            }
            Err(e) => {
                METRICS.inc_storage_errors();
                error!("Failed to persist terminal status for job {}: {}", job_id, e);
            }
        }

        if let Err(e) = self.logs.finalize(job_id) {
            warn!("Failed to finalize logs for job {}: {}", job_id, e);
        }

        self.fanout
            .broadcast_job_complete(job_id, status, exit_code)
            .await;

        match self.storage.get_job(job_id.as_str()).await {
            Ok(Some(record)) => self.poster.post(&record),
            Ok(None) => warn!("Job {} missing from storage at completion", job_id),
            Err(e) => {
                METRICS.inc_storage_errors();
                warn!("Failed to load job {} for status posting: {}", job_id, e);
            }
        }
    }

    /// One sweep: evict workers past the heartbeat deadline and error out
    /// queue entries past the queue timeout.
    pub async fn sweep(&self) {
        for worker in self.hub.find_stale(STALE_AFTER) {
            warn!(
                "Evicting stale worker [{}]: last seen {:.0?} ago",
                worker.id,
                worker.last_ping_age()
            );

            // Out of the hub first, so requeued work cannot land back on the
            // zombie connection.
            self.hub.unregister(&worker.id);

            // Inflight jobs are recoverable; put them back through the
            // requeue policy.
            self.requeue_worker_jobs(worker.active_jobs()).await;

            // Anything storage still shows active on this worker slipped out
            // of our tracking; it is not recoverable.
            match self.storage.list_active_jobs_for_worker(&worker.id).await {
                Ok(orphans) => {
                    for orphan in orphans {
                        let orphan_id = JobId::from(orphan.id.as_str());
                        if self.is_tracked(&orphan_id) {
                            continue;
                        }
                        warn!(
                            "Storage shows active job {} on stale worker [{}] with no dispatcher record; marking it failed",
                            orphan_id, worker.id
                        );
                        METRICS.inc_jobs_failed();
                        self.finalize_terminal(&orphan_id, JobStatus::Error, None)
                            .await;
                    }
                }
                Err(e) => {
                    METRICS.inc_storage_errors();
                    warn!(
                        "Failed to list persisted jobs for stale worker [{}]: {}",
                        worker.id, e
                    );
                }
            }

            if let Err(e) = self.storage.update_worker_status(&worker.id, "offline").await {
                METRICS.inc_storage_errors();
                warn!("Failed to mark worker [{}] offline: {}", worker.id, e);
            }
            METRICS.inc_workers_evicted();
        }

        // Queue timeouts.
        let expired: Vec<QueuedJob> = {
            let mut state = self.state.lock().expect("dispatcher lock poisoned");
            let (expired, kept): (Vec<_>, Vec<_>) = state
                .queue
                .drain(..)
                .partition(|j| j.enqueued_at.elapsed() > QUEUE_TIMEOUT);
            state.queue = kept.into();
            expired
        };
        for job in expired {
            warn!(
                "Job {} spent {:.0?} in queue without a matching worker; giving up",
                job.spec.id,
                job.enqueued_at.elapsed()
            );
            METRICS.inc_jobs_failed();
            self.finalize_terminal(&job.spec.id, JobStatus::Error, None)
                .await;
        }
    }
}
