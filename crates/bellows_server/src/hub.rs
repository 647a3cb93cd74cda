//! Authoritative in-memory registry of connected workers.
//!
//! All access is serialized by a single reader-writer lock; selection scans
//! dominate, so readers win. Event callbacks are always invoked after the
//! lock is released.

use bellows_protocol::defaults::OUTBOUND_QUEUE;
use bellows_protocol::{Capabilities, Frame, JobId, RegisterPayload, TrustLevel, WorkerId, WorkerMode};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("worker outbound queue is full")]
    Full,
    #[error("worker outbound queue is closed")]
    Closed,
}

/// A connected worker and its live attributes.
pub struct ConnectedWorker {
    pub id: WorkerId,
    pub labels: Vec<String>,
    pub capabilities: Capabilities,
    pub hostname: String,
    pub version: String,
    pub mode: WorkerMode,
    /// Owner identity; None for legacy tokens with no bound owner.
    pub owner: Option<String>,
    // Closed exactly once, by unregister.
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
    state: Mutex<WorkerState>,
}

struct WorkerState {
    active_jobs: HashSet<JobId>,
    last_ping: Instant,
}

impl ConnectedWorker {
    /// Build the live record from a registration payload. Returns the worker
    /// and the receiving end of its outbound queue (consumed by the write
    /// pump, the sole consumer).
    pub fn new(
        id: WorkerId,
        registration: RegisterPayload,
        owner: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let worker = Arc::new(Self {
            id,
            labels: registration.labels,
            capabilities: registration.capabilities,
            hostname: registration.hostname,
            version: registration.version,
            mode: registration.mode,
            owner,
            sender: Mutex::new(Some(tx)),
            state: Mutex::new(WorkerState {
                active_jobs: HashSet::new(),
                last_ping: Instant::now(),
            }),
        });
        (worker, rx)
    }

    /// Non-blocking send onto the outbound queue.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        let guard = self.sender.lock().expect("worker sender lock poisoned");
        let Some(sender) = guard.as_ref() else {
            return Err(SendError::Closed);
        };
        sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Close the outbound queue. Idempotent; the write pump exits once the
    /// queue drains.
    fn close(&self) {
        self.sender
            .lock()
            .expect("worker sender lock poisoned")
            .take();
    }

    pub fn has_labels(&self, required: &[String]) -> bool {
        required.iter().all(|label| self.labels.contains(label))
    }

    /// Free job slots. Concurrency is 1 in this design, so this is 0 or 1.
    pub fn available_capacity(&self) -> usize {
        let state = self.state.lock().expect("worker state lock poisoned");
        1usize.saturating_sub(state.active_jobs.len())
    }

    pub fn is_idle(&self) -> bool {
        self.available_capacity() > 0
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        let state = self.state.lock().expect("worker state lock poisoned");
        state.active_jobs.iter().cloned().collect()
    }

    pub fn last_ping_age(&self) -> Duration {
        let state = self.state.lock().expect("worker state lock poisoned");
        state.last_ping.elapsed()
    }

    fn add_job(&self, job_id: JobId) {
        let mut state = self.state.lock().expect("worker state lock poisoned");
        state.active_jobs.insert(job_id);
    }

    fn remove_job(&self, job_id: &JobId) -> bool {
        let mut state = self.state.lock().expect("worker state lock poisoned");
        state.active_jobs.remove(job_id)
    }

    fn touch(&self, reported_jobs: Vec<JobId>) {
        let mut state = self.state.lock().expect("worker state lock poisoned");
        state.last_ping = Instant::now();
        // The worker's report is authoritative; recover from any drift.
        state.active_jobs = reported_jobs.into_iter().collect();
    }
}

/// Scheduling attributes of a job, as the selector sees them.
#[derive(Debug, Clone, Default)]
pub struct JobPolicy {
    /// Empty for legacy/untagged jobs.
    pub author: String,
    pub trust: TrustLevel,
    pub is_fork: bool,
    pub approved_by: Option<String>,
}

type WorkerCallback = Box<dyn Fn(&WorkerId) + Send + Sync>;
type JobCallback = Box<dyn Fn(&WorkerId, &JobId) + Send + Sync>;

/// Event callbacks fired on registry transitions, outside the registry lock.
#[derive(Default)]
pub struct HubCallbacks {
    pub on_connected: Option<WorkerCallback>,
    pub on_disconnected: Option<WorkerCallback>,
    pub on_job_started: Option<JobCallback>,
    pub on_job_finished: Option<JobCallback>,
}

#[derive(Default)]
pub struct Hub {
    workers: RwLock<HashMap<WorkerId, Arc<ConnectedWorker>>>,
    callbacks: RwLock<HubCallbacks>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callbacks(&self, callbacks: HubCallbacks) {
        *self.callbacks.write().expect("hub callbacks lock poisoned") = callbacks;
    }

    /// Insert a worker. A worker id appears at most once: an existing entry
    /// under the same id is closed and replaced.
    pub fn register(&self, worker: Arc<ConnectedWorker>) {
        let id = worker.id.clone();
        let previous = {
            let mut workers = self.workers.write().expect("hub lock poisoned");
            workers.insert(id.clone(), worker)
        };
        if let Some(previous) = previous {
            warn!("Replacing existing registration for worker [{}]", id);
            previous.close();
        }
        info!("Worker registered [{}]", id);

        let callbacks = self.callbacks.read().expect("hub callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_connected {
            cb(&id);
        }
    }

    /// Remove a worker and close its outbound queue. Idempotent.
    pub fn unregister(&self, id: &WorkerId) {
        let removed = {
            let mut workers = self.workers.write().expect("hub lock poisoned");
            workers.remove(id)
        };
        let Some(worker) = removed else {
            return;
        };
        worker.close();
        info!("Worker unregistered [{}]", id);

        let callbacks = self.callbacks.read().expect("hub callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_disconnected {
            cb(id);
        }
    }

    pub fn get(&self, id: &WorkerId) -> Option<Arc<ConnectedWorker>> {
        self.workers.read().expect("hub lock poisoned").get(id).cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().expect("hub lock poisoned").len()
    }

    /// Workers with a free slot carrying every requested label, ordered by
    /// available capacity descending then worker id ascending.
    pub fn find_available(&self, labels: &[String]) -> Vec<Arc<ConnectedWorker>> {
        let workers = self.workers.read().expect("hub lock poisoned");
        let mut available: Vec<Arc<ConnectedWorker>> = workers
            .values()
            .filter(|w| w.is_idle() && w.has_labels(labels))
            .cloned()
            .collect();
        available.sort_by(|a, b| {
            b.available_capacity()
                .cmp(&a.available_capacity())
                .then_with(|| a.id.cmp(&b.id))
        });
        available
    }

    /// Trust-aware worker selection.
    ///
    /// The author's own personal worker wins when it is free; external fork
    /// jobs wait for approval; a known-but-offline personal worker defers the
    /// job; otherwise shared workers take trusted work, and ownerless
    /// personal workers absorb legacy jobs.
    pub fn select_for_job(&self, labels: &[String], policy: &JobPolicy) -> Option<Arc<ConnectedWorker>> {
        let available = self.find_available(labels);

        if policy.author.is_empty() {
            return available.into_iter().next();
        }

        for worker in &available {
            if worker.mode == WorkerMode::Personal
                && worker.owner.as_deref() == Some(policy.author.as_str())
            {
                return Some(worker.clone());
            }
        }

        if policy.is_fork && policy.trust == TrustLevel::External && policy.approved_by.is_none() {
            return None;
        }

        // The author has a personal worker connected (busy or mismatched):
        // hold the job for it rather than spilling onto shared capacity.
        let has_personal_worker = {
            let workers = self.workers.read().expect("hub lock poisoned");
            workers.values().any(|w| {
                w.mode == WorkerMode::Personal
                    && w.owner.as_deref() == Some(policy.author.as_str())
            })
        };
        if has_personal_worker {
            return None;
        }

        for worker in &available {
            if worker.mode == WorkerMode::Shared {
                return Some(worker.clone());
            }
        }

        for worker in &available {
            if worker.mode == WorkerMode::Personal && worker.owner.is_none() {
                return Some(worker.clone());
            }
        }

        None
    }

    /// Mark a job active on a worker. Invoked by the dispatcher before the
    /// assign frame is sent, and undone if the send fails.
    pub fn add_active_job(&self, worker_id: &WorkerId, job_id: &JobId) {
        let Some(worker) = self.get(worker_id) else {
            return;
        };
        worker.add_job(job_id.clone());

        let callbacks = self.callbacks.read().expect("hub callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_job_started {
            cb(worker_id, job_id);
        }
    }

    /// Release a worker's job slot.
    pub fn remove_active_job(&self, worker_id: &WorkerId, job_id: &JobId) {
        let Some(worker) = self.get(worker_id) else {
            return;
        };
        if !worker.remove_job(job_id) {
            return;
        }

        let callbacks = self.callbacks.read().expect("hub callbacks lock poisoned");
        if let Some(cb) = &callbacks.on_job_finished {
            cb(worker_id, job_id);
        }
    }

    /// Refresh a worker's heartbeat and replace its active set with what it
    /// actually reports.
    pub fn update_last_ping(&self, worker_id: &WorkerId, reported_jobs: Vec<JobId>) {
        if let Some(worker) = self.get(worker_id) {
            worker.touch(reported_jobs);
        }
    }

    /// Workers whose last ping is older than `max_age`.
    pub fn find_stale(&self, max_age: Duration) -> Vec<Arc<ConnectedWorker>> {
        let workers = self.workers.read().expect("hub lock poisoned");
        workers
            .values()
            .filter(|w| w.last_ping_age() > max_age)
            .cloned()
            .collect()
    }

    /// Best-effort send to every worker. Workers with a full queue are
    /// skipped; anything that must arrive goes through the per-session path.
    pub fn broadcast(&self, frame: &Frame) {
        let workers: Vec<Arc<ConnectedWorker>> = {
            let guard = self.workers.read().expect("hub lock poisoned");
            guard.values().cloned().collect()
        };
        for worker in workers {
            if let Err(e) = worker.send(frame.clone()) {
                debug!("Skipping broadcast to worker [{}]: {}", worker.id, e);
            }
        }
    }

    /// Ask a worker to finish its current job and disconnect.
    pub fn drain_worker(&self, id: &WorkerId) -> Result<(), SendError> {
        self.get(id).ok_or(SendError::Closed)?.send(Frame::WorkerDrain)
    }

    /// Order a worker to stop immediately.
    pub fn kill_worker(&self, id: &WorkerId) -> Result<(), SendError> {
        self.get(id).ok_or(SendError::Closed)?.send(Frame::WorkerKill)
    }
}
