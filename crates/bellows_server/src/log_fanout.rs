//! Per-job log broadcasting to any number of viewers.
//!
//! The worker session is the sole producer of chunks for one job and calls
//! `broadcast_log` in arrival order, so every surviving viewer sees chunks
//! in production order. Completion snapshots the subscriber set, then writes
//! and closes outside the lock so a slow viewer cannot stall the rest.

use crate::auth::AuthError;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use bellows_protocol::{JobId, JobStatus, ViewerFrame};
use bellows_storage::LogEntry;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

type ViewerSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

struct Viewer {
    id: u64,
    sink: ViewerSink,
}

#[derive(Default)]
pub struct LogFanout {
    subs: RwLock<HashMap<JobId, Vec<Viewer>>>,
    next_viewer: AtomicU64,
}

impl LogFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.subs
            .read()
            .await
            .get(job_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Wire a viewer socket up for a job: replay everything stored so far,
    /// then either close out a terminal job or join the live subscriber set.
    pub async fn attach(
        self: &Arc<Self>,
        job_id: JobId,
        status: JobStatus,
        exit_code: Option<i64>,
        backfill: Vec<LogEntry>,
        socket: WebSocket,
    ) {
        let (mut sink, mut stream) = socket.split();

        for entry in backfill {
            let frame = ViewerFrame::Log {
                stream: entry.stream,
                data: entry.data,
                time: entry.time,
            };
            let Ok(text) = frame.encode() else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }

        if status.is_terminal() {
            let frame = ViewerFrame::Status { status, exit_code };
            if let Ok(text) = frame.encode() {
                let _ = sink.send(Message::Text(text)).await;
            }
            let _ = sink.close().await;
            return;
        }

        let viewer_id = self.next_viewer.fetch_add(1, Ordering::Relaxed);
        {
            let mut subs = self.subs.write().await;
            subs.entry(job_id.clone()).or_default().push(Viewer {
                id: viewer_id,
                sink: Arc::new(Mutex::new(sink)),
            });
        }
        debug!("Viewer {} subscribed to job {}", viewer_id, job_id);

        // Reader exists only to notice the viewer going away.
        let fanout = self.clone();
        tokio::spawn(async move {
            while let Some(Ok(_)) = stream.next().await {}
            fanout.detach(&job_id, viewer_id).await;
        });
    }

    async fn detach(&self, job_id: &JobId, viewer_id: u64) {
        let mut subs = self.subs.write().await;
        if let Some(viewers) = subs.get_mut(job_id) {
            viewers.retain(|v| v.id != viewer_id);
            if viewers.is_empty() {
                subs.remove(job_id);
            }
        }
        debug!("Viewer {} left job {}", viewer_id, job_id);
    }

    /// Push one live chunk to every subscriber of the job. Serialized once;
    /// per-viewer failures are tolerated, the viewer's own reader prunes it.
    pub async fn broadcast_log(
        &self,
        job_id: &JobId,
        stream: bellows_protocol::LogStream,
        data: &str,
    ) {
        let subs = self.subs.read().await;
        let Some(viewers) = subs.get(job_id) else {
            return;
        };
        let frame = ViewerFrame::Log {
            stream,
            data: data.to_string(),
            time: chrono::Utc::now(),
        };
        let Ok(text) = frame.encode() else { return };
        for viewer in viewers {
            let mut sink = viewer.sink.lock().await;
            if let Err(e) = sink.send(Message::Text(text.clone())).await {
                debug!("Dropping log write to viewer {}: {}", viewer.id, e);
            }
        }
    }

    /// Tell every subscriber the job is done, close their connections, and
    /// forget the subscription.
    pub async fn broadcast_job_complete(
        &self,
        job_id: &JobId,
        status: JobStatus,
        exit_code: Option<i64>,
    ) {
        let viewers = {
            let mut subs = self.subs.write().await;
            subs.remove(job_id)
        };
        let Some(viewers) = viewers else {
            return;
        };
        info!(
            "Closing {} viewer(s) of job {}: {}",
            viewers.len(),
            job_id,
            status
        );

        let frame = ViewerFrame::Status { status, exit_code };
        let Ok(text) = frame.encode() else { return };
        for viewer in viewers {
            let mut sink = viewer.sink.lock().await;
            if let Err(e) = sink.send(Message::Text(text.clone())).await {
                debug!("Failed to deliver completion to viewer {}: {}", viewer.id, e);
            }
            let _ = sink.close().await;
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ViewerQuery {
    pub token: Option<String>,
}

/// `GET /ws/logs/:job_id` - read-only live log stream.
pub async fn logs_ws(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ViewerQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_viewer(state, job_id, query.token, socket))
}

async fn handle_viewer(state: AppState, job_id: String, token: Option<String>, socket: WebSocket) {
    let job = match state.storage.get_job(&job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            debug!("Viewer asked for unknown job {}", job_id);
            return;
        }
        Err(e) => {
            warn!("Failed to load job {} for viewer: {}", job_id, e);
            return;
        }
    };

    // Private repos expose logs to their owner only.
    match state.storage.get_repo(&job.repo_id).await {
        Ok(Some(repo)) if repo.private => {
            let viewer = match token {
                Some(token) => state.auth.authenticate(&token).await,
                None => Err(AuthError::Missing),
            };
            let allowed = matches!(&viewer, Ok(identity) if identity.user.as_deref() == Some(repo.owner.as_str()));
            if !allowed {
                info!("Refusing log viewer for private job {}", job_id);
                return;
            }
        }
        Ok(_) => {}
        Err(e) => {
            warn!("Failed to load repo for job {}: {}", job_id, e);
            return;
        }
    }

    let id = JobId::from(job_id.as_str());
    let backfill = match state.logs.read_entries(&id) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to read stored logs for job {}: {}", job_id, e);
            Vec::new()
        }
    };

    state
        .fanout
        .attach(id, job.status(), job.exit_code, backfill, socket)
        .await;
}
