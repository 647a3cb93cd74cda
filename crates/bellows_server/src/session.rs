//! Per-connection worker session.
//!
//! One connection is one session: authenticate, wait for registration, then
//! pump frames both ways until the socket dies. On the way out every job the
//! worker still held goes back through the dispatcher's requeue policy.

use crate::auth::AuthError;
use crate::hub::ConnectedWorker;
use crate::metrics::METRICS;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use bellows_protocol::defaults::{PING_INTERVAL, PONG_TIMEOUT, WRITE_TIMEOUT};
use bellows_protocol::{
    AuthFailPayload, AuthOkPayload, Frame, JobRef, JobStatus, RegisterPayload, RegisteredPayload,
};
use bellows_storage::WorkerRecord;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct WorkerAuthQuery {
    pub token: Option<String>,
}

/// `GET /ws/worker` - workers connect here with a `token` query parameter.
pub async fn worker_ws(
    State(state): State<AppState>,
    Query(query): Query<WorkerAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_worker(state, query.token, socket))
}

async fn send_direct(socket: &mut WebSocket, frame: Frame) -> bool {
    match frame.encode() {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    }
}

async fn handle_worker(state: AppState, token: Option<String>, mut socket: WebSocket) {
    // Authentication. Failures close the connection; no jobs exist yet, so
    // there is nothing to recover.
    let identity = match token {
        Some(token) => state.auth.authenticate(&token).await,
        None => Err(AuthError::Missing),
    };
    let identity = match identity {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Worker auth failed: {}", e);
            send_direct(
                &mut socket,
                Frame::AuthFail(AuthFailPayload {
                    reason: e.to_string(),
                }),
            )
            .await;
            return;
        }
    };
    if !send_direct(
        &mut socket,
        Frame::AuthOk(AuthOkPayload {
            worker_id: identity.worker_id.clone(),
        }),
    )
    .await
    {
        return;
    }

    // Registration must arrive before anything else.
    let registration = match await_register(&mut socket).await {
        Some(reg) => reg,
        None => {
            info!(
                "Connection for [{}] dropped before registration",
                identity.worker_id
            );
            return;
        }
    };

    // User-signed connections only become addressable once the hostname is
    // known, so hub insertion waits until here and the id never mutates
    // while registered.
    let worker_id = if identity.user.is_some() {
        identity.worker_id.with_hostname(&registration.hostname)
    } else {
        identity.worker_id.clone()
    };
    let owner = registration.owner.clone().or_else(|| identity.user.clone());

    let record = WorkerRecord {
        id: worker_id.to_string(),
        hostname: registration.hostname.clone(),
        version: registration.version.clone(),
        mode: registration.mode.as_str().to_string(),
        owner: owner.clone(),
        labels_json: serde_json::to_string(&registration.labels).unwrap_or_else(|_| "[]".into()),
        status: "online".to_string(),
        last_seen: Utc::now(),
    };
    if let Err(e) = state.storage.upsert_worker(&record).await {
        METRICS.inc_storage_errors();
        warn!("Failed to persist worker [{}]: {}", worker_id, e);
    }

    let (worker, out_rx) = ConnectedWorker::new(worker_id.clone(), registration, owner);

    // REGISTERED goes onto the queue before the hub knows about the worker:
    // registration wakes the dispatcher, and an assign frame must not beat
    // the ack onto the wire.
    let _ = worker.send(Frame::Registered(RegisteredPayload {
        worker_id: worker_id.clone(),
    }));
    state.hub.register(worker.clone());
    METRICS.inc_workers_registered();

    info!(
        "Worker [{}] online: labels={:?} mode={} version={}",
        worker_id, worker.labels, worker.mode, worker.version
    );

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_pump(ws_tx, out_rx));

    read_pump(&state, &worker, ws_rx).await;

    // Teardown. Unregistration comes first so the very next dispatch pass
    // cannot hand the requeued jobs straight back to this dead connection;
    // it also closes the outbound queue, which stops the write pump.
    let active = worker.active_jobs();
    state.hub.unregister(&worker_id);
    if !active.is_empty() {
        info!(
            "Worker [{}] disconnected holding {} job(s); requeueing",
            worker_id,
            active.len()
        );
        state.dispatcher.requeue_worker_jobs(active).await;
    }
    if let Err(e) = state.storage.update_worker_status(&worker_id, "offline").await {
        METRICS.inc_storage_errors();
        warn!("Failed to mark worker [{}] offline: {}", worker_id, e);
    }
    let _ = writer.await;
    info!("Worker [{}] session ended", worker_id);
}

/// Wait for the REGISTER frame, dropping anything else. The whole handshake
/// shares one deadline.
async fn await_register(socket: &mut WebSocket) -> Option<RegisterPayload> {
    let deadline = tokio::time::sleep(PONG_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            message = socket.recv() => {
                let message = message?.ok()?;
                match message {
                    Message::Text(text) => match Frame::decode(&text) {
                        Ok(Frame::Register(reg)) => return Some(reg),
                        Ok(other) => {
                            debug!("Ignoring pre-registration frame '{}'", other.tag());
                        }
                        Err(e) => {
                            METRICS.inc_protocol_errors();
                            warn!("Dropping malformed pre-registration frame: {}", e);
                        }
                    },
                    Message::Close(_) => return None,
                    _ => {}
                }
            }
        }
    }
}

/// Sole consumer of the worker's outbound queue. Exits when the queue is
/// closed by unregistration or a write fails.
async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: tokio::sync::mpsc::Receiver<Frame>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    loop {
        tokio::select! {
            maybe = out_rx.recv() => {
                let Some(frame) = maybe else { break };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                let write = tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(Message::Text(text)));
                if !matches!(write.await, Ok(Ok(()))) {
                    break;
                }
            }
            _ = ping.tick() => {
                let write = tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(Message::Ping(Vec::new())));
                if !matches!(write.await, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

/// Read frames until the connection ends or goes silent past the pong
/// deadline. A single malformed frame is dropped, not fatal.
async fn read_pump(state: &AppState, worker: &Arc<ConnectedWorker>, mut ws_rx: SplitStream<WebSocket>) {
    loop {
        let message = match tokio::time::timeout(PONG_TIMEOUT, ws_rx.next()).await {
            Err(_) => {
                warn!(
                    "Worker [{}] silent for {:?}; dropping connection",
                    worker.id, PONG_TIMEOUT
                );
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!("Worker [{}] read error: {}", worker.id, e);
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match Frame::decode(&text) {
                Ok(frame) => handle_frame(state, worker, frame).await,
                Err(e) => {
                    METRICS.inc_protocol_errors();
                    warn!("Dropping malformed frame from worker [{}]: {}", worker.id, e);
                }
            },
            Message::Close(_) => return,
            // Transport pings and pongs only reset the deadline.
            _ => {}
        }
    }
}

async fn handle_frame(state: &AppState, worker: &Arc<ConnectedWorker>, frame: Frame) {
    match frame {
        Frame::Ping(ping) => {
            state.hub.update_last_ping(&worker.id, ping.active_jobs);
            if let Err(e) = state.storage.update_worker_last_seen(&worker.id).await {
                METRICS.inc_storage_errors();
                debug!("Failed to persist last-seen for worker [{}]: {}", worker.id, e);
            }
            let _ = worker.send(Frame::Pong);
        }

        Frame::JobAck(r) => {
            // Informational: the job already belongs to this worker.
            debug!("Worker [{}] accepted job {}", worker.id, r.job_id);
        }

        Frame::JobReject(reject) => {
            warn!(
                "Worker [{}] rejected job {}: {}",
                worker.id, reject.job_id, reject.reason
            );
            METRICS.inc_jobs_rejected();
            state.hub.remove_active_job(&worker.id, &reject.job_id);
            state.dispatcher.requeue_job(&reject.job_id, &reject.reason).await;
        }

        Frame::JobStarted(r) => {
            info!("Job {} started on worker [{}]", r.job_id, worker.id);
            if let Err(e) = state
                .storage
                .update_job_status(r.job_id.as_str(), JobStatus::Running, None)
                .await
            {
                METRICS.inc_storage_errors();
                warn!("Failed to persist running status for job {}: {}", r.job_id, e);
            }
        }

        Frame::LogChunk(chunk) => {
            if let Err(e) = state
                .logs
                .append_chunk(&chunk.job_id, chunk.stream, &chunk.data)
            {
                warn!("Failed to store log chunk for job {}: {}", chunk.job_id, e);
            }
            state
                .fanout
                .broadcast_log(&chunk.job_id, chunk.stream, &chunk.data)
                .await;
        }

        Frame::JobComplete(complete) => {
            let status = JobStatus::from_exit_code(complete.exit_code);
            info!(
                "Job {} finished on worker [{}]: {} (exit {}, {} ms)",
                complete.job_id, worker.id, status, complete.exit_code, complete.duration_ms
            );
            finish_job(state, worker, complete.job_id, status, Some(complete.exit_code)).await;
        }

        Frame::JobError(error) => {
            warn!(
                "Job {} errored on worker [{}] during {}: {}",
                error.job_id,
                worker.id,
                error.phase.as_str(),
                error.error
            );
            finish_job(state, worker, error.job_id, JobStatus::Error, None).await;
        }

        other => {
            warn!(
                "Unhandled frame '{}' from worker [{}]",
                other.tag(),
                worker.id
            );
        }
    }
}

/// Common terminal path for JOB_COMPLETE and JOB_ERROR. The first terminal
/// frame wins; any later one for the same job is ignored.
async fn finish_job(
    state: &AppState,
    worker: &Arc<ConnectedWorker>,
    job_id: bellows_protocol::JobId,
    status: JobStatus,
    exit_code: Option<i64>,
) {
    if state.dispatcher.complete_job(&job_id).is_none() {
        debug!(
            "Ignoring duplicate terminal frame for job {} from worker [{}]",
            job_id, worker.id
        );
        return;
    }

    match status {
        JobStatus::Success => METRICS.inc_jobs_completed(),
        _ => METRICS.inc_jobs_failed(),
    }

    state.dispatcher.finalize_terminal(&job_id, status, exit_code).await;
    state.hub.remove_active_job(&worker.id, &job_id);
    let _ = worker.send(Frame::Ack(JobRef { job_id }));
}
