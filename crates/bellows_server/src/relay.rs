//! Webhook relay for self-hosted instances.
//!
//! A relay is a self-hosted server that connects out to this service and
//! receives its forge webhooks tunneled back over the connection. Inbound
//! HTTP on `/relay/<id>/...` becomes a RELAY_REQUEST frame with a minted
//! request id; the matching RELAY_RESPONSE completes a one-shot slot and the
//! original HTTP response is reconstructed from it.

use crate::metrics::METRICS;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bellows_protocol::defaults::{OUTBOUND_QUEUE, PING_INTERVAL, RELAY_TIMEOUT, WRITE_TIMEOUT};
use bellows_protocol::{
    Frame, RelayId, RelayReadyPayload, RelayRequestPayload, RelayResponsePayload, RequestId,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// One connected relay.
pub struct Relay {
    pub id: RelayId,
    pub owner: String,
    sender: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<RelayResponsePayload>>>,
}

impl Relay {
    fn new(id: RelayId, owner: String) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (
            Arc::new(Self {
                id,
                owner,
                sender: tx,
                pending: Mutex::new(HashMap::new()),
            }),
            rx,
        )
    }

    /// Queue a frame for the relay; full queue means the relay is overloaded
    /// and the caller reports unavailability.
    fn try_send(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.sender.try_send(frame)
    }

    fn register_pending(&self, id: RequestId) -> oneshot::Receiver<RelayResponsePayload> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("relay pending lock poisoned")
            .insert(id, tx);
        rx
    }

    fn take_pending(&self, id: &RequestId) -> Option<oneshot::Sender<RelayResponsePayload>> {
        self.pending
            .lock()
            .expect("relay pending lock poisoned")
            .remove(id)
    }

    /// Complete the slot for a response. False when the request already
    /// timed out.
    fn complete(&self, response: RelayResponsePayload) -> bool {
        match self.take_pending(&response.id) {
            Some(slot) => slot.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every pending slot; waiting HTTP callers observe the closed
    /// channel.
    fn fail_all_pending(&self) {
        self.pending
            .lock()
            .expect("relay pending lock poisoned")
            .clear();
    }
}

/// Registry of connected relays; a smaller sibling of the worker hub.
#[derive(Default)]
pub struct RelayHub {
    relays: RwLock<HashMap<RelayId, Arc<Relay>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &RelayId) -> Option<Arc<Relay>> {
        self.relays.read().expect("relay hub lock poisoned").get(id).cloned()
    }

    pub fn relay_count(&self) -> usize {
        self.relays.read().expect("relay hub lock poisoned").len()
    }

    fn register(&self, relay: Arc<Relay>) {
        let mut relays = self.relays.write().expect("relay hub lock poisoned");
        relays.insert(relay.id.clone(), relay);
    }

    fn unregister(&self, id: &RelayId) {
        let removed = {
            let mut relays = self.relays.write().expect("relay hub lock poisoned");
            relays.remove(id)
        };
        if let Some(relay) = removed {
            relay.fail_all_pending();
            info!("Relay unregistered [{}]", id);
        }
    }
}

/// Headers worth carrying through the tunnel: content negotiation plus the
/// forge event/signature/delivery headers.
fn forward_header(name: &str) -> bool {
    matches!(name, "content-type" | "user-agent" | "x-hub-signature-256")
        || name.starts_with("x-github-")
        || name.starts_with("x-gitlab-")
        || name.starts_with("x-forgejo-")
        || name.starts_with("x-gitea-")
}

fn selected_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            if !forward_header(&name) {
                return None;
            }
            value.to_str().ok().map(|v| (name, v.to_string()))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct RelayAuthQuery {
    pub token: Option<String>,
}

/// `GET /ws/relay` - a self-hosted server connects here to receive tunneled
/// webhooks.
pub async fn relay_ws(
    State(state): State<AppState>,
    Query(query): Query<RelayAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_relay(state, query.token, socket))
}

async fn handle_relay(state: AppState, token: Option<String>, mut socket: WebSocket) {
    let identity = match token {
        Some(token) => state.auth.authenticate(&token).await,
        None => Err(crate::auth::AuthError::Missing),
    };
    let identity = match identity {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Relay auth failed: {}", e);
            let frame = Frame::AuthFail(bellows_protocol::AuthFailPayload {
                reason: e.to_string(),
            });
            if let Ok(text) = frame.encode() {
                let _ = socket.send(Message::Text(text)).await;
            }
            return;
        }
    };

    let relay_id = RelayId::mint();
    let owner = identity
        .user
        .clone()
        .unwrap_or_else(|| identity.worker_id.to_string());
    let (relay, mut out_rx) = Relay::new(relay_id.clone(), owner);
    state.relays.register(relay.clone());
    info!("Relay connected [{}] for {}", relay_id, relay.owner);

    let ready = Frame::RelayReady(RelayReadyPayload {
        relay_id: relay_id.clone(),
        ingress_url: format!("{}/relay/{}", state.config.public_url, relay_id),
    });

    let (mut ws_tx, mut ws_rx) = socket.split();
    if let Ok(text) = ready.encode() {
        if ws_tx.send(Message::Text(text)).await.is_err() {
            state.relays.unregister(&relay_id);
            return;
        }
    }

    // Write pump: drain the outbound queue, keep the connection alive.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                maybe = out_rx.recv() => {
                    let Some(frame) = maybe else { break };
                    let Ok(text) = frame.encode() else { continue };
                    let write = tokio::time::timeout(WRITE_TIMEOUT, ws_tx.send(Message::Text(text)));
                    match write.await {
                        Ok(Ok(())) => {}
                        _ => break,
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
    });

    // Read loop: only RELAY_RESPONSE frames are meaningful here.
    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!("Relay [{}] read error: {}", relay_id, e);
                break;
            }
        };
        match message {
            Message::Text(text) => match Frame::decode(&text) {
                Ok(Frame::RelayResponse(response)) => {
                    if !relay.complete(response) {
                        debug!("Relay [{}] answered an expired request", relay_id);
                    }
                }
                Ok(other) => {
                    debug!("Ignoring frame '{}' from relay [{}]", other.tag(), relay_id);
                }
                Err(e) => {
                    METRICS.inc_protocol_errors();
                    warn!("Dropping malformed frame from relay [{}]: {}", relay_id, e);
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.relays.unregister(&relay_id);
    writer.abort();
}

/// Any-method handler for `/relay/:relay_id/*rest`: tunnel the request and
/// wait for the response.
pub async fn relay_ingress(
    State(state): State<AppState>,
    Path((relay_id, rest)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    METRICS.inc_relay_requests();
    let relay_id = RelayId::new(relay_id);
    let Some(relay) = state.relays.get(&relay_id) else {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay not connected").into_response();
    };

    let mut path = format!("/{}", rest);
    if let Some(query) = query {
        path.push('?');
        path.push_str(&query);
    }

    let request_id = RequestId::mint();
    let request = RelayRequestPayload {
        id: request_id.clone(),
        method: method.as_str().to_string(),
        path,
        headers: selected_headers(&headers),
        body: BASE64.encode(&body),
    };

    let slot = relay.register_pending(request_id.clone());
    if relay.try_send(Frame::RelayRequest(request)).is_err() {
        relay.take_pending(&request_id);
        return (StatusCode::SERVICE_UNAVAILABLE, "relay queue full").into_response();
    }

    let response = match tokio::time::timeout(RELAY_TIMEOUT, slot).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => {
            // Slot dropped: the relay disconnected mid-request.
            return (StatusCode::SERVICE_UNAVAILABLE, "relay disconnected").into_response();
        }
        Err(_) => {
            METRICS.inc_relay_timeouts();
            relay.take_pending(&request_id);
            return (StatusCode::GATEWAY_TIMEOUT, "relay timed out").into_response();
        }
    };

    let body = match BASE64.decode(response.body.as_bytes()) {
        Ok(body) => body,
        Err(e) => {
            warn!("Relay [{}] returned undecodable body: {}", relay_id, e);
            return (StatusCode::BAD_GATEWAY, "bad relay response").into_response();
        }
    };

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        // Hop-by-hop headers never cross the tunnel.
        if matches!(name.as_str(), "connection" | "transfer-encoding" | "keep-alive") {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            continue;
        };
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
