//! End-to-end tests for the control plane: real server, real WebSockets.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bellows_protocol::{
    Capabilities, Forge, Frame, JobCompletePayload, JobRef, JobRejectPayload, JobSpec,
    JobStatus, LogChunkPayload, LogStream, PingPayload, RegisterPayload, RelayResponsePayload,
    TrustLevel, WorkerMode,
};
use bellows_server::auth::hash_token;
use bellows_server::intake::{CommandKind, EnqueueRequest};
use bellows_server::{AppState, Server, ServerConfig};
use bellows_storage::{RepoRecord, TokenRecord};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    _dir: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::with_defaults(
        "127.0.0.1:0".parse().unwrap(),
        dir.path().to_path_buf(),
    );
    config.token_secret = Some("test-secret".to_string());

    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr;
    let state = server.state.clone();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestServer {
        addr,
        state,
        _dir: dir,
    }
}

async fn seed_repo(state: &AppState, id: &str, owner: &str, max_retries: i64) -> RepoRecord {
    let repo = RepoRecord {
        id: id.to_string(),
        name: "widgets".to_string(),
        clone_url: "https://forge.example/widgets.git".to_string(),
        private: false,
        owner: owner.to_string(),
        build_command: "make test".to_string(),
        release_command: None,
        max_retries,
    };
    state.storage.create_repo(&repo).await.unwrap();
    repo
}

async fn seed_worker_token(state: &AppState, token: &str, worker_id: &str) {
    state
        .storage
        .create_token(&TokenRecord {
            id: format!("tok-{}", worker_id),
            token_hash: hash_token(token),
            worker_id: Some(worker_id.to_string()),
            description: String::new(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
}

async fn send_frame(ws: &mut WsClient, frame: Frame) {
    ws.send(WsMessage::text(frame.encode().unwrap()))
        .await
        .unwrap();
}

/// Next protocol frame, skipping transport keep-alives.
async fn recv_frame(ws: &mut WsClient) -> Frame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("read error");
        match message {
            WsMessage::Text(text) => return Frame::decode(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

/// Like `recv_frame` but expects silence for the given window.
async fn expect_no_frame(ws: &mut WsClient, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await;
    if let Ok(text) = result {
        panic!("expected silence, got frame: {}", text);
    }
}

/// Connect and register a worker; returns the socket past the handshake.
async fn connect_worker(
    server: &TestServer,
    token: &str,
    labels: &[&str],
    mode: WorkerMode,
    owner: Option<&str>,
) -> WsClient {
    let url = format!("ws://{}/ws/worker?token={}", server.addr, token);
    let (mut ws, _) = connect_async(url).await.unwrap();

    match recv_frame(&mut ws).await {
        Frame::AuthOk(_) => {}
        other => panic!("expected auth_ok, got {}", other.tag()),
    }

    send_frame(
        &mut ws,
        Frame::Register(RegisterPayload {
            labels: labels.iter().map(|s| s.to_string()).collect(),
            capabilities: Capabilities { container: true },
            mode,
            owner: owner.map(|s| s.to_string()),
            hostname: "buildbox".to_string(),
            version: "0.1.0".to_string(),
        }),
    )
    .await;

    match recv_frame(&mut ws).await {
        Frame::Registered(_) => {}
        other => panic!("expected registered, got {}", other.tag()),
    }
    ws
}

fn enqueue_request(repo: &RepoRecord, sender: &str, trust: TrustLevel, labels: &[&str]) -> EnqueueRequest {
    EnqueueRequest {
        repo: repo.clone(),
        ref_name: "refs/heads/main".to_string(),
        branch: Some("main".to_string()),
        tag: None,
        commit: "deadbeefcafe".to_string(),
        sender: sender.to_string(),
        trust,
        is_fork: false,
        approved_by: None,
        clone_token: None,
        command: CommandKind::Build,
        env: HashMap::new(),
        labels: labels.iter().map(|s| s.to_string()).collect(),
        forge: Forge::Forgejo,
    }
}

fn expect_assign(frame: Frame) -> JobSpec {
    match frame {
        Frame::JobAssign(spec) => spec,
        other => panic!("expected job_assign, got {}", other.tag()),
    }
}

#[tokio::test]
async fn happy_path_build_with_live_viewer() {
    let server = start_server().await;
    let repo = seed_repo(&server.state, "repo-1", "alice", 3).await;
    seed_worker_token(&server.state, "w-token", "alice-box").await;

    let mut worker = connect_worker(
        &server,
        "w-token",
        &["linux"],
        WorkerMode::Personal,
        Some("alice"),
    )
    .await;

    let job_id = server
        .state
        .intake
        .enqueue_job(enqueue_request(&repo, "alice", TrustLevel::Owner, &["linux"]))
        .await
        .unwrap();

    let spec = expect_assign(recv_frame(&mut worker).await);
    assert_eq!(spec.id, job_id);
    assert_eq!(spec.command, "make test");
    assert_eq!(spec.repo.clone_url, "https://forge.example/widgets.git");

    send_frame(&mut worker, Frame::JobStarted(JobRef { job_id: job_id.clone() })).await;
    send_frame(
        &mut worker,
        Frame::LogChunk(LogChunkPayload {
            job_id: job_id.clone(),
            stream: LogStream::Stdout,
            data: "compiling\n".to_string(),
        }),
    )
    .await;

    // Give the chunk time to land in the store, then attach a viewer; it
    // must see the backfill first, live chunks after.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let viewer_url = format!("ws://{}/ws/logs/{}", server.addr, job_id);
    let (mut viewer, _) = connect_async(viewer_url).await.unwrap();

    let first: serde_json::Value = serde_json::from_str(
        viewer
            .next()
            .await
            .unwrap()
            .unwrap()
            .to_text()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(first["type"], "log");
    assert_eq!(first["data"], "compiling\n");
    assert_eq!(first["stream"], "stdout");

    // Backfill arrived; give the subscription itself a beat to settle before
    // live traffic starts.
    tokio::time::sleep(Duration::from_millis(100)).await;

    send_frame(
        &mut worker,
        Frame::LogChunk(LogChunkPayload {
            job_id: job_id.clone(),
            stream: LogStream::Stderr,
            data: "warning: slow test\n".to_string(),
        }),
    )
    .await;
    send_frame(
        &mut worker,
        Frame::JobComplete(JobCompletePayload {
            job_id: job_id.clone(),
            exit_code: 0,
            duration_ms: 1234,
        }),
    )
    .await;

    // Worker gets the terminal ack.
    match recv_frame(&mut worker).await {
        Frame::Ack(r) => assert_eq!(r.job_id, job_id),
        other => panic!("expected ack, got {}", other.tag()),
    }

    // Viewer sees the live chunk, then the status, then the close.
    let second: serde_json::Value = serde_json::from_str(
        viewer.next().await.unwrap().unwrap().to_text().unwrap(),
    )
    .unwrap();
    assert_eq!(second["type"], "log");
    assert_eq!(second["stream"], "stderr");

    let status: serde_json::Value = serde_json::from_str(
        viewer.next().await.unwrap().unwrap().to_text().unwrap(),
    )
    .unwrap();
    assert_eq!(status["type"], "status");
    assert_eq!(status["status"], "success");
    assert_eq!(status["exit_code"], 0);

    match viewer.next().await {
        None | Some(Ok(WsMessage::Close(_))) => {}
        other => panic!("expected close after status, got {:?}", other),
    }

    let record = server
        .state
        .storage
        .get_job(job_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status(), JobStatus::Success);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(server.state.dispatcher.inflight_len(), 0);
}

#[tokio::test]
async fn label_mismatch_waits_for_matching_worker() {
    let server = start_server().await;
    let repo = seed_repo(&server.state, "repo-1", "alice", 3).await;
    seed_worker_token(&server.state, "linux-token", "linux-box").await;
    seed_worker_token(&server.state, "windows-token", "windows-box").await;

    let mut linux_worker =
        connect_worker(&server, "linux-token", &["linux"], WorkerMode::Shared, None).await;

    let job_id = server
        .state
        .intake
        .enqueue_job(enqueue_request(&repo, "alice", TrustLevel::Owner, &["windows"]))
        .await
        .unwrap();

    expect_no_frame(&mut linux_worker, Duration::from_millis(1500)).await;
    assert_eq!(server.state.dispatcher.queued_len(), 1);

    let mut windows_worker =
        connect_worker(&server, "windows-token", &["windows"], WorkerMode::Shared, None).await;
    let spec = expect_assign(recv_frame(&mut windows_worker).await);
    assert_eq!(spec.id, job_id);
}

#[tokio::test]
async fn vanished_worker_requeues_to_replacement() {
    let server = start_server().await;
    let repo = seed_repo(&server.state, "repo-1", "alice", 5).await;
    seed_worker_token(&server.state, "t1", "box-1").await;
    seed_worker_token(&server.state, "t2", "box-2").await;

    let mut first = connect_worker(&server, "t1", &["linux"], WorkerMode::Shared, None).await;

    let job_id = server
        .state
        .intake
        .enqueue_job(enqueue_request(&repo, "alice", TrustLevel::Owner, &["linux"]))
        .await
        .unwrap();
    let spec = expect_assign(recv_frame(&mut first).await);
    assert_eq!(spec.id, job_id);
    send_frame(&mut first, Frame::JobStarted(JobRef { job_id: job_id.clone() })).await;

    // The worker dies mid-job.
    drop(first);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.state.hub.worker_count(), 0);
    assert_eq!(server.state.dispatcher.inflight_len(), 0);
    assert_eq!(server.state.dispatcher.queued_len(), 1);

    // A fresh worker with the same labels picks it up.
    let mut second = connect_worker(&server, "t2", &["linux"], WorkerMode::Shared, None).await;
    let spec = expect_assign(recv_frame(&mut second).await);
    assert_eq!(spec.id, job_id);
}

#[tokio::test]
async fn fork_job_waits_for_approval() {
    let server = start_server().await;
    let repo = seed_repo(&server.state, "repo-1", "alice", 3).await;
    seed_worker_token(&server.state, "alice-token", "alice-box").await;
    seed_worker_token(&server.state, "shared-token", "shared-box").await;

    let mut alice_worker = connect_worker(
        &server,
        "alice-token",
        &["linux"],
        WorkerMode::Personal,
        Some("alice"),
    )
    .await;
    let mut shared_worker =
        connect_worker(&server, "shared-token", &["linux"], WorkerMode::Shared, None).await;

    let mut request = enqueue_request(&repo, "bob", TrustLevel::External, &["linux"]);
    request.is_fork = true;
    let job_id = server.state.intake.enqueue_job(request).await.unwrap();

    // Nobody runs unapproved fork code.
    expect_no_frame(&mut alice_worker, Duration::from_millis(1500)).await;
    expect_no_frame(&mut shared_worker, Duration::from_millis(100)).await;

    server.state.intake.approve(&job_id, "alice").await.unwrap();

    // Approval sends it to shared capacity, never to alice's personal box.
    let spec = expect_assign(recv_frame(&mut shared_worker).await);
    assert_eq!(spec.id, job_id);
    expect_no_frame(&mut alice_worker, Duration::from_millis(500)).await;

    let record = server
        .state
        .storage
        .get_job(job_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.approved_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn repeated_rejects_exhaust_retries() {
    let server = start_server().await;
    let repo = seed_repo(&server.state, "repo-1", "alice", 2).await;
    seed_worker_token(&server.state, "t1", "box-1").await;

    let mut worker = connect_worker(&server, "t1", &["linux"], WorkerMode::Shared, None).await;

    let job_id = server
        .state
        .intake
        .enqueue_job(enqueue_request(&repo, "alice", TrustLevel::Owner, &["linux"]))
        .await
        .unwrap();

    for _ in 0..2 {
        let spec = expect_assign(recv_frame(&mut worker).await);
        assert_eq!(spec.id, job_id);
        send_frame(
            &mut worker,
            Frame::JobReject(JobRejectPayload {
                job_id: job_id.clone(),
                reason: "no container runtime".to_string(),
            }),
        )
        .await;
    }

    // The cap is two attempts: no third assignment, terminal error.
    expect_no_frame(&mut worker, Duration::from_millis(1500)).await;
    let record = server
        .state
        .storage
        .get_job(job_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status(), JobStatus::Error);
    assert_eq!(server.state.dispatcher.queued_len(), 0);
    assert_eq!(server.state.dispatcher.inflight_len(), 0);
}

#[tokio::test]
async fn relay_round_trip_preserves_request_and_response() {
    let server = start_server().await;
    let relay_token = server
        .state
        .auth
        .issue_user_token("alice@example.com", 3600)
        .unwrap();

    let relay_url = format!("ws://{}/ws/relay?token={}", server.addr, relay_token);
    let (mut relay, _) = connect_async(relay_url).await.unwrap();

    let relay_id = match recv_frame(&mut relay).await {
        Frame::RelayReady(ready) => {
            assert!(ready
                .ingress_url
                .ends_with(&format!("/relay/{}", ready.relay_id)));
            ready.relay_id
        }
        other => panic!("expected relay_ready, got {}", other.tag()),
    };

    // Fire the webhook POST concurrently; it blocks on the tunnel.
    let post_url = format!("http://{}/relay/{}/webhooks", server.addr, relay_id);
    let poster = tokio::spawn(async move {
        reqwest::Client::new()
            .post(post_url)
            .header("X-GitHub-Event", "push")
            .header("Content-Type", "application/json")
            .body(r#"{"foo":1}"#)
            .send()
            .await
            .unwrap()
    });

    let request = match recv_frame(&mut relay).await {
        Frame::RelayRequest(request) => request,
        other => panic!("expected relay_request, got {}", other.tag()),
    };
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/webhooks");
    assert_eq!(
        request.headers.get("x-github-event").map(String::as_str),
        Some("push")
    );
    assert_eq!(
        BASE64.decode(request.body.as_bytes()).unwrap(),
        br#"{"foo":1}"#
    );

    send_frame(
        &mut relay,
        Frame::RelayResponse(RelayResponsePayload {
            id: request.id,
            status: 202,
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: BASE64.encode(b"ok"),
        }),
    )
    .await;

    let response = poster.await.unwrap();
    assert_eq!(response.status().as_u16(), 202);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/json")
    );
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn relay_ingress_without_relay_is_unavailable() {
    let server = start_server().await;
    let url = format!("http://{}/relay/no-such-relay/webhooks", server.addr);
    let response = reqwest::Client::new().post(url).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 503);
}

#[tokio::test]
async fn signed_token_worker_gets_hostname_scoped_id() {
    let server = start_server().await;
    let token = server
        .state
        .auth
        .issue_user_token("alice@example.com", 3600)
        .unwrap();

    let url = format!("ws://{}/ws/worker?token={}", server.addr, token);
    let (mut ws, _) = connect_async(url).await.unwrap();
    match recv_frame(&mut ws).await {
        Frame::AuthOk(ok) => assert_eq!(ok.worker_id.as_str(), "user:alice@example.com"),
        other => panic!("expected auth_ok, got {}", other.tag()),
    }

    send_frame(
        &mut ws,
        Frame::Register(RegisterPayload {
            labels: vec!["linux".to_string()],
            capabilities: Capabilities::default(),
            mode: WorkerMode::Personal,
            owner: None,
            hostname: "buildbox".to_string(),
            version: "0.1.0".to_string(),
        }),
    )
    .await;

    match recv_frame(&mut ws).await {
        Frame::Registered(registered) => {
            assert_eq!(
                registered.worker_id.as_str(),
                "user:alice@example.com:buildbox"
            );
        }
        other => panic!("expected registered, got {}", other.tag()),
    }

    // The signed subject becomes the owner: alice's own jobs land here.
    let repo = seed_repo(&server.state, "repo-1", "alice@example.com", 3).await;
    let job_id = server
        .state
        .intake
        .enqueue_job(enqueue_request(
            &repo,
            "alice@example.com",
            TrustLevel::Owner,
            &["linux"],
        ))
        .await
        .unwrap();
    let spec = expect_assign(recv_frame(&mut ws).await);
    assert_eq!(spec.id, job_id);
}

#[tokio::test]
async fn bad_token_is_refused() {
    let server = start_server().await;
    let url = format!("ws://{}/ws/worker?token=wrong", server.addr);
    let (mut ws, _) = connect_async(url).await.unwrap();
    match recv_frame(&mut ws).await {
        Frame::AuthFail(fail) => assert!(!fail.reason.is_empty()),
        other => panic!("expected auth_fail, got {}", other.tag()),
    }
    match ws.next().await {
        None | Some(Ok(WsMessage::Close(_))) => {}
        Some(Err(_)) => {}
        other => panic!("expected close after auth_fail, got {:?}", other),
    }
}

#[tokio::test]
async fn malformed_frame_does_not_kill_session() {
    let server = start_server().await;
    seed_worker_token(&server.state, "t1", "box-1").await;
    let mut worker = connect_worker(&server, "t1", &["linux"], WorkerMode::Shared, None).await;

    ws_send_text(&mut worker, "this is not a frame").await;

    // The session survives: a ping still gets its pong.
    send_frame(&mut worker, Frame::Ping(PingPayload { active_jobs: vec![] })).await;
    match recv_frame(&mut worker).await {
        Frame::Pong => {}
        other => panic!("expected pong, got {}", other.tag()),
    }
}

async fn ws_send_text(ws: &mut WsClient, text: &str) {
    ws.send(WsMessage::text(text.to_string())).await.unwrap();
}

#[tokio::test]
async fn ping_reconciliation_frees_lost_slot() {
    let server = start_server().await;
    let repo = seed_repo(&server.state, "repo-1", "alice", 3).await;
    seed_worker_token(&server.state, "t1", "box-1").await;
    let mut worker = connect_worker(&server, "t1", &["linux"], WorkerMode::Shared, None).await;

    let job_id = server
        .state
        .intake
        .enqueue_job(enqueue_request(&repo, "alice", TrustLevel::Owner, &["linux"]))
        .await
        .unwrap();
    let spec = expect_assign(recv_frame(&mut worker).await);
    assert_eq!(spec.id, job_id);

    // Complete the job, then heartbeat with an empty active set: the slot
    // stays free and a second job dispatches.
    send_frame(
        &mut worker,
        Frame::JobComplete(JobCompletePayload {
            job_id: job_id.clone(),
            exit_code: 0,
            duration_ms: 10,
        }),
    )
    .await;
    match recv_frame(&mut worker).await {
        Frame::Ack(_) => {}
        other => panic!("expected ack, got {}", other.tag()),
    }

    send_frame(&mut worker, Frame::Ping(PingPayload { active_jobs: vec![] })).await;
    match recv_frame(&mut worker).await {
        Frame::Pong => {}
        other => panic!("expected pong, got {}", other.tag()),
    }

    let second = server
        .state
        .intake
        .enqueue_job(enqueue_request(&repo, "alice", TrustLevel::Owner, &["linux"]))
        .await
        .unwrap();
    let spec = expect_assign(recv_frame(&mut worker).await);
    assert_eq!(spec.id, second);
}

#[tokio::test]
async fn duplicate_terminal_frames_are_ignored() {
    let server = start_server().await;
    let repo = seed_repo(&server.state, "repo-1", "alice", 3).await;
    seed_worker_token(&server.state, "t1", "box-1").await;
    let mut worker = connect_worker(&server, "t1", &["linux"], WorkerMode::Shared, None).await;

    let job_id = server
        .state
        .intake
        .enqueue_job(enqueue_request(&repo, "alice", TrustLevel::Owner, &["linux"]))
        .await
        .unwrap();
    expect_assign(recv_frame(&mut worker).await);

    send_frame(
        &mut worker,
        Frame::JobComplete(JobCompletePayload {
            job_id: job_id.clone(),
            exit_code: 0,
            duration_ms: 10,
        }),
    )
    .await;
    match recv_frame(&mut worker).await {
        Frame::Ack(_) => {}
        other => panic!("expected ack, got {}", other.tag()),
    }

    // A misbehaving worker repeats the terminal frame with a different
    // outcome; the first one already won.
    send_frame(
        &mut worker,
        Frame::JobComplete(JobCompletePayload {
            job_id: job_id.clone(),
            exit_code: 1,
            duration_ms: 10,
        }),
    )
    .await;
    expect_no_frame(&mut worker, Duration::from_millis(500)).await;

    let record = server
        .state
        .storage
        .get_job(job_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status(), JobStatus::Success);
    assert_eq!(record.exit_code, Some(0));
}
