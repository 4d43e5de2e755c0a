use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use vroom_core::{
    AuthError, AuthGate, LookupError, ParticipantId, Principal, ProviderError, RoomStatus,
    SessionId, SessionRecord, SessionRepository, SessionStateProvider, Snapshot,
};
use vroom_server::{start, ServerConfig, ServerDeps, ServerHandle, StreamSettings};
use vroom_telemetry::MetricsRecorder;

const GOOD_TOKEN: &str = "good-token";

struct StaticGate;

#[async_trait]
impl AuthGate for StaticGate {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if token == GOOD_TOKEN {
            Ok(Principal::new("proctor"))
        } else {
            Err(AuthError::Invalid("unknown token".into()))
        }
    }
}

struct Rooms {
    known: HashSet<String>,
}

#[async_trait]
impl SessionRepository for Rooms {
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<SessionRecord>, LookupError> {
        if !self.known.contains(id.as_str()) {
            return Ok(None);
        }
        let now = chrono::Utc::now().to_rfc3339();
        Ok(Some(SessionRecord {
            id: id.clone(),
            title: format!("room {id}"),
            status: RoomStatus::Running,
            created_at: now.clone(),
            updated_at: now,
        }))
    }
}

/// Every read returns a fresh tick number so updates are distinguishable.
/// Records the participant scope of each read.
#[derive(Default)]
struct Ticking {
    reads: AtomicU64,
    scopes: Mutex<Vec<(String, Option<String>)>>,
}

impl Ticking {
    fn scopes_for(&self, session: &str) -> Vec<Option<String>> {
        self.scopes
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == session)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl SessionStateProvider for Ticking {
    async fn get_session_state(
        &self,
        id: &SessionId,
        participant: Option<&ParticipantId>,
    ) -> Result<Option<Snapshot>, ProviderError> {
        self.scopes
            .lock()
            .unwrap()
            .push((id.as_str().to_string(), participant.map(|p| p.as_str().to_string())));
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Snapshot::new(json!({
            "sessionId": id.as_str(),
            "status": "RUNNING",
            "tick": n,
        }))))
    }
}

struct TestServer {
    handle: ServerHandle,
    provider: Arc<Ticking>,
    base: String,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(heartbeat_ms: u64, refresh_ms: u64) -> Self {
        let provider = Arc::new(Ticking::default());
        let deps = ServerDeps {
            auth: Arc::new(StaticGate),
            sessions: Arc::new(Rooms {
                known: ["S1", "S3", "S4"].iter().map(|s| s.to_string()).collect(),
            }),
            provider: provider.clone(),
            metrics: Arc::new(MetricsRecorder::new()),
        };
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            stream: StreamSettings {
                heartbeat_interval_ms: heartbeat_ms,
                refresh_interval_ms: refresh_ms,
                ..StreamSettings::default()
            },
        };
        let handle = start(config, deps).await.unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);
        Self {
            handle,
            provider,
            base,
            client: reqwest::Client::new(),
        }
    }

    async fn open(&self, session: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/virtual-room/{session}?token={GOOD_TOKEN}", self.base))
            .send()
            .await
            .unwrap()
    }

    fn count(&self, session: &str) -> usize {
        self.handle.registry().count(&SessionId::from_raw(session))
    }

    async fn wait_for_count(&self, session: &str, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count(session) != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{session} never reached {expected} connections"));
    }
}

/// Read raw SSE frames (blank-line delimited) until `n` have arrived.
async fn read_frames(resp: &mut reqwest::Response, n: usize) -> Vec<String> {
    let mut buf = String::new();
    let mut frames = Vec::new();
    let read = async {
        while frames.len() < n {
            let chunk = resp.chunk().await.unwrap().expect("stream ended early");
            buf.push_str(std::str::from_utf8(&chunk).unwrap());
            while let Some(end) = buf.find("\n\n") {
                frames.push(buf[..end].to_string());
                buf.drain(..end + 2);
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("timed out reading frames");
    frames
}

fn is_heartbeat(frame: &str) -> bool {
    frame.starts_with(':')
}

#[tokio::test]
async fn eleventh_connection_evicts_the_oldest() {
    let server = TestServer::start(15_000, 50).await;

    let mut responses = Vec::new();
    for _ in 0..11 {
        let resp = server.open("S1").await;
        assert_eq!(resp.status(), 200);
        responses.push(resp);
    }
    assert_eq!(server.count("S1"), 10);

    let first = responses.remove(0);
    let ended = tokio::time::timeout(Duration::from_secs(5), async move {
        let mut body = first.bytes_stream();
        while let Some(chunk) = body.next().await {
            if chunk.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "evicted stream should terminate");

    assert_eq!(server.count("S1"), 10);
    server.handle.shutdown().await;
}

#[tokio::test]
async fn unknown_session_is_rejected_with_404() {
    let server = TestServer::start(15_000, 1_000).await;
    let resp = server.open("S2").await;
    assert_eq!(resp.status(), 404);
    assert_eq!(server.count("S2"), 0);
    server.handle.shutdown().await;
}

#[tokio::test]
async fn stream_sends_init_then_updates_and_heartbeats() {
    let server = TestServer::start(120, 40).await;
    let mut resp = server.open("S3").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        resp.headers()["cache-control"].to_str().unwrap(),
        "no-cache, no-transform"
    );
    assert_eq!(resp.headers()["x-accel-buffering"].to_str().unwrap(), "no");

    let frames = read_frames(&mut resp, 8).await;
    assert!(frames[0].starts_with("event: init\ndata: "), "{:?}", frames[0]);
    assert!(frames[0].contains("\"RUNNING\""));

    let data_frames: Vec<_> = frames[1..].iter().filter(|f| !is_heartbeat(f)).collect();
    assert!(!data_frames.is_empty());
    assert!(data_frames.iter().all(|f| f.starts_with("event: update\ndata: ")));
    assert!(!frames.iter().any(|f| f.starts_with("event: init") && f != &frames[0]));

    let more = read_frames(&mut resp, 12).await;
    assert!(
        frames.iter().chain(more.iter()).any(|f| is_heartbeat(f)),
        "expected a heartbeat comment"
    );

    drop(resp);
    server.handle.shutdown().await;
}

#[tokio::test]
async fn missing_or_bad_credentials_are_rejected_with_401() {
    let server = TestServer::start(15_000, 1_000).await;

    let resp = server
        .client
        .get(format!("{}/virtual-room/S4", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .get(format!("{}/virtual-room/S4?token=forged", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    // Unauthenticated requests learn nothing about unknown sessions.
    let resp = server
        .client
        .get(format!("{}/virtual-room/S2", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    assert_eq!(server.count("S4"), 0);
    server.handle.shutdown().await;
}

#[tokio::test]
async fn bearer_header_is_accepted() {
    let server = TestServer::start(15_000, 1_000).await;
    let resp = server
        .client
        .get(format!("{}/virtual-room/S4", server.base))
        .bearer_auth(GOOD_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(server.count("S4"), 1);
    drop(resp);
    server.handle.shutdown().await;
}

#[tokio::test]
async fn client_disconnect_unregisters() {
    let server = TestServer::start(15_000, 20).await;
    let mut resp = server.open("S1").await;
    read_frames(&mut resp, 2).await;
    assert_eq!(server.count("S1"), 1);

    drop(resp);
    server.wait_for_count("S1", 0).await;
    assert_eq!(server.handle.connection_count(), 0);
    server.handle.shutdown().await;
}

#[tokio::test]
async fn connections_endpoint_reports_live_count() {
    let server = TestServer::start(15_000, 1_000).await;
    let _a = server.open("S1").await;
    let _b = server.open("S1").await;

    let body: serde_json::Value = server
        .client
        .get(format!("{}/virtual-room/S1/connections", server.base))
        .bearer_auth(GOOD_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["sessionId"], "S1");
    assert_eq!(body["connections"], 2);

    let health: serde_json::Value = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["connections"], 2);

    server.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_ends_open_streams() {
    let server = TestServer::start(15_000, 1_000).await;
    let resp = server.open("S3").await;
    assert_eq!(server.count("S3"), 1);

    let registry = Arc::clone(server.handle.registry());
    let drained = tokio::spawn(async move {
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            if chunk.is_err() {
                break;
            }
        }
    });

    server.handle.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), drained)
        .await
        .expect("stream should end on shutdown")
        .unwrap();
    assert_eq!(registry.total(), 0);
}

#[tokio::test]
async fn participant_id_scopes_provider_reads() {
    let server = TestServer::start(15_000, 1_000).await;

    let mut scoped = server
        .client
        .get(format!(
            "{}/virtual-room/S3?token={GOOD_TOKEN}&participantId=P7",
            server.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(scoped.status(), 200);
    read_frames(&mut scoped, 1).await;
    drop(scoped);

    let mut blank = server
        .client
        .get(format!("{}/virtual-room/S4?token={GOOD_TOKEN}&participantId=%20", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status(), 200);
    read_frames(&mut blank, 1).await;
    drop(blank);

    let s3 = server.provider.scopes_for("S3");
    assert!(!s3.is_empty());
    assert!(s3.iter().all(|p| p.as_deref() == Some("P7")));

    let s4 = server.provider.scopes_for("S4");
    assert!(!s4.is_empty());
    assert!(s4.iter().all(Option::is_none));

    server.handle.shutdown().await;
}

#[tokio::test]
async fn malformed_query_is_judged_after_authentication() {
    let server = TestServer::start(15_000, 1_000).await;

    // Duplicate tokens cannot be read, so the credential is missing.
    let resp = server
        .client
        .get(format!("{}/virtual-room/S1?token={GOOD_TOKEN}&token=other", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // With a valid header the caller is known, so the query itself is the problem.
    let resp = server
        .client
        .get(format!("{}/virtual-room/S1?participantId=a&participantId=b", server.base))
        .bearer_auth(GOOD_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    assert_eq!(server.count("S1"), 0);
    server.handle.shutdown().await;
}
