/// Sync passes against a mock HTTP authority: event flow, idempotent
/// retries, authorization, failure bookkeeping and pull cursors.
mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use supportdesk::{Category, Document, DocumentType, EntityKind, LocalStore, MutationOp};
use supportdesk_sync::{
    Connectivity, HttpRemote, PullResponse, PushRequest, PushResponse, RemoteAuthority,
    RemoteChange, RemoteError, RemoteRecord, SupportPortal, SyncConfig, SyncEvent, SyncManager,
    SyncPhase,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// ============================================================
// Fake authority
// ============================================================

#[derive(Default)]
struct AuthorityState {
    applied: HashSet<String>,
    views: HashMap<String, u64>,
    /// Apply the next N view increments but answer 500, as if the ack was lost.
    lose_view_acks: usize,
    pushes: usize,
}

/// Applies each mutation id at most once and answers with its id.
#[derive(Clone, Default)]
struct FakeAuthority {
    state: Arc<Mutex<AuthorityState>>,
}

impl FakeAuthority {
    fn views(&self, id: &str) -> u64 {
        self.state.lock().unwrap().views.get(id).copied().unwrap_or(0)
    }

    fn pushes(&self) -> usize {
        self.state.lock().unwrap().pushes
    }
}

impl Respond for FakeAuthority {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let push: PushRequest = match request.body_json() {
            Ok(p) => p,
            Err(e) => return ResponseTemplate::new(400).set_body_string(e.to_string()),
        };
        let mut state = self.state.lock().unwrap();
        state.pushes += 1;
        let applied = state.applied.insert(push.mutation_id.clone());
        if applied && push.operation == MutationOp::IncrementView {
            let delta = push.payload["delta"].as_u64().unwrap_or(1);
            *state.views.entry(push.entity_id.clone()).or_default() += delta;
            if state.lose_view_acks > 0 {
                state.lose_view_acks -= 1;
                return ResponseTemplate::new(500).set_body_string("upstream reset");
            }
        }
        ResponseTemplate::new(200).set_body_json(PushResponse {
            mutation_id: push.mutation_id,
            applied,
        })
    }
}

/// First pull returns `changes` with cursor `c-1`; later pulls are empty.
struct CursorFeed {
    changes: Vec<RemoteChange>,
}

impl Respond for CursorFeed {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let since = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "since")
            .map(|(_, v)| v.into_owned());
        let body = match since.as_deref() {
            None => PullResponse {
                changes: self.changes.clone(),
                cursor: Some("c-1".into()),
            },
            Some(_) => PullResponse {
                changes: Vec::new(),
                cursor: Some("c-2".into()),
            },
        };
        ResponseTemplate::new(200).set_body_json(body)
    }
}

async fn mount_authority(server: &MockServer, authority: FakeAuthority) {
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(authority)
        .mount(server)
        .await;
}

async fn mount_empty_pull(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(PullResponse::default()))
        .mount(server)
        .await;
}

fn config() -> SyncConfig {
    SyncConfig {
        client_id: "tablet-1".into(),
        request_timeout_ms: 2_000,
        backoff_base_ms: 0,
        backoff_max_ms: 0,
        backoff_jitter: 0.0,
        ..SyncConfig::default()
    }
}

fn remote(server: &MockServer) -> HttpRemote {
    HttpRemote::new(server.uri(), Duration::from_secs(2)).unwrap()
}

async fn manager(
    server: &MockServer,
    config: SyncConfig,
) -> (Arc<SyncManager<HttpRemote>>, Arc<LocalStore>) {
    let store = LocalStore::open_in_memory().await.unwrap();
    let manager = SyncManager::new(
        Arc::clone(&store),
        Arc::new(remote(server)),
        config,
        Arc::new(Connectivity::new(true)),
    );
    (manager, store)
}

// ============================================================
// Pass lifecycle
// ============================================================

#[tokio::test]
async fn test_empty_pass_emits_events_and_stamps_time() {
    common::init_tracing();
    let server = MockServer::start().await;
    mount_authority(&server, FakeAuthority::default()).await;
    mount_empty_pull(&server).await;
    let (manager, _store) = manager(&server, config()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    let before = Utc::now();
    let report = manager.sync_all().await.unwrap();
    assert!(report.is_clean());

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], SyncEvent::SyncStarted);
    assert!(matches!(events[1], SyncEvent::SyncCompleted { .. }));

    let status = manager.status().await.unwrap();
    assert_eq!(status.phase, SyncPhase::Idle);
    assert!(status.last_sync_time.unwrap() >= before);
}

#[tokio::test]
async fn test_offline_views_reach_remote_exactly_once() {
    common::init_tracing();
    let server = MockServer::start().await;
    let authority = FakeAuthority::default();
    authority.state.lock().unwrap().lose_view_acks = 1;
    mount_authority(&server, authority.clone()).await;
    mount_empty_pull(&server).await;

    let store = LocalStore::open_in_memory().await.unwrap();
    let connectivity = Arc::new(Connectivity::new(false));
    let portal = SupportPortal::with_store(
        Arc::clone(&store),
        config(),
        remote(&server),
        Arc::clone(&connectivity),
    );

    let doc = store
        .put(Document::new("Boiler manual", DocumentType::Manual).with_id("doc-1"))
        .await
        .unwrap();
    portal.view_document(&doc.id).await.unwrap();
    portal.view_document(&doc.id).await.unwrap();
    assert!(portal.sync_all().await.is_none());

    // coming online triggers a pass; the increment is applied but its ack lost
    let mut rx = portal.sync().events().receiver();
    portal.set_online(true);
    let report = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SyncEvent::SyncCompleted { report }) = rx.recv().await {
                return report;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(authority.views("doc-1"), 2);
    assert_eq!(portal.status().await.unwrap().pending_count, 1);

    // the retry carries the same mutation id and is not applied twice
    let mut retry = None;
    for _ in 0..100 {
        retry = portal.sync_all().await;
        if retry.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(retry.unwrap().pushed, 1);
    assert_eq!(authority.views("doc-1"), 2);
    assert_eq!(authority.pushes(), 3);
    assert_eq!(portal.status().await.unwrap().pending_count, 0);
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    common::init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(FakeAuthority::default())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(PullResponse::default()))
        .expect(1)
        .mount(&server)
        .await;

    let store = LocalStore::open_in_memory().await.unwrap();
    let manager = SyncManager::new(
        Arc::clone(&store),
        Arc::new(remote(&server).with_auth_token("s3cret")),
        config(),
        Arc::new(Connectivity::new(true)),
    );
    store
        .put(Document::new("Guide", DocumentType::Guide))
        .await
        .unwrap();

    let report = manager.sync_all().await.unwrap();
    assert_eq!(report.pushed, 1);
}

#[tokio::test]
async fn test_server_error_keeps_entry_queued() {
    common::init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    mount_empty_pull(&server).await;
    let (manager, store) = manager(&server, config()).await;
    store
        .put(Document::new("Guide", DocumentType::Guide))
        .await
        .unwrap();

    let report = manager.sync_all().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(!report.aborted);

    let entry = &store.pending_mutations(None).await.unwrap()[0];
    assert_eq!(entry.attempt_count, 1);
    assert!(entry.last_error.as_deref().unwrap().contains("500"));

    let status = manager.status().await.unwrap();
    assert_eq!(status.pending_count, 1);
    assert_eq!(status.phase, SyncPhase::Backoff);
    assert!(status.last_sync_time.is_some());
}

#[tokio::test]
async fn test_slow_remote_aborts_pass() {
    common::init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;
    let config = SyncConfig {
        request_timeout_ms: 50,
        ..config()
    };
    let (manager, store) = manager(&server, config).await;
    store
        .put(Document::new("Guide", DocumentType::Guide))
        .await
        .unwrap();

    let report = manager.sync_all().await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.pushed, 0);
    assert_eq!(store.pending_count().await.unwrap(), 1);
    assert!(manager.status().await.unwrap().last_sync_time.is_none());
}

// ============================================================
// Pull
// ============================================================

#[tokio::test]
async fn test_pull_advances_cursor_and_skips_cyclic_category() {
    common::init_tracing();
    let server = MockServer::start().await;
    mount_authority(&server, FakeAuthority::default()).await;

    let mut cyclic = Category::new("a", "Products").with_parent("b");
    cyclic.updated_at = Utc::now() + ChronoDuration::hours(1);
    let feed = CursorFeed {
        changes: vec![
            RemoteChange::Upsert {
                record: RemoteRecord::Category(cyclic),
            },
            RemoteChange::Upsert {
                record: RemoteRecord::Document(
                    Document::new("Remote datasheet", DocumentType::Datasheet).with_id("srv-1"),
                ),
            },
        ],
    };
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(feed)
        .mount(&server)
        .await;

    let (manager, store) = manager(&server, config()).await;
    store.put(Category::new("a", "Products")).await.unwrap();
    store
        .put(Category::new("b", "Pumps").with_parent("a"))
        .await
        .unwrap();

    let report = manager.sync_all().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(report.pulled, 2);
    assert_eq!(report.applied, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(store.require::<Category>("a").await.unwrap().parent_id, None);
    assert!(store.get::<Document>("srv-1").await.unwrap().is_some());
    assert_eq!(store.sync_cursor().await.unwrap().as_deref(), Some("c-1"));

    manager.sync_all().await.unwrap();
    assert_eq!(store.sync_cursor().await.unwrap().as_deref(), Some("c-2"));

    let requests = server.received_requests().await.unwrap();
    let last_pull = requests
        .iter()
        .filter(|r| r.url.path() == "/sync/pull")
        .last()
        .unwrap();
    let query: HashMap<_, _> = last_pull.url.query_pairs().into_owned().collect();
    assert_eq!(query.get("since").map(String::as_str), Some("c-1"));
    assert_eq!(query.get("client_id").map(String::as_str), Some("tablet-1"));
}

// ============================================================
// HttpRemote wire format
// ============================================================

#[tokio::test]
async fn test_push_body_shape() {
    common::init_tracing();
    let server = MockServer::start().await;
    mount_authority(&server, FakeAuthority::default()).await;

    let store = LocalStore::open_in_memory().await.unwrap();
    store
        .put(Document::new("Guide", DocumentType::Guide).with_id("d1"))
        .await
        .unwrap();
    store.record_view(EntityKind::Document, "d1").await.unwrap();
    let increment = store
        .pending_mutations(None)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.operation == MutationOp::IncrementView)
        .unwrap();

    let response = remote(&server)
        .push(PushRequest::from_mutation(&increment, "tablet-1"))
        .await
        .unwrap();
    assert_eq!(response.mutation_id, increment.id);
    assert!(response.applied);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["mutation_id"], increment.id.as_str());
    assert_eq!(body["client_id"], "tablet-1");
    assert_eq!(body["entity_kind"], "document");
    assert_eq!(body["entity_id"], "d1");
    assert_eq!(body["operation"], "increment-view");
    assert_eq!(body["payload"], serde_json::json!({ "delta": 1 }));
}

#[tokio::test]
async fn test_remote_error_classification() {
    common::init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/push"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unknown entity"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sync/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let store = LocalStore::open_in_memory().await.unwrap();
    store
        .put(Document::new("Guide", DocumentType::Guide))
        .await
        .unwrap();
    let entry = store.pending_mutations(None).await.unwrap().remove(0);
    let remote = remote(&server);

    let err = remote
        .push(PushRequest::from_mutation(&entry, "tablet-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Status { status: 422, .. }));
    assert!(!err.is_retryable());

    let err = remote.pull("tablet-1", None).await.unwrap_err();
    assert!(matches!(err, RemoteError::Decode(_)));

    let unreachable = HttpRemote::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
    let err = unreachable.pull("tablet-1", None).await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(unreachable.last_success_timestamp(), 0);
}
