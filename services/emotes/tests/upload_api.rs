//! HTTP tests for the emote upload and read routes.
//!
//! The router runs over in-memory collaborators: record store, status
//! cache, stager and broker. Probing is faked so no external binaries are
//! needed.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use emote_pipeline::{Broker, DeliveryMode, JobDescriptor, MemoryBroker};
use emote_service::auth::{permissions, Claims};
use emote_service::config::{ApiConfig, UploadConfig};
use emote_service::emote_store::StoreError;
use emote_service::probe::ProbeError;
use emote_service::{
    create_router, AppState, Authenticator, Container, Emote, EmoteFormat, EmoteStatus, EmoteStore,
    JobDispatcher,
    MediaInfo, MediaProbe, MemoryEmoteStore, MemoryStager, MemoryStatusCache, StatusCache,
    UploadValidator,
};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "test-secret";
const JOB_QUEUE: &str = "emote-jobs";
const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

/// Probe reporting fixed media info, or failing
struct FakeProbe(Option<MediaInfo>);

#[async_trait]
impl MediaProbe for FakeProbe {
    async fn probe(&self, path: &Path, _container: Container) -> Result<MediaInfo, ProbeError> {
        assert!(path.exists(), "probe should see the temp file");
        self.0.ok_or_else(|| ProbeError::Parse {
            tool: "ffprobe",
            output: "N/A".to_string(),
        })
    }
}

struct TestApp {
    router: Router,
    store: Arc<MemoryEmoteStore>,
    cache: Arc<MemoryStatusCache>,
    stager: Arc<MemoryStager>,
    broker: MemoryBroker,
    temp_folder: PathBuf,
    _temp_dir: TempDir,
}

fn media(width: i64, height: i64, frame_count: i64) -> Option<MediaInfo> {
    Some(MediaInfo {
        width,
        height,
        frame_count,
    })
}

fn setup(probe: Option<MediaInfo>, with_broker: bool) -> TestApp {
    setup_with_limits(probe, with_broker, UploadConfig::default())
}

fn setup_with_limits(probe: Option<MediaInfo>, with_broker: bool, limits: UploadConfig) -> TestApp {
    let temp_dir = tempfile::tempdir().unwrap();
    let temp_folder = temp_dir.path().join("uploads");

    let store = Arc::new(MemoryEmoteStore::new());
    let cache = Arc::new(MemoryStatusCache::new());
    let stager = Arc::new(MemoryStager::new("emotes-private", "internal/emote/"));
    let broker = MemoryBroker::with_queues([JOB_QUEUE]);

    let validator = UploadValidator::new(
        UploadConfig {
            temp_folder: temp_folder.clone(),
            ..limits
        },
        Arc::new(FakeProbe(probe)),
    );
    let dispatcher = with_broker
        .then(|| JobDispatcher::new(Arc::new(broker.clone()), JOB_QUEUE, "emotes-public"));

    let state = AppState {
        store: store.clone(),
        cache: cache.clone(),
        validator: Arc::new(validator),
        stager: stager.clone(),
        dispatcher,
        authenticator: Arc::new(Authenticator::new(SECRET)),
    };

    TestApp {
        router: create_router(state, &ApiConfig::default()),
        store,
        cache,
        stager,
        broker,
        temp_folder,
        _temp_dir: temp_dir,
    }
}

fn token(perm: i64) -> String {
    let claims = Claims {
        u: "user-1".to_string(),
        v: 1,
        perm,
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn upload_request(token: Option<&str>, emote_data: &str, body: &[u8]) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri("/emotes")
        .header("x-emote-data", emote_data);
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {}", token));
    }
    request.body(Body::from(body.to_vec())).unwrap()
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn get(app: &TestApp, uri: &str) -> (StatusCode, Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

const EMOTE_DATA: &str = r#"{"name": "PogChamp", "tags": ["pog", "hype"], "flags": 257}"#;

#[tokio::test]
async fn test_valid_upload_creates_pending_emote_and_job() {
    let app = setup(media(112, 112, 24), true);
    let token = token(permissions::CREATE_EMOTE);

    let (status, body) = send(&app, upload_request(Some(&token), EMOTE_DATA, PNG)).await;
    assert_eq!(status, StatusCode::CREATED);

    let id = body["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());

    let emotes = app.store.all();
    assert_eq!(emotes.len(), 1);
    let emote = &emotes[0];
    assert_eq!(emote.id, id);
    assert_eq!(emote.owner_id, "user-1");
    assert_eq!(emote.status, EmoteStatus::Pending);
    assert_eq!(emote.frame_count, 24);
    assert_eq!(emote.tags, vec!["pog", "hype"]);
    assert_eq!(emote.flags.bits(), 257);
    assert!(emote.formats.is_empty());

    let key = format!("internal/emote/{}.png", id);
    let (content_type, bytes) = app.stager.object(&key).unwrap();
    assert_eq!(content_type, "image/png");
    assert_eq!(bytes, PNG);

    let jobs = app.broker.ready_messages(JOB_QUEUE);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].0, DeliveryMode::Persistent);
    let job: JobDescriptor = serde_json::from_slice(&jobs[0].1).unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.provider_details.key, key);
    assert_eq!(job.consumer_details.key_prefix, format!("emote/{}", id));

    assert_eq!(std::fs::read_dir(&app.temp_folder).unwrap().count(), 0);
}

#[tokio::test]
async fn test_tags_past_the_cap_are_dropped() {
    let app = setup(media(112, 112, 1), true);
    let token = token(permissions::CREATE_EMOTE);
    let emote_data = r#"{"name": "PogChamp", "tags": ["aaa", "bbb", "ccc", "ddd", "eee", "fff", "ggg"], "flags": 0}"#;

    let (status, _) = send(&app, upload_request(Some(&token), emote_data, PNG)).await;
    assert_eq!(status, StatusCode::CREATED);

    let emotes = app.store.all();
    assert_eq!(emotes.len(), 1);
    assert_eq!(emotes[0].tags, vec!["aaa", "bbb", "ccc", "ddd", "eee", "fff"]);
}

#[tokio::test]
async fn test_too_many_frames_is_rejected_without_record() {
    let app = setup(media(112, 112, 751), true);
    let token = token(permissions::CREATE_EMOTE);

    let (status, body) = send(&app, upload_request(Some(&token), EMOTE_DATA, PNG)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid request");
    assert_eq!(body["error_code"], 10002);
    assert!(body["details"].as_str().unwrap().contains("750"));

    assert!(app.store.is_empty());
    assert!(app.stager.is_empty());
    assert_eq!(app.broker.ready_count(JOB_QUEUE), 0);
}

#[tokio::test]
async fn test_missing_broker_is_locked() {
    let app = setup(media(112, 112, 1), false);
    let token = token(permissions::CREATE_EMOTE);

    let (status, body) = send(&app, upload_request(Some(&token), EMOTE_DATA, PNG)).await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["status"], 423);
    assert_eq!(body["error"], "missing internal dependency");
    assert_eq!(body["error_code"], 10004);
    assert_eq!(body["details"], "Emote Processing Service Unavailable");
    assert!(app.store.is_empty());

    let (status, body) = get(&app, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["broker"], "missing");
}

#[tokio::test]
async fn test_authentication_and_permission() {
    let app = setup(media(112, 112, 1), true);

    let (status, body) = send(&app, upload_request(None, EMOTE_DATA, PNG)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], 10001);

    let (status, _) = send(&app, upload_request(Some("not-a-jwt"), EMOTE_DATA, PNG)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, upload_request(Some(&token(0)), EMOTE_DATA, PNG)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], 10003);

    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_bad_emote_data_and_format() {
    let app = setup(media(112, 112, 1), true);
    let token = token(permissions::CREATE_EMOTE);

    let (status, body) = send(&app, upload_request(Some(&token), "{oops", PNG)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], 10002);

    let (status, body) = send(
        &app,
        upload_request(Some(&token), r#"{"name": "PogChamp"}"#, b"definitely not an image"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"], "Unknown Upload Format");

    let (status, body) = send(
        &app,
        upload_request(Some(&token), r#"{"name": "PogChamp", "tags": ["a", "b", "c", "d", "e", "f", "g"]}"#, PNG),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"], "Bad Emote Tag 'a'");

    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_probe_failure_is_internal_and_cleans_up() {
    let app = setup(None, true);
    let token = token(permissions::CREATE_EMOTE);

    let (status, body) = send(&app, upload_request(Some(&token), EMOTE_DATA, PNG)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "internal server error");
    assert_eq!(body["details"], "Internal Server Error");

    assert_eq!(std::fs::read_dir(&app.temp_folder).unwrap().count(), 0);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let limits = UploadConfig {
        max_upload_size: 8,
        ..UploadConfig::default()
    };
    let app = setup_with_limits(media(1, 1, 1), true, limits);
    let token = token(permissions::CREATE_EMOTE);

    let (status, body) = send(&app, upload_request(Some(&token), EMOTE_DATA, PNG)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "invalid request");
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_read_routes() {
    let app = setup(media(64, 64, 1), true);
    let token = token(permissions::CREATE_EMOTE);

    let (status, body) = get(&app, "/emotes/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);

    let (_, body) = send(&app, upload_request(Some(&token), EMOTE_DATA, PNG)).await;
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = get(&app, &format!("/emotes/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "PogChamp");
    assert_eq!(body["status"], "PENDING");

    let (_, body) = get(&app, &format!("/emotes/{}/status", id)).await;
    assert_eq!(body["processing_stage"], Value::Null);

    app.cache
        .set(&id, "stage-two", Duration::from_secs(60))
        .await
        .unwrap();
    app.store
        .update_status(&id, EmoteStatus::Processing)
        .await
        .unwrap();

    let (status, body) = get(&app, &format!("/emotes/{}/status", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": id, "status": "PROCESSING", "processing_stage": "stage-two"}));

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_dispatch_failure_leaves_pending_record() {
    let app = setup(media(64, 64, 1), true);
    app.broker.shutdown().await.unwrap();
    let token = token(permissions::CREATE_EMOTE);

    let (status, body) = send(&app, upload_request(Some(&token), EMOTE_DATA, PNG)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error_code"], 10000);

    let emotes = app.store.all();
    assert_eq!(emotes.len(), 1);
    assert_eq!(emotes[0].status, EmoteStatus::Pending);
}

/// Store whose database is down
struct UnreachableStore;

#[async_trait]
impl EmoteStore for UnreachableStore {
    async fn insert(&self, _emote: &Emote) -> Result<(), StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn find_by_id(&self, _id: &str) -> Result<Option<Emote>, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn update_status(&self, _id: &str, _status: EmoteStatus) -> Result<bool, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn replace_formats(
        &self,
        _id: &str,
        _formats: &[EmoteFormat],
        _status: EmoteStatus,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }
}

#[tokio::test]
async fn test_ready_checks_broker_and_database() {
    let app = setup(media(112, 112, 1), true);
    let (status, body) = get(&app, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["broker"], "configured");
    assert_eq!(body["database"], "connected");

    let broker = MemoryBroker::with_queues([JOB_QUEUE]);
    let state = AppState {
        store: Arc::new(UnreachableStore),
        cache: Arc::new(MemoryStatusCache::new()),
        validator: Arc::new(UploadValidator::new(
            UploadConfig::default(),
            Arc::new(FakeProbe(None)),
        )),
        stager: Arc::new(MemoryStager::new("emotes-private", "internal/emote/")),
        dispatcher: Some(JobDispatcher::new(Arc::new(broker), JOB_QUEUE, "emotes-public")),
        authenticator: Arc::new(Authenticator::new(SECRET)),
    };
    let router = create_router(state, &ApiConfig::default());

    let response = router
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["broker"], "configured");
    assert_eq!(body["database"], "disconnected");
}
