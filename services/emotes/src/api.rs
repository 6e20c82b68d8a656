//! HTTP API for emote uploads and lookups.
//!
//! `POST /emotes` runs the whole upload path: validation, the `PENDING`
//! record, staging and job dispatch. The read routes serve the record and its
//! latest processing stage.

use crate::auth::{permissions, require_actor, Actor, Authenticator};
use crate::config::ApiConfig;
use crate::dispatcher::JobDispatcher;
use crate::emote_store::EmoteStore;
use crate::error::ApiError;
use crate::model::{Emote, EmoteStatus};
use crate::stager::ObjectStager;
use crate::status_cache::StatusCache;
use crate::validator::{EmoteData, UploadValidator};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Header carrying the JSON upload metadata
pub const EMOTE_DATA_HEADER: &str = "x-emote-data";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EmoteStore>,
    pub cache: Arc<dyn StatusCache>,
    pub validator: Arc<UploadValidator>,
    pub stager: Arc<dyn ObjectStager>,
    /// `None` when no broker is configured
    pub dispatcher: Option<JobDispatcher>,
    pub authenticator: Arc<Authenticator>,
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub status: EmoteStatus,
    pub processing_stage: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let upload_limit = state.validator.limits().max_upload_size;
    let uploads = Router::new()
        .route("/emotes", post(create_emote))
        .layer(DefaultBodyLimit::max(upload_limit))
        .route_layer(middleware::from_fn_with_state(
            state.authenticator.clone(),
            require_actor,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/emotes/:id", get(get_emote))
        .route("/emotes/:id/status", get(get_emote_status))
        .merge(uploads)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "emote-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let broker = if state.dispatcher.is_some() {
        "configured"
    } else {
        "missing"
    };

    // Check database connectivity
    let (database, error) = match state.store.ping().await {
        Ok(()) => ("connected", None),
        Err(e) => {
            warn!(error = %e, "Emote store unreachable");
            ("disconnected", Some(e.to_string()))
        }
    };

    if state.dispatcher.is_some() && error.is_none() {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "broker": broker,
                "database": database
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "broker": broker,
                "database": database,
                "error": error
            })),
        )
    }
}

/// Accept an emote upload and queue it for processing
async fn create_emote(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let started = Instant::now();
    let result = upload(&state, &actor, &headers, body).await;

    match &result {
        Ok(created) => {
            metrics::counter!("emotes.uploads.accepted").increment(1);
            metrics::histogram!("emotes.upload.duration_seconds")
                .record(started.elapsed().as_secs_f64());
            info!(emote_id = %created.id, owner_id = %actor.id, "Emote upload accepted");
        }
        Err(e) => {
            metrics::counter!("emotes.uploads.rejected").increment(1);
            info!(owner_id = %actor.id, error = %e, "Emote upload rejected");
        }
    }

    result.map(|created| (StatusCode::CREATED, Json(created)))
}

/// Validate, record, stage, dispatch. A failure after the insert leaves the
/// record `PENDING`.
#[instrument(skip_all, fields(owner_id = %actor.id))]
async fn upload(
    state: &AppState,
    actor: &Actor,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<CreatedResponse, ApiError> {
    let dispatcher = state
        .dispatcher
        .as_ref()
        .ok_or(ApiError::DependencyUnavailable)?;

    if !actor.has_permission(permissions::CREATE_EMOTE) {
        return Err(ApiError::InsufficientPrivilege);
    }

    let data = parse_emote_data(headers)?;
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(format!(
                "Upload Too Large (the maximum is {})",
                state.validator.limits().max_upload_size
            ))
        } else {
            ApiError::InvalidRequest(rejection.body_text())
        }
    })?;

    let id = Uuid::new_v4().to_string();
    let upload = state.validator.validate(&id, &body, &data).await?;

    let emote = Emote::pending(
        id.clone(),
        actor.id.clone(),
        upload.name,
        upload.tags,
        i32::try_from(upload.frame_count).unwrap_or(i32::MAX),
        upload.flags,
    );
    state.store.insert(&emote).await?;

    let staged = state
        .stager
        .stage(&id, upload.container, body.to_vec())
        .await?;
    dispatcher.dispatch(&id, &staged).await?;

    Ok(CreatedResponse { id })
}

fn parse_emote_data(headers: &HeaderMap) -> Result<EmoteData, ApiError> {
    let raw = headers
        .get(EMOTE_DATA_HEADER)
        .ok_or_else(|| ApiError::InvalidRequest("Missing X-Emote-Data header".to_string()))?;
    serde_json::from_slice(raw.as_bytes()).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

/// Get a single emote record
#[instrument(skip(state))]
async fn get_emote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Emote>, ApiError> {
    state
        .store
        .find_by_id(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Unknown Emote".to_string()))
}

/// Get an emote's status and its latest processing stage
#[instrument(skip(state))]
async fn get_emote_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let emote = state
        .store
        .find_by_id(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Unknown Emote".to_string()))?;

    let processing_stage = match state.cache.get(&id).await {
        Ok(stage) => stage,
        Err(e) => {
            warn!(error = %e, "Failed to read processing stage");
            None
        }
    };

    Ok(Json(StatusResponse {
        id: emote.id,
        status: emote.status,
        processing_stage,
    }))
}

/// Start the API server, draining in-flight requests once `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting emote API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
