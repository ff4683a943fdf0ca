//! HTTP/JSON routes over [`SyncService`].
//!
//! Every `/api` route requires `x-session-key` and accepts an optional
//! `x-actor-id`. Errors map onto status codes:
//!
//! | error              | status | body                          |
//! |--------------------|--------|-------------------------------|
//! | validation         | 400    | `{error}`                     |
//! | version conflict   | 409    | `{expectedVersion}`           |
//! | store / presence   | 503    | `{error, retryable: true}`    |

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use benchsync_client::http::{ACTOR_ID_HEADER, SESSION_KEY_HEADER};
use benchsync_core::{
    HeartbeatResponse, LogEntry, ModuleKind, NewLogEntry, PresenceEntry, SessionKey, StateEvent,
    SyncError, Versioned, WriteRequest,
};

use crate::service::{Caller, SyncService};

pub fn router(service: Arc<SyncService>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/api/state/{module_kind}",
            get(load_state).put(write_state),
        )
        .route("/api/state/{module_kind}/history", get(history))
        .route("/api/presence/heartbeat", post(heartbeat))
        .route("/api/presence", get(list_peers))
        .route("/api/log", get(list_log).post(append_log))
        .with_state(service)
}

// ─── Errors ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(SyncError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(SyncError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            SyncError::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            SyncError::Conflict { expected_version } => (
                StatusCode::CONFLICT,
                Json(json!({ "expectedVersion": expected_version })),
            )
                .into_response(),
            SyncError::StoreUnavailable(message) | SyncError::Presence(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": message, "retryable": true })),
            )
                .into_response(),
        }
    }
}

// ─── Caller extraction ────────────────────────────────────────────

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(SESSION_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let session = SessionKey::parse(raw)
            .map_err(|_| SyncError::validation(format!("{SESSION_KEY_HEADER} header is required")))?;
        let actor = parts
            .headers
            .get(ACTOR_ID_HEADER)
            .and_then(|v| v.to_str().ok());
        Ok(Caller::new(session, actor))
    }
}

fn module_kind(raw: &str) -> Result<ModuleKind, ApiError> {
    raw.parse::<ModuleKind>().map_err(ApiError)
}

// ─── Handlers ─────────────────────────────────────────────────────

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn load_state(
    State(service): State<Arc<SyncService>>,
    caller: Caller,
    Path(kind): Path<String>,
) -> ApiResult<Option<Versioned<Value>>> {
    let kind = module_kind(&kind)?;
    let loaded = service
        .run(move |svc| svc.load_state(&caller, kind))
        .await?;
    Ok(Json(loaded))
}

async fn write_state(
    State(service): State<Arc<SyncService>>,
    caller: Caller,
    Path(kind): Path<String>,
    body: Result<Json<WriteRequest<Value>>, JsonRejection>,
) -> ApiResult<Versioned<Value>> {
    let kind = module_kind(&kind)?;
    let Json(request) = body?;
    let outcome = service
        .run(move |svc| svc.write_state(&caller, kind, request, Utc::now()))
        .await?;
    Ok(Json(outcome.into_result()?))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// History row as served over HTTP; the session is implied by the caller.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryItem {
    id: i64,
    actor_id: String,
    version: u64,
    state: Value,
    created_at: DateTime<Utc>,
}

impl From<StateEvent<Value>> for HistoryItem {
    fn from(event: StateEvent<Value>) -> Self {
        Self {
            id: event.id,
            actor_id: event.actor_id,
            version: event.version,
            state: event.state,
            created_at: event.created_at,
        }
    }
}

async fn history(
    State(service): State<Arc<SyncService>>,
    caller: Caller,
    Path(kind): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Vec<HistoryItem>> {
    let kind = module_kind(&kind)?;
    let Query(query) = query?;
    let events = service
        .run(move |svc| svc.history(&caller, kind, query.limit))
        .await?;
    Ok(Json(events.into_iter().map(HistoryItem::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageRequest {
    stage_slug: String,
}

async fn heartbeat(
    State(service): State<Arc<SyncService>>,
    caller: Caller,
    body: Result<Json<StageRequest>, JsonRejection>,
) -> ApiResult<HeartbeatResponse> {
    let Json(request) = body?;
    let response = service
        .run(move |svc| svc.heartbeat(&caller, &request.stage_slug, Utc::now()))
        .await?;
    Ok(Json(response))
}

async fn list_peers(
    State(service): State<Arc<SyncService>>,
    _caller: Caller,
    query: Result<Query<StageRequest>, QueryRejection>,
) -> ApiResult<Vec<PresenceEntry>> {
    let Query(query) = query?;
    let peers = service
        .run(move |svc| svc.list_peers(&query.stage_slug, Utc::now()))
        .await?;
    Ok(Json(peers))
}

async fn append_log(
    State(service): State<Arc<SyncService>>,
    caller: Caller,
    body: Result<Json<NewLogEntry>, JsonRejection>,
) -> Result<(StatusCode, Json<LogEntry>), ApiError> {
    let Json(entry) = body?;
    let confirmed = service
        .run(move |svc| svc.append_log(&caller, &entry, Utc::now()))
        .await?;
    Ok((StatusCode::CREATED, Json(confirmed)))
}

async fn list_log(
    State(service): State<Arc<SyncService>>,
    caller: Caller,
) -> ApiResult<Vec<LogEntry>> {
    let entries = service.run(move |svc| svc.list_log(&caller)).await?;
    Ok(Json(entries))
}
