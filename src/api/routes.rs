//! REST endpoints for relay administration and statistics.
//!
//! Mutating endpoints require an `x-actor-id` header naming a configured
//! administrator. Every mutation is audited by the service it calls.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use super::AppState;
use crate::error::{AdminError, BackfillError, DatabaseError};
use crate::message::{ActorId, ChannelId};
use crate::policy::PauseScope;

pub const ACTOR_HEADER: &str = "x-actor-id";

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

/// Build the relay API router.
pub fn relay_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(get_stats))
        .route("/api/errors", get(list_errors))
        .route("/api/audit", get(list_audit))
        .route("/api/settings", get(get_settings))
        .route("/api/settings/{key}", put(put_setting))
        .route("/api/pause", post(pause))
        .route("/api/resume", post(resume))
        .route(
            "/api/whitelist/{channel}",
            post(whitelist_add).delete(whitelist_remove),
        )
        .route(
            "/api/blacklist/{channel}",
            post(blacklist_add).delete(blacklist_remove),
        )
        .route("/api/backfill/{channel}/start", post(backfill_start))
        .route("/api/backfill/{channel}/reset", post(backfill_reset))
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"error": message.to_string()})))
}

fn database_error(e: DatabaseError) -> (StatusCode, Json<Value>) {
    warn!(error = %e, "API request failed on store");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, e)
}

fn admin_error(e: AdminError) -> (StatusCode, Json<Value>) {
    match e {
        AdminError::Unauthorized(_) => error_body(StatusCode::FORBIDDEN, e),
        AdminError::UnknownSetting(_) => error_body(StatusCode::NOT_FOUND, e),
        AdminError::InvalidSetting { .. } => error_body(StatusCode::BAD_REQUEST, e),
        AdminError::Database(e) => database_error(e),
    }
}

fn backfill_error(e: BackfillError) -> (StatusCode, Json<Value>) {
    match e {
        BackfillError::Running { .. } => error_body(StatusCode::CONFLICT, e),
        BackfillError::UnknownChannel { .. } => error_body(StatusCode::NOT_FOUND, e),
        BackfillError::HistoryUnsupported { .. } => error_body(StatusCode::UNPROCESSABLE_ENTITY, e),
        BackfillError::Database(e) => database_error(e),
    }
}

/// Resolve and authorize the acting administrator.
fn actor(state: &AppState, headers: &HeaderMap) -> Result<ActorId, (StatusCode, Json<Value>)> {
    let Some(raw) = headers.get(ACTOR_HEADER) else {
        return Err(error_body(
            StatusCode::UNAUTHORIZED,
            format!("missing {ACTOR_HEADER} header"),
        ));
    };
    let actor = raw
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<ActorId>().ok())
        .ok_or_else(|| {
            error_body(
                StatusCode::UNAUTHORIZED,
                format!("invalid {ACTOR_HEADER} header"),
            )
        })?;
    state.admin.authorize(actor).map_err(admin_error)?;
    Ok(actor)
}

fn snapshot_ok(snapshot: &crate::policy::PolicySnapshot) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!(snapshot)))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "channel-relay"
    }))
}

// ── Statistics ──────────────────────────────────────────────────────────

async fn get_stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.stats.collect().await.map_err(database_error)?;
    Ok((StatusCode::OK, Json(json!(stats))))
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    actor: Option<ActorId>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

async fn list_errors(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult {
    let errors = state
        .recorder
        .recent_errors(q.limit())
        .await
        .map_err(database_error)?;
    Ok((StatusCode::OK, Json(json!(errors))))
}

async fn list_audit(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult {
    let entries = state
        .recorder
        .audit_log(q.limit(), q.actor)
        .await
        .map_err(database_error)?;
    let mut body = json!({ "entries": entries });
    if let Some(actor) = q.actor {
        let breakdown = state
            .recorder
            .actor_breakdown(actor)
            .await
            .map_err(database_error)?;
        body["actions"] = json!(breakdown);
    }
    Ok((StatusCode::OK, Json(body)))
}

// ── Settings ────────────────────────────────────────────────────────────

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.admin.settings().await)
}

#[derive(Deserialize)]
struct SettingRequest {
    value: String,
}

async fn put_setting(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<SettingRequest>,
) -> ApiResult {
    let actor = actor(&state, &headers)?;
    state
        .admin
        .update_setting(actor, &key, &body.value)
        .await
        .map_err(admin_error)?;
    Ok((StatusCode::OK, Json(json!(state.admin.settings().await))))
}

// ── Pause ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PauseRequest {
    /// Absent means global.
    #[serde(default)]
    channel: Option<ChannelId>,
    #[serde(default)]
    reason: Option<String>,
}

impl PauseRequest {
    fn scope(&self) -> PauseScope {
        self.channel.map_or(PauseScope::Global, PauseScope::Channel)
    }
}

async fn pause(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PauseRequest>,
) -> ApiResult {
    let actor = actor(&state, &headers)?;
    let snapshot = state
        .admin
        .pause(actor, body.scope(), body.reason.clone().unwrap_or_default())
        .await
        .map_err(admin_error)?;
    Ok(snapshot_ok(&snapshot))
}

async fn resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PauseRequest>,
) -> ApiResult {
    let actor = actor(&state, &headers)?;
    let snapshot = state
        .admin
        .resume(actor, body.scope())
        .await
        .map_err(admin_error)?;
    Ok(snapshot_ok(&snapshot))
}

// ── Channel lists ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn whitelist_add(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<ChannelId>,
    Json(body): Json<ListRequest>,
) -> ApiResult {
    let actor = actor(&state, &headers)?;
    let snapshot = state
        .admin
        .whitelist_add(actor, channel, body.reason)
        .await
        .map_err(admin_error)?;
    Ok(snapshot_ok(&snapshot))
}

async fn whitelist_remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<ChannelId>,
) -> ApiResult {
    let actor = actor(&state, &headers)?;
    let snapshot = state
        .admin
        .whitelist_remove(actor, channel)
        .await
        .map_err(admin_error)?;
    Ok(snapshot_ok(&snapshot))
}

async fn blacklist_add(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<ChannelId>,
    Json(body): Json<ListRequest>,
) -> ApiResult {
    let actor = actor(&state, &headers)?;
    let snapshot = state
        .admin
        .blacklist_add(actor, channel, body.reason)
        .await
        .map_err(admin_error)?;
    Ok(snapshot_ok(&snapshot))
}

async fn blacklist_remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<ChannelId>,
) -> ApiResult {
    let actor = actor(&state, &headers)?;
    let snapshot = state
        .admin
        .blacklist_remove(actor, channel)
        .await
        .map_err(admin_error)?;
    Ok(snapshot_ok(&snapshot))
}

// ── Backfill ────────────────────────────────────────────────────────────

async fn backfill_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<ChannelId>,
) -> ApiResult {
    let actor = actor(&state, &headers)?;
    let backfill_state = state
        .backfill
        .start(actor, channel)
        .await
        .map_err(backfill_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"channel_id": channel, "state": backfill_state})),
    ))
}

async fn backfill_reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel): Path<ChannelId>,
) -> ApiResult {
    let actor = actor(&state, &headers)?;
    state
        .backfill
        .reset(actor, channel)
        .await
        .map_err(backfill_error)?;
    Ok((
        StatusCode::OK,
        Json(json!({"channel_id": channel, "state": "idle"})),
    ))
}
