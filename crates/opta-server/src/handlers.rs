//! HTTP handlers. Every route except `/health` sits behind bearer auth.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use opta_core::envelope::Envelope;
use opta_core::ids::{PermissionRequestId, SessionId};
use opta_core::session::{CreateSessionOptions, SessionRecord};
use opta_core::turn::{CancelFilter, CancelOutcome, TurnRequest};
use opta_engine::{PermissionDecision, RuntimeStats, SessionView, SubmitReceipt, WatchdogStatus};
use opta_upstream::UpstreamSnapshot;

use crate::error::ApiError;
use crate::server::AppState;

type ApiResult<T> = Result<T, ApiError>;
type Body<T> = Result<Json<T>, JsonRejection>;

pub async fn create_session(
    State(state): State<AppState>,
    body: Body<CreateSessionOptions>,
) -> ApiResult<(StatusCode, Json<SessionRecord>)> {
    let Json(opts) = body?;
    let record = state.sessions.create_session(opts)?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.sessions.list_sessions() }))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Json<SessionView>> {
    Ok(Json(state.sessions.get_session(&session_id)?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<Json<Value>> {
    state.sessions.delete_session(&session_id)?;
    state.clients.disconnect_session(&session_id);
    Ok(Json(json!({ "deleted": true })))
}

pub async fn submit_turn(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    body: Body<TurnRequest>,
) -> ApiResult<(StatusCode, Json<SubmitReceipt>)> {
    let Json(request) = body?;
    let receipt = state.sessions.submit_turn(&session_id, request)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    #[serde(default)]
    pub after_seq: u64,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub events: Vec<Envelope>,
    pub last_seq: u64,
}

pub async fn events(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> ApiResult<Json<EventsPage>> {
    let Query(query) = query?;
    let last_seq = state.sessions.last_seq(&session_id)?;
    let events = state
        .sessions
        .events_after(&session_id, query.after_seq, query.limit)?;
    Ok(Json(EventsPage { events, last_seq }))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    body: Body<CancelFilter>,
) -> ApiResult<Json<CancelOutcome>> {
    let Json(filter) = body?;
    Ok(Json(state.sessions.cancel_session_turns(&session_id, filter)?))
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub decision: PermissionDecision,
}

pub async fn resolve_permission(
    State(state): State<AppState>,
    Path((session_id, request_id)): Path<(SessionId, PermissionRequestId)>,
    body: Body<ResolveBody>,
) -> ApiResult<Json<Value>> {
    let Json(ResolveBody { decision }) = body?;
    state
        .sessions
        .resolve_permission(&session_id, &request_id, decision)?;
    Ok(Json(json!({ "resolved": true })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    #[serde(flatten)]
    pub runtime: RuntimeStats,
    pub connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog: Option<WatchdogStatus>,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        runtime: state.sessions.runtime_stats(),
        connections: state.clients.count(),
        upstream: state.upstream.as_ref().map(|u| u.snapshot()),
        watchdog: state.watchdog.as_ref().map(|w| w.status()),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "daemonId": state.sessions.sequencer().daemon_id(),
        "uptimeSecs": state.started.elapsed().as_secs(),
        "connections": state.clients.count(),
        "sessions": state.sessions.runtime_stats().sessions,
    }))
}
