//! HTTP control-plane handlers (spec §6 endpoint table). Each handler is a
//! thin translation from an axum extractor to a `SessionManager` call;
//! `SimError`'s `IntoResponse` impl does the status-code mapping.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::config::SessionConfig;
use crate::core_types::{Nanos, OrderId, SessionId, Symbol};
use crate::errors::SimResult;
use crate::ledger::{Account, Position};
use crate::matching_engine::SubmitRequest;
use crate::money::Price;
use crate::orderbook::{Order, OrderStatus};

use super::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionSummary {
    pub id: SessionId,
    pub status: String,
    pub watermark_ns: Nanos,
    pub events_processed: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

#[utoipa::path(post, path = "/sessions", responses((status = 200, body = CreateSessionResponse)))]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(config): Json<SessionConfig>,
) -> SimResult<Json<CreateSessionResponse>> {
    let session_id = state.sessions.create(config)?;
    Ok(Json(CreateSessionResponse { session_id }))
}

#[utoipa::path(get, path = "/sessions", responses((status = 200, body = [SessionSummary])))]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> SimResult<Json<Vec<SessionSummary>>> {
    let mut summaries = Vec::new();
    for id in state.sessions.list() {
        let Ok(status) = state.sessions.status(id) else {
            continue;
        };
        summaries.push(SessionSummary {
            id,
            status: format!("{status:?}"),
            watermark_ns: state.sessions.get_watermark(id).unwrap_or(0),
            events_processed: state.sessions.get(id).map(|h| h.events_processed()).unwrap_or(0),
        });
    }
    Ok(Json(summaries))
}

#[utoipa::path(get, path = "/sessions/{id}", responses((status = 200, body = SessionSummary)))]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> SimResult<Json<SessionSummary>> {
    let status = state.sessions.status(id)?;
    Ok(Json(SessionSummary {
        id,
        status: format!("{status:?}"),
        watermark_ns: state.sessions.get_watermark(id)?,
        events_processed: state.sessions.get(id)?.events_processed(),
    }))
}

#[utoipa::path(post, path = "/sessions/{id}/start", responses((status = 200)))]
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> SimResult<StatusCode> {
    state.sessions.start(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(post, path = "/sessions/{id}/pause", responses((status = 200)))]
pub async fn pause_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> SimResult<StatusCode> {
    state.sessions.pause(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(post, path = "/sessions/{id}/resume", responses((status = 200)))]
pub async fn resume_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> SimResult<StatusCode> {
    state.sessions.resume(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(post, path = "/sessions/{id}/stop", responses((status = 200)))]
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> SimResult<StatusCode> {
    state.sessions.stop(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(delete, path = "/sessions/{id}", responses((status = 200)))]
pub async fn destroy_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> SimResult<StatusCode> {
    state.sessions.destroy(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SpeedRequest {
    pub factor: f64,
}

#[utoipa::path(post, path = "/sessions/{id}/speed", responses((status = 200)))]
pub async fn set_speed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(body): Json<SpeedRequest>,
) -> SimResult<StatusCode> {
    state.sessions.set_speed(id, body.factor).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TargetNsRequest {
    pub target_ns: Nanos,
}

#[utoipa::path(post, path = "/sessions/{id}/jump", responses((status = 200)))]
pub async fn jump_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(body): Json<TargetNsRequest>,
) -> SimResult<StatusCode> {
    state.sessions.jump(id, body.target_ns).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(post, path = "/sessions/{id}/fast_forward", responses((status = 200)))]
pub async fn fast_forward_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(body): Json<TargetNsRequest>,
) -> SimResult<StatusCode> {
    state.sessions.fast_forward(id, body.target_ns).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(post, path = "/sessions/{id}/orders", responses((status = 200)))]
pub async fn submit_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(req): Json<SubmitRequest>,
) -> SimResult<Json<Order>> {
    let order = state.sessions.submit_order(id, req).await?;
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    pub status: Option<OrderStatus>,
}

#[utoipa::path(get, path = "/sessions/{id}/orders", responses((status = 200)))]
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Query(query): Query<OrdersQuery>,
) -> SimResult<Json<Vec<Order>>> {
    let orders = state.sessions.list_orders(id, query.status).await?;
    Ok(Json(orders))
}

#[utoipa::path(post, path = "/sessions/{id}/orders/{order_id}/cancel", responses((status = 200)))]
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path((id, order_id)): Path<(SessionId, OrderId)>,
) -> SimResult<Json<Order>> {
    let order = state.sessions.cancel_order(id, order_id).await?;
    Ok(Json(order))
}

#[utoipa::path(get, path = "/sessions/{id}/account", responses((status = 200)))]
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> SimResult<Json<Account>> {
    Ok(Json(state.sessions.get_account(id).await?))
}

#[derive(Debug, Serialize)]
pub struct PerformanceResponse {
    pub account: Account,
    pub positions: Vec<(Symbol, Position)>,
    pub events_processed: u64,
    pub watermark_ns: Nanos,
}

#[utoipa::path(get, path = "/sessions/{id}/performance", responses((status = 200)))]
pub async fn get_performance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> SimResult<Json<PerformanceResponse>> {
    let snapshot = state.sessions.get_performance(id).await?;
    Ok(Json(PerformanceResponse {
        account: snapshot.account,
        positions: snapshot.positions,
        events_processed: snapshot.events_processed,
        watermark_ns: snapshot.watermark_ns,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WatermarkResponse {
    pub current_ns: Nanos,
}

#[utoipa::path(get, path = "/sessions/{id}/watermark", responses((status = 200, body = WatermarkResponse)))]
pub async fn get_watermark(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
) -> SimResult<Json<WatermarkResponse>> {
    Ok(Json(WatermarkResponse {
        current_ns: state.sessions.get_watermark(id)?,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DividendRequest {
    pub symbol: String,
    pub amount_per_share: Decimal,
}

#[utoipa::path(post, path = "/sessions/{id}/corporate_actions/dividend", responses((status = 200)))]
pub async fn apply_dividend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(body): Json<DividendRequest>,
) -> SimResult<StatusCode> {
    state
        .sessions
        .apply_dividend(id, Symbol::new(body.symbol), Price::new(body.amount_per_share))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SplitRequest {
    pub symbol: String,
    pub ratio: Decimal,
}

#[utoipa::path(post, path = "/sessions/{id}/corporate_actions/split", responses((status = 200)))]
pub async fn apply_split(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SessionId>,
    Json(body): Json<SplitRequest>,
) -> SimResult<StatusCode> {
    state
        .sessions
        .apply_split(id, Symbol::new(body.symbol), body.ratio)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub git_hash: &'static str,
}

#[utoipa::path(get, path = "/healthz", responses((status = 200, body = HealthResponse)))]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_sessions: state.sessions.list().len(),
        git_hash: env!("GIT_HASH"),
    })
}
