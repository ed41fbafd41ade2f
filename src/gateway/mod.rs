pub mod handlers;
pub mod openapi;
pub mod state;
pub mod ws;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header::AUTHORIZATION},
    middleware::{Next, from_fn_with_state},
    response::Response,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;

use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

/// Rejects requests missing a matching `Authorization: Bearer <token>` header.
/// A no-op when `AppConfig.auth_token` is unset (local/dev mode).
async fn bearer_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.app_config.auth_token.as_deref() else {
        return Ok(next.run(request).await);
    };
    let supplied = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if supplied != Some(expected) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

pub async fn run_server(bind_addr: String, state: Arc<AppState>) {
    let session_routes = Router::new()
        .route("/", post(handlers::create_session).get(handlers::list_sessions))
        .route("/{id}", get(handlers::get_session).delete(handlers::destroy_session))
        .route("/{id}/start", post(handlers::start_session))
        .route("/{id}/pause", post(handlers::pause_session))
        .route("/{id}/resume", post(handlers::resume_session))
        .route("/{id}/stop", post(handlers::stop_session))
        .route("/{id}/speed", post(handlers::set_speed))
        .route("/{id}/jump", post(handlers::jump_session))
        .route("/{id}/fast_forward", post(handlers::fast_forward_session))
        .route("/{id}/orders", post(handlers::submit_order).get(handlers::list_orders))
        .route("/{id}/orders/{order_id}/cancel", post(handlers::cancel_order))
        .route("/{id}/account", get(handlers::get_account))
        .route("/{id}/performance", get(handlers::get_performance))
        .route("/{id}/watermark", get(handlers::get_watermark))
        .route("/{id}/corporate_actions/dividend", post(handlers::apply_dividend))
        .route("/{id}/corporate_actions/split", post(handlers::apply_split))
        .layer(from_fn_with_state(state.clone(), bearer_auth_middleware));

    let app = Router::new()
        .route("/healthz", get(handlers::health_check))
        .route("/stream/{session_id}", get(ws::stream_handler))
        .nest("/sessions", session_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()));

    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %bind_addr, error = %err, "failed to bind gateway listener");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %bind_addr, "gateway listening");
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "gateway server error");
        std::process::exit(1);
    }
}
