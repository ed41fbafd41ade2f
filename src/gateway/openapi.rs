//! OpenAPI / Swagger UI documentation.
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::OpenApi;

use super::handlers::{CreateSessionResponse, HealthResponse, SessionSummary, WatermarkResponse};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Broker Replay Simulator API",
        version = "1.0.0",
        description = "Historical market-data broker simulator control plane and vendor-compatible streams.",
        license(name = "MIT")
    ),
    paths(
        super::handlers::health_check,
        super::handlers::create_session,
        super::handlers::list_sessions,
        super::handlers::get_session,
        super::handlers::start_session,
        super::handlers::pause_session,
        super::handlers::resume_session,
        super::handlers::stop_session,
        super::handlers::destroy_session,
        super::handlers::set_speed,
        super::handlers::jump_session,
        super::handlers::fast_forward_session,
        super::handlers::submit_order,
        super::handlers::list_orders,
        super::handlers::cancel_order,
        super::handlers::get_account,
        super::handlers::get_performance,
        super::handlers::get_watermark,
        super::handlers::apply_dividend,
        super::handlers::apply_split,
    ),
    components(schemas(HealthResponse, CreateSessionResponse, SessionSummary, WatermarkResponse)),
    tags(
        (name = "Sessions", description = "Session lifecycle and control"),
        (name = "Orders", description = "Order submission and cancellation"),
        (name = "System", description = "Health checks"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_spec_generates() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "Broker Replay Simulator API");
    }

    #[test]
    fn health_path_registered() {
        let spec = ApiDoc::openapi();
        assert!(spec.paths.paths.contains_key("/healthz"));
    }
}
