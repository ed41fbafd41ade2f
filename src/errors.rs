//! Error kinds shared by the whole crate.
//!
//! One `thiserror` enum per the semantic kinds of spec §7, mapped to HTTP
//! status codes at the control-plane boundary the way `api_auth::error`
//! maps its auth error codes.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("insufficient buying power: need {needed}, have {available}")]
    InsufficientBuyingPower { needed: String, available: String },

    #[error("rejected by policy: {0}")]
    RejectedByPolicy(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SimError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SimError::NotFound(_) => StatusCode::NOT_FOUND,
            SimError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            SimError::PreconditionFailed(_) => StatusCode::CONFLICT,
            SimError::InsufficientBuyingPower { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SimError::RejectedByPolicy(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SimError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SimError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SimError::NotFound(_) => "NOT_FOUND",
            SimError::InvalidArgument(_) => "INVALID_ARGUMENT",
            SimError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            SimError::InsufficientBuyingPower { .. } => "INSUFFICIENT_BUYING_POWER",
            SimError::RejectedByPolicy(_) => "REJECTED_BY_POLICY",
            SimError::Unavailable(_) => "UNAVAILABLE",
            SimError::Internal(_) => "INTERNAL",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl IntoResponse for SimError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type SimResult<T> = Result<T, SimError>;
