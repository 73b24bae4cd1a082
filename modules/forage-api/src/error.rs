use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use forage_common::ForageError;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Forage(#[from] ForageError),

    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        let e = match self {
            Self::Unauthorized(_) => return StatusCode::UNAUTHORIZED,
            Self::Forage(e) => e,
        };
        match e {
            ForageError::Validation(_) => StatusCode::BAD_REQUEST,
            ForageError::NotFound { .. } => StatusCode::NOT_FOUND,
            ForageError::Duplicate { .. }
            | ForageError::InvalidTransition { .. }
            | ForageError::StrategyDeprecated { .. } => StatusCode::CONFLICT,
            ForageError::BudgetExceeded { .. } | ForageError::RateLimited(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ForageError::Signature(_) | ForageError::StaleTimestamp { .. } => {
                StatusCode::UNAUTHORIZED
            }
            ForageError::Config(_) | ForageError::Store(_) | ForageError::Anyhow(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::Forage(e) if e.is_retryable())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, "Request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (
            status,
            Json(json!({ "error": message, "retryable": self.retryable() })),
        )
            .into_response()
    }
}
