use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ccx_sync::StoreError;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation failed")]
    Validation(Value),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("Database unavailable")]
    Unavailable(String),
    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Database(sqlx_err) if is_connectivity(sqlx_err) => {
                ApiError::Unavailable(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}

fn is_connectivity(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Validation(details) => json!({ "error": self.to_string(), "details": details }),
            ApiError::Unavailable(cause) => {
                error!(error = %cause, "store unavailable");
                json!({ "error": self.to_string(), "details": cause })
            }
            ApiError::Internal(cause) => {
                error!(error = %cause, "request failed");
                json!({ "error": self.to_string() })
            }
            ApiError::NotFound(_) => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
