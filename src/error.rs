// =============================================================================
// ERROR MODULE
// =============================================================================
// Domain error taxonomy and its mapping to HTTP responses. Every domain-rule
// violation is recovered here and returned as a structured JSON body; only
// infrastructure failures surface as a generic 500.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

#[derive(Debug, Error)]
pub enum AppError {
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Malformed or missing input, unknown referenced entity inside a
    /// request body, past pickup date, empty item list
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested quantity exceeds what the stock row holds
    #[error("Insufficient stock for {medicine}: available {available}, requested {requested}")]
    InsufficientStock {
        medicine: String,
        available: i32,
        requested: i32,
    },

    /// Operation requested on a reservation whose state does not permit it
    #[error("Illegal transition from '{from}' to '{to}'")]
    IllegalTransition { from: String, to: String },

    /// No usable identity on a protected route
    #[error("Authentication required")]
    Unauthorized,

    /// Actor lacks role/ownership over the target
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Target does not resolve, or resolves outside the caller's visibility
    /// scope (reported identically, so existence never leaks)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }

            // Surfaced as a validation-class 400, not a 409: the client can
            // fix the request by lowering the quantity.
            AppError::InsufficientStock { .. } => {
                (StatusCode::BAD_REQUEST, "INSUFFICIENT_STOCK", self.to_string())
            }

            AppError::IllegalTransition { .. } => {
                (StatusCode::BAD_REQUEST, "ILLEGAL_TRANSITION", self.to_string())
            }

            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required".to_string(),
            ),

            AppError::PermissionDenied(msg) => {
                (StatusCode::FORBIDDEN, "PERMISSION_DENIED", msg.clone())
            }

            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),

            // Internal details stay out of the response body.
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),

            AppError::Redis(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CACHE_ERROR",
                "A cache error occurred".to_string(),
            ),

            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error_code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code, message = %message, "Request rejected");
        }

        let body = ErrorResponse::new(error_code, message);
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn domain_errors_map_to_4xx() {
        assert_eq!(
            status_of(AppError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(AppError::InsufficientStock {
                medicine: "Paracetamol".into(),
                available: 2,
                requested: 5,
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(AppError::IllegalTransition {
                from: "collected".into(),
                to: "ready".into(),
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(AppError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(AppError::PermissionDenied("nope".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(AppError::NotFound("reservation".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn infrastructure_errors_map_to_500() {
        assert_eq!(
            status_of(AppError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(AppError::Database(sqlx::Error::PoolClosed)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn illegal_transition_names_both_states() {
        let err = AppError::IllegalTransition {
            from: "cancelled".into(),
            to: "ready".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cancelled"));
        assert!(msg.contains("ready"));
    }
}
