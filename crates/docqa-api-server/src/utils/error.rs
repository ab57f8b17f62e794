use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {message}")]
    Forbidden { message: String, requires_auth: bool },

    #[error("Cross-owner request not allowed: {0}")]
    CrossOwnerNotAllowed(String),

    #[error("Conflicting model override: {0}")]
    ConflictingModelOverride(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Map a catalog store failure onto the taxonomy. Transient pool/network
    /// conditions are retryable by the caller; everything else is internal.
    pub fn from_store(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                ApiError::ServiceUnavailable(format!("catalog store: {}", err))
            }
            _ => ApiError::Internal(format!("catalog store: {}", err)),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ValidationFailed(_)
            | ApiError::CrossOwnerNotAllowed(_)
            | ApiError::ConflictingModelOverride(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ProviderRejected(_) => StatusCode::BAD_GATEWAY,
            ApiError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    requires_auth: Option<bool>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_type, message, requires_auth) = match self {
            ApiError::ValidationFailed(msg) => {
                tracing::warn!("Validation failed: {}", msg);
                ("ValidationFailed", msg, None)
            }
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                ("NotFound", msg, None)
            }
            ApiError::Forbidden {
                message,
                requires_auth,
            } => {
                tracing::warn!("Forbidden: {}", message);
                ("Forbidden", message, Some(requires_auth))
            }
            ApiError::CrossOwnerNotAllowed(msg) => {
                tracing::warn!("Cross-owner rejected: {}", msg);
                ("CrossOwnerNotAllowed", msg, None)
            }
            ApiError::ConflictingModelOverride(msg) => {
                tracing::warn!("Conflicting model override: {}", msg);
                ("ConflictingModelOverride", msg, None)
            }
            ApiError::ServiceUnavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                ("ServiceUnavailable", msg, None)
            }
            ApiError::ProviderRejected(msg) => {
                tracing::error!("Provider rejected: {}", msg);
                ("ProviderRejected", msg, None)
            }
            ApiError::UpstreamTimeout(msg) => {
                tracing::error!("Upstream timeout: {}", msg);
                ("UpstreamTimeout", msg, None)
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ("Internal", msg, None)
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            requires_auth,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(
            ApiError::ValidationFailed("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Forbidden {
                message: "x".into(),
                requires_auth: true
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::CrossOwnerNotAllowed("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::ConflictingModelOverride("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::ServiceUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::ProviderRejected("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::UpstreamTimeout("x".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
