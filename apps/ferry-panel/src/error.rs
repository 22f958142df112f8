use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

/// A business rule refused the request. Carried inside `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Not logged in or session expired")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Throttled(String),
}

pub fn rejected(msg: impl Into<String>) -> anyhow::Error {
    ServiceError::Rejected(msg.into()).into()
}

pub fn not_found(msg: impl Into<String>) -> anyhow::Error {
    ServiceError::NotFound(msg.into()).into()
}

pub fn throttled(msg: impl Into<String>) -> anyhow::Error {
    ServiceError::Throttled(msg.into()).into()
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
    #[error("{0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn parts(&self) -> (StatusCode, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Internal(err) => match err.downcast_ref::<ServiceError>() {
                Some(ServiceError::Rejected(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
                Some(ServiceError::NotFound(msg)) => (StatusCode::NOT_FOUND, msg.clone()),
                Some(e @ ServiceError::Unauthorized) => (StatusCode::UNAUTHORIZED, e.to_string()),
                Some(ServiceError::Forbidden(msg)) => (StatusCode::FORBIDDEN, msg.clone()),
                Some(ServiceError::Throttled(msg)) => (StatusCode::TOO_MANY_REQUESTS, msg.clone()),
                None => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                ),
            },
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.parts();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {:#}", self);
        }
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

/// Success envelope, `{"data": ...}`.
pub fn data<T: Serialize>(value: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "data": value }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn service_errors_map_to_client_statuses() {
        let err: ApiError = rejected("Coupon expired").into();
        assert_eq!(err.parts(), (StatusCode::BAD_REQUEST, "Coupon expired".into()));

        let err: ApiError = throttled("Slow down").into();
        assert_eq!(err.parts().0, StatusCode::TOO_MANY_REQUESTS);

        let err: ApiError = ServiceError::Unauthorized.into();
        assert_eq!(err.parts().0, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn context_does_not_hide_service_error() {
        let inner: anyhow::Result<()> = Err(not_found("Order does not exist"));
        let err: ApiError = inner.context("Failed to load order").unwrap_err().into();
        assert_eq!(err.parts().0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn internal_errors_are_generic() {
        let err: ApiError = anyhow::anyhow!("connection refused").into();
        assert_eq!(
            err.parts(),
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
        );
    }
}
