//! Server-specific error types
//!
//! Every module error converts into [`AppError`], which renders the stable
//! error code, the substituted message and the raw parameters.

use apihub_common::error::{codes, ApiError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::response::ErrorResponse;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The caller-facing error this renders as
    pub fn to_api_error(&self) -> ApiError {
        match self {
            AppError::Api(err) => err.clone(),
            AppError::Database(_) => ApiError::new(codes::INTERNAL_SERVER_ERROR)
                .debug("A database error occurred"),
            AppError::Internal(message) => {
                ApiError::new(codes::INTERNAL_SERVER_ERROR).debug(message.clone())
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Database(ref e) => tracing::error!(error = ?e, "Database error"),
            AppError::Internal(ref message) => tracing::error!("Internal error: {}", message),
            AppError::Api(ref e) if e.status_code() >= 500 => {
                tracing::error!(code = %e.code, debug = ?e.debug, "Request failed")
            },
            AppError::Api(ref e) => tracing::debug!(code = %e.code, "Request rejected"),
        }

        let api_error = self.to_api_error();
        let status = StatusCode::from_u16(api_error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (status, Json(ErrorResponse::from_api_error(&api_error))).into_response()
    }
}

impl From<crate::db::DbError> for AppError {
    fn from(err: crate::db::DbError) -> Self {
        match err {
            crate::db::DbError::Api(e) => AppError::Api(e),
            crate::db::DbError::Sqlx(e) => AppError::Database(e),
            crate::db::DbError::Config(msg) => AppError::Internal(msg),
        }
    }
}

impl From<crate::queue::QueueError> for AppError {
    fn from(err: crate::queue::QueueError) -> Self {
        match err {
            crate::queue::QueueError::Api(e) => AppError::Api(e),
            crate::queue::QueueError::Database(e) => AppError::Database(e),
            crate::queue::QueueError::Store(e) => e.into(),
            crate::queue::QueueError::Serialization(e) => {
                AppError::Internal(format!("Stored build config is unreadable: {}", e))
            },
        }
    }
}

impl From<crate::publish::PublishError> for AppError {
    fn from(err: crate::publish::PublishError) -> Self {
        match err {
            crate::publish::PublishError::Api(e) => AppError::Api(e),
            crate::publish::PublishError::Database(e) => AppError::Database(e),
            crate::publish::PublishError::Store(e) => e.into(),
            crate::publish::PublishError::Serialization(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<crate::changelog::ChangelogError> for AppError {
    fn from(err: crate::changelog::ChangelogError) -> Self {
        match err {
            crate::changelog::ChangelogError::Api(e) => AppError::Api(e),
            crate::changelog::ChangelogError::Database(e) => AppError::Database(e),
            crate::changelog::ChangelogError::Store(e) => e.into(),
            crate::changelog::ChangelogError::Queue(e) => e.into(),
        }
    }
}

impl From<crate::groups::GroupError> for AppError {
    fn from(err: crate::groups::GroupError) -> Self {
        match err {
            crate::groups::GroupError::Api(e) => AppError::Api(e),
            crate::groups::GroupError::Database(e) => AppError::Database(e),
            crate::groups::GroupError::Store(e) => e.into(),
        }
    }
}

impl From<apihub_common::ApihubError> for AppError {
    fn from(err: apihub_common::ApihubError) -> Self {
        AppError::Api(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_keeps_status() {
        let err: AppError = ApiError::new(codes::BUILD_ALREADY_FINISHED)
            .param("id", "b1")
            .param("status", "complete")
            .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_database_error_is_500_without_details() {
        let err = AppError::Database(sqlx::Error::RowNotFound);
        let api = err.to_api_error();
        assert_eq!(api.code, "InternalServerError");
        assert_eq!(api.debug.as_deref(), Some("A database error occurred"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_upstream_kinds_map_to_424() {
        let err: AppError = ApiError::new(codes::UPSTREAM_TIMEOUT).param("target", "git").into();
        assert_eq!(err.into_response().status(), StatusCode::FAILED_DEPENDENCY);
    }
}
