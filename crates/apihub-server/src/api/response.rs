//! API response types
//!
//! Standard envelopes for successful and failed requests.

use apihub_common::error::ApiError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Standard success response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Create a new success response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            meta: None,
        }
    }

    /// Create a success response with metadata
    pub fn success_with_meta(data: T, meta: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            meta: Some(meta),
        }
    }

    /// Same envelope, answered with `201 Created`
    pub fn created(self) -> (StatusCode, Json<Self>) {
        (StatusCode::CREATED, Json(self))
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Standard error response
///
/// ```json
/// {"success": false, "status": 409, "code": "BuildAlreadyFinished",
///  "message": "Build 'b1' is already finished with status 'complete'",
///  "params": {"id": "b1", "status": "complete"}}
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub status: u16,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl ErrorResponse {
    pub fn from_api_error(err: &ApiError) -> Self {
        Self {
            success: false,
            status: err.status_code(),
            code: err.code.clone(),
            message: err.message(),
            params: err.params.clone(),
            debug: err.debug.clone(),
        }
    }
}

/// Pagination metadata for list responses
#[derive(Debug, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub limit: i64,
    pub offset: i64,
    pub returned: usize,
}

impl PaginationMeta {
    pub fn new(limit: i64, offset: i64, returned: usize) -> Self {
        Self {
            limit,
            offset,
            returned,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apihub_common::error::codes;

    #[test]
    fn test_error_response_shape() {
        let err = ApiError::new(codes::REVISION_CONFLICT)
            .param("revision", 5)
            .param("version", "1.0")
            .param("expected", 3);
        let body = serde_json::to_value(ErrorResponse::from_api_error(&err)).unwrap();

        assert_eq!(body["success"], false);
        assert_eq!(body["status"], 409);
        assert_eq!(body["code"], "RevisionConflict");
        assert_eq!(
            body["message"],
            "Revision 5 of version '1.0' conflicts with expected revision 3"
        );
        assert_eq!(body["params"]["expected"], "3");
        assert!(body.get("debug").is_none());
    }

    #[test]
    fn test_success_envelope() {
        let body = serde_json::to_value(ApiResponse::success(vec![1, 2])).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"][1], 2);
        assert!(body.get("meta").is_none());
    }
}
