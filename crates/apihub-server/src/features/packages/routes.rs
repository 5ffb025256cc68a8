//! Package API routes
//!
//! # Route Structure
//!
//! - `POST /api/v1/packages` - Create a package
//! - `GET /api/v1/packages/:id` - Get an undeleted package
//! - `DELETE /api/v1/packages/:id` - Tombstone a package and its descendants
//! - `POST /api/v1/packages/:id/move` - Record that the package moved to a new id
//! - `GET /api/v1/packages/:id/transition` - Where a moved package lives now

use apihub_common::error::{codes, ApiError};
use apihub_common::types::PackageKind;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::response::ApiResponse;
use crate::db::packages;
use crate::error::AppError;
use crate::features::shared::user_id;
use crate::features::FeatureState;

pub fn packages_routes() -> Router<FeatureState> {
    Router::new()
        .route("/", post(create_package))
        .route("/:id", get(get_package).delete(delete_package))
        .route("/:id/move", post(move_package))
        .route("/:id/transition", get(get_transition))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePackageRequest {
    pub id: String,
    pub kind: PackageKind,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MovePackageRequest {
    pub new_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionResponse {
    pub id: String,
    pub moved_to: Option<String>,
}

/// Create a package
///
/// ```json
/// {"id": "acme.billing", "kind": "package", "name": "Billing"}
/// ```
///
/// # Response
///
/// - `201 Created` - Package created
/// - `400 Bad Request` - Malformed id, or a top-level id that is not a workspace
/// - `404 Not Found` - Parent package does not exist
/// - `409 Conflict` - Package already exists
#[tracing::instrument(skip(state, headers, request), fields(id = %request.id, kind = %request.kind))]
async fn create_package(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Json(request): Json<CreatePackageRequest>,
) -> Result<Response, AppError> {
    let package = packages::create_package(
        &state.db,
        &request.id,
        request.kind,
        &request.name,
        &user_id(&headers),
    )
    .await?;
    Ok(ApiResponse::success(package).created().into_response())
}

#[tracing::instrument(skip(state))]
async fn get_package(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let package = packages::require_package(&state.db, &id).await?;
    Ok(ApiResponse::success(package).into_response())
}

#[tracing::instrument(skip(state, headers))]
async fn delete_package(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let deleted = packages::delete_package(&state.db, &id, &user_id(&headers)).await?;
    Ok(ApiResponse::success(json!({ "id": id, "deleted": deleted })).into_response())
}

#[tracing::instrument(skip(state, request), fields(new_id = %request.new_id))]
async fn move_package(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
    Json(request): Json<MovePackageRequest>,
) -> Result<Response, AppError> {
    if request.new_id == id {
        return Err(ApiError::new(codes::INVALID_VALUE)
            .param("field", "new_id")
            .param("value", &request.new_id)
            .into());
    }
    packages::move_package(&state.db, &id, &request.new_id).await?;
    Ok(ApiResponse::success(TransitionResponse {
        id,
        moved_to: Some(request.new_id),
    })
    .into_response())
}

#[tracing::instrument(skip(state))]
async fn get_transition(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let moved_to = packages::resolve_transition(&state.db, &id).await?;
    Ok(ApiResponse::success(TransitionResponse { id, moved_to }).into_response())
}
