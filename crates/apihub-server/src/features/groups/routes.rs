//! Operation group API routes
//!
//! All routes live under `/api/v1/packages/:id/versions/:version/groups/:api_type`.
//!
//! # Route Structure
//!
//! - `GET /` - Groups of the revision with their operation counts
//! - `POST /` - Create a manual group
//! - `POST /autogenerate` - Replace the autogenerated groups from a pattern
//! - `GET /:name` - Members of a group
//! - `DELETE /:name` - Delete a group
//! - `PUT /:name/operations` - Add operations
//! - `DELETE /:name/operations` - Remove operations
//! - `GET /:name/history` - Mutation history

use apihub_common::ids::{operation_group_id, RevisionCoords};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::api::response::ApiResponse;
use crate::db::versions::{self, RevisionKey};
use crate::error::AppError;
use crate::features::shared::{parse_api_type, user_id};
use crate::features::FeatureState;
use crate::groups::{self, OperationRef};

const GROUPS_PATH: &str = "/:id/versions/:version/groups/:api_type";

pub fn groups_routes() -> Router<FeatureState> {
    Router::new()
        .route(GROUPS_PATH, get(list_groups).post(create_group))
        .route(&format!("{}/autogenerate", GROUPS_PATH), post(autogenerate))
        .route(
            &format!("{}/:name", GROUPS_PATH),
            get(list_members).delete(delete_group),
        )
        .route(
            &format!("{}/:name/operations", GROUPS_PATH),
            put(add_operations).delete(remove_operations),
        )
        .route(&format!("{}/:name/history", GROUPS_PATH), get(group_history))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutogenerateRequest {
    /// Regex with a named capture `group`, matched against `"<METHOD> <path>"`
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationsRequest {
    pub operations: Vec<OperationRef>,
}

async fn resolve_key(state: &FeatureState, id: &str, version: &str) -> Result<RevisionKey, AppError> {
    Ok(versions::resolve_revision(&state.db, id, version).await?.key())
}

#[tracing::instrument(skip(state))]
async fn list_groups(
    State(state): State<FeatureState>,
    Path((id, version, api_type)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let api_type = parse_api_type(&api_type)?;
    let key = resolve_key(&state, &id, &version).await?;
    let summaries = groups::list_groups(&state.db, &key, api_type).await?;
    Ok(ApiResponse::success(summaries).into_response())
}

/// Create a manual group
///
/// # Response
///
/// - `201 Created` - Group created
/// - `409 Conflict` - A group with that name exists in the revision
#[tracing::instrument(skip(state, headers, request), fields(name = %request.name))]
async fn create_group(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Path((id, version, api_type)): Path<(String, String, String)>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<Response, AppError> {
    let api_type = parse_api_type(&api_type)?;
    let key = resolve_key(&state, &id, &version).await?;
    let group = groups::create_group(
        &state.db,
        &key,
        api_type,
        &request.name,
        &request.description,
        &user_id(&headers),
    )
    .await?;
    Ok(ApiResponse::success(group).created().into_response())
}

#[tracing::instrument(skip(state, headers, request), fields(pattern = %request.pattern))]
async fn autogenerate(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Path((id, version, api_type)): Path<(String, String, String)>,
    Json(request): Json<AutogenerateRequest>,
) -> Result<Response, AppError> {
    let api_type = parse_api_type(&api_type)?;
    let key = resolve_key(&state, &id, &version).await?;
    let summaries =
        groups::autogenerate_groups(&state.db, &key, api_type, &request.pattern, &user_id(&headers))
            .await?;
    Ok(ApiResponse::success(summaries).into_response())
}

#[tracing::instrument(skip(state))]
async fn list_members(
    State(state): State<FeatureState>,
    Path((id, version, api_type, name)): Path<(String, String, String, String)>,
) -> Result<Response, AppError> {
    let api_type = parse_api_type(&api_type)?;
    let key = resolve_key(&state, &id, &version).await?;
    let members = groups::list_members(&state.db, &key, api_type, &name).await?;
    Ok(ApiResponse::success(members).into_response())
}

#[tracing::instrument(skip(state, headers))]
async fn delete_group(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Path((id, version, api_type, name)): Path<(String, String, String, String)>,
) -> Result<Response, AppError> {
    let api_type = parse_api_type(&api_type)?;
    let key = resolve_key(&state, &id, &version).await?;
    groups::delete_group(&state.db, &key, api_type, &name, &user_id(&headers)).await?;
    Ok(ApiResponse::success(json!({ "name": name, "deleted": true })).into_response())
}

/// Add operations; members may come from referenced revisions
///
/// # Response
///
/// - `200 OK` - Number of operations added
/// - `404 Not Found` - Group or operation not found
#[tracing::instrument(skip(state, headers, request), fields(count = request.operations.len()))]
async fn add_operations(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Path((id, version, api_type, name)): Path<(String, String, String, String)>,
    Json(request): Json<OperationsRequest>,
) -> Result<Response, AppError> {
    let api_type = parse_api_type(&api_type)?;
    let key = resolve_key(&state, &id, &version).await?;
    let added = groups::add_operations(
        &state.db,
        &key,
        api_type,
        &name,
        &request.operations,
        &user_id(&headers),
    )
    .await?;
    Ok(ApiResponse::success(json!({ "name": name, "added": added })).into_response())
}

#[tracing::instrument(skip(state, headers, request), fields(count = request.operations.len()))]
async fn remove_operations(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Path((id, version, api_type, name)): Path<(String, String, String, String)>,
    Json(request): Json<OperationsRequest>,
) -> Result<Response, AppError> {
    let api_type = parse_api_type(&api_type)?;
    let key = resolve_key(&state, &id, &version).await?;
    let removed = groups::remove_operations(
        &state.db,
        &key,
        api_type,
        &name,
        &request.operations,
        &user_id(&headers),
    )
    .await?;
    Ok(ApiResponse::success(json!({ "name": name, "removed": removed })).into_response())
}

#[tracing::instrument(skip(state))]
async fn group_history(
    State(state): State<FeatureState>,
    Path((id, version, api_type, name)): Path<(String, String, String, String)>,
) -> Result<Response, AppError> {
    let api_type = parse_api_type(&api_type)?;
    let key = resolve_key(&state, &id, &version).await?;
    let group_id = operation_group_id(
        RevisionCoords::new(&key.package_id, &key.version, key.revision),
        api_type,
        &name,
    );
    let entries = groups::group_history(&state.db, &group_id).await?;
    Ok(ApiResponse::success(entries).into_response())
}
