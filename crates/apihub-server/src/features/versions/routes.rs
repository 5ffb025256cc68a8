//! Version API routes
//!
//! `:version` is a version address: `v` for the latest undeleted revision of
//! `v`, `v@r` for revision `r`.
//!
//! # Route Structure
//!
//! - `GET /api/v1/packages/:id/versions/:version` - Revision metadata
//! - `PATCH /api/v1/packages/:id/versions/:version` - Change status and labels
//! - `DELETE /api/v1/packages/:id/versions/:version` - Tombstone one or all revisions
//! - `GET .../documents` - Documents ordered by index
//! - `GET .../documents/:slug` - One document
//! - `GET .../documents/:slug/content` - Document bytes
//! - `GET .../sources` - Source archive of the revision
//! - `GET .../references?transitive=` - Direct rows or the active closure
//! - `GET .../operations?api_type=` - Operations, paginated
//! - `GET .../operations/summary` - Per-type counts and deprecated operations

use apihub_common::error::{codes, ApiError};
use apihub_common::types::encoding::base64_bytes;
use apihub_common::types::{ApiType, VersionStatus};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::response::ApiResponse;
use crate::db::content;
use crate::db::versions::{self, DeprecatedOperation, OperationTypeCount, RevisionKey};
use crate::error::AppError;
use crate::features::shared::{user_id, PaginationParams};
use crate::features::FeatureState;

pub fn versions_routes() -> Router<FeatureState> {
    Router::new()
        .route(
            "/:id/versions/:version",
            get(get_version).patch(update_version).delete(delete_version),
        )
        .route("/:id/versions/:version/documents", get(list_documents))
        .route("/:id/versions/:version/documents/:slug", get(get_document))
        .route(
            "/:id/versions/:version/documents/:slug/content",
            get(get_document_content),
        )
        .route("/:id/versions/:version/sources", get(get_sources))
        .route("/:id/versions/:version/references", get(list_references))
        .route("/:id/versions/:version/operations", get(list_operations))
        .route(
            "/:id/versions/:version/operations/summary",
            get(operations_summary),
        )
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateVersionRequest {
    #[serde(default)]
    pub status: Option<VersionStatus>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ReferencesQuery {
    #[serde(default)]
    pub transitive: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationsQuery {
    #[serde(default)]
    pub api_type: Option<ApiType>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl OperationsQuery {
    fn page(&self) -> PaginationParams {
        PaginationParams {
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Bytes travel as base64 inside the JSON envelope
#[derive(Debug, Clone, Serialize)]
pub struct ContentResponse {
    pub slug: String,
    pub checksum: String,
    pub media_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourcesResponse {
    pub checksum: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationsSummary {
    pub operation_types: Vec<OperationTypeCount>,
    pub deprecated: Vec<DeprecatedOperation>,
}

async fn resolve_key(state: &FeatureState, id: &str, version: &str) -> Result<RevisionKey, AppError> {
    Ok(versions::resolve_revision(&state.db, id, version).await?.key())
}

#[tracing::instrument(skip(state))]
async fn get_version(
    State(state): State<FeatureState>,
    Path((id, version)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let revision = versions::resolve_revision(&state.db, &id, &version).await?;
    Ok(ApiResponse::success(revision).into_response())
}

/// Only `status` and `labels` of a published revision can change
#[tracing::instrument(skip(state, request))]
async fn update_version(
    State(state): State<FeatureState>,
    Path((id, version)): Path<(String, String)>,
    Json(request): Json<UpdateVersionRequest>,
) -> Result<Response, AppError> {
    if request.status.is_none() && request.labels.is_none() {
        return Err(ApiError::new(codes::INVALID_VALUE)
            .param("field", "status")
            .param("value", "")
            .debug("nothing to update: provide status or labels")
            .into());
    }
    let revision =
        versions::update_revision_meta(&state.db, &id, &version, request.status, request.labels)
            .await?;
    Ok(ApiResponse::success(revision).into_response())
}

/// `v` tombstones every revision of `v`; `v@r` only revision `r`
#[tracing::instrument(skip(state, headers))]
async fn delete_version(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Path((id, version)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let deleted = versions::delete_revision(&state.db, &id, &version, &user_id(&headers)).await?;
    if deleted == 0 {
        return Err(ApiError::new(codes::VERSION_NOT_FOUND)
            .param("id", &id)
            .param("version", &version)
            .into());
    }
    Ok(ApiResponse::success(json!({ "id": id, "version": version, "deleted": deleted }))
        .into_response())
}

#[tracing::instrument(skip(state))]
async fn list_documents(
    State(state): State<FeatureState>,
    Path((id, version)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let key = resolve_key(&state, &id, &version).await?;
    let documents = versions::list_documents(&state.db, &key).await?;
    Ok(ApiResponse::success(documents).into_response())
}

#[tracing::instrument(skip(state))]
async fn get_document(
    State(state): State<FeatureState>,
    Path((id, version, slug)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let key = resolve_key(&state, &id, &version).await?;
    let document = versions::get_document(&state.db, &key, &slug).await?;
    Ok(ApiResponse::success(document).into_response())
}

#[tracing::instrument(skip(state))]
async fn get_document_content(
    State(state): State<FeatureState>,
    Path((id, version, slug)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let key = resolve_key(&state, &id, &version).await?;
    let (document, blob) = versions::get_document_content(&state.db, &key, &slug).await?;
    Ok(ApiResponse::success(ContentResponse {
        slug: document.slug,
        checksum: blob.checksum,
        media_type: blob.media_type,
        data: blob.data,
    })
    .into_response())
}

#[tracing::instrument(skip(state))]
async fn get_sources(
    State(state): State<FeatureState>,
    Path((id, version)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let key = resolve_key(&state, &id, &version).await?;
    let sources = content::get_version_sources(&state.db, &key.package_id, &key.version, key.revision)
        .await?
        .ok_or_else(|| {
            ApiError::new(codes::DOCUMENT_NOT_FOUND)
                .param("slug", "sources")
                .param("version", format!("{}@{}", key.version, key.revision))
                .param("id", &key.package_id)
        })?;
    Ok(ApiResponse::success(SourcesResponse {
        checksum: sources.archive_checksum,
        data: sources.data,
    })
    .into_response())
}

/// Direct reference rows, or with `transitive=true` the revisions reachable
/// through non-excluded edges
#[tracing::instrument(skip(state))]
async fn list_references(
    State(state): State<FeatureState>,
    Path((id, version)): Path<(String, String)>,
    Query(query): Query<ReferencesQuery>,
) -> Result<Response, AppError> {
    let key = resolve_key(&state, &id, &version).await?;
    if query.transitive {
        let mut conn = state.db.acquire().await?;
        let closure = versions::transitive_refs(&mut conn, &key).await?;
        return Ok(ApiResponse::success(closure).into_response());
    }
    let references = versions::list_references(&state.db, &key).await?;
    Ok(ApiResponse::success(references).into_response())
}

#[tracing::instrument(skip(state, query))]
async fn list_operations(
    State(state): State<FeatureState>,
    Path((id, version)): Path<(String, String)>,
    Query(query): Query<OperationsQuery>,
) -> Result<Response, AppError> {
    let key = resolve_key(&state, &id, &version).await?;
    let page = query.page();
    let operations =
        versions::list_operations(&state.db, &key, query.api_type, page.pagination()).await?;
    let meta = page.meta(operations.len());
    Ok(ApiResponse::success_with_meta(operations, meta).into_response())
}

#[tracing::instrument(skip(state))]
async fn operations_summary(
    State(state): State<FeatureState>,
    Path((id, version)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let key = resolve_key(&state, &id, &version).await?;
    let summary = OperationsSummary {
        operation_types: versions::operation_type_counts(&state.db, &key).await?,
        deprecated: versions::deprecated_summary(&state.db, &key).await?,
    };
    Ok(ApiResponse::success(summary).into_response())
}
