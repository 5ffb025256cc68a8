//! Build API routes
//!
//! # Route Structure
//!
//! - `POST /api/v1/builds` - Submit a build
//! - `GET /api/v1/builds/next-build?builder_id=` - Lease the next eligible build
//! - `GET /api/v1/builds/:id` - Build status
//! - `GET /api/v1/builds/:id/source` - Build config, source archive and target context
//! - `PUT /api/v1/builds/:id/status` - Heartbeat or report failure
//! - `POST /api/v1/builds/:id/result` - Upload the artifact and publish it

use apihub_common::types::{BuildResult, StatusUpdate, SubmitBuildRequest};
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;

use crate::api::response::ApiResponse;
use crate::error::AppError;
use crate::features::FeatureState;
use crate::{publish, queue};

pub fn builds_routes(max_body_bytes: usize) -> Router<FeatureState> {
    Router::new()
        .route(
            "/",
            post(submit_build).layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .route("/next-build", get(next_build))
        .route("/:id", get(get_build))
        .route("/:id/source", get(get_build_source))
        .route("/:id/status", put(update_status))
        .route(
            "/:id/result",
            post(upload_result).layer(DefaultBodyLimit::max(max_body_bytes)),
        )
}

#[derive(Debug, Deserialize)]
pub struct NextBuildQuery {
    pub builder_id: String,
}

/// Submit a build
///
/// # Response
///
/// - `201 Created` - A new build was queued
/// - `200 OK` - An equivalent build is already queued or running; its id is returned
/// - `400 Bad Request` - Invalid build config
#[tracing::instrument(
    skip(state, request),
    fields(package_id = %request.package_id, build_type = %request.config.build_type)
)]
async fn submit_build(
    State(state): State<FeatureState>,
    Json(request): Json<SubmitBuildRequest>,
) -> Result<Response, AppError> {
    let response = queue::submit(&state.db, &state.queue, request).await?;

    let status = if response.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(response))).into_response())
}

/// Lease the next eligible build
///
/// # Response
///
/// - `200 OK` - The leased build
/// - `204 No Content` - Nothing is eligible
#[tracing::instrument(skip(state))]
async fn next_build(
    State(state): State<FeatureState>,
    Query(query): Query<NextBuildQuery>,
) -> Result<Response, AppError> {
    match queue::take_free_build(&state.db, &state.queue, &query.builder_id).await? {
        Some(build) => Ok(ApiResponse::success(build.to_view()?).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[tracing::instrument(skip(state))]
async fn get_build(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let build = queue::get_build(&state.db, &id).await?;
    Ok(ApiResponse::success(build.to_view()?).into_response())
}

#[tracing::instrument(skip(state))]
async fn get_build_source(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let payload = queue::get_build_source(&state.db, &id).await?;
    Ok(ApiResponse::success(payload).into_response())
}

/// Heartbeat (`running`) or failure report (`error`)
///
/// # Response
///
/// - `200 OK` - The updated build
/// - `409 Conflict` - The build is finished, or leased by another builder
#[tracing::instrument(skip(state, update), fields(status = %update.status))]
async fn update_status(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Response, AppError> {
    let build = queue::update_status(&state.db, &id, &update).await?;
    Ok(ApiResponse::success(build.to_view()?).into_response())
}

/// Publish the artifact of a build
///
/// # Response
///
/// - `200 OK` - Published; the summary names the assigned revision
/// - `400 Bad Request` - Result does not match the build, or is inconsistent
/// - `409 Conflict` - Build already finished, revision conflict or reference cycle
#[tracing::instrument(skip(state, result), fields(package_id = %result.version.package_id))]
async fn upload_result(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
    Json(result): Json<BuildResult>,
) -> Result<Response, AppError> {
    let summary = publish::publish(&state.db, &state.queue, &id, &result).await?;

    tracing::info!(
        build_id = %id,
        revision = summary.revision,
        "Build result published via API"
    );

    Ok(ApiResponse::success(summary).into_response())
}
