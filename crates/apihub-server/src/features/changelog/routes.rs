//! Changelog API routes
//!
//! # Route Structure
//!
//! - `GET /api/v1/comparisons/:id` - Cached comparison row
//! - `GET /api/v1/comparisons/:id/summary` - Per-type counts over the comparison and its refs
//! - `GET /api/v1/comparisons/:id/changes` - Filtered operation changes, most severe first
//! - `POST /api/v1/changelog` - Serve a changelog from cache or queue its computation

use apihub_common::error::ApiError;
use apihub_common::types::{ApiType, Severity};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::response::ApiResponse;
use crate::changelog::{self, ChangelogRequest, ChangelogStatus, ChangesFilter};
use crate::error::AppError;
use crate::features::shared::{request::ANONYMOUS_USER, user_id, PaginationParams};
use crate::features::FeatureState;

pub fn comparisons_routes() -> Router<FeatureState> {
    Router::new()
        .route("/:id", get(get_comparison))
        .route("/:id/summary", get(get_summary))
        .route("/:id/changes", get(list_changes))
}

pub fn changelog_routes() -> Router<FeatureState> {
    Router::new().route("/", post(request_changelog))
}

/// Query string of the changes listing; list values are comma-separated
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub api_type: Option<ApiType>,
    #[serde(default)]
    pub api_audience: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub document_slug: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

fn split_list(raw: Option<&str>) -> impl Iterator<Item = &str> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

impl ChangesQuery {
    pub fn filter(&self) -> Result<ChangesFilter, ApiError> {
        let severities = split_list(self.severity.as_deref())
            .map(|raw| raw.parse::<Severity>().map_err(ApiError::from))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ChangesFilter {
            text: self.text.clone(),
            api_type: self.api_type,
            api_audience: self.api_audience.clone(),
            tags: split_list(self.tags.as_deref()).map(str::to_string).collect(),
            group: self.group.clone(),
            severities,
            document_slug: self.document_slug.clone(),
        })
    }

    pub fn page(&self) -> PaginationParams {
        PaginationParams {
            limit: self.limit,
            offset: self.offset,
        }
    }
}

#[tracing::instrument(skip(state))]
async fn get_comparison(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let comparison = changelog::get_comparison(&state.db, &id).await?;
    Ok(ApiResponse::success(comparison).into_response())
}

#[tracing::instrument(skip(state))]
async fn get_summary(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let summary = changelog::changes_summary(&state.db, &id).await?;
    Ok(ApiResponse::success(summary).into_response())
}

/// Operation changes of a comparison and its refs
///
/// # Query Parameters
///
/// - `text`, `api_type`, `api_audience`, `group`, `document_slug`
/// - `tags` - comma-separated, any match
/// - `severity` - comma-separated (`breaking,deprecated`), any match
/// - `limit`, `offset`
#[tracing::instrument(skip(state, query))]
async fn list_changes(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Response, AppError> {
    let filter = query.filter()?;
    let page = query.page();
    let changes = changelog::list_changes(&state.db, &id, &filter, page.pagination()).await?;
    let meta = page.meta(changes.len());
    Ok(ApiResponse::success_with_meta(changes, meta).into_response())
}

/// Request the changelog between two versions
///
/// # Response
///
/// - `200 OK` - `{"state": "cached", "comparisonId": ...}` or `{"state": "inFlight", "buildId": ...}`
/// - `202 Accepted` - `{"state": "submitted", "buildId": ...}`
/// - `404 Not Found` - Either version does not exist
#[tracing::instrument(
    skip(state, headers, request),
    fields(package_id = %request.package_id, version = %request.version)
)]
async fn request_changelog(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    Json(mut request): Json<ChangelogRequest>,
) -> Result<Response, AppError> {
    if request.created_by.is_none() {
        let user = user_id(&headers);
        if user != ANONYMOUS_USER {
            request.created_by = Some(user);
        }
    }

    let status = changelog::request_changelog(&state.db, &state.queue, request).await?;
    let code = match status {
        ChangelogStatus::Submitted { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((code, Json(ApiResponse::success(status))).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_lists_are_split() {
        let query = ChangesQuery {
            tags: Some("billing, orders,".to_string()),
            severity: Some("breaking,semi-breaking".to_string()),
            ..Default::default()
        };
        let filter = query.filter().unwrap();
        assert_eq!(filter.tags, vec!["billing", "orders"]);
        assert_eq!(filter.severities, vec![Severity::Breaking, Severity::SemiBreaking]);
    }

    #[test]
    fn test_unknown_severity_is_rejected() {
        let query = ChangesQuery {
            severity: Some("catastrophic".to_string()),
            ..Default::default()
        };
        let err = query.filter().unwrap_err();
        assert_eq!(err.code, "InvalidValue");
        assert_eq!(err.params.get("value").map(String::as_str), Some("catastrophic"));
    }
}
