//! Changelog engine over cached version comparisons.
//!
//! A comparison row is keyed by the md5 of its six coordinates and lists the
//! comparison ids of the referenced packages in `refs`. Reads always span the
//! root and its refs.

pub mod filter;

use apihub_common::error::{codes, ApiError};
use apihub_common::ids::{comparison_id, RevisionCoords};
use apihub_common::types::{
    ApiType, BuildConfig, BuildType, ChangeSummary, OperationTypeChanges, Pagination, SubmitBuildRequest,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub use filter::ChangesFilter;

use crate::config::QueueConfig;
use crate::db::versions::{self, RevisionKey};
use crate::db::DbError;
use crate::queue::{self, ChangelogKey, QueueError};

#[derive(Error, Debug)]
pub enum ChangelogError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] DbError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ChangelogError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ChangelogError::Api(e) => Some(e),
            ChangelogError::Store(e) => e.api_error(),
            ChangelogError::Queue(e) => e.api_error(),
            ChangelogError::Database(_) => None,
        }
    }
}

pub type ChangelogResult<T> = Result<T, ChangelogError>;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Comparison {
    pub comparison_id: String,
    pub package_id: String,
    pub version: String,
    pub revision: i32,
    pub previous_package_id: String,
    pub previous_version: String,
    pub previous_revision: i32,
    pub operation_types: serde_json::Value,
    pub refs: Vec<String>,
    pub no_content: bool,
    pub open_count: i64,
    pub last_active: DateTime<Utc>,
    pub builder_id: Option<String>,
}

impl Comparison {
    pub fn key(&self) -> RevisionKey {
        RevisionKey::new(&self.package_id, &self.version, self.revision)
    }

    pub fn operation_types(&self) -> Result<Vec<OperationTypeChanges>, serde_json::Error> {
        serde_json::from_value(self.operation_types.clone())
    }

    /// Root first, then refs
    fn scope(&self) -> Vec<String> {
        let mut ids = vec![self.comparison_id.clone()];
        ids.extend(self.refs.iter().filter(|id| **id != self.comparison_id).cloned());
        ids
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OperationChange {
    pub comparison_id: String,
    pub package_id: String,
    pub version: String,
    pub revision: i32,
    pub operation_id: String,
    pub previous_operation_id: Option<String>,
    pub data_hash: Option<String>,
    pub previous_data_hash: Option<String>,
    pub api_type: String,
    pub api_audience: String,
    pub action: String,
    pub title: String,
    pub tags: Vec<String>,
    pub changes_summary: serde_json::Value,
    pub severity_mask: i32,
    pub changes: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Aggregated counts of a comparison and its refs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangesSummaryView {
    pub comparison_id: String,
    pub no_content: bool,
    pub operation_types: Vec<OperationTypeChanges>,
}

const COMPARISON_COLUMNS: &str = "comparison_id, package_id, version, revision, previous_package_id, \
                                  previous_version, previous_revision, operation_types, refs, \
                                  no_content, open_count, last_active, builder_id";

fn comparison_not_found(id: &str) -> ApiError {
    ApiError::new(codes::COMPARISON_NOT_FOUND).param("id", id)
}

async fn find_comparison<'e, E>(executor: E, id: &str) -> ChangelogResult<Option<Comparison>>
where
    E: Executor<'e, Database = Postgres>,
{
    let query = format!("SELECT {} FROM version_comparison WHERE comparison_id = $1", COMPARISON_COLUMNS);
    let comparison = sqlx::query_as::<_, Comparison>(&query)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(comparison)
}

pub async fn get_comparison(pool: &PgPool, id: &str) -> ChangelogResult<Comparison> {
    find_comparison(pool, id)
        .await?
        .ok_or_else(|| comparison_not_found(id).into())
}

async fn load_scope(pool: &PgPool, root: &Comparison) -> ChangelogResult<Vec<Comparison>> {
    let query = format!(
        "SELECT {} FROM version_comparison WHERE comparison_id = ANY($1) ORDER BY comparison_id",
        COMPARISON_COLUMNS
    );
    let comparisons = sqlx::query_as::<_, Comparison>(&query)
        .bind(root.scope())
        .fetch_all(pool)
        .await?;
    Ok(comparisons)
}

/// Operation changes of a comparison and its refs, most severe first
#[tracing::instrument(skip(pool, filter))]
pub async fn list_changes(
    pool: &PgPool,
    id: &str,
    filter: &ChangesFilter,
    page: Pagination,
) -> ChangelogResult<Vec<OperationChange>> {
    let root = get_comparison(pool, id).await?;

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT oc.comparison_id, oc.package_id, oc.version, oc.revision, oc.operation_id, \
                oc.previous_operation_id, oc.data_hash, oc.previous_data_hash, oc.api_type, \
                oc.api_audience, oc.action, oc.title, oc.tags, oc.changes_summary, \
                oc.severity_mask, oc.changes, oc.metadata \
         FROM operation_comparison oc WHERE oc.comparison_id = ANY(",
    );
    builder.push_bind(root.scope());
    builder.push(")");
    filter::push_conditions(&mut builder, filter, &root.key());
    builder.push(filter::ORDER_BY);
    builder.push(" LIMIT ");
    builder.push_bind(page.limit);
    builder.push(" OFFSET ");
    builder.push_bind(page.offset);

    let changes = builder.build_query_as::<OperationChange>().fetch_all(pool).await?;
    Ok(changes)
}

/// Sum per-type counts and merge tags across comparisons
pub fn aggregate_operation_types<'a, I>(types: I) -> Vec<OperationTypeChanges>
where
    I: IntoIterator<Item = &'a OperationTypeChanges>,
{
    let mut by_type: BTreeMap<ApiType, (ChangeSummary, ChangeSummary, BTreeSet<String>)> = BTreeMap::new();
    for entry in types {
        let (changes, impacted, tags) = by_type.entry(entry.api_type).or_default();
        changes.add(&entry.changes_summary);
        impacted.add(&entry.number_of_impacted_operations);
        tags.extend(entry.tags.iter().cloned());
    }
    by_type
        .into_iter()
        .map(|(api_type, (changes_summary, number_of_impacted_operations, tags))| OperationTypeChanges {
            api_type,
            changes_summary,
            number_of_impacted_operations,
            tags: tags.into_iter().collect(),
        })
        .collect()
}

pub async fn changes_summary(pool: &PgPool, id: &str) -> ChangelogResult<ChangesSummaryView> {
    let root = get_comparison(pool, id).await?;
    let scope = load_scope(pool, &root).await?;

    let mut types = Vec::new();
    for comparison in &scope {
        types.extend(comparison.operation_types().map_err(|e| {
            ApiError::new(codes::INTERNAL_SERVER_ERROR)
                .debug(format!("comparison {} has malformed operation types: {}", comparison.comparison_id, e))
        })?);
    }

    Ok(ChangesSummaryView {
        comparison_id: root.comparison_id.clone(),
        no_content: scope.iter().all(|c| c.no_content),
        operation_types: aggregate_operation_types(&types),
    })
}

/// Body of `POST /changelog`
#[derive(Debug, Clone, Deserialize)]
pub struct ChangelogRequest {
    pub package_id: String,
    pub version: String,
    #[serde(default)]
    pub previous_package_id: Option<String>,
    pub previous_version: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ChangelogStatus {
    /// The comparison is cached and can be read
    Cached { comparison_id: String },
    /// An equivalent changelog build is queued or running
    InFlight { build_id: String },
    /// A new changelog build was queued
    Submitted { build_id: String },
}

/// Serve a changelog from cache, or make sure a build is computing it
#[tracing::instrument(skip(pool, queue_config, request), fields(package_id = %request.package_id, version = %request.version))]
pub async fn request_changelog(
    pool: &PgPool,
    queue_config: &QueueConfig,
    request: ChangelogRequest,
) -> ChangelogResult<ChangelogStatus> {
    let previous_package_id = request
        .previous_package_id
        .clone()
        .unwrap_or_else(|| request.package_id.clone());

    let current = versions::resolve_revision(pool, &request.package_id, &request.version).await?;
    let previous = versions::resolve_revision(pool, &previous_package_id, &request.previous_version).await?;
    let id = comparison_id(
        RevisionCoords::new(&current.package_id, &current.version, current.revision),
        RevisionCoords::new(&previous.package_id, &previous.version, previous.revision),
    );
    if find_comparison(pool, &id).await?.is_some() {
        tracing::debug!(comparison_id = %id, "Changelog served from cache");
        return Ok(ChangelogStatus::Cached { comparison_id: id });
    }

    let mut config = BuildConfig::new(BuildType::Changelog, &request.package_id, &request.version);
    config.previous_version = Some(request.previous_version.clone());
    config.previous_version_package_id = request.previous_package_id.clone();
    config.created_by = request.created_by.clone();

    if let Some(key) = ChangelogKey::from_config(&config) {
        if let Some(build_id) = queue::find_by_changelog_key(pool, queue_config, &key).await? {
            return Ok(ChangelogStatus::InFlight { build_id });
        }
    }

    let submitted = queue::submit(
        pool,
        queue_config,
        SubmitBuildRequest {
            package_id: request.package_id.clone(),
            config,
            source_archive: Vec::new(),
            priority: request.priority,
            depends: Vec::new(),
        },
    )
    .await?;

    Ok(if submitted.created {
        ChangelogStatus::Submitted {
            build_id: submitted.build_id,
        }
    } else {
        ChangelogStatus::InFlight {
            build_id: submitted.build_id,
        }
    })
}
