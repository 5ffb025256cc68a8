//! Persistent build queue.
//!
//! The `build` row is the synchronization point: a lease is `status =
//! 'running'` plus a fresh `last_active`, taken under `FOR NO KEY UPDATE SKIP
//! LOCKED` so concurrent workers never grab the same row. A worker that stops
//! heartbeating loses its lease after the keepalive and the build is handed
//! to the next caller with `restart_count + 1`.
//!
//! Failed builds stay in `error` and are retried until `restart_count`
//! reaches the restart limit; after that they are terminal. A dependent build
//! becomes eligible only once all its dependencies are `complete`, and is
//! failed when one of them ends in a terminal error.

pub mod lifecycle;
pub mod source;

use apihub_common::error::{codes, ApiError};
use apihub_common::types::{
    ApiType, BuildConfig, BuildStatus, BuildType, BuildView, StatusUpdate, SubmitBuildRequest,
    SubmitBuildResponse,
};
use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::db::DbError;

pub use source::{build_context, get_build_source};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            QueueError::Api(e) => Some(e),
            QueueError::Store(e) => e.api_error(),
            _ => None,
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Build {
    pub build_id: String,
    pub package_id: String,
    pub version: String,
    pub status: String,
    pub details: String,
    pub priority: i32,
    pub restart_count: i32,
    pub builder_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Build {
    pub fn status(&self) -> Result<BuildStatus, ApiError> {
        self.status.parse().map_err(ApiError::from)
    }

    pub fn to_view(&self) -> Result<BuildView, ApiError> {
        Ok(BuildView {
            build_id: self.build_id.clone(),
            package_id: self.package_id.clone(),
            status: self.status()?,
            priority: self.priority,
            restart_count: self.restart_count,
            builder_id: self.builder_id.clone(),
            details: self.details.clone(),
            created_at: self.created_at,
            last_active: self.last_active,
        })
    }
}

pub(crate) const BUILD_COLUMNS: &str = "build_id, package_id, version, status, details, priority, \
                                        restart_count, builder_id, created_by, created_at, last_active";

pub(crate) fn build_not_found(build_id: &str) -> ApiError {
    ApiError::new(codes::BUILD_NOT_FOUND).param("id", build_id)
}

/// Identifies an in-flight changelog build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogKey {
    pub package_id: String,
    pub version: String,
    pub previous_package_id: String,
    pub previous_version: String,
}

impl ChangelogKey {
    pub fn from_config(config: &BuildConfig) -> Option<Self> {
        Some(Self {
            package_id: config.package_id.clone(),
            version: config.version.clone(),
            previous_package_id: config.previous_package_id().to_string(),
            previous_version: config.previous_version.clone()?,
        })
    }
}

/// Identifies an in-flight build scoped to one operation group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentGroupKey {
    pub build_type: BuildType,
    pub package_id: String,
    pub version: String,
    pub api_type: ApiType,
    pub group_name: String,
    pub format: Option<String>,
}

impl DocumentGroupKey {
    pub fn from_config(config: &BuildConfig) -> Option<Self> {
        if !config.build_type.is_group_scoped() {
            return None;
        }
        Some(Self {
            build_type: config.build_type,
            package_id: config.package_id.clone(),
            version: config.version.clone(),
            api_type: config.api_type?,
            group_name: config.group_name.clone()?,
            format: config.format.clone(),
        })
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Enqueue a build with its source and dependencies in one transaction.
///
/// Changelog and group-scoped builds that duplicate an in-flight build return
/// the existing id with `created = false`.
#[tracing::instrument(skip(pool, queue, request), fields(package_id = %request.package_id))]
pub async fn submit(
    pool: &PgPool,
    queue: &QueueConfig,
    request: SubmitBuildRequest,
) -> QueueResult<SubmitBuildResponse> {
    let config = &request.config;
    if config.package_id != request.package_id {
        return Err(ApiError::new(codes::INVALID_BUILD_CONFIG)
            .param(
                "reason",
                format!(
                    "config.packageId '{}' does not match package_id '{}'",
                    config.package_id, request.package_id
                ),
            )
            .into());
    }
    config
        .validate()
        .map_err(|reason| ApiError::new(codes::INVALID_BUILD_CONFIG).param("reason", reason))?;

    let existing = match config.build_type {
        BuildType::Changelog => match ChangelogKey::from_config(config) {
            Some(key) => find_by_changelog_key(pool, queue, &key).await?,
            None => None,
        },
        t if t.is_group_scoped() => match DocumentGroupKey::from_config(config) {
            Some(key) => find_by_document_group_key(pool, queue, &key).await?,
            None => None,
        },
        _ => None,
    };
    if let Some(build_id) = existing {
        tracing::info!(build_id = %build_id, "Equivalent build already queued");
        return Ok(SubmitBuildResponse {
            build_id,
            created: false,
        });
    }

    let build_id = Uuid::new_v4().to_string();
    let config_json = serde_json::to_value(config)?;
    let depends: BTreeSet<&str> = request.depends.iter().map(String::as_str).collect();

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO build (build_id, package_id, version, status, priority, created_by)
        VALUES ($1, $2, $3, 'none', $4, $5)
        "#,
    )
    .bind(&build_id)
    .bind(&request.package_id)
    .bind(&config.version)
    .bind(request.priority)
    .bind(config.created_by.as_deref().unwrap_or_default())
    .execute(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO build_src (build_id, source, config) VALUES ($1, $2, $3)")
        .bind(&build_id)
        .bind(&request.source_archive)
        .bind(&config_json)
        .execute(&mut *tx)
        .await?;

    if !depends.is_empty() {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO build_depends (build_id, depend_id) ");
        builder.push_values(depends.iter(), |mut row, depend_id| {
            row.push_bind(&build_id).push_bind(*depend_id);
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;

    tracing::info!(
        build_id = %build_id,
        build_type = %config.build_type,
        priority = request.priority,
        depends = depends.len(),
        "Build submitted"
    );

    Ok(SubmitBuildResponse {
        build_id,
        created: true,
    })
}

/// In-flight or retriable changelog build for the same pair of versions
pub async fn find_by_changelog_key<'e, E>(
    executor: E,
    queue: &QueueConfig,
    key: &ChangelogKey,
) -> QueueResult<Option<String>>
where
    E: Executor<'e, Database = Postgres>,
{
    let build_id = sqlx::query_scalar::<_, String>(
        r#"
        SELECT b.build_id
        FROM build b
        JOIN build_src s ON s.build_id = b.build_id
        WHERE s.config ->> 'buildType' = 'changelog'
          AND s.config ->> 'packageId' = $1
          AND s.config ->> 'version' = $2
          AND COALESCE(s.config ->> 'previousVersionPackageId', s.config ->> 'packageId') = $3
          AND s.config ->> 'previousVersion' = $4
          AND (b.status IN ('none', 'running') OR (b.status = 'error' AND b.restart_count < $5))
        ORDER BY b.created_at DESC
        LIMIT 1
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(&key.previous_package_id)
    .bind(&key.previous_version)
    .bind(queue.restart_limit)
    .fetch_optional(executor)
    .await?;
    Ok(build_id)
}

/// In-flight or retriable build for the same operation group and format
pub async fn find_by_document_group_key<'e, E>(
    executor: E,
    queue: &QueueConfig,
    key: &DocumentGroupKey,
) -> QueueResult<Option<String>>
where
    E: Executor<'e, Database = Postgres>,
{
    let build_id = sqlx::query_scalar::<_, String>(
        r#"
        SELECT b.build_id
        FROM build b
        JOIN build_src s ON s.build_id = b.build_id
        WHERE s.config ->> 'buildType' = $1
          AND s.config ->> 'packageId' = $2
          AND s.config ->> 'version' = $3
          AND s.config ->> 'apiType' = $4
          AND s.config ->> 'groupName' = $5
          AND COALESCE(s.config ->> 'format', '') = $6
          AND (b.status IN ('none', 'running') OR (b.status = 'error' AND b.restart_count < $7))
        ORDER BY b.created_at DESC
        LIMIT 1
        "#,
    )
    .bind(key.build_type.as_str())
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.api_type.as_str())
    .bind(&key.group_name)
    .bind(key.format.as_deref().unwrap_or_default())
    .bind(queue.restart_limit)
    .fetch_optional(executor)
    .await?;
    Ok(build_id)
}

pub async fn get_build<'e, E>(executor: E, build_id: &str) -> QueueResult<Build>
where
    E: Executor<'e, Database = Postgres>,
{
    let query = format!("SELECT {} FROM build WHERE build_id = $1", BUILD_COLUMNS);
    sqlx::query_as::<_, Build>(&query)
        .bind(build_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| build_not_found(build_id).into())
}

// ============================================================================
// Leasing
// ============================================================================

const FAIL_BLOCKED_DEPENDENTS: &str = r#"
    UPDATE build b
    SET status = 'error',
        details = CASE WHEN b.details = '' THEN f.message ELSE b.details || ':' || f.message END,
        restart_count = GREATEST(b.restart_count, $1),
        last_active = NOW()
    FROM (
        SELECT DISTINCT ON (d.build_id)
               d.build_id,
               'Dependency build ' || d.depend_id || ' failed' AS message
        FROM build_depends d
        JOIN build dep ON dep.build_id = d.depend_id
        WHERE dep.status = 'error' AND dep.restart_count >= $1
        ORDER BY d.build_id, d.depend_id
    ) f
    WHERE b.build_id = f.build_id AND b.status = 'none'
"#;

const SELECT_ELIGIBLE: &str = r#"
    SELECT b.build_id, b.package_id, b.version, b.status, b.details, b.priority,
           b.restart_count, b.builder_id, b.created_by, b.created_at, b.last_active
    FROM build b
    WHERE (
            b.status = 'none'
         OR (b.status = 'running' AND b.last_active < NOW() - make_interval(secs => $1))
         OR (b.status = 'error' AND b.restart_count < $2)
          )
      AND NOT EXISTS (
            SELECT 1
            FROM build_depends d
            LEFT JOIN build dep ON dep.build_id = d.depend_id
            WHERE d.build_id = b.build_id
              AND (dep.build_id IS NULL OR dep.status <> 'complete')
          )
    ORDER BY b.priority DESC, b.created_at ASC
    LIMIT 1
    FOR NO KEY UPDATE OF b SKIP LOCKED
"#;

/// Lease the highest-priority eligible build to `builder_id`.
///
/// Builds that already reached the restart limit are moved to `error` on the
/// way and the next candidate is tried.
#[tracing::instrument(skip(pool, queue))]
pub async fn take_free_build(
    pool: &PgPool,
    queue: &QueueConfig,
    builder_id: &str,
) -> QueueResult<Option<Build>> {
    fail_blocked_dependents(pool, queue).await?;

    loop {
        let mut tx = pool.begin().await?;

        let candidate = sqlx::query_as::<_, Build>(SELECT_ELIGIBLE)
            .bind(queue.keepalive_secs as f64)
            .bind(queue.restart_limit)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(build) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        if build.restart_count >= queue.restart_limit {
            sqlx::query(
                "UPDATE build SET status = 'error', details = $2, last_active = NOW() WHERE build_id = $1",
            )
            .bind(&build.build_id)
            .bind(lifecycle::append_details(&build.details, "Restart count exceeded limit"))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::warn!(
                build_id = %build.build_id,
                restart_count = build.restart_count,
                "Build exceeded restart limit"
            );
            continue;
        }

        let restart_count = lifecycle::restart_count_after_lease(build.status()?, build.restart_count);
        let query = format!(
            "UPDATE build SET status = 'running', builder_id = $2, restart_count = $3, \
             last_active = NOW() WHERE build_id = $1 RETURNING {}",
            BUILD_COLUMNS
        );
        let leased = sqlx::query_as::<_, Build>(&query)
            .bind(&build.build_id)
            .bind(builder_id)
            .bind(restart_count)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            build_id = %leased.build_id,
            builder_id,
            previous_status = %build.status,
            restart_count,
            "Build leased"
        );
        return Ok(Some(leased));
    }
}

/// Fail queued builds whose dependency ended in a terminal error, repeating
/// until the failure has propagated through chains of dependents
async fn fail_blocked_dependents(pool: &PgPool, queue: &QueueConfig) -> QueueResult<u64> {
    let mut total = 0;
    loop {
        let failed = sqlx::query(FAIL_BLOCKED_DEPENDENTS)
            .bind(queue.restart_limit)
            .execute(pool)
            .await?
            .rows_affected();
        if failed == 0 {
            break;
        }
        total += failed;
    }
    if total > 0 {
        tracing::warn!(failed = total, "Failed builds blocked by failed dependencies");
    }
    Ok(total)
}

// ============================================================================
// Status updates
// ============================================================================

/// Apply a worker status report and refresh the lease.
///
/// `running` with empty details is a heartbeat. `error` details are appended
/// to the details of earlier attempts.
#[tracing::instrument(skip(pool, update), fields(status = %update.status))]
pub async fn update_status(pool: &PgPool, build_id: &str, update: &StatusUpdate) -> QueueResult<Build> {
    let mut tx = pool.begin().await?;

    let query = format!("SELECT {} FROM build WHERE build_id = $1 FOR UPDATE", BUILD_COLUMNS);
    let build = sqlx::query_as::<_, Build>(&query)
        .bind(build_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| build_not_found(build_id))?;

    let current = build.status()?;
    lifecycle::check_transition(build_id, current, update.status)?;

    if current == BuildStatus::Running {
        if let (Some(reporter), Some(owner)) = (update.builder_id.as_deref(), build.builder_id.as_deref()) {
            if reporter != owner {
                return Err(ApiError::new(codes::BUILD_LEASE_LOST)
                    .param("id", build_id)
                    .param("owner", owner)
                    .param("builder", reporter)
                    .into());
            }
        }
    }

    let details = match update.status {
        BuildStatus::Error => lifecycle::append_details(&build.details, &update.details),
        _ if update.details.is_empty() => build.details.clone(),
        _ => update.details.clone(),
    };

    let query = format!(
        "UPDATE build SET status = $2, details = $3, last_active = NOW() \
         WHERE build_id = $1 RETURNING {}",
        BUILD_COLUMNS
    );
    let updated = sqlx::query_as::<_, Build>(&query)
        .bind(build_id)
        .bind(update.status.as_str())
        .bind(&details)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    if update.status == BuildStatus::Error {
        tracing::warn!(build_id, restart_count = updated.restart_count, details = %updated.details, "Build failed");
    } else {
        tracing::debug!(build_id, "Build heartbeat");
    }
    Ok(updated)
}
