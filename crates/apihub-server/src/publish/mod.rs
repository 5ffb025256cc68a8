//! Publish transaction: commit a worker's build result as a revision.
//!
//! Everything happens in one database transaction holding the build row lock
//! and a transaction-scoped advisory lock on `(package_id, version)`:
//!
//! 1. document bytes into the content store
//! 2. document rows, in submitted order
//! 3. references
//! 4. source archive and the revision's pointer to it
//! 5. operation data, skipping bodies whose search scope is unchanged
//! 6. operations (replaced on a migration republish)
//! 7. search vectors for the operation data that was written
//! 8. version and operation comparisons
//! 9. builder notifications
//! 10. manual operation groups carried over from the previous revision
//! 11. service name binding
//! 12. raw result kept, build marked `complete`
//!
//! Changelog, group and export builds derive from a revision that is already
//! published: they run steps 8, 9 and 12 only and never mint a revision.
//!
//! Any failure rolls the whole publish back.

pub mod cycles;
pub mod migration;
pub mod search;
pub mod steps;

use apihub_common::error::{codes, ApiError};
use apihub_common::types::{BuildConfig, BuildResult, BuildStatus, VersionRef};
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::config::QueueConfig;
use crate::db::versions::{self, RevisionKey};
use crate::db::{content, packages, DbError};
use crate::groups::propagate;
use crate::queue::{build_not_found, lifecycle, Build, BUILD_COLUMNS};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PublishError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            PublishError::Api(e) => Some(e),
            PublishError::Store(e) => e.api_error(),
            _ => None,
        }
    }
}

pub type PublishResult<T> = Result<T, PublishError>;

/// What a publish wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishSummary {
    pub build_id: String,
    pub package_id: String,
    pub version: String,
    pub revision: i32,
    pub migration: bool,
    pub blobs_written: u64,
    pub operation_data_written: usize,
    pub comparisons_written: usize,
    pub groups_propagated: usize,
}

/// Commit steps, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Blobs,
    Documents,
    References,
    SourceArchive,
    OperationData,
    Operations,
    SearchVectors,
    Comparisons,
    Notifications,
    Groups,
    ServiceName,
    Complete,
}

fn checkpoint(step: Step, fail_at: Option<Step>) -> PublishResult<()> {
    if fail_at == Some(step) {
        return Err(ApiError::new(codes::INTERNAL_SERVER_ERROR)
            .debug(format!("publish aborted after step {:?}", step))
            .into());
    }
    tracing::trace!(?step, "Publish step done");
    Ok(())
}

/// Commit `result` for `build_id`
#[tracing::instrument(skip(pool, queue, result), fields(package_id = %result.version.package_id, version = %result.version.version))]
pub async fn publish(
    pool: &PgPool,
    queue: &QueueConfig,
    build_id: &str,
    result: &BuildResult,
) -> PublishResult<PublishSummary> {
    publish_inner(pool, queue, build_id, result, None).await
}

pub(crate) async fn publish_inner(
    pool: &PgPool,
    queue: &QueueConfig,
    build_id: &str,
    result: &BuildResult,
    fail_at: Option<Step>,
) -> PublishResult<PublishSummary> {
    let mut tx = pool.begin().await?;

    let build = lock_build(&mut tx, queue, build_id).await?;
    let config = load_config(&mut tx, build_id).await?;
    let migration = config.migration_build;

    let target: VersionRef = build.version.parse().map_err(ApiError::from)?;
    if result.version.package_id != build.package_id || result.version.version != target.version {
        return Err(ApiError::new(codes::BUILD_RESULT_MISMATCH)
            .param("id", build_id)
            .param("target", format!("{}@{}", result.version.package_id, result.version.version))
            .param("expected", format!("{}@{}", build.package_id, target.version))
            .into());
    }
    packages::require_package(&mut *tx, &build.package_id).await?;

    if !config.build_type.publishes_revision() {
        return publish_derived(tx, &build, &config, result, fail_at).await;
    }

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("{}@{}", build.package_id, target.version))
        .execute(&mut *tx)
        .await?;

    let revision = assign_revision(&mut tx, &build.package_id, &target, result, migration).await?;
    let key = RevisionKey::new(&build.package_id, &target.version, revision);

    if let Some(cycle) = cycles::find_declared_cycle(&key, &result.references) {
        return Err(reference_cycle(&key, &cycle).into());
    }
    if let Some(through) = cycles::find_stored_cycle(&mut tx, &key, &result.references).await? {
        return Err(reference_cycle(&key, &through).into());
    }
    search::validate_scopes(&result.operation_data)?;
    steps::check_operation_data_present(&mut tx, &result.operations, &result.operation_data).await?;

    let before = if migration {
        Some(migration::snapshot(&mut tx, &key).await?)
    } else {
        None
    };

    steps::upsert_revision(&mut tx, &key, result).await?;

    let blobs_written = content::put_blobs(&mut tx, &key.package_id, &result.document_bytes).await?;
    checkpoint(Step::Blobs, fail_at)?;

    steps::write_documents(&mut tx, &key, &result.documents, migration).await?;
    checkpoint(Step::Documents, fail_at)?;

    steps::write_references(&mut tx, &key, &result.references).await?;
    checkpoint(Step::References, fail_at)?;

    if let Some(ref archive) = result.source_archive {
        content::put_source_archive(&mut *tx, &archive.checksum, &archive.data).await?;
        content::link_version_sources(&mut *tx, &key.package_id, &key.version, key.revision, &archive.checksum)
            .await?;
    }
    checkpoint(Step::SourceArchive, fail_at)?;

    let written_hashes = steps::write_operation_data(&mut tx, &result.operation_data).await?;
    checkpoint(Step::OperationData, fail_at)?;

    steps::write_operations(&mut tx, &key, &result.operations, migration).await?;
    checkpoint(Step::Operations, fail_at)?;

    search::refresh_vectors(&mut tx, &result.operations, &written_hashes).await?;
    checkpoint(Step::SearchVectors, fail_at)?;

    let comparisons = steps::write_comparisons(&mut tx, result, build.builder_id.as_deref()).await?;
    checkpoint(Step::Comparisons, fail_at)?;

    steps::write_notifications(&mut tx, build_id, &result.builder_notifications).await?;
    checkpoint(Step::Notifications, fail_at)?;

    let groups_propagated = if migration {
        0
    } else {
        propagate::propagate_previous_groups(&mut tx, &key, &result.version, &result.version.created_by)
            .await?
    };
    checkpoint(Step::Groups, fail_at)?;

    if let Some(service_name) = result.service_name.as_deref().filter(|s| !s.is_empty()) {
        packages::set_service_name(&mut tx, &key.package_id, service_name).await?;
    }
    checkpoint(Step::ServiceName, fail_at)?;

    if let Some(ref before) = before {
        let after = migration::snapshot_of_result(result);
        migration::record(&mut tx, &key, build_id, before, &after).await?;
    }
    steps::complete_build(&mut tx, build_id, result).await?;
    checkpoint(Step::Complete, fail_at)?;

    tx.commit().await?;

    let summary = PublishSummary {
        build_id: build_id.to_string(),
        package_id: key.package_id.clone(),
        version: key.version.clone(),
        revision: key.revision,
        migration,
        blobs_written,
        operation_data_written: written_hashes.len(),
        comparisons_written: comparisons.len(),
        groups_propagated,
    };
    tracing::info!(
        build_id,
        revision = key.revision,
        migration,
        blobs_written,
        operation_data_written = summary.operation_data_written,
        comparisons_written = summary.comparisons_written,
        "Build result published"
    );
    Ok(summary)
}

/// Commit the result of a build that derives from an existing revision.
///
/// Only comparisons, notifications and the build record are written; the
/// revision the build was made for stays untouched.
async fn publish_derived(
    mut tx: Transaction<'_, Postgres>,
    build: &Build,
    config: &BuildConfig,
    result: &BuildResult,
    fail_at: Option<Step>,
) -> PublishResult<PublishSummary> {
    let build_id = build.build_id.as_str();
    let current = versions::resolve_revision(&mut *tx, &build.package_id, &build.version).await?;

    if !result.documents.is_empty() || !result.operations.is_empty() {
        tracing::warn!(
            build_id,
            build_type = %config.build_type,
            documents = result.documents.len(),
            operations = result.operations.len(),
            "Ignoring revision content in derived build result"
        );
    }

    let comparisons = steps::write_comparisons(&mut tx, result, build.builder_id.as_deref()).await?;
    checkpoint(Step::Comparisons, fail_at)?;

    steps::write_notifications(&mut tx, build_id, &result.builder_notifications).await?;
    checkpoint(Step::Notifications, fail_at)?;

    steps::complete_build(&mut tx, build_id, result).await?;
    checkpoint(Step::Complete, fail_at)?;

    tx.commit().await?;

    tracing::info!(
        build_id,
        build_type = %config.build_type,
        revision = current.revision,
        comparisons_written = comparisons.len(),
        "Derived build result published"
    );
    Ok(PublishSummary {
        build_id: build_id.to_string(),
        package_id: current.package_id,
        version: current.version,
        revision: current.revision,
        migration: false,
        blobs_written: 0,
        operation_data_written: 0,
        comparisons_written: comparisons.len(),
        groups_propagated: 0,
    })
}

/// Lock the build row and check that it can still take a result
async fn lock_build(conn: &mut PgConnection, queue: &QueueConfig, build_id: &str) -> PublishResult<Build> {
    let query = format!("SELECT {} FROM build WHERE build_id = $1 FOR UPDATE", BUILD_COLUMNS);
    let build = sqlx::query_as::<_, Build>(&query)
        .bind(build_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| build_not_found(build_id))?;

    let status = build.status()?;
    if status == BuildStatus::Complete {
        return Err(ApiError::new(codes::BUILD_ALREADY_FINISHED)
            .param("id", build_id)
            .param("status", status)
            .into());
    }
    if lifecycle::is_retriable(status, build.restart_count, queue.restart_limit) {
        return Err(ApiError::new(codes::BUILD_RETRY_PENDING).param("id", build_id).into());
    }
    Ok(build)
}

/// Stored build config; gone once retention removed the source
async fn load_config(conn: &mut PgConnection, build_id: &str) -> PublishResult<BuildConfig> {
    let raw: serde_json::Value = sqlx::query_scalar("SELECT config FROM build_src WHERE build_id = $1")
        .bind(build_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ApiError::new(codes::BUILD_SOURCE_NOT_FOUND).param("id", build_id))?;
    Ok(serde_json::from_value(raw)?)
}

/// Regular publishes take `max + 1`; a migration republishes an existing revision
async fn assign_revision(
    conn: &mut PgConnection,
    package_id: &str,
    target: &VersionRef,
    result: &BuildResult,
    migration: bool,
) -> PublishResult<i32> {
    let max = versions::max_revision_no(&mut *conn, package_id, &target.version)
        .await?
        .unwrap_or(0);

    let conflict = |revision: i32, expected: i32| {
        ApiError::new(codes::REVISION_CONFLICT)
            .param("revision", revision)
            .param("version", &target.version)
            .param("expected", expected)
    };

    if migration {
        let revision = result.version.revision.or(target.revision).unwrap_or(max);
        if revision < 1 || revision > max {
            return Err(conflict(revision, max).into());
        }
        return Ok(revision);
    }

    let expected = max + 1;
    match result.version.revision {
        None => Ok(expected),
        Some(revision) if revision == expected => Ok(revision),
        Some(revision) => Err(conflict(revision, expected).into()),
    }
}

fn reference_cycle(key: &RevisionKey, through: &RevisionKey) -> ApiError {
    ApiError::new(codes::REFERENCE_CYCLE)
        .param("id", &key.package_id)
        .param("version", format!("{}@{}", key.version, key.revision))
        .param("through", through)
}
