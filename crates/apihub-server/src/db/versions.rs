//! Version store: revisions and everything attached to them.
//!
//! Revisions are immutable once published except for `status`, `labels` and
//! the tombstone. A version address `v` resolves to the highest undeleted
//! revision of `v`; `v@r` pins revision `r`.
//!
//! # Key Operations
//!
//! - `resolve_revision()` - turn a version address into a revision row
//! - `list_documents()` / `get_document()` / `get_document_content()`
//! - `list_operations()`, `operation_type_counts()`, `deprecated_summary()`
//! - `list_references()` and `transitive_refs()` - the reference DAG
//! - `update_revision_meta()` and `delete_revision()` - the only mutations

use apihub_common::error::{codes, ApiError};
use apihub_common::types::{ApiType, Pagination, VersionRef, VersionStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, PgConnection, PgPool, Postgres};
use std::collections::HashSet;

use super::content::{self, Blob};
use super::{DbError, DbResult};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Revision {
    pub package_id: String,
    pub version: String,
    pub revision: i32,
    pub status: String,
    pub labels: Vec<String>,
    pub previous_version_package_id: Option<String>,
    pub previous_version: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Revision {
    pub fn key(&self) -> RevisionKey {
        RevisionKey::new(&self.package_id, &self.version, self.revision)
    }
}

/// Coordinates of a revision
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, sqlx::FromRow)]
pub struct RevisionKey {
    pub package_id: String,
    pub version: String,
    pub revision: i32,
}

impl RevisionKey {
    pub fn new(package_id: &str, version: &str, revision: i32) -> Self {
        Self {
            package_id: package_id.to_string(),
            version: version.to_string(),
            revision,
        }
    }
}

impl std::fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}@{}", self.package_id, self.version, self.revision)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Document {
    pub file_id: String,
    pub slug: String,
    pub checksum: String,
    pub media_type: String,
    pub title: String,
    pub file_index: i32,
    pub operation_ids: Vec<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Operation {
    pub operation_id: String,
    pub api_type: String,
    pub data_hash: String,
    pub deprecated: bool,
    pub kind: String,
    pub title: String,
    pub api_audience: String,
    pub metadata: serde_json::Value,
    pub models: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Reference {
    pub reference_id: String,
    pub reference_version: String,
    pub reference_revision: i32,
    pub parent_reference_id: String,
    pub parent_reference_version: String,
    pub parent_reference_revision: i32,
    pub excluded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct OperationTypeCount {
    pub api_type: String,
    pub operations_count: i64,
    pub deprecated_count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeprecatedOperation {
    pub operation_id: String,
    pub api_type: String,
    pub title: String,
    pub tags: Vec<String>,
}

const REVISION_COLUMNS: &str = "package_id, version, revision, status, labels, \
                                previous_version_package_id, previous_version, metadata, \
                                created_at, created_by, deleted_at";

fn version_not_found(package_id: &str, version: &impl std::fmt::Display) -> DbError {
    ApiError::new(codes::VERSION_NOT_FOUND)
        .param("id", package_id)
        .param("version", version)
        .into()
}

// ============================================================================
// Revisions
// ============================================================================

/// Resolve `v` or `v@r` to an undeleted revision
pub async fn resolve_revision<'e, E>(
    executor: E,
    package_id: &str,
    version_spec: &str,
) -> DbResult<Revision>
where
    E: Executor<'e, Database = Postgres>,
{
    let version_ref: VersionRef = version_spec.parse().map_err(ApiError::from)?;
    find_revision(executor, package_id, &version_ref)
        .await?
        .ok_or_else(|| version_not_found(package_id, &version_ref))
}

pub async fn find_revision<'e, E>(
    executor: E,
    package_id: &str,
    version_ref: &VersionRef,
) -> DbResult<Option<Revision>>
where
    E: Executor<'e, Database = Postgres>,
{
    let query = format!(
        "SELECT {} FROM published_version \
         WHERE package_id = $1 AND version = $2 AND deleted_at IS NULL \
           AND ($3::INTEGER IS NULL OR revision = $3) \
         ORDER BY revision DESC LIMIT 1",
        REVISION_COLUMNS
    );
    let revision = sqlx::query_as::<_, Revision>(&query)
        .bind(package_id)
        .bind(&version_ref.version)
        .bind(version_ref.revision)
        .fetch_optional(executor)
        .await?;
    Ok(revision)
}

/// Highest revision number ever assigned to the version, tombstones included
pub async fn max_revision_no<'e, E>(executor: E, package_id: &str, version: &str) -> DbResult<Option<i32>>
where
    E: Executor<'e, Database = Postgres>,
{
    let max = sqlx::query_scalar::<_, Option<i32>>(
        "SELECT MAX(revision) FROM published_version WHERE package_id = $1 AND version = $2",
    )
    .bind(package_id)
    .bind(version)
    .fetch_one(executor)
    .await?;
    Ok(max)
}

#[tracing::instrument(skip(pool, labels))]
pub async fn update_revision_meta(
    pool: &PgPool,
    package_id: &str,
    version_spec: &str,
    status: Option<VersionStatus>,
    labels: Option<Vec<String>>,
) -> DbResult<Revision> {
    let current = resolve_revision(pool, package_id, version_spec).await?;

    let query = format!(
        "UPDATE published_version \
         SET status = COALESCE($4, status), labels = COALESCE($5, labels) \
         WHERE package_id = $1 AND version = $2 AND revision = $3 \
         RETURNING {}",
        REVISION_COLUMNS
    );
    let updated = sqlx::query_as::<_, Revision>(&query)
        .bind(package_id)
        .bind(&current.version)
        .bind(current.revision)
        .bind(status.map(VersionStatus::as_str))
        .bind(labels)
        .fetch_one(pool)
        .await?;

    Ok(updated)
}

/// Tombstone a revision (`v@r`) or every revision of a version (`v`).
///
/// Operation group memberships of the tombstoned revisions are dropped. Once
/// no live revision of the version remains, the package's default released
/// version and any `previous_version` pointers at it are cleared too.
#[tracing::instrument(skip(pool))]
pub async fn delete_revision(
    pool: &PgPool,
    package_id: &str,
    version_spec: &str,
    deleted_by: &str,
) -> DbResult<u64> {
    let version_ref: VersionRef = version_spec.parse().map_err(ApiError::from)?;
    let mut tx = pool.begin().await?;

    let deleted: Vec<i32> = sqlx::query_scalar(
        r#"
        UPDATE published_version
        SET deleted_at = NOW(), deleted_by = $4
        WHERE package_id = $1 AND version = $2 AND deleted_at IS NULL
          AND ($3::INTEGER IS NULL OR revision = $3)
        RETURNING revision
        "#,
    )
    .bind(package_id)
    .bind(&version_ref.version)
    .bind(version_ref.revision)
    .bind(deleted_by)
    .fetch_all(&mut *tx)
    .await?;

    if deleted.is_empty() {
        return Err(version_not_found(package_id, &version_ref));
    }

    sqlx::query(
        r#"
        DELETE FROM grouped_operation
        WHERE group_id IN (
            SELECT group_id FROM operation_group
            WHERE package_id = $1 AND version = $2 AND revision = ANY($3)
        )
        "#,
    )
    .bind(package_id)
    .bind(&version_ref.version)
    .bind(&deleted)
    .execute(&mut *tx)
    .await?;

    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM published_version \
         WHERE package_id = $1 AND version = $2 AND deleted_at IS NULL",
    )
    .bind(package_id)
    .bind(&version_ref.version)
    .fetch_one(&mut *tx)
    .await?;

    if live == 0 {
        sqlx::query(
            "UPDATE package_group SET default_released_version = NULL \
             WHERE id = $1 AND default_released_version = $2",
        )
        .bind(package_id)
        .bind(&version_ref.version)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE published_version
            SET previous_version_package_id = NULL, previous_version = NULL
            WHERE previous_version = $2
              AND COALESCE(previous_version_package_id, package_id) = $1
            "#,
        )
        .bind(package_id)
        .bind(&version_ref.version)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::info!(
        package_id,
        version = %version_ref.version,
        revisions = ?deleted,
        "Revisions tombstoned"
    );
    Ok(deleted.len() as u64)
}

// ============================================================================
// Documents
// ============================================================================

/// Documents of a revision in presentation order
pub async fn list_documents<'e, E>(executor: E, key: &RevisionKey) -> DbResult<Vec<Document>>
where
    E: Executor<'e, Database = Postgres>,
{
    let documents = sqlx::query_as::<_, Document>(
        r#"
        SELECT file_id, slug, checksum, media_type, title, file_index, operation_ids, metadata
        FROM published_version_revision_content
        WHERE package_id = $1 AND version = $2 AND revision = $3
        ORDER BY file_index, file_id
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .fetch_all(executor)
    .await?;
    Ok(documents)
}

pub async fn get_document(pool: &PgPool, key: &RevisionKey, slug: &str) -> DbResult<Document> {
    sqlx::query_as::<_, Document>(
        r#"
        SELECT file_id, slug, checksum, media_type, title, file_index, operation_ids, metadata
        FROM published_version_revision_content
        WHERE package_id = $1 AND version = $2 AND revision = $3 AND slug = $4
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .bind(slug)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| document_not_found(key, slug))
}

/// Document row plus its bytes from the content store
pub async fn get_document_content(
    pool: &PgPool,
    key: &RevisionKey,
    slug: &str,
) -> DbResult<(Document, Blob)> {
    let document = get_document(pool, key, slug).await?;
    let blob = content::get_blob(pool, &key.package_id, &document.checksum)
        .await?
        .ok_or_else(|| {
            DbError::from(
                ApiError::new(codes::DOCUMENT_NOT_FOUND)
                    .param("slug", slug)
                    .param("version", format!("{}@{}", key.version, key.revision))
                    .param("id", &key.package_id)
                    .debug(format!("content {} is missing", document.checksum)),
            )
        })?;
    Ok((document, blob))
}

fn document_not_found(key: &RevisionKey, slug: &str) -> DbError {
    ApiError::new(codes::DOCUMENT_NOT_FOUND)
        .param("slug", slug)
        .param("version", format!("{}@{}", key.version, key.revision))
        .param("id", &key.package_id)
        .into()
}

// ============================================================================
// Operations
// ============================================================================

pub async fn list_operations(
    pool: &PgPool,
    key: &RevisionKey,
    api_type: Option<ApiType>,
    pagination: Pagination,
) -> DbResult<Vec<Operation>> {
    let operations = sqlx::query_as::<_, Operation>(
        r#"
        SELECT operation_id, api_type, data_hash, deprecated, kind, title, api_audience,
               metadata, models
        FROM operation
        WHERE package_id = $1 AND version = $2 AND revision = $3
          AND ($4::TEXT IS NULL OR api_type = $4)
        ORDER BY operation_id
        LIMIT $5 OFFSET $6
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .bind(api_type.map(ApiType::as_str))
    .bind(pagination.limit)
    .bind(pagination.offset)
    .fetch_all(pool)
    .await?;
    Ok(operations)
}

pub async fn operation_type_counts(pool: &PgPool, key: &RevisionKey) -> DbResult<Vec<OperationTypeCount>> {
    let counts = sqlx::query_as::<_, OperationTypeCount>(
        r#"
        SELECT api_type,
               COUNT(*) AS operations_count,
               COUNT(*) FILTER (WHERE deprecated) AS deprecated_count
        FROM operation
        WHERE package_id = $1 AND version = $2 AND revision = $3
        GROUP BY api_type
        ORDER BY api_type
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .fetch_all(pool)
    .await?;
    Ok(counts)
}

pub async fn deprecated_summary(pool: &PgPool, key: &RevisionKey) -> DbResult<Vec<DeprecatedOperation>> {
    let operations = sqlx::query_as::<_, DeprecatedOperation>(
        r#"
        SELECT operation_id, api_type, title,
               COALESCE(
                   ARRAY(SELECT jsonb_array_elements_text(
                       CASE WHEN jsonb_typeof(metadata -> 'tags') = 'array'
                            THEN metadata -> 'tags' ELSE '[]'::jsonb END)),
                   '{}'
               ) AS tags
        FROM operation
        WHERE package_id = $1 AND version = $2 AND revision = $3 AND deprecated
        ORDER BY api_type, operation_id
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .fetch_all(pool)
    .await?;
    Ok(operations)
}

// ============================================================================
// References
// ============================================================================

pub async fn list_references<'e, E>(executor: E, key: &RevisionKey) -> DbResult<Vec<Reference>>
where
    E: Executor<'e, Database = Postgres>,
{
    let references = sqlx::query_as::<_, Reference>(
        r#"
        SELECT reference_id, reference_version, reference_revision,
               parent_reference_id, parent_reference_version, parent_reference_revision,
               excluded
        FROM published_version_reference
        WHERE package_id = $1 AND version = $2 AND revision = $3
        ORDER BY reference_id, reference_version, reference_revision
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .fetch_all(executor)
    .await?;
    Ok(references)
}

/// Direct, non-excluded references into undeleted revisions
async fn active_refs(conn: &mut PgConnection, key: &RevisionKey) -> DbResult<Vec<RevisionKey>> {
    let refs = sqlx::query_as::<_, RevisionKey>(
        r#"
        SELECT DISTINCT r.reference_id AS package_id,
               r.reference_version AS version,
               r.reference_revision AS revision
        FROM published_version_reference r
        JOIN published_version v
          ON v.package_id = r.reference_id
         AND v.version = r.reference_version
         AND v.revision = r.reference_revision
        WHERE r.package_id = $1 AND r.version = $2 AND r.revision = $3
          AND NOT r.excluded
          AND v.deleted_at IS NULL
        ORDER BY 1, 2, 3
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .fetch_all(&mut *conn)
    .await?;
    Ok(refs)
}

/// Every revision reachable from `root` over active references, excluding
/// `root` itself. Each revision is visited once, so cycles terminate.
pub async fn transitive_refs(conn: &mut PgConnection, root: &RevisionKey) -> DbResult<Vec<RevisionKey>> {
    let mut visited: HashSet<RevisionKey> = HashSet::new();
    let mut stack = vec![root.clone()];
    let mut closure = Vec::new();
    visited.insert(root.clone());

    while let Some(node) = stack.pop() {
        for next in active_refs(conn, &node).await? {
            if visited.insert(next.clone()) {
                closure.push(next.clone());
                stack.push(next);
            }
        }
    }

    closure.sort();
    Ok(closure)
}
