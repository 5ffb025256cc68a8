//! Operation groups: named subsets of a revision's operations.
//!
//! Manual groups are created and edited by users; autogenerated groups are
//! derived from a regex over each operation's match key. Members carry full
//! revision coordinates because a dashboard's groups may contain operations
//! of the revisions it references. Every mutation appends to
//! `operation_group_history`.

pub mod pattern;
pub mod propagate;

use apihub_common::error::{codes, ApiError};
use apihub_common::ids::{operation_group_id, RevisionCoords};
use apihub_common::types::{operation_match_key, ApiType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Executor, PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::db::content::INSERT_CHUNK_SIZE;
use crate::db::versions::{self, RevisionKey};
use crate::db::{is_unique_violation, DbError, DbResult};

#[derive(Error, Debug)]
pub enum GroupError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] DbError),
}

impl GroupError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            GroupError::Api(e) => Some(e),
            GroupError::Store(e) => e.api_error(),
            GroupError::Database(_) => None,
        }
    }
}

pub type GroupResult<T> = Result<T, GroupError>;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OperationGroup {
    pub group_id: String,
    pub package_id: String,
    pub version: String,
    pub revision: i32,
    pub api_type: String,
    pub group_name: String,
    pub autogenerated: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl OperationGroup {
    pub fn api_type(&self) -> Result<ApiType, ApiError> {
        self.api_type.parse().map_err(ApiError::from)
    }
}

pub(crate) const GROUP_COLUMNS: &str = "group_id, package_id, version, revision, api_type, group_name, \
                                        autogenerated, description, created_at, created_by";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GroupSummary {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub group: OperationGroup,
    pub operations_count: i64,
}

/// One operation in a group, addressed by its own revision
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupMember {
    pub package_id: String,
    pub version: String,
    pub revision: i32,
    pub operation_id: String,
}

impl GroupMember {
    pub fn new(key: &RevisionKey, operation_id: &str) -> Self {
        Self {
            package_id: key.package_id.clone(),
            version: key.version.clone(),
            revision: key.revision,
            operation_id: operation_id.to_string(),
        }
    }

    pub fn key(&self) -> RevisionKey {
        RevisionKey::new(&self.package_id, &self.version, self.revision)
    }
}

/// Operation named in an add/remove request; coordinates default to the
/// group's own revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRef {
    pub operation_id: String,
    #[serde(default)]
    pub package_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub revision: Option<i32>,
}

impl OperationRef {
    pub fn own(operation_id: &str) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            package_id: None,
            version: None,
            revision: None,
        }
    }

    fn resolve(&self, key: &RevisionKey) -> GroupMember {
        GroupMember {
            package_id: self.package_id.clone().unwrap_or_else(|| key.package_id.clone()),
            version: self.version.clone().unwrap_or_else(|| key.version.clone()),
            revision: self.revision.unwrap_or(key.revision),
            operation_id: self.operation_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub group_id: String,
    pub action: String,
    pub data: serde_json::Value,
    pub automatic: bool,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

fn group_not_found(name: &str) -> ApiError {
    ApiError::new(codes::GROUP_NOT_FOUND).param("name", name)
}

fn validate_name(name: &str) -> Result<&str, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::new(codes::INVALID_VALUE)
            .param("field", "group_name")
            .param("value", name));
    }
    Ok(name)
}

// ============================================================================
// Shared row helpers
// ============================================================================

pub(crate) async fn group_members<'e, E>(executor: E, group_id: &str) -> DbResult<Vec<GroupMember>>
where
    E: Executor<'e, Database = Postgres>,
{
    let members = sqlx::query_as::<_, GroupMember>(
        "SELECT package_id, version, revision, operation_id FROM grouped_operation \
         WHERE group_id = $1 ORDER BY package_id, version, revision, operation_id",
    )
    .bind(group_id)
    .fetch_all(executor)
    .await?;
    Ok(members)
}

pub(crate) async fn insert_members(
    conn: &mut PgConnection,
    group_id: &str,
    members: &[GroupMember],
) -> DbResult<u64> {
    let mut written = 0;
    for chunk in members.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO grouped_operation (group_id, package_id, version, revision, operation_id) ",
        );
        builder.push_values(chunk, |mut row, member| {
            row.push_bind(group_id)
                .push_bind(&member.package_id)
                .push_bind(&member.version)
                .push_bind(member.revision)
                .push_bind(&member.operation_id);
        });
        builder.push(" ON CONFLICT DO NOTHING");
        written += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

pub(crate) async fn record_history(
    conn: &mut PgConnection,
    group_id: &str,
    action: &str,
    data: serde_json::Value,
    automatic: bool,
    user: &str,
) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO operation_group_history (group_id, action, data, automatic, user_id) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(group_id)
    .bind(action)
    .bind(data)
    .bind(automatic)
    .bind(user)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_group(
    conn: &mut PgConnection,
    key: &RevisionKey,
    api_type: ApiType,
    name: &str,
    description: &str,
    autogenerated: bool,
    user: &str,
) -> GroupResult<OperationGroup> {
    let group_id = operation_group_id(
        RevisionCoords::new(&key.package_id, &key.version, key.revision),
        api_type,
        name,
    );
    let query = format!(
        "INSERT INTO operation_group \
         (group_id, package_id, version, revision, api_type, group_name, autogenerated, description, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {}",
        GROUP_COLUMNS
    );
    sqlx::query_as::<_, OperationGroup>(&query)
        .bind(&group_id)
        .bind(&key.package_id)
        .bind(&key.version)
        .bind(key.revision)
        .bind(api_type.as_str())
        .bind(name)
        .bind(autogenerated)
        .bind(description)
        .bind(user)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                GroupError::Api(ApiError::new(codes::GROUP_ALREADY_EXISTS).param("name", name))
            } else {
                GroupError::Database(e)
            }
        })
}

/// Lock a group row of the revision for a membership change
async fn lock_group(
    conn: &mut PgConnection,
    key: &RevisionKey,
    api_type: ApiType,
    name: &str,
) -> GroupResult<OperationGroup> {
    let query = format!(
        "SELECT {} FROM operation_group \
         WHERE package_id = $1 AND version = $2 AND revision = $3 AND api_type = $4 AND group_name = $5 \
         FOR UPDATE",
        GROUP_COLUMNS
    );
    sqlx::query_as::<_, OperationGroup>(&query)
        .bind(&key.package_id)
        .bind(&key.version)
        .bind(key.revision)
        .bind(api_type.as_str())
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| group_not_found(name).into())
}

// ============================================================================
// Queries
// ============================================================================

#[tracing::instrument(skip(pool))]
pub async fn list_groups(pool: &PgPool, key: &RevisionKey, api_type: ApiType) -> GroupResult<Vec<GroupSummary>> {
    let query = format!(
        "SELECT {}, \
                (SELECT COUNT(*) FROM grouped_operation m WHERE m.group_id = g.group_id) AS operations_count \
         FROM operation_group g \
         WHERE package_id = $1 AND version = $2 AND revision = $3 AND api_type = $4 \
         ORDER BY group_name",
        GROUP_COLUMNS
            .split(", ")
            .map(|c| format!("g.{}", c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let groups = sqlx::query_as::<_, GroupSummary>(&query)
        .bind(&key.package_id)
        .bind(&key.version)
        .bind(key.revision)
        .bind(api_type.as_str())
        .fetch_all(pool)
        .await?;
    Ok(groups)
}

/// Members of a named group
pub async fn list_members(
    pool: &PgPool,
    key: &RevisionKey,
    api_type: ApiType,
    name: &str,
) -> GroupResult<Vec<GroupMember>> {
    let group_id = operation_group_id(
        RevisionCoords::new(&key.package_id, &key.version, key.revision),
        api_type,
        name,
    );
    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM operation_group WHERE group_id = $1)")
        .bind(&group_id)
        .fetch_one(pool)
        .await?;
    if !exists {
        return Err(group_not_found(name).into());
    }
    Ok(group_members(pool, &group_id).await?)
}

pub async fn group_history(pool: &PgPool, group_id: &str) -> GroupResult<Vec<HistoryEntry>> {
    let entries = sqlx::query_as::<_, HistoryEntry>(
        "SELECT id, group_id, action, data, automatic, user_id, created_at \
         FROM operation_group_history WHERE group_id = $1 ORDER BY id",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

// ============================================================================
// Manual groups
// ============================================================================

#[tracing::instrument(skip(pool, description))]
pub async fn create_group(
    pool: &PgPool,
    key: &RevisionKey,
    api_type: ApiType,
    name: &str,
    description: &str,
    user: &str,
) -> GroupResult<OperationGroup> {
    let name = validate_name(name)?;
    let mut tx = pool.begin().await?;

    let group = insert_group(&mut tx, key, api_type, name, description, false, user).await?;
    record_history(&mut tx, &group.group_id, "create", json!({ "description": description }), false, user)
        .await?;

    tx.commit().await?;
    tracing::info!(group_id = %group.group_id, revision = %key, "Operation group created");
    Ok(group)
}

#[tracing::instrument(skip(pool))]
pub async fn delete_group(
    pool: &PgPool,
    key: &RevisionKey,
    api_type: ApiType,
    name: &str,
    user: &str,
) -> GroupResult<()> {
    let mut tx = pool.begin().await?;
    let group = lock_group(&mut tx, key, api_type, name).await?;

    sqlx::query("DELETE FROM operation_group WHERE group_id = $1")
        .bind(&group.group_id)
        .execute(&mut *tx)
        .await?;
    record_history(&mut tx, &group.group_id, "delete", json!({ "name": group.group_name }), false, user)
        .await?;

    tx.commit().await?;
    tracing::info!(group_id = %group.group_id, "Operation group deleted");
    Ok(())
}

/// Members that do not resolve: own operations must exist in `key` with the
/// group's api type, foreign ones must also sit in an active reference
async fn find_unresolved(
    conn: &mut PgConnection,
    key: &RevisionKey,
    api_type: ApiType,
    members: &[GroupMember],
) -> GroupResult<Option<GroupMember>> {
    let foreign: Vec<&GroupMember> = members.iter().filter(|m| &m.key() != key).collect();
    let refs: BTreeSet<RevisionKey> = if foreign.is_empty() {
        BTreeSet::new()
    } else {
        versions::transitive_refs(conn, key).await?.into_iter().collect()
    };

    for member in members {
        let coords = member.key();
        if &coords != key && !refs.contains(&coords) {
            return Ok(Some(member.clone()));
        }
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM operation \
             WHERE package_id = $1 AND version = $2 AND revision = $3 AND operation_id = $4 AND api_type = $5)",
        )
        .bind(&member.package_id)
        .bind(&member.version)
        .bind(member.revision)
        .bind(&member.operation_id)
        .bind(api_type.as_str())
        .fetch_one(&mut *conn)
        .await?;
        if !exists {
            return Ok(Some(member.clone()));
        }
    }
    Ok(None)
}

#[tracing::instrument(skip(pool, operations), fields(count = operations.len()))]
pub async fn add_operations(
    pool: &PgPool,
    key: &RevisionKey,
    api_type: ApiType,
    name: &str,
    operations: &[OperationRef],
    user: &str,
) -> GroupResult<u64> {
    let members: Vec<GroupMember> = operations
        .iter()
        .map(|op| op.resolve(key))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut tx = pool.begin().await?;
    let group = lock_group(&mut tx, key, api_type, name).await?;

    if let Some(missing) = find_unresolved(&mut tx, key, api_type, &members).await? {
        return Err(ApiError::new(codes::OPERATION_NOT_FOUND)
            .param("operation", &missing.operation_id)
            .param("id", &missing.package_id)
            .param("version", format!("{}@{}", missing.version, missing.revision))
            .into());
    }

    let added = insert_members(&mut tx, &group.group_id, &members).await?;
    record_history(
        &mut tx,
        &group.group_id,
        "add_operations",
        json!({ "operations": members, "added": added }),
        false,
        user,
    )
    .await?;

    tx.commit().await?;
    tracing::debug!(group_id = %group.group_id, added, "Operations added to group");
    Ok(added)
}

#[tracing::instrument(skip(pool, operations), fields(count = operations.len()))]
pub async fn remove_operations(
    pool: &PgPool,
    key: &RevisionKey,
    api_type: ApiType,
    name: &str,
    operations: &[OperationRef],
    user: &str,
) -> GroupResult<u64> {
    let members: Vec<GroupMember> = operations.iter().map(|op| op.resolve(key)).collect();

    let mut tx = pool.begin().await?;
    let group = lock_group(&mut tx, key, api_type, name).await?;

    let mut removed = 0;
    for member in &members {
        removed += sqlx::query(
            "DELETE FROM grouped_operation \
             WHERE group_id = $1 AND package_id = $2 AND version = $3 AND revision = $4 AND operation_id = $5",
        )
        .bind(&group.group_id)
        .bind(&member.package_id)
        .bind(&member.version)
        .bind(member.revision)
        .bind(&member.operation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    record_history(
        &mut tx,
        &group.group_id,
        "remove_operations",
        json!({ "operations": members, "removed": removed }),
        false,
        user,
    )
    .await?;

    tx.commit().await?;
    Ok(removed)
}

// ============================================================================
// Autogenerated groups
// ============================================================================

#[derive(sqlx::FromRow)]
struct MatchRow {
    operation_id: String,
    kind: String,
    metadata: serde_json::Value,
}

/// Rebuild the autogenerated groups of a revision from `pattern`.
///
/// The previous autogenerated set is replaced. A capture value that names an
/// existing manual group is skipped.
#[tracing::instrument(skip(pool))]
pub async fn autogenerate_groups(
    pool: &PgPool,
    key: &RevisionKey,
    api_type: ApiType,
    pattern: &str,
    user: &str,
) -> GroupResult<Vec<GroupSummary>> {
    let regex = pattern::compile(pattern)?;
    let mut tx = pool.begin().await?;

    let removed = sqlx::query(
        "DELETE FROM operation_group \
         WHERE package_id = $1 AND version = $2 AND revision = $3 AND api_type = $4 AND autogenerated",
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .bind(api_type.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let manual: Vec<String> = sqlx::query_scalar(
        "SELECT group_name FROM operation_group \
         WHERE package_id = $1 AND version = $2 AND revision = $3 AND api_type = $4",
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .bind(api_type.as_str())
    .fetch_all(&mut *tx)
    .await?;
    let manual: BTreeSet<String> = manual.into_iter().collect();

    let rows = sqlx::query_as::<_, MatchRow>(
        "SELECT operation_id, kind, metadata FROM operation \
         WHERE package_id = $1 AND version = $2 AND revision = $3 AND api_type = $4 \
         ORDER BY operation_id",
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .bind(api_type.as_str())
    .fetch_all(&mut *tx)
    .await?;

    let grouped = pattern::group_operations(
        &regex,
        rows.iter().map(|row| {
            (
                row.operation_id.as_str(),
                operation_match_key(api_type, &row.operation_id, &row.kind, &row.metadata),
            )
        }),
    );

    let mut summaries = Vec::new();
    for (name, operation_ids) in grouped {
        if manual.contains(&name) {
            tracing::debug!(group = %name, "Skipping autogenerated group shadowed by a manual group");
            continue;
        }
        let group = insert_group(&mut tx, key, api_type, &name, "", true, user).await?;
        let members: Vec<GroupMember> = operation_ids
            .iter()
            .map(|id| GroupMember::new(key, id))
            .collect();
        insert_members(&mut tx, &group.group_id, &members).await?;
        record_history(
            &mut tx,
            &group.group_id,
            "autogenerate",
            json!({ "pattern": pattern, "operations": members.len() }),
            true,
            user,
        )
        .await?;
        summaries.push(GroupSummary {
            group,
            operations_count: members.len() as i64,
        });
    }

    tx.commit().await?;
    tracing::info!(
        revision = %key,
        api_type = %api_type,
        removed,
        created = summaries.len(),
        "Autogenerated operation groups rebuilt"
    );
    Ok(summaries)
}
