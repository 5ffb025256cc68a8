//! Package namespace: creation, tombstones and id transitions.
//!
//! Package ids are dotted paths; the parent of a package is always the
//! prefix before the last dot and must exist when the child is created.

use apihub_common::error::{codes, ApiError};
use apihub_common::types::package::workspace_id;
use apihub_common::types::{parent_package_id, validate_package_id, PackageKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, PgPool, Postgres};

use super::{is_unique_violation, DbError, DbResult};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Package {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub default_released_version: Option<String>,
    pub service_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

const PACKAGE_COLUMNS: &str = "id, kind, name, parent_id, default_released_version, service_name, \
                               created_at, created_by, deleted_at";

fn not_found(id: &str) -> DbError {
    ApiError::new(codes::PACKAGE_NOT_FOUND).param("id", id).into()
}

#[tracing::instrument(skip(pool))]
pub async fn create_package(
    pool: &PgPool,
    id: &str,
    kind: PackageKind,
    name: &str,
    created_by: &str,
) -> DbResult<Package> {
    validate_package_id(id).map_err(ApiError::from)?;

    let parent_id = parent_package_id(id);
    match parent_id {
        Some(parent) => {
            get_package(pool, parent).await?.ok_or_else(|| not_found(parent))?;
        },
        None if kind != PackageKind::Workspace => {
            return Err(ApiError::new(codes::INVALID_VALUE)
                .param("field", "kind")
                .param("value", kind)
                .debug("top-level packages must be workspaces")
                .into());
        },
        None => {},
    }

    let query = format!(
        "INSERT INTO package_group (id, kind, name, parent_id, created_by) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {}",
        PACKAGE_COLUMNS
    );
    let package = sqlx::query_as::<_, Package>(&query)
        .bind(id)
        .bind(kind.as_str())
        .bind(name)
        .bind(parent_id)
        .bind(created_by)
        .fetch_one(pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ApiError::new(codes::PACKAGE_ALREADY_EXISTS).param("id", id).into()
            } else {
                DbError::from(e)
            }
        })?;

    tracing::info!(package_id = %id, kind = %kind, "Package created");
    Ok(package)
}

/// Undeleted package by id
pub async fn get_package<'e, E>(executor: E, id: &str) -> DbResult<Option<Package>>
where
    E: Executor<'e, Database = Postgres>,
{
    let query = format!(
        "SELECT {} FROM package_group WHERE id = $1 AND deleted_at IS NULL",
        PACKAGE_COLUMNS
    );
    let package = sqlx::query_as::<_, Package>(&query)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(package)
}

/// Like [`get_package`] but fails with `PackageNotFound`
pub async fn require_package<'e, E>(executor: E, id: &str) -> DbResult<Package>
where
    E: Executor<'e, Database = Postgres>,
{
    get_package(executor, id).await?.ok_or_else(|| not_found(id))
}

/// Tombstone a package and every descendant. Returns the number of rows marked.
#[tracing::instrument(skip(pool))]
pub async fn delete_package(pool: &PgPool, id: &str, deleted_by: &str) -> DbResult<u64> {
    require_package(pool, id).await?;

    let result = sqlx::query(
        r#"
        UPDATE package_group
        SET deleted_at = NOW(), deleted_by = $3
        WHERE (id = $1 OR id LIKE $2) AND deleted_at IS NULL
        "#,
    )
    .bind(id)
    .bind(format!("{}.%", id.replace('%', "\\%").replace('_', "\\_")))
    .bind(deleted_by)
    .execute(pool)
    .await?;

    tracing::info!(package_id = %id, deleted = result.rows_affected(), "Package tombstoned");
    Ok(result.rows_affected())
}

/// Record that `old_id` now lives at `new_id`
#[tracing::instrument(skip(pool))]
pub async fn move_package(pool: &PgPool, old_id: &str, new_id: &str) -> DbResult<()> {
    validate_package_id(old_id).map_err(ApiError::from)?;
    validate_package_id(new_id).map_err(ApiError::from)?;

    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE package_transition SET new_package_id = $2 WHERE new_package_id = $1")
        .bind(old_id)
        .bind(new_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO package_transition (old_package_id, new_package_id)
        VALUES ($1, $2)
        ON CONFLICT (old_package_id) DO UPDATE SET new_package_id = EXCLUDED.new_package_id
        "#,
    )
    .bind(old_id)
    .bind(new_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM package_transition WHERE old_package_id = new_package_id")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    tracing::info!(old_id, new_id, "Package transition recorded");
    Ok(())
}

/// Where a moved package lives now
pub async fn resolve_transition(pool: &PgPool, id: &str) -> DbResult<Option<String>> {
    let new_id = sqlx::query_scalar::<_, String>(
        "SELECT new_package_id FROM package_transition WHERE old_package_id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(new_id)
}

pub async fn set_default_released_version(
    pool: &PgPool,
    id: &str,
    version: Option<&str>,
) -> DbResult<()> {
    let result = sqlx::query(
        "UPDATE package_group SET default_released_version = $2 WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(not_found(id));
    }
    Ok(())
}

/// Bind a service name to the package and its workspace
pub async fn set_service_name(
    conn: &mut sqlx::PgConnection,
    id: &str,
    service_name: &str,
) -> DbResult<()> {
    sqlx::query("UPDATE package_group SET service_name = $2 WHERE id = $1")
        .bind(id)
        .bind(service_name)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO package_service (workspace_id, package_id, service_name)
        VALUES ($1, $2, $3)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(workspace_id(id))
    .bind(id)
    .bind(service_name)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(pool: &PgPool) {
        create_package(pool, "acme", PackageKind::Workspace, "Acme", "admin").await.unwrap();
        create_package(pool, "acme.svc", PackageKind::Package, "Service", "admin").await.unwrap();
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_create_derives_parent(pool: PgPool) {
        seed(&pool).await;
        let package = get_package(&pool, "acme.svc").await.unwrap().unwrap();
        assert_eq!(package.parent_id.as_deref(), Some("acme"));
        assert_eq!(package.kind, "package");
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_create_rejects_duplicates_and_orphans(pool: PgPool) {
        seed(&pool).await;

        let dup = create_package(&pool, "acme.svc", PackageKind::Package, "x", "admin")
            .await
            .unwrap_err();
        assert!(dup.api_error().unwrap().is(codes::PACKAGE_ALREADY_EXISTS));

        let orphan = create_package(&pool, "nope.svc", PackageKind::Package, "x", "admin")
            .await
            .unwrap_err();
        assert!(orphan.api_error().unwrap().is(codes::PACKAGE_NOT_FOUND));

        let bad = create_package(&pool, "acme..svc", PackageKind::Package, "x", "admin")
            .await
            .unwrap_err();
        assert!(bad.api_error().unwrap().is(codes::INVALID_PACKAGE_ID));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_delete_cascades_to_descendants_only(pool: PgPool) {
        seed(&pool).await;
        create_package(&pool, "acme.svc.v2", PackageKind::Package, "v2", "admin").await.unwrap();
        create_package(&pool, "acme.svcx", PackageKind::Package, "x", "admin").await.unwrap();

        assert_eq!(delete_package(&pool, "acme.svc", "admin").await.unwrap(), 2);
        assert!(get_package(&pool, "acme.svc.v2").await.unwrap().is_none());
        assert!(get_package(&pool, "acme.svcx").await.unwrap().is_some());
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_move_rewrites_chains(pool: PgPool) {
        move_package(&pool, "acme.a", "acme.b").await.unwrap();
        move_package(&pool, "acme.b", "acme.c").await.unwrap();
        assert_eq!(resolve_transition(&pool, "acme.a").await.unwrap().as_deref(), Some("acme.c"));
        assert_eq!(resolve_transition(&pool, "acme.b").await.unwrap().as_deref(), Some("acme.c"));

        // Moving back drops the self-transition
        move_package(&pool, "acme.c", "acme.a").await.unwrap();
        assert_eq!(resolve_transition(&pool, "acme.a").await.unwrap(), None);
        assert_eq!(resolve_transition(&pool, "acme.b").await.unwrap().as_deref(), Some("acme.a"));
    }
}
