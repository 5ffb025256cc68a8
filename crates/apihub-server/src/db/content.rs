//! Content store: document bytes and source archives keyed by checksum.
//!
//! Document bytes are deduplicated per `(package_id, checksum)`, source
//! archives globally per checksum. Writes are idempotent and never rewrite
//! stored bytes; a dedup hit locks the row and refreshes its `created_at`, so
//! the housekeeping reaper cannot remove content a publish is about to link.
//! Reads do not re-verify the checksum.

use apihub_common::types::DocumentBytes;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;

use super::DbResult;

/// Rows per multi-row INSERT; keeps the bind count well below the protocol limit
pub const INSERT_CHUNK_SIZE: usize = 1000;

/// Result of an idempotent put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Deduped,
}

impl PutOutcome {
    /// `xmax = 0` holds for a freshly inserted row, not for an upserted one
    fn from_inserted(inserted: bool) -> Self {
        if inserted {
            PutOutcome::Stored
        } else {
            PutOutcome::Deduped
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Blob {
    pub package_id: String,
    pub checksum: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VersionSources {
    pub archive_checksum: String,
    pub data: Vec<u8>,
}

pub async fn put_blob<'e, E>(
    executor: E,
    package_id: &str,
    checksum: &str,
    media_type: &str,
    data: &[u8],
) -> DbResult<PutOutcome>
where
    E: Executor<'e, Database = Postgres>,
{
    let inserted: bool = sqlx::query_scalar(
        r#"
        INSERT INTO published_data (package_id, checksum, media_type, data)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (package_id, checksum) DO UPDATE SET created_at = NOW()
        RETURNING (xmax = 0)
        "#,
    )
    .bind(package_id)
    .bind(checksum)
    .bind(media_type)
    .bind(data)
    .fetch_one(executor)
    .await?;

    Ok(PutOutcome::from_inserted(inserted))
}

/// Insert every distinct checksum of `blobs` that is not stored yet and touch
/// the ones that are.
///
/// Returns the number of rows actually written.
pub async fn put_blobs(
    conn: &mut sqlx::PgConnection,
    package_id: &str,
    blobs: &[DocumentBytes],
) -> DbResult<u64> {
    let distinct: BTreeMap<&str, &DocumentBytes> =
        blobs.iter().map(|b| (b.checksum.as_str(), b)).collect();
    let rows: Vec<&DocumentBytes> = distinct.into_values().collect();

    let mut written = 0;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO published_data (package_id, checksum, media_type, data) ");
        builder.push_values(chunk, |mut row, blob| {
            row.push_bind(package_id)
                .push_bind(&blob.checksum)
                .push_bind(&blob.media_type)
                .push_bind(&blob.data);
        });
        builder.push(" ON CONFLICT (package_id, checksum) DO UPDATE SET created_at = NOW() RETURNING (xmax = 0)");
        let inserted: Vec<bool> = builder.build_query_scalar::<bool>().fetch_all(&mut *conn).await?;
        written += inserted.into_iter().filter(|&new| new).count() as u64;
    }

    Ok(written)
}

pub async fn get_blob<'e, E>(executor: E, package_id: &str, checksum: &str) -> DbResult<Option<Blob>>
where
    E: Executor<'e, Database = Postgres>,
{
    let blob = sqlx::query_as::<_, Blob>(
        r#"
        SELECT package_id, checksum, media_type, data
        FROM published_data
        WHERE package_id = $1 AND checksum = $2
        "#,
    )
    .bind(package_id)
    .bind(checksum)
    .fetch_optional(executor)
    .await?;

    Ok(blob)
}

pub async fn put_source_archive<'e, E>(executor: E, checksum: &str, data: &[u8]) -> DbResult<PutOutcome>
where
    E: Executor<'e, Database = Postgres>,
{
    let inserted: bool = sqlx::query_scalar(
        r#"
        INSERT INTO published_sources_archives (checksum, data)
        VALUES ($1, $2)
        ON CONFLICT (checksum) DO UPDATE SET created_at = NOW()
        RETURNING (xmax = 0)
        "#,
    )
    .bind(checksum)
    .bind(data)
    .fetch_one(executor)
    .await?;

    Ok(PutOutcome::from_inserted(inserted))
}

/// Point a revision at an archive; replaces an earlier pointer
pub async fn link_version_sources<'e, E>(
    executor: E,
    package_id: &str,
    version: &str,
    revision: i32,
    checksum: &str,
) -> DbResult<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO published_sources (package_id, version, revision, archive_checksum)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (package_id, version, revision)
        DO UPDATE SET archive_checksum = EXCLUDED.archive_checksum
        "#,
    )
    .bind(package_id)
    .bind(version)
    .bind(revision)
    .bind(checksum)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn get_version_sources(
    pool: &PgPool,
    package_id: &str,
    version: &str,
    revision: i32,
) -> DbResult<Option<VersionSources>> {
    let sources = sqlx::query_as::<_, VersionSources>(
        r#"
        SELECT s.archive_checksum, a.data
        FROM published_sources s
        JOIN published_sources_archives a ON a.checksum = s.archive_checksum
        WHERE s.package_id = $1 AND s.version = $2 AND s.revision = $3
        "#,
    )
    .bind(package_id)
    .bind(version)
    .bind(revision)
    .fetch_optional(pool)
    .await?;

    Ok(sources)
}
