//! Individual writes of the publish transaction.
//!
//! Every function here runs on the connection of the open publish
//! transaction. Input rows are deduplicated by key before they are sent, so
//! that no multi-row upsert touches the same row twice.

use apihub_common::error::{codes, ApiError};
use apihub_common::types::{
    BuildResult, BuilderNotification, DocumentEntry, OperationComparisonEntry, OperationData,
    OperationEntry, ReferenceEntry, VersionComparisonEntry,
};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::collections::{BTreeMap, BTreeSet};

use super::PublishResult;
use crate::db::content::INSERT_CHUNK_SIZE;
use crate::db::versions::RevisionKey;

pub async fn upsert_revision(
    conn: &mut PgConnection,
    key: &RevisionKey,
    result: &BuildResult,
) -> PublishResult<()> {
    let meta = &result.version;
    sqlx::query(
        r#"
        INSERT INTO published_version
            (package_id, version, revision, status, labels,
             previous_version_package_id, previous_version, metadata, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (package_id, version, revision) DO UPDATE
        SET status = EXCLUDED.status,
            labels = EXCLUDED.labels,
            previous_version_package_id = EXCLUDED.previous_version_package_id,
            previous_version = EXCLUDED.previous_version,
            metadata = EXCLUDED.metadata
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .bind(meta.status.as_str())
    .bind(&meta.labels)
    .bind(&meta.previous_version_package_id)
    .bind(&meta.previous_version)
    .bind(&meta.metadata)
    .bind(&meta.created_by)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Reject documents sharing a file id or slug
pub fn validate_documents(documents: &[DocumentEntry]) -> Result<(), ApiError> {
    let mut file_ids = BTreeSet::new();
    let mut slugs = BTreeSet::new();
    for doc in documents {
        if !file_ids.insert(doc.file_id.as_str()) {
            return Err(duplicate("file_id", &doc.file_id));
        }
        if !slugs.insert(doc.slug.as_str()) {
            return Err(duplicate("slug", &doc.slug));
        }
    }
    Ok(())
}

fn duplicate(field: &str, value: &str) -> ApiError {
    ApiError::new(codes::INVALID_VALUE)
        .param("field", field)
        .param("value", value)
        .debug(format!("duplicate {} in build result", field))
}

/// Upsert document rows by file id, keeping the submitted `index`.
///
/// A migration republish also drops documents that are no longer produced.
pub async fn write_documents(
    conn: &mut PgConnection,
    key: &RevisionKey,
    documents: &[DocumentEntry],
    migration: bool,
) -> PublishResult<u64> {
    validate_documents(documents)?;

    if migration {
        let keep: Vec<&str> = documents.iter().map(|d| d.file_id.as_str()).collect();
        sqlx::query(
            "DELETE FROM published_version_revision_content \
             WHERE package_id = $1 AND version = $2 AND revision = $3 AND NOT (file_id = ANY($4))",
        )
        .bind(&key.package_id)
        .bind(&key.version)
        .bind(key.revision)
        .bind(&keep)
        .execute(&mut *conn)
        .await?;
    }

    let mut written = 0;
    for chunk in documents.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO published_version_revision_content \
             (package_id, version, revision, file_id, slug, checksum, media_type, title, \
              file_index, operation_ids, metadata) ",
        );
        builder.push_values(chunk, |mut row, doc| {
            row.push_bind(&key.package_id)
                .push_bind(&key.version)
                .push_bind(key.revision)
                .push_bind(&doc.file_id)
                .push_bind(&doc.slug)
                .push_bind(&doc.checksum)
                .push_bind(&doc.media_type)
                .push_bind(&doc.title)
                .push_bind(doc.index)
                .push_bind(&doc.operation_ids)
                .push_bind(&doc.metadata);
        });
        builder.push(
            " ON CONFLICT (package_id, version, revision, file_id) DO UPDATE \
             SET slug = EXCLUDED.slug, checksum = EXCLUDED.checksum, \
                 media_type = EXCLUDED.media_type, title = EXCLUDED.title, \
                 file_index = EXCLUDED.file_index, operation_ids = EXCLUDED.operation_ids, \
                 metadata = EXCLUDED.metadata",
        );
        written += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

/// Reference edge key with `''`/`0` standing in for "no parent"
type ReferenceKey = (String, String, i32, String, String, i32);

fn reference_key(entry: &ReferenceEntry) -> ReferenceKey {
    (
        entry.package_id.clone(),
        entry.version.clone(),
        entry.revision,
        entry.parent_package_id.clone().unwrap_or_default(),
        entry.parent_version.clone().unwrap_or_default(),
        entry.parent_revision.unwrap_or(0),
    )
}

/// Upsert references; an existing edge only has its `excluded` flag updated
pub async fn write_references(
    conn: &mut PgConnection,
    key: &RevisionKey,
    references: &[ReferenceEntry],
) -> PublishResult<u64> {
    let edges: BTreeMap<ReferenceKey, bool> = references
        .iter()
        .map(|entry| (reference_key(entry), entry.excluded))
        .collect();
    let rows: Vec<(ReferenceKey, bool)> = edges.into_iter().collect();

    let mut written = 0;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO published_version_reference \
             (package_id, version, revision, reference_id, reference_version, reference_revision, \
              parent_reference_id, parent_reference_version, parent_reference_revision, excluded) ",
        );
        builder.push_values(chunk, |mut row, (edge, excluded)| {
            row.push_bind(&key.package_id)
                .push_bind(&key.version)
                .push_bind(key.revision)
                .push_bind(&edge.0)
                .push_bind(&edge.1)
                .push_bind(edge.2)
                .push_bind(&edge.3)
                .push_bind(&edge.4)
                .push_bind(edge.5)
                .push_bind(*excluded);
        });
        builder.push(
            " ON CONFLICT (package_id, version, revision, reference_id, reference_version, \
             reference_revision, parent_reference_id, parent_reference_version, \
             parent_reference_revision) DO UPDATE SET excluded = EXCLUDED.excluded",
        );
        written += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

/// Upsert operation bodies. Rows whose `search_scope` is unchanged are left
/// alone; the hashes that were actually written are returned.
pub async fn write_operation_data(
    conn: &mut PgConnection,
    data: &[OperationData],
) -> PublishResult<BTreeSet<String>> {
    let distinct: BTreeMap<&str, &OperationData> =
        data.iter().map(|d| (d.data_hash.as_str(), d)).collect();
    let rows: Vec<&OperationData> = distinct.into_values().collect();

    let mut written = BTreeSet::new();
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO operation_data (data_hash, data, search_scope) ");
        builder.push_values(chunk, |mut row, item| {
            row.push_bind(&item.data_hash)
                .push_bind(&item.data)
                .push_bind(&item.search_scope);
        });
        builder.push(
            " ON CONFLICT (data_hash) DO UPDATE \
             SET data = EXCLUDED.data, search_scope = EXCLUDED.search_scope \
             WHERE operation_data.search_scope IS DISTINCT FROM EXCLUDED.search_scope \
             RETURNING data_hash",
        );
        let hashes: Vec<String> = builder
            .build_query_scalar::<String>()
            .fetch_all(&mut *conn)
            .await?;
        written.extend(hashes);
    }
    Ok(written)
}

/// Every operation must point at a body that is either in this result or
/// already stored
pub async fn check_operation_data_present(
    conn: &mut PgConnection,
    operations: &[OperationEntry],
    data: &[OperationData],
) -> PublishResult<()> {
    let provided: BTreeSet<&str> = data.iter().map(|d| d.data_hash.as_str()).collect();
    let missing: Vec<String> = operations
        .iter()
        .map(|op| op.data_hash.as_str())
        .filter(|hash| !provided.contains(hash))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let stored: Vec<String> =
        sqlx::query_scalar("SELECT data_hash FROM operation_data WHERE data_hash = ANY($1)")
            .bind(&missing)
            .fetch_all(&mut *conn)
            .await?;
    let stored: BTreeSet<String> = stored.into_iter().collect();

    match missing.into_iter().find(|hash| !stored.contains(hash)) {
        Some(hash) => Err(ApiError::new(codes::INVALID_VALUE)
            .param("field", "data_hash")
            .param("value", hash)
            .debug("operation refers to operation data that is neither provided nor stored")
            .into()),
        None => Ok(()),
    }
}

pub async fn write_operations(
    conn: &mut PgConnection,
    key: &RevisionKey,
    operations: &[OperationEntry],
    migration: bool,
) -> PublishResult<u64> {
    if migration {
        sqlx::query("DELETE FROM operation WHERE package_id = $1 AND version = $2 AND revision = $3")
            .bind(&key.package_id)
            .bind(&key.version)
            .bind(key.revision)
            .execute(&mut *conn)
            .await?;
    }

    let distinct: BTreeMap<&str, &OperationEntry> = operations
        .iter()
        .map(|op| (op.operation_id.as_str(), op))
        .collect();
    let rows: Vec<(&OperationEntry, serde_json::Value)> = distinct
        .into_values()
        .map(|op| Ok((op, serde_json::to_value(&op.models)?)))
        .collect::<Result<_, serde_json::Error>>()?;

    let mut written = 0;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO operation \
             (package_id, version, revision, operation_id, api_type, data_hash, deprecated, \
              kind, title, api_audience, metadata, models) ",
        );
        builder.push_values(chunk, |mut row, (op, models)| {
            row.push_bind(&key.package_id)
                .push_bind(&key.version)
                .push_bind(key.revision)
                .push_bind(&op.operation_id)
                .push_bind(op.api_type.as_str())
                .push_bind(&op.data_hash)
                .push_bind(op.deprecated)
                .push_bind(&op.kind)
                .push_bind(&op.title)
                .push_bind(&op.api_audience)
                .push_bind(&op.metadata)
                .push_bind(models);
        });
        written += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

fn comparison_not_found(id: &str) -> ApiError {
    ApiError::new(codes::COMPARISON_NOT_FOUND).param("id", id)
}

/// Check comparison ids against their coordinates and pick the entries to
/// write. Cached comparisons are reused, never rewritten.
pub fn plan_comparisons<'a>(
    entries: &'a [VersionComparisonEntry],
    cached: &BTreeSet<&str>,
) -> Result<BTreeMap<String, &'a VersionComparisonEntry>, ApiError> {
    let mut planned = BTreeMap::new();
    for entry in entries {
        let computed = entry.computed_id();
        if let Some(ref given) = entry.comparison_id {
            if given != &computed {
                return Err(ApiError::new(codes::COMPARISON_ID_MISMATCH)
                    .param("given", given)
                    .param("expected", &computed));
            }
        }
        if !cached.contains(computed.as_str()) {
            planned.insert(computed, entry);
        }
    }
    Ok(planned)
}

/// Upsert version comparisons, replace their operation comparisons and bump
/// the cached ones. Returns the ids that were written.
pub async fn write_comparisons(
    conn: &mut PgConnection,
    result: &BuildResult,
    builder_id: Option<&str>,
) -> PublishResult<Vec<String>> {
    let cached: BTreeSet<&str> = result.cached_comparison_ids.iter().map(String::as_str).collect();
    let planned = plan_comparisons(&result.version_comparisons, &cached)?;

    for (comparison_id, entry) in &planned {
        sqlx::query(
            r#"
            INSERT INTO version_comparison
                (comparison_id, package_id, version, revision,
                 previous_package_id, previous_version, previous_revision,
                 operation_types, refs, no_content, open_count, last_active, builder_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), $12)
            ON CONFLICT (comparison_id) DO UPDATE
            SET operation_types = EXCLUDED.operation_types,
                refs = EXCLUDED.refs,
                no_content = EXCLUDED.no_content,
                open_count = version_comparison.open_count + EXCLUDED.open_count,
                last_active = NOW(),
                builder_id = EXCLUDED.builder_id
            "#,
        )
        .bind(comparison_id)
        .bind(&entry.package_id)
        .bind(&entry.version)
        .bind(entry.revision)
        .bind(&entry.previous_package_id)
        .bind(&entry.previous_version)
        .bind(entry.previous_revision)
        .bind(serde_json::to_value(&entry.operation_types)?)
        .bind(&entry.refs)
        .bind(entry.no_content)
        .bind(entry.open_count)
        .bind(builder_id)
        .execute(&mut *conn)
        .await?;
    }

    if !cached.is_empty() {
        let ids: Vec<&str> = cached.iter().copied().collect();
        let touched: Vec<String> = sqlx::query_scalar(
            "UPDATE version_comparison SET last_active = NOW() \
             WHERE comparison_id = ANY($1) RETURNING comparison_id",
        )
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await?;
        if let Some(missing) = ids.iter().copied().find(|id| !touched.iter().any(|t| t.as_str() == *id)) {
            return Err(comparison_not_found(missing).into());
        }
    }

    let written: Vec<String> = planned.keys().cloned().collect();
    if written.is_empty() {
        return Ok(written);
    }

    sqlx::query("DELETE FROM operation_comparison WHERE comparison_id = ANY($1)")
        .bind(&written)
        .execute(&mut *conn)
        .await?;

    let mut rows: Vec<(&OperationComparisonEntry, &VersionComparisonEntry)> = Vec::new();
    for op in &result.operation_comparisons {
        match planned.get(&op.comparison_id) {
            Some(entry) => rows.push((op, *entry)),
            None if cached.contains(op.comparison_id.as_str()) => {},
            None => return Err(comparison_not_found(&op.comparison_id).into()),
        }
    }

    let rows: Vec<(&OperationComparisonEntry, &VersionComparisonEntry, serde_json::Value)> = rows
        .into_iter()
        .map(|(op, entry)| Ok((op, entry, serde_json::to_value(op.changes_summary)?)))
        .collect::<Result<_, serde_json::Error>>()?;

    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO operation_comparison \
             (comparison_id, package_id, version, revision, operation_id, previous_operation_id, \
              data_hash, previous_data_hash, api_type, api_audience, action, title, tags, \
              changes_summary, severity_mask, breaking, deprecated, changes, metadata) ",
        );
        builder.push_values(chunk, |mut row, (op, entry, summary)| {
            row.push_bind(&op.comparison_id)
                .push_bind(&entry.package_id)
                .push_bind(&entry.version)
                .push_bind(entry.revision)
                .push_bind(&op.operation_id)
                .push_bind(&op.previous_operation_id)
                .push_bind(&op.data_hash)
                .push_bind(&op.previous_data_hash)
                .push_bind(op.api_type.as_str())
                .push_bind(&op.api_audience)
                .push_bind(op.action.as_str())
                .push_bind(op.title().unwrap_or_default())
                .push_bind(op.tags())
                .push_bind(summary)
                .push_bind(op.changes_summary.severity_mask())
                .push_bind(op.changes_summary.breaking)
                .push_bind(op.changes_summary.deprecated)
                .push_bind(&op.changes)
                .push_bind(&op.metadata);
        });
        builder.build().execute(&mut *conn).await?;
    }

    Ok(written)
}

pub async fn write_notifications(
    conn: &mut PgConnection,
    build_id: &str,
    notifications: &[BuilderNotification],
) -> PublishResult<u64> {
    let mut written = 0;
    for chunk in notifications.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO builder_notifications (build_id, severity, message, file_id) ",
        );
        builder.push_values(chunk, |mut row, note| {
            row.push_bind(build_id)
                .push_bind(note.severity)
                .push_bind(&note.message)
                .push_bind(&note.file_id);
        });
        written += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

/// Keep the raw result and close the build
pub async fn complete_build(
    conn: &mut PgConnection,
    build_id: &str,
    result: &BuildResult,
) -> PublishResult<()> {
    sqlx::query(
        "INSERT INTO build_result (build_id, data) VALUES ($1, $2) \
         ON CONFLICT (build_id) DO UPDATE SET data = EXCLUDED.data, created_at = NOW()",
    )
    .bind(build_id)
    .bind(serde_json::to_value(result)?)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE build SET status = 'complete', details = '', last_active = NOW() WHERE build_id = $1",
    )
    .bind(build_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comparison(revision: i32, previous_revision: i32) -> VersionComparisonEntry {
        VersionComparisonEntry {
            comparison_id: None,
            package_id: "acme.svc".to_string(),
            version: "1.0".to_string(),
            revision,
            previous_package_id: "acme.svc".to_string(),
            previous_version: "1.0".to_string(),
            previous_revision,
            operation_types: vec![],
            refs: vec![],
            no_content: false,
            open_count: 1,
        }
    }

    #[test]
    fn test_plan_skips_cached_and_checks_ids() {
        let fresh = comparison(3, 2);
        let reused = comparison(2, 1);
        let reused_id = reused.computed_id();
        let cached: BTreeSet<&str> = [reused_id.as_str()].into_iter().collect();

        let entries = vec![fresh.clone(), reused];
        let planned = plan_comparisons(&entries, &cached).unwrap();
        assert_eq!(planned.keys().collect::<Vec<_>>(), vec![&fresh.computed_id()]);

        let mut wrong = comparison(3, 2);
        wrong.comparison_id = Some("deadbeef".to_string());
        let err = plan_comparisons(&[wrong], &BTreeSet::new()).unwrap_err();
        assert!(err.is(codes::COMPARISON_ID_MISMATCH));
        assert_eq!(err.params["given"], "deadbeef");
    }

    #[test]
    fn test_duplicate_documents_rejected() {
        let doc = |file_id: &str, slug: &str| DocumentEntry {
            file_id: file_id.to_string(),
            slug: slug.to_string(),
            checksum: "c".to_string(),
            media_type: "text/yaml".to_string(),
            title: String::new(),
            index: 0,
            operation_ids: vec![],
            metadata: serde_json::json!({}),
        };

        assert!(validate_documents(&[doc("f1", "a"), doc("f2", "b")]).is_ok());
        let err = validate_documents(&[doc("f1", "a"), doc("f2", "a")]).unwrap_err();
        assert_eq!(err.params["field"], "slug");
        let err = validate_documents(&[doc("f1", "a"), doc("f1", "b")]).unwrap_err();
        assert_eq!(err.params["field"], "file_id");
    }

    #[test]
    fn test_reference_key_defaults_parent() {
        let entry = ReferenceEntry {
            package_id: "acme.a".to_string(),
            version: "1".to_string(),
            revision: 2,
            parent_package_id: None,
            parent_version: None,
            parent_revision: None,
            excluded: false,
        };
        assert_eq!(
            reference_key(&entry),
            ("acme.a".to_string(), "1".to_string(), 2, String::new(), String::new(), 0)
        );
    }
}
