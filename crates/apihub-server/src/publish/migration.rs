//! Migration audit: what a republish with a newer parser changed.
//!
//! Before the rows of a migrated revision are replaced, its operations and
//! documents are snapshotted. After the new rows are written, both sides are
//! diffed and the result is stored in `migrated_version_changes` for review.

use apihub_common::types::BuildResult;
use serde::Serialize;
use sqlx::PgConnection;
use std::collections::{BTreeMap, BTreeSet};

use crate::db::versions::RevisionKey;
use crate::db::DbResult;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RevisionSnapshot {
    /// operation id -> (data hash, deprecated)
    pub operations: BTreeMap<String, (String, bool)>,
    /// file id -> (slug, checksum)
    pub documents: BTreeMap<String, (String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationChange {
    pub entity: &'static str,
    pub id: String,
    pub change: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl MigrationChange {
    fn kind(&self) -> String {
        format!("{}:{}", self.entity, self.change)
    }
}

pub async fn snapshot(conn: &mut PgConnection, key: &RevisionKey) -> DbResult<RevisionSnapshot> {
    let operations: Vec<(String, String, bool)> = sqlx::query_as(
        "SELECT operation_id, data_hash, deprecated FROM operation \
         WHERE package_id = $1 AND version = $2 AND revision = $3",
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .fetch_all(&mut *conn)
    .await?;

    let documents: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT file_id, slug, checksum FROM published_version_revision_content \
         WHERE package_id = $1 AND version = $2 AND revision = $3",
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .fetch_all(&mut *conn)
    .await?;

    Ok(RevisionSnapshot {
        operations: operations
            .into_iter()
            .map(|(id, hash, deprecated)| (id, (hash, deprecated)))
            .collect(),
        documents: documents
            .into_iter()
            .map(|(file_id, slug, checksum)| (file_id, (slug, checksum)))
            .collect(),
    })
}

/// Snapshot of what a result is about to write
pub fn snapshot_of_result(result: &BuildResult) -> RevisionSnapshot {
    RevisionSnapshot {
        operations: result
            .operations
            .iter()
            .map(|op| (op.operation_id.clone(), (op.data_hash.clone(), op.deprecated)))
            .collect(),
        documents: result
            .documents
            .iter()
            .map(|doc| (doc.file_id.clone(), (doc.slug.clone(), doc.checksum.clone())))
            .collect(),
    }
}

fn diff_maps<V: PartialEq>(
    entity: &'static str,
    before: &BTreeMap<String, V>,
    after: &BTreeMap<String, V>,
    describe: impl Fn(&V) -> String,
    changes: &mut Vec<MigrationChange>,
) {
    for (id, old) in before {
        match after.get(id) {
            None => changes.push(MigrationChange {
                entity,
                id: id.clone(),
                change: "removed",
                before: Some(describe(old)),
                after: None,
            }),
            Some(new) if new != old => changes.push(MigrationChange {
                entity,
                id: id.clone(),
                change: "changed",
                before: Some(describe(old)),
                after: Some(describe(new)),
            }),
            Some(_) => {},
        }
    }
    for (id, new) in after {
        if !before.contains_key(id) {
            changes.push(MigrationChange {
                entity,
                id: id.clone(),
                change: "added",
                before: None,
                after: Some(describe(new)),
            });
        }
    }
}

/// Changes between two snapshots plus the distinct change kinds
pub fn diff(before: &RevisionSnapshot, after: &RevisionSnapshot) -> (Vec<MigrationChange>, Vec<String>) {
    let mut changes = Vec::new();
    diff_maps(
        "operation",
        &before.operations,
        &after.operations,
        |(hash, deprecated)| {
            if *deprecated {
                format!("{} (deprecated)", hash)
            } else {
                hash.clone()
            }
        },
        &mut changes,
    );
    diff_maps(
        "document",
        &before.documents,
        &after.documents,
        |(slug, checksum)| format!("{} {}", slug, checksum),
        &mut changes,
    );

    let kinds: BTreeSet<String> = changes.iter().map(MigrationChange::kind).collect();
    (changes, kinds.into_iter().collect())
}

/// Store the audit record; nothing is written when the republish changed nothing
pub async fn record(
    conn: &mut PgConnection,
    key: &RevisionKey,
    build_id: &str,
    before: &RevisionSnapshot,
    after: &RevisionSnapshot,
) -> DbResult<usize> {
    let (changes, unique_changes) = diff(before, after);
    if changes.is_empty() {
        return Ok(0);
    }

    sqlx::query(
        r#"
        INSERT INTO migrated_version_changes
            (package_id, version, revision, build_id, changes, unique_changes)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .bind(build_id)
    .bind(serde_json::to_value(&changes).unwrap_or_default())
    .bind(&unique_changes)
    .execute(&mut *conn)
    .await?;

    tracing::info!(
        revision = %key,
        build_id,
        changes = changes.len(),
        kinds = ?unique_changes,
        "Migration changes recorded"
    );
    Ok(changes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(ops: &[(&str, &str)], docs: &[(&str, &str, &str)]) -> RevisionSnapshot {
        RevisionSnapshot {
            operations: ops
                .iter()
                .map(|(id, hash)| (id.to_string(), (hash.to_string(), false)))
                .collect(),
            documents: docs
                .iter()
                .map(|(file, slug, sum)| (file.to_string(), (slug.to_string(), sum.to_string())))
                .collect(),
        }
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let snap = snapshot_with(&[("get", "h1")], &[("f1", "api", "c1")]);
        let (changes, kinds) = diff(&snap, &snap.clone());
        assert!(changes.is_empty());
        assert!(kinds.is_empty());
    }

    #[test]
    fn test_diff_classifies_changes() {
        let before = snapshot_with(&[("get", "h1"), ("del", "h2")], &[("f1", "api", "c1")]);
        let after = snapshot_with(&[("get", "h9"), ("new", "h3")], &[("f1", "api", "c2")]);

        let (changes, kinds) = diff(&before, &after);
        let summary: Vec<(&str, &str, &str)> = changes
            .iter()
            .map(|c| (c.entity, c.id.as_str(), c.change))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("operation", "del", "removed"),
                ("operation", "get", "changed"),
                ("operation", "new", "added"),
                ("document", "f1", "changed"),
            ]
        );
        assert_eq!(
            kinds,
            vec!["document:changed", "operation:added", "operation:changed", "operation:removed"]
        );
    }
}
