//! Carry manual operation groups into a newly published revision.
//!
//! The source is `revision - 1` of the same version when it has manual
//! groups, otherwise the latest undeleted revision of the declared previous
//! version. Members are kept only where they still resolve in the new
//! revision: own operations that still exist, and operations of revisions in
//! its active reference closure.

use apihub_common::ids::{operation_group_id, RevisionCoords};
use apihub_common::types::{ApiType, PublishedVersionMeta, VersionRef};
use serde_json::json;
use sqlx::PgConnection;
use std::collections::{BTreeMap, BTreeSet};

use super::{GroupMember, OperationGroup, GROUP_COLUMNS};
use crate::db::versions::{self, RevisionKey};
use crate::db::DbResult;

async fn manual_groups(conn: &mut PgConnection, key: &RevisionKey) -> DbResult<Vec<OperationGroup>> {
    let query = format!(
        "SELECT {} FROM operation_group \
         WHERE package_id = $1 AND version = $2 AND revision = $3 AND NOT autogenerated \
         ORDER BY api_type, group_name",
        GROUP_COLUMNS
    );
    let groups = sqlx::query_as::<_, OperationGroup>(&query)
        .bind(&key.package_id)
        .bind(&key.version)
        .bind(key.revision)
        .fetch_all(&mut *conn)
        .await?;
    Ok(groups)
}

/// Revision whose manual groups should seed `key`, with those groups
async fn find_source(
    conn: &mut PgConnection,
    key: &RevisionKey,
    meta: &PublishedVersionMeta,
) -> DbResult<Option<(RevisionKey, Vec<OperationGroup>)>> {
    if key.revision > 1 {
        let previous = RevisionKey::new(&key.package_id, &key.version, key.revision - 1);
        let groups = manual_groups(conn, &previous).await?;
        if !groups.is_empty() {
            return Ok(Some((previous, groups)));
        }
    }

    let Some(ref previous_version) = meta.previous_version else {
        return Ok(None);
    };
    let previous_package = meta
        .previous_version_package_id
        .as_deref()
        .unwrap_or(&key.package_id);
    let Ok(version_ref) = previous_version.parse::<VersionRef>() else {
        return Ok(None);
    };
    let Some(revision) = versions::find_revision(&mut *conn, previous_package, &version_ref).await? else {
        return Ok(None);
    };

    let source = revision.key();
    if &source == key {
        return Ok(None);
    }
    let groups = manual_groups(conn, &source).await?;
    Ok((!groups.is_empty()).then_some((source, groups)))
}

/// Members of a source group that still resolve in `target`.
///
/// Own members are re-addressed to `target`; members from referenced
/// revisions keep their coordinates.
pub fn carry_over_members(
    source: &RevisionKey,
    target: &RevisionKey,
    members: &[GroupMember],
    target_operations: &BTreeSet<String>,
    target_refs: &BTreeSet<RevisionKey>,
) -> Vec<GroupMember> {
    let mut kept: Vec<GroupMember> = Vec::new();
    for member in members {
        let coords = member.key();
        if &coords == source {
            if target_operations.contains(&member.operation_id) {
                kept.push(GroupMember::new(target, &member.operation_id));
            }
        } else if target_refs.contains(&coords) {
            kept.push(member.clone());
        }
    }
    kept.sort();
    kept.dedup();
    kept
}

async fn operation_ids(
    conn: &mut PgConnection,
    key: &RevisionKey,
    api_type: ApiType,
) -> DbResult<BTreeSet<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT operation_id FROM operation \
         WHERE package_id = $1 AND version = $2 AND revision = $3 AND api_type = $4",
    )
    .bind(&key.package_id)
    .bind(&key.version)
    .bind(key.revision)
    .bind(api_type.as_str())
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids.into_iter().collect())
}

/// Copy the previous revision's manual groups into `key`. Returns the number
/// of groups created.
pub async fn propagate_previous_groups(
    conn: &mut PgConnection,
    key: &RevisionKey,
    meta: &PublishedVersionMeta,
    user: &str,
) -> DbResult<usize> {
    let Some((source, groups)) = find_source(conn, key, meta).await? else {
        return Ok(0);
    };

    let target_refs: BTreeSet<RevisionKey> =
        versions::transitive_refs(conn, key).await?.into_iter().collect();
    let mut operations_by_type: BTreeMap<ApiType, BTreeSet<String>> = BTreeMap::new();

    let mut created = 0;
    for group in &groups {
        let api_type = group.api_type()?;
        if !operations_by_type.contains_key(&api_type) {
            let ids = operation_ids(conn, key, api_type).await?;
            operations_by_type.insert(api_type, ids);
        }
        let target_operations = operations_by_type.get(&api_type).cloned().unwrap_or_default();

        let members = super::group_members(&mut *conn, &group.group_id).await?;
        let kept = carry_over_members(&source, key, &members, &target_operations, &target_refs);

        let group_id = operation_group_id(
            RevisionCoords::new(&key.package_id, &key.version, key.revision),
            api_type,
            &group.group_name,
        );
        let inserted = sqlx::query(
            r#"
            INSERT INTO operation_group
                (group_id, package_id, version, revision, api_type, group_name,
                 autogenerated, description, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&group_id)
        .bind(&key.package_id)
        .bind(&key.version)
        .bind(key.revision)
        .bind(api_type.as_str())
        .bind(&group.group_name)
        .bind(&group.description)
        .bind(&group.created_by)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if inserted == 0 {
            continue;
        }

        super::insert_members(&mut *conn, &group_id, &kept).await?;
        super::record_history(
            &mut *conn,
            &group_id,
            "propagate",
            json!({
                "from": group.group_id,
                "source": source.to_string(),
                "operations": kept.len(),
                "dropped": members.len().saturating_sub(kept.len()),
            }),
            true,
            user,
        )
        .await?;
        created += 1;
    }

    if created > 0 {
        tracing::info!(revision = %key, source = %source, groups = created, "Operation groups propagated");
    }
    Ok(created)
}
