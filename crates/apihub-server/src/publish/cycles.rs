//! Reference cycle detection.
//!
//! A publish is refused when its declared references, or the stored
//! references of anything it points at, lead back to the revision being
//! published.

use apihub_common::types::ReferenceEntry;
use sqlx::PgConnection;
use std::collections::{BTreeMap, BTreeSet};

use crate::db::versions::{self, RevisionKey};
use crate::db::DbResult;

fn target(entry: &ReferenceEntry) -> RevisionKey {
    RevisionKey::new(&entry.package_id, &entry.version, entry.revision)
}

fn parent(root: &RevisionKey, entry: &ReferenceEntry) -> RevisionKey {
    match (&entry.parent_package_id, &entry.parent_version, entry.parent_revision) {
        (Some(package_id), Some(version), Some(revision)) => {
            RevisionKey::new(package_id, version, revision)
        },
        _ => root.clone(),
    }
}

/// First revision found on a cycle formed by the declared edges alone.
///
/// Edges run from each entry's parent (the root when no parent is given) to
/// the referenced revision.
pub fn find_declared_cycle(root: &RevisionKey, references: &[ReferenceEntry]) -> Option<RevisionKey> {
    let mut edges: BTreeMap<RevisionKey, BTreeSet<RevisionKey>> = BTreeMap::new();
    for entry in references {
        let to = target(entry);
        if &to == root {
            return Some(to);
        }
        edges.entry(parent(root, entry)).or_default().insert(to);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: BTreeMap<RevisionKey, Mark> = BTreeMap::new();
    let nodes: Vec<RevisionKey> = edges.keys().cloned().collect();

    for start in nodes {
        if marks.contains_key(&start) {
            continue;
        }
        // Iterative DFS; each frame holds a node and its remaining successors
        let mut stack: Vec<(RevisionKey, Vec<RevisionKey>)> = Vec::new();
        let successors = edges.get(&start).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        marks.insert(start.clone(), Mark::InProgress);
        stack.push((start, successors));

        while let Some((node, remaining)) = stack.last_mut() {
            match remaining.pop() {
                Some(next) => match marks.get(&next) {
                    Some(Mark::InProgress) => return Some(next),
                    Some(Mark::Done) => {},
                    None => {
                        let successors = edges
                            .get(&next)
                            .map(|s| s.iter().cloned().collect())
                            .unwrap_or_default();
                        marks.insert(next.clone(), Mark::InProgress);
                        stack.push((next, successors));
                    },
                },
                None => {
                    marks.insert(node.clone(), Mark::Done);
                    stack.pop();
                },
            }
        }
    }

    None
}

/// Referenced revision whose stored closure already contains `root`
pub async fn find_stored_cycle(
    conn: &mut PgConnection,
    root: &RevisionKey,
    references: &[ReferenceEntry],
) -> DbResult<Option<RevisionKey>> {
    let targets: BTreeSet<RevisionKey> = references
        .iter()
        .filter(|entry| !entry.excluded)
        .map(target)
        .collect();

    for reference in targets {
        let closure = versions::transitive_refs(conn, &reference).await?;
        if closure.contains(root) {
            return Ok(Some(reference));
        }
    }
    Ok(None)
}
