//! Deterministic identifiers
//!
//! Comparisons and operation groups are addressed by an md5 hex digest of
//! their coordinates joined with `@`, so any process can derive the id of a
//! cached row without a lookup.

use crate::types::ApiType;

fn digest(parts: &[&str]) -> String {
    format!("{:x}", md5::compute(parts.join("@")))
}

/// One side of a comparison: `(package_id, version, revision)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionCoords<'a> {
    pub package_id: &'a str,
    pub version: &'a str,
    pub revision: i32,
}

impl<'a> RevisionCoords<'a> {
    pub fn new(package_id: &'a str, version: &'a str, revision: i32) -> Self {
        Self {
            package_id,
            version,
            revision,
        }
    }
}

/// Id of the comparison `current` vs `previous`
pub fn comparison_id(current: RevisionCoords<'_>, previous: RevisionCoords<'_>) -> String {
    let revision = current.revision.to_string();
    let previous_revision = previous.revision.to_string();
    digest(&[
        current.package_id,
        current.version,
        &revision,
        previous.package_id,
        previous.version,
        &previous_revision,
    ])
}

/// Id of an operation group within one revision and api type
pub fn operation_group_id(revision: RevisionCoords<'_>, api_type: ApiType, group_name: &str) -> String {
    let revision_no = revision.revision.to_string();
    digest(&[
        revision.package_id,
        revision.version,
        &revision_no,
        api_type.as_str(),
        group_name,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_id_is_md5_of_coordinates() {
        let id = comparison_id(
            RevisionCoords::new("acme.svc", "1.0", 3),
            RevisionCoords::new("acme.svc", "1.0", 2),
        );
        assert_eq!(id, format!("{:x}", md5::compute("acme.svc@1.0@3@acme.svc@1.0@2")));
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn test_comparison_id_is_directional() {
        let a = RevisionCoords::new("acme.svc", "1.0", 3);
        let b = RevisionCoords::new("acme.svc", "1.0", 2);
        assert_ne!(comparison_id(a, b), comparison_id(b, a));
    }

    #[test]
    fn test_group_id_depends_on_api_type() {
        let rev = RevisionCoords::new("acme.svc", "2.0", 1);
        let rest = operation_group_id(rev, ApiType::Rest, "billing");
        let graphql = operation_group_id(rev, ApiType::Graphql, "billing");
        assert_ne!(rest, graphql);
        assert_eq!(rest, operation_group_id(rev, ApiType::Rest, "billing"));
    }
}
