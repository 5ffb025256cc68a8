//! Filters of the changelog listing and their SQL rendering

use apihub_common::types::{ApiType, Severity};
use serde::Deserialize;
use sqlx::{Postgres, QueryBuilder};

use crate::db::versions::RevisionKey;

/// Criteria for listing operation changes; empty fields do not filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangesFilter {
    /// Case-insensitive substring of title or operation id
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub api_type: Option<ApiType>,
    #[serde(default)]
    pub api_audience: Option<String>,
    /// Any of these tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Manual or autogenerated group of the compared revision
    #[serde(default)]
    pub group: Option<String>,
    /// Any of these severities
    #[serde(default)]
    pub severities: Vec<Severity>,
    /// Operations listed by this document of their revision
    #[serde(default)]
    pub document_slug: Option<String>,
}

impl ChangesFilter {
    /// Bitmask of the requested severities; `None` when all pass
    pub fn severity_mask(&self) -> Option<i32> {
        let mask = self.severities.iter().fold(0, |mask, s| mask | s.bit());
        (mask != 0 && mask != Severity::all_mask()).then_some(mask)
    }
}

/// Escape `%`, `_` and `\` for a LIKE pattern
pub fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Append ` AND ...` conditions on `oc` (operation_comparison) for `filter`.
///
/// `group_owner` is the revision whose groups the `group` filter refers to.
pub fn push_conditions(
    builder: &mut QueryBuilder<'_, Postgres>,
    filter: &ChangesFilter,
    group_owner: &RevisionKey,
) {
    if let Some(text) = filter.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = like_pattern(text);
        builder.push(" AND (oc.title ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR oc.operation_id ILIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }

    if let Some(api_type) = filter.api_type {
        builder.push(" AND oc.api_type = ");
        builder.push_bind(api_type.as_str());
    }

    if let Some(audience) = filter.api_audience.as_deref().filter(|a| !a.is_empty() && *a != "all") {
        builder.push(" AND oc.api_audience = ");
        builder.push_bind(audience.to_string());
    }

    if !filter.tags.is_empty() {
        builder.push(" AND oc.tags && ");
        builder.push_bind(filter.tags.clone());
    }

    if let Some(mask) = filter.severity_mask() {
        builder.push(" AND (oc.severity_mask & ");
        builder.push_bind(mask);
        builder.push(") <> 0");
    }

    if let Some(group) = filter.group.as_deref().filter(|g| !g.is_empty()) {
        builder.push(
            " AND EXISTS (SELECT 1 FROM grouped_operation m \
             JOIN operation_group g ON g.group_id = m.group_id \
             WHERE g.package_id = ",
        );
        builder.push_bind(group_owner.package_id.clone());
        builder.push(" AND g.version = ");
        builder.push_bind(group_owner.version.clone());
        builder.push(" AND g.revision = ");
        builder.push_bind(group_owner.revision);
        builder.push(" AND g.group_name = ");
        builder.push_bind(group.to_string());
        if let Some(api_type) = filter.api_type {
            builder.push(" AND g.api_type = ");
            builder.push_bind(api_type.as_str());
        }
        builder.push(
            " AND m.package_id = oc.package_id AND m.version = oc.version \
             AND m.revision = oc.revision AND m.operation_id = oc.operation_id)",
        );
    }

    if let Some(slug) = filter.document_slug.as_deref().filter(|s| !s.is_empty()) {
        builder.push(
            " AND EXISTS (SELECT 1 FROM published_version_revision_content d \
             WHERE d.package_id = oc.package_id AND d.version = oc.version \
             AND d.revision = oc.revision AND oc.operation_id = ANY(d.operation_ids) AND d.slug = ",
        );
        builder.push_bind(slug.to_string());
        builder.push(")");
    }
}

/// Breaking first, then deprecations, then by coordinates
pub const ORDER_BY: &str = " ORDER BY (oc.breaking > 0) DESC, \
                            (oc.deprecated > 0 AND oc.breaking = 0) DESC, \
                            oc.package_id, oc.version, oc.revision, oc.operation_id, \
                            COALESCE(oc.data_hash, '')";
