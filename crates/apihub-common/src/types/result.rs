//! The build result artifact committed by the publish transaction

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::encoding::base64_bytes;
use super::version::VersionStatus;
use super::ApiType;
use crate::ids::{comparison_id, RevisionCoords};

/// Everything a worker produced for one build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub version: PublishedVersionMeta,
    #[serde(default)]
    pub documents: Vec<DocumentEntry>,
    #[serde(default)]
    pub document_bytes: Vec<DocumentBytes>,
    #[serde(default)]
    pub references: Vec<ReferenceEntry>,
    #[serde(default)]
    pub source_archive: Option<SourceArchive>,
    #[serde(default)]
    pub operations: Vec<OperationEntry>,
    #[serde(default)]
    pub operation_data: Vec<OperationData>,
    #[serde(default)]
    pub operation_comparisons: Vec<OperationComparisonEntry>,
    #[serde(default)]
    pub version_comparisons: Vec<VersionComparisonEntry>,
    #[serde(default)]
    pub builder_notifications: Vec<BuilderNotification>,
    #[serde(default)]
    pub service_name: Option<String>,
    /// Comparisons that already exist and are reused as-is
    #[serde(default)]
    pub cached_comparison_ids: Vec<String>,
}

/// Revision row of the result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedVersionMeta {
    pub package_id: String,
    pub version: String,
    /// `None` lets the publish assign `max + 1`
    #[serde(default)]
    pub revision: Option<i32>,
    #[serde(default)]
    pub status: VersionStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub previous_version_package_id: Option<String>,
    #[serde(default)]
    pub previous_version: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    pub created_by: String,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    pub file_id: String,
    pub slug: String,
    pub checksum: String,
    pub media_type: String,
    #[serde(default)]
    pub title: String,
    /// Position the document is presented at
    pub index: i32,
    #[serde(default)]
    pub operation_ids: Vec<String>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

/// Raw document content, stored once per `(package_id, checksum)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentBytes {
    pub checksum: String,
    pub media_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Inclusion edge from the published revision to another revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub package_id: String,
    pub version: String,
    pub revision: i32,
    #[serde(default)]
    pub parent_package_id: Option<String>,
    #[serde(default)]
    pub parent_version: Option<String>,
    #[serde(default)]
    pub parent_revision: Option<i32>,
    #[serde(default)]
    pub excluded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceArchive {
    pub checksum: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEntry {
    pub operation_id: String,
    pub api_type: ApiType,
    pub data_hash: String,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_audience")]
    pub api_audience: String,
    /// Schemaless parser output; see the typed accessors
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    /// Model name to model hash
    #[serde(default)]
    pub models: BTreeMap<String, String>,
}

fn default_audience() -> String {
    "external".to_string()
}

impl OperationEntry {
    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// REST path, e.g. `/orders/{id}`
    pub fn path(&self) -> Option<&str> {
        self.metadata_str("path")
    }

    /// REST method, upper-cased by the parser
    pub fn method(&self) -> Option<&str> {
        self.metadata_str("method")
    }

    pub fn tags(&self) -> Vec<&str> {
        self.metadata
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| tags.iter().filter_map(|t| t.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn match_key(&self) -> String {
        operation_match_key(self.api_type, &self.operation_id, &self.kind, &self.metadata)
    }
}

/// Text that group patterns are matched against: `"<METHOD> <path>"` for
/// REST operations, `"<kind> <operation_id>"` otherwise
pub fn operation_match_key(
    api_type: ApiType,
    operation_id: &str,
    kind: &str,
    metadata: &serde_json::Value,
) -> String {
    let field = |key: &str| metadata.get(key).and_then(|v| v.as_str());
    match (api_type, field("method"), field("path")) {
        (ApiType::Rest, Some(method), Some(path)) => {
            format!("{} {}", method.to_ascii_uppercase(), path)
        },
        _ => format!("{} {}", kind, operation_id),
    }
}

/// Parsed operation body, stored once per `data_hash`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationData {
    pub data_hash: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Text per search scope, e.g. `{"request": "...", "response": "..."}`
    #[serde(default = "empty_object")]
    pub search_scope: serde_json::Value,
}

/// Severity classes of a change, with their filter bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Breaking,
    SemiBreaking,
    Deprecated,
    NonBreaking,
    Annotation,
    Unclassified,
}

impl Severity {
    pub const ALL: [Severity; 6] = [
        Severity::Breaking,
        Severity::SemiBreaking,
        Severity::Deprecated,
        Severity::NonBreaking,
        Severity::Annotation,
        Severity::Unclassified,
    ];

    pub fn bit(self) -> i32 {
        1 << (self as i32)
    }

    /// Mask with every severity set
    pub fn all_mask() -> i32 {
        Self::ALL.iter().fold(0, |mask, s| mask | s.bit())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Breaking => "breaking",
            Severity::SemiBreaking => "semi-breaking",
            Severity::Deprecated => "deprecated",
            Severity::NonBreaking => "non-breaking",
            Severity::Annotation => "annotation",
            Severity::Unclassified => "unclassified",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = crate::error::ApihubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|severity| severity.as_str() == s)
            .ok_or_else(|| crate::error::ApihubError::UnknownValue {
                field: "severity",
                value: s.to_string(),
            })
    }
}

/// Counts of changes per severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChangeSummary {
    #[serde(default)]
    pub breaking: i32,
    #[serde(default)]
    pub semi_breaking: i32,
    #[serde(default)]
    pub deprecated: i32,
    #[serde(default)]
    pub non_breaking: i32,
    #[serde(default)]
    pub annotation: i32,
    #[serde(default)]
    pub unclassified: i32,
}

impl ChangeSummary {
    pub fn count(&self, severity: Severity) -> i32 {
        match severity {
            Severity::Breaking => self.breaking,
            Severity::SemiBreaking => self.semi_breaking,
            Severity::Deprecated => self.deprecated,
            Severity::NonBreaking => self.non_breaking,
            Severity::Annotation => self.annotation,
            Severity::Unclassified => self.unclassified,
        }
    }

    /// Bitmask of the severities with a non-zero count
    pub fn severity_mask(&self) -> i32 {
        Severity::ALL
            .iter()
            .filter(|s| self.count(**s) > 0)
            .fold(0, |mask, s| mask | s.bit())
    }

    pub fn add(&mut self, other: &ChangeSummary) {
        self.breaking += other.breaking;
        self.semi_breaking += other.semi_breaking;
        self.deprecated += other.deprecated;
        self.non_breaking += other.non_breaking;
        self.annotation += other.annotation;
        self.unclassified += other.unclassified;
    }

    pub fn is_empty(&self) -> bool {
        self.severity_mask() == 0
    }
}

/// Changes of one api type inside a version comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationTypeChanges {
    pub api_type: ApiType,
    #[serde(default)]
    pub changes_summary: ChangeSummary,
    #[serde(default)]
    pub number_of_impacted_operations: ChangeSummary,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionComparisonEntry {
    /// Optional on the wire; always checked against the coordinates
    #[serde(default)]
    pub comparison_id: Option<String>,
    pub package_id: String,
    pub version: String,
    pub revision: i32,
    pub previous_package_id: String,
    pub previous_version: String,
    pub previous_revision: i32,
    #[serde(default)]
    pub operation_types: Vec<OperationTypeChanges>,
    /// Child comparison ids, one per referenced package pair
    #[serde(default)]
    pub refs: Vec<String>,
    #[serde(default)]
    pub no_content: bool,
    #[serde(default = "default_open_count")]
    pub open_count: i64,
}

fn default_open_count() -> i64 {
    1
}

impl VersionComparisonEntry {
    pub fn computed_id(&self) -> String {
        comparison_id(
            RevisionCoords::new(&self.package_id, &self.version, self.revision),
            RevisionCoords::new(
                &self.previous_package_id,
                &self.previous_version,
                self.previous_revision,
            ),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Remove,
    Change,
    Rename,
}

impl ChangeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeAction::Add => "add",
            ChangeAction::Remove => "remove",
            ChangeAction::Change => "change",
            ChangeAction::Rename => "rename",
        }
    }
}

/// Diff of a single operation, linked to its comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationComparisonEntry {
    pub comparison_id: String,
    pub operation_id: String,
    #[serde(default)]
    pub previous_operation_id: Option<String>,
    #[serde(default)]
    pub data_hash: Option<String>,
    #[serde(default)]
    pub previous_data_hash: Option<String>,
    pub api_type: ApiType,
    #[serde(default = "default_audience")]
    pub api_audience: String,
    pub action: ChangeAction,
    #[serde(default)]
    pub changes_summary: ChangeSummary,
    #[serde(default)]
    pub changes: serde_json::Value,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

impl OperationComparisonEntry {
    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").and_then(|v| v.as_str())
    }

    pub fn tags(&self) -> Vec<String> {
        self.metadata
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Warning produced by the parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderNotification {
    pub severity: i32,
    pub message: String,
    #[serde(default)]
    pub file_id: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_result_deserializes() {
        let raw = json!({
            "version": {"package_id": "acme.svc", "version": "1.0", "created_by": "ci"}
        });
        let result: BuildResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.version.revision, None);
        assert_eq!(result.version.status, VersionStatus::Draft);
        assert!(result.version.metadata.as_object().unwrap().is_empty());
        assert!(result.documents.is_empty());
        assert!(result.source_archive.is_none());
    }

    #[test]
    fn test_operation_accessors() {
        let op = OperationEntry {
            operation_id: "get-orders".to_string(),
            api_type: ApiType::Rest,
            data_hash: "h1".to_string(),
            deprecated: false,
            kind: "bwc".to_string(),
            title: "List orders".to_string(),
            api_audience: "external".to_string(),
            metadata: json!({"path": "/orders", "method": "get", "tags": ["orders", 7]}),
            models: BTreeMap::new(),
        };
        assert_eq!(op.path(), Some("/orders"));
        assert_eq!(op.tags(), vec!["orders"]);
        assert_eq!(op.match_key(), "GET /orders");
    }

    #[test]
    fn test_severity_mask() {
        let summary = ChangeSummary {
            breaking: 2,
            annotation: 1,
            ..ChangeSummary::default()
        };
        assert_eq!(
            summary.severity_mask(),
            Severity::Breaking.bit() | Severity::Annotation.bit()
        );
        assert_eq!(Severity::all_mask(), 0b11_1111);
        assert!(ChangeSummary::default().is_empty());

        let json = serde_json::to_value(summary).unwrap();
        assert_eq!(json["semi-breaking"], 0);
    }

    #[test]
    fn test_comparison_entry_id() {
        let entry = VersionComparisonEntry {
            comparison_id: None,
            package_id: "acme.svc".to_string(),
            version: "1.0".to_string(),
            revision: 3,
            previous_package_id: "acme.svc".to_string(),
            previous_version: "1.0".to_string(),
            previous_revision: 2,
            operation_types: vec![],
            refs: vec![],
            no_content: false,
            open_count: 1,
        };
        assert_eq!(
            entry.computed_id(),
            format!("{:x}", md5::compute("acme.svc@1.0@3@acme.svc@1.0@2"))
        );
    }
}
