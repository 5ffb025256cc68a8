//! Build queue payloads
//!
//! A build is submitted with a [`BuildConfig`] and an opaque source archive,
//! leased by a worker, and finished either by a status update to `error` or by
//! posting a [`BuildResult`](super::BuildResult).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::encoding::base64_bytes;
use super::package::validate_package_id;
use super::version::{VersionRef, VersionStatus};
use super::ApiType;
use crate::error::ApihubError;

/// Lifecycle status of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    None,
    Running,
    Complete,
    Error,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::None => "none",
            BuildStatus::Running => "running",
            BuildStatus::Complete => "complete",
            BuildStatus::Error => "error",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = ApihubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BuildStatus::None),
            "running" => Ok(BuildStatus::Running),
            "complete" => Ok(BuildStatus::Complete),
            "error" => Ok(BuildStatus::Error),
            other => Err(ApihubError::UnknownValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// What a build produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildType {
    Build,
    Changelog,
    DocumentGroup,
    ReducedSourceSpecifications,
    MergedSpecification,
    Export,
}

impl BuildType {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildType::Build => "build",
            BuildType::Changelog => "changelog",
            BuildType::DocumentGroup => "documentGroup",
            BuildType::ReducedSourceSpecifications => "reducedSourceSpecifications",
            BuildType::MergedSpecification => "mergedSpecification",
            BuildType::Export => "export",
        }
    }

    /// Builds of these types are keyed by an operation group
    pub fn is_group_scoped(self) -> bool {
        matches!(
            self,
            BuildType::DocumentGroup | BuildType::ReducedSourceSpecifications
        )
    }

    /// Only regular builds mint a revision; the rest derive artifacts from
    /// one that is already published
    pub fn publishes_revision(self) -> bool {
        matches!(self, BuildType::Build)
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build configuration stored next to the source archive.
///
/// Unknown keys are preserved in `extra` so that newer submitters can pass
/// parser options through an older server untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub build_type: BuildType,
    pub package_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version_package_id: Option<String>,
    #[serde(default)]
    pub status: VersionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Republish an existing revision with a newer parser and audit the diff
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub migration_build: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_type: Option<ApiType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BuildConfig {
    pub fn new(build_type: BuildType, package_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            build_type,
            package_id: package_id.into(),
            version: version.into(),
            previous_version: None,
            previous_version_package_id: None,
            status: VersionStatus::Draft,
            labels: Vec::new(),
            created_by: None,
            migration_build: false,
            api_type: None,
            group_name: None,
            format: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Check the fields every build type needs plus the discriminating
    /// fields of changelog and group builds. Returns the reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        validate_package_id(&self.package_id).map_err(|e| e.to_string())?;
        self.version
            .parse::<VersionRef>()
            .map_err(|e| e.to_string())?;

        if let Some(ref previous) = self.previous_version {
            previous.parse::<VersionRef>().map_err(|e| e.to_string())?;
        }
        if let Some(ref previous_package) = self.previous_version_package_id {
            validate_package_id(previous_package).map_err(|e| e.to_string())?;
        }

        match self.build_type {
            BuildType::Changelog if self.previous_version.is_none() => {
                Err("changelog builds require previousVersion".to_string())
            },
            t if t.is_group_scoped() && (self.group_name.is_none() || self.api_type.is_none()) => {
                Err(format!("{} builds require groupName and apiType", t))
            },
            _ => Ok(()),
        }
    }

    /// Package the previous version lives in; defaults to this package
    pub fn previous_package_id(&self) -> &str {
        self.previous_version_package_id
            .as_deref()
            .unwrap_or(&self.package_id)
    }
}

/// Body of `POST /builds`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBuildRequest {
    pub package_id: String,
    pub config: BuildConfig,
    #[serde(default, with = "base64_bytes")]
    pub source_archive: Vec<u8>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBuildResponse {
    pub build_id: String,
    /// `false` when an equivalent in-flight build was returned instead
    pub created: bool,
}

/// A build row as seen by API callers and workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildView {
    pub build_id: String,
    pub package_id: String,
    pub status: BuildStatus,
    pub priority: i32,
    pub restart_count: i32,
    pub builder_id: Option<String>,
    pub details: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Previous side of a comparison, resolved to a concrete revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousRevision {
    pub package_id: String,
    pub version: String,
    pub revision: i32,
}

/// Where the artifact of a build will land
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContext {
    pub package_id: String,
    pub version: String,
    /// `max + 1` at the time the source was fetched
    pub revision: i32,
    pub previous: Option<PreviousRevision>,
}

/// Response of `GET /builds/:id/source`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSourcePayload {
    pub build_id: String,
    pub config: BuildConfig,
    #[serde(with = "base64_bytes")]
    pub source: Vec<u8>,
    pub context: BuildContext,
}

/// Body of `PUT /builds/:id/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: BuildStatus,
    #[serde(default)]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_id: Option<String>,
}

impl StatusUpdate {
    pub fn heartbeat(builder_id: &str) -> Self {
        Self {
            status: BuildStatus::Running,
            details: String::new(),
            builder_id: Some(builder_id.to_string()),
        }
    }

    pub fn failed(builder_id: &str, details: impl Into<String>) -> Self {
        Self {
            status: BuildStatus::Error,
            details: details.into(),
            builder_id: Some(builder_id.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_wire_names_and_extra_keys() {
        let raw = json!({
            "buildType": "documentGroup",
            "packageId": "acme.svc",
            "version": "1.0@2",
            "apiType": "rest",
            "groupName": "billing",
            "format": "yaml",
            "parserFlags": {"strict": true}
        });
        let config: BuildConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.build_type, BuildType::DocumentGroup);
        assert_eq!(config.api_type, Some(ApiType::Rest));
        assert_eq!(config.extra["parserFlags"]["strict"], true);
        assert!(config.validate().is_ok());

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["parserFlags"]["strict"], true);
        assert!(back.get("migrationBuild").is_none());
    }

    #[test]
    fn test_only_regular_builds_publish_revisions() {
        assert!(BuildType::Build.publishes_revision());
        for derived in [
            BuildType::Changelog,
            BuildType::DocumentGroup,
            BuildType::ReducedSourceSpecifications,
            BuildType::MergedSpecification,
            BuildType::Export,
        ] {
            assert!(!derived.publishes_revision(), "{}", derived);
        }
    }

    #[test]
    fn test_changelog_requires_previous_version() {
        let mut config = BuildConfig::new(BuildType::Changelog, "acme.svc", "2.0");
        assert!(config.validate().unwrap_err().contains("previousVersion"));

        config.previous_version = Some("1.0".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.previous_package_id(), "acme.svc");
    }

    #[test]
    fn test_group_builds_require_group() {
        let config = BuildConfig::new(BuildType::ReducedSourceSpecifications, "acme.svc", "2.0");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_version_rejected() {
        let config = BuildConfig::new(BuildType::Build, "acme.svc", "2.0@zero");
        assert!(config.validate().unwrap_err().contains("revision"));
    }

    #[test]
    fn test_unknown_build_type_rejected() {
        let raw = json!({"buildType": "compile", "packageId": "a", "version": "1"});
        assert!(serde_json::from_value::<BuildConfig>(raw).is_err());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("running".parse::<BuildStatus>().unwrap(), BuildStatus::Running);
        assert!("done".parse::<BuildStatus>().is_err());
    }
}
