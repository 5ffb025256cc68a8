//! Types shared by the APIHUB server and worker
//!
//! Everything that crosses the wire between the two lives here: the build
//! queue payloads, the build result artifact and the small value types they
//! are made of.

pub mod build;
pub mod encoding;
pub mod package;
pub mod result;
pub mod version;

pub use build::{
    BuildConfig, BuildContext, BuildSourcePayload, BuildStatus, BuildType, BuildView,
    PreviousRevision, StatusUpdate, SubmitBuildRequest, SubmitBuildResponse,
};
pub use package::{parent_package_id, validate_package_id, PackageKind};
pub use result::{
    BuildResult, BuilderNotification, ChangeAction, ChangeSummary, DocumentBytes, DocumentEntry,
    operation_match_key, OperationComparisonEntry, OperationData, OperationEntry, OperationTypeChanges,
    PublishedVersionMeta, ReferenceEntry, Severity, SourceArchive, VersionComparisonEntry,
};
pub use version::{VersionRef, VersionStatus};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ApihubError;

/// Kind of API an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Rest,
    Graphql,
}

impl ApiType {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiType::Rest => "rest",
            ApiType::Graphql => "graphql",
        }
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiType {
    type Err = ApihubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rest" => Ok(ApiType::Rest),
            "graphql" => Ok(ApiType::Graphql),
            other => Err(ApihubError::UnknownValue {
                field: "api_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Pagination parameters for list queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: i64 = 500;

    /// Build from optional query parameters, clamping the limit to `1..=MAX_LIMIT`
    pub fn from_query(limit: Option<i64>, offset: Option<i64>) -> Self {
        let defaults = Self::default();
        Self {
            limit: limit.unwrap_or(defaults.limit).clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}
