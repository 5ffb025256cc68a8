//! Version addresses and revision status

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ApihubError;

/// A user-visible version address.
///
/// `v` means "the latest undeleted revision of v"; `v@r` pins revision `r`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRef {
    pub version: String,
    pub revision: Option<i32>,
}

impl VersionRef {
    pub fn latest(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            revision: None,
        }
    }

    pub fn pinned(version: impl Into<String>, revision: i32) -> Self {
        Self {
            version: version.into(),
            revision: Some(revision),
        }
    }
}

impl FromStr for VersionRef {
    type Err = ApihubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ApihubError::InvalidRevisionFormat(s.to_string());

        let mut parts = s.split('@');
        let version = parts.next().unwrap_or_default();
        let revision = parts.next();
        if version.is_empty() || parts.next().is_some() {
            return Err(invalid());
        }

        let revision = match revision {
            None => None,
            Some(raw) => {
                let parsed: i32 = raw.parse().map_err(|_| invalid())?;
                if parsed < 1 {
                    return Err(invalid());
                }
                Some(parsed)
            },
        };

        Ok(Self {
            version: version.to_string(),
            revision,
        })
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.revision {
            Some(revision) => write!(f, "{}@{}", self.version, revision),
            None => f.write_str(&self.version),
        }
    }
}

/// Publication status of a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    #[default]
    Draft,
    Release,
    Archived,
}

impl VersionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Release => "release",
            VersionStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = ApihubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(VersionStatus::Draft),
            "release" => Ok(VersionStatus::Release),
            "archived" => Ok(VersionStatus::Archived),
            other => Err(ApihubError::UnknownValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}
