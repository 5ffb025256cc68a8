//! Package ids and kinds
//!
//! Package ids are dot-separated paths (`workspace.group.package`). The parent
//! of a package is always the prefix before the last dot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ApihubError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Workspace,
    Group,
    Package,
    Dashboard,
}

impl PackageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageKind::Workspace => "workspace",
            PackageKind::Group => "group",
            PackageKind::Package => "package",
            PackageKind::Dashboard => "dashboard",
        }
    }

    /// Only packages and dashboards hold publications
    pub fn is_publishable(self) -> bool {
        matches!(self, PackageKind::Package | PackageKind::Dashboard)
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageKind {
    type Err = ApihubError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "workspace" => Ok(PackageKind::Workspace),
            "group" => Ok(PackageKind::Group),
            "package" => Ok(PackageKind::Package),
            "dashboard" => Ok(PackageKind::Dashboard),
            other => Err(ApihubError::UnknownValue {
                field: "kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Check that `id` is a dot-separated list of non-empty `[A-Za-z0-9_-]` segments
pub fn validate_package_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(ApihubError::InvalidPackageId(id.to_string()))
    }
}

/// Prefix before the last dot; `None` for top-level ids
pub fn parent_package_id(id: &str) -> Option<&str> {
    id.rsplit_once('.').map(|(parent, _)| parent)
}

/// Workspace (first segment) of a package id
pub fn workspace_id(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_is_prefix_before_last_dot() {
        assert_eq!(parent_package_id("acme.svc.orders"), Some("acme.svc"));
        assert_eq!(parent_package_id("acme.svc"), Some("acme"));
        assert_eq!(parent_package_id("acme"), None);
        assert_eq!(workspace_id("acme.svc.orders"), "acme");
    }

    #[test]
    fn test_validate_package_id() {
        assert!(validate_package_id("acme.svc").is_ok());
        assert!(validate_package_id("QS.CP-1.my_api").is_ok());

        for bad in ["", "acme.", ".acme", "acme..svc", "acme svc", "acme/svc"] {
            assert!(validate_package_id(bad).is_err(), "{:?} should be invalid", bad);
        }
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("dashboard".parse::<PackageKind>().unwrap(), PackageKind::Dashboard);
        assert!(PackageKind::Package.is_publishable());
        assert!(!PackageKind::Group.is_publishable());
        assert!("folder".parse::<PackageKind>().is_err());
    }
}
