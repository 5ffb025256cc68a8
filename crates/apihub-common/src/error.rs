//! Error types for APIHUB
//!
//! Two layers live here:
//!
//! - [`ApihubError`]: low-level failures raised by the helpers in this crate.
//! - [`ApiError`]: the caller-facing error. It carries an [`ErrorKind`]
//!   (which decides the HTTP status), a stable `code`, a message template with
//!   `$param` placeholders and an opaque `debug` string.
//!
//! Well-known codes are collected in [`codes`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result type alias for helpers in this crate
pub type Result<T> = std::result::Result<T, ApihubError>;

/// Low-level error type for APIHUB helpers
#[derive(Error, Debug)]
pub enum ApihubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid base64 payload: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid revision format: {0}")]
    InvalidRevisionFormat(String),

    #[error("Invalid package id: {0}")]
    InvalidPackageId(String),

    #[error("Unknown value '{value}' for {field}")]
    UnknownValue { field: &'static str, value: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error category; decides the HTTP status an error is reported with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    UpstreamTimeout,
    UpstreamAuth,
    RateLimited,
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Forbidden => 403,
            ErrorKind::Conflict => 409,
            ErrorKind::UpstreamTimeout | ErrorKind::UpstreamAuth => 424,
            ErrorKind::RateLimited => 429,
            ErrorKind::Internal => 500,
        }
    }
}

/// Static description of a well-known error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub template: &'static str,
}

/// Caller-facing error with a stable code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub code: String,
    pub message_template: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            kind: code.kind,
            code: code.code.to_string(),
            message_template: code.template.to_string(),
            params: BTreeMap::new(),
            debug: None,
        }
    }

    /// Attach a `$name` substitution value
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }

    /// Render the template with its parameters.
    ///
    /// Longer parameter names are substituted first so that `$id` never
    /// clobbers a `$idx` placeholder.
    pub fn message(&self) -> String {
        let mut names: Vec<&String> = self.params.keys().collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut message = self.message_template.clone();
        for name in names {
            if let Some(value) = self.params.get(name) {
                message = message.replace(&format!("${}", name), value);
            }
        }
        message
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.code
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message())
    }
}

impl std::error::Error for ApiError {}

impl From<ApihubError> for ApiError {
    fn from(err: ApihubError) -> Self {
        match err {
            ApihubError::InvalidRevisionFormat(version) => {
                ApiError::new(codes::INVALID_REVISION_FORMAT).param("version", version)
            },
            ApihubError::InvalidPackageId(id) => {
                ApiError::new(codes::INVALID_PACKAGE_ID).param("id", id)
            },
            ApihubError::UnknownValue { field, value } => ApiError::new(codes::INVALID_VALUE)
                .param("field", field)
                .param("value", value),
            ApihubError::Payload(e) => ApiError::new(codes::INVALID_PAYLOAD).debug(e.to_string()),
            ApihubError::Serialization(e) => {
                ApiError::new(codes::INVALID_PAYLOAD).debug(e.to_string())
            },
            other => ApiError::new(codes::INTERNAL_SERVER_ERROR).debug(other.to_string()),
        }
    }
}

/// Catalog of stable error codes
pub mod codes {
    use super::{ErrorCode, ErrorKind};

    pub const INVALID_REVISION_FORMAT: ErrorCode = ErrorCode {
        kind: ErrorKind::Validation,
        code: "InvalidRevisionFormat",
        template: "Version '$version' has invalid revision format, expected 'version' or 'version@revision'",
    };

    pub const INVALID_PACKAGE_ID: ErrorCode = ErrorCode {
        kind: ErrorKind::Validation,
        code: "InvalidPackageId",
        template: "Package id '$id' is not a valid dot-separated id",
    };

    pub const INVALID_VALUE: ErrorCode = ErrorCode {
        kind: ErrorKind::Validation,
        code: "InvalidValue",
        template: "Value '$value' is not allowed for $field",
    };

    pub const INVALID_PAYLOAD: ErrorCode = ErrorCode {
        kind: ErrorKind::Validation,
        code: "InvalidPayload",
        template: "Request payload could not be decoded",
    };

    pub const INVALID_BUILD_CONFIG: ErrorCode = ErrorCode {
        kind: ErrorKind::Validation,
        code: "InvalidBuildConfig",
        template: "Build config is invalid: $reason",
    };

    pub const PACKAGE_NOT_FOUND: ErrorCode = ErrorCode {
        kind: ErrorKind::NotFound,
        code: "PackageNotFound",
        template: "Package '$id' not found",
    };

    pub const PACKAGE_ALREADY_EXISTS: ErrorCode = ErrorCode {
        kind: ErrorKind::Conflict,
        code: "PackageAlreadyExists",
        template: "Package '$id' already exists",
    };

    pub const VERSION_NOT_FOUND: ErrorCode = ErrorCode {
        kind: ErrorKind::NotFound,
        code: "VersionNotFound",
        template: "Version '$version' not found in package '$id'",
    };

    pub const DOCUMENT_NOT_FOUND: ErrorCode = ErrorCode {
        kind: ErrorKind::NotFound,
        code: "DocumentNotFound",
        template: "Document '$slug' not found in version '$version' of package '$id'",
    };

    pub const BUILD_NOT_FOUND: ErrorCode = ErrorCode {
        kind: ErrorKind::NotFound,
        code: "BuildNotFound",
        template: "Build '$id' not found",
    };

    pub const BUILD_ALREADY_FINISHED: ErrorCode = ErrorCode {
        kind: ErrorKind::Conflict,
        code: "BuildAlreadyFinished",
        template: "Build '$id' is already finished with status '$status'",
    };

    pub const BUILD_RETRY_PENDING: ErrorCode = ErrorCode {
        kind: ErrorKind::Conflict,
        code: "BuildRetryPending",
        template: "Build '$id' failed and is waiting to be retried",
    };

    pub const INVALID_STATUS_TRANSITION: ErrorCode = ErrorCode {
        kind: ErrorKind::Conflict,
        code: "InvalidStatusTransition",
        template: "Build '$id' cannot move from '$from' to '$to'",
    };

    pub const BUILD_LEASE_LOST: ErrorCode = ErrorCode {
        kind: ErrorKind::Conflict,
        code: "BuildLeaseLost",
        template: "Build '$id' is now leased by '$owner', not '$builder'",
    };

    pub const BUILD_RESULT_MISMATCH: ErrorCode = ErrorCode {
        kind: ErrorKind::Validation,
        code: "BuildResultMismatch",
        template: "Result for build '$id' targets '$target' but the build is for '$expected'",
    };

    pub const BUILD_SOURCE_NOT_FOUND: ErrorCode = ErrorCode {
        kind: ErrorKind::NotFound,
        code: "BuildSourceNotFound",
        template: "Source of build '$id' not found; it may have been removed by retention",
    };

    pub const OPERATION_NOT_FOUND: ErrorCode = ErrorCode {
        kind: ErrorKind::NotFound,
        code: "OperationNotFound",
        template: "Operation '$operation' not found in '$id@$version'",
    };

    pub const REFERENCE_CYCLE: ErrorCode = ErrorCode {
        kind: ErrorKind::Validation,
        code: "ReferenceCycle",
        template: "References of '$id@$version' form a cycle through '$through'",
    };

    pub const REVISION_CONFLICT: ErrorCode = ErrorCode {
        kind: ErrorKind::Conflict,
        code: "RevisionConflict",
        template: "Revision $revision of version '$version' conflicts with expected revision $expected",
    };

    pub const COMPARISON_NOT_FOUND: ErrorCode = ErrorCode {
        kind: ErrorKind::NotFound,
        code: "ComparisonNotFound",
        template: "Comparison '$id' not found",
    };

    pub const COMPARISON_ID_MISMATCH: ErrorCode = ErrorCode {
        kind: ErrorKind::Validation,
        code: "ComparisonIdMismatch",
        template: "Comparison id '$given' does not match its coordinates (expected '$expected')",
    };

    pub const INVALID_GROUP_PATTERN: ErrorCode = ErrorCode {
        kind: ErrorKind::Validation,
        code: "InvalidGroupPattern",
        template: "Group pattern '$pattern' is invalid: $reason",
    };

    pub const GROUP_NOT_FOUND: ErrorCode = ErrorCode {
        kind: ErrorKind::NotFound,
        code: "GroupNotFound",
        template: "Operation group '$name' not found",
    };

    pub const GROUP_ALREADY_EXISTS: ErrorCode = ErrorCode {
        kind: ErrorKind::Conflict,
        code: "GroupAlreadyExists",
        template: "Operation group '$name' already exists",
    };

    pub const UPSTREAM_TIMEOUT: ErrorCode = ErrorCode {
        kind: ErrorKind::UpstreamTimeout,
        code: "UpstreamTimeout",
        template: "Upstream call to $target did not finish in time",
    };

    pub const INTERNAL_SERVER_ERROR: ErrorCode = ErrorCode {
        kind: ErrorKind::Internal,
        code: "InternalServerError",
        template: "Internal server error",
    };
}
