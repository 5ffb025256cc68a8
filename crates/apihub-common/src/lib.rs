//! APIHUB Common Library
//!
//! Shared types, error taxonomy and helpers for the APIHUB build & publish
//! pipeline. Both the server and the worker depend on this crate so that the
//! wire format of builds and build results is defined exactly once.
//!
//! # Overview
//!
//! - **Errors**: stable machine-readable error codes with `$param` message templates
//! - **Checksums**: content hashing for blobs and source archives
//! - **Ids**: deterministic comparison and operation-group identifiers
//! - **Types**: version addresses, package ids, build and build-result payloads
//! - **Logging**: tracing subscriber bootstrap shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use apihub_common::types::VersionRef;
//!
//! let pinned: VersionRef = "1.0@3".parse().unwrap();
//! assert_eq!(pinned.revision, Some(3));
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod ids;
pub mod logging;
pub mod types;

pub use error::{ApiError, ApihubError, ErrorCode, ErrorKind, Result};
