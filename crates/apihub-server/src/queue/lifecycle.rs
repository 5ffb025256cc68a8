//! Status rules of a build, independent of storage

use apihub_common::error::{codes, ApiError};
use apihub_common::types::BuildStatus;

/// Details are accumulated across attempts as `first:second:third`
pub fn append_details(previous: &str, new: &str) -> String {
    match (previous.is_empty(), new.is_empty()) {
        (true, _) => new.to_string(),
        (false, true) => previous.to_string(),
        (false, false) => format!("{}:{}", previous, new),
    }
}

/// A failed build is retried while it is below the restart limit
pub fn is_retriable(status: BuildStatus, restart_count: i32, restart_limit: i32) -> bool {
    status == BuildStatus::Error && restart_count < restart_limit
}

/// Whether a worker may move a build from `from` to `to`.
///
/// `complete` is final and only reachable through publish. `error` may only
/// be followed by another `error` report. Nothing moves back to `none`.
pub fn check_transition(build_id: &str, from: BuildStatus, to: BuildStatus) -> Result<(), ApiError> {
    let invalid = || {
        ApiError::new(codes::INVALID_STATUS_TRANSITION)
            .param("id", build_id)
            .param("from", from)
            .param("to", to)
    };

    match (from, to) {
        (BuildStatus::Complete, _) => Err(ApiError::new(codes::BUILD_ALREADY_FINISHED)
            .param("id", build_id)
            .param("status", from)),
        (_, BuildStatus::Complete) | (_, BuildStatus::None) => Err(invalid()),
        (BuildStatus::Error, BuildStatus::Running) => Err(invalid()),
        _ => Ok(()),
    }
}

/// Restart count after a lease: re-leasing an expired or failed build counts
/// as a restart, the first lease of a fresh build does not
pub fn restart_count_after_lease(status: BuildStatus, restart_count: i32) -> i32 {
    match status {
        BuildStatus::Running | BuildStatus::Error => restart_count + 1,
        _ => restart_count,
    }
}
