//! HTTP surface of the pipeline, one vertical slice per area
//!
//! # Features
//!
//! - **builds**: submission, leasing, status updates and result upload
//! - **packages**: package namespace and id transitions
//! - **versions**: revision reads and maintenance
//! - **groups**: manual and autogenerated operation groups
//! - **changelog**: comparisons, operation changes and changelog requests
//!
//! Each slice has a `routes.rs` whose handlers delegate to the library
//! modules (`queue`, `publish`, `db`, `groups`, `changelog`).

pub mod builds;
pub mod changelog;
pub mod groups;
pub mod packages;
pub mod shared;
pub mod versions;

use axum::Router;
use sqlx::PgPool;

use crate::config::QueueConfig;

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    /// PostgreSQL connection pool for database operations
    pub db: PgPool,
    /// Lease and retry policy applied by queue handlers
    pub queue: QueueConfig,
}

/// Creates the `/api/v1` router with all feature routes mounted
///
/// - `/builds` - build queue and worker protocol
/// - `/packages` - packages, their versions and operation groups
/// - `/comparisons` - cached version comparisons
/// - `/changelog` - changelog requests
///
/// `max_body_bytes` bounds request bodies; build results carry every
/// document inline and are the largest payloads.
pub fn router(state: FeatureState, max_body_bytes: usize) -> Router<()> {
    let packages = packages::packages_routes()
        .merge(versions::versions_routes())
        .merge(groups::groups_routes());

    Router::new()
        .nest("/builds", builds::builds_routes(max_body_bytes))
        .nest("/packages", packages)
        .nest("/comparisons", changelog::comparisons_routes())
        .nest("/changelog", changelog::changelog_routes())
        .with_state(state)
}
