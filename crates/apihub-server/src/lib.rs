//! APIHUB Server Library
//!
//! Build & publish pipeline of the API catalog: a Postgres-backed build queue
//! that workers lease jobs from, and the publish transaction that commits a
//! worker's artifact as a new immutable revision.
//!
//! # Overview
//!
//! - **Content store** (`db::content`): document bytes and source archives keyed by checksum
//! - **Version store** (`db::versions`, `db::packages`): revisions, documents, references, operations
//! - **Build queue** (`queue`): priority, dependencies, leases via `last_active`
//! - **Publish** (`publish`): the all-or-nothing commit of a `BuildResult`
//! - **Changelog** (`changelog`): cached version comparisons and operation diffs
//! - **Operation groups** (`groups`): manual and pattern-generated groups
//! - **Housekeeping** (`housekeeping`): retention of builds, blobs and deleted drafts
//!
//! The HTTP surface lives in `features`, one vertical slice per area, mounted
//! under `/api/v1` by [`api::create_router`].
//!
//! # Example
//!
//! ```no_run
//! use apihub_server::{api, config::Config, db};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&(&config.database).into()).await?;
//!     db::run_migrations(&pool).await?;
//!     let app = api::create_router(api::AppState::new(pool, &config), &config);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod changelog;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod groups;
pub mod housekeeping;
pub mod middleware;
pub mod publish;
pub mod queue;

pub use error::AppError;
