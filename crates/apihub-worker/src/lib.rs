//! APIHUB build worker
//!
//! Leases builds from the APIHUB server, runs a specification parser over
//! their sources and posts the resulting artifact back for publishing.
//!
//! # Example
//!
//! ```no_run
//! use apihub_worker::{ProcessParser, Worker, WorkerApiClient, WorkerConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> apihub_worker::Result<()> {
//! let config = WorkerConfig::load()?;
//! let client = Arc::new(WorkerApiClient::from_config(&config)?);
//! let worker = Worker::new(client, ProcessParser::new(&config.parser_command), &config);
//! worker.run_once().await?;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod client;
pub mod config;
pub mod error;
pub mod parser;
pub mod runtime;

pub use client::{BuildBackend, PublishReceipt, WorkerApiClient};
pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use parser::{ProcessParser, SpecParser};
pub use runtime::{Outcome, Worker};
