//! Worker configuration
//!
//! Everything is read from the environment; command-line flags in the binary
//! override individual fields afterwards.

use crate::error::{Result, WorkerError};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Worker Configuration Constants
// ============================================================================

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Idle poll interval; doubled after every empty poll up to the max backoff
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Must stay well below the server's `BUILD_KEEPALIVE_SECS`
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

pub const DEFAULT_PARSER_COMMAND: &str = "apihub-parser";

/// Build results can carry large documents inline
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub server_url: String,
    pub builder_id: String,
    pub poll_interval_ms: u64,
    pub max_backoff_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub parser_command: String,
    pub api_timeout_secs: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// `<hostname>-<uuid>`, unique per process
pub fn default_builder_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

impl WorkerConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    pub fn from_env() -> Self {
        Self {
            server_url: std::env::var("APIHUB_SERVER_URL")
                .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
            builder_id: std::env::var("APIHUB_BUILDER_ID")
                .ok()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(default_builder_id),
            poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
            max_backoff_ms: env_or("WORKER_MAX_BACKOFF_MS", DEFAULT_MAX_BACKOFF_MS),
            heartbeat_interval_secs: env_or(
                "WORKER_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            ),
            parser_command: std::env::var("WORKER_PARSER_COMMAND")
                .unwrap_or_else(|_| DEFAULT_PARSER_COMMAND.to_string()),
            api_timeout_secs: env_or("APIHUB_API_TIMEOUT_SECS", DEFAULT_API_TIMEOUT_SECS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(WorkerError::config(format!(
                "APIHUB_SERVER_URL must be an http(s) URL, got '{}'",
                self.server_url
            )));
        }
        if self.builder_id.trim().is_empty() {
            return Err(WorkerError::config("APIHUB_BUILDER_ID cannot be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(WorkerError::config("WORKER_POLL_INTERVAL_MS must be greater than 0"));
        }
        if self.max_backoff_ms < self.poll_interval_ms {
            return Err(WorkerError::config(format!(
                "WORKER_MAX_BACKOFF_MS ({}) cannot be lower than WORKER_POLL_INTERVAL_MS ({})",
                self.max_backoff_ms, self.poll_interval_ms
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(WorkerError::config(
                "WORKER_HEARTBEAT_INTERVAL_SECS must be greater than 0",
            ));
        }
        if self.parser_command.trim().is_empty() {
            return Err(WorkerError::config("WORKER_PARSER_COMMAND cannot be empty"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            builder_id: default_builder_id(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            parser_command: DEFAULT_PARSER_COMMAND.to_string(),
            api_timeout_secs: DEFAULT_API_TIMEOUT_SECS,
        }
    }
}
