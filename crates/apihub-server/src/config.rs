//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Server Configuration Constants
// ============================================================================

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
/// Upper bound for request bodies; build results carry every document inline
pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/apihub";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;
/// 10 minutes
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

// ============================================================================
// Build Queue Constants
// ============================================================================

/// A running build whose `last_active` is older than this is re-leased.
pub const DEFAULT_BUILD_KEEPALIVE_SECS: u64 = 600;

/// Restarts allowed before a build is poisoned.
pub const DEFAULT_BUILD_RESTART_LIMIT: i32 = 2;

// ============================================================================
// Housekeeping Constants
// ============================================================================

pub const DEFAULT_HOUSEKEEPING_INTERVAL_SECS: u64 = 3600;
/// One week
pub const DEFAULT_BUILD_RETENTION_COMPLETE_HOURS: i64 = 168;
/// Two weeks
pub const DEFAULT_BUILD_RETENTION_ERROR_HOURS: i64 = 336;
pub const DEFAULT_DELETED_DRAFT_RETENTION_DAYS: i64 = 30;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub queue: QueueConfig,
    pub housekeeping: HousekeepingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// Lease and retry policy of the build queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub keepalive_secs: u64,
    pub restart_limit: i32,
}

impl QueueConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: DEFAULT_BUILD_KEEPALIVE_SECS,
            restart_limit: DEFAULT_BUILD_RESTART_LIMIT,
        }
    }
}

/// Scheduled cleanup; run on exactly one server process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub build_retention_complete_hours: i64,
    pub build_retention_error_hours: i64,
    pub deleted_draft_retention_days: i64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
            build_retention_complete_hours: DEFAULT_BUILD_RETENTION_COMPLETE_HOURS,
            build_retention_error_hours: DEFAULT_BUILD_RETENTION_ERROR_HOURS,
            deleted_draft_retention_days: DEFAULT_DELETED_DRAFT_RETENTION_DAYS,
        }
    }
}

/// Parse an environment variable, falling back to `default` when it is unset
/// or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    /// Read every setting from the process environment without validating
    pub fn from_env() -> Self {
        Config {
            server: ServerConfig {
                host: std::env::var("APIHUB_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: env_or("APIHUB_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "APIHUB_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
                max_body_bytes: env_or("APIHUB_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: env_or("CORS_ALLOW_CREDENTIALS", true),
            },
            queue: QueueConfig {
                keepalive_secs: env_or("BUILD_KEEPALIVE_SECS", DEFAULT_BUILD_KEEPALIVE_SECS),
                restart_limit: env_or("BUILD_RESTART_LIMIT", DEFAULT_BUILD_RESTART_LIMIT),
            },
            housekeeping: HousekeepingConfig {
                enabled: env_or("HOUSEKEEPING_ENABLED", false),
                interval_secs: env_or(
                    "HOUSEKEEPING_INTERVAL_SECS",
                    DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
                ),
                build_retention_complete_hours: env_or(
                    "BUILD_RETENTION_COMPLETE_HOURS",
                    DEFAULT_BUILD_RETENTION_COMPLETE_HOURS,
                ),
                build_retention_error_hours: env_or(
                    "BUILD_RETENTION_ERROR_HOURS",
                    DEFAULT_BUILD_RETENTION_ERROR_HOURS,
                ),
                deleted_draft_retention_days: env_or(
                    "DELETED_DRAFT_RETENTION_DAYS",
                    DEFAULT_DELETED_DRAFT_RETENTION_DAYS,
                ),
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.server.max_body_bytes == 0 {
            anyhow::bail!("APIHUB_MAX_BODY_BYTES must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.queue.keepalive_secs == 0 {
            anyhow::bail!("BUILD_KEEPALIVE_SECS must be greater than 0");
        }

        if self.queue.restart_limit < 0 {
            anyhow::bail!("BUILD_RESTART_LIMIT cannot be negative");
        }

        if self.housekeeping.enabled && self.housekeeping.interval_secs == 0 {
            anyhow::bail!("HOUSEKEEPING_INTERVAL_SECS must be greater than 0");
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: true,
            },
            queue: QueueConfig::default(),
            housekeeping: HousekeepingConfig::default(),
        }
    }
}
