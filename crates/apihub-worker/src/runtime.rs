//! The worker loop
//!
//! Lease a build, fetch its source, run the parser and hand the artifact back.
//! While the parser runs, a side task refreshes the lease every heartbeat
//! interval. A build is never interrupted: shutdown is only observed between
//! builds, and a build whose worker dies is recovered by the server once the
//! keepalive lapses.

use apihub_common::types::{BuildView, StatusUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::client::{BuildBackend, PublishReceipt};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::parser::SpecParser;

/// What happened to one poll of the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was eligible
    Idle,
    Published(PublishReceipt),
    /// The build was reported as failed with these details
    Failed { build_id: String, details: String },
    /// Another worker owns the build now, or it finished without us
    LeaseLost { build_id: String },
}

/// Next idle delay: doubled, capped at `max`
pub fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

pub struct Worker<B, P> {
    backend: Arc<B>,
    parser: P,
    builder_id: String,
    poll_interval: Duration,
    max_backoff: Duration,
    heartbeat_interval: Duration,
}

impl<B, P> Worker<B, P>
where
    B: BuildBackend + 'static,
    P: SpecParser,
{
    pub fn new(backend: Arc<B>, parser: P, config: &WorkerConfig) -> Self {
        Self {
            backend,
            parser,
            builder_id: config.builder_id.clone(),
            poll_interval: config.poll_interval(),
            max_backoff: config.max_backoff(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    pub fn builder_id(&self) -> &str {
        &self.builder_id
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(builder_id = %self.builder_id, "Worker started");
        let mut delay = self.poll_interval;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(Outcome::Idle) => {},
                Ok(outcome) => {
                    tracing::debug!(?outcome, "Build handled");
                    delay = self.poll_interval;
                    continue;
                },
                Err(e) => {
                    tracing::error!(error = %e, "Worker iteration failed");
                },
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
            delay = next_delay(delay, self.max_backoff);
        }

        tracing::info!(builder_id = %self.builder_id, "Worker stopped");
    }

    /// Lease and process at most one build
    pub async fn run_once(&self) -> Result<Outcome> {
        match self.backend.next_build(&self.builder_id).await? {
            Some(build) => self.process_build(build).await,
            None => Ok(Outcome::Idle),
        }
    }

    #[tracing::instrument(
        skip(self, build),
        fields(build_id = %build.build_id, package_id = %build.package_id, restart_count = build.restart_count)
    )]
    async fn process_build(&self, build: BuildView) -> Result<Outcome> {
        let build_id = build.build_id;
        tracing::info!("Build leased");

        let source = match self.backend.build_source(&build_id).await {
            Ok(source) => source,
            Err(e) if e.is_lease_lost() => return Ok(Outcome::LeaseLost { build_id }),
            Err(e @ WorkerError::Api { .. }) => {
                return self.report_failure(build_id, e.to_string()).await;
            },
            Err(e) => return Err(e),
        };

        let stop = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(build_id.clone(), stop.clone());
        let parsed = self.parser.parse(&source).await;
        stop.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!(error = %e, "Heartbeat task ended abnormally");
        }

        let result = match parsed {
            Ok(result) => result,
            Err(e) => return self.report_failure(build_id, e.to_string()).await,
        };

        match self.backend.upload_result(&build_id, &result).await {
            Ok(receipt) => {
                tracing::info!(
                    version = %receipt.version,
                    revision = receipt.revision,
                    "Build published"
                );
                Ok(Outcome::Published(receipt))
            },
            Err(e) if e.is_lease_lost() => {
                tracing::warn!(error = %e, "Result rejected, lease lost");
                Ok(Outcome::LeaseLost { build_id })
            },
            Err(e @ WorkerError::Api { .. }) => self.report_failure(build_id, e.to_string()).await,
            Err(e) => Err(e),
        }
    }

    async fn report_failure(&self, build_id: String, details: String) -> Result<Outcome> {
        tracing::warn!(details = %details, "Build failed");
        let update = StatusUpdate::failed(&self.builder_id, details.clone());
        match self.backend.update_status(&build_id, &update).await {
            Ok(()) => Ok(Outcome::Failed { build_id, details }),
            Err(e) if e.is_lease_lost() => Ok(Outcome::LeaseLost { build_id }),
            Err(e) => Err(e),
        }
    }

    fn spawn_heartbeat(&self, build_id: String, stop: CancellationToken) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let update = StatusUpdate::heartbeat(&self.builder_id);
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match backend.update_status(&build_id, &update).await {
                            Ok(()) => tracing::trace!(build_id = %build_id, "Heartbeat sent"),
                            Err(e) if e.is_lease_lost() => {
                                tracing::warn!(build_id = %build_id, error = %e, "Lease lost, heartbeat stopped");
                                break;
                            },
                            Err(e) => tracing::warn!(build_id = %build_id, error = %e, "Heartbeat failed"),
                        }
                    },
                }
            }
        })
    }
}
