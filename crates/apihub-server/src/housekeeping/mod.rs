//! Periodic cleanup of rows nothing needs any more.
//!
//! One pass removes, in order:
//! - sources and raw results of finished builds past their retention window
//! - tombstoned draft revisions past their retention window (cascades to
//!   documents, operations, references and groups)
//! - operation bodies no operation points at (cascades to search vectors)
//! - blobs and source archives no revision points at
//!
//! Unreferenced blobs and archives get a grace period. A publish that
//! deduplicates against a row refreshes it under a row lock, so a concurrent
//! reap waits and then sees the row as fresh.

use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{HousekeepingConfig, QueueConfig};
use crate::db::DbResult;

/// Unreferenced content younger than this is kept
pub const CONTENT_GRACE_HOURS: i32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HousekeepingReport {
    pub build_sources: u64,
    pub build_results: u64,
    pub deleted_drafts: u64,
    pub operation_data: u64,
    pub blobs: u64,
    pub source_archives: u64,
}

impl HousekeepingReport {
    pub fn total(&self) -> u64 {
        self.build_sources
            + self.build_results
            + self.deleted_drafts
            + self.operation_data
            + self.blobs
            + self.source_archives
    }
}

const EXPIRED_BUILDS: &str = r#"
    SELECT b.build_id FROM build b
    WHERE (b.status = 'complete' AND b.last_active < NOW() - make_interval(hours => $1::INTEGER))
       OR (b.status = 'error' AND b.restart_count >= $3
           AND b.last_active < NOW() - make_interval(hours => $2::INTEGER))
"#;

async fn prune_build_artifacts(
    pool: &PgPool,
    config: &HousekeepingConfig,
    queue: &QueueConfig,
) -> DbResult<(u64, u64)> {
    let mut removed = [0u64; 2];
    for (slot, table) in ["build_src", "build_result"].iter().enumerate() {
        let query = format!("DELETE FROM {} WHERE build_id IN ({})", table, EXPIRED_BUILDS);
        removed[slot] = sqlx::query(&query)
            .bind(config.build_retention_complete_hours)
            .bind(config.build_retention_error_hours)
            .bind(queue.restart_limit)
            .execute(pool)
            .await?
            .rows_affected();
    }
    Ok((removed[0], removed[1]))
}

async fn prune_deleted_drafts(pool: &PgPool, retention_days: i64) -> DbResult<u64> {
    let removed = sqlx::query(
        "DELETE FROM published_version \
         WHERE status = 'draft' AND deleted_at IS NOT NULL \
           AND deleted_at < NOW() - make_interval(days => $1::INTEGER)",
    )
    .bind(retention_days)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(removed)
}

async fn reap_operation_data(pool: &PgPool) -> DbResult<u64> {
    let removed = sqlx::query(
        "DELETE FROM operation_data d \
         WHERE NOT EXISTS (SELECT 1 FROM operation o WHERE o.data_hash = d.data_hash)",
    )
    .execute(pool)
    .await?
    .rows_affected();
    Ok(removed)
}

async fn reap_content(pool: &PgPool) -> DbResult<(u64, u64)> {
    let blobs = sqlx::query(
        "DELETE FROM published_data p \
         WHERE p.created_at < NOW() - make_interval(hours => $1) \
           AND NOT EXISTS (SELECT 1 FROM published_version_revision_content c \
                           WHERE c.package_id = p.package_id AND c.checksum = p.checksum)",
    )
    .bind(CONTENT_GRACE_HOURS)
    .execute(pool)
    .await?
    .rows_affected();

    let archives = sqlx::query(
        "DELETE FROM published_sources_archives a \
         WHERE a.created_at < NOW() - make_interval(hours => $1) \
           AND NOT EXISTS (SELECT 1 FROM published_sources s WHERE s.archive_checksum = a.checksum)",
    )
    .bind(CONTENT_GRACE_HOURS)
    .execute(pool)
    .await?
    .rows_affected();

    Ok((blobs, archives))
}

/// Run every cleanup step once
#[tracing::instrument(skip_all)]
pub async fn run_once(
    pool: &PgPool,
    config: &HousekeepingConfig,
    queue: &QueueConfig,
) -> DbResult<HousekeepingReport> {
    let (build_sources, build_results) = prune_build_artifacts(pool, config, queue).await?;
    let deleted_drafts = prune_deleted_drafts(pool, config.deleted_draft_retention_days).await?;
    let operation_data = reap_operation_data(pool).await?;
    let (blobs, source_archives) = reap_content(pool).await?;

    let report = HousekeepingReport {
        build_sources,
        build_results,
        deleted_drafts,
        operation_data,
        blobs,
        source_archives,
    };
    tracing::info!(
        build_sources,
        build_results,
        deleted_drafts,
        operation_data,
        blobs,
        source_archives,
        "Housekeeping pass finished"
    );
    Ok(report)
}

/// Run [`run_once`] every `interval_secs` until `shutdown` is cancelled
pub fn spawn(
    pool: PgPool,
    config: HousekeepingConfig,
    queue: QueueConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(config.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = period.as_secs(), "Housekeeping task started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = run_once(&pool, &config, &queue).await {
                        tracing::error!(error = %e, "Housekeeping pass failed");
                    }
                }
            }
        }
        tracing::info!("Housekeeping task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::content;

    async fn insert_build(pool: &PgPool, id: &str, status: &str, restart_count: i32, age_hours: i32) {
        sqlx::query(
            "INSERT INTO build (build_id, package_id, version, status, restart_count, last_active) \
             VALUES ($1, 'acme.svc', '1.0', $2, $3, NOW() - make_interval(hours => $4))",
        )
        .bind(id)
        .bind(status)
        .bind(restart_count)
        .bind(age_hours)
        .execute(pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO build_src (build_id, config) VALUES ($1, '{}')")
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO build_result (build_id, data) VALUES ($1, '{}')")
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn remaining_sources(pool: &PgPool) -> Vec<String> {
        sqlx::query_scalar("SELECT build_id FROM build_src ORDER BY build_id")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_build_retention_per_status(pool: PgPool) {
        insert_build(&pool, "complete-old", "complete", 0, 200).await;
        insert_build(&pool, "complete-new", "complete", 0, 10).await;
        insert_build(&pool, "error-terminal-old", "error", 2, 400).await;
        insert_build(&pool, "error-terminal-mid", "error", 2, 200).await;
        insert_build(&pool, "error-retriable-old", "error", 0, 400).await;
        insert_build(&pool, "running-old", "running", 0, 400).await;

        let report = run_once(&pool, &HousekeepingConfig::default(), &QueueConfig::default())
            .await
            .unwrap();
        assert_eq!(report.build_sources, 2);
        assert_eq!(report.build_results, 2);
        assert_eq!(
            remaining_sources(&pool).await,
            vec!["complete-new", "error-retriable-old", "error-terminal-mid", "running-old"]
        );
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_unreferenced_content_is_reaped(pool: PgPool) {
        sqlx::query(
            "INSERT INTO package_group (id, kind, name) VALUES \
             ('acme', 'workspace', 'acme'), ('acme.svc', 'package', 'svc')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO published_version (package_id, version, revision, status, deleted_at) VALUES \
             ('acme.svc', '1.0', 1, 'release', NULL), \
             ('acme.svc', '0.1', 1, 'draft', NOW() - INTERVAL '60 days')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO published_data (package_id, checksum, media_type, data, created_at) VALUES \
             ('acme.svc', 'kept', 'text/plain', '\\x01', NOW() - INTERVAL '2 hours'), \
             ('acme.svc', 'orphan', 'text/plain', '\\x02', NOW() - INTERVAL '2 hours'), \
             ('acme.svc', 'fresh', 'text/plain', '\\x03', NOW())",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO published_version_revision_content \
             (package_id, version, revision, file_id, slug, checksum, media_type, file_index) \
             VALUES ('acme.svc', '1.0', 1, 'a.yaml', 'a-yaml', 'kept', 'text/plain', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO operation_data (data_hash, data) VALUES ('used', '\\x00'), ('draft-only', '\\x00')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO operation (package_id, version, revision, operation_id, api_type, data_hash) VALUES \
             ('acme.svc', '1.0', 1, 'get', 'rest', 'used'), \
             ('acme.svc', '0.1', 1, 'get', 'rest', 'draft-only')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let report = run_once(&pool, &HousekeepingConfig::default(), &QueueConfig::default())
            .await
            .unwrap();
        assert_eq!(report.deleted_drafts, 1);
        assert_eq!(report.operation_data, 1);
        assert_eq!(report.blobs, 1);

        let blobs: Vec<String> = sqlx::query_scalar("SELECT checksum FROM published_data ORDER BY checksum")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(blobs, vec!["fresh", "kept"]);
        let hashes: Vec<String> = sqlx::query_scalar("SELECT data_hash FROM operation_data")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(hashes, vec!["used"]);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_reaper_spares_blob_deduplicated_by_open_publish(pool: PgPool) {
        sqlx::query(
            "INSERT INTO published_data (package_id, checksum, media_type, data, created_at) \
             VALUES ('acme.svc', 'shared', 'text/plain', '\\x01', NOW() - INTERVAL '2 hours')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let mut tx = pool.begin().await.unwrap();
        let outcome = content::put_blob(&mut *tx, "acme.svc", "shared", "text/plain", b"\x01")
            .await
            .unwrap();
        assert_eq!(outcome, content::PutOutcome::Deduped);

        let reaper = tokio::spawn({
            let pool = pool.clone();
            async move { run_once(&pool, &HousekeepingConfig::default(), &QueueConfig::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!reaper.is_finished(), "reaper must wait on the deduplicated row");

        tx.commit().await.unwrap();
        let report = reaper.await.unwrap().unwrap();
        assert_eq!(report.blobs, 0);
        assert!(content::get_blob(&pool, "acme.svc", "shared").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_spawned_task_stops_on_cancel() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgresql://localhost/unused")
            .unwrap();
        let config = HousekeepingConfig {
            interval_secs: 3600,
            ..Default::default()
        };
        let token = CancellationToken::new();
        token.cancel();
        let handle = spawn(pool, config, QueueConfig::default(), token);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
