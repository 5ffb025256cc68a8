//! End-to-end tests of the build pipeline: queue, publish and changelog
//!
//! Run with a reachable Postgres in `DATABASE_URL`:
//!
//! ```bash
//! cargo test --test pipeline_tests
//! ```

mod helpers;

use apihub_common::error::codes;
use apihub_common::types::{
    ApiType, BuildConfig, BuildResult, BuildType, Pagination, ReferenceEntry, Severity, StatusUpdate,
};
use apihub_server::changelog::{self, ChangesFilter};
use apihub_server::db::versions::RevisionKey;
use apihub_server::groups::{self, OperationRef};
use apihub_server::publish;
use apihub_server::queue;
use helpers::*;
use sqlx::PgPool;
use std::collections::BTreeSet;

async fn publish_ok(pool: &PgPool, build_id: &str, result: &BuildResult) -> publish::PublishSummary {
    publish::publish(pool, &queue_config(), build_id, result)
        .await
        .unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_fresh_publish(pool: PgPool) {
    seed_package(&pool).await;
    let id = leased_build(&pool, PACKAGE, VERSION).await;

    let summary = publish_ok(&pool, &id, &result()).await;

    assert_eq!(summary.revision, 1);
    assert_eq!(summary.blobs_written, 1);
    assert_eq!(count(&pool, "published_data").await, 1);
    assert_eq!(count(&pool, "version_comparison").await, 0);

    let build = queue::get_build(&pool, &id).await.unwrap();
    assert_eq!(build.status, "complete");
    assert_eq!(build.details, "");
    assert_eq!(count(&pool, "build_result").await, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_republish_identical_dedups_content(pool: PgPool) {
    seed_package(&pool).await;
    let first = leased_build(&pool, PACKAGE, VERSION).await;
    publish_ok(&pool, &first, &result()).await;

    let second = leased_build(&pool, PACKAGE, VERSION).await;
    let summary = publish_ok(&pool, &second, &result()).await;

    assert_eq!(summary.revision, 2);
    assert_eq!(summary.blobs_written, 0);
    assert_eq!(summary.operation_data_written, 0);
    assert_eq!(count(&pool, "published_data").await, 1);
    assert_eq!(count(&pool, "operation_data").await, 1);
    assert_eq!(count(&pool, "operation").await, 2);
    assert_eq!(count(&pool, "published_version_revision_content").await, 2);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_republish_with_diff_records_comparison(pool: PgPool) {
    seed_package(&pool).await;
    for _ in 0..2 {
        let id = leased_build(&pool, PACKAGE, VERSION).await;
        publish_ok(&pool, &id, &result()).await;
    }

    let changed = ResultBuilder::new(PACKAGE, VERSION)
        .with_body("h2")
        .comparison(3, 2, &[("get-orders", 1)])
        .build();
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    let summary = publish_ok(&pool, &id, &changed).await;

    assert_eq!(summary.revision, 3);
    assert_eq!(summary.comparisons_written, 1);

    let hashes: Vec<String> = sqlx::query_scalar("SELECT data_hash FROM operation_data ORDER BY data_hash")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(hashes, vec!["h1", "h2"]);

    let expected = same_version_comparison_id(3, 2);
    let comparison = changelog::get_comparison(&pool, &expected).await.unwrap();
    assert_eq!(comparison.revision, 3);
    assert_eq!(comparison.previous_revision, 2);
    assert_eq!(count(&pool, "operation_comparison").await, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_changelog_build_stores_comparison_without_new_revision(pool: PgPool) {
    seed_package(&pool).await;
    let first = leased_build(&pool, PACKAGE, VERSION).await;
    publish_ok(&pool, &first, &result()).await;
    let second = leased_build(&pool, PACKAGE, VERSION).await;
    publish_ok(&pool, &second, &ResultBuilder::new(PACKAGE, VERSION).with_body("h2").build()).await;

    let mut config = BuildConfig::new(BuildType::Changelog, PACKAGE, VERSION);
    config.previous_version = Some(format!("{}@1", VERSION));
    let mut request = build_request(PACKAGE, VERSION);
    request.config = config;
    let id = submit(&pool, request).await;
    assert_eq!(lease(&pool, "w1").await.unwrap().build_id, id);

    let source = queue::get_build_source(&pool, &id).await.unwrap();
    assert_eq!(source.context.revision, 2);
    assert_eq!(source.context.previous.unwrap().revision, 1);

    let mut changelog = ResultBuilder::new(PACKAGE, VERSION)
        .comparison(2, 1, &[("get-orders", 1)])
        .build();
    changelog.documents.clear();
    changelog.document_bytes.clear();
    changelog.operations.clear();
    changelog.operation_data.clear();
    let summary = publish_ok(&pool, &id, &changelog).await;

    assert_eq!(summary.revision, 2);
    assert_eq!(summary.comparisons_written, 1);
    assert_eq!(revisions(&pool, PACKAGE, VERSION).await, vec![1, 2]);
    assert_eq!(count(&pool, "published_version_revision_content").await, 2);
    assert_eq!(count(&pool, "operation").await, 2);

    let comparison = changelog::get_comparison(&pool, &same_version_comparison_id(2, 1))
        .await
        .unwrap();
    assert_eq!((comparison.revision, comparison.previous_revision), (2, 1));
    assert_eq!(queue::get_build(&pool, &id).await.unwrap().status, "complete");
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_changelog_build_for_unpublished_version_fails(pool: PgPool) {
    seed_package(&pool).await;
    let mut config = BuildConfig::new(BuildType::Changelog, PACKAGE, "2.0");
    config.previous_version = Some(VERSION.to_string());
    let mut request = build_request(PACKAGE, "2.0");
    request.config = config;
    let id = submit(&pool, request).await;
    lease(&pool, "w1").await.unwrap();

    let changelog = ResultBuilder::new(PACKAGE, "2.0").build();
    let err = publish::publish(&pool, &queue_config(), &id, &changelog)
        .await
        .unwrap_err();
    assert!(err.api_error().unwrap().is(codes::VERSION_NOT_FOUND));
    assert!(revisions(&pool, PACKAGE, "2.0").await.is_empty());
    assert_eq!(count(&pool, "build_result").await, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_dependent_waits_for_parent(pool: PgPool) {
    seed_package(&pool).await;
    let parent = submit(&pool, build_request(PACKAGE, VERSION)).await;
    let mut child_request = build_request(PACKAGE, VERSION);
    child_request.priority = 10;
    child_request.depends = vec![parent.clone()];
    let child = submit(&pool, child_request).await;

    let leased = lease(&pool, "w1").await.unwrap();
    assert_eq!(leased.build_id, parent);
    assert!(lease(&pool, "w2").await.is_none());

    queue::update_status(&pool, &parent, &StatusUpdate::heartbeat("w1"))
        .await
        .unwrap();
    assert!(lease(&pool, "w2").await.is_none());

    publish_ok(&pool, &parent, &result()).await;
    let leased = lease(&pool, "w2").await.unwrap();
    assert_eq!(leased.build_id, child);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_crashed_worker_build_is_released(pool: PgPool) {
    seed_package(&pool).await;
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    assert!(lease(&pool, "w2").await.is_none());

    expire_lease(&pool, &id).await;
    let taken = lease(&pool, "w2").await.unwrap();
    assert_eq!(taken.build_id, id);
    assert_eq!(taken.restart_count, 1);
    assert_eq!(taken.builder_id.as_deref(), Some("w2"));

    let err = queue::update_status(&pool, &id, &StatusUpdate::heartbeat("w1"))
        .await
        .unwrap_err();
    assert!(err.api_error().unwrap().is(codes::BUILD_LEASE_LOST));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_poison_build_drains(pool: PgPool) {
    seed_package(&pool).await;
    let id = submit(&pool, build_request(PACKAGE, VERSION)).await;

    for (attempt, message) in ["e1", "e2", "e3"].iter().enumerate() {
        let builder = format!("w{}", attempt);
        let leased = lease(&pool, &builder).await.unwrap();
        assert_eq!(leased.build_id, id);
        assert_eq!(leased.restart_count, attempt as i32);
        queue::update_status(&pool, &id, &StatusUpdate::failed(&builder, *message))
            .await
            .unwrap();
    }

    let build = queue::get_build(&pool, &id).await.unwrap();
    assert_eq!(build.status, "error");
    assert_eq!(build.restart_count, 2);
    assert_eq!(build.details, "e1:e2:e3");
    assert!(lease(&pool, "w9").await.is_none());
}

// ============================================================================
// Invariants
// ============================================================================

#[sqlx::test(migrations = "../../migrations")]
async fn test_concurrent_workers_never_share_a_build(pool: PgPool) {
    seed_package(&pool).await;
    let mut submitted = BTreeSet::new();
    for _ in 0..4 {
        submitted.insert(submit(&pool, build_request(PACKAGE, VERSION)).await);
    }

    let mut handles = Vec::new();
    for worker in 0..6 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            queue::take_free_build(&pool, &queue_config(), &format!("w{}", worker))
                .await
                .unwrap()
        }));
    }

    let mut leased = Vec::new();
    for handle in handles {
        if let Some(build) = handle.await.unwrap() {
            leased.push(build.build_id);
        }
    }
    let unique: BTreeSet<String> = leased.iter().cloned().collect();
    assert_eq!(unique.len(), leased.len(), "a build was leased twice: {:?}", leased);

    // Workers that lost the race find the rest on the next poll
    while let Some(build) = lease(&pool, "late").await {
        assert!(!unique.contains(&build.build_id));
        leased.push(build.build_id);
    }
    let all: BTreeSet<String> = leased.into_iter().collect();
    assert_eq!(all, submitted);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_replayed_result_is_rejected(pool: PgPool) {
    seed_package(&pool).await;
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    publish_ok(&pool, &id, &result()).await;

    let err = publish::publish(&pool, &queue_config(), &id, &result())
        .await
        .unwrap_err();
    assert!(err.api_error().unwrap().is(codes::BUILD_ALREADY_FINISHED));
    assert_eq!(revisions(&pool, PACKAGE, VERSION).await, vec![1]);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_revisions_are_gapless_under_concurrency(pool: PgPool) {
    seed_package(&pool).await;
    let first = leased_build(&pool, PACKAGE, VERSION).await;
    let second = leased_build(&pool, PACKAGE, VERSION).await;

    let (config_a, config_b) = (queue_config(), queue_config());
    let (result_a, result_b) = (result(), result());
    let (a, b) = tokio::join!(
        publish::publish(&pool, &config_a, &first, &result_a),
        publish::publish(&pool, &config_b, &second, &result_b),
    );
    let mut assigned = vec![a.unwrap().revision, b.unwrap().revision];
    assigned.sort();
    assert_eq!(assigned, vec![1, 2]);
    assert_eq!(revisions(&pool, PACKAGE, VERSION).await, vec![1, 2]);

    let third = leased_build(&pool, PACKAGE, VERSION).await;
    let stale = ResultBuilder::new(PACKAGE, VERSION).revision(2).build();
    let err = publish::publish(&pool, &queue_config(), &third, &stale)
        .await
        .unwrap_err();
    assert!(err.api_error().unwrap().is(codes::REVISION_CONFLICT));
    assert_eq!(publish_ok(&pool, &third, &result()).await.revision, 3);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_declared_reference_cycle_rejected(pool: PgPool) {
    seed_packages(&pool, &["acme.svc", "acme.lib"]).await;
    let lib = leased_build(&pool, "acme.lib", "2.0").await;
    publish_ok(&pool, &lib, &ResultBuilder::new("acme.lib", "2.0").build()).await;

    let mut looping = ResultBuilder::new(PACKAGE, VERSION).reference("acme.lib", "2.0", 1).build();
    looping.references.push(ReferenceEntry {
        package_id: PACKAGE.to_string(),
        version: VERSION.to_string(),
        revision: 1,
        parent_package_id: Some("acme.lib".to_string()),
        parent_version: Some("2.0".to_string()),
        parent_revision: Some(1),
        excluded: false,
    });
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    let err = publish::publish(&pool, &queue_config(), &id, &looping)
        .await
        .unwrap_err();
    assert!(err.api_error().unwrap().is(codes::REFERENCE_CYCLE));
    assert_eq!(count(&pool, "published_version_reference").await, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_stored_reference_cycle_rejected(pool: PgPool) {
    seed_packages(&pool, &["acme.svc", "acme.lib"]).await;
    let svc = leased_build(&pool, PACKAGE, VERSION).await;
    publish_ok(&pool, &svc, &result()).await;

    let lib = leased_build(&pool, "acme.lib", "2.0").await;
    let lib_result = ResultBuilder::new("acme.lib", "2.0").reference(PACKAGE, VERSION, 1).build();
    publish_ok(&pool, &lib, &lib_result).await;

    // A migration republish of svc@1 that now points at lib@1 closes the loop
    let mut config = BuildConfig::new(BuildType::Build, PACKAGE, VERSION);
    config.migration_build = true;
    let mut request = build_request(PACKAGE, VERSION);
    request.config = config;
    let id = submit(&pool, request).await;
    lease(&pool, "w1").await.unwrap();

    let looping = ResultBuilder::new(PACKAGE, VERSION)
        .revision(1)
        .reference("acme.lib", "2.0", 1)
        .build();
    let err = publish::publish(&pool, &queue_config(), &id, &looping)
        .await
        .unwrap_err();
    let api = err.api_error().unwrap();
    assert!(api.is(codes::REFERENCE_CYCLE));
    assert_eq!(api.params["through"], "acme.lib@2.0@1");
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_cached_comparison_is_not_rewritten(pool: PgPool) {
    seed_package(&pool).await;
    for _ in 0..2 {
        let id = leased_build(&pool, PACKAGE, VERSION).await;
        publish_ok(&pool, &id, &result()).await;
    }
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    let changed = ResultBuilder::new(PACKAGE, VERSION)
        .with_body("h2")
        .comparison(3, 2, &[("get-orders", 1)])
        .build();
    publish_ok(&pool, &id, &changed).await;
    let cached_id = same_version_comparison_id(3, 2);

    // The next revision replays the cached id with different per-operation rows
    let replay = ResultBuilder::new(PACKAGE, VERSION)
        .with_body("h2")
        .comparison(3, 2, &[("get-orders", 0), ("post-orders", 0)])
        .cached(&cached_id)
        .build();
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    let summary = publish_ok(&pool, &id, &replay).await;
    assert_eq!(summary.revision, 4);
    assert_eq!(summary.comparisons_written, 0);

    let rows: Vec<(String, i32)> = sqlx::query_as(
        "SELECT operation_id, breaking FROM operation_comparison WHERE comparison_id = $1",
    )
    .bind(&cached_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows, vec![("get-orders".to_string(), 1)]);

    let open_count: i64 = sqlx::query_scalar("SELECT open_count FROM version_comparison WHERE comparison_id = $1")
        .bind(&cached_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(open_count, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_unknown_cached_comparison_fails_publish(pool: PgPool) {
    seed_package(&pool).await;
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    let result = ResultBuilder::new(PACKAGE, VERSION).cached("missing").build();

    let err = publish::publish(&pool, &queue_config(), &id, &result)
        .await
        .unwrap_err();
    assert!(err.api_error().unwrap().is(codes::COMPARISON_NOT_FOUND));
    assert_eq!(count(&pool, "published_version").await, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_changes_list_breaking_first(pool: PgPool) {
    seed_package(&pool).await;
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    publish_ok(&pool, &id, &result()).await;

    let id = leased_build(&pool, PACKAGE, VERSION).await;
    let changed = ResultBuilder::new(PACKAGE, VERSION)
        .operation("post-orders", "POST", "/orders", "h3")
        .operation("delete-order", "DELETE", "/orders/{id}", "h4")
        .comparison(2, 1, &[("a-rename", 0), ("post-orders", 2), ("delete-order", 0)])
        .build();
    publish_ok(&pool, &id, &changed).await;

    let comparison_id = same_version_comparison_id(2, 1);
    let changes = changelog::list_changes(
        &pool,
        &comparison_id,
        &ChangesFilter::default(),
        Pagination::from_query(None, None),
    )
    .await
    .unwrap();
    let order: Vec<&str> = changes.iter().map(|c| c.operation_id.as_str()).collect();
    assert_eq!(order, vec!["post-orders", "a-rename", "delete-order"]);

    let breaking_only = ChangesFilter {
        severities: vec![Severity::Breaking],
        ..Default::default()
    };
    let changes = changelog::list_changes(&pool, &comparison_id, &breaking_only, Pagination::from_query(None, None))
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].operation_id, "post-orders");

    let summary = changelog::changes_summary(&pool, &comparison_id).await.unwrap();
    assert_eq!(summary.operation_types.len(), 1);
    assert_eq!(summary.operation_types[0].changes_summary.breaking, 2);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_manual_groups_follow_new_revision(pool: PgPool) {
    seed_package(&pool).await;
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    let first = ResultBuilder::new(PACKAGE, VERSION)
        .operation("post-orders", "POST", "/orders", "h3")
        .build();
    publish_ok(&pool, &id, &first).await;

    let key = RevisionKey::new(PACKAGE, VERSION, 1);
    groups::create_group(&pool, &key, ApiType::Rest, "public", "", "alice")
        .await
        .unwrap();
    groups::add_operations(
        &pool,
        &key,
        ApiType::Rest,
        "public",
        &[OperationRef::own("get-orders"), OperationRef::own("post-orders")],
        "alice",
    )
    .await
    .unwrap();

    // post-orders is gone in revision 2
    let id = leased_build(&pool, PACKAGE, VERSION).await;
    let summary = publish_ok(&pool, &id, &result()).await;
    assert_eq!(summary.groups_propagated, 1);

    let next = RevisionKey::new(PACKAGE, VERSION, 2);
    let members = groups::list_members(&pool, &next, ApiType::Rest, "public")
        .await
        .unwrap();
    let ids: Vec<&str> = members.iter().map(|m| m.operation_id.as_str()).collect();
    assert_eq!(ids, vec!["get-orders"]);
}
