//! Shared helpers for the server integration tests
//!
//! Every test gets a fresh database from `#[sqlx::test]`; these helpers seed
//! packages, drive builds through the queue and build result artifacts.

#![allow(dead_code)]

use apihub_common::ids::{comparison_id, RevisionCoords};
use apihub_common::types::{
    ApiType, BuildConfig, BuildResult, BuildType, ChangeAction, ChangeSummary, DocumentBytes,
    DocumentEntry, OperationComparisonEntry, OperationData, OperationEntry, OperationTypeChanges,
    PublishedVersionMeta, ReferenceEntry, SubmitBuildRequest, VersionComparisonEntry, VersionStatus,
};
use apihub_server::api::{self, AppState};
use apihub_server::config::{Config, QueueConfig};
use apihub_server::queue::{self, Build};
use axum::body::Body;
use axum::http::Response;
use axum::Router;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::BTreeMap;

pub const PACKAGE: &str = "acme.svc";
pub const VERSION: &str = "1.0";

pub fn queue_config() -> QueueConfig {
    QueueConfig::default()
}

/// Router with default config over `pool`
pub fn test_app(pool: PgPool) -> Router {
    let config = Config::default();
    api::create_router(AppState::new(pool, &config), &config)
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Insert the `acme` workspace and the given packages below it
pub async fn seed_packages(pool: &PgPool, ids: &[&str]) {
    sqlx::query("INSERT INTO package_group (id, kind, name) VALUES ('acme', 'workspace', 'acme')")
        .execute(pool)
        .await
        .unwrap();
    for id in ids {
        let name = id.rsplit('.').next().unwrap();
        sqlx::query("INSERT INTO package_group (id, kind, name, parent_id) VALUES ($1, 'package', $2, 'acme')")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await
            .unwrap();
    }
}

pub async fn seed_package(pool: &PgPool) {
    seed_packages(pool, &[PACKAGE]).await;
}

pub fn build_request(package_id: &str, version: &str) -> SubmitBuildRequest {
    SubmitBuildRequest {
        package_id: package_id.to_string(),
        config: BuildConfig::new(BuildType::Build, package_id, version),
        source_archive: b"sources".to_vec(),
        priority: 0,
        depends: vec![],
    }
}

pub async fn submit(pool: &PgPool, request: SubmitBuildRequest) -> String {
    queue::submit(pool, &queue_config(), request)
        .await
        .unwrap()
        .build_id
}

pub async fn lease(pool: &PgPool, builder_id: &str) -> Option<Build> {
    queue::take_free_build(pool, &queue_config(), builder_id)
        .await
        .unwrap()
}

/// Submit a build for `package_id@version` and lease it to `w1`
pub async fn leased_build(pool: &PgPool, package_id: &str, version: &str) -> String {
    let id = submit(pool, build_request(package_id, version)).await;
    let leased = lease(pool, "w1").await.unwrap();
    assert_eq!(leased.build_id, id);
    id
}

/// Age the build's heartbeat past the default keepalive
pub async fn expire_lease(pool: &PgPool, build_id: &str) {
    sqlx::query("UPDATE build SET last_active = NOW() - INTERVAL '601 seconds' WHERE build_id = $1")
        .bind(build_id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn revisions(pool: &PgPool, package_id: &str, version: &str) -> Vec<i32> {
    sqlx::query_scalar(
        "SELECT revision FROM published_version WHERE package_id = $1 AND version = $2 ORDER BY revision",
    )
    .bind(package_id)
    .bind(version)
    .fetch_all(pool)
    .await
    .unwrap()
}

/// Builder for the artifact a worker posts back
#[derive(Debug, Clone)]
pub struct ResultBuilder {
    result: BuildResult,
}

impl ResultBuilder {
    /// One `openapi.yaml` document (checksum `abc`) with one REST operation
    pub fn new(package_id: &str, version: &str) -> Self {
        let result = BuildResult {
            version: PublishedVersionMeta {
                package_id: package_id.to_string(),
                version: version.to_string(),
                revision: None,
                status: VersionStatus::Release,
                labels: vec![],
                previous_version_package_id: None,
                previous_version: None,
                metadata: json!({}),
                created_by: "ci".to_string(),
            },
            documents: vec![DocumentEntry {
                file_id: "openapi.yaml".to_string(),
                slug: "openapi-yaml".to_string(),
                checksum: "abc".to_string(),
                media_type: "application/yaml".to_string(),
                title: "Orders".to_string(),
                index: 0,
                operation_ids: vec!["get-orders".to_string()],
                metadata: json!({}),
            }],
            document_bytes: vec![DocumentBytes {
                checksum: "abc".to_string(),
                media_type: "application/yaml".to_string(),
                data: b"openapi: 3.0.0".to_vec(),
            }],
            references: vec![],
            source_archive: None,
            operations: vec![],
            operation_data: vec![],
            operation_comparisons: vec![],
            version_comparisons: vec![],
            builder_notifications: vec![],
            service_name: None,
            cached_comparison_ids: vec![],
        };
        Self { result }.operation("get-orders", "GET", "/orders", "h1")
    }

    /// Add a REST operation and its body, keyed by `data_hash`
    pub fn operation(mut self, operation_id: &str, method: &str, path: &str, data_hash: &str) -> Self {
        self.result.operations.push(OperationEntry {
            operation_id: operation_id.to_string(),
            api_type: ApiType::Rest,
            data_hash: data_hash.to_string(),
            deprecated: false,
            kind: "bwc".to_string(),
            title: operation_id.replace('-', " "),
            api_audience: "external".to_string(),
            metadata: json!({"path": path, "method": method.to_lowercase(), "tags": ["orders"]}),
            models: BTreeMap::new(),
        });
        if !self.result.operation_data.iter().any(|d| d.data_hash == data_hash) {
            self.result.operation_data.push(OperationData {
                data_hash: data_hash.to_string(),
                data: format!("{{\"body\":\"{}\"}}", data_hash).into_bytes(),
                search_scope: json!({"request": operation_id, "response": data_hash}),
            });
        }
        self
    }

    /// Replace the body of every operation with `data_hash`
    pub fn with_body(mut self, data_hash: &str) -> Self {
        let previous: Vec<String> = self.result.operations.iter().map(|o| o.data_hash.clone()).collect();
        for op in &mut self.result.operations {
            op.data_hash = data_hash.to_string();
        }
        self.result.operation_data.retain(|d| !previous.contains(&d.data_hash));
        self.result.operation_data.push(OperationData {
            data_hash: data_hash.to_string(),
            data: format!("{{\"body\":\"{}\"}}", data_hash).into_bytes(),
            search_scope: json!({"request": "changed", "response": data_hash}),
        });
        self
    }

    pub fn revision(mut self, revision: i32) -> Self {
        self.result.version.revision = Some(revision);
        self
    }

    pub fn previous_version(mut self, version: &str) -> Self {
        self.result.version.previous_version = Some(version.to_string());
        self
    }

    pub fn reference(mut self, package_id: &str, version: &str, revision: i32) -> Self {
        self.result.references.push(ReferenceEntry {
            package_id: package_id.to_string(),
            version: version.to_string(),
            revision,
            parent_package_id: None,
            parent_version: None,
            parent_revision: None,
            excluded: false,
        });
        self
    }

    /// Compare `revision` against `previous_revision` of the same version,
    /// with one changed operation per `(operation_id, breaking)` pair
    pub fn comparison(mut self, revision: i32, previous_revision: i32, changes: &[(&str, i32)]) -> Self {
        let package_id = self.result.version.package_id.clone();
        let version = self.result.version.version.clone();
        let id = comparison_id(
            RevisionCoords::new(&package_id, &version, revision),
            RevisionCoords::new(&package_id, &version, previous_revision),
        );

        let mut total = ChangeSummary::default();
        for (operation_id, breaking) in changes {
            let summary = ChangeSummary {
                breaking: *breaking,
                non_breaking: 1,
                ..Default::default()
            };
            total.add(&summary);
            self.result.operation_comparisons.push(OperationComparisonEntry {
                comparison_id: id.clone(),
                operation_id: operation_id.to_string(),
                previous_operation_id: Some(operation_id.to_string()),
                data_hash: Some(format!("{}-new", operation_id)),
                previous_data_hash: Some(format!("{}-old", operation_id)),
                api_type: ApiType::Rest,
                api_audience: "external".to_string(),
                action: ChangeAction::Change,
                changes_summary: summary,
                changes: json!([{"path": "/responses/200"}]),
                metadata: json!({"title": operation_id, "tags": ["orders"]}),
            });
        }

        self.result.version_comparisons.push(VersionComparisonEntry {
            comparison_id: Some(id),
            package_id,
            version,
            revision,
            previous_package_id: self.result.version.package_id.clone(),
            previous_version: self.result.version.version.clone(),
            previous_revision,
            operation_types: vec![OperationTypeChanges {
                api_type: ApiType::Rest,
                changes_summary: total,
                number_of_impacted_operations: total,
                tags: vec!["orders".to_string()],
            }],
            refs: vec![],
            no_content: false,
            open_count: 1,
        });
        self
    }

    pub fn cached(mut self, comparison_id: &str) -> Self {
        self.result.cached_comparison_ids.push(comparison_id.to_string());
        self
    }

    pub fn build(self) -> BuildResult {
        self.result
    }
}

pub fn result() -> BuildResult {
    ResultBuilder::new(PACKAGE, VERSION).build()
}

pub fn same_version_comparison_id(revision: i32, previous_revision: i32) -> String {
    comparison_id(
        RevisionCoords::new(PACKAGE, VERSION, revision),
        RevisionCoords::new(PACKAGE, VERSION, previous_revision),
    )
}
