//! Worker protocol client against a mock APIHUB server

use apihub_common::types::{
    BuildConfig, BuildResult, BuildStatus, BuildType, PublishedVersionMeta, StatusUpdate,
    VersionStatus,
};
use apihub_worker::{
    BuildBackend, Outcome, ProcessParser, Worker, WorkerApiClient, WorkerConfig, WorkerError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    matchers::{body_json, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn client(server: &MockServer) -> WorkerApiClient {
    WorkerApiClient::new(server.uri(), Duration::from_secs(5)).unwrap()
}

fn build_view(id: &str) -> serde_json::Value {
    json!({
        "build_id": id,
        "package_id": "acme.svc",
        "status": "running",
        "priority": 0,
        "restart_count": 1,
        "builder_id": "w1",
        "details": "",
        "created_at": "2026-10-01T12:00:00Z",
        "last_active": "2026-10-01T12:05:00Z"
    })
}

fn source_payload(id: &str) -> serde_json::Value {
    json!({
        "build_id": id,
        "config": serde_json::to_value(BuildConfig::new(BuildType::Build, "acme.svc", "1.0")).unwrap(),
        "source": "c291cmNlcw==",
        "context": {"package_id": "acme.svc", "version": "1.0", "revision": 4, "previous": null}
    })
}

fn error_body(status: u16, code: &str, message: &str) -> serde_json::Value {
    json!({"success": false, "status": status, "code": code, "message": message})
}

fn minimal_result() -> BuildResult {
    serde_json::from_value(json!({
        "version": {"package_id": "acme.svc", "version": "1.0", "created_by": "ci"}
    }))
    .unwrap()
}

// ============================================================================
// Client Tests
// ============================================================================

#[tokio::test]
async fn test_next_build_returns_leased_build() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/builds/next-build"))
        .and(query_param("builder_id", "w1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": build_view("b1")})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let build = client(&server).next_build("w1").await.unwrap().unwrap();
    assert_eq!(build.build_id, "b1");
    assert_eq!(build.status, BuildStatus::Running);
    assert_eq!(build.restart_count, 1);
}

#[tokio::test]
async fn test_next_build_no_content_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/builds/next-build"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    assert!(client(&server).next_build("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_build_source_decodes_base64() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/builds/b1/source"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": source_payload("b1")})),
        )
        .mount(&server)
        .await;

    let source = client(&server).build_source("b1").await.unwrap();
    assert_eq!(source.source, b"sources");
    assert_eq!(source.context.revision, 4);
    assert_eq!(source.config.package_id, "acme.svc");
}

#[tokio::test]
async fn test_update_status_sends_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/builds/b1/status"))
        .and(body_json(json!({"status": "error", "details": "boom", "builder_id": "w1"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": build_view("b1")})),
        )
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .update_status("b1", &StatusUpdate::failed("w1", "boom"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_error_envelope_becomes_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/builds/b1/status"))
        .respond_with(ResponseTemplate::new(409).set_body_json(error_body(
            409,
            "BuildLeaseLost",
            "Build 'b1' is now leased by 'w2', not 'w1'",
        )))
        .mount(&server)
        .await;

    let err = client(&server)
        .update_status("b1", &StatusUpdate::heartbeat("w1"))
        .await
        .unwrap_err();
    match &err {
        WorkerError::Api { status, code, message } => {
            assert_eq!(*status, 409);
            assert_eq!(code, "BuildLeaseLost");
            assert!(message.contains("'w2'"));
        },
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.is_lease_lost());
}

#[tokio::test]
async fn test_non_envelope_error_keeps_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/builds/b1/source"))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let err = client(&server).build_source("b1").await.unwrap_err();
    match err {
        WorkerError::Api { status, code, message } => {
            assert_eq!(status, 502);
            assert_eq!(code, "BadGateway");
            assert_eq!(message, "upstream down");
        },
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_upload_result_returns_receipt() {
    let server = MockServer::start().await;
    let result = BuildResult {
        version: PublishedVersionMeta {
            status: VersionStatus::Draft,
            ..minimal_result().version
        },
        ..minimal_result()
    };
    Mock::given(method("POST"))
        .and(path("/api/v1/builds/b1/result"))
        .and(body_json(serde_json::to_value(&result).unwrap()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "build_id": "b1",
                "package_id": "acme.svc",
                "version": "1.0",
                "revision": 4,
                "migration": false,
                "blobs_written": 0,
                "operation_data_written": 0,
                "comparisons_written": 0,
                "groups_propagated": 0
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = client(&server).upload_result("b1", &result).await.unwrap();
    assert_eq!(receipt.revision, 4);
    assert_eq!(receipt.version, "1.0");
}

#[tokio::test]
async fn test_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
        .mount(&server)
        .await;

    assert!(client(&server).health_check().await);
    let unreachable = WorkerApiClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
    assert!(!unreachable.health_check().await);
}

// ============================================================================
// Worker Loop Against The Mock Server
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_worker_publishes_parser_output() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/builds/next-build"))
        .and(query_param("builder_id", "w1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": build_view("b1")})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/builds/b1/source"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": source_payload("b1")})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/builds/b1/result"))
        .and(body_json(serde_json::to_value(minimal_result()).unwrap()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"build_id": "b1", "package_id": "acme.svc", "version": "1.0", "revision": 4}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = WorkerConfig {
        server_url: server.uri(),
        builder_id: "w1".to_string(),
        ..Default::default()
    };
    let parser = ProcessParser::new(
        r#"echo '{"version":{"package_id":"acme.svc","version":"1.0","created_by":"ci"}}'"#,
    );
    let worker = Worker::new(Arc::new(client(&server)), parser, &config);

    match worker.run_once().await.unwrap() {
        Outcome::Published(receipt) => assert_eq!(receipt.revision, 4),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_reports_parser_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/builds/next-build"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": build_view("b1")})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/builds/b1/source"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": source_payload("b1")})),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/builds/b1/status"))
        .and(body_json(json!({
            "status": "error",
            "details": "Parser failed: command exited with 2: bad spec",
            "builder_id": "w1"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": build_view("b1")})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = WorkerConfig {
        server_url: server.uri(),
        builder_id: "w1".to_string(),
        ..Default::default()
    };
    let worker = Worker::new(
        Arc::new(client(&server)),
        ProcessParser::new("echo 'bad spec' >&2; exit 2"),
        &config,
    );

    assert!(matches!(
        worker.run_once().await.unwrap(),
        Outcome::Failed { .. }
    ));
}
