//! Exercises the control HTTP router directly (no socket), the same
//! `tower::ServiceExt::oneshot` pattern axum's own docs use for testing a
//! `Router` as a plain `tower::Service`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use ignition::cache::InstanceCache;
use ignition::registry::Registry;
use ignition::server::{router, AppState};
use ignition::store::{metadata::MetadataStore, ContentStore};
use tower::ServiceExt;

fn test_state() -> Arc<AppState> {
    let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
    let content = ContentStore::new(dir.path());
    let metadata = MetadataStore::open_temporary().unwrap();
    let registry = Registry::new(content, metadata);
    let engine = ignition::runtime::new_shared_engine().unwrap();
    let cache = Arc::new(InstanceCache::new(registry.clone(), engine, 64, 5_000));
    Arc::new(AppState { registry, cache })
}

async fn send(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn status_endpoint_reports_ok() {
    let app = router(test_state());
    let request = Request::builder()
        .method("GET")
        .uri("/status")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn load_unknown_function_is_not_found() {
    let app = router(test_state());
    let (status, body) = send(
        app,
        "POST",
        "/load",
        serde_json::json!({"namespace": "default", "name": "missing", "digest": "latest"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotFound");
}

#[tokio::test]
async fn unload_not_loaded_function_is_not_found() {
    let app = router(test_state());
    let (status, _) = send(
        app,
        "POST",
        "/unload",
        serde_json::json!({"namespace": "default", "name": "missing"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_with_no_functions_is_empty() {
    let app = router(test_state());
    let (status, body) = send(app, "POST", "/list", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn build_with_unsupported_language_is_bad_request() {
    let app = router(test_state());
    let (status, body) = send(
        app,
        "POST",
        "/build",
        serde_json::json!({
            "namespace": "default",
            "name": "hello",
            "path": "/tmp/does-not-matter",
            "manifest": {"function": {"language": "cobol"}},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BadRequest");
}

#[tokio::test]
async fn build_without_manifest_language_is_bad_request() {
    let app = router(test_state());
    let (status, body) = send(
        app,
        "POST",
        "/build",
        serde_json::json!({
            "namespace": "default",
            "name": "hello",
            "path": "/tmp/does-not-matter",
            "manifest": {},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BadRequest");
}

#[tokio::test]
async fn reassign_tag_on_missing_version_is_not_found() {
    let app = router(test_state());
    let (status, _) = send(
        app,
        "POST",
        "/reassign-tag",
        serde_json::json!({
            "namespace": "default",
            "name": "hello",
            "tag": "latest",
            "digest": "a".repeat(16),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logs_for_unloaded_function_is_not_found() {
    let app = router(test_state());
    let request = Request::builder()
        .method("GET")
        .uri("/logs/default/hello")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn loaded_is_empty_for_a_fresh_engine() {
    let app = router(test_state());
    let request = Request::builder()
        .method("GET")
        .uri("/loaded")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body.as_array().unwrap().len(), 0);
}
