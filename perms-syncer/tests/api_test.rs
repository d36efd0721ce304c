use authz::{AuthzSnapshot, ProviderSet};
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use config::SyncerConfig;
use perms_syncer::api::{HealthResponse, ScheduleResponse};
use perms_syncer::{PermsSyncer, Priority, RequestType, Stores, create_router};
use serde_json::json;
use std::sync::Arc;
use storage::MemoryStore;
use tower::ServiceExt;

fn syncer() -> Arc<PermsSyncer> {
    Arc::new(PermsSyncer::new(
        Stores::from_backend(MemoryStore::new()),
        Arc::new(AuthzSnapshot::new(true, ProviderSet::default())),
        &SyncerConfig::default()
    ))
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_schedule_enqueues_requests() {
    let syncer = syncer();
    let response = create_router(Arc::clone(&syncer))
        .oneshot(post_json(
            "/schedule-perms-sync",
            json!({ "user_ids": [1, 2], "repo_ids": [7], "priority": "low" })
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: ScheduleResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        parsed,
        ScheduleResponse {
            users: 2,
            repos: 1,
            queue_size: 3
        }
    );

    let first = syncer.queue().acquire_next().unwrap();
    assert_eq!(first.meta.priority, Priority::Low);
    assert_eq!(first.meta.request_type, RequestType::User);
}

#[tokio::test]
async fn test_schedule_defaults_to_high_priority() {
    let syncer = syncer();
    create_router(Arc::clone(&syncer))
        .oneshot(post_json("/schedule-perms-sync", json!({ "repo_ids": [3] })))
        .await
        .unwrap();

    let request = syncer.queue().acquire_next().unwrap();
    assert_eq!(request.meta.priority, Priority::High);
    assert_eq!(request.meta.id, 3);
}

#[tokio::test]
async fn test_schedule_rejects_empty_request() {
    let response = create_router(syncer())
        .oneshot(post_json("/schedule-perms-sync", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_reports_queue_and_providers() {
    let syncer = syncer();
    syncer.schedule_users(Priority::Low, &[5], false);

    let response = create_router(syncer)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.queue_size, 1);
    assert_eq!(health.providers, 0);
    assert!(health.allow_access_by_default);
}
