//! HTTP surface tests, driven through the router without a socket.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use serde::de::DeserializeOwned;
use tower::ServiceExt;

use runlane::config::RunlaneConfig;
use runlane::server::types::{
    CancelReceipt, CostReceipt, Envelope, ErrorEnvelope, HealthReport, JobStatus, QueueSnapshot,
    SubmitReceipt,
};
use runlane::server::{Coordinator, router};
use runlane::state_machine::{JobState, Priority};

fn app(max_depth: usize) -> Router {
    let mut config = RunlaneConfig::default();
    config.server.max_queue_depth = max_depth;
    // Without a started dispatcher every job stays queued.
    let coordinator = Coordinator::new(&config).unwrap();
    router(coordinator)
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<&str>,
) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method(method).uri(uri);
    if body.is_some() {
        request = request.header("content-type", "application/json");
    }
    let request = request
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn data<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice::<Envelope<T>>(bytes).unwrap().data
}

fn error_code(bytes: &[u8]) -> String {
    serde_json::from_slice::<ErrorEnvelope>(bytes).unwrap().error.code
}

const SUBMIT: &str = r#"{"target": "tests/", "framework": "pytest", "caller_id": "agent-1"}"#;

#[tokio::test]
async fn submit_then_status() {
    let app = app(10);
    let (status, body) = call(&app, Method::POST, "/api/v1/jobs", Some(SUBMIT)).await;
    assert_eq!(status, StatusCode::OK);
    let receipt: SubmitReceipt = data(&body);
    assert_eq!(receipt.queue_position, 1);

    let uri = format!("/api/v1/jobs/{}", receipt.job_id);
    let (status, body) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let job: JobStatus = data(&body);
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.priority, Priority::Normal);
    assert_eq!(job.queue_position, Some(1));
    assert_eq!(job.timeout_secs, 300);
}

#[tokio::test]
async fn unknown_job_is_404() {
    let app = app(10);
    let (status, body) = call(&app, Method::GET, "/api/v1/jobs/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "not_found");
}

#[tokio::test]
async fn result_of_queued_job_is_409() {
    let app = app(10);
    let (_, body) = call(&app, Method::POST, "/api/v1/jobs", Some(SUBMIT)).await;
    let receipt: SubmitReceipt = data(&body);

    let uri = format!("/api/v1/jobs/{}/result", receipt.job_id);
    let (status, body) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "not_ready");
}

#[tokio::test]
async fn full_queue_is_503() {
    let app = app(1);
    let (status, _) = call(&app, Method::POST, "/api/v1/jobs", Some(SUBMIT)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, Method::POST, "/api/v1/jobs", Some(SUBMIT)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(&body), "queue_full");
}

#[tokio::test]
async fn bad_submissions_are_400() {
    let app = app(10);
    let (status, body) = call(&app, Method::POST, "/api/v1/jobs", Some("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "invalid_request");

    let unknown = r#"{"target": "x", "framework": "mocha"}"#;
    let (status, body) = call(&app, Method::POST, "/api/v1/jobs", Some(unknown)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "unknown_framework");
}

#[tokio::test]
async fn cancel_twice() {
    let app = app(10);
    let (_, body) = call(&app, Method::POST, "/api/v1/jobs", Some(SUBMIT)).await;
    let receipt: SubmitReceipt = data(&body);
    let uri = format!("/api/v1/jobs/{}", receipt.job_id);

    let (status, body) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let cancel: CancelReceipt = data(&body);
    assert_eq!(cancel.state, JobState::Cancelled);
    assert!(!cancel.was_running);

    let (status, body) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "already_terminal");
}

#[tokio::test]
async fn cost_health_and_queue() {
    let app = app(10);
    let (_, body) = call(&app, Method::POST, "/api/v1/jobs", Some(SUBMIT)).await;
    let receipt: SubmitReceipt = data(&body);

    let uri = format!("/api/v1/jobs/{}/cost", receipt.job_id);
    let (status, body) = call(&app, Method::POST, &uri, Some(r#"{"amount": 0.25}"#)).await;
    assert_eq!(status, StatusCode::OK);
    let cost: CostReceipt = data(&body);
    assert_eq!(cost.job_cost, 0.25);

    let (status, _) = call(&app, Method::POST, &uri, Some(r#"{"amount": -1}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthReport = data(&body);
    assert_eq!(health.status, "ok");
    assert_eq!(health.queue_depth, 1);
    assert!(health.active_job_id.is_none());
    assert_eq!(health.daily_cost, 0.25);

    let (status, body) = call(&app, Method::GET, "/api/v1/queue", None).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: QueueSnapshot = data(&body);
    assert!(snapshot.active.is_none());
    assert_eq!(snapshot.queued.len(), 1);
    assert_eq!(snapshot.queued[0].caller_id, "agent-1");
    assert_eq!(snapshot.queued[0].position, Some(1));
}

#[tokio::test]
async fn unknown_route_uses_error_envelope() {
    let app = app(10);
    let (status, body) = call(&app, Method::GET, "/api/v2/whatever", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "not_found");
}
