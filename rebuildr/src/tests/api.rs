//! Router-level tests: the endpoints as a client sees them, through
//! `tower::ServiceExt::oneshot` against the in-memory fixture.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use rebuildr_schema::strategy::StrategyOneOf;
use rebuildr_schema::Ecosystem;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use super::mock::*;
use crate::api::{router, AppState};
use crate::executor::PlannedBuild;
use crate::feed::{Feed, MemQueue, Tracker};

fn state_for(fixture: &TestPipeline, queue: Arc<MemQueue>) -> Arc<AppState> {
    Arc::new(AppState {
        pipeline: fixture.pipeline.clone(),
        inference: fixture.pipeline.inference.clone(),
        gateway: None,
        feed: Some(Arc::new(Feed::new(
            Tracker::all_of(Ecosystem::ALL.iter().copied()),
            queue,
            8,
        ))),
        service_version: SERVICE_VERSION.to_owned(),
        runs: Mutex::new(HashMap::new()),
        wait_grace: Duration::from_secs(60),
        cancel_grace: Duration::from_secs(60),
    })
}

async fn send(
    state: Arc<AppState>,
    request: Request<Body>,
) -> (StatusCode, serde_json::Value) {
    let response = router(state).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn form_request(path: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_owned()))
        .unwrap()
}

fn json_request(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn rebuild_form(run_id: &str) -> String {
    format!("ecosystem=pypi&package={PYPI_PKG}&version={PYPI_VER}&artifact={PYPI_WHEEL}&id={run_id}")
}

#[tokio::test]
async fn rebuild_endpoint_round_trips_a_verdict() {
    let upstream = wheel_bytes(false);
    let fixture = pypi_fixture(&upstream);
    fixture.worker.plan_next(PlannedBuild::success(&upstream));
    let state = state_for(&fixture, Arc::new(MemQueue::new()));

    let (status, body) = send(state, form_request("/rebuild", &rebuild_form("run-http"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "");
    assert_eq!(body["target"]["package"], PYPI_PKG);
    assert_eq!(body["target"]["artifact"], PYPI_WHEEL);
    assert!(body["strategyOneof"]["pypi_wheel_build"].is_object());

    // the attempt really ran through the wired pipeline
    let rows = fixture.attempts.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempt_id, "run-http");
    assert!(rows[0].success);
}

#[tokio::test]
async fn rebuild_endpoint_maps_mismatch_to_412() {
    let fixture = pypi_fixture(&wheel_bytes(false));
    let rebuilt = {
        use std::io::Write as _;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("absl/app.py", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"import os\n").unwrap();
        writer.finish().unwrap().into_inner()
    };
    fixture.worker.plan_next(PlannedBuild::success(&rebuilt));
    let state = state_for(&fixture, Arc::new(MemQueue::new()));

    let (status, body) = send(state, form_request("/rebuild", &rebuild_form("run-412"))).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("rebuild content mismatch"));
}

#[tokio::test]
async fn rebuild_endpoint_requires_its_fields() {
    let fixture = pypi_fixture(&wheel_bytes(false));
    let state = state_for(&fixture, Arc::new(MemQueue::new()));

    // no id
    let body = format!("ecosystem=pypi&package={PYPI_PKG}&version={PYPI_VER}");
    let (status, body) = send(state.clone(), form_request("/rebuild", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    // unknown ecosystem
    let body = "ecosystem=rubygems&package=rails&version=7.0.0&id=run-bad";
    let (status, _) = send(state, form_request("/rebuild", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn infer_endpoint_returns_a_strategy_oneof() {
    let fixture = pypi_fixture(&wheel_bytes(false));
    let state = state_for(&fixture, Arc::new(MemQueue::new()));

    let body = format!("ecosystem=pypi&package={PYPI_PKG}&version={PYPI_VER}&artifact={PYPI_WHEEL}");
    let (status, body) = send(state, form_request("/infer", &body)).await;
    assert_eq!(status, StatusCode::OK);
    let oneof: StrategyOneOf = serde_json::from_value(body).unwrap();
    let wheel = oneof.pypi_wheel_build.expect("inferred a wheel recipe");
    assert_eq!(wheel.location.git_ref, PYPI_COMMIT);
}

#[tokio::test]
async fn infer_endpoint_rejects_hint_without_repo() {
    let fixture = pypi_fixture(&wheel_bytes(false));
    let state = state_for(&fixture, Arc::new(MemQueue::new()));

    // strategyHint={"location_hint":{"repo":"","ref":""}} percent-encoded
    let hint = "%7B%22location_hint%22%3A%7B%22repo%22%3A%22%22%2C%22ref%22%3A%22%22%7D%7D";
    let body = format!(
        "ecosystem=pypi&package={PYPI_PKG}&version={PYPI_VER}&artifact={PYPI_WHEEL}&strategyHint={hint}"
    );
    let (status, body) = send(state, form_request("/infer", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");
}

#[tokio::test]
async fn enqueue_endpoint_validates_and_feeds() {
    let fixture = pypi_fixture(&wheel_bytes(false));
    let queue = Arc::new(MemQueue::new());
    let state = state_for(&fixture, queue.clone());

    let event = serde_json::json!({
        "name": format!("pypi/{PYPI_PKG}/{PYPI_VER}/{PYPI_WHEEL}/rebuild.intoto.jsonl"),
        "bucket": "attestations",
        "generation": "1700000000000000",
        "timeCreated": "2023-11-01T12:30:00Z",
        "updated": "2023-11-01T12:30:00Z",
        "size": "2048",
    });
    let (status, body) = send(state.clone(), json_request("/enqueue", event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enqueued"], 1);

    let batches = queue.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].package, PYPI_PKG);

    // a non-bundle object name is a client error
    let bad = serde_json::json!({
        "name": format!("pypi/{PYPI_PKG}/{PYPI_VER}/{PYPI_WHEEL}/info.json"),
        "bucket": "attestations",
    });
    let (status, body) = send(state, json_request("/enqueue", bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");
}

#[tokio::test]
async fn version_endpoint_reports_both_services() {
    let fixture = pypi_fixture(&wheel_bytes(false));
    let state = state_for(&fixture, Arc::new(MemQueue::new()));

    let (status, body) = send(state.clone(), form_request("/version", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], SERVICE_VERSION);

    let (status, body) = send(state, form_request("/version", "service=inference")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], SERVICE_VERSION);
}
