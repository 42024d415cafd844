//! In-process scenario tests for hbt-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot`; no network I/O required.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot

use hbt_daemon::{routes, state::AppState};
use hbt_reconcile::RawBatchRecord;
use hbt_schemas::SourceRole;
use hbt_sources::{InMemorySource, RecordSource};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_state() -> Arc<AppState> {
    Arc::new(AppState::default())
}

/// Drive the router with a single request and return (status, body_bytes).
async fn call(st: &Arc<AppState>, req: Request<Body>) -> (StatusCode, bytes::Bytes) {
    let router = routes::build_router(Arc::clone(st));
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn parse_json(b: bytes::Bytes) -> Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let st = make_state();
    let (status, body) = call(&st, get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "hbt-daemon");
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_batch_is_404_with_external_id() {
    let st = make_state();
    for uri in [
        "/v1/batches/NOPE-1",
        "/v1/batches/NOPE-1/timeline",
        "/v1/batches/NOPE-1/stream",
    ] {
        let (status, body) = call(&st, get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        let json = parse_json(body);
        assert_eq!(json["error"], "NOT_FOUND");
        assert_eq!(json["external_id"], "NOPE-1");
    }
}

#[tokio::test]
async fn posted_records_are_queryable_by_any_linked_id() {
    let st = make_state();
    let (status, body) = call(
        &st,
        post_json(
            "/v1/records",
            json!([
                {"sourceRole": "originator", "qrCode": "Q1", "status": "pending",
                 "createdAt": "2024-03-01T00:00:00Z"},
                {"sourceRole": "laboratory", "qrCode": "Q1", "collectionId": "COL-9",
                 "status": "tested", "labTimestamp": "2024-03-03T00:00:00Z"}
            ]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["results"][0]["outcome"], "merged");
    assert_eq!(json["results"][1]["outcome"], "merged");
    assert_eq!(json["results"][1]["version"], 2);

    let (status, body) = call(&st, get("/v1/batches/COL-9")).await;
    assert_eq!(status, StatusCode::OK);
    let batch = parse_json(body);
    assert_eq!(batch["status"], "Tested");
    assert_eq!(batch["contributingSources"].as_array().unwrap().len(), 2);

    let (status, body) = call(&st, get("/v1/batches/Q1/timeline")).await;
    assert_eq!(status, StatusCode::OK);
    let tl = parse_json(body);
    assert_eq!(tl["version"], 2);
    assert_eq!(tl["identity"], batch["identity"]);
    let steps = tl["steps"].as_array().unwrap();
    // Not terminal yet: no Final step.
    assert_eq!(steps.len(), 4);
    assert_eq!(steps[2]["name"], "Lab Testing");
    assert_eq!(steps[2]["state"], "Completed");
}

// ---------------------------------------------------------------------------
// POST /v1/records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_single_record_is_422() {
    let st = make_state();
    let (status, body) = call(
        &st,
        post_json("/v1/records", json!({"sourceRole": "processor", "status": "processing"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let json = parse_json(body);
    assert!(json["error"].as_str().unwrap().contains("malformed record"));
    assert_eq!(st.engine.stats().await.identities, 0);
    assert_eq!(st.engine.stats().await.records_dropped, 1);
}

#[tokio::test]
async fn mixed_batch_reports_per_record_outcomes() {
    let st = make_state();
    let (status, body) = call(
        &st,
        post_json(
            "/v1/records?role=processor",
            json!([
                {"qrCode": "Q7", "status": "processing"},
                {"status": "processed"},
                {"qrCode": "Q7", "status": "processing"}
            ]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    let outcomes: Vec<&str> = json["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["outcome"].as_str().unwrap())
        .collect();
    assert_eq!(outcomes, vec!["merged", "dropped", "unchanged"]);
}

#[tokio::test]
async fn wrong_typed_record_is_counted_as_dropped() {
    let st = make_state();
    let (status, body) = call(
        &st,
        post_json(
            "/v1/records?role=laboratory",
            json!([
                {"qrCode": 12345, "status": "tested"},
                {"qrCode": "Q8", "status": "tested"}
            ]),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["results"][0]["outcome"], "dropped");
    assert!(json["results"][0]["error"]
        .as_str()
        .unwrap()
        .starts_with("malformed record at position 0"));
    assert_eq!(json["results"][1]["outcome"], "merged");

    let stats = st.engine.stats().await;
    assert_eq!(stats.records_dropped, 1);
    assert_eq!(stats.identities, 1);
}

#[tokio::test]
async fn unknown_role_query_is_422() {
    let st = make_state();
    let (status, _) = call(
        &st,
        post_json("/v1/records?role=wholesaler", json!({"qrCode": "Q1"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

// ---------------------------------------------------------------------------
// POST /v1/resync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resync_pulls_configured_sources() {
    let lab = Arc::new(InMemorySource::with_records(
        SourceRole::Laboratory,
        vec![RawBatchRecord {
            qr_code: Some("Q5".into()),
            status: Some("tested".into()),
            ..Default::default()
        }],
    ));
    let down = Arc::new(InMemorySource::new(SourceRole::Regulator));
    down.set_available(false);
    let sources: Vec<Arc<dyn RecordSource>> = vec![lab as Arc<dyn RecordSource>, down];
    let st = Arc::new(AppState::default().with_sources(sources, Duration::from_secs(1)));

    let (status, body) = call(&st, post_json("/v1/resync", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["identities_updated"], 1);
    assert_eq!(json["sources_skipped"], 1);

    let (status, _) = call(&st, get("/v1/batches/Q5")).await;
    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stream_delivers_batch_changed_events() {
    let st = make_state();
    let router = routes::build_router(Arc::clone(&st));
    let resp = router.oneshot(get("/v1/stream")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let raw = RawBatchRecord {
        qr_code: Some("Q9".into()),
        status: Some("processing".into()),
        ..Default::default()
    };
    st.engine.ingest_raw(raw, Some(SourceRole::Processor)).await;

    let mut body = resp.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("no SSE frame within timeout")
        .expect("stream ended")
        .expect("body error");
    let data = frame.into_data().expect("not a data frame");
    let text = String::from_utf8(data.to_vec()).unwrap();
    assert!(text.contains("event: batch_changed"), "{text}");
    assert!(text.contains("\"version\":1"), "{text}");
    assert!(text.contains("Q9"), "{text}");
}
