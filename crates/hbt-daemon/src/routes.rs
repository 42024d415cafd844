//! Axum router and all HTTP handlers for hbt-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Tests compose the bare router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, Stream};
use serde_json::Value;
use tracing::{info, warn};

use hbt_engine::{QueryError, Subscription, SubscriptionFilter};
use hbt_reconcile::decode_raw_record;
use hbt_schemas::SourceRole;

use crate::{
    api_types::{
        ErrorResponse, HealthResponse, IngestResponse, IngestResult, RecordsQuery,
        TimelineResponse,
    },
    state::{uptime_secs, AppState},
};

/// SSE event name for every published change.
pub const CHANGE_EVENT_NAME: &str = "batch_changed";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stats", get(stats))
        .route("/v1/batches/:external_id", get(get_batch))
        .route("/v1/batches/:external_id/timeline", get(get_timeline))
        .route("/v1/batches/:external_id/stream", get(batch_stream))
        .route("/v1/records", post(post_records))
        .route("/v1/resync", post(resync))
        .route("/v1/stream", get(stream_all))
        .with_state(state)
}

fn query_error(err: QueryError) -> Response {
    match err {
        QueryError::NotFound { external_id } => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "NOT_FOUND".to_string(),
                external_id: Some(external_id),
            }),
        )
            .into_response(),
    }
}

fn unprocessable(error: String) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ErrorResponse {
            error,
            external_id: None,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health  /v1/stats
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
            uptime_secs: uptime_secs(),
            config_hash: st.config_hash.clone(),
        }),
    )
}

pub(crate) async fn stats(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.engine.stats().await))
}

// ---------------------------------------------------------------------------
// GET /v1/batches/:external_id[/timeline]
// ---------------------------------------------------------------------------

pub(crate) async fn get_batch(
    State(st): State<Arc<AppState>>,
    Path(external_id): Path<String>,
) -> Response {
    match st.engine.get_canonical_batch(&external_id).await {
        Ok(batch) => (StatusCode::OK, Json(batch)).into_response(),
        Err(e) => query_error(e),
    }
}

pub(crate) async fn get_timeline(
    State(st): State<Arc<AppState>>,
    Path(external_id): Path<String>,
) -> Response {
    match st.engine.get_batch_view(&external_id).await {
        Ok(view) => (
            StatusCode::OK,
            Json(TimelineResponse {
                identity: view.batch.identity,
                version: view.version,
                steps: view.timeline,
            }),
        )
            .into_response(),
        Err(e) => query_error(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/records
// ---------------------------------------------------------------------------

/// Ingest one raw record or an array of them.
///
/// Responds 200 with per-record outcomes when at least one record was
/// accepted (or the array was empty), 422 when every record was dropped.
pub(crate) async fn post_records(
    State(st): State<Arc<AppState>>,
    Query(q): Query<RecordsQuery>,
    Json(body): Json<Value>,
) -> Response {
    let role_hint = match q.role.as_deref() {
        None => None,
        Some(raw) => match SourceRole::parse(raw) {
            Some(r) => Some(r),
            None => return unprocessable(format!("unknown role '{raw}'")),
        },
    };

    let items = match body {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut results = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let outcome = match decode_raw_record(index, item) {
            Ok(raw) => st.engine.ingest_raw(raw, role_hint).await,
            Err(e) => st.engine.drop_malformed(e.to_string(), role_hint, e.ids()).await,
        };
        results.push(IngestResult::from(outcome));
    }

    let accepted = results.iter().filter(|r| !r.is_dropped()).count();
    info!(posted = results.len(), accepted, "records/post");
    if accepted == 0 && !results.is_empty() {
        let error = results
            .iter()
            .filter_map(|r| r.error.clone())
            .collect::<Vec<_>>()
            .join("; ");
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": error, "results": results })),
        )
            .into_response();
    }
    (StatusCode::OK, Json(IngestResponse { results })).into_response()
}

// ---------------------------------------------------------------------------
// POST /v1/resync
// ---------------------------------------------------------------------------

pub(crate) async fn resync(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let report = st
        .engine
        .resync(st.sources.as_slice(), st.source_timeout)
        .await;
    (StatusCode::OK, Json(report))
}

// ---------------------------------------------------------------------------
// GET /v1/stream  /v1/batches/:external_id/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream_all(State(st): State<Arc<AppState>>) -> Response {
    let sub = st.engine.subscribe(SubscriptionFilter::All).await;
    sse_response(sub)
}

pub(crate) async fn batch_stream(
    State(st): State<Arc<AppState>>,
    Path(external_id): Path<String>,
) -> Response {
    match st.engine.subscribe_to(&external_id).await {
        Ok(sub) => sse_response(sub),
        Err(e) => query_error(e),
    }
}

fn sse_response(sub: Subscription) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let events = subscription_to_sse(sub);
    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

/// Fresh events only; duplicates and stale versions never reach the client.
fn subscription_to_sse(sub: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(sub, |mut sub| async move {
        loop {
            let ev = sub.next_fresh().await?;
            match serde_json::to_string(&ev) {
                Ok(data) => {
                    let event = Event::default()
                        .event(CHANGE_EVENT_NAME)
                        .id(format!("{}:{}", ev.identity, ev.version))
                        .data(data);
                    return Some((Ok(event), sub));
                }
                Err(e) => {
                    warn!(identity = %ev.identity, error = %e, "change event not serializable")
                }
            }
        }
    })
}
