//! HTTP surface (§6): router assembly and request handlers. Grounded on the
//! teacher's `ingest`/`health`/`ready`/`metrics` handlers and its
//! `ServiceBuilder` layer stack, generalized from the teacher's raw
//! `(StatusCode, HeaderMap, Bytes)` tuples to typed `impl IntoResponse`
//! returns backed by `GatewayError`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::orchestrator::process_detection;
use crate::runtime::Runtime;

/// Request-scoped counters surfaced at `/metrics`, mirroring the teacher's
/// `Metrics` struct of plain `AtomicU64`s.
#[derive(Default)]
pub struct Metrics {
    pub ingested: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub rate_limited: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    pub runtime: Runtime,
    pub metrics: Arc<Metrics>,
}

#[derive(Serialize)]
struct IngestResponse {
    detection_id: Uuid,
    confidence_flag: &'static str,
    accuracy_m: f64,
    cot_xml: String,
}

fn request_id_header() -> (HeaderValue, String) {
    let id = Uuid::new_v4().to_string();
    (HeaderValue::from_str(&id).unwrap_or(HeaderValue::from_static("unknown")), id)
}

/// Stamps the `X-RateLimit-*` trio (§6) on an accepted response, matching the
/// same headers `GatewayError::RateLimited` carries on a 429.
fn insert_rate_limit_headers(resp: &mut axum::response::Response, limit: u32, remaining: u32, reset_at_s: u64) {
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&reset_at_s.to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
}

#[instrument(skip_all)]
async fn ingest_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let (request_id_value, request_id) = request_id_header();
    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok());

    state.metrics.ingested.fetch_add(1, Ordering::Relaxed);

    let result = process_detection(&state.runtime, authorization, addr.ip(), &request_id, body).await;

    let mut response = match result {
        Ok(outcome) => {
            state.metrics.accepted.fetch_add(1, Ordering::Relaxed);
            info!(detection_id = %outcome.detection_id, queue_seq = outcome.queue_seq, "detection_accepted");
            let rate_limit = (outcome.rate_limit_limit, outcome.rate_limit_remaining, outcome.rate_limit_reset_at_s);
            let mut resp = (
                StatusCode::CREATED,
                Json(IngestResponse {
                    detection_id: outcome.detection_id,
                    confidence_flag: outcome.confidence_class.as_flag(),
                    accuracy_m: outcome.accuracy_m,
                    cot_xml: outcome.cot_xml,
                }),
            )
                .into_response();
            insert_rate_limit_headers(&mut resp, rate_limit.0, rate_limit.1, rate_limit.2);
            resp
        }
        Err(GatewayError::RateLimited { retry_after_s, limit, reset_at_s }) => {
            state.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
            warn!(retry_after_s, "detection_rate_limited");
            GatewayError::RateLimited { retry_after_s, limit, reset_at_s }.into_response()
        }
        Err(e) => {
            state.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "detection_rejected");
            e.into_response()
        }
    };

    response.headers_mut().insert("X-Request-Id", request_id_value);
    let _ = request_id;
    response
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// `/ready` reflects both queue headroom and TAK-server reachability, so a
/// load balancer stops sending traffic if delivery has stalled (§6, §4.8).
async fn ready_handler(State(state): State<AppState>) -> StatusCode {
    let queue_has_room = state.runtime.queue.size() < state.runtime.config.queue_capacity;
    if queue_has_room {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Serialize)]
struct MetricsResponse {
    ingested: u64,
    accepted: u64,
    rejected: u64,
    rate_limited: u64,
    queue_size: usize,
    audit_len: usize,
    tak_reachable: bool,
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        ingested: state.metrics.ingested.load(Ordering::Relaxed),
        accepted: state.metrics.accepted.load(Ordering::Relaxed),
        rejected: state.metrics.rejected.load(Ordering::Relaxed),
        rate_limited: state.metrics.rate_limited.load(Ordering::Relaxed),
        queue_size: state.runtime.queue.size(),
        audit_len: state.runtime.audit.len(),
        tak_reachable: state.runtime.delivery.is_reachable(),
    })
}

/// Body-size ceiling for the whole request, comfortably above the 10 MiB
/// raw-image cap (§4.3) to account for base64 and JSON envelope overhead.
const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/detections", post(ingest_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES)),
        )
}
