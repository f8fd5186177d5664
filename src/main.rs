//! AI-detection-to-Cursor-on-Target gateway: bootstrap and process wiring.
//!
//! Grounded on the teacher's `main()` — structured JSON logging via
//! `tracing_subscriber`, an explicit `Arc`-shared state struct, background
//! tasks spawned once at startup, `axum::serve(...).with_graceful_shutdown`
//! — generalized from the teacher's single persistence/relay worker pair to
//! this gateway's delivery worker plus a `tokio::sync::watch` cancellation
//! signal so shutdown can tell the worker to stop cleanly instead of being
//! killed mid-push.

mod auth;
mod audit;
mod cot;
mod config;
mod delivery;
mod error;
mod geolocate;
mod http;
mod models;
mod orchestrator;
mod queue;
mod ratelimit;
mod runtime;
mod sanitize;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::http::{build_router, AppState, Metrics};
use crate::runtime::Runtime;

/// Periodically drops rate-limit buckets untouched for two windows,
/// mirroring the teacher's `eviction()` task (`tokio::time::interval` +
/// `DashMap::retain`).
async fn eviction_task(limiters: Arc<crate::ratelimit::RateLimiters>) {
    let mut iv = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        iv.tick().await;
        let now = crate::queue::now_ms();
        let idle_for = std::time::Duration::from_secs(120);
        limiters.principal.evict_idle(now, idle_for);
        limiters.ip.evict_idle(now, idle_for);
    }
}

/// Enforces the queue's capacity pressure relief policy (§4.7, §7
/// `QueueFull`'s "drop policy"): once the active item count is at or over
/// capacity, drops the oldest eligible item and records the mandated
/// RETRY_EXHAUSTED audit event. A no-op tick when the queue has headroom.
async fn queue_capacity_task(queue: Arc<crate::queue::OfflineQueue>, audit: Arc<crate::audit::AuditLog>) {
    let mut iv = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        iv.tick().await;
        match queue.drop_oldest_pending() {
            Ok(Some((seq, detection_id))) => {
                warn!(seq, %detection_id, "queue_item_dropped_at_capacity");
                let append = audit.append(
                    detection_id,
                    crate::models::AuditKind::RetryExhausted,
                    crate::auth::now_unix_secs() * 1000,
                    "system:queue-gc",
                    serde_json::json!({ "seq": seq, "reason": "queue_at_capacity" }),
                );
                if let Err(e) = append {
                    error!(error = %e, "queue_capacity_drop_audit_failed");
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "queue_capacity_check_failed"),
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "cot_gateway=info,tower_http=info".to_string()))
        .json()
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    info!(version = env!("CARGO_PKG_VERSION"), "cot-gateway starting");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(64);
        }
    };
    let listen_addr = config.listen_addr;

    let runtime = match Runtime::build(config) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to initialize runtime: {e}");
            std::process::exit(70);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let delivery_worker = runtime.delivery.clone();
    let delivery_task = tokio::spawn(delivery_worker.run(shutdown_rx));
    tokio::spawn(eviction_task(runtime.rate_limiters.clone()));
    tokio::spawn(queue_capacity_task(runtime.queue.clone(), runtime.audit.clone()));

    let state = AppState { runtime, metrics: Arc::new(Metrics::default()) };
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind {listen_addr}: {e}");
            std::process::exit(70);
        }
    };
    info!(%listen_addr, "listening");

    let serve_result = axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received, draining");
        })
        .await;

    if let Err(e) = serve_result {
        error!(error = %e, "server error");
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(std::time::Duration::from_secs(10), delivery_task).await.is_err() {
        error!("delivery worker did not stop within drain window");
    }
}
