//! Runtime: the composition root. Builds every long-lived component once
//! from a `Config` and holds them behind `Arc`s so request handlers and
//! background tasks can share them cheaply — the same role the teacher's
//! `AppState` plays, generalized from DashMaps-and-channels to this
//! gateway's durable stores and worker.

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::auth::{ApiKeyRecord, Authenticator};
use crate::config::Config;
use crate::delivery::DeliveryWorker;
use crate::queue::OfflineQueue;
use crate::ratelimit::RateLimiters;

#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<Config>,
    pub authenticator: Arc<Authenticator>,
    pub rate_limiters: Arc<RateLimiters>,
    pub audit: Arc<AuditLog>,
    pub queue: Arc<OfflineQueue>,
    pub delivery: Arc<DeliveryWorker>,
}

fn load_api_keys(path: &Option<std::path::PathBuf>) -> anyhow::Result<Vec<ApiKeyRecord>> {
    match path {
        None => Ok(Vec::new()),
        Some(p) => {
            let raw = std::fs::read(p)?;
            Ok(serde_json::from_slice(&raw)?)
        }
    }
}

impl Runtime {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let api_keys = load_api_keys(&config.api_key_store_path)?;
        let authenticator = Arc::new(Authenticator::new(&config.bearer_public_key_pem, api_keys)?);

        let rate_limiters = Arc::new(RateLimiters::new(config.rate_limit_authenticated, config.rate_limit_anonymous));

        let audit = Arc::new(AuditLog::open(&config.audit_path)?);
        let queue = Arc::new(OfflineQueue::open(&config.queue_path, config.queue_capacity)?);

        let delivery = Arc::new(DeliveryWorker::new(
            config.tak_server_url.clone(),
            queue.clone(),
            audit.clone(),
            config.push_concurrency,
        )?);

        Ok(Self {
            config,
            authenticator,
            rate_limiters,
            audit,
            queue,
            delivery,
        })
    }
}
