//! Delivery Worker (§4.8): a background loop that drains the offline queue
//! to the TAK server, with a reachability probe and cooperative shutdown.
//!
//! Grounded on the teacher's `persist_worker`/`afad_worker` background-task
//! shape: a `loop { tokio::select! { ... } }` driven by a `tokio::time::
//! interval`, spawned once from `main` and handed an `Arc` of shared state.
//! The teacher has no outbound HTTP client or cancellation signal, so the
//! `reqwest` push and the `tokio::sync::watch`-based shutdown are new here,
//! built in the same spawned-task idiom.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::audit::AuditLog;
use crate::auth::now_unix_secs;
use crate::models::{AuditKind, QueueStatus};
use crate::queue::{now_ms, OfflineQueue};

/// Principal attribution for audit events the worker appends on its own,
/// outside of any inbound request (§4.6 still requires a principal field).
const DELIVERY_PRINCIPAL: &str = "system:delivery-worker";

/// How many items a single drain pass pulls off the queue at once (§4.8).
const DEFAULT_BATCH_SIZE: usize = 100;

/// Reachability probe backoff bounds (§4.8): starts at 1s, doubles up to 30s
/// while the TAK server is unreachable.
const PROBE_MIN_SECS: u64 = 1;
const PROBE_MAX_SECS: u64 = 30;

pub struct DeliveryWorker {
    client: Client,
    tak_server_url: String,
    queue: Arc<OfflineQueue>,
    audit: Arc<AuditLog>,
    concurrency: usize,
    reachable: AtomicBool,
}

impl DeliveryWorker {
    pub fn new(
        tak_server_url: String,
        queue: Arc<OfflineQueue>,
        audit: Arc<AuditLog>,
        concurrency: usize,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            tak_server_url,
            queue,
            audit,
            concurrency: concurrency.max(1),
            reachable: AtomicBool::new(true),
        })
    }

    /// Pushes one rendered CoT event to the TAK server, classifying the
    /// outcome per §4.8's status-code table.
    async fn push_one(&self, xml: Vec<u8>) -> PushOutcome {
        let result = self
            .client
            .put(&self.tak_server_url)
            .header("Content-Type", "application/xml")
            .body(xml)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => PushOutcome::Synced,
            Ok(resp) => {
                let status = resp.status();
                if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    PushOutcome::Transient(format!("http {status}"))
                } else {
                    PushOutcome::Terminal(format!("http {status}"))
                }
            }
            Err(e) => PushOutcome::Transient(format!("transport error: {e}")),
        }
    }

    /// Drains up to `concurrency` in-flight pushes from one batch, applying
    /// each outcome back to the queue.
    #[instrument(skip_all)]
    async fn drain_once(&self, rng: &mut StdRng) -> anyhow::Result<usize> {
        let now = now_ms();
        let batch = self.queue.peek_batch(DEFAULT_BATCH_SIZE, now)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0usize;
        for chunk in batch.chunks(self.concurrency) {
            let futures = chunk.iter().map(|item| self.push_one(item.cot_xml.clone()));
            let outcomes = futures_join_all(futures).await;
            for (item, outcome) in chunk.iter().zip(outcomes) {
                let now_ms_ts = now_unix_secs() * 1000;
                match outcome {
                    PushOutcome::Synced => {
                        self.queue.mark_synced(item.seq)?;
                        self.audit.append(
                            item.detection_id,
                            AuditKind::Pushed,
                            now_ms_ts,
                            DELIVERY_PRINCIPAL,
                            json!({ "seq": item.seq }),
                        )?;
                        self.audit.append(
                            item.detection_id,
                            AuditKind::Synced,
                            now_ms_ts,
                            DELIVERY_PRINCIPAL,
                            json!({ "seq": item.seq }),
                        )?;
                        delivered += 1;
                    }
                    PushOutcome::Transient(reason) => {
                        let status = self.queue.mark_failed(item.seq, &reason, false, rng)?;
                        let kind = if status == QueueStatus::Failed { AuditKind::RetryExhausted } else { AuditKind::PushFailed };
                        self.audit.append(
                            item.detection_id,
                            kind,
                            now_ms_ts,
                            DELIVERY_PRINCIPAL,
                            json!({ "seq": item.seq, "reason": reason }),
                        )?;
                    }
                    PushOutcome::Terminal(reason) => {
                        self.queue.mark_failed(item.seq, &reason, true, rng)?;
                        self.audit.append(
                            item.detection_id,
                            AuditKind::RetryExhausted,
                            now_ms_ts,
                            DELIVERY_PRINCIPAL,
                            json!({ "seq": item.seq, "reason": reason }),
                        )?;
                    }
                }
            }
        }
        Ok(delivered)
    }

    /// Checks reachability with a lightweight `HEAD` against the TAK server,
    /// updating `reachable` for callers that want to surface it (e.g.
    /// `/ready`).
    async fn probe(&self) {
        let ok = self.client.head(&self.tak_server_url).send().await.is_ok();
        self.reachable.store(ok, Ordering::Relaxed);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    /// The worker's main loop: alternates reachability probing (with
    /// exponential backoff while unreachable) and draining the queue, until
    /// `shutdown` fires. On shutdown, any items still IN_FLIGHT are
    /// immediately drained back to PENDING with `attempts` unchanged (§4.8),
    /// rather than left for the next process's restart-time reclamation.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rng = StdRng::from_entropy();
        let mut probe_backoff = PROBE_MIN_SECS;
        let mut drain_interval = tokio::time::interval(Duration::from_millis(500));

        loop {
            tokio::select! {
                _ = drain_interval.tick() => {
                    if !self.is_reachable() {
                        continue;
                    }
                    match self.drain_once(&mut rng).await {
                        Ok(0) => {}
                        Ok(n) => info!(delivered = n, "delivery_batch_flushed"),
                        Err(e) => warn!(error = %e, "delivery_batch_failed"),
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(probe_backoff)) => {
                    self.probe().await;
                    probe_backoff = if self.is_reachable() {
                        PROBE_MIN_SECS
                    } else {
                        (probe_backoff * 2).min(PROBE_MAX_SECS)
                    };
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("delivery_worker_shutting_down");
                        match self.queue.cancel_in_flight() {
                            Ok(seqs) if !seqs.is_empty() => {
                                info!(count = seqs.len(), "delivery_worker_drained_in_flight");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "delivery_worker_drain_failed"),
                        }
                        break;
                    }
                }
            }
        }
    }
}

enum PushOutcome {
    Synced,
    Transient(String),
    Terminal(String),
}

/// Small local stand-in for `futures::future::join_all` so this module
/// doesn't need to pull in the `futures` crate for one call site.
async fn futures_join_all<F: std::future::Future>(iter: impl Iterator<Item = F>) -> Vec<F::Output> {
    let handles: Vec<_> = iter.collect();
    let mut out = Vec::with_capacity(handles.len());
    for fut in handles {
        out.push(fut.await);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn test_audit(dir: &std::path::Path) -> Arc<AuditLog> {
        Arc::new(AuditLog::open(dir.join("audit.log")).unwrap())
    }

    #[test]
    fn backoff_starts_low_and_caps_at_max() {
        let mut b = PROBE_MIN_SECS;
        for _ in 0..10 {
            b = (b * 2).min(PROBE_MAX_SECS);
        }
        assert_eq!(b, PROBE_MAX_SECS);
    }

    #[tokio::test]
    async fn drain_once_returns_zero_when_queue_is_empty() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(OfflineQueue::open(dir.path().join("q.bin"), 100).unwrap());
        let audit = test_audit(dir.path());
        let worker = DeliveryWorker::new("http://127.0.0.1:1/unreachable".to_string(), queue, audit, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let n = worker.drain_once(&mut rng).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn drain_once_marks_failed_on_unreachable_server() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(OfflineQueue::open(dir.path().join("q.bin"), 100).unwrap());
        let detection_id = Uuid::new_v4();
        let seq = queue.enqueue(detection_id, b"<event/>".to_vec()).unwrap();
        let audit = test_audit(dir.path());
        let worker =
            DeliveryWorker::new("http://127.0.0.1:1/unreachable".to_string(), queue.clone(), audit.clone(), 4).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        worker.drain_once(&mut rng).await.unwrap();
        // mark_failed(transient) flips it back to Pending with a future
        // next_attempt_at, so it won't show up in an immediate peek.
        let immediate = queue.peek_batch(10, now_ms()).unwrap();
        assert!(immediate.is_empty());
        let _ = seq;
        let _ = QueueStatus::Pending;

        let events = audit.scan(detection_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::PushFailed);
    }

    #[tokio::test]
    async fn cancel_in_flight_is_invoked_on_shutdown() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(OfflineQueue::open(dir.path().join("q.bin"), 100).unwrap());
        let seq = queue.enqueue(Uuid::new_v4(), b"<event/>".to_vec()).unwrap();
        queue.peek_batch(10, now_ms() + 1).unwrap(); // claims it -> InFlight
        let audit = test_audit(dir.path());
        let worker = Arc::new(
            DeliveryWorker::new("http://127.0.0.1:1/unreachable".to_string(), queue.clone(), audit, 4).unwrap(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        tx.send(true).unwrap();
        handle.await.unwrap();

        let batch = queue.peek_batch(10, now_ms() + 1).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, seq);
        assert_eq!(batch[0].attempts, 0);
    }
}
