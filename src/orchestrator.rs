//! Pipeline Orchestrator (§4.9): composes every stage — auth, rate limit,
//! sanitize, geolocate, build CoT, durably enqueue and audit — into the one
//! call a request handler makes. Grounded on the teacher's `ingest()`
//! handler, which runs the exact same kind of linear validate-then-reject
//! chain (size check, signature check, dedup, rate limits, confidence
//! scoring) before doing any lasting work; generalized here into a
//! standalone function returning a typed `Result` instead of constructing
//! response tuples inline, since this gateway's error type already carries
//! its own HTTP mapping (`error.rs`).

use std::net::IpAddr;

use serde_json::json;
use uuid::Uuid;

use crate::auth::now_unix_secs;
use crate::cot::{build_cot_event, render_cot_xml};
use crate::error::{GatewayError, GatewayResult};
use crate::geolocate::geolocate;
use crate::models::{AuditKind, ConfidenceClass, Detection};
use crate::queue::now_ms;
use crate::runtime::Runtime;
use crate::sanitize::{sanitize, DetectionRequest};

pub struct IngestOutcome {
    pub detection_id: Uuid,
    pub queue_seq: u64,
    pub confidence_class: ConfidenceClass,
    pub accuracy_m: f64,
    pub cot_xml: String,
    pub rate_limit_remaining: u32,
    pub rate_limit_limit: u32,
    pub rate_limit_reset_at_s: u64,
}

fn to_internal(e: impl std::error::Error + Send + Sync + 'static) -> GatewayError {
    GatewayError::Internal(anyhow::Error::new(e))
}

/// Merges `request_id` into an audit attributes payload so every recorded
/// event can be traced back to the inbound HTTP request that caused it.
fn with_request_id(mut attrs: serde_json::Value, request_id: &str) -> serde_json::Value {
    if let serde_json::Value::Object(map) = &mut attrs {
        map.insert("request_id".to_string(), json!(request_id));
    }
    attrs
}

/// Runs the full pipeline for one inbound detection. Every rejection is
/// audited under the detection id assigned at the top, so a caller can
/// later `scan()` the audit log and see exactly where a given submission
/// was accepted or turned away (§4.6, §4.9).
pub async fn process_detection(
    runtime: &Runtime,
    authorization: Option<&str>,
    client_ip: IpAddr,
    request_id: &str,
    raw: serde_json::Value,
) -> GatewayResult<IngestOutcome> {
    crate::sanitize::check_nesting_depth(&raw)?;

    let principal = runtime.authenticator.authenticate(authorization)?;

    let now = now_ms();
    let principal_decision = runtime.rate_limiters.principal.check(&principal.bucket_key(), now);
    if !principal_decision.allowed {
        return Err(GatewayError::RateLimited {
            retry_after_s: principal_decision.retry_after_s,
            limit: principal_decision.limit,
            reset_at_s: now_unix_secs() + principal_decision.reset_after_s,
        });
    }
    let ip_decision = runtime.rate_limiters.ip.check(&client_ip.to_string(), now);
    if !ip_decision.allowed {
        return Err(GatewayError::RateLimited {
            retry_after_s: ip_decision.retry_after_s,
            limit: ip_decision.limit,
            reset_at_s: now_unix_secs() + ip_decision.reset_after_s,
        });
    }

    let req: DetectionRequest = serde_json::from_value(raw)
        .map_err(|e| GatewayError::Validation { code: "E_FIELD_MISSING", detail: e.to_string() })?;

    let sanitized = sanitize(req)?;

    let detection_id = Uuid::new_v4();
    let detection = Detection {
        id: detection_id,
        image_len: sanitized.image_len,
        pixel_x: sanitized.pixel_x,
        pixel_y: sanitized.pixel_y,
        object_class: sanitized.object_class,
        ai_confidence: sanitized.ai_confidence,
        source: sanitized.source,
        camera_id: sanitized.camera_id,
        capture_time: sanitized.capture_time,
        camera: sanitized.camera,
    };

    runtime
        .audit
        .append(
            detection_id,
            AuditKind::Ingested,
            now_unix_secs() * 1000,
            &principal.subject,
            with_request_id(json!({ "source": detection.source, "camera_id": detection.camera_id }), request_id),
        )
        .map_err(to_internal)?;

    let geo = match geolocate(&detection.camera, detection.pixel_x, detection.pixel_y, detection.ai_confidence) {
        Ok(geo) => geo,
        Err(e) => {
            runtime
                .audit
                .append(
                    detection_id,
                    AuditKind::GeolocationFailed,
                    now_unix_secs() * 1000,
                    &principal.subject,
                    with_request_id(json!({ "reason": e.code() }), request_id),
                )
                .map_err(to_internal)?;
            return Err(GatewayError::Geolocation { reason: e.code() });
        }
    };

    runtime
        .audit
        .append(
            detection_id,
            AuditKind::Geolocated,
            now_unix_secs() * 1000,
            &principal.subject,
            with_request_id(json!({ "confidence_class": geo.confidence_class.as_flag(), "accuracy_m": geo.accuracy_m }), request_id),
        )
        .map_err(to_internal)?;

    let capture_time = detection.capture_time;
    let now_utc = chrono::Utc::now();
    let event = build_cot_event(detection_id, &detection.object_class, detection.ai_confidence, &geo, capture_time, now_utc);
    let xml = render_cot_xml(&event);

    runtime
        .audit
        .append(
            detection_id,
            AuditKind::CotBuilt,
            now_unix_secs() * 1000,
            &principal.subject,
            with_request_id(json!({ "cot_type": event.cot_type }), request_id),
        )
        .map_err(to_internal)?;

    let queue_seq = match runtime.queue.enqueue(detection_id, xml.clone().into_bytes()) {
        Ok(seq) => seq,
        Err(crate::queue::QueueError::Full) => {
            runtime
                .audit
                .append(detection_id, AuditKind::QueueRejected, now_unix_secs() * 1000, &principal.subject, with_request_id(json!({}), request_id))
                .map_err(to_internal)?;
            return Err(GatewayError::QueueFull);
        }
        Err(e) => return Err(to_internal(e)),
    };

    runtime
        .audit
        .append(
            detection_id,
            AuditKind::Queued,
            now_unix_secs() * 1000,
            &principal.subject,
            with_request_id(json!({ "queue_seq": queue_seq }), request_id),
        )
        .map_err(to_internal)?;

    Ok(IngestOutcome {
        detection_id,
        queue_seq,
        confidence_class: geo.confidence_class,
        accuracy_m: geo.accuracy_m,
        cot_xml: xml,
        rate_limit_remaining: principal_decision.remaining,
        rate_limit_limit: principal_decision.limit,
        rate_limit_reset_at_s: now_unix_secs() + principal_decision.reset_after_s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKeyRecord;
    use crate::config::Config;
    use crate::delivery::DeliveryWorker;
    use crate::runtime::Runtime;
    use sha2::{Digest, Sha256};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn public_key_pem() -> Vec<u8> {
        b"-----BEGIN PUBLIC KEY-----\n\
MCowBQYDK2VwAyEA5VHmOPFFBtQq7EwiFWKZQLl6Vz2QM0dqHhVmZ2PFyU0=\n\
-----END PUBLIC KEY-----\n"
            .to_vec()
    }

    fn test_runtime(dir: &std::path::Path) -> Runtime {
        let mut hasher = Sha256::new();
        hasher.update(b"test-api-key");
        let hash_hex = hex::encode(hasher.finalize());

        let authenticator = Arc::new(
            crate::auth::Authenticator::new(
                &public_key_pem(),
                vec![ApiKeyRecord { hash_hex, subject: "tester".into(), scopes: vec!["ingest".into()], revoked_at: None }],
            )
            .unwrap(),
        );
        let rate_limiters = Arc::new(crate::ratelimit::RateLimiters::new(100, 10));
        let audit = Arc::new(crate::audit::AuditLog::open(dir.join("audit.log")).unwrap());
        let queue = Arc::new(crate::queue::OfflineQueue::open(dir.join("q.bin"), 100).unwrap());
        let delivery = Arc::new(
            DeliveryWorker::new("http://127.0.0.1:1/unreachable".to_string(), queue.clone(), audit.clone(), 4).unwrap(),
        );
        let config = Arc::new(Config {
            listen_addr: "0.0.0.0:8000".parse().unwrap(),
            tak_server_url: "http://127.0.0.1:1/unreachable".to_string(),
            queue_path: dir.join("q.bin"),
            audit_path: dir.join("audit.log"),
            bearer_public_key_pem: public_key_pem(),
            api_key_store_path: None,
            rate_limit_authenticated: 100,
            rate_limit_anonymous: 10,
            queue_capacity: 100,
            push_concurrency: 4,
        });
        Runtime { config, authenticator, rate_limiters, audit, queue, delivery }
    }

    fn valid_payload() -> serde_json::Value {
        json!({
            "image_base64": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"fake"),
            "pixel_x": 960,
            "pixel_y": 720,
            "object_class": "vehicle",
            "ai_confidence": 0.92,
            "source": "drone-1",
            "camera_id": "cam-1",
            "timestamp": "2026-01-01T00:00:00Z",
            "sensor_metadata": {
                "latitude": 40.7128,
                "longitude": -74.0060,
                "elevation_m": 100.0,
                "heading_deg": 0.0,
                "pitch_deg": -90.0,
                "roll_deg": 0.0,
                "focal_length_px": 3000.0,
                "sensor_width_mm": 6.4,
                "sensor_height_mm": 4.8,
                "image_width": 1920,
                "image_height": 1440
            }
        })
    }

    #[tokio::test]
    async fn full_pipeline_enqueues_and_audits_a_valid_detection() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

        let outcome = process_detection(&runtime, Some("ApiKey test-api-key"), ip, "test-request-id", valid_payload())
            .await
            .unwrap();
        assert_eq!(outcome.confidence_class, ConfidenceClass::Green);
        assert_eq!(runtime.queue.size(), 1);

        let events = runtime.audit.scan(outcome.detection_id);
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![AuditKind::Ingested, AuditKind::Geolocated, AuditKind::CotBuilt, AuditKind::Queued]
        );
    }

    #[tokio::test]
    async fn rejects_without_valid_credentials() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let err = process_detection(&runtime, None, ip, "test-request-id", valid_payload()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication));
    }

    #[tokio::test]
    async fn geolocation_failure_is_audited_and_surfaced() {
        let dir = tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

        let mut payload = valid_payload();
        payload["sensor_metadata"]["pitch_deg"] = json!(0.0); // level horizon -> ray parallel

        let err = process_detection(&runtime, Some("ApiKey test-api-key"), ip, "test-request-id", payload)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Geolocation { .. }));
    }
}
