//! Sanitizer / Validator (§4.3): pure checks on inbound detection payloads.
//!
//! This is the only place that accepts raw, untrusted payload shapes and the
//! only place that produces a `ValidationError` — everywhere downstream
//! works with the already-validated `Detection` record.

use std::sync::OnceLock;

use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::models::CameraMetadata;

/// Inbound JSON body for `POST /api/v1/detections` (§6).
#[derive(Debug, Deserialize)]
pub struct DetectionRequest {
    pub image_base64: String,
    pub pixel_x: i64,
    pub pixel_y: i64,
    pub object_class: String,
    pub ai_confidence: f64,
    pub source: String,
    pub camera_id: String,
    pub timestamp: String,
    pub sensor_metadata: CameraMetadata,
}

const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const MAX_STRING_FIELD_LEN: usize = 255;
const MAX_OBJECT_CLASS_LEN: usize = 64;
const MAX_SOURCE_LEN: usize = 128;
const MAX_CAMERA_ID_LEN: usize = 128;
const MAX_NESTING_DEPTH: usize = 32;

/// Sanitized, structurally valid payload, still missing nothing the
/// orchestrator needs to build a `Detection`.
pub struct Sanitized {
    pub image_len: usize,
    pub pixel_x: u32,
    pub pixel_y: u32,
    pub object_class: String,
    pub ai_confidence: f64,
    pub source: String,
    pub camera_id: String,
    pub capture_time: DateTime<Utc>,
    pub camera: CameraMetadata,
}

fn identifier_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\x20-\x7E]*$").expect("identifier pattern compiles"))
}

fn validation_err(code: &'static str, detail: impl Into<String>) -> GatewayError {
    GatewayError::Validation {
        code,
        detail: detail.into(),
    }
}

fn check_string_field(name: &str, value: &str, max_len: usize) -> Result<String, GatewayError> {
    let trimmed = value.trim();
    if trimmed.contains('\0') {
        return Err(validation_err("E_BAD_ENCODING", format!("{name} contains NUL byte")));
    }
    if trimmed.chars().count() > max_len {
        return Err(validation_err("E_FIELD_RANGE", format!("{name} exceeds {max_len} characters")));
    }
    if !identifier_pattern().is_match(trimmed) {
        return Err(validation_err("E_BAD_ENCODING", format!("{name} contains non-printable characters")));
    }
    Ok(trimmed.to_string())
}

fn depth_of(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        serde_json::Value::Object(map) => 1 + map.values().map(depth_of).max().unwrap_or(0),
        _ => 0,
    }
}

/// Validates the raw JSON body before it is even deserialized into
/// `DetectionRequest`, catching pathological nesting that a typed
/// deserializer would otherwise recurse through.
pub fn check_nesting_depth(raw: &serde_json::Value) -> Result<(), GatewayError> {
    if depth_of(raw) > MAX_NESTING_DEPTH {
        return Err(validation_err("E_FIELD_RANGE", "payload nesting exceeds maximum depth"));
    }
    Ok(())
}

/// Runs every check from §3/§4.3 against a parsed request body. On success,
/// returns a `Sanitized` record ready for the orchestrator to turn into a
/// `Detection`. Content is never transformed beyond trimming whitespace on
/// identifier fields — any violation rejects the whole payload.
pub fn sanitize(req: DetectionRequest) -> Result<Sanitized, GatewayError> {
    let image_bytes = base64::engine::general_purpose::STANDARD
        .decode(req.image_base64.as_bytes())
        .map_err(|e| validation_err("E_BAD_ENCODING", format!("image_base64 is not valid base64: {e}")))?;
    if image_bytes.len() > MAX_IMAGE_BYTES {
        return Err(GatewayError::PayloadTooLarge);
    }

    if req.pixel_x < 0 || req.pixel_y < 0 {
        return Err(validation_err("E_FIELD_RANGE", "pixel coordinates must be non-negative"));
    }
    let camera = req.sensor_metadata;
    camera.validate().map_err(|e| validation_err("E_FIELD_RANGE", e))?;

    let pixel_x = req.pixel_x as u32;
    let pixel_y = req.pixel_y as u32;
    if pixel_x as u64 >= camera.image_width as u64 || pixel_y as u64 >= camera.image_height as u64 {
        return Err(validation_err("E_FIELD_RANGE", "pixel coordinates out of image bounds"));
    }

    if !(0.0..=1.0).contains(&req.ai_confidence) {
        return Err(validation_err("E_FIELD_RANGE", "ai_confidence must be in [0,1]"));
    }

    let object_class = check_string_field("object_class", &req.object_class, MAX_OBJECT_CLASS_LEN)?;
    let source = check_string_field("source", &req.source, MAX_SOURCE_LEN)?;
    let camera_id = check_string_field("camera_id", &req.camera_id, MAX_CAMERA_ID_LEN)?;
    if object_class.is_empty() || source.is_empty() || camera_id.is_empty() {
        return Err(validation_err("E_FIELD_MISSING", "required identifier field is empty"));
    }

    let capture_time = DateTime::parse_from_rfc3339(&req.timestamp)
        .map_err(|e| validation_err("E_BAD_ENCODING", format!("timestamp is not RFC 3339: {e}")))?
        .with_timezone(&Utc);

    let _ = MAX_STRING_FIELD_LEN; // reserved for free-text fields beyond the identifiers above

    Ok(Sanitized {
        image_len: image_bytes.len(),
        pixel_x,
        pixel_y,
        object_class,
        ai_confidence: req.ai_confidence,
        source,
        camera_id,
        capture_time,
        camera,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_camera() -> CameraMetadata {
        CameraMetadata {
            latitude: 40.7128,
            longitude: -74.0060,
            elevation_m: 100.0,
            heading_deg: 0.0,
            pitch_deg: -90.0,
            roll_deg: 0.0,
            focal_length_px: 3000.0,
            sensor_width_mm: 6.4,
            sensor_height_mm: 4.8,
            image_width: 1920,
            image_height: 1440,
        }
    }

    fn valid_request() -> DetectionRequest {
        DetectionRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(b"fake-jpeg-bytes"),
            pixel_x: 960,
            pixel_y: 720,
            object_class: "vehicle".to_string(),
            ai_confidence: 0.92,
            source: "drone-1".to_string(),
            camera_id: "cam-1".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            sensor_metadata: valid_camera(),
        }
    }

    #[test]
    fn accepts_a_well_formed_request() {
        let s = sanitize(valid_request()).unwrap();
        assert_eq!(s.pixel_x, 960);
        assert_eq!(s.object_class, "vehicle");
    }

    #[test]
    fn rejects_pixel_outside_image_bounds() {
        let mut req = valid_request();
        req.pixel_x = 5000;
        let err = sanitize(req).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { code: "E_FIELD_RANGE", .. }));
    }

    #[test]
    fn rejects_confidence_outside_unit_interval() {
        let mut req = valid_request();
        req.ai_confidence = 1.5;
        let err = sanitize(req).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { code: "E_FIELD_RANGE", .. }));
    }

    #[test]
    fn rejects_oversized_image() {
        let mut req = valid_request();
        let huge = vec![0u8; MAX_IMAGE_BYTES + 1];
        req.image_base64 = base64::engine::general_purpose::STANDARD.encode(&huge);
        let err = sanitize(req).unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge));
    }

    #[test]
    fn rejects_string_field_over_length() {
        let mut req = valid_request();
        req.object_class = "x".repeat(MAX_OBJECT_CLASS_LEN + 1);
        let err = sanitize(req).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { code: "E_FIELD_RANGE", .. }));
    }

    #[test]
    fn rejects_nul_byte_in_string_field() {
        let mut req = valid_request();
        req.source = "drone\0one".to_string();
        let err = sanitize(req).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { code: "E_BAD_ENCODING", .. }));
    }

    #[test]
    fn trims_whitespace_on_identifier_fields_without_other_mutation() {
        let mut req = valid_request();
        req.source = "  drone-1  ".to_string();
        let s = sanitize(req).unwrap();
        assert_eq!(s.source, "drone-1");
    }

    #[test]
    fn rejects_malformed_timestamp() {
        let mut req = valid_request();
        req.timestamp = "not-a-date".to_string();
        let err = sanitize(req).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { code: "E_BAD_ENCODING", .. }));
    }

    #[test]
    fn nesting_depth_guard_rejects_deep_payloads() {
        let mut v = serde_json::json!(1);
        for _ in 0..(MAX_NESTING_DEPTH + 2) {
            v = serde_json::json!([v]);
        }
        assert!(check_nesting_depth(&v).is_err());
    }

    #[test]
    fn nesting_depth_guard_accepts_shallow_payloads() {
        let v = serde_json::json!({"a": [1, 2, {"b": 3}]});
        assert!(check_nesting_depth(&v).is_ok());
    }
}
