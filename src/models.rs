//! Wire and domain types shared by every pipeline stage.
//!
//! These mirror the entities in the specification's data model: a `Detection`
//! is built once by the orchestrator after validation and never mutated; a
//! `GeoResult` and `CotEvent` are pure derivations of it; `QueueItem` and
//! `AuditEvent` are the two durable records the rest of the system persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pose and intrinsics of the camera that captured a detection.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct CameraMetadata {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
    pub heading_deg: f64,
    pub pitch_deg: f64,
    pub roll_deg: f64,
    pub focal_length_px: f64,
    pub sensor_width_mm: f64,
    pub sensor_height_mm: f64,
    pub image_width: u32,
    pub image_height: u32,
}

impl CameraMetadata {
    /// Range/sign checks from the data model (§3). Pure, no I/O.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err("latitude out of range");
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err("longitude out of range");
        }
        if self.focal_length_px <= 0.0 {
            return Err("focal_length_px must be > 0");
        }
        if self.sensor_width_mm <= 0.0 || self.sensor_height_mm <= 0.0 {
            return Err("sensor dimensions must be > 0");
        }
        if self.image_width == 0 || self.image_height == 0 {
            return Err("image dimensions must be > 0");
        }
        Ok(())
    }
}

/// Immutable detection record. Constructed only by the orchestrator, after
/// the sanitizer has accepted the raw payload.
#[derive(Clone, Debug)]
pub struct Detection {
    pub id: Uuid,
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

/// One of the three geolocation confidence bands (§3, §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceClass {
    Green,
    Yellow,
    Red,
}

impl ConfidenceClass {
    pub fn as_flag(self) -> &'static str {
        match self {
            ConfidenceClass::Green => "GREEN",
            ConfidenceClass::Yellow => "YELLOW",
            ConfidenceClass::Red => "RED",
        }
    }

    /// ARGB packed colour used by the CoT `<color>` element (§4.2).
    pub fn cot_color(self) -> i32 {
        match self {
            ConfidenceClass::Green => -65536,
            ConfidenceClass::Yellow => -256,
            ConfidenceClass::Red => -16711936,
        }
    }
}

/// Output of the Geolocator: a world point plus its quality bands.
#[derive(Clone, Debug)]
pub struct GeoResult {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f64,
    pub confidence_class: ConfidenceClass,
    pub algorithm_notes: String,
}

/// A fully rendered Cursor-on-Target event, ready for delivery.
#[derive(Clone, Debug)]
pub struct CotEvent {
    pub uid: String,
    pub cot_type: &'static str,
    pub time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub stale: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub hae: f64,
    pub ce: f64,
    pub le: f64,
    pub remarks: String,
    pub callsign: String,
    pub color: i32,
}

/// Lifecycle state of a queued CoT event (§3, §4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueueStatus {
    Pending = 0,
    InFlight = 1,
    Synced = 2,
    Failed = 3,
}

impl QueueStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Pending),
            1 => Some(Self::InFlight),
            2 => Some(Self::Synced),
            3 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A durable queue entry: one CoT event awaiting (or having completed)
/// delivery to the TAK server.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub seq: u64,
    pub detection_id: Uuid,
    pub cot_xml: Vec<u8>,
    pub enqueued_at_ms: u64,
    pub attempts: u8,
    pub next_attempt_at_ms: u64,
    pub last_error: String,
    pub status: QueueStatus,
}

/// A step in a detection's processing lifecycle, append-only (§3, §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    Ingested,
    ValidationFailed,
    Geolocated,
    GeolocationFailed,
    CotBuilt,
    Queued,
    QueueRejected,
    Pushed,
    PushFailed,
    Synced,
    RateLimited,
    AuthSuccess,
    AuthFailure,
    RetryExhausted,
}

#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub seq: u64,
    pub detection_id: Uuid,
    pub kind: AuditKind,
    pub timestamp_ms: u64,
    pub principal: String,
    pub attributes: serde_json::Value,
}

/// The kind of credential a caller presented (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrincipalKind {
    Bearer,
    ApiKey,
}

/// An authenticated caller, resolved fresh for every request.
#[derive(Clone, Debug)]
pub struct Principal {
    pub subject: String,
    pub kind: PrincipalKind,
    pub scopes: Vec<String>,
}

impl Principal {
    /// The key used to look up this principal's rate-limit bucket (§4.4).
    pub fn bucket_key(&self) -> String {
        let kind = match self.kind {
            PrincipalKind::Bearer => "bearer",
            PrincipalKind::ApiKey => "api_key",
        };
        format!("{kind}:{}", self.subject)
    }
}
