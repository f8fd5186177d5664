//! CoT Builder (§4.2): a pure transform from a geolocated detection into the
//! bit-exact Cursor-on-Target XML event described in spec §6.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{CotEvent, GeoResult};

/// Default and clamp bounds for `stale - start` (§3).
const DEFAULT_STALE_SECS: i64 = 5 * 60;
const MIN_STALE_SECS: i64 = 1;
const MAX_STALE_SECS: i64 = 60 * 60;

/// Closed object-class -> CoT type table (§4.2). Classes not present here map
/// to the generic point-of-interest type.
const COT_TYPE_TABLE: &[(&str, &str)] = &[
    ("vehicle", "b-m-p-s-u-c"),
    ("person", "b-m-p-s-p-i"),
    ("aircraft", "b-m-p-s-a"),
    ("vessel", "b-m-p-s-x"),
    ("weapon", "b-m-p-w"),
    ("structure", "b-m-p-s-s"),
    ("animal", "b-m-p-s-p-loc"),
];

const DEFAULT_COT_TYPE: &str = "b-m-p-s-p-loc";

fn cot_type_for(object_class: &str) -> &'static str {
    COT_TYPE_TABLE
        .iter()
        .find(|(class, _)| *class == object_class)
        .map(|(_, cot_type)| *cot_type)
        .unwrap_or(DEFAULT_COT_TYPE)
}

/// Builds the `CotEvent` for a geolocated detection. Pure: no I/O, no clocks
/// beyond the supplied `capture_time`/`now`.
pub fn build_cot_event(
    detection_id: Uuid,
    object_class: &str,
    ai_confidence: f64,
    geo: &GeoResult,
    capture_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> CotEvent {
    let stale_secs = DEFAULT_STALE_SECS.clamp(MIN_STALE_SECS, MAX_STALE_SECS);
    let uid = format!("Detection.{detection_id}");
    // The UUID's canonical form starts with 8 hex characters before the
    // first hyphen; that's the "uuid-short" used for the contact callsign.
    let uid_short: String = detection_id.simple().to_string().chars().take(8).collect();

    let remarks = format!(
        "AI Detection: {object_class} | AI Confidence: {:.0}% | Geo Confidence: {} | Accuracy: \u{00b1}{:.1}m",
        ai_confidence * 100.0,
        geo.confidence_class.as_flag(),
        geo.accuracy_m,
    );

    CotEvent {
        uid,
        cot_type: cot_type_for(object_class),
        time: capture_time,
        start: now,
        stale: now + Duration::seconds(stale_secs),
        lat: geo.lat,
        lon: geo.lon,
        hae: 0.0,
        ce: geo.accuracy_m,
        le: 9_999_999.0,
        remarks,
        callsign: format!("Detection-{uid_short}"),
        color: geo.confidence_class.cot_color(),
    }
}

fn iso8601(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Serializes a `CotEvent` to the exact XML layout specified in spec §6.
pub fn render_cot_xml(event: &CotEvent) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<event version=\"2.0\" uid=\"{uid}\" type=\"{cot_type}\"\n\
       time=\"{time}\" start=\"{start}\" stale=\"{stale}\">\n\
  <point lat=\"{lat:.7}\" lon=\"{lon:.7}\" hae=\"{hae:.1}\"\n\
         ce=\"{ce:.1}\" le=\"{le:.1}\"/>\n\
  <detail>\n\
    <contact callsign=\"{callsign}\"/>\n\
    <color value=\"{color}\"/>\n\
    <remarks>{remarks}</remarks>\n\
  </detail>\n\
</event>",
        uid = xml_escape(&event.uid),
        cot_type = event.cot_type,
        time = iso8601(event.time),
        start = iso8601(event.start),
        stale = iso8601(event.stale),
        lat = event.lat,
        lon = event.lon,
        hae = event.hae,
        ce = event.ce,
        le = event.le,
        callsign = xml_escape(&event.callsign),
        color = event.color,
        remarks = xml_escape(&event.remarks),
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfidenceClass;

    fn geo(accuracy_m: f64, class: ConfidenceClass) -> GeoResult {
        GeoResult {
            lat: 40.7128,
            lon: -74.0060,
            accuracy_m,
            confidence_class: class,
            algorithm_notes: String::new(),
        }
    }

    #[test]
    fn vehicle_maps_to_expected_type_and_color() {
        let id = Uuid::nil();
        let now = Utc::now();
        let event = build_cot_event(id, "vehicle", 0.92, &geo(0.5, ConfidenceClass::Green), now, now);
        assert_eq!(event.cot_type, "b-m-p-s-u-c");
        assert_eq!(event.color, -65536);
        assert!((event.ce - 0.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_class_maps_to_default_type() {
        let id = Uuid::nil();
        let now = Utc::now();
        let event = build_cot_event(id, "blimp", 0.6, &geo(12.0, ConfidenceClass::Yellow), now, now);
        assert_eq!(event.cot_type, "b-m-p-s-p-loc");
        assert_eq!(event.color, -256);
    }

    #[test]
    fn stale_defaults_to_five_minutes_after_start() {
        let id = Uuid::nil();
        let now = Utc::now();
        let event = build_cot_event(id, "vehicle", 0.92, &geo(0.5, ConfidenceClass::Green), now, now);
        assert_eq!((event.stale - event.start).num_seconds(), 300);
    }

    #[test]
    fn xml_contains_required_attributes_and_trailing_z() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let event = build_cot_event(id, "vehicle", 0.92, &geo(0.5, ConfidenceClass::Green), now, now);
        let xml = render_cot_xml(&event);
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(&format!("uid=\"{}\"", event.uid)));
        assert!(xml.contains("type=\"b-m-p-s-u-c\""));
        assert!(xml.contains("ce=\"0.5\""));
        assert!(xml.contains("le=\"9999999.0\""));
        assert!(xml.contains("color value=\"-65536\""));
        assert!(xml.ends_with("</event>"));
        assert!(xml.contains("Z\" start=") || xml.matches('Z').count() >= 3);
    }

    #[test]
    fn remarks_contains_four_required_fields() {
        let id = Uuid::nil();
        let now = Utc::now();
        let event = build_cot_event(id, "vehicle", 0.92, &geo(0.5, ConfidenceClass::Green), now, now);
        assert!(event.remarks.contains("AI Detection: vehicle"));
        assert!(event.remarks.contains("AI Confidence: 92%"));
        assert!(event.remarks.contains("Geo Confidence: GREEN"));
        assert!(event.remarks.contains("Accuracy: \u{00b1}0.5m"));
    }
}
