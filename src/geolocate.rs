//! Geolocator: single-image photogrammetry (§4.1).
//!
//! Pure function from `(CameraMetadata, pixel)` to a `GeoResult`. No I/O, no
//! shared state — safe to call concurrently from every request task.
//!
//! The camera ray is built in the pinhole model the spec prescribes, then
//! rotated into a local East-North-Up frame anchored at the camera's own
//! geodetic position. The ground is the horizontal plane through the camera's
//! local origin, offset down by the camera's elevation; intersecting the ray
//! with that plane gives the world point, which is then converted back to
//! lat/lon with a spherical-earth approximation.

use nalgebra::Vector3;
use thiserror::Error;

use crate::models::{CameraMetadata, ConfidenceClass, GeoResult};

/// Mean earth radius used for the spherical ENU<->geodetic approximation (§4.1).
const R_EARTH_M: f64 = 6_371_008.8;

/// Per-pixel angular uncertainty backing the accuracy-radius propagation (§4.1).
const SIGMA_PX: f64 = 1.0;

/// Floor applied to the propagated accuracy radius (§4.1).
const MIN_ACCURACY_M: f64 = 0.5;

/// Degenerate-ray threshold: below this the ray is treated as parallel to the
/// ground plane (§4.1).
const RAY_PARALLEL_EPS: f64 = 1e-8;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GeoError {
    #[error("ray is parallel to the ground plane")]
    RayParallel,
    #[error("intersection point is behind the camera")]
    BehindCamera,
}

impl GeoError {
    pub fn code(self) -> &'static str {
        match self {
            GeoError::RayParallel => "ray_parallel",
            GeoError::BehindCamera => "behind_camera",
        }
    }
}

/// Orthonormal camera axes (right, down, forward) expressed in the local ENU
/// frame, derived from heading/pitch/roll.
///
/// `forward` points along the boresight; `heading=0, pitch=0` points forward
/// along local North with the horizon level, and `pitch=-90` points straight
/// down regardless of heading, which is what anchors the vertical-look test
/// case in §8 scenario 1.
fn camera_axes(heading_deg: f64, pitch_deg: f64, roll_deg: f64) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
    let h = heading_deg.to_radians();
    let p = pitch_deg.to_radians();
    let r = roll_deg.to_radians();

    let forward = Vector3::new(h.sin() * p.cos(), h.cos() * p.cos(), p.sin());
    let right = Vector3::new(h.cos(), -h.sin(), 0.0);
    // down = forward x right, completing the (right, down, forward) triad.
    let down = forward.cross(&right);

    let (sr, cr) = r.sin_cos();
    let right_rolled = right * cr + down * sr;
    let down_rolled = down * cr - right * sr;

    (right_rolled, down_rolled, forward)
}

/// Runs the pinhole-ray / ground-plane intersection and derives accuracy and
/// confidence band. Deterministic: identical inputs always produce identical
/// output (§8).
pub fn geolocate(camera: &CameraMetadata, pixel_x: u32, pixel_y: u32, ai_confidence: f64) -> Result<GeoResult, GeoError> {
    let cx = camera.image_width as f64 / 2.0;
    let cy = camera.image_height as f64 / 2.0;
    let f = camera.focal_length_px;

    let rc = Vector3::new(
        (pixel_x as f64 - cx) / f,
        (pixel_y as f64 - cy) / f,
        1.0,
    );

    let (right, down, forward) = camera_axes(camera.heading_deg, camera.pitch_deg, camera.roll_deg);
    let ray = right * rc.x + down * rc.y + forward * rc.z;

    if ray.z.abs() < RAY_PARALLEL_EPS {
        return Err(GeoError::RayParallel);
    }

    let t = -camera.elevation_m / ray.z;
    if t <= 0.0 {
        return Err(GeoError::BehindCamera);
    }

    let east_m = t * ray.x;
    let north_m = t * ray.y;

    let lat_rad = camera.latitude.to_radians();
    let dlat_deg = (north_m / R_EARTH_M).to_degrees();
    let dlon_deg = (east_m / (R_EARTH_M * lat_rad.cos())).to_degrees();

    let lat = camera.latitude + dlat_deg;
    let lon = camera.longitude + dlon_deg;

    let accuracy_m = (t.abs() * (SIGMA_PX / f).tan()).max(MIN_ACCURACY_M);

    // Angle between the ray and the (horizontal) ground plane: the
    // complement of the angle between the ray and the vertical.
    let theta_deg = (ray.z.abs() / ray.norm()).asin().to_degrees();

    let confidence_class = if ai_confidence >= 0.75 && theta_deg >= 15.0 {
        ConfidenceClass::Green
    } else if ai_confidence >= 0.50 && theta_deg >= 5.0 {
        ConfidenceClass::Yellow
    } else {
        ConfidenceClass::Red
    };

    Ok(GeoResult {
        lat,
        lon,
        accuracy_m,
        confidence_class,
        algorithm_notes: format!("t={t:.3}m theta={theta_deg:.2}deg"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(heading: f64, pitch: f64, roll: f64) -> CameraMetadata {
        CameraMetadata {
            latitude: 40.7128,
            longitude: -74.0060,
            elevation_m: 100.0,
            heading_deg: heading,
            pitch_deg: pitch,
            roll_deg: roll,
            focal_length_px: 3000.0,
            sensor_width_mm: 6.4,
            sensor_height_mm: 4.8,
            image_width: 1920,
            image_height: 1440,
        }
    }

    #[test]
    fn straight_down_center_pixel_lands_on_camera_position() {
        let cam = camera(0.0, -90.0, 0.0);
        let r = geolocate(&cam, 960, 720, 0.92).unwrap();
        assert!((r.lat - 40.7128).abs() < 1e-6);
        assert!((r.lon - (-74.0060)).abs() < 1e-6);
        assert!((r.accuracy_m - 0.5).abs() < 1e-6);
        assert_eq!(r.confidence_class, ConfidenceClass::Green);
    }

    #[test]
    fn determinism_identical_inputs_identical_outputs() {
        let cam = camera(15.0, -45.0, 3.0);
        let a = geolocate(&cam, 500, 600, 0.8).unwrap();
        let b = geolocate(&cam, 500, 600, 0.8).unwrap();
        assert_eq!(a.lat.to_bits(), b.lat.to_bits());
        assert_eq!(a.lon.to_bits(), b.lon.to_bits());
        assert_eq!(a.accuracy_m.to_bits(), b.accuracy_m.to_bits());
        assert_eq!(a.confidence_class, b.confidence_class);
    }

    #[test]
    fn level_horizon_pixel_is_ray_parallel() {
        // pitch=0, center pixel: forward ray is perfectly horizontal (z=0).
        let cam = camera(0.0, 0.0, 0.0);
        let err = geolocate(&cam, 960, 720, 0.9).unwrap_err();
        assert_eq!(err, GeoError::RayParallel);
        assert_eq!(err.code(), "ray_parallel");
    }

    #[test]
    fn upward_pitch_is_behind_camera() {
        // pitch=+45 points the boresight above the horizon: it never meets
        // the ground plane below the camera.
        let cam = camera(0.0, 45.0, 0.0);
        let err = geolocate(&cam, 960, 720, 0.9).unwrap_err();
        assert_eq!(err, GeoError::BehindCamera);
        assert_eq!(err.code(), "behind_camera");
    }

    #[test]
    fn moderate_incidence_yields_yellow_not_red() {
        // pitch=-10 deg, center pixel: incidence angle is exactly 10 deg,
        // between the YELLOW (>=5) and GREEN (>=15) thresholds.
        let cam = camera(0.0, -10.0, 0.0);
        let r = geolocate(&cam, 960, 720, 0.92).unwrap();
        assert!(r.accuracy_m >= MIN_ACCURACY_M);
        assert_eq!(r.confidence_class, ConfidenceClass::Yellow);
    }

    #[test]
    fn near_grazing_incidence_inflates_accuracy_radius() {
        // pitch=-0.1 deg, center pixel: the ray is nearly horizontal, so the
        // range to the ground point (and thus the propagated accuracy) is
        // large, even though it still clears the ray-parallel threshold.
        let cam = camera(0.0, -0.1, 0.0);
        let r = geolocate(&cam, 960, 720, 0.92).unwrap();
        assert!(r.accuracy_m > 10.0);
        assert_eq!(r.confidence_class, ConfidenceClass::Red);
    }

    #[test]
    fn low_ai_confidence_is_always_red() {
        let cam = camera(0.0, -90.0, 0.0);
        let r = geolocate(&cam, 960, 720, 0.1).unwrap();
        assert_eq!(r.confidence_class, ConfidenceClass::Red);
    }

    #[test]
    fn heading_rotates_azimuth_without_changing_straight_down_hit() {
        // Heading must not affect a pure-nadir shot: pitch=-90 always looks
        // straight down irrespective of yaw.
        let cam = camera(123.0, -90.0, 0.0);
        let r = geolocate(&cam, 960, 720, 0.92).unwrap();
        assert!((r.lat - 40.7128).abs() < 1e-6);
        assert!((r.lon - (-74.0060)).abs() < 1e-6);
    }
}
