//! Vehicle state record and the spherical-earth helpers shared by the engines.
//!
//! A [`VehicleState`] is the unit of exchange: one vehicle's position and
//! motion at an instant, plus an optional SOS flag. Records are built once and
//! replaced wholesale, never edited in place after they leave this process.

use convoy_env::DeviceId;
use geo::{HaversineDestination, HaversineDistance, Point};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mean earth radius used by the haversine helpers (meters).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Meters spanned by one degree of latitude on the mean sphere.
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// A point on a planned route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl Waypoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Snapshot of one vehicle's kinematic state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleState {
    /// Originating vehicle
    pub device_id: DeviceId,

    /// WGS84 latitude in degrees
    pub latitude: f64,

    /// WGS84 longitude in degrees
    pub longitude: f64,

    /// Ground speed in m/s (>= 0)
    pub speed: f32,

    /// Heading in degrees clockwise from true north, [0, 360)
    pub bearing: f32,

    /// Milliseconds since the Unix epoch, as stamped by the sender
    pub timestamp: i64,

    /// Planned route, may be empty
    #[serde(default)]
    pub route: Vec<Waypoint>,

    /// Distress flag
    #[serde(default)]
    pub is_sos: bool,

    /// Unique per distress event; present iff `is_sos`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sos_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sos_message: Option<String>,
}

impl VehicleState {
    pub fn new(
        device_id: DeviceId,
        latitude: f64,
        longitude: f64,
        speed: f32,
        bearing: f32,
        timestamp: i64,
    ) -> Self {
        Self {
            device_id,
            latitude,
            longitude,
            speed: speed.max(0.0),
            bearing: normalize_bearing_f32(bearing),
            timestamp,
            route: Vec::new(),
            is_sos: false,
            sos_id: None,
            sos_message: None,
        }
    }

    /// Attaches a planned route.
    pub fn with_route(mut self, route: Vec<Waypoint>) -> Self {
        self.route = route;
        self
    }

    /// Derives a distress record from `base`, tagged with a fresh SOS id.
    pub fn sos(base: &VehicleState, message: impl Into<String>) -> Self {
        Self {
            is_sos: true,
            sos_id: Some(Uuid::new_v4().to_string()),
            sos_message: Some(message.into()),
            ..base.clone()
        }
    }

    /// Position as a `geo` point (x = longitude, y = latitude).
    pub fn position(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    /// Great-circle distance to another vehicle (meters).
    pub fn distance_to(&self, other: &VehicleState) -> f64 {
        self.position().haversine_distance(&other.position())
    }

    /// Where this vehicle will be after `seconds` at constant speed and bearing.
    pub fn project(&self, seconds: f64) -> Point<f64> {
        destination(
            self.position(),
            self.bearing as f64,
            self.speed as f64 * seconds,
        )
    }

    /// Checks that every numeric field is finite and in range.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.speed.is_finite()
            && self.speed >= 0.0
            && self.bearing.is_finite()
            && self.is_sos == self.sos_id.is_some()
    }
}

/// Great-circle distance between two points (meters).
pub fn distance_m(a: Point<f64>, b: Point<f64>) -> f64 {
    a.haversine_distance(&b)
}

/// Destination point given a start, bearing (degrees) and distance (meters).
pub fn destination(origin: Point<f64>, bearing_deg: f64, distance_m: f64) -> Point<f64> {
    if distance_m <= 0.0 {
        return origin;
    }
    origin.haversine_destination(bearing_deg, distance_m)
}

/// Wraps any angle in degrees into [0, 360).
pub fn normalize_bearing(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Single-precision bearing in [0, 360).
pub fn normalize_bearing_f32(degrees: f32) -> f32 {
    let wrapped = normalize_bearing(degrees as f64) as f32;
    // Values just under 360 round up when narrowed
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Wraps an angular difference into [-180, 180).
pub fn wrap_angle_difference(degrees: f64) -> f64 {
    normalize_bearing(degrees + 180.0) - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn at(lat: f64, lon: f64) -> VehicleState {
        VehicleState::new(DeviceId::from("v"), lat, lon, 0.0, 0.0, 0)
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let a = at(0.0, 0.0);
        let b = at(1.0, 0.0);
        assert_relative_eq!(a.distance_to(&b), METERS_PER_DEGREE, max_relative = 1e-5);
    }

    #[test]
    fn test_project_heading_north() {
        let mut v = at(45.0, 7.0);
        v.speed = 10.0;
        v.bearing = 0.0;

        let p = v.project(10.0);
        assert_relative_eq!(distance_m(v.position(), p), 100.0, epsilon = 1e-6);
        assert!(p.y() > 45.0);
        assert_relative_eq!(p.x(), 7.0, epsilon = 1e-9);
    }

    #[test]
    fn test_project_stationary_is_identity() {
        let v = at(12.5, -3.25);
        assert_eq!(v.project(5.0), v.position());
    }

    #[test]
    fn test_bearing_normalization() {
        assert_relative_eq!(normalize_bearing(-90.0), 270.0);
        assert_relative_eq!(normalize_bearing(720.0), 0.0);
        assert_relative_eq!(normalize_bearing(359.5), 359.5);
        assert!(normalize_bearing(-1e-15) < 360.0);

        assert_relative_eq!(wrap_angle_difference(350.0), -10.0);
        assert_relative_eq!(wrap_angle_difference(-190.0), 170.0);
        assert_relative_eq!(wrap_angle_difference(180.0), -180.0);
    }

    #[test]
    fn test_narrowed_bearing_stays_below_full_turn() {
        assert_eq!(normalize_bearing_f32(-1e-6), 0.0);
        assert_eq!(normalize_bearing_f32(360.0), 0.0);
        assert_relative_eq!(normalize_bearing_f32(-90.0), 270.0);

        let v = VehicleState::new(DeviceId::from("v"), 0.0, 0.0, 1.0, -1e-6, 0);
        assert!((0.0..360.0).contains(&v.bearing));
        assert!(v.is_valid());
    }

    #[test]
    fn test_constructor_normalizes() {
        let v = VehicleState::new(DeviceId::from("v"), 0.0, 0.0, -3.0, -45.0, 0);
        assert_eq!(v.speed, 0.0);
        assert_relative_eq!(v.bearing, 315.0);
    }

    #[test]
    fn test_sos_derivation() {
        let base = at(1.0, 2.0).with_route(vec![Waypoint::new(1.1, 2.1)]);
        let a = VehicleState::sos(&base, "Crash detected! Sensor impact.");
        let b = VehicleState::sos(&base, "again");

        assert!(a.is_sos);
        assert_eq!(a.latitude, base.latitude);
        assert_eq!(a.route, base.route);
        assert_eq!(a.sos_message.as_deref(), Some("Crash detected! Sensor impact."));
        assert_ne!(a.sos_id, b.sos_id);
        assert!(a.is_valid());
        assert!(!base.is_sos);
    }

    #[test]
    fn test_validity() {
        assert!(at(10.0, 10.0).is_valid());
        assert!(!at(f64::NAN, 10.0).is_valid());
        assert!(!at(91.0, 10.0).is_valid());

        let mut flagged = at(0.0, 0.0);
        flagged.is_sos = true;
        assert!(!flagged.is_valid());
    }
}
