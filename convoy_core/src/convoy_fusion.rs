//! The "FUSION" Engine - Extended Kalman Filter over position fixes and inertial samples
//!
//! Keeps a 4-element state `[latitude°, longitude°, speed m/s, bearing°]`:
//! - **predict** dead-reckons between fixes from accelerometer and gyroscope samples
//! - **update** corrects the estimate with a position fix (2-D) or a fix carrying
//!   speed and bearing too (4-D)
//!
//! Covariances are held in state units (degrees for position and bearing). Noise
//! figures from [`EstimatorConfig`] are given in meters and converted per step,
//! since a meter of longitude spans more degrees away from the equator.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::vehicle::{normalize_bearing, wrap_angle_difference, VehicleState, METERS_PER_DEGREE};
use convoy_env::DeviceId;

const LAT: usize = 0;
const LON: usize = 1;
const SPEED: usize = 2;
const BEARING: usize = 3;
const STATE_DIM: usize = 4;

/// Smallest cosine used when scaling longitude, keeps the poles finite.
const MIN_LATITUDE_COSINE: f64 = 1e-6;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tuning for the [`Estimator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Speeds below this are reported as zero (default: 0.3 m/s)
    pub stationary_speed_mps: f64,

    /// Initial position standard deviation (default: 10 m)
    pub initial_position_std_m: f64,

    /// Initial speed standard deviation (default: 2 m/s)
    pub initial_speed_std_mps: f64,

    /// Initial bearing standard deviation (default: 30°)
    pub initial_bearing_std_deg: f64,

    /// Position random walk per √s (default: 0.5 m)
    pub process_position_std_m: f64,

    /// Speed random walk per √s (default: 0.5 m/s)
    pub process_speed_std_mps: f64,

    /// Bearing random walk per √s (default: 2°)
    pub process_bearing_std_deg: f64,

    /// Used when a fix carries no accuracy figure (default: 5 m)
    pub default_fix_accuracy_m: f64,

    /// Measurement noise of a fix's speed (default: 1 m/s)
    pub fix_speed_std_mps: f64,

    /// Measurement noise of a fix's bearing (default: 10°)
    pub fix_bearing_std_deg: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            stationary_speed_mps: 0.3,
            initial_position_std_m: 10.0,
            initial_speed_std_mps: 2.0,
            initial_bearing_std_deg: 30.0,
            process_position_std_m: 0.5,
            process_speed_std_mps: 0.5,
            process_bearing_std_deg: 2.0,
            default_fix_accuracy_m: 5.0,
            fix_speed_std_mps: 1.0,
            fix_bearing_std_deg: 10.0,
        }
    }
}

// ============================================================================
// INPUTS / OUTPUTS
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EstimatorError {
    /// `H·P·Hᵀ + R` could not be inverted; the fix was rejected
    #[error("innovation covariance is singular")]
    SingularInnovation,

    #[error("fix at {fix_ms} ms is older than the last accepted fix at {last_ms} ms")]
    StaleFix { fix_ms: i64, last_ms: i64 },

    #[error("fix contains non-finite or out-of-range values")]
    InvalidFix,
}

/// A GNSS position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,

    /// Ground speed (m/s), when the receiver reports one
    pub speed: Option<f64>,

    /// Course over ground (degrees), when the receiver reports one
    pub bearing: Option<f64>,

    /// Horizontal accuracy radius (meters)
    pub accuracy: Option<f64>,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            speed: None,
            bearing: None,
            accuracy: None,
            timestamp,
        }
    }

    pub fn with_velocity(mut self, speed: f64, bearing: f64) -> Self {
        self.speed = Some(speed);
        self.bearing = Some(bearing);
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.speed.map_or(true, f64::is_finite)
            && self.bearing.map_or(true, f64::is_finite)
    }

    /// Speed and bearing usable as a 4-D measurement.
    fn velocity(&self) -> Option<(f64, f64)> {
        match (self.speed, self.bearing) {
            (Some(speed), Some(bearing)) => Some((speed.max(0.0), normalize_bearing(bearing))),
            _ => None,
        }
    }
}

/// Best current estimate, as published to the rest of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusedState {
    pub latitude: f64,
    pub longitude: f64,

    /// m/s, zero below the stationary threshold
    pub speed: f64,

    /// Degrees in [0, 360)
    pub bearing: f64,

    /// Last fix time plus the dead-reckoned interval (ms since epoch), never
    /// earlier than a timestamp already reported
    pub timestamp: i64,
}

impl FusedState {
    pub fn to_vehicle_state(&self, device_id: DeviceId) -> VehicleState {
        VehicleState::new(
            device_id,
            self.latitude,
            self.longitude,
            self.speed as f32,
            self.bearing as f32,
            self.timestamp,
        )
    }
}

// ============================================================================
// ESTIMATOR
// ============================================================================

/// Extended Kalman filter fusing fixes with inertial dead reckoning.
#[derive(Debug, Clone)]
pub struct Estimator {
    config: EstimatorConfig,

    /// `[lat°, lon°, speed, bearing°]`
    state: DVector<f64>,

    /// Covariance in state units
    covariance: DMatrix<f64>,

    /// Process noise per second, in meters / m/s / degrees
    process_noise: DMatrix<f64>,

    initialized: bool,

    /// Timestamp of the last accepted fix (ms)
    last_fix_ms: i64,

    /// Inertial time integrated since the last fix (ns)
    propagated_nanos: i64,

    /// Timestamp of the previous inertial sample (ns), the `dt` anchor
    last_inertial_nanos: Option<i64>,

    /// Latest time reached before the current fix; a fix landing before
    /// dead reckoning's clock must not pull the reported time back
    timestamp_floor: i64,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let process_noise = DMatrix::from_diagonal(&DVector::from_vec(vec![
            config.process_position_std_m.powi(2),
            config.process_position_std_m.powi(2),
            config.process_speed_std_mps.powi(2),
            config.process_bearing_std_deg.powi(2),
        ]));

        Self {
            config,
            state: DVector::zeros(STATE_DIM),
            covariance: DMatrix::zeros(STATE_DIM, STATE_DIM),
            process_noise,
            initialized: false,
            last_fix_ms: 0,
            propagated_nanos: 0,
            last_inertial_nanos: None,
            timestamp_floor: i64::MIN,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Covariance in state units (degrees for position and bearing).
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Forgets everything; the next fix initializes afresh.
    pub fn restart(&mut self) {
        debug!("Estimator restarted");
        *self = Self::new(self.config.clone());
    }

    /// Prediction Step: dead-reckon to `timestamp_nanos`.
    ///
    /// `acceleration` is in the navigation frame `[east, north, up]` (m/s²) and
    /// `angular_velocity` is `[x, y, z]` (rad/s) with `z` about the up axis, so a
    /// negative `z` turns clockwise (bearing increases).
    ///
    /// The first sample after a fix only anchors the inertial clock. Samples that
    /// are not strictly newer than the anchor are ignored, as is everything before
    /// the first fix.
    pub fn predict(&mut self, acceleration: [f64; 3], angular_velocity: [f64; 3], timestamp_nanos: i64) {
        if !self.initialized {
            return;
        }

        let Some(previous) = self.last_inertial_nanos else {
            self.last_inertial_nanos = Some(timestamp_nanos);
            return;
        };

        let elapsed = timestamp_nanos - previous;
        if elapsed <= 0 {
            return;
        }
        if !acceleration.iter().chain(angular_velocity.iter()).all(|v| v.is_finite()) {
            warn!("Dropping non-finite inertial sample at {} ns", timestamp_nanos);
            return;
        }
        self.last_inertial_nanos = Some(timestamp_nanos);

        let dt = elapsed as f64 * 1e-9;
        let lat = self.state[LAT];
        let speed = self.state[SPEED];
        let bearing = self.state[BEARING];
        let meters_per_lon = meters_per_degree_longitude(lat);
        let (sin_h, cos_h) = bearing.to_radians().sin_cos();

        // Linearized transition; speed and bearing carry over, acceleration is a control input
        let mut f = DMatrix::<f64>::identity(STATE_DIM, STATE_DIM);
        f[(LAT, SPEED)] = cos_h * dt / METERS_PER_DEGREE;
        f[(LAT, BEARING)] = -speed * sin_h * dt / METERS_PER_DEGREE * std::f64::consts::PI / 180.0;
        f[(LON, SPEED)] = sin_h * dt / meters_per_lon;
        f[(LON, BEARING)] = speed * cos_h * dt / meters_per_lon * std::f64::consts::PI / 180.0;

        self.state[LAT] = (lat + speed * cos_h * dt / METERS_PER_DEGREE).clamp(-90.0, 90.0);
        self.state[LON] = wrap_longitude(self.state[LON] + speed * sin_h * dt / meters_per_lon);

        let turned = bearing - angular_velocity[2].to_degrees() * dt;
        let (sin_t, cos_t) = turned.to_radians().sin_cos();
        let v_north = speed * cos_t + acceleration[1] * dt;
        let v_east = speed * sin_t + acceleration[0] * dt;
        let new_speed = v_north.hypot(v_east);

        self.state[SPEED] = new_speed;
        self.state[BEARING] = if new_speed > f64::EPSILON {
            normalize_bearing(v_east.atan2(v_north).to_degrees())
        } else {
            normalize_bearing(turned)
        };

        // P = F * P * F^T + Q
        self.covariance = &f * &self.covariance * f.transpose() + self.process_noise_for(lat, dt);
        self.propagated_nanos += elapsed;
    }

    /// Update Step: correct with a position fix.
    ///
    /// The first fix initializes the state directly. On a singular innovation
    /// covariance the fix is rejected and the state is left untouched.
    pub fn update(&mut self, fix: &LocationFix) -> Result<(), EstimatorError> {
        if !fix.is_valid() {
            return Err(EstimatorError::InvalidFix);
        }

        if !self.initialized {
            self.initialize(fix);
            return Ok(());
        }

        if fix.timestamp < self.last_fix_ms {
            return Err(EstimatorError::StaleFix {
                fix_ms: fix.timestamp,
                last_ms: self.last_fix_ms,
            });
        }

        let (h, z, r) = self.measurement_model(fix);

        // y = z - H * x, angles wrapped so 359° vs 1° is a 2° residual
        let mut innovation = &z - &h * &self.state;
        innovation[LON] = wrap_longitude(innovation[LON]);
        if innovation.len() == STATE_DIM {
            innovation[BEARING] = wrap_angle_difference(innovation[BEARING]);
        }

        let s = &h * &self.covariance * h.transpose() + &r;
        let Some(s_inv) = s.try_inverse() else {
            warn!(
                "Rejecting fix at {} ms: innovation covariance is singular",
                fix.timestamp
            );
            return Err(EstimatorError::SingularInnovation);
        };

        // K = P * H^T * S^-1
        let k = &self.covariance * h.transpose() * s_inv;
        self.state += &k * innovation;
        self.state[LAT] = self.state[LAT].clamp(-90.0, 90.0);
        self.state[LON] = wrap_longitude(self.state[LON]);
        self.state[SPEED] = self.state[SPEED].max(0.0);
        self.state[BEARING] = normalize_bearing(self.state[BEARING]);

        // Joseph form: P = (I - K*H) * P * (I - K*H)^T + K*R*K^T
        let ikh = DMatrix::<f64>::identity(STATE_DIM, STATE_DIM) - &k * &h;
        self.covariance = &ikh * &self.covariance * ikh.transpose() + &k * &r * k.transpose();

        self.anchor_to_fix(fix.timestamp);
        Ok(())
    }

    /// Current estimate, or `None` before the first fix.
    pub fn get_state(&self) -> Option<FusedState> {
        if !self.initialized {
            return None;
        }

        let speed = if self.state[SPEED] < self.config.stationary_speed_mps {
            0.0
        } else {
            self.state[SPEED]
        };

        Some(FusedState {
            latitude: self.state[LAT],
            longitude: self.state[LON],
            speed,
            bearing: normalize_bearing(self.state[BEARING]),
            timestamp: self.dead_reckoned_ms().max(self.timestamp_floor),
        })
    }

    // ========== Private Helper Methods ==========

    fn initialize(&mut self, fix: &LocationFix) {
        let (speed, bearing) = fix.velocity().unwrap_or((0.0, 0.0));
        self.state = DVector::from_vec(vec![fix.latitude, fix.longitude, speed, bearing]);

        let position_std = self.config.initial_position_std_m;
        let lat_std = position_std / METERS_PER_DEGREE;
        let lon_std = position_std / meters_per_degree_longitude(fix.latitude);
        self.covariance = DMatrix::from_diagonal(&DVector::from_vec(vec![
            lat_std.powi(2),
            lon_std.powi(2),
            self.config.initial_speed_std_mps.powi(2),
            self.config.initial_bearing_std_deg.powi(2),
        ]));

        self.initialized = true;
        self.anchor_to_fix(fix.timestamp);
        self.timestamp_floor = fix.timestamp;
        debug!(
            "Estimator initialized at ({:.6}, {:.6})",
            fix.latitude, fix.longitude
        );
    }

    /// Re-anchors the dead-reckoning clock on an accepted fix.
    fn anchor_to_fix(&mut self, timestamp_ms: i64) {
        self.timestamp_floor = self.timestamp_floor.max(self.dead_reckoned_ms());
        self.last_fix_ms = timestamp_ms;
        self.propagated_nanos = 0;
        self.last_inertial_nanos = None;
    }

    fn dead_reckoned_ms(&self) -> i64 {
        self.last_fix_ms + self.propagated_nanos / 1_000_000
    }

    /// Builds `(H, z, R)` for a fix; 4-D when it carries speed and bearing.
    fn measurement_model(&self, fix: &LocationFix) -> (DMatrix<f64>, DVector<f64>, DMatrix<f64>) {
        let accuracy = fix
            .accuracy
            .filter(|a| a.is_finite() && *a >= 0.0)
            .unwrap_or(self.config.default_fix_accuracy_m);
        let lat_var = (accuracy / METERS_PER_DEGREE).powi(2);
        let lon_var = (accuracy / meters_per_degree_longitude(fix.latitude)).powi(2);

        match fix.velocity() {
            Some((speed, bearing)) => (
                DMatrix::identity(STATE_DIM, STATE_DIM),
                DVector::from_vec(vec![fix.latitude, fix.longitude, speed, bearing]),
                DMatrix::from_diagonal(&DVector::from_vec(vec![
                    lat_var,
                    lon_var,
                    self.config.fix_speed_std_mps.powi(2),
                    self.config.fix_bearing_std_deg.powi(2),
                ])),
            ),
            None => {
                let mut h = DMatrix::zeros(2, STATE_DIM);
                h[(0, LAT)] = 1.0;
                h[(1, LON)] = 1.0;
                (
                    h,
                    DVector::from_vec(vec![fix.latitude, fix.longitude]),
                    DMatrix::from_diagonal(&DVector::from_vec(vec![lat_var, lon_var])),
                )
            }
        }
    }

    /// Process noise for a step of `dt` seconds, converted to state units at `lat`.
    fn process_noise_for(&self, lat: f64, dt: f64) -> DMatrix<f64> {
        let to_state = DMatrix::from_diagonal(&DVector::from_vec(vec![
            1.0 / METERS_PER_DEGREE,
            1.0 / meters_per_degree_longitude(lat),
            1.0,
            1.0,
        ]));
        &to_state * &self.process_noise * &to_state * dt
    }
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

/// Leaves in-range values bit-exact; only crossings of the antimeridian are wrapped.
fn wrap_longitude(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        lon
    } else {
        wrap_angle_difference(lon)
    }
}

fn meters_per_degree_longitude(lat: f64) -> f64 {
    METERS_PER_DEGREE * lat.to_radians().cos().abs().max(MIN_LATITUDE_COSINE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    const SECOND: i64 = 1_000_000_000;

    fn zero_noise_config() -> EstimatorConfig {
        EstimatorConfig {
            initial_position_std_m: 0.0,
            initial_speed_std_mps: 0.0,
            initial_bearing_std_deg: 0.0,
            process_position_std_m: 0.0,
            process_speed_std_mps: 0.0,
            process_bearing_std_deg: 0.0,
            default_fix_accuracy_m: 0.0,
            fix_speed_std_mps: 0.0,
            fix_bearing_std_deg: 0.0,
            ..EstimatorConfig::default()
        }
    }

    #[test]
    fn test_no_state_before_first_fix() {
        let mut est = Estimator::default();
        est.predict([1.0, 1.0, 0.0], [0.0; 3], 0);
        est.predict([1.0, 1.0, 0.0], [0.0; 3], SECOND);
        assert!(est.get_state().is_none());
        assert!(!est.is_initialized());
    }

    #[test]
    fn test_first_fix_initializes_exactly() {
        let mut est = Estimator::default();
        let fix = LocationFix::new(48.1372, 11.5756, 1_700_000_000_000).with_velocity(12.0, 45.0);
        est.update(&fix).unwrap();

        let state = est.get_state().unwrap();
        assert_eq!(state.latitude, 48.1372);
        assert_eq!(state.longitude, 11.5756);
        assert_relative_eq!(state.speed, 12.0);
        assert_relative_eq!(state.bearing, 45.0);
        assert_eq!(state.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_stationary_vehicle_stays_put() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(10.0, 20.0, 0).with_velocity(0.0, 0.0))
            .unwrap();

        for k in 0..5 {
            est.predict([0.0; 3], [0.0; 3], k * SECOND / 10);
        }

        let state = est.get_state().unwrap();
        assert_eq!(state.latitude, 10.0);
        assert_eq!(state.longitude, 20.0);
        assert_eq!(state.speed, 0.0);
        assert_eq!(state.bearing, 0.0);
    }

    #[test]
    fn test_slow_speed_reported_as_zero() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(0.0, 0.0, 0).with_velocity(0.2, 90.0))
            .unwrap();
        assert_eq!(est.get_state().unwrap().speed, 0.0);
    }

    #[test]
    fn test_first_inertial_sample_only_anchors() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(0.0, 0.0, 0).with_velocity(10.0, 90.0))
            .unwrap();

        est.predict([0.0; 3], [0.0; 3], 5 * SECOND);
        let state = est.get_state().unwrap();
        assert_eq!(state.longitude, 0.0);
        assert_eq!(state.timestamp, 0);
    }

    #[test]
    fn test_dead_reckoning_east() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(0.0, 0.0, 1_000).with_velocity(10.0, 90.0))
            .unwrap();

        est.predict([0.0; 3], [0.0; 3], 0);
        est.predict([0.0; 3], [0.0; 3], SECOND);

        let state = est.get_state().unwrap();
        assert_relative_eq!(state.longitude, 10.0 / METERS_PER_DEGREE, epsilon = 1e-12);
        assert_relative_eq!(state.latitude, 0.0, epsilon = 1e-12);
        assert_relative_eq!(state.speed, 10.0, epsilon = 1e-9);
        assert_eq!(state.timestamp, 2_000);
    }

    #[test]
    fn test_zero_elapsed_predict_is_noop() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(1.0, 1.0, 0).with_velocity(10.0, 0.0))
            .unwrap();
        est.predict([0.0; 3], [0.0; 3], SECOND);
        est.predict([0.0; 3], [0.0; 3], 2 * SECOND);
        let before = est.get_state().unwrap();
        let cov_before = est.covariance().clone();

        est.predict([3.0, 3.0, 0.0], [0.0, 0.0, 1.0], 2 * SECOND);
        est.predict([3.0, 3.0, 0.0], [0.0, 0.0, 1.0], SECOND);

        assert_eq!(est.get_state().unwrap(), before);
        assert_eq!(est.covariance(), &cov_before);
    }

    #[test]
    fn test_gyro_turns_clockwise_for_negative_rate() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(0.0, 0.0, 0).with_velocity(10.0, 0.0))
            .unwrap();

        est.predict([0.0; 3], [0.0; 3], 0);
        est.predict([0.0; 3], [0.0, 0.0, -0.1], SECOND);

        let state = est.get_state().unwrap();
        assert_relative_eq!(state.bearing, 0.1_f64.to_degrees(), epsilon = 1e-9);
        assert_relative_eq!(state.speed, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_acceleration_from_rest() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(0.0, 0.0, 0)).unwrap();

        est.predict([0.0; 3], [0.0; 3], 0);
        est.predict([2.0, 0.0, 0.0], [0.0; 3], SECOND);

        let state = est.get_state().unwrap();
        assert_relative_eq!(state.speed, 2.0, epsilon = 1e-9);
        assert_relative_eq!(state.bearing, 90.0, epsilon = 1e-9);
    }

    #[test]
    fn test_predict_grows_uncertainty() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(0.0, 0.0, 0).with_velocity(5.0, 0.0))
            .unwrap();
        let before = est.covariance().trace();

        est.predict([0.0; 3], [0.0; 3], 0);
        est.predict([0.0; 3], [0.0; 3], SECOND);
        assert!(est.covariance().trace() > before);
    }

    #[test]
    fn test_update_pulls_toward_fix() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(0.0, 0.0, 0)).unwrap();

        let target = 10.0 / METERS_PER_DEGREE;
        est.update(&LocationFix::new(target, 0.0, 1_000).with_accuracy(5.0))
            .unwrap();

        let state = est.get_state().unwrap();
        assert!(state.latitude > 0.0 && state.latitude < target);
        assert_eq!(state.timestamp, 1_000);
    }

    #[test]
    fn test_reported_time_never_goes_back_after_fix() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(0.0, 0.0, 0).with_velocity(10.0, 0.0))
            .unwrap();

        // Sensor clock runs ahead of the fix clock
        est.predict([0.0; 3], [0.0; 3], 0);
        est.predict([0.0; 3], [0.0; 3], 1_200_000_000);
        assert_eq!(est.get_state().unwrap().timestamp, 1_200);

        est.update(&LocationFix::new(0.0001, 0.0, 1_000).with_velocity(10.0, 0.0))
            .unwrap();
        assert_eq!(est.get_state().unwrap().timestamp, 1_200);

        // Once the fix clock catches up it leads again
        est.update(&LocationFix::new(0.0002, 0.0, 2_000).with_velocity(10.0, 0.0))
            .unwrap();
        assert_eq!(est.get_state().unwrap().timestamp, 2_000);
        est.predict([0.0; 3], [0.0; 3], 3 * SECOND);
        est.predict([0.0; 3], [0.0; 3], 3 * SECOND + SECOND / 2);
        assert_eq!(est.get_state().unwrap().timestamp, 2_500);
    }

    #[test]
    fn test_bearing_innovation_wraps_through_north() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(0.0, 0.0, 0).with_velocity(10.0, 350.0))
            .unwrap();
        est.update(&LocationFix::new(0.0, 0.0, 1_000).with_velocity(10.0, 10.0))
            .unwrap();

        let bearing = est.get_state().unwrap().bearing;
        assert!(bearing > 350.0 || bearing < 10.0, "bearing {} went the long way", bearing);
    }

    #[test]
    fn test_singular_innovation_leaves_state_untouched() {
        let mut est = Estimator::new(zero_noise_config());
        est.update(&LocationFix::new(5.0, 5.0, 0)).unwrap();
        let before = est.get_state().unwrap();

        let result = est.update(&LocationFix::new(5.001, 5.001, 1_000).with_accuracy(0.0));
        assert_eq!(result, Err(EstimatorError::SingularInnovation));
        assert_eq!(est.get_state().unwrap(), before);
    }

    #[test]
    fn test_stale_and_invalid_fixes_rejected() {
        let mut est = Estimator::default();
        assert_eq!(
            est.update(&LocationFix::new(f64::NAN, 0.0, 0)),
            Err(EstimatorError::InvalidFix)
        );

        est.update(&LocationFix::new(0.0, 0.0, 5_000)).unwrap();
        assert!(matches!(
            est.update(&LocationFix::new(0.0, 0.0, 4_000)),
            Err(EstimatorError::StaleFix { fix_ms: 4_000, last_ms: 5_000 })
        ));
    }

    #[test]
    fn test_restart_forgets_state() {
        let mut est = Estimator::default();
        est.update(&LocationFix::new(1.0, 2.0, 0)).unwrap();
        est.restart();
        assert!(est.get_state().is_none());
    }

    #[test]
    fn test_fused_state_to_vehicle_state() {
        let fused = FusedState {
            latitude: 1.0,
            longitude: 2.0,
            speed: 3.0,
            bearing: 4.0,
            timestamp: 5,
        };
        let v = fused.to_vehicle_state(DeviceId::from("me"));
        assert_eq!(v.device_id, DeviceId::from("me"));
        assert_eq!(v.speed, 3.0);
        assert_eq!(v.timestamp, 5);
        assert!(!v.is_sos);
    }

    proptest! {
        #[test]
        fn prop_repeated_timestamp_is_idempotent(
            lat in -60.0f64..60.0,
            lon in -170.0f64..170.0,
            speed in 0.0f64..40.0,
            bearing in 0.0f64..360.0,
            ax in -5.0f64..5.0,
            wz in -1.0f64..1.0,
        ) {
            let mut est = Estimator::default();
            est.update(&LocationFix::new(lat, lon, 0).with_velocity(speed, bearing)).unwrap();
            est.predict([0.0; 3], [0.0; 3], 0);
            est.predict([ax, 0.0, 0.0], [0.0, 0.0, wz], SECOND / 2);
            let before = est.get_state().unwrap();

            est.predict([ax, 1.0, 0.0], [0.0, 0.0, wz], SECOND / 2);
            prop_assert_eq!(est.get_state().unwrap(), before);
        }

        #[test]
        fn prop_reported_bearing_in_range(
            bearing in -720.0f64..720.0,
            wz in -3.0f64..3.0,
        ) {
            let mut est = Estimator::default();
            est.update(&LocationFix::new(0.0, 0.0, 0).with_velocity(5.0, bearing)).unwrap();
            est.predict([0.0; 3], [0.0; 3], 0);
            est.predict([0.0; 3], [0.0, 0.0, wz], SECOND);

            let reported = est.get_state().unwrap().bearing;
            prop_assert!((0.0..360.0).contains(&reported));
        }

        #[test]
        fn prop_reported_time_is_monotonic(
            steps in proptest::collection::vec((0i64..1_500, any::<bool>()), 1..40),
        ) {
            let mut est = Estimator::default();
            est.update(&LocationFix::new(0.0, 0.0, 0).with_velocity(8.0, 90.0)).unwrap();
            let mut last_reported = est.get_state().unwrap().timestamp;
            let (mut fix_ms, mut sensor_ns) = (0i64, 0i64);

            for (advance_ms, is_fix) in steps {
                if is_fix {
                    fix_ms += advance_ms;
                    est.update(&LocationFix::new(0.0, 0.0, fix_ms)).unwrap();
                } else {
                    sensor_ns += advance_ms * 1_000_000;
                    est.predict([0.0; 3], [0.0; 3], sensor_ns);
                }
                let reported = est.get_state().unwrap().timestamp;
                prop_assert!(reported >= last_reported);
                last_reported = reported;
            }
        }
    }
}
