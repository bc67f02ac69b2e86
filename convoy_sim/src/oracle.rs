//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated road:
//! - True position, speed and heading of every vehicle
//! - Kinematics (along-track acceleration, constant turn rate)
//! - Sensor generation: noisy GNSS fixes and inertial samples

use convoy_core::vehicle::{destination, distance_m, normalize_bearing, METERS_PER_DEGREE};
use convoy_core::LocationFix;
use geo::Point;
use nalgebra::Vector2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A ground truth vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthVehicle {
    pub id: u64,
    pub latitude: f64,
    pub longitude: f64,

    /// m/s
    pub speed: f64,

    /// Degrees clockwise from north
    pub bearing: f64,

    /// Along-track acceleration (m/s²)
    pub acceleration: f64,

    /// Heading change rate, clockwise positive (deg/s)
    pub turn_rate: f64,

    /// Vehicle is still on the road
    pub active: bool,
}

impl TruthVehicle {
    pub fn position(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }
}

/// Standard deviations of the simulated sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorNoise {
    pub fix_position_m: f64,
    pub fix_speed_mps: f64,
    pub fix_bearing_deg: f64,
    pub accel_mps2: f64,
    pub gyro_rad_s: f64,
}

impl Default for SensorNoise {
    fn default() -> Self {
        Self {
            fix_position_m: 3.0,
            fix_speed_mps: 0.3,
            fix_bearing_deg: 2.0,
            accel_mps2: 0.05,
            gyro_rad_s: 0.001,
        }
    }
}

/// The Oracle - maintains ground truth and generates sensor readings.
pub struct Oracle {
    /// RNG for sensor noise
    physics_rng: ChaCha8Rng,

    vehicles: BTreeMap<u64, TruthVehicle>,
    next_id: u64,

    /// Current simulation time (seconds)
    current_time: f64,

    noise: SensorNoise,
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    ///
    /// The physics seed should be derived separately from the network seed
    /// so that changing link loss doesn't move the vehicles' sensor noise.
    pub fn new(physics_seed: u64) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            vehicles: BTreeMap::new(),
            next_id: 0,
            current_time: 0.0,
            noise: SensorNoise::default(),
        }
    }

    pub fn set_noise(&mut self, noise: SensorNoise) {
        self.noise = noise;
    }

    /// Spawns a vehicle cruising at constant speed and returns its ID.
    pub fn spawn_vehicle(&mut self, latitude: f64, longitude: f64, speed: f64, bearing: f64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        self.vehicles.insert(
            id,
            TruthVehicle {
                id,
                latitude,
                longitude,
                speed: speed.max(0.0),
                bearing: normalize_bearing(bearing),
                acceleration: 0.0,
                turn_rate: 0.0,
                active: true,
            },
        );
        id
    }

    /// Changes a vehicle's controls from now on.
    pub fn set_controls(&mut self, id: u64, acceleration: f64, turn_rate: f64) {
        if let Some(vehicle) = self.vehicles.get_mut(&id) {
            vehicle.acceleration = acceleration;
            vehicle.turn_rate = turn_rate;
        }
    }

    /// Teleports a vehicle (used to bring late arrivals into range).
    pub fn place(&mut self, id: u64, latitude: f64, longitude: f64) {
        if let Some(vehicle) = self.vehicles.get_mut(&id) {
            vehicle.latitude = latitude;
            vehicle.longitude = longitude;
        }
    }

    /// Removes a vehicle from the road.
    pub fn remove_vehicle(&mut self, id: u64) {
        if let Some(vehicle) = self.vehicles.get_mut(&id) {
            vehicle.active = false;
        }
    }

    /// Advances physics by dt seconds.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;

        for vehicle in self.vehicles.values_mut().filter(|v| v.active) {
            vehicle.bearing = normalize_bearing(vehicle.bearing + vehicle.turn_rate * dt);
            let start_speed = vehicle.speed;
            vehicle.speed = (vehicle.speed + vehicle.acceleration * dt).max(0.0);

            let travelled = 0.5 * (start_speed + vehicle.speed) * dt;
            let next = destination(vehicle.position(), vehicle.bearing, travelled);
            vehicle.latitude = next.y();
            vehicle.longitude = next.x();
        }
    }

    /// Returns the current simulation time.
    pub fn time(&self) -> f64 {
        self.current_time
    }

    pub fn vehicle(&self, id: u64) -> Option<&TruthVehicle> {
        self.vehicles.get(&id)
    }

    /// Distance between two vehicles' true positions (meters).
    pub fn separation(&self, a: u64, b: u64) -> Option<f64> {
        Some(distance_m(self.vehicles.get(&a)?.position(), self.vehicles.get(&b)?.position()))
    }

    /// Error of an estimate against a vehicle's true position (meters).
    pub fn position_error(&self, id: u64, latitude: f64, longitude: f64) -> Option<f64> {
        let vehicle = self.vehicles.get(&id)?;
        Some(distance_m(vehicle.position(), Point::new(longitude, latitude)))
    }

    /// Generates a noisy GNSS fix stamped with `timestamp_ms`.
    pub fn generate_fix(&mut self, id: u64, timestamp_ms: i64) -> Option<LocationFix> {
        let vehicle = self.vehicles.get(&id).filter(|v| v.active)?.clone();
        let noise = self.noise.clone();

        // Offset [east, north] in meters
        let offset = Vector2::new(
            gaussian(&mut self.physics_rng, noise.fix_position_m),
            gaussian(&mut self.physics_rng, noise.fix_position_m),
        );
        let meters_per_lon = METERS_PER_DEGREE * vehicle.latitude.to_radians().cos();
        let speed = (vehicle.speed + gaussian(&mut self.physics_rng, noise.fix_speed_mps)).max(0.0);
        let bearing = normalize_bearing(vehicle.bearing + gaussian(&mut self.physics_rng, noise.fix_bearing_deg));

        let fix = LocationFix::new(
            vehicle.latitude + offset.y / METERS_PER_DEGREE,
            vehicle.longitude + offset.x / meters_per_lon,
            timestamp_ms,
        )
        .with_velocity(speed, bearing);

        Some(if noise.fix_position_m > 0.0 {
            fix.with_accuracy(noise.fix_position_m)
        } else {
            fix
        })
    }

    /// Generates one inertial sample: navigation-frame acceleration
    /// `[east, north, up]` and angular velocity `[x, y, z]`.
    pub fn generate_imu(&mut self, id: u64) -> Option<([f64; 3], [f64; 3])> {
        let vehicle = self.vehicles.get(&id).filter(|v| v.active)?.clone();
        let noise = self.noise.clone();

        let (sin_b, cos_b) = vehicle.bearing.to_radians().sin_cos();
        let along_track = Vector2::new(sin_b, cos_b) * vehicle.acceleration;
        let acceleration = [
            along_track.x + gaussian(&mut self.physics_rng, noise.accel_mps2),
            along_track.y + gaussian(&mut self.physics_rng, noise.accel_mps2),
            gaussian(&mut self.physics_rng, noise.accel_mps2),
        ];

        // Clockwise turning is a negative rate about the up axis
        let yaw = -vehicle.turn_rate.to_radians() + gaussian(&mut self.physics_rng, noise.gyro_rad_s);
        Some((acceleration, [0.0, 0.0, yaw]))
    }
}

fn gaussian(rng: &mut ChaCha8Rng, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return 0.0;
    }
    Normal::new(0.0, std_dev).map(|normal| normal.sample(rng)).unwrap_or(0.0)
}
