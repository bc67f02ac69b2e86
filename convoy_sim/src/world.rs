//! SimWorld - The simulation harness container.
//!
//! One `step()` is one tick: physics advances, the virtual clock follows,
//! every vehicle gets its inertial sample (and a fix when one is due), the air
//! applies range changes, then every vehicle runs its tick in spawn order.

use crate::agent::SimulatedVehicle;
use crate::context::SimContext;
use crate::network::{SimAir, DEFAULT_RANGE_M};
use crate::oracle::{Oracle, SensorNoise};

use convoy_core::AgentConfig;
use convoy_env::{ConvoyContext, DeviceId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Tick rate in Hz (also the inertial sample rate)
    pub tick_rate_hz: u32,

    /// Interval between GNSS fixes (ms)
    pub fix_interval_ms: u64,

    /// Radio range (meters)
    pub range_m: f64,

    pub noise: SensorNoise,

    /// Configuration every simulated vehicle runs with
    pub agent: AgentConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tick_rate_hz: 20,
            fix_interval_ms: 1_000,
            range_m: DEFAULT_RANGE_M,
            noise: SensorNoise::default(),
            agent: AgentConfig::default(),
        }
    }
}

struct Slot {
    truth_id: u64,
    vehicle: SimulatedVehicle,
    fix_interval: Option<Duration>,
    next_fix: Duration,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Ground truth oracle
    pub oracle: Oracle,

    /// Radio medium, also the fault injector
    pub air: SimAir,

    slots: Vec<Slot>,
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        // Derive separate seeds for different subsystems
        let physics_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);

        let context = SimContext::shared(config.seed);
        let air = SimAir::new(config.range_m, context.derive_rng(1));
        let mut oracle = Oracle::new(physics_seed);
        oracle.set_noise(config.noise.clone());

        Self {
            config,
            context,
            oracle,
            air,
            slots: Vec::new(),
            tick_count: 0,
        }
    }

    /// Puts a vehicle on the road, powered on and discovering. Returns its index.
    pub fn spawn_vehicle(&mut self, name: &str, latitude: f64, longitude: f64, speed: f64, bearing: f64) -> usize {
        let index = self.slots.len();
        let truth_id = self.oracle.spawn_vehicle(latitude, longitude, speed, bearing);
        let device_id = DeviceId::from_seed(self.config.seed.wrapping_add(index as u64));

        let radio = self.air.register(device_id.clone(), name, latitude, longitude);
        let mut vehicle = SimulatedVehicle::new(device_id, name, radio, self.config.agent.clone());
        vehicle.start(self.context.now());

        self.slots.push(Slot {
            truth_id,
            vehicle,
            fix_interval: Some(Duration::from_millis(self.config.fix_interval_ms)),
            next_fix: self.context.now(),
        });
        index
    }

    /// Changes how often a vehicle gets fixes; `None` stops them.
    pub fn set_fix_interval(&mut self, index: usize, interval: Option<Duration>) {
        self.slots[index].fix_interval = interval;
    }

    /// Moves a vehicle instantly (the radio follows on the next step).
    pub fn teleport(&mut self, index: usize, latitude: f64, longitude: f64) {
        self.oracle.place(self.slots[index].truth_id, latitude, longitude);
    }

    pub fn set_controls(&mut self, index: usize, acceleration: f64, turn_rate: f64) {
        self.oracle.set_controls(self.slots[index].truth_id, acceleration, turn_rate);
    }

    pub fn vehicle(&self, index: usize) -> &SimulatedVehicle {
        &self.slots[index].vehicle
    }

    pub fn vehicle_mut(&mut self, index: usize) -> &mut SimulatedVehicle {
        &mut self.slots[index].vehicle
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &SimulatedVehicle> {
        self.slots.iter().map(|slot| &slot.vehicle)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn truth_id(&self, index: usize) -> u64 {
        self.slots[index].truth_id
    }

    /// True separation between two vehicles (meters).
    pub fn separation(&self, a: usize, b: usize) -> f64 {
        self.oracle
            .separation(self.slots[a].truth_id, self.slots[b].truth_id)
            .unwrap_or(f64::INFINITY)
    }

    /// Distance between a vehicle's estimate and its true position.
    pub fn estimate_error(&self, index: usize) -> Option<f64> {
        let slot = &self.slots[index];
        let own = slot.vehicle.own_state()?;
        self.oracle.position_error(slot.truth_id, own.latitude, own.longitude)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.tick_rate_hz.max(1) as f64)
    }

    pub fn now(&self) -> Duration {
        self.context.now()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Advances the whole world by one tick.
    pub fn step(&mut self) {
        let dt = self.tick_duration();
        self.oracle.step(dt.as_secs_f64());
        self.context.advance_time(dt);
        self.tick_count += 1;

        let now = self.context.now();
        let epoch_ms = self.context.epoch_millis();
        let timestamp_nanos = self.context.time_ns() as i64;

        for slot in &mut self.slots {
            let Some(truth) = self.oracle.vehicle(slot.truth_id).filter(|v| v.active).cloned() else {
                continue;
            };
            self.air.set_position(slot.vehicle.radio().index(), truth.latitude, truth.longitude);

            if let Some((acceleration, angular_velocity)) = self.oracle.generate_imu(slot.truth_id) {
                slot.vehicle.on_imu(acceleration, angular_velocity, timestamp_nanos, now);
            }

            if let Some(interval) = slot.fix_interval {
                if now >= slot.next_fix {
                    if let Some(fix) = self.oracle.generate_fix(slot.truth_id, epoch_ms) {
                        slot.vehicle.on_fix(fix);
                    }
                    slot.next_fix = now + interval;
                }
            }
        }

        self.air.step();

        for slot in &mut self.slots {
            slot.vehicle.tick(now);
        }
    }

    /// Runs for `seconds` of virtual time.
    pub fn run_for(&mut self, seconds: f64) {
        let end = self.now() + Duration::from_secs_f64(seconds);
        while self.now() < end {
            self.step();
        }
    }

    /// Steps until `done` holds or `seconds` pass. Returns whether it held.
    pub fn run_until<F>(&mut self, seconds: f64, mut done: F) -> bool
    where
        F: FnMut(&SimWorld) -> bool,
    {
        let end = self.now() + Duration::from_secs_f64(seconds);
        while self.now() < end {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }
}
