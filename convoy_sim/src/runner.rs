//! Scenario runner - executes the deterministic simulation scenarios.

use crate::network::DEFAULT_RANGE_M;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use convoy_core::crash_detection::CRASH_SOS_MESSAGE;
use convoy_core::vehicle::METERS_PER_DEGREE;
use convoy_core::{AgentConfig, RiskAlert, Role};
use convoy_env::{DeviceId, NetworkController};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where every scenario takes place.
const BASE_LAT: f64 = 45.0703;
const BASE_LON: f64 = 7.6869;

/// Latitude offset for `meters` due north.
fn north(meters: f64) -> f64 {
    BASE_LAT + meters / METERS_PER_DEGREE
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_relayed: u64,
    pub role_changes: u64,
    pub alerts_raised: u64,
    pub sos_delivered: u64,

    /// Worst distance between an estimate and the truth (meters)
    pub max_position_error_m: Option<f64>,

    /// Longest time-to-collision at a vehicle's first warning (seconds)
    pub first_warning_ttc_s: Option<f64>,
}

/// Runs scenarios.
pub struct ScenarioRunner {
    seed: u64,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Overrides each scenario's own duration
    duration_secs: Option<f64>,

    agent: AgentConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 20,
            duration_secs: None,
            agent: AgentConfig::default(),
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the duration. Too short a run fails scenarios that need time to converge.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    /// Runs every vehicle with this configuration.
    pub fn with_agent_config(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        let duration = self.duration_secs.unwrap_or_else(|| scenario.default_duration_secs());

        let (world, outcome, mut metrics) = match scenario {
            ScenarioId::HeadOn => self.run_head_on(duration),
            ScenarioId::LateArrival => self.run_late_arrival(duration),
            ScenarioId::CoordinatorLoss => self.run_coordinator_loss(duration),
            ScenarioId::SosRelay => self.run_sos_relay(duration),
            ScenarioId::DeadReckoning => self.run_dead_reckoning(duration),
            ScenarioId::PacketLoss => self.run_packet_loss(duration),
            ScenarioId::CrashSos => self.run_crash_sos(duration),
        };

        collect_metrics(&world, &mut metrics);
        let failure_reason = outcome.err();
        if let Some(reason) = &failure_reason {
            warn!("{} failed: {}", scenario.name(), reason);
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            total_ticks: world.tick_count(),
            final_time_secs: world.now().as_secs_f64(),
            failure_reason,
            metrics,
        }
    }

    fn world(&self, range_m: f64) -> SimWorld {
        SimWorld::new(SimConfig {
            seed: self.seed,
            tick_rate_hz: self.tick_rate_hz,
            range_m,
            agent: self.agent.clone(),
            ..SimConfig::default()
        })
    }

    /// Two vehicles 300 m apart on the same road, each at 20 m/s toward the other.
    ///
    /// **Assertion**: both raise `Danger` with a positive TTC while still
    /// further apart than the danger radius.
    fn run_head_on(&self, duration: f64) -> (SimWorld, Result<(), String>, ScenarioMetrics) {
        let mut world = self.world(500.0);
        let a = world.spawn_vehicle("northbound", BASE_LAT, BASE_LON, 20.0, 0.0);
        let b = world.spawn_vehicle("southbound", north(300.0), BASE_LON, 20.0, 180.0);

        let warnings = watch_for_predicted_danger(&mut world, [a, b], duration);
        let mut metrics = ScenarioMetrics::default();
        let outcome = check_warnings(&world, &warnings, &mut metrics);
        (world, outcome, metrics)
    }

    /// Two parked vehicles 2 km apart self-coordinate, then one is moved next
    /// to the other.
    ///
    /// **Assertion**: they end up in a single group, each knowing the other.
    fn run_late_arrival(&self, duration: f64) -> (SimWorld, Result<(), String>, ScenarioMetrics) {
        let mut world = self.world(DEFAULT_RANGE_M);
        let a = world.spawn_vehicle("early", BASE_LAT, BASE_LON, 0.0, 0.0);
        let b = world.spawn_vehicle("late", north(2_000.0), BASE_LON, 0.0, 0.0);
        let metrics = ScenarioMetrics::default();

        let isolated = world.run_until(duration.min(15.0), |w| w.vehicles().all(|v| v.role() == Role::Coordinator));
        if !isolated {
            return (world, Err("vehicles did not self-coordinate while isolated".into()), metrics);
        }
        info!("Both vehicles coordinate alone at {:?}; bringing them together", world.now());

        world.teleport(b, north(50.0), BASE_LON);
        let remaining = duration - world.now().as_secs_f64();
        let merged = world.run_until(remaining, |w| single_group(w, &[a, b]));

        let outcome = if merged {
            Ok(())
        } else {
            Err(format!(
                "no single group: roles {:?}/{:?}, groups {}",
                world.vehicle(a).role(),
                world.vehicle(b).role(),
                world.air.group_count()
            ))
        };
        (world, outcome, metrics)
    }

    /// Three parked vehicles form a group; the coordinator then drives off.
    ///
    /// **Assertion**: participants drop to `Discovering` with empty peer tables
    /// immediately, then regroup without the departed coordinator.
    fn run_coordinator_loss(&self, duration: f64) -> (SimWorld, Result<(), String>, ScenarioMetrics) {
        let mut world = self.world(DEFAULT_RANGE_M);
        for (i, name) in ["alpha", "bravo", "charlie"].into_iter().enumerate() {
            world.spawn_vehicle(name, north(30.0 * i as f64), BASE_LON, 0.0, 0.0);
        }
        let metrics = ScenarioMetrics::default();

        let Some(coordinator) = form_group(&mut world, duration.min(15.0)) else {
            return (world, Err("initial group never formed".into()), metrics);
        };
        let departed = world.vehicle(coordinator).device_id().clone();
        let rest: Vec<usize> = (0..world.len()).filter(|&i| i != coordinator).collect();

        world.teleport(coordinator, north(5_000.0), BASE_LON);
        world.step();

        for &i in &rest {
            let vehicle = world.vehicle(i);
            if vehicle.role() != Role::Discovering || !vehicle.peers().is_empty() {
                let reason = format!(
                    "{} kept {:?} with {} peer(s) after losing its coordinator",
                    vehicle.name(),
                    vehicle.role(),
                    vehicle.peers().len()
                );
                return (world, Err(reason), metrics);
            }
        }

        let remaining = duration - world.now().as_secs_f64();
        let regrouped = world.run_until(remaining, |w| {
            single_group(w, &rest) && rest.iter().all(|&i| !w.vehicle(i).knows(&departed))
        });

        let outcome = if regrouped {
            Ok(())
        } else {
            Err("remaining vehicles did not regroup".into())
        };
        (world, outcome, metrics)
    }

    /// Three vehicles in a group; one participant raises SOS and repeats it.
    ///
    /// **Assertion**: the coordinator and the other participant each surface
    /// it exactly once.
    fn run_sos_relay(&self, duration: f64) -> (SimWorld, Result<(), String>, ScenarioMetrics) {
        let mut world = self.world(DEFAULT_RANGE_M);
        for (i, name) in ["alpha", "bravo", "charlie"].into_iter().enumerate() {
            world.spawn_vehicle(name, north(40.0 * i as f64), BASE_LON, 0.0, 0.0);
        }
        let metrics = ScenarioMetrics::default();

        let Some(coordinator) = form_group(&mut world, duration.min(10.0)) else {
            return (world, Err("group never formed".into()), metrics);
        };
        let participants: Vec<usize> = (0..world.len()).filter(|&i| i != coordinator).collect();
        let (sender, receiver) = (participants[0], participants[1]);
        world.run_for(1.0);

        let now = world.now();
        let sos = match world.vehicle_mut(sender).trigger_sos("Engine fire", now) {
            Ok(sos) => sos,
            Err(e) => return (world, Err(format!("SOS refused: {}", e)), metrics),
        };
        world.step();
        let now = world.now();
        world.vehicle_mut(sender).broadcast_priority(&sos, now);

        world.run_for((duration - world.now().as_secs_f64()).max(1.0));

        let sightings = |index: usize| {
            world
                .vehicle(index)
                .log()
                .sos_received
                .iter()
                .filter(|s| s.sos_id == sos.sos_id)
                .count()
        };
        let outcome = match (sightings(coordinator), sightings(receiver), sightings(sender)) {
            (1, 1, 0) => Ok(()),
            (c, r, s) => Err(format!(
                "SOS sightings: coordinator {}, other participant {}, sender {}",
                c, r, s
            )),
        };
        (world, outcome, metrics)
    }

    /// One vehicle turning at 3°/s with a fix only every 5 s.
    ///
    /// **Assertion**: the estimate never strays more than 30 m from the truth.
    fn run_dead_reckoning(&self, duration: f64) -> (SimWorld, Result<(), String>, ScenarioMetrics) {
        const BOUND_M: f64 = 30.0;

        let mut world = self.world(DEFAULT_RANGE_M);
        let v = world.spawn_vehicle("solo", BASE_LAT, BASE_LON, 15.0, 30.0);
        world.set_controls(v, 0.0, 3.0);
        world.set_fix_interval(v, Some(Duration::from_secs(5)));

        let mut metrics = ScenarioMetrics::default();
        let mut worst = 0.0_f64;
        let end = Duration::from_secs_f64(duration);
        while world.now() < end {
            world.step();
            if let Some(error) = world.estimate_error(v) {
                worst = worst.max(error);
            }
            if world.tick_count() % 100 == 0 {
                debug!("t={:.1}s worst error {:.2} m", world.now().as_secs_f64(), worst);
            }
        }
        metrics.max_position_error_m = Some(worst);

        let outcome = if world.vehicle(v).own_state().is_none() {
            Err("no estimate".to_string())
        } else if worst > BOUND_M {
            Err(format!("estimate strayed {:.1} m from truth", worst))
        } else {
            Ok(())
        };
        (world, outcome, metrics)
    }

    /// Head-on approach at 20 m/s closing speed over links losing 40% of frames.
    ///
    /// **Assertion**: no stored peer record ever goes back in time and both
    /// vehicles still get a predicted-collision warning.
    fn run_packet_loss(&self, duration: f64) -> (SimWorld, Result<(), String>, ScenarioMetrics) {
        let mut world = self.world(500.0);
        let a = world.spawn_vehicle("northbound", BASE_LAT, BASE_LON, 10.0, 0.0);
        let b = world.spawn_vehicle("southbound", north(250.0), BASE_LON, 10.0, 180.0);

        let (id_a, id_b) = (world.vehicle(a).device_id().clone(), world.vehicle(b).device_id().clone());
        world.air.set_link_loss(&id_a, &id_b, 0.4);
        world.air.set_link_loss(&id_b, &id_a, 0.4);

        let mut metrics = ScenarioMetrics::default();
        let mut newest: HashMap<(usize, DeviceId), i64> = HashMap::new();
        let mut warnings: [Option<(f64, f64)>; 2] = [None, None];
        let end = Duration::from_secs_f64(duration);

        while world.now() < end {
            world.step();
            record_predicted_danger(&world, [a, b], &mut warnings);

            for index in [a, b] {
                for peer in world.vehicle(index).peers() {
                    let previous = newest.entry((index, peer.device_id.clone())).or_insert(i64::MIN);
                    if peer.timestamp < *previous {
                        let reason = format!(
                            "{} went back in time for {}: {} < {}",
                            world.vehicle(index).name(),
                            peer.device_id,
                            peer.timestamp,
                            previous
                        );
                        return (world, Err(reason), metrics);
                    }
                    *previous = peer.timestamp;
                }
            }
        }

        let outcome = check_warnings(&world, &warnings, &mut metrics).and_then(|()| {
            if world.air.stats().frames_dropped == 0 {
                Err("no frames were lost".to_string())
            } else {
                Ok(())
            }
        });
        (world, outcome, metrics)
    }

    /// Two vehicles driving side by side; one brakes at 40 m/s² for 0.25 s.
    ///
    /// **Assertion**: the other vehicle receives exactly one crash SOS.
    fn run_crash_sos(&self, duration: f64) -> (SimWorld, Result<(), String>, ScenarioMetrics) {
        let mut world = self.world(DEFAULT_RANGE_M);
        let a = world.spawn_vehicle("crashing", BASE_LAT, BASE_LON, 20.0, 90.0);
        let b = world.spawn_vehicle("witness", north(20.0), BASE_LON, 20.0, 90.0);
        let metrics = ScenarioMetrics::default();

        if !world.run_until(duration.min(10.0), |w| single_group(w, &[a, b])) {
            return (world, Err("group never formed".into()), metrics);
        }

        world.set_controls(a, -40.0, 0.0);
        world.run_for(0.25);
        world.set_controls(a, 0.0, 0.0);
        world.run_for((duration - world.now().as_secs_f64()).max(1.0));

        let crashing = world.vehicle(a).device_id().clone();
        let received: Vec<_> = world
            .vehicle(b)
            .log()
            .sos_received
            .iter()
            .filter(|s| s.device_id == crashing)
            .collect();

        let outcome = match received.as_slice() {
            [sos] if sos.sos_message.as_deref() == Some(CRASH_SOS_MESSAGE) => Ok(()),
            [sos] => Err(format!("unexpected SOS message {:?}", sos.sos_message)),
            other => Err(format!("expected one crash SOS, got {}", other.len())),
        };
        (world, outcome, metrics)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Runs until exactly one coordinator serves everyone else and all peer tables
/// are full. Returns the coordinator's index.
fn form_group(world: &mut SimWorld, seconds: f64) -> Option<usize> {
    let everyone: Vec<usize> = (0..world.len()).collect();
    if !world.run_until(seconds, |w| single_group(w, &everyone)) {
        return None;
    }
    everyone.into_iter().find(|&i| world.vehicle(i).role() == Role::Coordinator)
}

/// `members` form one group: one coordinator, the rest participants, and
/// everybody knows everybody.
fn single_group(world: &SimWorld, members: &[usize]) -> bool {
    let coordinators = members
        .iter()
        .filter(|&&i| world.vehicle(i).role() == Role::Coordinator)
        .count();
    let participants = members
        .iter()
        .filter(|&&i| world.vehicle(i).role() == Role::Participant)
        .count();
    let acquainted = members.iter().all(|&i| {
        members
            .iter()
            .filter(|&&j| j != i)
            .all(|&j| world.vehicle(i).knows(world.vehicle(j).device_id()))
    });

    coordinators == 1 && participants == members.len() - 1 && acquainted
}

fn watch_for_predicted_danger(world: &mut SimWorld, pair: [usize; 2], duration: f64) -> [Option<(f64, f64)>; 2] {
    let mut warnings = [None, None];
    let end = Duration::from_secs_f64(duration);
    while world.now() < end {
        world.step();
        record_predicted_danger(world, pair, &mut warnings);
    }
    warnings
}

/// Remembers (separation, ttc) at each vehicle's first predicted collision.
fn record_predicted_danger(world: &SimWorld, pair: [usize; 2], warnings: &mut [Option<(f64, f64)>; 2]) {
    for (slot, &index) in pair.iter().enumerate() {
        if warnings[slot].is_some() {
            continue;
        }
        if let RiskAlert::Danger { time_to_collision_s, .. } = world.vehicle(index).alert() {
            if *time_to_collision_s > 0.0 {
                let separation = world.separation(pair[0], pair[1]);
                info!(
                    "{} warned at {:.1} m, TTC {:.1} s",
                    world.vehicle(index).name(),
                    separation,
                    time_to_collision_s
                );
                warnings[slot] = Some((separation, *time_to_collision_s));
            }
        }
    }
}

fn check_warnings(
    world: &SimWorld,
    warnings: &[Option<(f64, f64)>; 2],
    metrics: &mut ScenarioMetrics,
) -> Result<(), String> {
    let config = &world.config.agent.risk;
    for warning in warnings {
        let Some((separation, ttc)) = warning else {
            return Err("a vehicle never predicted the collision".to_string());
        };
        if *ttc > config.horizon_s {
            return Err(format!("TTC {:.1} s beyond the horizon", ttc));
        }
        if *separation <= config.danger_radius_m {
            return Err(format!("warning came only at {:.1} m", separation));
        }
        metrics.first_warning_ttc_s = Some(metrics.first_warning_ttc_s.map_or(*ttc, |t: f64| t.max(*ttc)));
    }
    Ok(())
}

fn collect_metrics(world: &SimWorld, metrics: &mut ScenarioMetrics) {
    let stats = world.air.stats();
    metrics.frames_sent = stats.frames_sent;
    metrics.frames_dropped = stats.frames_dropped;

    for vehicle in world.vehicles() {
        let log = vehicle.log();
        metrics.frames_relayed += log.frames_relayed;
        metrics.role_changes += log.roles.len() as u64;
        metrics.alerts_raised += log.alerts.iter().filter(|(_, a)| *a != RiskAlert::Clear).count() as u64;
        metrics.sos_delivered += log.sos_received.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_passes(scenario: ScenarioId, seed: u64) -> ScenarioResult {
        let result = ScenarioRunner::new(seed).run(scenario);
        assert!(
            result.passed,
            "{} (seed={}) failed: {:?}",
            scenario,
            seed,
            result.failure_reason
        );
        result
    }

    #[test]
    fn test_head_on_scenario() {
        let result = assert_passes(ScenarioId::HeadOn, 42);
        assert!(result.metrics.first_warning_ttc_s.unwrap() > 0.0);
        assert!(result.metrics.alerts_raised >= 2);
    }

    #[test]
    fn test_late_arrival_scenario() {
        let result = assert_passes(ScenarioId::LateArrival, 42);
        assert!(result.metrics.role_changes >= 3);
    }

    #[test]
    fn test_coordinator_loss_scenario() {
        assert_passes(ScenarioId::CoordinatorLoss, 42);
    }

    #[test]
    fn test_sos_relay_scenario() {
        let result = assert_passes(ScenarioId::SosRelay, 42);
        assert!(result.metrics.frames_relayed > 0);
        assert_eq!(result.metrics.sos_delivered, 2);
    }

    #[test]
    fn test_dead_reckoning_scenario() {
        let result = assert_passes(ScenarioId::DeadReckoning, 42);
        assert!(result.metrics.max_position_error_m.unwrap() > 0.0);
    }

    #[test]
    fn test_crash_sos_scenario() {
        assert_passes(ScenarioId::CrashSos, 42);
    }

    #[test]
    fn test_packet_loss_drops_frames() {
        let result = ScenarioRunner::new(42).run(ScenarioId::PacketLoss);
        assert!(result.metrics.frames_dropped > 0);
    }

    #[test]
    fn test_runs_are_deterministic() {
        let first = ScenarioRunner::new(1234).run(ScenarioId::PacketLoss);
        let second = ScenarioRunner::new(1234).run(ScenarioId::PacketLoss);

        assert_eq!(first.passed, second.passed);
        assert_eq!(first.total_ticks, second.total_ticks);
        assert_eq!(first.metrics, second.metrics);
    }

    #[test]
    fn test_too_short_run_fails_cleanly() {
        let result = ScenarioRunner::new(42).with_duration(1.0).run(ScenarioId::LateArrival);
        assert!(!result.passed);
        assert!(result.failure_reason.is_some());
    }
}
