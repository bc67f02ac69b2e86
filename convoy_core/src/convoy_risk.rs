//! The "RISK" Engine - proximity zones and short-horizon collision prediction
//!
//! Two independent checks run against the fresh peer set:
//! 1. **Proximity**: current great-circle separation against a danger radius and a
//!    speed-dependent caution radius
//! 2. **Collision**: both vehicles extrapolated at constant speed and bearing over a
//!    short horizon, sampled every `step_s`
//!
//! [`RiskEngine::assess`] folds both into one [`RiskAlert`].

use geo::Point;
use serde::{Deserialize, Serialize};

use crate::vehicle::{distance_m, VehicleState};
use convoy_env::DeviceId;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Separation that is always dangerous (default: 10 m)
    pub danger_radius_m: f64,

    /// Caution radius below `fast_speed_mps` (default: 25 m)
    pub caution_radius_slow_m: f64,

    /// Caution radius at or above `fast_speed_mps` (default: 50 m)
    pub caution_radius_fast_m: f64,

    /// Own speed at which the wider caution radius applies (default: 30 km/h)
    pub fast_speed_mps: f64,

    /// Predicted separation that counts as a collision (default: 10 m)
    pub safety_radius_m: f64,

    /// How far ahead to extrapolate (default: 5 s)
    pub horizon_s: f64,

    /// Extrapolation granularity (default: 0.5 s)
    pub step_s: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            danger_radius_m: 10.0,
            caution_radius_slow_m: 25.0,
            caution_radius_fast_m: 50.0,
            fast_speed_mps: 30.0 / 3.6,
            safety_radius_m: 10.0,
            horizon_s: 5.0,
            step_s: 0.5,
        }
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Proximity classification, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProximityZone {
    Clear,
    Caution,
    Danger,
}

/// A predicted loss of separation with one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct CollisionAlert {
    pub peer_id: DeviceId,

    /// Earliest sampled time at which separation drops below the safety radius
    pub time_to_collision_s: f64,

    pub my_predicted_position: Point<f64>,
    pub peer_predicted_position: Point<f64>,
}

/// What the driver should be told right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskAlert {
    Clear,
    Caution {
        peer_id: DeviceId,
    },
    Danger {
        peer_id: DeviceId,
        /// 0 when the peer is already inside the danger radius
        time_to_collision_s: f64,
    },
}

impl RiskAlert {
    pub fn zone(&self) -> ProximityZone {
        match self {
            RiskAlert::Clear => ProximityZone::Clear,
            RiskAlert::Caution { .. } => ProximityZone::Caution,
            RiskAlert::Danger { .. } => ProximityZone::Danger,
        }
    }
}

impl Default for RiskAlert {
    fn default() -> Self {
        RiskAlert::Clear
    }
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Caution radius for a given own speed.
    pub fn caution_radius(&self, own_speed_mps: f64) -> f64 {
        if own_speed_mps >= self.config.fast_speed_mps {
            self.config.caution_radius_fast_m
        } else {
            self.config.caution_radius_slow_m
        }
    }

    /// Zone of a single peer relative to `own`.
    pub fn classify(&self, own: &VehicleState, peer: &VehicleState) -> ProximityZone {
        if peer.device_id == own.device_id {
            return ProximityZone::Clear;
        }

        let distance = own.distance_to(peer);
        if distance <= self.config.danger_radius_m {
            ProximityZone::Danger
        } else if distance <= self.caution_radius(own.speed as f64) {
            ProximityZone::Caution
        } else {
            ProximityZone::Clear
        }
    }

    /// Worst zone over all peers; stops at the first danger.
    pub fn check_proximity(&self, own: &VehicleState, peers: &[VehicleState]) -> ProximityZone {
        self.worst_peer(own, peers)
            .map_or(ProximityZone::Clear, |(zone, _)| zone)
    }

    /// Samples `t = 0, step, 2·step, ... ≤ horizon` and reports the first `t`
    /// at which predicted separation drops below the safety radius.
    pub fn predict_collision(&self, own: &VehicleState, peer: &VehicleState) -> Option<CollisionAlert> {
        if peer.device_id == own.device_id || self.config.step_s <= 0.0 {
            return None;
        }

        // Integer stepping avoids drift from accumulating 0.5 + 0.5 + ...
        let steps = (self.config.horizon_s / self.config.step_s + 1e-9).floor() as usize;

        (0..=steps).find_map(|k| {
            let t = k as f64 * self.config.step_s;
            let mine = own.project(t);
            let theirs = peer.project(t);

            (distance_m(mine, theirs) < self.config.safety_radius_m).then(|| CollisionAlert {
                peer_id: peer.device_id.clone(),
                time_to_collision_s: t,
                my_predicted_position: mine,
                peer_predicted_position: theirs,
            })
        })
    }

    /// The soonest predicted collision across all peers.
    pub fn earliest_collision(&self, own: &VehicleState, peers: &[VehicleState]) -> Option<CollisionAlert> {
        peers
            .iter()
            .filter_map(|peer| self.predict_collision(own, peer))
            .min_by(|a, b| a.time_to_collision_s.total_cmp(&b.time_to_collision_s))
    }

    /// Combined alert: predicted collision, then danger, then caution.
    pub fn assess(&self, own: &VehicleState, peers: &[VehicleState]) -> RiskAlert {
        if let Some(collision) = self.earliest_collision(own, peers) {
            return RiskAlert::Danger {
                peer_id: collision.peer_id,
                time_to_collision_s: collision.time_to_collision_s,
            };
        }

        match self.worst_peer(own, peers) {
            Some((ProximityZone::Danger, peer)) => RiskAlert::Danger {
                peer_id: peer.device_id.clone(),
                time_to_collision_s: 0.0,
            },
            Some((ProximityZone::Caution, peer)) => RiskAlert::Caution {
                peer_id: peer.device_id.clone(),
            },
            _ => RiskAlert::Clear,
        }
    }

    fn worst_peer<'a>(
        &self,
        own: &VehicleState,
        peers: &'a [VehicleState],
    ) -> Option<(ProximityZone, &'a VehicleState)> {
        let mut worst: Option<(ProximityZone, &VehicleState)> = None;

        for peer in peers {
            let zone = self.classify(own, peer);
            if zone == ProximityZone::Danger {
                return Some((zone, peer));
            }
            if zone > worst.map_or(ProximityZone::Clear, |(z, _)| z) {
                worst = Some((zone, peer));
            }
        }

        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::destination;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    const ORIGIN_LAT: f64 = 52.52;
    const ORIGIN_LON: f64 = 13.405;

    fn vehicle(id: &str, north_m: f64, east_m: f64, speed: f32, bearing: f32) -> VehicleState {
        let origin = Point::new(ORIGIN_LON, ORIGIN_LAT);
        let p = destination(destination(origin, 0.0, north_m), 90.0, east_m);
        VehicleState::new(DeviceId::from(id), p.y(), p.x(), speed, bearing, 0)
    }

    #[test]
    fn test_zone_thresholds() {
        let engine = RiskEngine::default();
        let me = vehicle("me", 0.0, 0.0, 5.0, 0.0);

        assert_eq!(engine.classify(&me, &vehicle("a", 8.0, 0.0, 0.0, 0.0)), ProximityZone::Danger);
        assert_eq!(engine.classify(&me, &vehicle("a", 20.0, 0.0, 0.0, 0.0)), ProximityZone::Caution);
        assert_eq!(engine.classify(&me, &vehicle("a", 40.0, 0.0, 0.0, 0.0)), ProximityZone::Clear);
    }

    #[test]
    fn test_caution_radius_widens_with_speed() {
        let engine = RiskEngine::default();
        let slow = vehicle("me", 0.0, 0.0, 5.0, 0.0);
        let fast = vehicle("me", 0.0, 0.0, 10.0, 0.0);
        let peer = vehicle("a", 40.0, 0.0, 0.0, 0.0);

        assert_eq!(engine.classify(&slow, &peer), ProximityZone::Clear);
        assert_eq!(engine.classify(&fast, &peer), ProximityZone::Caution);
        assert_relative_eq!(engine.caution_radius(30.0 / 3.6), 50.0);
    }

    #[test]
    fn test_worst_zone_wins() {
        let engine = RiskEngine::default();
        let me = vehicle("me", 0.0, 0.0, 0.0, 0.0);
        let peers = vec![
            vehicle("far", 500.0, 0.0, 0.0, 0.0),
            vehicle("near", 20.0, 0.0, 0.0, 0.0),
        ];
        assert_eq!(engine.check_proximity(&me, &peers), ProximityZone::Caution);

        let peers = vec![
            vehicle("near", 20.0, 0.0, 0.0, 0.0),
            vehicle("close", 0.0, 5.0, 0.0, 0.0),
        ];
        assert_eq!(engine.check_proximity(&me, &peers), ProximityZone::Danger);
        assert_eq!(engine.check_proximity(&me, &[]), ProximityZone::Clear);
    }

    #[test]
    fn test_head_on_collision_time() {
        let engine = RiskEngine::default();
        let me = vehicle("me", 0.0, 0.0, 20.0, 0.0);
        let peer = vehicle("peer", 100.0, 0.0, 20.0, 180.0);

        let alert = engine.predict_collision(&me, &peer).unwrap();
        assert_eq!(alert.peer_id, DeviceId::from("peer"));
        assert_relative_eq!(alert.time_to_collision_s, 2.5);
        assert!(distance_m(alert.my_predicted_position, alert.peer_predicted_position) < 10.0);
    }

    #[test]
    fn test_parallel_vehicles_do_not_collide() {
        let engine = RiskEngine::default();
        let me = vehicle("me", 0.0, 0.0, 20.0, 0.0);
        let peer = vehicle("peer", 0.0, 30.0, 20.0, 0.0);
        assert!(engine.predict_collision(&me, &peer).is_none());
    }

    #[test]
    fn test_collision_beyond_horizon_is_ignored() {
        let engine = RiskEngine::default();
        let me = vehicle("me", 0.0, 0.0, 5.0, 0.0);
        let peer = vehicle("peer", 200.0, 0.0, 5.0, 180.0);
        assert!(engine.predict_collision(&me, &peer).is_none());
    }

    #[test]
    fn test_already_overlapping_collides_now() {
        let engine = RiskEngine::default();
        let me = vehicle("me", 0.0, 0.0, 0.0, 0.0);
        let peer = vehicle("peer", 3.0, 0.0, 0.0, 0.0);
        assert_eq!(engine.predict_collision(&me, &peer).unwrap().time_to_collision_s, 0.0);
    }

    #[test]
    fn test_assess_priority() {
        let engine = RiskEngine::default();
        let me = vehicle("me", 0.0, 0.0, 20.0, 0.0);

        // Inside caution radius but diverging
        let caution = vehicle("c", 0.0, -20.0, 20.0, 270.0);
        assert_eq!(
            engine.assess(&me, &[caution.clone()]),
            RiskAlert::Caution { peer_id: DeviceId::from("c") }
        );

        // Oncoming traffic outranks it
        let oncoming = vehicle("o", 100.0, 0.0, 20.0, 180.0);
        match engine.assess(&me, &[caution, oncoming]) {
            RiskAlert::Danger { peer_id, time_to_collision_s } => {
                assert_eq!(peer_id, DeviceId::from("o"));
                assert_relative_eq!(time_to_collision_s, 2.5);
            }
            other => panic!("expected danger, got {:?}", other),
        }

        assert_eq!(engine.assess(&me, &[]), RiskAlert::Clear);
    }

    #[test]
    fn test_self_is_never_a_threat() {
        let engine = RiskEngine::default();
        let me = vehicle("me", 0.0, 0.0, 0.0, 0.0);
        assert_eq!(engine.assess(&me, &[me.clone()]), RiskAlert::Clear);
    }

    proptest! {
        #[test]
        fn prop_collision_time_on_sample_grid(
            north in 0.0f64..150.0,
            east in -30.0f64..30.0,
            my_speed in 0.0f32..30.0,
            peer_speed in 0.0f32..30.0,
            peer_bearing in 0.0f32..360.0,
        ) {
            let engine = RiskEngine::default();
            let me = vehicle("me", 0.0, 0.0, my_speed, 0.0);
            let peer = vehicle("peer", north, east, peer_speed, peer_bearing);

            if let Some(alert) = engine.predict_collision(&me, &peer) {
                let t = alert.time_to_collision_s;
                prop_assert!((0.0..=5.0).contains(&t));
                prop_assert_eq!((t / 0.5).fract(), 0.0);
            }
        }
    }
}
