//! Convoy Core - Ad-hoc Vehicle-to-Vehicle Awareness
//!
//! Vehicles in radio range form a small ad-hoc group, exchange their fused
//! position, speed and heading once a second, and warn their drivers about
//! imminent collisions and distress calls. No infrastructure is involved:
//! one vehicle coordinates the group and relays between the others.
//!
//! # Engines
//!
//! 1. **Fusion** (`convoy_fusion`): EKF over GNSS fixes and IMU samples
//! 2. **Peers** (`convoy_peers`): latest state per vehicle, staleness, SOS dedup
//! 3. **Risk** (`convoy_risk`): proximity zones and linear collision prediction
//! 4. **Session** (`convoy_session`): pure group-formation state machine
//! 5. **Exchange** (`convoy_exchange`): length-prefixed JSON over TCP, star relay
//!
//! [`ConvoyAgent`] wires them to a [`convoy_env::ConvoyContext`] and an
//! [`convoy_env::AdHocNetwork`].

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod agent_runtime;
pub mod config;
pub mod convoy_exchange;
pub mod convoy_fusion;
pub mod convoy_peers;
pub mod convoy_risk;
pub mod convoy_session;
pub mod crash_detection;
pub mod vehicle;

// Re-export key types for convenience
pub use agent_runtime::{AgentError, AgentEvent, AgentHandle, AgentStatus, ConvoyAgent};
pub use config::{AgentConfig, ConfigError};
pub use convoy_exchange::{accept_payload, encode_frame, ExchangeConfig, ExchangeError, ExchangeHub, Inbound};
pub use convoy_fusion::{Estimator, EstimatorConfig, EstimatorError, FusedState, LocationFix};
pub use convoy_peers::{IngestOutcome, PeerTable, PeerTableConfig, SosLedger};
pub use convoy_risk::{CollisionAlert, ProximityZone, RiskAlert, RiskConfig, RiskEngine};
pub use convoy_session::{Role, SessionAction, SessionConfig, SessionError, SessionEvent, SessionMachine};
pub use crash_detection::{CrashConfig, CrashDetector};
pub use vehicle::{VehicleState, Waypoint};

/// Locks a std mutex, recovering the data if a holder panicked.
///
/// Every guarded value here is left consistent between statements, so a
/// poisoned lock is still safe to use.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
