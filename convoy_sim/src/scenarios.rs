//! Scenario catalogue for deterministic simulation runs.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// Two vehicles closing head-on must raise a predicted-collision alert
    HeadOn,

    /// Two isolated self-coordinators must merge once in range
    LateArrival,

    /// The coordinator drives off; the rest must regroup
    CoordinatorLoss,

    /// A participant's SOS reaches the other participant exactly once
    SosRelay,

    /// Estimator tracks truth between sparse fixes
    DeadReckoning,

    /// Lossy links: peer table stays monotonic and alerts still fire
    PacketLoss,

    /// An impact spike raises exactly one automatic SOS
    CrashSos,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::HeadOn,
            ScenarioId::LateArrival,
            ScenarioId::CoordinatorLoss,
            ScenarioId::SosRelay,
            ScenarioId::DeadReckoning,
            ScenarioId::PacketLoss,
            ScenarioId::CrashSos,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::HeadOn => "head_on",
            ScenarioId::LateArrival => "late_arrival",
            ScenarioId::CoordinatorLoss => "coordinator_loss",
            ScenarioId::SosRelay => "sos_relay",
            ScenarioId::DeadReckoning => "dead_reckoning",
            ScenarioId::PacketLoss => "packet_loss",
            ScenarioId::CrashSos => "crash_sos",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::HeadOn => "Two vehicles closing at 40 m/s, expect Danger with a TTC inside the horizon",
            ScenarioId::LateArrival => "Two lone coordinators come into range and converge to one group",
            ScenarioId::CoordinatorLoss => "Coordinator leaves; participants clear peers and re-form",
            ScenarioId::SosRelay => "Participant SOS relayed by the coordinator, delivered once",
            ScenarioId::DeadReckoning => "Fixes every 5 s while turning; estimate stays near truth",
            ScenarioId::PacketLoss => "40% frame loss; monotonic peer table and timely alerts",
            ScenarioId::CrashSos => "Hard braking spike raises one automatic SOS",
        }
    }

    /// Virtual seconds the scenario needs by default.
    pub fn default_duration_secs(&self) -> f64 {
        match self {
            ScenarioId::HeadOn => 8.0,
            ScenarioId::LateArrival => 30.0,
            ScenarioId::CoordinatorLoss => 40.0,
            ScenarioId::SosRelay => 15.0,
            ScenarioId::DeadReckoning => 60.0,
            ScenarioId::PacketLoss => 14.0,
            ScenarioId::CrashSos => 15.0,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "head_on" | "headon" => Ok(ScenarioId::HeadOn),
            "late_arrival" | "latearrival" => Ok(ScenarioId::LateArrival),
            "coordinator_loss" | "coordinatorloss" => Ok(ScenarioId::CoordinatorLoss),
            "sos_relay" | "sosrelay" => Ok(ScenarioId::SosRelay),
            "dead_reckoning" | "deadreckoning" => Ok(ScenarioId::DeadReckoning),
            "packet_loss" | "packetloss" => Ok(ScenarioId::PacketLoss),
            "crash_sos" | "crashsos" => Ok(ScenarioId::CrashSos),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
