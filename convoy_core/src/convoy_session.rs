//! The "SESSION" Machine - group discovery, election and membership
//!
//! A Sans-IO state machine: platform notifications and timer expiries go in as
//! [`SessionEvent`]s, and what the agent must do comes out as [`SessionAction`]s.
//! No sockets, clocks or radios are touched here, so every transition can be
//! replayed in a unit test.
//!
//! ```text
//!            start()                 peers found
//!   Idle ─────────────► Discovering ─────────────► Connecting
//!    ▲                    ▲   │ discovery timeout     │  │
//!    │ terminal error     │   └─► Connecting(own) ────┘  │ formed
//!    │                    │ dissolved / lost / timeout   ▼
//!    └──────────────── Coordinator | Participant ◄───────┘
//! ```
//!
//! Timers are identified by an epoch. Arming a timer or changing role bumps the
//! epoch, so a late expiry of an older timer is ignored.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::vehicle::VehicleState;
use convoy_env::{Candidate, CapabilityStatus, EnvError, GroupInfo, PlatformEvent};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Discovery without a usable candidate before self-coordinating (default: 10 s)
    pub discovery_timeout_ms: u64,

    /// Time allowed for a connect or group creation to report back (default: 15 s)
    pub connect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// This vehicle's place in the group. Exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Idle,
    Discovering,
    Connecting,
    Coordinator,
    Participant,
}

/// What a `Connecting` session is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Peer(Candidate),
    OwnGroup,
}

/// Platform request that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Discover,
    StopDiscovery,
    Connect,
    CreateGroup,
    RemoveGroup,
    Listen,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("ad-hoc networking unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl SessionError {
    fn from_env(error: &EnvError) -> Self {
        match error {
            EnvError::PermissionDenied(reason) => SessionError::PermissionDenied(reason.clone()),
            other => SessionError::CapabilityUnavailable(other.to_string()),
        }
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeersChanged(Vec<Candidate>),
    ConnectionInfoAvailable(GroupInfo),
    GroupDissolved,
    CapabilityStatusChanged(CapabilityStatus),

    /// A remote state was accepted by the exchange
    DataReceived(VehicleState),

    /// Number of participants connected to our listener changed
    ParticipantsChanged(usize),

    OperationFailed {
        operation: Operation,
        error: EnvError,
    },

    TimerFired {
        epoch: u64,
    },
}

impl From<PlatformEvent> for SessionEvent {
    fn from(event: PlatformEvent) -> Self {
        match event {
            PlatformEvent::PeersChanged(peers) => SessionEvent::PeersChanged(peers),
            PlatformEvent::ConnectionInfoAvailable(info) => SessionEvent::ConnectionInfoAvailable(info),
            PlatformEvent::GroupDissolved => SessionEvent::GroupDissolved,
            PlatformEvent::CapabilityStatusChanged(status) => SessionEvent::CapabilityStatusChanged(status),
        }
    }
}

/// Outputs of the machine, executed in order by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    StartDiscovery,
    StopDiscovery,
    Connect(Candidate),
    CreateGroup,
    RemoveGroup,

    /// Bind the coordinator listener
    OpenListener,

    /// Open the participant socket to the coordinator
    OpenOutbound(SocketAddr),

    /// Close every data socket (listener, accepted and outbound)
    CloseSockets,

    /// Forget all peer states
    ClearPeers,

    /// Deliver `TimerFired { epoch }` after `after`
    ArmTimer {
        epoch: u64,
        after: Duration,
    },

    /// Surface a terminal failure to the application
    ReportFatal(SessionError),
}

// ============================================================================
// MACHINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionMachine {
    config: SessionConfig,

    /// Our platform address, used to break ties between lone coordinators
    local_address: String,

    role: Role,
    target: Option<ConnectTarget>,
    coordinator_address: Option<SocketAddr>,
    participants: usize,
    timer_epoch: u64,
    fatal: Option<SessionError>,
}

impl SessionMachine {
    pub fn new(config: SessionConfig, local_address: impl Into<String>) -> Self {
        Self {
            config,
            local_address: local_address.into(),
            role: Role::Idle,
            target: None,
            coordinator_address: None,
            participants: 0,
            timer_epoch: 0,
            fatal: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn target(&self) -> Option<&ConnectTarget> {
        self.target.as_ref()
    }

    pub fn coordinator_address(&self) -> Option<SocketAddr> {
        self.coordinator_address
    }

    pub fn fatal_error(&self) -> Option<&SessionError> {
        self.fatal.as_ref()
    }

    /// Leaves `Idle` and begins discovery. Does nothing after a terminal error.
    pub fn start(&mut self) -> Vec<SessionAction> {
        if self.role != Role::Idle || self.fatal.is_some() {
            return Vec::new();
        }
        info!("Session starting");
        self.enter_discovering()
    }

    /// Explicit teardown back to `Idle`.
    pub fn shutdown(&mut self) -> Vec<SessionAction> {
        let mut actions = vec![SessionAction::StopDiscovery, SessionAction::CloseSockets];
        if matches!(self.role, Role::Connecting | Role::Coordinator | Role::Participant) {
            actions.push(SessionAction::RemoveGroup);
        }
        actions.push(SessionAction::ClearPeers);

        info!("Session shut down from {:?}", self.role);
        self.reset(Role::Idle);
        actions
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        if self.role == Role::Idle {
            return match event {
                SessionEvent::CapabilityStatusChanged(status) if status != CapabilityStatus::Available => {
                    self.on_capability(status)
                }
                _ => Vec::new(),
            };
        }

        match event {
            SessionEvent::PeersChanged(candidates) => self.on_peers(candidates),
            SessionEvent::ConnectionInfoAvailable(info) => self.on_connection_info(info),
            SessionEvent::GroupDissolved => self.on_group_lost("group dissolved"),
            SessionEvent::CapabilityStatusChanged(status) => self.on_capability(status),
            SessionEvent::DataReceived(_) => Vec::new(),
            SessionEvent::ParticipantsChanged(count) => {
                if self.role == Role::Coordinator {
                    self.participants = count;
                }
                Vec::new()
            }
            SessionEvent::OperationFailed { operation, error } => self.on_failure(operation, error),
            SessionEvent::TimerFired { epoch } => self.on_timer(epoch),
        }
    }

    // ========== Transitions ==========

    fn on_peers(&mut self, candidates: Vec<Candidate>) -> Vec<SessionAction> {
        match self.role {
            Role::Discovering => {
                // Joining an existing group beats forming a new one
                let Some(chosen) = candidates
                    .iter()
                    .find(|c| c.group_owner)
                    .or_else(|| candidates.first())
                    .cloned()
                else {
                    return Vec::new();
                };

                info!("Connecting to {} ({})", chosen.name, chosen.address);
                let mut actions = vec![SessionAction::StopDiscovery];
                actions.extend(self.enter_connecting(ConnectTarget::Peer(chosen)));
                actions
            }
            Role::Coordinator if self.participants == 0 => {
                // Two lone coordinators in range: the higher address yields
                let Some(owner) = candidates
                    .iter()
                    .filter(|c| c.group_owner && c.address < self.local_address)
                    .min_by(|a, b| a.address.cmp(&b.address))
                    .cloned()
                else {
                    return Vec::new();
                };

                info!("Yielding empty group to coordinator {}", owner.address);
                let mut actions = vec![
                    SessionAction::StopDiscovery,
                    SessionAction::CloseSockets,
                    SessionAction::ClearPeers,
                    SessionAction::RemoveGroup,
                ];
                actions.extend(self.enter_connecting(ConnectTarget::Peer(owner)));
                actions
            }
            _ => Vec::new(),
        }
    }

    fn on_connection_info(&mut self, info: GroupInfo) -> Vec<SessionAction> {
        if !info.formed {
            return match self.role {
                Role::Connecting | Role::Coordinator | Role::Participant => {
                    self.on_group_lost("group not formed")
                }
                _ => Vec::new(),
            };
        }

        if info.is_coordinator {
            return self.become_coordinator();
        }

        match info.coordinator_address {
            Some(address) => self.become_participant(address),
            None => {
                warn!("Group formed without a coordinator address");
                self.on_group_lost("missing coordinator address")
            }
        }
    }

    fn become_coordinator(&mut self) -> Vec<SessionAction> {
        if self.role == Role::Coordinator {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.role == Role::Participant {
            actions.extend([SessionAction::CloseSockets, SessionAction::ClearPeers]);
        }

        info!("Elected coordinator");
        self.reset(Role::Coordinator);
        // Keep discovering so another lone coordinator in range can be merged with
        actions.extend([SessionAction::OpenListener, SessionAction::StartDiscovery]);
        actions
    }

    fn become_participant(&mut self, address: SocketAddr) -> Vec<SessionAction> {
        if self.role == Role::Participant && self.coordinator_address == Some(address) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if matches!(self.role, Role::Coordinator | Role::Participant) {
            actions.extend([SessionAction::CloseSockets, SessionAction::ClearPeers]);
        }
        if self.role == Role::Discovering {
            actions.push(SessionAction::StopDiscovery);
        }

        info!("Joined group as participant, coordinator at {}", address);
        self.reset(Role::Participant);
        self.coordinator_address = Some(address);
        actions.push(SessionAction::OpenOutbound(address));
        actions
    }

    fn on_group_lost(&mut self, reason: &str) -> Vec<SessionAction> {
        match self.role {
            Role::Coordinator | Role::Participant => {
                info!("Left group ({}), rediscovering", reason);
                let mut actions = vec![SessionAction::CloseSockets, SessionAction::ClearPeers];
                actions.extend(self.enter_discovering());
                actions
            }
            Role::Connecting => {
                info!("Connection attempt ended ({}), rediscovering", reason);
                self.enter_discovering()
            }
            Role::Idle | Role::Discovering => Vec::new(),
        }
    }

    fn on_capability(&mut self, status: CapabilityStatus) -> Vec<SessionAction> {
        match status {
            CapabilityStatus::Available => Vec::new(),
            CapabilityStatus::Unavailable => {
                self.fail(SessionError::CapabilityUnavailable("radio disabled".to_string()))
            }
            CapabilityStatus::PermissionDenied => {
                self.fail(SessionError::PermissionDenied("ad-hoc networking".to_string()))
            }
        }
    }

    fn on_failure(&mut self, operation: Operation, error: EnvError) -> Vec<SessionAction> {
        if error.is_terminal() {
            return self.fail(SessionError::from_env(&error));
        }

        warn!("{:?} failed: {}", operation, error);
        match (self.role, operation) {
            // The discovery timer is still armed and will fall back to self-coordination
            (Role::Discovering, _) => Vec::new(),
            (Role::Connecting, Operation::Connect | Operation::CreateGroup) => self.enter_discovering(),
            (Role::Coordinator, Operation::Listen) => {
                let mut actions = vec![
                    SessionAction::CloseSockets,
                    SessionAction::ClearPeers,
                    SessionAction::RemoveGroup,
                ];
                actions.extend(self.enter_discovering());
                actions
            }
            _ => Vec::new(),
        }
    }

    fn on_timer(&mut self, epoch: u64) -> Vec<SessionAction> {
        if epoch != self.timer_epoch {
            debug!("Ignoring stale timer (epoch {} != {})", epoch, self.timer_epoch);
            return Vec::new();
        }

        match self.role {
            Role::Discovering => {
                info!("No usable peers found, forming own group");
                let mut actions = vec![SessionAction::StopDiscovery, SessionAction::CreateGroup];
                actions.extend(self.enter_connecting(ConnectTarget::OwnGroup));
                actions
            }
            Role::Connecting => {
                warn!("Connection attempt timed out");
                let mut actions = vec![SessionAction::RemoveGroup];
                actions.extend(self.enter_discovering());
                actions
            }
            _ => Vec::new(),
        }
    }

    fn fail(&mut self, error: SessionError) -> Vec<SessionAction> {
        warn!("Session failed: {}", error);
        let actions = vec![
            SessionAction::StopDiscovery,
            SessionAction::CloseSockets,
            SessionAction::ClearPeers,
            SessionAction::ReportFatal(error.clone()),
        ];
        self.reset(Role::Idle);
        self.fatal = Some(error);
        actions
    }

    // ========== Helpers ==========

    fn enter_discovering(&mut self) -> Vec<SessionAction> {
        self.reset(Role::Discovering);
        vec![
            SessionAction::StartDiscovery,
            SessionAction::ArmTimer {
                epoch: self.timer_epoch,
                after: Duration::from_millis(self.config.discovery_timeout_ms),
            },
        ]
    }

    /// Enters `Connecting`; the caller has already issued the platform request
    /// for `OwnGroup`, while a `Peer` target gets its `Connect` here.
    fn enter_connecting(&mut self, target: ConnectTarget) -> Vec<SessionAction> {
        self.reset(Role::Connecting);
        let mut actions = Vec::new();
        if let ConnectTarget::Peer(candidate) = &target {
            actions.push(SessionAction::Connect(candidate.clone()));
        }
        actions.push(SessionAction::ArmTimer {
            epoch: self.timer_epoch,
            after: Duration::from_millis(self.config.connect_timeout_ms),
        });
        self.target = Some(target);
        actions
    }

    /// Switches role, dropping per-role state and invalidating pending timers.
    fn reset(&mut self, role: Role) {
        self.role = role;
        self.target = None;
        self.coordinator_address = None;
        self.participants = 0;
        self.timer_epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn machine() -> SessionMachine {
        SessionMachine::new(SessionConfig::default(), "m")
    }

    fn coordinator_addr() -> SocketAddr {
        "192.168.49.1:8888".parse().unwrap()
    }

    fn armed_epoch(actions: &[SessionAction]) -> u64 {
        actions
            .iter()
            .find_map(|a| match a {
                SessionAction::ArmTimer { epoch, .. } => Some(*epoch),
                _ => None,
            })
            .expect("a timer should be armed")
    }

    fn discovering() -> (SessionMachine, u64) {
        let mut m = machine();
        let actions = m.start();
        let epoch = armed_epoch(&actions);
        (m, epoch)
    }

    #[test]
    fn test_start_begins_discovery() {
        let mut m = machine();
        let actions = m.start();
        assert_eq!(m.role(), Role::Discovering);
        assert_eq!(actions[0], SessionAction::StartDiscovery);
        assert!(matches!(
            actions[1],
            SessionAction::ArmTimer { after, .. } if after == Duration::from_secs(10)
        ));
        assert!(m.start().is_empty());
    }

    #[test]
    fn test_discovery_to_participant() {
        let (mut m, _) = discovering();

        let actions = m.handle(SessionEvent::PeersChanged(vec![
            Candidate::new("aa", "first"),
            Candidate::new("bb", "second"),
        ]));
        assert_eq!(m.role(), Role::Connecting);
        assert!(actions.contains(&SessionAction::Connect(Candidate::new("aa", "first"))));

        let actions = m.handle(SessionEvent::ConnectionInfoAvailable(GroupInfo::participant(
            coordinator_addr(),
        )));
        assert_eq!(m.role(), Role::Participant);
        assert_eq!(actions, vec![SessionAction::OpenOutbound(coordinator_addr())]);
    }

    #[test]
    fn test_existing_group_preferred() {
        let (mut m, _) = discovering();
        let owner = Candidate::new("zz", "owner").owning_group();
        m.handle(SessionEvent::PeersChanged(vec![Candidate::new("aa", "lone"), owner.clone()]));
        assert_eq!(m.target(), Some(&ConnectTarget::Peer(owner)));
    }

    #[test]
    fn test_empty_candidate_list_keeps_discovering() {
        let (mut m, _) = discovering();
        assert!(m.handle(SessionEvent::PeersChanged(vec![])).is_empty());
        assert_eq!(m.role(), Role::Discovering);
    }

    #[test]
    fn test_discovery_timeout_self_coordinates() {
        let (mut m, epoch) = discovering();

        let actions = m.handle(SessionEvent::TimerFired { epoch });
        assert_eq!(m.role(), Role::Connecting);
        assert_eq!(m.target(), Some(&ConnectTarget::OwnGroup));
        assert!(actions.contains(&SessionAction::CreateGroup));

        let actions = m.handle(SessionEvent::ConnectionInfoAvailable(GroupInfo::coordinator()));
        assert_eq!(m.role(), Role::Coordinator);
        assert!(actions.contains(&SessionAction::OpenListener));
    }

    #[test]
    fn test_stale_timer_ignored() {
        let (mut m, old_epoch) = discovering();
        m.handle(SessionEvent::PeersChanged(vec![Candidate::new("aa", "a")]));

        assert!(m.handle(SessionEvent::TimerFired { epoch: old_epoch }).is_empty());
        assert_eq!(m.role(), Role::Connecting);
    }

    #[test]
    fn test_connect_timeout_rediscovers() {
        let (mut m, _) = discovering();
        let actions = m.handle(SessionEvent::PeersChanged(vec![Candidate::new("aa", "a")]));
        let epoch = armed_epoch(&actions);

        let actions = m.handle(SessionEvent::TimerFired { epoch });
        assert_eq!(m.role(), Role::Discovering);
        assert!(actions.contains(&SessionAction::StartDiscovery));
    }

    #[test]
    fn test_coordinator_keeps_role_on_repeat_info() {
        let (mut m, epoch) = discovering();
        m.handle(SessionEvent::TimerFired { epoch });
        m.handle(SessionEvent::ConnectionInfoAvailable(GroupInfo::coordinator()));

        assert!(m
            .handle(SessionEvent::ConnectionInfoAvailable(GroupInfo::coordinator()))
            .is_empty());
        assert_eq!(m.role(), Role::Coordinator);
    }

    #[test]
    fn test_participant_loses_group() {
        let (mut m, _) = discovering();
        m.handle(SessionEvent::PeersChanged(vec![Candidate::new("aa", "a")]));
        m.handle(SessionEvent::ConnectionInfoAvailable(GroupInfo::participant(coordinator_addr())));

        let actions = m.handle(SessionEvent::GroupDissolved);
        assert_eq!(m.role(), Role::Discovering);
        assert_eq!(m.coordinator_address(), None);
        assert_eq!(&actions[..2], &[SessionAction::CloseSockets, SessionAction::ClearPeers]);
        assert!(actions.contains(&SessionAction::StartDiscovery));
    }

    #[test]
    fn test_not_formed_while_discovering_is_ignored() {
        let (mut m, _) = discovering();
        assert!(m
            .handle(SessionEvent::ConnectionInfoAvailable(GroupInfo::not_formed()))
            .is_empty());
        assert_eq!(m.role(), Role::Discovering);
    }

    #[test]
    fn test_transient_connect_failure_rediscovers() {
        let (mut m, _) = discovering();
        m.handle(SessionEvent::PeersChanged(vec![Candidate::new("aa", "a")]));

        m.handle(SessionEvent::OperationFailed {
            operation: Operation::Connect,
            error: EnvError::Busy,
        });
        assert_eq!(m.role(), Role::Discovering);
        assert!(m.fatal_error().is_none());
    }

    #[test]
    fn test_terminal_failure_is_reported() {
        let (mut m, _) = discovering();
        let actions = m.handle(SessionEvent::OperationFailed {
            operation: Operation::Discover,
            error: EnvError::PermissionDenied("location".into()),
        });

        assert_eq!(m.role(), Role::Idle);
        assert!(matches!(
            actions.last(),
            Some(SessionAction::ReportFatal(SessionError::PermissionDenied(_)))
        ));
        // Terminal errors are not retried
        assert!(m.start().is_empty());
    }

    #[test]
    fn test_radio_disabled_is_terminal() {
        let (mut m, _) = discovering();
        let actions = m.handle(SessionEvent::CapabilityStatusChanged(CapabilityStatus::Unavailable));
        assert_eq!(m.role(), Role::Idle);
        assert!(actions
            .iter()
            .any(|a| matches!(a, SessionAction::ReportFatal(SessionError::CapabilityUnavailable(_)))));
    }

    #[test]
    fn test_lone_coordinator_yields_to_lower_address() {
        let mut m = SessionMachine::new(SessionConfig::default(), "bb");
        let epoch = armed_epoch(&m.start());
        m.handle(SessionEvent::TimerFired { epoch });
        m.handle(SessionEvent::ConnectionInfoAvailable(GroupInfo::coordinator()));

        // A higher address never makes us yield
        assert!(m
            .handle(SessionEvent::PeersChanged(vec![Candidate::new("cc", "c").owning_group()]))
            .is_empty());

        let lower = Candidate::new("aa", "a").owning_group();
        let actions = m.handle(SessionEvent::PeersChanged(vec![lower.clone()]));
        assert_eq!(m.role(), Role::Connecting);
        assert!(actions.contains(&SessionAction::RemoveGroup));
        assert!(actions.contains(&SessionAction::Connect(lower)));
    }

    #[test]
    fn test_coordinator_with_participants_does_not_yield() {
        let mut m = SessionMachine::new(SessionConfig::default(), "bb");
        let epoch = armed_epoch(&m.start());
        m.handle(SessionEvent::TimerFired { epoch });
        m.handle(SessionEvent::ConnectionInfoAvailable(GroupInfo::coordinator()));
        m.handle(SessionEvent::ParticipantsChanged(2));

        let lower = Candidate::new("aa", "a").owning_group();
        assert!(m.handle(SessionEvent::PeersChanged(vec![lower])).is_empty());
        assert_eq!(m.role(), Role::Coordinator);
    }

    #[test]
    fn test_shutdown_returns_to_idle() {
        let (mut m, _) = discovering();
        m.handle(SessionEvent::PeersChanged(vec![Candidate::new("aa", "a")]));
        m.handle(SessionEvent::ConnectionInfoAvailable(GroupInfo::participant(coordinator_addr())));

        let actions = m.shutdown();
        assert_eq!(m.role(), Role::Idle);
        assert!(actions.contains(&SessionAction::CloseSockets));
        assert!(actions.contains(&SessionAction::RemoveGroup));
        assert!(m.handle(SessionEvent::GroupDissolved).is_empty());
    }

    fn arb_event() -> impl Strategy<Value = SessionEvent> {
        prop_oneof![
            Just(SessionEvent::PeersChanged(vec![])),
            Just(SessionEvent::PeersChanged(vec![Candidate::new("aa", "a")])),
            Just(SessionEvent::PeersChanged(vec![Candidate::new("00", "o").owning_group()])),
            Just(SessionEvent::ConnectionInfoAvailable(GroupInfo::coordinator())),
            Just(SessionEvent::ConnectionInfoAvailable(GroupInfo::participant(
                "10.0.0.1:8888".parse().unwrap()
            ))),
            Just(SessionEvent::ConnectionInfoAvailable(GroupInfo::not_formed())),
            Just(SessionEvent::GroupDissolved),
            Just(SessionEvent::OperationFailed {
                operation: Operation::Connect,
                error: EnvError::Busy,
            }),
            (0u64..12).prop_map(|epoch| SessionEvent::TimerFired { epoch }),
            (0usize..3).prop_map(SessionEvent::ParticipantsChanged),
        ]
    }

    proptest! {
        #[test]
        fn prop_role_and_sockets_stay_consistent(events in proptest::collection::vec(arb_event(), 0..60)) {
            let mut m = machine();
            m.start();

            for event in events {
                let actions = m.handle(event);

                // Never asked to be listener and outbound client at once
                let listens = actions.iter().any(|a| *a == SessionAction::OpenListener);
                let dials = actions.iter().any(|a| matches!(a, SessionAction::OpenOutbound(_)));
                prop_assert!(!(listens && dials));

                prop_assert_eq!(m.coordinator_address().is_some(), m.role() == Role::Participant);
                prop_assert_eq!(m.target().is_some(), m.role() == Role::Connecting);
                prop_assert!(m.fatal_error().is_none());
            }
        }
    }
}
