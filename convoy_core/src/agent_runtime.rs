//! Agent Runtime - Orchestrates the Convoy engines with the environment context.
//!
//! This module is the integration layer between the pure engines (fusion, peers,
//! risk, session) and the outside world (`ConvoyContext`, `AdHocNetwork`, TCP).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ConvoyAgent                           │
//! │  sensors ──► AgentHandle ──► Estimator ──► own state ─┐      │
//! │                                                        ▼      │
//! │  AdHocNetwork ──► SessionMachine ──► actions      RiskEngine │
//! │                        │                               ▲      │
//! │                        ▼                               │      │
//! │                   ExchangeHub ──► PeerTable ───────────┘      │
//! │                        ▲                                      │
//! │  send scheduler ───────┘ (every send_interval)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sensor callbacks, the session loop, the send scheduler and every socket
//! reader run independently; they meet only at short-lived locks.
//!
//! # Usage
//!
//! ```ignore
//! use convoy_core::{AgentConfig, ConvoyAgent};
//! use convoy_env::{DeviceId, TokioContext};
//!
//! let (agent, handle) = ConvoyAgent::new(DeviceId::new(), TokioContext::shared(), radio, AgentConfig::default());
//! tokio::spawn(agent.run());
//!
//! handle.submit_fix(fix)?;
//! let mut alerts = handle.subscribe_alert();
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::convoy_exchange::{Clock, ExchangeError, ExchangeEvent, ExchangeHub};
use crate::convoy_fusion::{Estimator, EstimatorError, FusedState, LocationFix};
use crate::convoy_peers::{PeerTable, SosLedger};
use crate::convoy_risk::{RiskAlert, RiskEngine};
use crate::convoy_session::{Operation, Role, SessionAction, SessionError, SessionEvent, SessionMachine};
use crate::crash_detection::{CrashDetector, CRASH_SOS_MESSAGE};
use crate::lock;
use crate::vehicle::VehicleState;
use convoy_env::{AdHocNetwork, CapabilityStatus, ConvoyContext, DeviceId, EnvError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgentError {
    #[error("Session ended: {0}")]
    Session(#[from] SessionError),

    #[error("No position fix yet")]
    NoFix,

    #[error("Agent has stopped")]
    Stopped,
}

/// Snapshot of the agent for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub role: Role,
    pub capability: CapabilityStatus,

    /// No fix received yet; own state and alerts are unavailable
    pub awaiting_fix: bool,

    pub peer_count: usize,

    /// Connected participants (coordinator only)
    pub participant_count: usize,

    /// Bound listener address (coordinator only)
    pub listen_addr: Option<SocketAddr>,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            role: Role::Idle,
            capability: CapabilityStatus::Available,
            awaiting_fix: true,
            peer_count: 0,
            participant_count: 0,
            listen_addr: None,
        }
    }
}

/// Discrete notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// First sighting of a distress record from another vehicle
    SosReceived(VehicleState),

    RoleChanged(Role),

    /// The session hit a terminal error and the agent stopped
    Fatal(SessionError),
}

enum Command {
    Priority(VehicleState),
    Shutdown,
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// State touched from sensor callbacks, the session loop and socket readers.
struct Shared {
    device_id: DeviceId,
    estimator: Mutex<Estimator>,
    angular_velocity: Mutex<[f64; 3]>,
    crash: Mutex<CrashDetector>,
    peers: Arc<Mutex<PeerTable>>,
    sos: Arc<Mutex<SosLedger>>,
    risk: RiskEngine,
    clock: Clock,
    stopped: AtomicBool,

    own_tx: watch::Sender<Option<FusedState>>,
    peers_tx: watch::Sender<Vec<VehicleState>>,
    alert_tx: watch::Sender<RiskAlert>,
    status_tx: watch::Sender<AgentStatus>,
    events_tx: broadcast::Sender<AgentEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Shared {
    fn own_state(&self) -> Option<FusedState> {
        lock(&self.estimator).get_state()
    }

    fn own_vehicle_state(&self) -> Option<VehicleState> {
        self.own_state()
            .map(|state| state.to_vehicle_state(self.device_id.clone()))
    }

    /// Evicts stale peers, then recomputes and publishes own state, peers and alert.
    fn reevaluate(&self) {
        let own = self.own_vehicle_state();
        let peers = lock(&self.peers).fresh_states((self.clock)());

        let alert = match &own {
            Some(own) => self.risk.assess(own, &peers),
            None => RiskAlert::Clear,
        };

        self.own_tx.send_replace(self.own_state());
        self.peers_tx.send_replace(peers);
        self.alert_tx.send_if_modified(|current| {
            if *current == alert {
                return false;
            }
            match &alert {
                RiskAlert::Danger { peer_id, time_to_collision_s } => {
                    warn!("DANGER: {} (collision in {:.1}s)", peer_id, time_to_collision_s)
                }
                RiskAlert::Caution { peer_id } => info!("Caution: {} nearby", peer_id),
                RiskAlert::Clear => info!("All clear"),
            }
            *current = alert.clone();
            true
        });
    }

    fn clear_peers(&self) {
        lock(&self.peers).clear();
        self.reevaluate();
    }

    fn publish_event(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Application-facing side of a running agent.
///
/// The sensor entry points are synchronous and only take short locks, so they
/// can be called straight from platform sensor callbacks.
#[derive(Clone)]
pub struct AgentHandle {
    shared: Arc<Shared>,
}

impl AgentHandle {
    pub fn device_id(&self) -> &DeviceId {
        &self.shared.device_id
    }

    /// Feeds a GNSS fix.
    pub fn submit_fix(&self, fix: LocationFix) -> Result<(), EstimatorError> {
        let result = lock(&self.shared.estimator).update(&fix);
        if let Err(e) = &result {
            debug!("Fix rejected: {}", e);
        }
        self.shared.reevaluate();
        self.publish_awaiting_fix();
        result
    }

    /// Feeds a gyroscope sample; applied with the next acceleration sample.
    pub fn submit_rotation(&self, angular_velocity: [f64; 3]) {
        *lock(&self.shared.angular_velocity) = angular_velocity;
    }

    /// Feeds a navigation-frame acceleration sample `[east, north, up]` (m/s²).
    pub fn submit_acceleration(&self, acceleration: [f64; 3], timestamp_nanos: i64) {
        let angular_velocity = *lock(&self.shared.angular_velocity);
        let own = {
            let mut estimator = lock(&self.shared.estimator);
            estimator.predict(acceleration, angular_velocity, timestamp_nanos);
            estimator.get_state()
        };
        self.shared.own_tx.send_replace(own);

        let impact = lock(&self.shared.crash).observe(acceleration, timestamp_nanos / 1_000_000);
        if impact {
            if let Err(e) = self.trigger_sos(CRASH_SOS_MESSAGE) {
                warn!("Impact detected but SOS not sent: {}", e);
            }
        }
    }

    /// Raises a distress record from the current own state and sends it immediately.
    pub fn trigger_sos(&self, message: &str) -> Result<VehicleState, AgentError> {
        let own = self.shared.own_vehicle_state().ok_or(AgentError::NoFix)?;
        let sos = VehicleState::sos(&own, message);
        warn!("Raising SOS {:?}: {}", sos.sos_id, message);
        self.broadcast_priority(sos.clone())?;
        Ok(sos)
    }

    /// Sends `state` right away, outside the periodic schedule.
    pub fn broadcast_priority(&self, state: VehicleState) -> Result<(), AgentError> {
        self.shared
            .commands
            .send(Command::Priority(state))
            .map_err(|_| AgentError::Stopped)
    }

    /// Asks the agent to leave its group and stop.
    pub fn shutdown(&self) {
        let _ = self.shared.commands.send(Command::Shutdown);
    }

    pub fn own_state(&self) -> Option<FusedState> {
        *self.shared.own_tx.borrow()
    }

    pub fn peers(&self) -> Vec<VehicleState> {
        self.shared.peers_tx.borrow().clone()
    }

    pub fn alert(&self) -> RiskAlert {
        self.shared.alert_tx.borrow().clone()
    }

    pub fn status(&self) -> AgentStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn subscribe_own_state(&self) -> watch::Receiver<Option<FusedState>> {
        self.shared.own_tx.subscribe()
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<VehicleState>> {
        self.shared.peers_tx.subscribe()
    }

    pub fn subscribe_alert(&self) -> watch::Receiver<RiskAlert> {
        self.shared.alert_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AgentStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.shared.events_tx.subscribe()
    }

    fn publish_awaiting_fix(&self) {
        let awaiting = !lock(&self.shared.estimator).is_initialized();
        self.shared.status_tx.send_if_modified(|status| {
            let changed = status.awaiting_fix != awaiting;
            status.awaiting_fix = awaiting;
            changed
        });
    }
}

// ============================================================================
// AGENT
// ============================================================================

/// A Convoy agent that orchestrates all engines.
///
/// Generic over the context and network implementations, allowing the same
/// agent code to run against a phone's radio or a scripted test double.
pub struct ConvoyAgent<Ctx, Net>
where
    Ctx: ConvoyContext,
    Net: AdHocNetwork,
{
    context: Arc<Ctx>,
    network: Arc<Net>,
    config: AgentConfig,
    machine: SessionMachine,
    hub: ExchangeHub,
    shared: Arc<Shared>,
    capability: CapabilityStatus,
    listen_addr: Option<SocketAddr>,

    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    exchange_rx: mpsc::UnboundedReceiver<ExchangeEvent>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl<Ctx, Net> ConvoyAgent<Ctx, Net>
where
    Ctx: ConvoyContext,
    Net: AdHocNetwork,
{
    /// Creates a new agent and the handle the application talks to.
    pub fn new(
        device_id: DeviceId,
        context: Arc<Ctx>,
        network: Arc<Net>,
        config: AgentConfig,
    ) -> (Self, AgentHandle) {
        let clock: Clock = {
            let context = Arc::clone(&context);
            Arc::new(move || context.now())
        };

        let peers = Arc::new(Mutex::new(PeerTable::new(device_id.clone(), config.peers.clone())));
        let sos = Arc::new(Mutex::new(SosLedger::new(config.peers.sos_memory)));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            device_id: device_id.clone(),
            estimator: Mutex::new(Estimator::new(config.estimator.clone())),
            angular_velocity: Mutex::new([0.0; 3]),
            crash: Mutex::new(CrashDetector::new(config.crash.clone())),
            peers: Arc::clone(&peers),
            sos: Arc::clone(&sos),
            risk: RiskEngine::new(config.risk.clone()),
            clock: Arc::clone(&clock),
            stopped: AtomicBool::new(false),
            own_tx: watch::channel(None).0,
            peers_tx: watch::channel(Vec::new()).0,
            alert_tx: watch::channel(RiskAlert::Clear).0,
            status_tx: watch::channel(AgentStatus::default()).0,
            events_tx,
            commands,
        });

        let (exchange_tx, exchange_rx) = mpsc::unbounded_channel();
        let hub = ExchangeHub::new(config.exchange.clone(), peers, sos, clock, exchange_tx);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let machine = SessionMachine::new(config.session.clone(), network.local_address());

        info!("Agent {} ({}) created", config.name, device_id);

        let agent = Self {
            context,
            network,
            config,
            machine,
            hub,
            shared: Arc::clone(&shared),
            capability: CapabilityStatus::Available,
            listen_addr: None,
            session_tx,
            session_rx,
            exchange_rx,
            commands_rx,
        };
        (agent, AgentHandle { shared })
    }

    /// Runs the agent until shutdown or a terminal session error.
    pub async fn run(mut self) -> Result<(), AgentError> {
        self.spawn_send_scheduler();

        let actions = self.machine.start();
        self.execute(actions).await;

        let network = Arc::clone(&self.network);
        let mut network_open = true;

        loop {
            tokio::select! {
                event = network.next_event(), if network_open => match event {
                    Some(event) => self.dispatch(SessionEvent::from(event)).await,
                    None => {
                        network_open = false;
                        self.dispatch(SessionEvent::CapabilityStatusChanged(CapabilityStatus::Unavailable)).await;
                    }
                },
                Some(event) = self.session_rx.recv() => self.dispatch(event).await,
                Some(event) = self.exchange_rx.recv() => self.on_exchange(event).await,
                command = self.commands_rx.recv() => match command {
                    Some(Command::Priority(state)) => self.send_now(state),
                    Some(Command::Shutdown) | None => {
                        self.stop().await;
                        return Ok(());
                    }
                },
            }

            if let Some(error) = self.machine.fatal_error().cloned() {
                error!("Agent stopping: {}", error);
                self.stop().await;
                return Err(AgentError::Session(error));
            }
        }
    }

    // ========== Session ==========

    async fn dispatch(&mut self, event: SessionEvent) {
        if let SessionEvent::CapabilityStatusChanged(status) = &event {
            self.capability = *status;
        }
        let actions = self.machine.handle(event);
        self.execute(actions).await;
    }

    /// Performs actions in order; failures are fed back as events.
    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();
        let before = self.machine.role();

        while let Some(action) = queue.pop_front() {
            if let Some(failure) = self.perform(action).await {
                queue.extend(self.machine.handle(failure));
            }
        }

        let role = self.machine.role();
        if role != before {
            info!("Role {:?} -> {:?}", before, role);
            self.shared.publish_event(AgentEvent::RoleChanged(role));
        }
        self.publish_status();
    }

    async fn perform(&mut self, action: SessionAction) -> Option<SessionEvent> {
        let failed = |operation: Operation, error: EnvError| SessionEvent::OperationFailed { operation, error };

        match action {
            SessionAction::StartDiscovery => self.network.discover().await.err().map(|e| failed(Operation::Discover, e)),
            SessionAction::StopDiscovery => self
                .network
                .stop_discovery()
                .await
                .err()
                .map(|e| failed(Operation::StopDiscovery, e)),
            SessionAction::Connect(candidate) => self
                .network
                .connect(&candidate)
                .await
                .err()
                .map(|e| failed(Operation::Connect, e)),
            SessionAction::CreateGroup => self
                .network
                .create_group()
                .await
                .err()
                .map(|e| failed(Operation::CreateGroup, e)),
            SessionAction::RemoveGroup => self
                .network
                .remove_group()
                .await
                .err()
                .map(|e| failed(Operation::RemoveGroup, e)),
            SessionAction::OpenListener => match self.hub.open_listener().await {
                Ok(addr) => {
                    self.listen_addr = Some(addr);
                    None
                }
                Err(e) => Some(failed(Operation::Listen, EnvError::network(e.to_string()))),
            },
            SessionAction::OpenOutbound(coordinator) => {
                self.hub.open_participant(coordinator).await;
                None
            }
            SessionAction::CloseSockets => {
                self.hub.close_all().await;
                self.listen_addr = None;
                None
            }
            SessionAction::ClearPeers => {
                self.shared.clear_peers();
                None
            }
            SessionAction::ArmTimer { epoch, after } => {
                let context = Arc::clone(&self.context);
                let session_tx = self.session_tx.clone();
                self.context.spawn("session-timer", async move {
                    context.sleep(after).await;
                    let _ = session_tx.send(SessionEvent::TimerFired { epoch });
                });
                None
            }
            SessionAction::ReportFatal(error) => {
                error!("Session failed: {}", error);
                self.shared.publish_event(AgentEvent::Fatal(error));
                None
            }
        }
    }

    // ========== Exchange ==========

    async fn on_exchange(&mut self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::Received { state, new_sos } => {
                if new_sos {
                    warn!(
                        "SOS from {}: {}",
                        state.device_id,
                        state.sos_message.as_deref().unwrap_or("")
                    );
                    self.shared.publish_event(AgentEvent::SosReceived(state.clone()));
                }
                self.dispatch(SessionEvent::DataReceived(state)).await;
                self.shared.reevaluate();
            }
            ExchangeEvent::ParticipantsChanged(count) => {
                self.dispatch(SessionEvent::ParticipantsChanged(count)).await;
            }
        }
    }

    fn send_now(&self, state: VehicleState) {
        let hub = self.hub.clone();
        self.context.spawn("priority-send", async move {
            if let Err(e) = hub.send(&state).await {
                warn!("Priority send failed: {}", e);
            }
        });
    }

    /// Periodic own-state broadcast, independent of the session loop.
    fn spawn_send_scheduler(&self) {
        let context = Arc::clone(&self.context);
        let shared = Arc::clone(&self.shared);
        let hub = self.hub.clone();
        let interval = self.config.exchange.send_interval();

        self.context.spawn("send-scheduler", async move {
            while !shared.stopped.load(Ordering::Acquire) {
                context.sleep(interval).await;
                shared.reevaluate();

                let Some(own) = shared.own_vehicle_state() else {
                    continue;
                };
                match hub.send(&own).await {
                    Ok(recipients) => debug!("Sent own state to {} recipient(s)", recipients),
                    Err(ExchangeError::NotConnected) => {}
                    Err(e) => debug!("Periodic send failed: {}", e),
                }
            }
        });
    }

    async fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        let actions = self.machine.shutdown();
        self.execute(actions).await;
        info!("Agent {} stopped", self.config.name);
    }

    fn publish_status(&self) {
        let status = AgentStatus {
            role: self.machine.role(),
            capability: self.capability,
            awaiting_fix: !lock(&self.shared.estimator).is_initialized(),
            peer_count: lock(&self.shared.peers).len(),
            participant_count: self.hub.participant_count(),
            listen_addr: self.listen_addr,
        };
        self.shared.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convoy_exchange::{ExchangeConfig, LinkMode};
    use crate::convoy_peers::PeerTableConfig;
    use convoy_env::{Candidate, GroupInfo, PlatformEvent, TokioContext};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Radio double: records requests, replays scripted notifications.
    struct ScriptedNetwork {
        events_tx: mpsc::UnboundedSender<PlatformEvent>,
        events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PlatformEvent>>,
        calls: Mutex<Vec<String>>,

        /// Answer `create_group` with a coordinator notification
        auto_form_group: bool,
    }

    impl ScriptedNetwork {
        fn new(auto_form_group: bool) -> Arc<Self> {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                events_tx,
                events_rx: tokio::sync::Mutex::new(events_rx),
                calls: Mutex::new(Vec::new()),
                auto_form_group,
            })
        }

        fn push(&self, event: PlatformEvent) {
            self.events_tx.send(event).unwrap();
        }

        fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait::async_trait]
    impl AdHocNetwork for ScriptedNetwork {
        fn local_address(&self) -> String {
            "02:00:00:00:00:01".to_string()
        }

        async fn discover(&self) -> Result<(), EnvError> {
            lock(&self.calls).push("discover".into());
            Ok(())
        }

        async fn stop_discovery(&self) -> Result<(), EnvError> {
            lock(&self.calls).push("stop_discovery".into());
            Ok(())
        }

        async fn connect(&self, candidate: &Candidate) -> Result<(), EnvError> {
            lock(&self.calls).push(format!("connect:{}", candidate.address));
            Ok(())
        }

        async fn create_group(&self) -> Result<(), EnvError> {
            lock(&self.calls).push("create_group".into());
            if self.auto_form_group {
                self.push(PlatformEvent::ConnectionInfoAvailable(GroupInfo::coordinator()));
            }
            Ok(())
        }

        async fn remove_group(&self) -> Result<(), EnvError> {
            lock(&self.calls).push("remove_group".into());
            Ok(())
        }

        async fn next_event(&self) -> Option<PlatformEvent> {
            self.events_rx.lock().await.recv().await
        }
    }

    fn fast_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.exchange = ExchangeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            send_interval_ms: 50,
            ..ExchangeConfig::default()
        };
        config.session.discovery_timeout_ms = 50;
        config
    }

    fn spawn_agent(
        id: &str,
        network: Arc<ScriptedNetwork>,
        config: AgentConfig,
    ) -> (tokio::task::JoinHandle<Result<(), AgentError>>, AgentHandle) {
        let (agent, handle) = ConvoyAgent::new(DeviceId::from(id), TokioContext::shared(), network, config);
        (tokio::spawn(agent.run()), handle)
    }

    /// A bare exchange hub standing in for another vehicle.
    fn remote(id: &str) -> (ExchangeHub, Arc<Mutex<PeerTable>>, mpsc::UnboundedReceiver<ExchangeEvent>) {
        let peers = Arc::new(Mutex::new(PeerTable::new(DeviceId::from(id), PeerTableConfig::default())));
        let sos = Arc::new(Mutex::new(SosLedger::new(100)));
        let (tx, rx) = mpsc::unbounded_channel();
        let start = std::time::Instant::now();
        let config = ExchangeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ExchangeConfig::default()
        };
        let hub = ExchangeHub::new(config, Arc::clone(&peers), sos, Arc::new(move || start.elapsed()), tx);
        (hub, peers, rx)
    }

    async fn next_state(events: &mut mpsc::UnboundedReceiver<ExchangeEvent>) -> (VehicleState, bool) {
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(ExchangeEvent::Received { state, new_sos })) => return (state, new_sos),
                Ok(Some(_)) => continue,
                other => panic!("no state received: {:?}", other),
            }
        }
    }

    async fn wait_until<T, F>(rx: &mut watch::Receiver<T>, mut predicate: F)
    where
        F: FnMut(&T) -> bool,
    {
        timeout(Duration::from_secs(5), rx.wait_for(|value| predicate(value)))
            .await
            .expect("condition not reached in time")
            .expect("agent dropped");
    }

    const LAT: f64 = 48.8566;
    const LON: f64 = 2.3522;

    #[tokio::test]
    async fn test_no_state_or_alert_before_first_fix() {
        let network = ScriptedNetwork::new(false);
        let (_task, handle) = spawn_agent("me", network, fast_config());

        assert!(handle.own_state().is_none());
        assert_eq!(handle.alert(), RiskAlert::Clear);
        assert!(handle.status().awaiting_fix);
        assert_eq!(handle.trigger_sos("help"), Err(AgentError::NoFix));

        handle.submit_fix(LocationFix::new(LAT, LON, 1_000)).unwrap();
        assert!(handle.own_state().is_some());
        assert!(!handle.status().awaiting_fix);
    }

    #[tokio::test]
    async fn test_participant_exchange_and_group_loss() {
        let network = ScriptedNetwork::new(false);
        let (_task, handle) = spawn_agent("me", Arc::clone(&network), fast_config());
        let (coordinator, coordinator_peers, mut coordinator_events) = remote("coord");
        let addr = coordinator.open_listener().await.unwrap();

        handle.submit_fix(LocationFix::new(LAT, LON, 1_000)).unwrap();

        network.push(PlatformEvent::PeersChanged(vec![Candidate::new("02:00:00:00:00:09", "coord")]));
        network.push(PlatformEvent::ConnectionInfoAvailable(GroupInfo::participant(addr)));

        let mut status = handle.subscribe_status();
        wait_until(&mut status, |s| s.role == Role::Participant).await;
        assert!(network.calls().contains(&"connect:02:00:00:00:00:09".to_string()));

        // Periodic send reaches the coordinator
        let (state, _) = next_state(&mut coordinator_events).await;
        assert_eq!(state.device_id, DeviceId::from("me"));

        // A vehicle 5 m away shows up as danger
        let close = VehicleState::new(DeviceId::from("coord"), LAT + 5.0 / 111_195.0, LON, 0.0, 0.0, 2_000);
        assert_eq!(coordinator.send(&close).await.unwrap(), 1);

        let mut alert = handle.subscribe_alert();
        wait_until(&mut alert, |a| matches!(a, RiskAlert::Danger { .. })).await;
        assert_eq!(handle.peers().len(), 1);

        // SOS goes out immediately and is flagged once on the other side
        let sos = handle.trigger_sos("stalled").unwrap();
        loop {
            let (state, new_sos) = next_state(&mut coordinator_events).await;
            if state.is_sos {
                assert!(new_sos);
                assert_eq!(state.sos_id, sos.sos_id);
                break;
            }
        }
        assert!(lock(&coordinator_peers).get(&DeviceId::from("me")).is_some());

        // Group dissolves: peers forgotten, back to discovery
        network.push(PlatformEvent::GroupDissolved);
        wait_until(&mut status, |s| s.role == Role::Discovering).await;
        let mut peers = handle.subscribe_peers();
        wait_until(&mut peers, |p| p.is_empty()).await;
        assert_eq!(handle.alert(), RiskAlert::Clear);
    }

    #[tokio::test]
    async fn test_self_coordinates_and_serves_participants() {
        let network = ScriptedNetwork::new(true);
        let (_task, handle) = spawn_agent("me", Arc::clone(&network), fast_config());
        handle.submit_fix(LocationFix::new(LAT, LON, 1_000)).unwrap();

        let mut status = handle.subscribe_status();
        wait_until(&mut status, |s| s.role == Role::Coordinator && s.listen_addr.is_some()).await;
        assert!(network.calls().contains(&"create_group".to_string()));
        let addr = handle.status().listen_addr.unwrap();

        let (participant, _, mut participant_events) = remote("alice");
        participant.open_participant(addr).await;
        wait_until(&mut status, |s| s.participant_count == 1).await;

        let alice = VehicleState::new(DeviceId::from("alice"), LAT + 0.01, LON, 10.0, 0.0, 5_000);
        participant.send(&alice).await.unwrap();
        let mut peers = handle.subscribe_peers();
        wait_until(&mut peers, |p| p.iter().any(|s| s.device_id == DeviceId::from("alice"))).await;

        let (state, _) = next_state(&mut participant_events).await;
        assert_eq!(state.device_id, DeviceId::from("me"));
        assert_eq!(participant.mode(), LinkMode::Participant { coordinator: addr });
    }

    #[tokio::test]
    async fn test_coordinator_outlives_dropped_participant() {
        let network = ScriptedNetwork::new(true);
        let mut config = fast_config();
        config.peers = PeerTableConfig {
            staleness_window_ms: 300,
            ..PeerTableConfig::default()
        };
        let (_task, handle) = spawn_agent("me", Arc::clone(&network), config);
        handle.submit_fix(LocationFix::new(LAT, LON, 1_000)).unwrap();

        let mut status = handle.subscribe_status();
        wait_until(&mut status, |s| s.role == Role::Coordinator && s.listen_addr.is_some()).await;
        let addr = handle.status().listen_addr.unwrap();

        let (alice, _, mut alice_events) = remote("alice");
        let (bob, _, _bob_events) = remote("bob");
        alice.open_participant(addr).await;
        bob.open_participant(addr).await;
        wait_until(&mut status, |s| s.participant_count == 2).await;

        // Bob parks 5 m away, Alice a kilometre off
        let bob_id = DeviceId::from("bob");
        let parked = VehicleState::new(bob_id.clone(), LAT + 5.0 / 111_195.0, LON, 0.0, 0.0, 2_000);
        bob.send(&parked).await.unwrap();
        let far = VehicleState::new(DeviceId::from("alice"), LAT + 0.01, LON, 0.0, 0.0, 2_000);
        alice.send(&far).await.unwrap();

        let mut alert = handle.subscribe_alert();
        wait_until(&mut alert, |a| matches!(a, RiskAlert::Danger { peer_id, .. } if *peer_id == bob_id)).await;
        let mut peers = handle.subscribe_peers();
        wait_until(&mut peers, |p| p.len() == 2).await;

        // The coordinator relays Bob to Alice
        loop {
            let (state, _) = next_state(&mut alice_events).await;
            if state.device_id == bob_id {
                break;
            }
        }

        bob.close_all().await;
        wait_until(&mut status, |s| s.participant_count == 1).await;
        assert_eq!(handle.status().role, Role::Coordinator);

        // Alice keeps reporting and keeps hearing the coordinator until Bob ages out
        let mut heard = 0;
        for step in 1..=100 {
            let update = VehicleState::new(DeviceId::from("alice"), LAT + 0.01, LON, 0.0, 0.0, 2_000 + step * 100);
            alice.send(&update).await.unwrap();

            let (state, _) = next_state(&mut alice_events).await;
            if state.device_id == DeviceId::from("me") {
                heard += 1;
            }

            let gone = handle.peers().iter().all(|p| p.device_id != bob_id);
            if gone && handle.alert() == RiskAlert::Clear && heard >= 2 {
                break;
            }
        }

        assert!(heard >= 2, "coordinator went quiet after the drop");
        let remaining: Vec<DeviceId> = handle.peers().into_iter().map(|p| p.device_id).collect();
        assert_eq!(remaining, vec![DeviceId::from("alice")]);
        assert_eq!(handle.alert(), RiskAlert::Clear);
        assert_eq!(handle.status().participant_count, 1);
    }

    #[tokio::test]
    async fn test_permission_revoked_is_fatal() {
        let network = ScriptedNetwork::new(false);
        let (task, handle) = spawn_agent("me", Arc::clone(&network), fast_config());
        let mut events = handle.subscribe_events();

        network.push(PlatformEvent::CapabilityStatusChanged(CapabilityStatus::PermissionDenied));

        let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(AgentError::Session(SessionError::PermissionDenied(_)))));

        loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Ok(AgentEvent::Fatal(SessionError::PermissionDenied(_))) => break,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
        assert_eq!(handle.status().role, Role::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_stops_agent() {
        let network = ScriptedNetwork::new(false);
        let (task, handle) = spawn_agent("me", network, fast_config());

        handle.shutdown();
        let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(result, Ok(()));
    }
}
