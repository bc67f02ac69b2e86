//! SimulatedVehicle - the Convoy engines driven by virtual time.
//!
//! `ConvoyAgent` owns real sockets and tokio timers, neither of which can be
//! replayed from a seed. This wrapper runs the same pure engines (session
//! machine, estimator, peer table, risk engine, wire codec) one tick at a
//! time against a `SimRadio`, with timers kept on the virtual clock and
//! frames carried by the simulated air.

use crate::network::SimRadio;

use convoy_core::convoy_exchange::frame_payload;
use convoy_core::crash_detection::CRASH_SOS_MESSAGE;
use convoy_core::{
    accept_payload, encode_frame, AgentConfig, AgentError, CrashDetector, Estimator, FusedState, Inbound,
    LocationFix, PeerTable, RiskAlert, RiskEngine, Role, SessionAction, SessionError, SessionEvent, SessionMachine,
    SosLedger, VehicleState,
};
use convoy_core::convoy_session::Operation;
use convoy_env::{AdHocNetwork, DeviceId, EnvError};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which exchange link the vehicle currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimLink {
    Idle,
    Coordinator,
    Participant { coordinator: SocketAddr },
}

/// What happened to one vehicle during a run.
#[derive(Debug, Clone, Default)]
pub struct VehicleLog {
    pub alerts: Vec<(Duration, RiskAlert)>,
    pub roles: Vec<(Duration, Role)>,
    pub sos_received: Vec<VehicleState>,
    pub frames_relayed: u64,
    pub frames_malformed: u64,
    pub fixes_rejected: u64,
}

/// A simulated vehicle running in the deterministic environment.
pub struct SimulatedVehicle {
    device_id: DeviceId,
    name: String,
    radio: SimRadio,
    config: AgentConfig,

    machine: SessionMachine,
    estimator: Estimator,
    peers: PeerTable,
    sos: SosLedger,
    risk: RiskEngine,
    crash: CrashDetector,

    /// Armed session timers as (deadline, epoch)
    timers: Vec<(Duration, u64)>,
    link: SimLink,
    participants: usize,
    last_send: Option<Duration>,
    alert: RiskAlert,
    log: VehicleLog,
}

impl SimulatedVehicle {
    pub fn new(device_id: DeviceId, name: &str, radio: SimRadio, config: AgentConfig) -> Self {
        let machine = SessionMachine::new(config.session.clone(), radio.local_address());

        Self {
            estimator: Estimator::new(config.estimator.clone()),
            peers: PeerTable::new(device_id.clone(), config.peers.clone()),
            sos: SosLedger::new(config.peers.sos_memory),
            risk: RiskEngine::new(config.risk.clone()),
            crash: CrashDetector::new(config.crash.clone()),
            device_id,
            name: name.to_string(),
            radio,
            config,
            machine,
            timers: Vec::new(),
            link: SimLink::Idle,
            participants: 0,
            last_send: None,
            alert: RiskAlert::Clear,
            log: VehicleLog::default(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn radio(&self) -> &SimRadio {
        &self.radio
    }

    pub fn role(&self) -> Role {
        self.machine.role()
    }

    pub fn link(&self) -> SimLink {
        self.link
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    pub fn fatal_error(&self) -> Option<&SessionError> {
        self.machine.fatal_error()
    }

    pub fn own_state(&self) -> Option<FusedState> {
        self.estimator.get_state()
    }

    /// Current peer records, sorted by device id.
    pub fn peers(&self) -> Vec<VehicleState> {
        self.peers.states()
    }

    pub fn knows(&self, device_id: &DeviceId) -> bool {
        self.peers.get(device_id).is_some()
    }

    pub fn alert(&self) -> &RiskAlert {
        &self.alert
    }

    pub fn log(&self) -> &VehicleLog {
        &self.log
    }

    /// Leaves `Idle` and starts discovering.
    pub fn start(&mut self, now: Duration) {
        let actions = self.machine.start();
        self.execute(actions, now);
    }

    // ========== Sensors ==========

    pub fn on_fix(&mut self, fix: LocationFix) {
        if let Err(e) = self.estimator.update(&fix) {
            warn!("{}: fix rejected: {}", self.name, e);
            self.log.fixes_rejected += 1;
        }
    }

    pub fn on_imu(&mut self, acceleration: [f64; 3], angular_velocity: [f64; 3], timestamp_nanos: i64, now: Duration) {
        self.estimator.predict(acceleration, angular_velocity, timestamp_nanos);

        if self.crash.observe(acceleration, timestamp_nanos / 1_000_000) {
            if let Err(e) = self.trigger_sos(CRASH_SOS_MESSAGE, now) {
                warn!("{}: impact detected but SOS not sent: {}", self.name, e);
            }
        }
    }

    /// Raises a distress record and sends it right away.
    pub fn trigger_sos(&mut self, message: &str, now: Duration) -> Result<VehicleState, AgentError> {
        let own = self
            .own_vehicle_state()
            .ok_or(AgentError::NoFix)?;
        let sos = VehicleState::sos(&own, message);
        warn!("{}: raising SOS {:?}: {}", self.name, sos.sos_id, message);
        self.broadcast_priority(&sos, now);
        Ok(sos)
    }

    /// Sends `state` outside the periodic schedule. Returns frames delivered.
    pub fn broadcast_priority(&mut self, state: &VehicleState, now: Duration) -> usize {
        debug!("{}: priority send at {:?}", self.name, now);
        self.send_state(state)
    }

    // ========== Tick ==========

    /// One simulation step: platform events, timers, inbound frames, the send
    /// schedule and risk, in that order.
    pub fn tick(&mut self, now: Duration) {
        while let Some(event) = self.radio.try_next_event() {
            self.handle(SessionEvent::from(event), now);
        }

        let (due, pending): (Vec<_>, Vec<_>) = self.timers.drain(..).partition(|(deadline, _)| *deadline <= now);
        self.timers = pending;
        for (_, epoch) in due {
            self.handle(SessionEvent::TimerFired { epoch }, now);
        }

        if self.link == SimLink::Coordinator {
            let count = self.radio.air().participants(self.radio.index()).len();
            if count != self.participants {
                self.participants = count;
                self.handle(SessionEvent::ParticipantsChanged(count), now);
            }
        }

        self.receive(now);

        let interval = self.config.exchange.send_interval();
        if self.last_send.map_or(true, |last| now.saturating_sub(last) >= interval) {
            self.last_send = Some(now);
            if let Some(own) = self.own_vehicle_state() {
                self.send_state(&own);
            }
        }

        self.reevaluate(now);
    }

    fn own_vehicle_state(&self) -> Option<VehicleState> {
        self.estimator
            .get_state()
            .map(|state| state.to_vehicle_state(self.device_id.clone()))
    }

    fn reevaluate(&mut self, now: Duration) {
        let peers = self.peers.fresh_states(now);
        let alert = match self.own_vehicle_state() {
            Some(own) => self.risk.assess(&own, &peers),
            None => RiskAlert::Clear,
        };

        if alert != self.alert {
            debug!("{}: alert {:?} at {:?}", self.name, alert, now);
            self.log.alerts.push((now, alert.clone()));
            self.alert = alert;
        }
    }

    // ========== Exchange ==========

    fn send_state(&mut self, state: &VehicleState) -> usize {
        let frame = match encode_frame(state) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: cannot encode own state: {}", self.name, e);
                return 0;
            }
        };

        let air = self.radio.air();
        let index = self.radio.index();
        match self.link {
            SimLink::Idle => 0,
            SimLink::Coordinator => air
                .participants(index)
                .into_iter()
                .filter(|&socket| air.transmit(index, socket, frame.clone()))
                .count(),
            SimLink::Participant { coordinator } => usize::from(air.transmit(index, coordinator, frame)),
        }
    }

    fn receive(&mut self, now: Duration) {
        let air = self.radio.air().clone();
        let index = self.radio.index();

        for (from, frame) in air.receive(index) {
            let Some(payload) = unframe(&frame) else {
                warn!("{}: dropping badly framed message from {}", self.name, from);
                self.log.frames_malformed += 1;
                continue;
            };

            match accept_payload(payload, &mut self.peers, &mut self.sos, now) {
                Inbound::Accepted { state, new_sos } => {
                    if self.link == SimLink::Coordinator && self.config.exchange.relay {
                        let relay = frame_payload(payload);
                        for socket in air.participants(index).into_iter().filter(|s| *s != from) {
                            if air.transmit(index, socket, relay.clone()) {
                                self.log.frames_relayed += 1;
                            }
                        }
                    }
                    if new_sos {
                        info!("{}: SOS from {}", self.name, state.device_id);
                        self.log.sos_received.push(state.clone());
                    }
                    self.handle(SessionEvent::DataReceived(state), now);
                }
                Inbound::Ignored(outcome) => debug!("{}: ignored state ({:?})", self.name, outcome),
                Inbound::Malformed(e) => {
                    warn!("{}: dropping malformed payload from {}: {}", self.name, from, e);
                    self.log.frames_malformed += 1;
                }
            }
        }
    }

    // ========== Session ==========

    fn handle(&mut self, event: SessionEvent, now: Duration) {
        let actions = self.machine.handle(event);
        self.execute(actions, now);
    }

    fn execute(&mut self, actions: Vec<SessionAction>, now: Duration) {
        let before = self.machine.role();
        let mut queue: VecDeque<SessionAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            if let Some(failure) = self.perform(action, now) {
                queue.extend(self.machine.handle(failure));
            }
        }

        let role = self.machine.role();
        if role != before {
            info!("{}: {:?} -> {:?} at {:?}", self.name, before, role, now);
            self.log.roles.push((now, role));
        }
    }

    fn perform(&mut self, action: SessionAction, now: Duration) -> Option<SessionEvent> {
        let failed = |operation: Operation, error: EnvError| SessionEvent::OperationFailed { operation, error };

        match action {
            SessionAction::StartDiscovery => self.radio.discover_now().err().map(|e| failed(Operation::Discover, e)),
            SessionAction::StopDiscovery => self
                .radio
                .stop_discovery_now()
                .err()
                .map(|e| failed(Operation::StopDiscovery, e)),
            SessionAction::Connect(candidate) => self
                .radio
                .connect_now(&candidate)
                .err()
                .map(|e| failed(Operation::Connect, e)),
            SessionAction::CreateGroup => self
                .radio
                .create_group_now()
                .err()
                .map(|e| failed(Operation::CreateGroup, e)),
            SessionAction::RemoveGroup => self
                .radio
                .remove_group_now()
                .err()
                .map(|e| failed(Operation::RemoveGroup, e)),
            SessionAction::OpenListener => {
                self.link = SimLink::Coordinator;
                self.participants = 0;
                None
            }
            SessionAction::OpenOutbound(coordinator) => {
                self.link = SimLink::Participant { coordinator };
                None
            }
            SessionAction::CloseSockets => {
                self.link = SimLink::Idle;
                self.participants = 0;
                // Whatever was in flight on the old links is gone with them
                self.radio.air().receive(self.radio.index());
                None
            }
            SessionAction::ClearPeers => {
                self.peers.clear();
                None
            }
            SessionAction::ArmTimer { epoch, after } => {
                self.timers.push((now + after, epoch));
                None
            }
            SessionAction::ReportFatal(error) => {
                warn!("{}: session failed: {}", self.name, error);
                None
            }
        }
    }
}

/// Strips the 4-byte big-endian length prefix, checking it matches.
fn unframe(frame: &[u8]) -> Option<&[u8]> {
    let prefix: [u8; 4] = frame.get(..4)?.try_into().ok()?;
    let payload = &frame[4..];
    (u32::from_be_bytes(prefix) as usize == payload.len()).then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{SimAir, DEFAULT_RANGE_M};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const LAT: f64 = 52.52;
    const LON: f64 = 13.405;
    const TICK: Duration = Duration::from_millis(50);

    fn pair() -> (SimAir, SimulatedVehicle, SimulatedVehicle) {
        let air = SimAir::new(DEFAULT_RANGE_M, ChaCha8Rng::seed_from_u64(9));
        let a = SimulatedVehicle::new(
            DeviceId::from("a"),
            "a",
            air.register(DeviceId::from("a"), "a", LAT, LON),
            AgentConfig::default(),
        );
        let b = SimulatedVehicle::new(
            DeviceId::from("b"),
            "b",
            air.register(DeviceId::from("b"), "b", LAT + 0.0002, LON),
            AgentConfig::default(),
        );
        (air, a, b)
    }

    fn run(air: &SimAir, vehicles: &mut [&mut SimulatedVehicle], from: Duration, ticks: u32) -> Duration {
        let mut now = from;
        for _ in 0..ticks {
            now += TICK;
            air.step();
            for vehicle in vehicles.iter_mut() {
                vehicle.tick(now);
            }
        }
        now
    }

    #[test]
    fn test_unframe_checks_length() {
        let frame = frame_payload(b"{}");
        assert_eq!(unframe(&frame), Some(&b"{}"[..]));
        assert_eq!(unframe(&[0, 0, 0, 5, b'x']), None);
        assert_eq!(unframe(&[0, 0]), None);
    }

    #[test]
    fn test_two_vehicles_form_group_and_exchange() {
        let (air, mut a, mut b) = pair();
        a.start(Duration::ZERO);
        b.start(Duration::ZERO);
        a.on_fix(LocationFix::new(LAT, LON, 1_000));
        b.on_fix(LocationFix::new(LAT + 0.0002, LON, 1_000));

        run(&air, &mut [&mut a, &mut b], Duration::ZERO, 40);

        let roles = [a.role(), b.role()];
        assert!(roles.contains(&Role::Coordinator));
        assert!(roles.contains(&Role::Participant));
        assert!(a.knows(b.device_id()));
        assert!(b.knows(a.device_id()));

        // ~22 m apart and stationary: caution
        assert!(matches!(a.alert(), RiskAlert::Caution { .. }));
    }

    #[test]
    fn test_sos_before_fix_is_refused() {
        let (_air, mut a, _b) = pair();
        assert_eq!(a.trigger_sos("help", Duration::ZERO), Err(AgentError::NoFix));
    }

    #[test]
    fn test_lone_vehicle_self_coordinates_after_discovery_timeout() {
        let air = SimAir::new(DEFAULT_RANGE_M, ChaCha8Rng::seed_from_u64(9));
        let mut a = SimulatedVehicle::new(
            DeviceId::from("a"),
            "a",
            air.register(DeviceId::from("a"), "a", LAT, LON),
            AgentConfig::default(),
        );
        a.start(Duration::ZERO);

        // Default discovery attempt is 10 s
        run(&air, &mut [&mut a], Duration::ZERO, 199);
        assert_eq!(a.role(), Role::Discovering);

        run(&air, &mut [&mut a], TICK * 199, 3);
        assert_eq!(a.role(), Role::Coordinator);
        assert_eq!(a.link(), SimLink::Coordinator);
    }
}
