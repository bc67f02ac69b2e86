//! Simulated ad-hoc radio medium with range limits and fault injection.
//!
//! `SimAir` is the shared medium; each vehicle holds a `SimRadio` into it.
//! Group negotiation follows the platform's rules closely enough for the
//! session machine: connecting to a group owner joins that group, connecting
//! to anyone else makes the target the owner.

use async_trait::async_trait;
use convoy_core::vehicle::distance_m;
use convoy_env::{
    AdHocNetwork, Candidate, CapabilityStatus, DeviceId, EnvError, GroupInfo, NetworkController, PlatformEvent,
};
use geo::Point;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Port the simulated coordinators "listen" on.
pub const SIM_PORT: u16 = 8888;

/// Radio range used when none is configured (Wi-Fi Direct outdoors).
pub const DEFAULT_RANGE_M: f64 = 200.0;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Membership {
    None,
    Owner { members: BTreeSet<usize> },
    Member { owner: usize },
}

struct RadioSlot {
    device_id: DeviceId,
    name: String,
    address: String,
    socket: SocketAddr,
    latitude: f64,
    longitude: f64,
    enabled: bool,
    closed: bool,
    discovering: bool,
    last_candidates: Option<Vec<Candidate>>,
    membership: Membership,
    events: VecDeque<PlatformEvent>,
    notify: Arc<Notify>,
    inbox: VecDeque<(SocketAddr, Vec<u8>)>,
}

/// Frame counters for scenario metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AirStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

struct AirState {
    radios: Vec<RadioSlot>,
    range_m: f64,
    partitions: Vec<(Vec<DeviceId>, Vec<DeviceId>)>,
    link_loss: HashMap<(DeviceId, DeviceId), f64>,
    rng: ChaCha8Rng,
    stats: AirStats,
}

/// The shared radio medium.
#[derive(Clone)]
pub struct SimAir {
    state: Arc<Mutex<AirState>>,
}

fn lock(state: &Mutex<AirState>) -> MutexGuard<'_, AirState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AirState {
    fn push_event(&mut self, index: usize, event: PlatformEvent) {
        let slot = &mut self.radios[index];
        debug!("{} <- {:?}", slot.name, event);
        slot.events.push_back(event);
        slot.notify.notify_one();
    }

    fn partitioned(&self, a: &DeviceId, b: &DeviceId) -> bool {
        self.partitions.iter().any(|(group_a, group_b)| {
            (group_a.contains(a) && group_b.contains(b)) || (group_b.contains(a) && group_a.contains(b))
        })
    }

    fn reachable(&self, a: usize, b: usize) -> bool {
        let (ra, rb) = (&self.radios[a], &self.radios[b]);
        let distance = distance_m(
            Point::new(ra.longitude, ra.latitude),
            Point::new(rb.longitude, rb.latitude),
        );
        ra.enabled && rb.enabled && !self.partitioned(&ra.device_id, &rb.device_id) && distance <= self.range_m
    }

    fn find_address(&self, address: &str) -> Option<usize> {
        self.radios.iter().position(|r| r.address == address)
    }

    fn find_socket(&self, socket: SocketAddr) -> Option<usize> {
        self.radios.iter().position(|r| r.socket == socket)
    }

    fn linked(&self, a: usize, b: usize) -> bool {
        matches!(self.radios[a].membership, Membership::Member { owner } if owner == b)
            || matches!(self.radios[b].membership, Membership::Member { owner } if owner == a)
    }

    /// Drops `member` from its group without notifying it.
    fn detach(&mut self, member: usize) {
        if let Membership::Member { owner } = self.radios[member].membership {
            if let Membership::Owner { members } = &mut self.radios[owner].membership {
                members.remove(&member);
            }
        }
        self.radios[member].membership = Membership::None;
    }

    /// Tears down the group owned by `owner`, notifying every member.
    fn dissolve(&mut self, owner: usize) {
        let members = match std::mem::replace(&mut self.radios[owner].membership, Membership::None) {
            Membership::Owner { members } => members,
            other => {
                self.radios[owner].membership = other;
                return;
            }
        };
        info!("{} dissolved its group ({} member(s))", self.radios[owner].name, members.len());
        for member in members {
            self.radios[member].membership = Membership::None;
            self.push_event(member, PlatformEvent::GroupDissolved);
        }
    }

    fn candidates_for(&self, index: usize) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = (0..self.radios.len())
            .filter(|&other| other != index && self.reachable(index, other))
            .map(|other| {
                let radio = &self.radios[other];
                let candidate = Candidate::new(radio.address.clone(), radio.name.clone());
                if matches!(radio.membership, Membership::Owner { .. }) {
                    candidate.owning_group()
                } else {
                    candidate
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.address.cmp(&b.address));
        candidates
    }
}

impl SimAir {
    pub fn new(range_m: f64, rng: ChaCha8Rng) -> Self {
        Self {
            state: Arc::new(Mutex::new(AirState {
                radios: Vec::new(),
                range_m,
                partitions: Vec::new(),
                link_loss: HashMap::new(),
                rng,
                stats: AirStats::default(),
            })),
        }
    }

    /// Adds a radio at the given position and returns its handle.
    pub fn register(&self, device_id: DeviceId, name: &str, latitude: f64, longitude: f64) -> SimRadio {
        let mut state = lock(&self.state);
        let index = state.radios.len();
        let octet = (index + 1) as u8;
        let notify = Arc::new(Notify::new());

        state.radios.push(RadioSlot {
            device_id,
            name: name.to_string(),
            address: format!("02:00:00:00:00:{:02x}", octet),
            socket: SocketAddr::new(Ipv4Addr::new(10, 0, 0, octet).into(), SIM_PORT),
            latitude,
            longitude,
            enabled: true,
            closed: false,
            discovering: false,
            last_candidates: None,
            membership: Membership::None,
            events: VecDeque::new(),
            notify: Arc::clone(&notify),
            inbox: VecDeque::new(),
        });

        SimRadio {
            air: self.clone(),
            index,
            notify,
        }
    }

    pub fn set_position(&self, index: usize, latitude: f64, longitude: f64) {
        let mut state = lock(&self.state);
        let slot = &mut state.radios[index];
        slot.latitude = latitude;
        slot.longitude = longitude;
    }

    /// Turns a radio on or off (or revokes its permission).
    pub fn set_capability(&self, index: usize, status: CapabilityStatus) {
        let mut state = lock(&self.state);
        let enabled = status == CapabilityStatus::Available;
        if !enabled {
            state.dissolve(index);
            state.detach(index);
            state.radios[index].discovering = false;
        }
        state.radios[index].enabled = enabled;
        state.push_event(index, PlatformEvent::CapabilityStatusChanged(status));
    }

    /// Applies range and partition changes, then refreshes discovery results.
    ///
    /// Called once per simulation tick after positions were updated.
    pub fn step(&self) {
        let mut state = lock(&self.state);

        for member in 0..state.radios.len() {
            if let Membership::Member { owner } = state.radios[member].membership {
                if !state.reachable(member, owner) {
                    info!("{} lost its coordinator {}", state.radios[member].name, state.radios[owner].name);
                    state.detach(member);
                    state.push_event(member, PlatformEvent::GroupDissolved);
                }
            }
        }

        for index in 0..state.radios.len() {
            if !state.radios[index].discovering {
                continue;
            }
            let candidates = state.candidates_for(index);
            if state.radios[index].last_candidates.as_ref() != Some(&candidates) {
                state.radios[index].last_candidates = Some(candidates.clone());
                state.push_event(index, PlatformEvent::PeersChanged(candidates));
            }
        }
    }

    /// Delivers one frame over an established group link.
    ///
    /// Returns false when the frame was lost or there is no link.
    pub fn transmit(&self, from: usize, to: SocketAddr, frame: Vec<u8>) -> bool {
        let mut state = lock(&self.state);
        state.stats.frames_sent += 1;

        let Some(target) = state.find_socket(to) else {
            state.stats.frames_dropped += 1;
            return false;
        };
        if !state.linked(from, target) || !state.reachable(from, target) {
            state.stats.frames_dropped += 1;
            return false;
        }

        let key = (state.radios[from].device_id.clone(), state.radios[target].device_id.clone());
        let loss = state.link_loss.get(&key).copied().unwrap_or(0.0);
        if loss > 0.0 && state.rng.gen_bool(loss) {
            state.stats.frames_dropped += 1;
            return false;
        }

        let source = state.radios[from].socket;
        state.radios[target].inbox.push_back((source, frame));
        true
    }

    /// Drains frames delivered to `index`, tagged with the sender's socket.
    pub fn receive(&self, index: usize) -> Vec<(SocketAddr, Vec<u8>)> {
        lock(&self.state).radios[index].inbox.drain(..).collect()
    }

    /// Sockets of the participants in the group `index` owns.
    pub fn participants(&self, index: usize) -> Vec<SocketAddr> {
        let state = lock(&self.state);
        match &state.radios[index].membership {
            Membership::Owner { members } => members.iter().map(|&m| state.radios[m].socket).collect(),
            _ => Vec::new(),
        }
    }

    pub fn stats(&self) -> AirStats {
        lock(&self.state).stats
    }

    /// Number of distinct formed groups with at least one participant.
    pub fn group_count(&self) -> usize {
        lock(&self.state)
            .radios
            .iter()
            .filter(|r| matches!(&r.membership, Membership::Owner { members } if !members.is_empty()))
            .count()
    }
}

impl NetworkController for SimAir {
    fn partition(&self, group_a: &[DeviceId], group_b: &[DeviceId]) {
        lock(&self.state).partitions.push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        lock(&self.state).partitions.clear();
    }

    fn set_link_loss(&self, from: &DeviceId, to: &DeviceId, loss_rate: f64) {
        lock(&self.state)
            .link_loss
            .insert((from.clone(), to.clone()), loss_rate.clamp(0.0, 1.0));
    }
}

/// One vehicle's radio.
///
/// Every request completes synchronously; the `*_now` methods are what the
/// tick-driven simulation calls, the `AdHocNetwork` impl wraps them.
pub struct SimRadio {
    air: SimAir,
    index: usize,
    notify: Arc<Notify>,
}

impl SimRadio {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn air(&self) -> &SimAir {
        &self.air
    }

    pub fn socket(&self) -> SocketAddr {
        lock(&self.air.state).radios[self.index].socket
    }

    /// Next queued notification, without waiting.
    pub fn try_next_event(&self) -> Option<PlatformEvent> {
        lock(&self.air.state).radios[self.index].events.pop_front()
    }

    /// Shuts the radio down; `next_event` returns `None` once drained.
    pub fn close(&self) {
        let mut state = lock(&self.air.state);
        state.radios[self.index].closed = true;
        self.notify.notify_one();
    }

    pub fn discover_now(&self) -> Result<(), EnvError> {
        let mut state = lock(&self.air.state);
        let slot = &mut state.radios[self.index];
        if !slot.enabled {
            return Err(EnvError::unavailable("radio disabled"));
        }
        slot.discovering = true;
        slot.last_candidates = None;
        Ok(())
    }

    pub fn stop_discovery_now(&self) -> Result<(), EnvError> {
        lock(&self.air.state).radios[self.index].discovering = false;
        Ok(())
    }

    pub fn connect_now(&self, candidate: &Candidate) -> Result<(), EnvError> {
        let mut state = lock(&self.air.state);
        let me = self.index;

        let target = state
            .find_address(&candidate.address)
            .filter(|&t| t != me && state.reachable(me, t))
            .ok_or_else(|| EnvError::unreachable(&candidate.address))?;
        if state.radios[me].membership != Membership::None {
            return Err(EnvError::Busy);
        }

        let elected = match &mut state.radios[target].membership {
            Membership::Owner { members } => {
                members.insert(me);
                false
            }
            Membership::Member { .. } => return Err(EnvError::Busy),
            membership => {
                *membership = Membership::Owner {
                    members: BTreeSet::from([me]),
                };
                true
            }
        };
        if elected {
            state.push_event(target, PlatformEvent::ConnectionInfoAvailable(GroupInfo::coordinator()));
        }

        state.radios[me].membership = Membership::Member { owner: target };
        let coordinator = state.radios[target].socket;
        info!("{} joined the group of {}", state.radios[me].name, state.radios[target].name);
        state.push_event(me, PlatformEvent::ConnectionInfoAvailable(GroupInfo::participant(coordinator)));
        Ok(())
    }

    pub fn create_group_now(&self) -> Result<(), EnvError> {
        let mut state = lock(&self.air.state);
        let me = self.index;
        if !state.radios[me].enabled {
            return Err(EnvError::unavailable("radio disabled"));
        }
        match state.radios[me].membership {
            Membership::Member { .. } => return Err(EnvError::Busy),
            Membership::Owner { .. } => {}
            Membership::None => {
                state.radios[me].membership = Membership::Owner {
                    members: BTreeSet::new(),
                };
            }
        }
        state.push_event(me, PlatformEvent::ConnectionInfoAvailable(GroupInfo::coordinator()));
        Ok(())
    }

    pub fn remove_group_now(&self) -> Result<(), EnvError> {
        let mut state = lock(&self.air.state);
        match state.radios[self.index].membership {
            Membership::Owner { .. } => state.dissolve(self.index),
            Membership::Member { .. } => state.detach(self.index),
            Membership::None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl AdHocNetwork for SimRadio {
    fn local_address(&self) -> String {
        lock(&self.air.state).radios[self.index].address.clone()
    }

    async fn discover(&self) -> Result<(), EnvError> {
        self.discover_now()
    }

    async fn stop_discovery(&self) -> Result<(), EnvError> {
        self.stop_discovery_now()
    }

    async fn connect(&self, candidate: &Candidate) -> Result<(), EnvError> {
        self.connect_now(candidate)
    }

    async fn create_group(&self) -> Result<(), EnvError> {
        self.create_group_now()
    }

    async fn remove_group(&self) -> Result<(), EnvError> {
        self.remove_group_now()
    }

    async fn next_event(&self) -> Option<PlatformEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = lock(&self.air.state);
                let slot = &mut state.radios[self.index];
                if let Some(event) = slot.events.pop_front() {
                    return Some(event);
                }
                if slot.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}
