//! The "PEERS" Store - latest known state of every other vehicle in the group
//!
//! - One entry per remote [`DeviceId`]; this vehicle never appears in its own table
//! - Entries only move forward in time: an incoming record older than the stored
//!   one is ignored
//! - Entries not refreshed within the staleness window are evicted before any
//!   proximity or collision evaluation
//!
//! Freshness is judged by local receipt time, not the sender's timestamp, since
//! phone clocks in a convoy are not synchronized.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::vehicle::VehicleState;
use convoy_env::DeviceId;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerTableConfig {
    /// Entries older than this are stale (default: 5000 ms)
    pub staleness_window_ms: u64,

    /// Distress ids remembered for de-duplication (default: 100)
    pub sos_memory: usize,
}

impl Default for PeerTableConfig {
    fn default() -> Self {
        Self {
            staleness_window_ms: 5_000,
            sos_memory: 100,
        }
    }
}

impl PeerTableConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }
}

// ============================================================================
// PEER TABLE
// ============================================================================

/// One remote vehicle as last heard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub state: VehicleState,

    /// Local monotonic receipt time
    pub last_seen: Duration,
}

/// What [`PeerTable::ingest`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First record from this vehicle
    Inserted,

    /// Replaced an older (or same-age) record
    Updated,

    /// Older than what we already hold; dropped
    Outdated,

    /// Our own state echoed back; dropped
    SelfEcho,
}

impl IngestOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, IngestOutcome::Inserted | IngestOutcome::Updated)
    }
}

/// Keyed store of remote vehicle states.
#[derive(Debug, Clone)]
pub struct PeerTable {
    local_id: DeviceId,
    entries: HashMap<DeviceId, PeerEntry>,
    config: PeerTableConfig,
}

impl PeerTable {
    pub fn new(local_id: DeviceId, config: PeerTableConfig) -> Self {
        Self {
            local_id,
            entries: HashMap::new(),
            config,
        }
    }

    pub fn local_id(&self) -> &DeviceId {
        &self.local_id
    }

    /// Records a remote state received at local time `now`.
    pub fn ingest(&mut self, state: VehicleState, now: Duration) -> IngestOutcome {
        if state.device_id == self.local_id {
            return IngestOutcome::SelfEcho;
        }

        match self.entries.get_mut(&state.device_id) {
            Some(entry) if state.timestamp < entry.state.timestamp => {
                debug!(
                    "Ignoring outdated state from {} ({} < {})",
                    state.device_id, state.timestamp, entry.state.timestamp
                );
                IngestOutcome::Outdated
            }
            Some(entry) => {
                entry.state = state;
                entry.last_seen = now;
                IngestOutcome::Updated
            }
            None => {
                info!("New peer {}", state.device_id);
                self.entries.insert(
                    state.device_id.clone(),
                    PeerEntry {
                        state,
                        last_seen: now,
                    },
                );
                IngestOutcome::Inserted
            }
        }
    }

    /// Removes entries last seen more than the staleness window before `now`.
    pub fn evict_stale(&mut self, now: Duration) -> Vec<DeviceId> {
        let window = self.config.staleness_window();

        let stale: Vec<DeviceId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.last_seen) > window)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.entries.remove(id);
            info!("Peer {} went stale", id);
        }

        stale
    }

    /// Evicts stale entries, then returns the states of everyone left.
    ///
    /// This is the view the risk engine evaluates against.
    pub fn fresh_states(&mut self, now: Duration) -> Vec<VehicleState> {
        self.evict_stale(now);
        self.states()
    }

    /// Current states, ordered by device id.
    pub fn states(&self) -> Vec<VehicleState> {
        let mut states: Vec<VehicleState> =
            self.entries.values().map(|entry| entry.state.clone()).collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    pub fn get(&self, id: &DeviceId) -> Option<&PeerEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets every peer (group left or dissolved).
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!("Clearing {} peers", self.entries.len());
        }
        self.entries.clear();
    }
}

// ============================================================================
// SOS LEDGER
// ============================================================================

/// Bounded memory of distress ids already surfaced.
///
/// Relayed SOS records can arrive more than once (direct and via the
/// coordinator, or on every periodic send while the flag is up). Only the first
/// sighting of each id is reported; the oldest id is forgotten once full.
#[derive(Debug, Clone)]
pub struct SosLedger {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl SosLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns `true` the first time a given SOS id is observed.
    pub fn observe(&mut self, state: &VehicleState) -> bool {
        let Some(sos_id) = state.sos_id.as_ref().filter(|_| state.is_sos) else {
            return false;
        };

        if self.seen.contains(sos_id) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(sos_id.clone());
        self.seen.insert(sos_id.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
