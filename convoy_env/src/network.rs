//! Ad-hoc group networking abstraction for Convoy agents.

use async_trait::async_trait;

use crate::error::EnvError;
use crate::types::{Candidate, DeviceId, PlatformEvent};

/// The platform's one-hop ad-hoc networking capability.
///
/// # Implementations
///
/// - **Production**: a thin adapter over the phone's Wi-Fi Direct manager
/// - **Simulation**: `SimRadio`, an in-memory medium with range limits
///
/// # Flow
///
/// ```text
/// Session                 AdHocNetwork                    Platform
///   |-- discover() ------------>|                             |
///   |                           |-- scan -------------------->|
///   |<-- PeersChanged ----------|<----------------------------|
///   |-- connect(candidate) ---->|                             |
///   |<-- ConnectionInfoAvailable (formed, role, address) -----|
/// ```
///
/// Each call only *initiates* the operation. Outcomes arrive later through
/// [`AdHocNetwork::next_event`]; an `Err` means the request was refused outright.
#[async_trait]
pub trait AdHocNetwork: Send + Sync + 'static {
    /// This device's platform address, as peers see it in their candidate lists.
    fn local_address(&self) -> String;

    /// Starts (or restarts) peer discovery.
    async fn discover(&self) -> Result<(), EnvError>;

    /// Cancels an in-flight discovery.
    async fn stop_discovery(&self) -> Result<(), EnvError>;

    /// Asks the platform to form a group with `candidate`.
    async fn connect(&self, candidate: &Candidate) -> Result<(), EnvError>;

    /// Forms a new group with this device as the prospective coordinator.
    async fn create_group(&self) -> Result<(), EnvError>;

    /// Leaves/tears down the current group.
    async fn remove_group(&self) -> Result<(), EnvError>;

    /// Receives the next platform notification.
    ///
    /// Must be cancel-safe: the agent polls it inside `select!`.
    /// Returns `None` once the capability has been shut down.
    async fn next_event(&self) -> Option<PlatformEvent>;
}

/// Fault injection for simulated radios.
pub trait NetworkController: Send + Sync {
    /// Creates a partition between two device sets.
    fn partition(&self, group_a: &[DeviceId], group_b: &[DeviceId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets frame loss probability for a directed link (0.0 - 1.0).
    fn set_link_loss(&self, from: &DeviceId, to: &DeviceId, loss_rate: f64);
}
