//! Common types for the Convoy environment abstraction.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Stable per-install identifier of a vehicle.
///
/// Opaque on the wire; a UUID v4 string when generated locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Creates a new random DeviceId.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a deterministic DeviceId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes).to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability; ids from peers may be any UTF-8
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        write!(f, "{}", &self.0[..end])
    }
}

/// A nearby device reported by discovery.
///
/// `address` is the platform's link-layer handle (a MAC address on Wi-Fi
/// Direct), not the vehicle's [`DeviceId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// Platform address used for `connect`
    pub address: String,

    /// Human-readable name
    pub name: String,

    /// The candidate already owns a formed group
    #[serde(default)]
    pub group_owner: bool,
}

impl Candidate {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            group_owner: false,
        }
    }

    /// Marks the candidate as the owner of an existing group.
    pub fn owning_group(mut self) -> Self {
        self.group_owner = true;
        self
    }
}

/// Result of group negotiation as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Whether a group currently exists
    pub formed: bool,

    /// This device won the coordinator (group owner) election
    pub is_coordinator: bool,

    /// Socket address of the coordinator's listener (participants only)
    pub coordinator_address: Option<SocketAddr>,
}

impl GroupInfo {
    /// Group formed with this device as coordinator.
    pub fn coordinator() -> Self {
        Self {
            formed: true,
            is_coordinator: true,
            coordinator_address: None,
        }
    }

    /// Group formed with this device as participant.
    pub fn participant(coordinator_address: SocketAddr) -> Self {
        Self {
            formed: true,
            is_coordinator: false,
            coordinator_address: Some(coordinator_address),
        }
    }

    /// No group.
    pub fn not_formed() -> Self {
        Self {
            formed: false,
            is_coordinator: false,
            coordinator_address: None,
        }
    }
}

/// Availability of the ad-hoc networking capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityStatus {
    Available,
    Unavailable,
    PermissionDenied,
}

/// Asynchronous notification from the ad-hoc networking capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Discovery produced a new candidate list (possibly empty).
    PeersChanged(Vec<Candidate>),

    /// Group negotiation finished or the group changed.
    ConnectionInfoAvailable(GroupInfo),

    /// The group this device belonged to is gone.
    GroupDissolved,

    /// Radio enabled/disabled or permission revoked.
    CapabilityStatusChanged(CapabilityStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_from_seed_is_deterministic() {
        assert_eq!(DeviceId::from_seed(7), DeviceId::from_seed(7));
        assert_ne!(DeviceId::from_seed(7), DeviceId::from_seed(8));
    }

    #[test]
    fn test_device_id_display_is_shortened() {
        let id = DeviceId::from("0123456789abcdef");
        assert_eq!(id.to_string(), "01234567");
        assert_eq!(DeviceId::from("abc").to_string(), "abc");
    }

    #[test]
    fn test_device_id_display_respects_char_boundaries() {
        assert_eq!(DeviceId::from("aaaaaaaé-rest").to_string(), "aaaaaaaé");
        assert_eq!(DeviceId::from("véhicule-ünïcode").to_string(), "véhicule");
        assert_eq!(DeviceId::from("🚗🚙🚕").to_string(), "🚗🚙🚕");
    }

    #[test]
    fn test_group_info_constructors() {
        let addr: SocketAddr = "192.168.49.1:8888".parse().unwrap();
        let info = GroupInfo::participant(addr);
        assert!(info.formed);
        assert!(!info.is_coordinator);
        assert_eq!(info.coordinator_address, Some(addr));

        assert!(!GroupInfo::not_formed().formed);
        assert!(GroupInfo::coordinator().is_coordinator);
    }
}
