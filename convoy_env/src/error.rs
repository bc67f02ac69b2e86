//! Error types for the Convoy environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// The ad-hoc networking capability cannot be initialised (no radio,
    /// feature unsupported, service torn down).
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Location or nearby-device permission was denied.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Discovery/connect/socket failure that is expected to clear up.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Platform framework is busy and refused the request.
    #[error("Platform busy")]
    Busy,

    /// Target device is out of range (or partitioned in simulation)
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

/// Coarse classification used by the session to decide between retry and escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Recovered locally by returning to discovery.
    Transient,
    /// Ends the session and is reported upward.
    Terminal,
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(node: impl std::fmt::Display) -> Self {
        Self::NodeUnreachable(node.to_string())
    }

    /// Creates a capability-unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::CapabilityUnavailable(msg.into())
    }

    /// Returns whether the error should be retried or escalated.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapabilityUnavailable(_) | Self::PermissionDenied(_) => ErrorKind::Terminal,
            Self::NetworkError(_) | Self::Busy | Self::NodeUnreachable(_) | Self::Timeout(_) => {
                ErrorKind::Transient
            }
        }
    }

    /// Shorthand for `kind() == ErrorKind::Terminal`.
    pub fn is_terminal(&self) -> bool {
        self.kind() == ErrorKind::Terminal
    }
}
