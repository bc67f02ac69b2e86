//! Agent configuration, aggregated from each engine's own config.
//!
//! Every section has working defaults, so a JSON file only needs the fields
//! that differ:
//!
//! ```json
//! { "risk": { "danger_radius_m": 15.0 }, "exchange": { "send_interval_ms": 500 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::convoy_exchange::ExchangeConfig;
use crate::convoy_fusion::EstimatorConfig;
use crate::convoy_peers::PeerTableConfig;
use crate::convoy_risk::RiskConfig;
use crate::convoy_session::SessionConfig;
use crate::crash_detection::CrashConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for a Convoy agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent's logical name (for logging)
    pub name: String,

    pub estimator: EstimatorConfig,
    pub risk: RiskConfig,
    pub peers: PeerTableConfig,
    pub session: SessionConfig,
    pub exchange: ExchangeConfig,
    pub crash: CrashConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "convoy-agent".to_string(),
            estimator: EstimatorConfig::default(),
            risk: RiskConfig::default(),
            peers: PeerTableConfig::default(),
            session: SessionConfig::default(),
            exchange: ExchangeConfig::default(),
            crash: CrashConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Rejects values the engines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.risk.step_s <= 0.0 || self.risk.horizon_s < 0.0 {
            return Err(ConfigError::Invalid(
                "risk.step_s must be positive and risk.horizon_s non-negative".to_string(),
            ));
        }
        if self.exchange.send_interval_ms == 0 {
            return Err(ConfigError::Invalid("exchange.send_interval_ms must be positive".to_string()));
        }
        if self.exchange.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("exchange.max_frame_bytes must be positive".to_string()));
        }
        if self.peers.sos_memory == 0 {
            return Err(ConfigError::Invalid("peers.sos_memory must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.exchange.listen_addr.port(), 8888);
        assert_eq!(config.peers.staleness_window_ms, 5_000);
        assert_eq!(config.peers.sos_memory, 100);
        assert_eq!(config.session.discovery_timeout_ms, 10_000);
        assert_eq!(config.crash.rearm_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AgentConfig::from_json_str(
            r#"{ "risk": { "danger_radius_m": 15.0 }, "exchange": { "send_interval_ms": 500 } }"#,
        )
        .unwrap();

        assert_eq!(config.risk.danger_radius_m, 15.0);
        assert_eq!(config.risk.caution_radius_fast_m, 50.0);
        assert_eq!(config.exchange.send_interval_ms, 500);
        assert_eq!(config.exchange.connect_timeout_ms, 5_000);
        assert_eq!(config.name, "convoy-agent");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            AgentConfig::from_json_str(r#"{ "risk": { "step_s": 0.0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AgentConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }
}
