//! Impact detection from raw accelerometer magnitude.

use serde::{Deserialize, Serialize};
use tracing::error;

/// Message attached to SOS records raised by the detector.
pub const CRASH_SOS_MESSAGE: &str = "Crash detected! Sensor impact.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub enabled: bool,

    /// Acceleration magnitude that counts as an impact (default: 25 m/s²)
    pub threshold_mps2: f64,

    /// Minimum time between two reported impacts (default: 10 s)
    pub rearm_ms: i64,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_mps2: 25.0,
            rearm_ms: 10_000,
        }
    }
}

/// Flags an impact when `|a|` exceeds the threshold, at most once per re-arm window.
#[derive(Debug, Clone)]
pub struct CrashDetector {
    config: CrashConfig,
    last_impact_ms: Option<i64>,
}

impl CrashDetector {
    pub fn new(config: CrashConfig) -> Self {
        Self {
            config,
            last_impact_ms: None,
        }
    }

    /// Feeds one accelerometer sample; returns `true` when it is a new impact.
    pub fn observe(&mut self, acceleration: [f64; 3], timestamp_ms: i64) -> bool {
        if !self.config.enabled {
            return false;
        }

        let magnitude = acceleration.iter().map(|a| a * a).sum::<f64>().sqrt();
        if !(magnitude > self.config.threshold_mps2) {
            return false;
        }

        if let Some(last) = self.last_impact_ms {
            if timestamp_ms - last <= self.config.rearm_ms {
                return false;
            }
        }

        error!(
            "Impact detected: {:.1} m/s² (threshold {:.1} m/s²)",
            magnitude, self.config.threshold_mps2
        );
        self.last_impact_ms = Some(timestamp_ms);
        true
    }
}

impl Default for CrashDetector {
    fn default() -> Self {
        Self::new(CrashConfig::default())
    }
}
