//! Dashboard configuration
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration file. Durations are written in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::LayoutConfig;
use crate::live::supervisor::ReconnectPolicy;
use crate::zones::{ZoneTable, ZoneTableError, DEFAULT_AGE};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid zone table: {0}")]
    InvalidZones(#[from] ZoneTableError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde adapter for `Duration` fields stored as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Per-participant defaults and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantSettings {
    /// Age used to derive max heart rate when the profile has none.
    pub default_age: u8,
    /// Body weight used for energy estimates when the profile has none.
    pub default_weight_kg: f64,
    /// Trailing window kept in each participant's history.
    #[serde(with = "duration_ms")]
    pub history_window: Duration,
    /// A participant with no update for this long is shown as stale.
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,
    pub high_alert_bpm: u16,
    pub low_alert_bpm: u16,
    /// Remove participants when their device disconnects instead of
    /// marking them stale. Used for shared wall displays.
    pub remove_on_disconnect: bool,
}

impl Default for ParticipantSettings {
    fn default() -> Self {
        Self {
            default_age: DEFAULT_AGE,
            default_weight_kg: 75.0,
            history_window: Duration::from_secs(60),
            stale_after: Duration::from_secs(10),
            high_alert_bpm: 180,
            low_alert_bpm: 40,
            remove_on_disconnect: false,
        }
    }
}

/// Timer periods for the live view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "duration_ms")]
    pub render_interval: Duration,
    #[serde(with = "duration_ms")]
    pub session_tick: Duration,
    #[serde(with = "duration_ms")]
    pub resize_debounce: Duration,
    /// Upper bound on a single membership lookup.
    #[serde(with = "duration_ms")]
    pub resolution_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            render_interval: Duration::from_secs(1),
            session_tick: Duration::from_secs(1),
            resize_debounce: Duration::from_millis(250),
            resolution_timeout: Duration::from_secs(5),
        }
    }
}

/// Complete dashboard configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub layout: LayoutConfig,
    pub zones: ZoneTable,
    pub reconnect: ReconnectPolicy,
    pub participants: ParticipantSettings,
    pub timing: TimingConfig,
}

impl DashboardConfig {
    /// Load and validate a configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_json_slice(&data)
    }

    pub fn from_json_slice(data: &[u8]) -> Result<Self, ConfigError> {
        let config: DashboardConfig = serde_json::from_slice(data)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.zones.validate()?;
        if self.layout.max_columns == 0 {
            return Err(ConfigError::Invalid("layout.max_columns must be at least 1".into()));
        }
        if self.layout.flow_card_size <= 0.0 {
            return Err(ConfigError::Invalid("layout.flow_card_size must be positive".into()));
        }
        if self.timing.render_interval.is_zero() {
            return Err(ConfigError::Invalid("timing.render_interval must be non-zero".into()));
        }
        // Zone time counts ticks as seconds.
        if self.timing.session_tick != Duration::from_secs(1) {
            return Err(ConfigError::Invalid(format!(
                "timing.session_tick must be 1000 ms, got {} ms",
                self.timing.session_tick.as_millis()
            )));
        }
        if self.participants.history_window.is_zero() {
            return Err(ConfigError::Invalid(
                "participants.history_window must be non-zero".into(),
            ));
        }
        if self.reconnect.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("reconnect.connect_timeout must be non-zero".into()));
        }
        if self.participants.low_alert_bpm >= self.participants.high_alert_bpm {
            return Err(ConfigError::Invalid(format!(
                "low alert ({}) must be below high alert ({})",
                self.participants.low_alert_bpm, self.participants.high_alert_bpm
            )));
        }
        Ok(())
    }
}
