//! Bridge configuration
//!
//! `BridgeConfig` identifies the peripheral and its two characteristics;
//! `BridgeSettings` carries the tunables and is what gets persisted as JSON.

use crate::message::{CharacteristicId, DEFAULT_COMMAND_KEYWORD};
use crate::transport::DeviceSelector;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid characteristic id: {0}")]
    InvalidCharacteristic(String),
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
    #[error("Failed to parse settings: {0}")]
    Parse(String),
}

/// Token bucket parameters for control-characteristic writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteRateLimit {
    /// Writes allowed back-to-back before spacing applies
    pub burst: u32,
    /// Refill period of one token, in milliseconds
    pub min_interval_ms: u64,
}

impl Default for WriteRateLimit {
    fn default() -> Self {
        Self {
            burst: 4,
            min_interval_ms: 250,
        }
    }
}

impl WriteRateLimit {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Reconnection backoff for the link manager
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts per window before a LinkLost is reported
    pub max_attempts: u32,
    /// Fractional jitter applied to each delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 8,
            jitter: 0.2,
        }
    }
}

/// Bounded retry for a single command write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(16));
        let delay_ms = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Tunables shared by every bridge component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Capacity of both the notification and the command channel
    pub queue_capacity: usize,
    pub write_rate_limit: WriteRateLimit,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub reconnect: ReconnectSettings,
    pub command_retry: RetrySettings,
    /// How long in-flight commands may drain after shutdown is requested
    pub drain_grace_ms: u64,
    /// Substring that marks a notification as a control message
    pub command_keyword: String,
    /// `gx` threshold for the default decision policy
    pub threshold: f64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            write_rate_limit: WriteRateLimit::default(),
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 2_000,
            reconnect: ReconnectSettings::default(),
            command_retry: RetrySettings::default(),
            drain_grace_ms: 3_000,
            command_keyword: DEFAULT_COMMAND_KEYWORD.to_string(),
            threshold: 0.50,
        }
    }
}

impl BridgeSettings {
    /// Parse settings from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: BridgeSettings =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        if self.write_rate_limit.burst == 0 {
            return Err(ConfigError::InvalidSetting(
                "write_rate_limit.burst must be > 0".to_string(),
            ));
        }
        if self.scan_timeout_ms == 0 || self.connect_timeout_ms == 0 || self.write_timeout_ms == 0
        {
            return Err(ConfigError::InvalidSetting(
                "timeouts must be > 0".to_string(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting(
                "reconnect.max_attempts must be > 0".to_string(),
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::InvalidSetting(
                "reconnect.initial_delay_ms must be <= reconnect.max_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::InvalidSetting(
                "reconnect.jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        if !self.threshold.is_finite() {
            return Err(ConfigError::InvalidSetting(
                "threshold must be finite".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// Everything needed to bridge one peripheral
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub selector: DeviceSelector,
    pub notify_characteristic: CharacteristicId,
    pub command_characteristic: CharacteristicId,
    /// Match by hardware address instead of the platform's opaque peripheral id
    pub use_platform_address_mode: bool,
    pub settings: BridgeSettings,
}

impl BridgeConfig {
    pub fn new(
        selector: DeviceSelector,
        notify_characteristic: CharacteristicId,
        command_characteristic: CharacteristicId,
    ) -> Self {
        Self {
            selector,
            notify_characteristic,
            command_characteristic,
            use_platform_address_mode: false,
            settings: BridgeSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_platform_address_mode(mut self, enabled: bool) -> Self {
        self.use_platform_address_mode = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.selector.is_empty() {
            return Err(ConfigError::InvalidSetting(
                "device selector must not be empty".to_string(),
            ));
        }
        self.settings.validate()
    }
}
