//! User settings.
//!
//! Thresholds and automation switches set from the control surface and
//! persisted across restarts.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default low-fuel notification level in percent.
pub const DEFAULT_NOTIFICATION_LEVEL: f64 = 10.0;

/// Default critical-fuel shutdown level in percent.
pub const DEFAULT_SHUTDOWN_LEVEL: f64 = 5.0;

/// Default high smoke temperature threshold in Celsius.
pub const DEFAULT_HIGH_SMOKE_TEMP: f64 = 370.0;

/// Default time above the high smoke threshold before alerting, in seconds.
pub const DEFAULT_HIGH_SMOKE_DURATION_SECS: u64 = 30;

/// Default low wood-fire smoke temperature threshold in Celsius.
pub const DEFAULT_LOW_WOOD_TEMP: f64 = 175.0;

/// Default time below the low wood threshold before alerting, in seconds.
pub const DEFAULT_LOW_WOOD_DURATION_SECS: u64 = 300;

/// Longest accepted alert duration in seconds.
pub const MAX_ALERT_DURATION_SECS: u64 = 3600;

/// Persisted user settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    /// Fuel percentage at or below which the low-fuel alert fires.
    pub notification_level: f64,
    /// Fuel percentage at or below which the stove is stopped.
    pub shutdown_level: f64,
    /// Whether the stove is stopped at the shutdown level.
    pub auto_shutdown_enabled: bool,
    /// Whether pellet burning resumes automatically after a wood fire.
    pub auto_resume_after_wood: bool,
    /// Smoke temperature at or above which the high-smoke alert builds.
    pub high_smoke_temp_threshold: f64,
    /// Seconds above the high-smoke threshold before the alert fires.
    pub high_smoke_duration_secs: u64,
    /// Smoke temperature at or below which the low-wood alert builds.
    pub low_wood_temp_threshold: f64,
    /// Seconds below the low-wood threshold before the alert fires.
    pub low_wood_duration_secs: u64,
    /// Identifier of the outdoor temperature sensor, if configured.
    pub external_temp_sensor: Option<String>,
    /// Identifier of the weather forecast source, if configured.
    pub forecast_source: Option<String>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            notification_level: DEFAULT_NOTIFICATION_LEVEL,
            shutdown_level: DEFAULT_SHUTDOWN_LEVEL,
            auto_shutdown_enabled: false,
            auto_resume_after_wood: false,
            high_smoke_temp_threshold: DEFAULT_HIGH_SMOKE_TEMP,
            high_smoke_duration_secs: DEFAULT_HIGH_SMOKE_DURATION_SECS,
            low_wood_temp_threshold: DEFAULT_LOW_WOOD_TEMP,
            low_wood_duration_secs: DEFAULT_LOW_WOOD_DURATION_SECS,
            external_temp_sensor: None,
            forecast_source: None,
        }
    }
}

fn check_percentage(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(Error::invalid_parameter(name, value))
    }
}

fn check_temperature(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && (0.0..=600.0).contains(&value) {
        Ok(value)
    } else {
        Err(Error::invalid_parameter(name, value))
    }
}

fn check_duration(name: &str, secs: u64) -> Result<u64> {
    if secs <= MAX_ALERT_DURATION_SECS {
        Ok(secs)
    } else {
        Err(Error::invalid_parameter(name, secs))
    }
}

impl UserSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the low-fuel notification level.
    pub fn set_notification_level(&mut self, percent: f64) -> Result<()> {
        self.notification_level = check_percentage("notification_level", percent)?;
        Ok(())
    }

    /// Set the critical-fuel shutdown level.
    pub fn set_shutdown_level(&mut self, percent: f64) -> Result<()> {
        self.shutdown_level = check_percentage("shutdown_level", percent)?;
        Ok(())
    }

    /// Set the high smoke temperature threshold.
    pub fn set_high_smoke_temp_threshold(&mut self, celsius: f64) -> Result<()> {
        self.high_smoke_temp_threshold = check_temperature("high_smoke_temp_threshold", celsius)?;
        Ok(())
    }

    /// Set how long the smoke temperature must stay high before alerting.
    pub fn set_high_smoke_duration(&mut self, secs: u64) -> Result<()> {
        self.high_smoke_duration_secs = check_duration("high_smoke_duration", secs)?;
        Ok(())
    }

    /// Set the low wood-fire temperature threshold.
    pub fn set_low_wood_temp_threshold(&mut self, celsius: f64) -> Result<()> {
        self.low_wood_temp_threshold = check_temperature("low_wood_temp_threshold", celsius)?;
        Ok(())
    }

    /// Set how long the wood fire must stay cold before alerting.
    pub fn set_low_wood_duration(&mut self, secs: u64) -> Result<()> {
        self.low_wood_duration_secs = check_duration("low_wood_duration", secs)?;
        Ok(())
    }

    /// Whether an outdoor temperature sensor is configured.
    pub fn has_external_sensor(&self) -> bool {
        self.external_temp_sensor.is_some()
    }
}
