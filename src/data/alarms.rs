//! Alert evaluation.
//!
//! Each alert is a threshold with a hold time and a re-arm margin. The
//! condition has to hold for the whole hold time before the alert fires,
//! and once fired it stays latched until the monitored value moves back
//! past the threshold by the margin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::settings::UserSettings;

/// Re-arm margin for the high smoke alert, in °C below the threshold.
pub const HIGH_SMOKE_REARM_MARGIN: f64 = 20.0;

/// Re-arm margin for the low wood alert, in °C above the threshold.
pub const LOW_WOOD_REARM_MARGIN: f64 = 10.0;

/// The alerts tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    /// Fuel at or below the notification level.
    LowFuel,
    /// Fuel at or below the shutdown level with auto-shutdown enabled.
    CriticalFuel,
    /// Smoke temperature too high.
    HighSmoke,
    /// Wood fire dying out.
    LowWood,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowFuel => write!(f, "low fuel"),
            Self::CriticalFuel => write!(f, "critical fuel"),
            Self::HighSmoke => write!(f, "high smoke temperature"),
            Self::LowWood => write!(f, "low wood temperature"),
        }
    }
}

/// Which side of the threshold is the alarming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Alarming at or above the threshold.
    Above,
    /// Alarming at or below the threshold.
    Below,
}

/// Progress of an alert's hold timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AlertTiming {
    /// The condition holds but the hold time has not elapsed.
    Building {
        /// Seconds since the condition became true.
        elapsed: i64,
        /// Seconds until the alert fires.
        remaining: i64,
    },
    /// The hold time has elapsed.
    Exceeded {
        /// Seconds since the condition became true.
        elapsed: i64,
        /// Seconds past the hold time.
        exceeded_by: i64,
    },
}

/// State of a single alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    /// Threshold value.
    pub threshold: f64,
    /// Seconds the condition must hold before firing.
    pub duration_secs: u64,
    /// Distance past the threshold required to re-arm after firing.
    pub rearm_margin: f64,
    /// Alarming side of the threshold.
    pub direction: Direction,
    /// When the condition most recently became true.
    pub condition_start: Option<DateTime<Utc>>,
    /// Whether the alert is currently raised.
    pub active: bool,
    /// Whether the alert has fired and not yet re-armed.
    pub notified: bool,
}

impl AlertState {
    /// Create an idle alert.
    pub fn new(threshold: f64, duration_secs: u64, rearm_margin: f64, direction: Direction) -> Self {
        Self {
            threshold,
            duration_secs,
            rearm_margin,
            direction,
            condition_start: None,
            active: false,
            notified: false,
        }
    }

    fn condition(&self, value: f64) -> bool {
        match self.direction {
            Direction::Above => value >= self.threshold,
            Direction::Below => value <= self.threshold,
        }
    }

    fn rearmed(&self, value: f64) -> bool {
        match self.direction {
            Direction::Above => value < self.threshold - self.rearm_margin,
            Direction::Below => value > self.threshold + self.rearm_margin,
        }
    }

    /// Feed a new value. Returns true exactly when the alert fires.
    pub fn evaluate(&mut self, value: f64, now: DateTime<Utc>) -> bool {
        if self.condition(value) {
            let start = *self.condition_start.get_or_insert(now);
            let elapsed = (now - start).num_seconds();
            if elapsed >= self.duration_secs as i64 {
                self.active = true;
                if !self.notified {
                    self.notified = true;
                    return true;
                }
            }
        } else {
            self.condition_start = None;
            self.active = false;
            if self.rearmed(value) {
                self.notified = false;
            }
        }
        false
    }

    /// Stop timing without touching the latch.
    pub fn suspend(&mut self) {
        self.condition_start = None;
        self.active = false;
    }

    /// Release the latch.
    pub fn rearm(&mut self) {
        self.notified = false;
    }

    /// Progress of the hold timer, if the condition currently holds.
    pub fn timing(&self, now: DateTime<Utc>) -> Option<AlertTiming> {
        let start = self.condition_start?;
        let elapsed = (now - start).num_seconds();
        let duration = self.duration_secs as i64;
        Some(if elapsed < duration {
            AlertTiming::Building {
                elapsed,
                remaining: duration - elapsed,
            }
        } else {
            AlertTiming::Exceeded {
                elapsed,
                exceeded_by: elapsed - duration,
            }
        })
    }
}

/// Values the alerts are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AlertInputs {
    /// Fuel remaining in percent, if fuel accounting ran this cycle.
    pub fuel_percentage: Option<f64>,
    /// Smoke temperature, if telemetry was read this cycle.
    pub smoke_temp: Option<f64>,
    /// Whether the stove is in wood mode.
    pub in_wood_mode: bool,
}

/// The four alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvaluator {
    /// Low fuel notification.
    pub low_fuel: AlertState,
    /// Critical fuel auto-shutdown.
    pub critical_fuel: AlertState,
    /// High smoke temperature.
    pub high_smoke: AlertState,
    /// Low wood-fire temperature.
    pub low_wood: AlertState,
}

impl Default for AlertEvaluator {
    fn default() -> Self {
        Self::new(&UserSettings::default())
    }
}

impl AlertEvaluator {
    /// Create idle alerts with thresholds from settings.
    pub fn new(settings: &UserSettings) -> Self {
        let mut evaluator = Self {
            low_fuel: AlertState::new(0.0, 0, 0.0, Direction::Below),
            critical_fuel: AlertState::new(0.0, 0, 0.0, Direction::Below),
            high_smoke: AlertState::new(0.0, 0, HIGH_SMOKE_REARM_MARGIN, Direction::Above),
            low_wood: AlertState::new(0.0, 0, LOW_WOOD_REARM_MARGIN, Direction::Below),
        };
        evaluator.apply_settings(settings);
        evaluator
    }

    /// Copy thresholds and hold times from settings.
    pub fn apply_settings(&mut self, settings: &UserSettings) {
        self.low_fuel.threshold = settings.notification_level;
        self.critical_fuel.threshold = settings.shutdown_level;
        self.high_smoke.threshold = settings.high_smoke_temp_threshold;
        self.high_smoke.duration_secs = settings.high_smoke_duration_secs;
        self.low_wood.threshold = settings.low_wood_temp_threshold;
        self.low_wood.duration_secs = settings.low_wood_duration_secs;
    }

    /// Release the fuel latches after a refill.
    pub fn clear_fuel_latches(&mut self) {
        self.low_fuel.rearm();
        self.low_fuel.suspend();
        self.critical_fuel.rearm();
        self.critical_fuel.suspend();
    }

    /// Evaluate every alert and return the ones that fired.
    pub fn evaluate(
        &mut self,
        settings: &UserSettings,
        inputs: &AlertInputs,
        now: DateTime<Utc>,
    ) -> Vec<AlertKind> {
        self.apply_settings(settings);
        let mut fired = Vec::new();

        if let Some(percentage) = inputs.fuel_percentage {
            if self.low_fuel.evaluate(percentage, now) {
                warn!(
                    "Low pellet level: {:.1}% (threshold {:.1}%)",
                    percentage, self.low_fuel.threshold
                );
                fired.push(AlertKind::LowFuel);
            }

            if settings.auto_shutdown_enabled {
                if self.critical_fuel.evaluate(percentage, now) {
                    warn!(
                        "Critical pellet level: {:.1}% (threshold {:.1}%), stopping stove",
                        percentage, self.critical_fuel.threshold
                    );
                    fired.push(AlertKind::CriticalFuel);
                }
            } else {
                self.critical_fuel.suspend();
                if percentage > self.critical_fuel.threshold {
                    self.critical_fuel.rearm();
                }
            }
        }

        if let Some(smoke) = inputs.smoke_temp {
            if self.high_smoke.evaluate(smoke, now) {
                warn!(
                    "High smoke temperature: {:.1}°C for {}s (threshold {:.1}°C)",
                    smoke, self.high_smoke.duration_secs, self.high_smoke.threshold
                );
                fired.push(AlertKind::HighSmoke);
            }

            if inputs.in_wood_mode {
                if self.low_wood.evaluate(smoke, now) {
                    warn!(
                        "Low wood fire temperature: {:.1}°C for {}s (threshold {:.1}°C)",
                        smoke, self.low_wood.duration_secs, self.low_wood.threshold
                    );
                    fired.push(AlertKind::LowWood);
                }
            } else if self.low_wood.condition_start.is_some() {
                debug!("Left wood mode, low wood timer stopped");
                self.low_wood.suspend();
            }
        }

        fired
    }
}
