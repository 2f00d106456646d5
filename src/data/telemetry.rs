//! Stove telemetry data structures.
//!
//! Typed view of the status and operating frames polled from the stove,
//! plus the classification of the firmware's numeric state codes.

use serde::{Deserialize, Serialize};

/// Lowest accepted heat level.
pub const HEATLEVEL_MIN: u8 = 1;

/// Highest accepted heat level.
pub const HEATLEVEL_MAX: u8 = 3;

/// Lowest accepted target temperature in Celsius.
pub const TARGET_TEMP_MIN: f64 = 5.0;

/// Highest accepted target temperature in Celsius.
pub const TARGET_TEMP_MAX: f64 = 35.0;

/// Firmware state code reported in the operating frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StateCode(pub u16);

impl StateCode {
    /// Ignition, first stage.
    pub const IGNITION_1: Self = Self(2);
    /// Ignition, second stage.
    pub const IGNITION_2: Self = Self(4);
    /// Stable burning.
    pub const NORMAL: Self = Self(5);
    /// Waiting for the room to cool (temperature mode).
    pub const WAITING: Self = Self(6);
    /// Manual wood firing.
    pub const WOOD: Self = Self(9);
    /// Shutting down or stopped.
    pub const STOPPED: Self = Self(14);
    /// Stable burning after a temperature-mode restart.
    pub const RESTART_BURN: Self = Self(32);

    const SHUTDOWN_CODES: [u16; 3] = [13, 14, 20];

    /// Create from a raw code.
    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    /// Convert to the raw code.
    pub fn to_raw(&self) -> u16 {
        self.0
    }

    /// Ignition codes that mark an automatic start.
    pub fn is_startup(&self) -> bool {
        matches!(self.0, 2 | 4)
    }

    /// Codes that belong to a startup sequence for learning purposes.
    ///
    /// Includes the restart burn code, which the firmware passes through
    /// after ignition in temperature mode.
    pub fn is_startup_sequence(&self) -> bool {
        matches!(self.0, 2 | 4 | 32)
    }

    /// Stable burning codes.
    pub fn is_stable_burn(&self) -> bool {
        matches!(self.0, 5 | 32)
    }

    /// Any burning code, ignition included.
    pub fn is_burning(&self) -> bool {
        self.is_stable_burn() || self.is_startup()
    }

    /// Waiting for the room to cool.
    pub fn is_waiting(&self) -> bool {
        *self == Self::WAITING
    }

    /// Manual wood firing.
    pub fn is_wood(&self) -> bool {
        *self == Self::WOOD
    }

    /// Shutting down or stopped.
    pub fn is_shutdown(&self) -> bool {
        Self::SHUTDOWN_CODES.contains(&self.0)
    }

    /// Codes where pellets are being or about to be burnt.
    pub fn is_running(&self) -> bool {
        matches!(self.0, 2 | 4 | 5 | 6 | 32)
    }
}

impl std::fmt::Display for StateCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Regulation mode of the stove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationMode {
    /// Fixed heat level 1-3.
    #[default]
    HeatLevel = 0,
    /// Room temperature setpoint.
    Temperature = 1,
    /// Manual wood firing.
    Wood = 2,
    /// Any other value reported by the firmware.
    Unknown = 255,
}

impl OperationMode {
    /// Create from a raw value.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::HeatLevel,
            1 => Self::Temperature,
            2 => Self::Wood,
            _ => Self::Unknown,
        }
    }

    /// Convert to the raw value.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }

    /// Whether pellet automation applies in this mode.
    pub fn is_pellet_mode(&self) -> bool {
        matches!(self, Self::HeatLevel | Self::Temperature)
    }

    /// The other pellet mode, used by mode toggling.
    pub fn toggled(&self) -> Self {
        match self {
            Self::HeatLevel => Self::Temperature,
            _ => Self::HeatLevel,
        }
    }
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeatLevel => write!(f, "heatlevel"),
            Self::Temperature => write!(f, "temperature"),
            Self::Wood => write!(f, "wood"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Map the stove's power percentage to a heat level.
pub fn heatlevel_from_power_pct(power_pct: f64) -> u8 {
    if power_pct <= 30.0 {
        1
    } else if power_pct <= 75.0 {
        2
    } else {
        3
    }
}

/// Fixed power percentage written for a heat level.
pub fn fixed_power_for_heatlevel(heatlevel: u8) -> Option<u8> {
    match heatlevel {
        1 => Some(10),
        2 => Some(50),
        3 => Some(100),
        _ => None,
    }
}

/// Operating hours counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OperatingHours {
    /// Auger running hours.
    pub auger: f64,
    /// Ignition running hours.
    pub ignition: f64,
    /// Total stove running hours.
    pub stove: f64,
}

/// One poll's worth of telemetry.
///
/// Replaced wholesale every cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoveTelemetry {
    /// Firmware state code.
    pub state: StateCode,
    /// Firmware substate code.
    pub substate: u16,
    /// Current heat level (1-3).
    pub heatlevel: u8,
    /// Current power output percentage.
    pub power_pct: f64,
    /// Regulation mode.
    pub operation_mode: OperationMode,
    /// Room temperature in Celsius.
    pub room_temp: f64,
    /// Target room temperature in Celsius.
    pub target_temp: f64,
    /// Smoke temperature in Celsius.
    pub smoke_temp: f64,
    /// Shaft temperature in Celsius.
    pub shaft_temp: Option<f64>,
    /// Domestic hot water temperature in Celsius.
    pub dhw_temp: Option<f64>,
    /// Heat output in kW.
    pub power_kw: Option<f64>,
    /// Carbon monoxide reading.
    pub co: Option<f64>,
    /// CO yellow warning level.
    pub co_yellow: Option<f64>,
    /// CO red warning level.
    pub co_red: Option<f64>,
    /// Auger motor current in mA.
    pub motor_current_ma: Option<f64>,
    /// Seconds the stove has been connected to the cloud relay.
    pub internet_uptime: Option<String>,
    /// Operating hours counters.
    pub operating_hours: OperatingHours,
    /// Lifetime pellet consumption reported by the status frame, in kg.
    pub consumption_total: Option<f64>,
}

impl StoveTelemetry {
    /// Whether the stove is currently in wood mode.
    pub fn is_wood(&self) -> bool {
        self.state.is_wood() || self.operation_mode == OperationMode::Wood
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(StateCode::IGNITION_1.is_startup());
        assert!(StateCode::RESTART_BURN.is_stable_burn());
        assert!(StateCode::RESTART_BURN.is_startup_sequence());
        assert!(!StateCode::RESTART_BURN.is_startup());
        assert!(StateCode::WAITING.is_running());
        assert!(!StateCode::WAITING.is_burning());
        assert!(StateCode::STOPPED.is_shutdown());
        assert!(!StateCode::NORMAL.is_shutdown());
        assert!(!StateCode::WOOD.is_running());
    }

    #[test]
    fn test_operation_mode_from_raw() {
        assert_eq!(OperationMode::from_raw(0), OperationMode::HeatLevel);
        assert_eq!(OperationMode::from_raw(1), OperationMode::Temperature);
        assert_eq!(OperationMode::from_raw(2), OperationMode::Wood);
        assert_eq!(OperationMode::from_raw(7), OperationMode::Unknown);
        assert_eq!(OperationMode::Temperature.to_raw(), 1);
    }

    #[test]
    fn test_toggle() {
        assert_eq!(OperationMode::HeatLevel.toggled(), OperationMode::Temperature);
        assert_eq!(OperationMode::Temperature.toggled(), OperationMode::HeatLevel);
        assert_eq!(OperationMode::Wood.toggled(), OperationMode::HeatLevel);
    }

    #[test]
    fn test_heatlevel_from_power_pct() {
        assert_eq!(heatlevel_from_power_pct(0.0), 1);
        assert_eq!(heatlevel_from_power_pct(30.0), 1);
        assert_eq!(heatlevel_from_power_pct(30.5), 2);
        assert_eq!(heatlevel_from_power_pct(75.0), 2);
        assert_eq!(heatlevel_from_power_pct(100.0), 3);
    }

    #[test]
    fn test_fixed_power() {
        assert_eq!(fixed_power_for_heatlevel(1), Some(10));
        assert_eq!(fixed_power_for_heatlevel(3), Some(100));
        assert_eq!(fixed_power_for_heatlevel(4), None);
    }
}
