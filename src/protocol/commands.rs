//! Stove write commands.
//!
//! Each command maps to a settings path and value accepted by the
//! firmware's write call.

use crate::data::telemetry::{
    fixed_power_for_heatlevel, OperationMode, HEATLEVEL_MAX, HEATLEVEL_MIN, TARGET_TEMP_MAX,
    TARGET_TEMP_MIN,
};
use crate::error::{Error, Result};

/// Path for the regulation mode.
pub const PATH_OPERATION_MODE: &str = "regulation.operation_mode";

/// Path for the fixed power percentage used in heat-level mode.
pub const PATH_FIXED_POWER: &str = "regulation.fixed_power";

/// Path for the room temperature setpoint.
pub const PATH_BOILER_TEMP: &str = "boiler.temp";

/// Path that starts the stove.
pub const PATH_START: &str = "misc.start";

/// Path that stops the stove.
pub const PATH_STOP: &str = "misc.stop";

/// A single write sent to the stove.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoveCommand {
    /// Change the regulation mode.
    SetOperationMode(OperationMode),
    /// Change the heat level (1-3).
    SetHeatLevel(u8),
    /// Change the room temperature setpoint.
    SetTargetTemperature(f64),
    /// Start the stove.
    Start,
    /// Stop the stove.
    Stop,
}

impl StoveCommand {
    /// Build a heat level command, rejecting levels outside 1-3.
    pub fn heatlevel(level: u8) -> Result<Self> {
        if !(HEATLEVEL_MIN..=HEATLEVEL_MAX).contains(&level) {
            return Err(Error::invalid_parameter("heatlevel", level));
        }
        Ok(Self::SetHeatLevel(level))
    }

    /// Build a setpoint command, rejecting values outside the accepted range.
    pub fn target_temperature(celsius: f64) -> Result<Self> {
        if !celsius.is_finite() || !(TARGET_TEMP_MIN..=TARGET_TEMP_MAX).contains(&celsius) {
            return Err(Error::invalid_parameter("temperature", celsius));
        }
        Ok(Self::SetTargetTemperature(celsius))
    }

    /// Build a mode command, rejecting modes the firmware does not accept.
    pub fn operation_mode(mode: OperationMode) -> Result<Self> {
        if mode == OperationMode::Unknown {
            return Err(Error::invalid_parameter("operation_mode", mode.to_raw()));
        }
        Ok(Self::SetOperationMode(mode))
    }

    /// The settings path written by this command.
    pub fn path(&self) -> &'static str {
        match self {
            Self::SetOperationMode(_) => PATH_OPERATION_MODE,
            Self::SetHeatLevel(_) => PATH_FIXED_POWER,
            Self::SetTargetTemperature(_) => PATH_BOILER_TEMP,
            Self::Start => PATH_START,
            Self::Stop => PATH_STOP,
        }
    }

    /// The value written by this command.
    pub fn value(&self) -> String {
        match self {
            Self::SetOperationMode(mode) => mode.to_raw().to_string(),
            Self::SetHeatLevel(level) => fixed_power_for_heatlevel(*level)
                .unwrap_or(10)
                .to_string(),
            Self::SetTargetTemperature(celsius) => celsius.to_string(),
            Self::Start | Self::Stop => "1".to_string(),
        }
    }
}

impl std::fmt::Display for StoveCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.path(), self.value())
    }
}
