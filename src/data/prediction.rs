//! Pellet depletion prediction.
//!
//! Heat-level mode divides the remaining fuel by the learned consumption
//! rate. Temperature mode simulates the firmware's burn/wait cycling:
//! burning steps the room toward the learned shutdown temperature while
//! adjusting the heat level every ten minutes, waiting cools the room to the
//! learned restart temperature, and the loop runs until the fuel is gone.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, warn};

use crate::data::forecast::{ForecastCache, DEFAULT_MATCH_TOLERANCE, SHORT_HORIZON_HOURS};
use crate::data::learning::{LearningData, LearningStatus};
use crate::data::telemetry::{OperationMode, StateCode, StoveTelemetry};
use crate::utils::{format_remaining, round_to};

/// Maximum burn/wait cycles simulated.
pub const MAX_SIMULATION_CYCLES: u32 = 100;

/// Maximum steps simulated within a single phase.
pub const MAX_PHASE_STEPS: u32 = 100_000;

/// Longest single simulation step, in seconds.
pub const MAX_STEP_SECS: f64 = 3600.0;

/// Time at a heat level before the firmware reconsiders it, in seconds.
pub const LEVEL_CHECK_SECS: f64 = 600.0;

/// Distance from target beyond which the heat level is changed, in °C.
pub const LEVEL_CHANGE_MARGIN: f64 = 0.5;

/// Heating rate below which the room is considered not to warm, in °C/h.
pub const MIN_HEATING_RATE: f64 = 0.05;

/// Outdoor temperature used when neither forecast nor sensor is available.
pub const DEFAULT_OUTDOOR_TEMP: f64 = 0.0;

/// Change in predicted remaining time that triggers a detailed trace, in seconds.
pub const SIGNIFICANT_CHANGE_SECS: i64 = 1800;

/// Terminal status of a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    /// A numeric prediction was produced.
    Ok,
    /// No fuel left.
    Empty,
    /// Not enough learned data to predict.
    InsufficientData,
    /// Pellet consumption is suspended while burning wood.
    WoodMode,
}

impl std::fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Ok => "ok",
            Self::Empty => "empty",
            Self::InsufficientData => "insufficient_data",
            Self::WoodMode => "wood_mode",
        };
        write!(f, "{}", label)
    }
}

/// How far the prediction can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Plenty of data and a simple burn pattern.
    High,
    /// Enough data, moderately complex pattern.
    Medium,
    /// Thin data, many cycles or a missing sensor.
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{}", label)
    }
}

/// Whether the prediction follows the stove's actual activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionBasis {
    /// The stove is running.
    Actual,
    /// The stove is off; the prediction assumes it would run at current settings.
    Hypothetical,
}

/// Phase the stove is in when the prediction is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentPhase {
    /// Igniting or burning.
    Burning,
    /// Waiting for the room to cool.
    Waiting,
    /// Neither.
    Off,
}

impl CurrentPhase {
    fn from_state(state: StateCode) -> Self {
        if state.is_burning() {
            Self::Burning
        } else if state.is_waiting() {
            Self::Waiting
        } else {
            Self::Off
        }
    }
}

/// Why a heating step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvent {
    /// Ten minutes at the current level elapsed.
    LevelCheck,
    /// The heat level goes up.
    IncreaseLevel,
    /// The heat level goes down.
    DecreaseLevel,
    /// The room reached the shutdown temperature.
    Shutdown,
    /// The fuel ran out.
    PelletsEmpty,
    /// Step capped to re-read the outdoor temperature.
    TempUpdate,
}

impl std::fmt::Display for StepEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::LevelCheck => "level_change_check",
            Self::IncreaseLevel => "increase_level",
            Self::DecreaseLevel => "decrease_level",
            Self::Shutdown => "shutdown",
            Self::PelletsEmpty => "pellets_empty",
            Self::TempUpdate => "temp_update",
        };
        write!(f, "{}", label)
    }
}

/// One entry of the simulation trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimulationStep {
    /// Ignition cost at the start of a burn phase.
    Startup {
        /// Seconds spent igniting.
        duration_seconds: f64,
        /// Pellets burnt igniting, in kg.
        consumption_kg: f64,
    },
    /// A burning step.
    Heating {
        /// Heat level during the step.
        heatlevel: u8,
        /// Step length in seconds.
        duration_seconds: f64,
        /// Room temperature at the start.
        start_temp: f64,
        /// Room temperature at the end.
        end_temp: f64,
        /// Outdoor temperature used.
        outdoor_temp: f64,
        /// Heating rate used, °C/h.
        heating_rate: f64,
        /// Consumption rate used, kg/h.
        consumption_rate: f64,
        /// Pellets burnt during the step.
        pellets_used: f64,
        /// Pellets left after the step.
        pellets_remaining: f64,
        /// Why the step ended.
        reason: StepEvent,
    },
    /// A waiting step.
    Waiting {
        /// Step length in seconds.
        duration_seconds: f64,
        /// Room temperature at the start.
        start_temp: f64,
        /// Room temperature at the end.
        end_temp: f64,
        /// Outdoor temperature used.
        outdoor_temp: f64,
        /// Cooling rate used, °C/h.
        cooling_rate: f64,
        /// Temperature at which burning resumes.
        restart_temp: f64,
    },
    /// A heat level change.
    LevelChange {
        /// Previous level.
        from: u8,
        /// New level.
        to: u8,
    },
}

/// Outdoor temperature sensor state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OutdoorReading {
    /// Whether a sensor is configured.
    pub sensor_configured: bool,
    /// Current reading, if the sensor answered.
    pub temperature: Option<f64>,
}

/// Everything a prediction is computed from.
#[derive(Debug, Clone)]
pub struct PredictionContext<'a> {
    /// Firmware state code.
    pub state: StateCode,
    /// Regulation mode.
    pub operation_mode: OperationMode,
    /// Current heat level.
    pub heatlevel: u8,
    /// Room temperature.
    pub room_temp: f64,
    /// Target temperature.
    pub target_temp: f64,
    /// Fuel left in the hopper, kg.
    pub fuel_remaining: f64,
    /// Learned rates.
    pub learning: &'a LearningData,
    /// Outdoor sensor state.
    pub outdoor: OutdoorReading,
    /// Cached forecast.
    pub forecast: &'a ForecastCache,
    /// Maximum distance to a usable forecast sample.
    pub forecast_tolerance: Duration,
    /// Time the prediction is made.
    pub now: DateTime<Utc>,
}

impl<'a> PredictionContext<'a> {
    /// Build a context from telemetry with no outdoor sensor.
    pub fn new(
        telemetry: &StoveTelemetry,
        fuel_remaining: f64,
        learning: &'a LearningData,
        forecast: &'a ForecastCache,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state: telemetry.state,
            operation_mode: telemetry.operation_mode,
            heatlevel: telemetry.heatlevel,
            room_temp: telemetry.room_temp,
            target_temp: telemetry.target_temp,
            fuel_remaining,
            learning,
            outdoor: OutdoorReading::default(),
            forecast,
            forecast_tolerance: DEFAULT_MATCH_TOLERANCE,
            now,
        }
    }

    /// Set the outdoor sensor state.
    pub fn with_outdoor(mut self, outdoor: OutdoorReading) -> Self {
        self.outdoor = outdoor;
        self
    }

    /// Set the forecast match tolerance.
    pub fn with_forecast_tolerance(mut self, tolerance: Duration) -> Self {
        self.forecast_tolerance = tolerance;
        self
    }

    fn outdoor_at(&self, elapsed_secs: f64) -> f64 {
        let at = self.now + ChronoDuration::milliseconds((elapsed_secs * 1000.0) as i64);
        self.forecast
            .temperature_at(at, self.forecast_tolerance)
            .or(self.outdoor.temperature)
            .unwrap_or(DEFAULT_OUTDOOR_TEMP)
    }
}

/// Conditions recorded with a prediction for the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionConditions {
    /// Firmware state code.
    pub state: StateCode,
    /// Room temperature.
    pub room_temp: f64,
    /// Target temperature.
    pub target_temp: f64,
    /// Heat level.
    pub heatlevel: u8,
    /// Outdoor sensor reading.
    pub outdoor_temp: Option<f64>,
    /// Fuel left, kg.
    pub fuel_remaining: f64,
}

/// Result of a depletion prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepletionPrediction {
    /// Terminal status.
    pub status: PredictionStatus,
    /// Whether the stove is actually running.
    pub basis: PredictionBasis,
    /// Seconds until the fuel runs out.
    pub time_remaining_seconds: i64,
    /// Remaining time for display.
    pub time_remaining_formatted: String,
    /// When the fuel runs out.
    pub depletion_time: Option<DateTime<Utc>>,
    /// Confidence, for numeric predictions.
    pub confidence: Option<Confidence>,
    /// Mode the prediction was computed for.
    pub mode: Option<OperationMode>,
    /// Heat level used in heat-level mode.
    pub current_heatlevel: Option<u8>,
    /// Consumption rate used in heat-level mode, kg/h.
    pub consumption_rate: Option<f64>,
    /// Burn cycles predicted in temperature mode.
    pub cycles_remaining: Option<u32>,
    /// Current phase in temperature mode.
    pub current_phase: Option<CurrentPhase>,
    /// Learned shutdown delta used in temperature mode.
    pub shutdown_delta: Option<f64>,
    /// Learned restart delta used in temperature mode.
    pub restart_delta: Option<f64>,
    /// Whether a weather forecast was available.
    pub forecast_used: bool,
    /// Hours of forecast ahead of now.
    pub forecast_horizon_hours: f64,
    /// Learning diagnostics.
    pub learning_status: Option<LearningStatus>,
    /// Conditions the prediction started from.
    pub conditions: PredictionConditions,
    /// Simulation trace in temperature mode.
    pub trace: Vec<SimulationStep>,
}

impl DepletionPrediction {
    fn terminal(status: PredictionStatus, ctx: &PredictionContext<'_>) -> Self {
        Self {
            status,
            basis: basis_for(ctx.state),
            time_remaining_seconds: 0,
            time_remaining_formatted: format_remaining(0),
            depletion_time: None,
            confidence: None,
            mode: None,
            current_heatlevel: None,
            consumption_rate: None,
            cycles_remaining: None,
            current_phase: None,
            shutdown_delta: None,
            restart_delta: None,
            forecast_used: false,
            forecast_horizon_hours: 0.0,
            learning_status: None,
            conditions: PredictionConditions {
                state: ctx.state,
                room_temp: ctx.room_temp,
                target_temp: ctx.target_temp,
                heatlevel: ctx.heatlevel,
                outdoor_temp: ctx.outdoor.temperature,
                fuel_remaining: ctx.fuel_remaining,
            },
            trace: Vec::new(),
        }
    }

    fn empty(ctx: &PredictionContext<'_>) -> Self {
        let mut prediction = Self::terminal(PredictionStatus::Empty, ctx);
        prediction.depletion_time = Some(ctx.now);
        prediction.confidence = Some(Confidence::High);
        prediction
    }

    fn with_remaining(mut self, seconds: i64, now: DateTime<Utc>) -> Self {
        self.time_remaining_seconds = seconds;
        self.time_remaining_formatted = format_remaining(seconds);
        self.depletion_time = Some(now + ChronoDuration::seconds(seconds));
        self
    }

    /// Whether a numeric prediction was produced.
    pub fn is_ok(&self) -> bool {
        self.status == PredictionStatus::Ok
    }

    /// Human-readable report of the prediction and its simulation trace.
    pub fn report(&self) -> String {
        let rule = "=".repeat(80);
        let mut out = String::new();

        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "PELLET DEPLETION PREDICTION DETAILS");
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "Status: {}", self.status);
        let _ = writeln!(out, "Basis: {:?}", self.basis);
        if let Some(confidence) = self.confidence {
            let _ = writeln!(out, "Confidence: {}", confidence);
        }

        if self.is_ok() {
            let _ = writeln!(
                out,
                "Time Remaining: {} ({}s)",
                self.time_remaining_formatted, self.time_remaining_seconds
            );
            if let Some(at) = self.depletion_time {
                let _ = writeln!(out, "Depletion Time: {}", at.to_rfc3339());
            }
            if let Some(mode) = self.mode {
                let _ = writeln!(out, "Mode: {}", mode);
            }
            let _ = writeln!(out, "Forecast Used: {}", self.forecast_used);
            if self.forecast_used {
                let _ = writeln!(out, "Forecast Horizon: {}h", self.forecast_horizon_hours);
            }
        }

        let c = &self.conditions;
        let _ = writeln!(out);
        let _ = writeln!(out, "CURRENT CONDITIONS:");
        let _ = writeln!(out, "  Room Temperature: {}°C", c.room_temp);
        let _ = writeln!(out, "  Target Temperature: {}°C", c.target_temp);
        let _ = writeln!(out, "  Heat Level: {}", c.heatlevel);
        let _ = writeln!(out, "  State: {}", c.state);
        if let Some(outdoor) = c.outdoor_temp {
            let _ = writeln!(out, "  External Temperature: {}°C", outdoor);
        }
        let _ = writeln!(out, "  Pellets Remaining: {:.3} kg", c.fuel_remaining);

        if !self.trace.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "SIMULATION PHASES:");
            let _ = writeln!(out, "{}", "-".repeat(80));
            for step in &self.trace {
                write_step(&mut out, step);
            }
        }

        let _ = write!(out, "{}", rule);
        out
    }
}

fn write_step(out: &mut String, step: &SimulationStep) {
    match step {
        SimulationStep::Startup {
            duration_seconds,
            consumption_kg,
        } => {
            let _ = writeln!(out, "  STARTUP: {:.1} min", duration_seconds / 60.0);
            let _ = writeln!(out, "    Consumption: {:.3} kg", consumption_kg);
        }
        SimulationStep::Heating {
            heatlevel,
            duration_seconds,
            start_temp,
            end_temp,
            outdoor_temp,
            heating_rate,
            consumption_rate,
            pellets_used,
            pellets_remaining,
            reason,
        } => {
            let _ = writeln!(out, "  HEATING (HL{}): {:.1} min", heatlevel, duration_seconds / 60.0);
            let _ = writeln!(out, "    Temp: {:.1}°C -> {:.1}°C", start_temp, end_temp);
            let _ = writeln!(out, "    Outdoor Temp: {}°C", outdoor_temp);
            let _ = writeln!(out, "    Heating Rate: {:.2}°C/h", heating_rate);
            let _ = writeln!(out, "    Consumption Rate: {:.2} kg/h", consumption_rate);
            let _ = writeln!(out, "    Pellets Used: {:.3} kg", pellets_used);
            let _ = writeln!(out, "    Pellets Remaining: {:.3} kg", pellets_remaining);
            let _ = writeln!(out, "    Ended: {}", reason);
        }
        SimulationStep::Waiting {
            duration_seconds,
            start_temp,
            end_temp,
            outdoor_temp,
            cooling_rate,
            restart_temp,
        } => {
            let _ = writeln!(out, "  WAITING: {:.1} min", duration_seconds / 60.0);
            let _ = writeln!(out, "    Temp: {:.1}°C -> {:.1}°C", start_temp, end_temp);
            let _ = writeln!(out, "    Outdoor Temp: {}°C", outdoor_temp);
            let _ = writeln!(out, "    Cooling Rate: {:.2}°C/h", cooling_rate);
            let _ = writeln!(out, "    Target Restart: {:.1}°C", restart_temp);
        }
        SimulationStep::LevelChange { from, to } => {
            let _ = writeln!(out, "  LEVEL CHANGE: HL{} -> HL{}", from, to);
        }
    }
    let _ = writeln!(out);
}

fn basis_for(state: StateCode) -> PredictionBasis {
    if state.is_running() {
        PredictionBasis::Actual
    } else {
        PredictionBasis::Hypothetical
    }
}

fn classify_confidence(
    status: &LearningStatus,
    mode: OperationMode,
    cycles: u32,
    outdoor: &OutdoorReading,
) -> Confidence {
    if status.sufficient_data && status.recent_data && mode == OperationMode::HeatLevel && cycles < 3
    {
        return Confidence::High;
    }

    let sensor_missing = outdoor.sensor_configured && outdoor.temperature.is_none();
    if !status.sufficient_data || cycles >= 8 || sensor_missing {
        Confidence::Low
    } else {
        Confidence::Medium
    }
}

/// Predict when the pellets run out.
pub fn predict(ctx: &PredictionContext<'_>) -> DepletionPrediction {
    if ctx.fuel_remaining <= 0.0 {
        return DepletionPrediction::empty(ctx);
    }

    if ctx.operation_mode == OperationMode::Wood {
        return DepletionPrediction::terminal(PredictionStatus::WoodMode, ctx);
    }

    let learning_status = ctx.learning.status(ctx.now);
    if !learning_status.sufficient_data {
        let mut prediction = DepletionPrediction::terminal(PredictionStatus::InsufficientData, ctx);
        prediction.learning_status = Some(learning_status);
        return prediction;
    }

    let forecast_used = !ctx.forecast.is_empty();
    let forecast_horizon_hours = if forecast_used {
        let hours = ctx.forecast.horizon_hours(ctx.now);
        if hours < SHORT_HORIZON_HOURS {
            warn!(
                "Weather forecast horizon too short: {:.1}h (recommended: 24h+)",
                hours
            );
        }
        round_to(hours, 1)
    } else {
        0.0
    };
    debug!(
        "Forecast status: available={}, horizon={:.1}h, entries={}",
        forecast_used,
        forecast_horizon_hours,
        ctx.forecast.samples().len()
    );

    let mut prediction = match ctx.operation_mode {
        OperationMode::Temperature => predict_temperature_mode(ctx, &learning_status),
        _ => predict_heatlevel_mode(ctx, &learning_status),
    };

    if prediction.status != PredictionStatus::Empty {
        prediction.forecast_used = forecast_used;
        prediction.forecast_horizon_hours = forecast_horizon_hours;
    }
    prediction.learning_status = Some(learning_status);
    prediction
}

fn predict_heatlevel_mode(ctx: &PredictionContext<'_>, status: &LearningStatus) -> DepletionPrediction {
    let consumption_rate = ctx.learning.consumption_rate(ctx.heatlevel);
    if consumption_rate <= 0.0 {
        return DepletionPrediction::terminal(PredictionStatus::InsufficientData, ctx);
    }

    let mut fuel = ctx.fuel_remaining;
    if !ctx.state.is_stable_burn() {
        fuel -= ctx.learning.startup.avg_consumption_kg;
        if fuel <= 0.0 {
            return DepletionPrediction::empty(ctx);
        }
    }

    let seconds = (fuel / consumption_rate * 3600.0).round() as i64;

    let mut prediction = DepletionPrediction::terminal(PredictionStatus::Ok, ctx)
        .with_remaining(seconds, ctx.now);
    prediction.confidence = Some(classify_confidence(
        status,
        OperationMode::HeatLevel,
        0,
        &ctx.outdoor,
    ));
    prediction.mode = Some(OperationMode::HeatLevel);
    prediction.current_heatlevel = Some(ctx.heatlevel);
    prediction.consumption_rate = Some(round_to(consumption_rate, 2));
    prediction
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Burn,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BurnEnd {
    Empty,
    Shutdown,
    NoConsumptionData,
    StepLimit,
}

struct Simulation<'c, 'a> {
    ctx: &'c PredictionContext<'a>,
    shutdown_delta: f64,
    restart_delta: f64,
    elapsed: f64,
    pellets: f64,
    room_temp: f64,
    heatlevel: u8,
    time_at_level: f64,
    time_at_level_1: f64,
    cycles: u32,
    trace: Vec<SimulationStep>,
}

impl<'c, 'a> Simulation<'c, 'a> {
    fn new(ctx: &'c PredictionContext<'a>) -> Self {
        let stable = ctx.state.is_stable_burn();
        Self {
            ctx,
            shutdown_delta: ctx.learning.shutdown.avg_delta,
            restart_delta: ctx.learning.restart.avg_delta,
            elapsed: 0.0,
            pellets: ctx.fuel_remaining,
            room_temp: ctx.room_temp,
            heatlevel: ctx.heatlevel.clamp(1, 3),
            time_at_level: 0.0,
            // Already holding level 1 in a stable burn counts as settled.
            time_at_level_1: if stable && ctx.heatlevel == 1 {
                LEVEL_CHECK_SECS
            } else {
                0.0
            },
            cycles: 0,
            trace: Vec::new(),
        }
    }

    /// Run until the fuel is gone. Returns false if rates were unusable.
    fn run(&mut self) -> bool {
        let mut phase = if self.ctx.state.is_burning() {
            Phase::Burn
        } else {
            Phase::Wait
        };
        let mut iterations = 0;

        while self.pellets > 0.0 && iterations < MAX_SIMULATION_CYCLES {
            iterations += 1;

            if phase == Phase::Burn {
                self.cycles += 1;
                if !self.startup() {
                    break;
                }

                match self.burn() {
                    BurnEnd::Empty => break,
                    BurnEnd::NoConsumptionData => return false,
                    BurnEnd::StepLimit => {
                        warn!("Burn phase hit the step limit, ending simulation");
                        break;
                    }
                    BurnEnd::Shutdown => phase = Phase::Wait,
                }
            }

            if phase == Phase::Wait {
                self.wait();
                phase = Phase::Burn;
                self.heatlevel = 1;
                self.time_at_level = 0.0;
                self.time_at_level_1 = 0.0;
            }
        }

        true
    }

    /// Charge one ignition. Returns false if the fuel ran out doing so.
    fn startup(&mut self) -> bool {
        let startup = &self.ctx.learning.startup;
        self.pellets -= startup.avg_consumption_kg;
        self.elapsed += startup.avg_duration_seconds;
        self.trace.push(SimulationStep::Startup {
            duration_seconds: startup.avg_duration_seconds,
            consumption_kg: startup.avg_consumption_kg,
        });
        if self.pellets <= 0.0 {
            self.pellets = 0.0;
            return false;
        }
        true
    }

    fn next_event(&self, heating_rate: f64, consumption_rate: f64) -> (f64, StepEvent) {
        let target = self.ctx.target_temp;
        let mut next: Option<(f64, StepEvent)> = None;

        if self.time_at_level >= LEVEL_CHECK_SECS {
            let projected = self.room_temp + heating_rate * LEVEL_CHECK_SECS / 3600.0;
            let gap = target - projected;
            if gap > LEVEL_CHANGE_MARGIN && self.heatlevel < 3 {
                next = Some((LEVEL_CHECK_SECS, StepEvent::IncreaseLevel));
            } else if gap < -LEVEL_CHANGE_MARGIN && self.heatlevel > 1 {
                next = Some((LEVEL_CHECK_SECS, StepEvent::DecreaseLevel));
            }
        } else {
            next = Some((LEVEL_CHECK_SECS - self.time_at_level, StepEvent::LevelCheck));
        }

        if self.heatlevel == 1 && self.time_at_level_1 >= LEVEL_CHECK_SECS {
            let to_gain = target + self.shutdown_delta - self.room_temp;
            let to_shutdown = if to_gain <= 0.0 {
                Some(0.0)
            } else if heating_rate > MIN_HEATING_RATE {
                Some(to_gain / heating_rate * 3600.0)
            } else {
                None
            };
            if let Some(secs) = to_shutdown {
                if next.map_or(true, |(t, _)| secs < t) {
                    next = Some((secs, StepEvent::Shutdown));
                }
            }
        }

        let to_empty = self.pellets / consumption_rate * 3600.0;
        match next {
            Some((t, event)) if t <= to_empty => (t, event),
            _ => (to_empty, StepEvent::PelletsEmpty),
        }
    }

    fn burn(&mut self) -> BurnEnd {
        let learning = self.ctx.learning;

        for _ in 0..MAX_PHASE_STEPS {
            let outdoor = self.ctx.outdoor_at(self.elapsed);
            let delta = self.ctx.target_temp - self.room_temp;
            let heating_rate = learning.heating_rate(self.heatlevel, delta, Some(outdoor));
            let consumption_rate = learning.consumption_rate(self.heatlevel);
            if consumption_rate <= 0.0 {
                return BurnEnd::NoConsumptionData;
            }

            let (time_to_event, event) = self.next_event(heating_rate, consumption_rate);
            let (step, event) = if time_to_event > MAX_STEP_SECS {
                (MAX_STEP_SECS, StepEvent::TempUpdate)
            } else {
                (time_to_event.max(0.0), event)
            };

            let start_temp = self.room_temp;
            self.room_temp += heating_rate * step / 3600.0;
            let used = (consumption_rate * step / 3600.0).min(self.pellets);
            self.pellets -= used;
            if event == StepEvent::PelletsEmpty {
                self.pellets = 0.0;
            }
            self.elapsed += step;
            self.time_at_level += step;
            if self.heatlevel == 1 {
                self.time_at_level_1 += step;
            }

            self.trace.push(SimulationStep::Heating {
                heatlevel: self.heatlevel,
                duration_seconds: step,
                start_temp,
                end_temp: self.room_temp,
                outdoor_temp: outdoor,
                heating_rate,
                consumption_rate,
                pellets_used: used,
                pellets_remaining: self.pellets,
                reason: event,
            });

            if self.pellets <= 0.0 {
                return BurnEnd::Empty;
            }

            match event {
                StepEvent::PelletsEmpty => return BurnEnd::Empty,
                StepEvent::Shutdown => return BurnEnd::Shutdown,
                StepEvent::TempUpdate | StepEvent::LevelCheck => {}
                StepEvent::IncreaseLevel | StepEvent::DecreaseLevel => {
                    let from = self.heatlevel;
                    self.heatlevel = if event == StepEvent::IncreaseLevel {
                        (from + 1).min(3)
                    } else {
                        from.saturating_sub(1).max(1)
                    };
                    self.trace.push(SimulationStep::LevelChange {
                        from,
                        to: self.heatlevel,
                    });
                    self.time_at_level = 0.0;
                    if self.heatlevel == 1 {
                        self.time_at_level_1 = 0.0;
                    }
                }
            }
        }

        BurnEnd::StepLimit
    }

    fn wait(&mut self) {
        let restart_temp = self.ctx.target_temp - self.restart_delta;

        for _ in 0..MAX_PHASE_STEPS {
            if self.room_temp <= restart_temp {
                break;
            }

            let outdoor = self.ctx.outdoor_at(self.elapsed);
            let cooling_rate = self.ctx.learning.cooling_rate(self.room_temp, Some(outdoor));
            if cooling_rate <= 0.0 {
                break;
            }

            let to_lose = self.room_temp - restart_temp;
            let to_restart = to_lose / cooling_rate * 3600.0;
            let (step, decrease) = if to_restart > MAX_STEP_SECS {
                (MAX_STEP_SECS, cooling_rate * MAX_STEP_SECS / 3600.0)
            } else {
                (to_restart, to_lose)
            };

            let start_temp = self.room_temp;
            self.room_temp -= decrease;
            self.elapsed += step;
            if self.room_temp <= restart_temp {
                self.room_temp = restart_temp;
            }

            self.trace.push(SimulationStep::Waiting {
                duration_seconds: step,
                start_temp,
                end_temp: self.room_temp,
                outdoor_temp: outdoor,
                cooling_rate,
                restart_temp,
            });
        }
    }
}

fn predict_temperature_mode(
    ctx: &PredictionContext<'_>,
    status: &LearningStatus,
) -> DepletionPrediction {
    let mut sim = Simulation::new(ctx);
    if !sim.run() {
        return DepletionPrediction::terminal(PredictionStatus::InsufficientData, ctx);
    }

    let seconds = sim.elapsed.round() as i64;
    let mut prediction = DepletionPrediction::terminal(PredictionStatus::Ok, ctx)
        .with_remaining(seconds, ctx.now);
    prediction.confidence = Some(classify_confidence(
        status,
        OperationMode::Temperature,
        sim.cycles,
        &ctx.outdoor,
    ));
    prediction.mode = Some(OperationMode::Temperature);
    prediction.cycles_remaining = Some(sim.cycles);
    prediction.current_phase = Some(CurrentPhase::from_state(ctx.state));
    prediction.shutdown_delta = Some(round_to(sim.shutdown_delta, 1));
    prediction.restart_delta = Some(round_to(sim.restart_delta, 1));
    prediction.trace = sim.trace;
    prediction
}

/// Detects predictions that moved enough to be worth a detailed log.
#[derive(Debug, Clone, Default)]
pub struct PredictionTracker {
    last_seconds: Option<i64>,
    last_report: Option<String>,
}

impl PredictionTracker {
    /// Create a tracker with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a prediction. Returns true if it moved by at least
    /// [`SIGNIFICANT_CHANGE_SECS`] since the previous one.
    pub fn observe(&mut self, prediction: &DepletionPrediction) -> bool {
        let current = prediction.time_remaining_seconds;
        let report = prediction.report();

        let significant = match self.last_seconds {
            Some(last) => (current - last).abs() >= SIGNIFICANT_CHANGE_SECS,
            None => false,
        };

        if significant {
            debug!(
                "Prediction changed significantly: {}s change",
                (current - self.last_seconds.unwrap_or(current)).abs()
            );
            debug!(
                "PREVIOUS PREDICTION:\n{}",
                self.last_report.as_deref().unwrap_or("No previous log")
            );
            debug!("NEW PREDICTION:\n{}", report);
        }

        self.last_seconds = Some(current);
        self.last_report = Some(report);
        significant
    }
}
