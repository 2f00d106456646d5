//! Command confirmation tracking.
//!
//! A command marks one or more targets as pending. Each poll compares the
//! telemetry against those targets until they match, a resend is due, the
//! change is abandoned, or an outside change takes over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::data::telemetry::{OperationMode, StateCode, StoveTelemetry};

/// Temperatures closer than this are considered equal.
const TEMPERATURE_EPSILON: f64 = 0.01;

fn temperatures_match(a: f64, b: f64) -> bool {
    (a - b).abs() < TEMPERATURE_EPSILON
}

/// Timing rules for confirming a change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeTimeouts {
    /// Time without confirmation before the unconfirmed targets are resent.
    pub command_response: Duration,
    /// Time without confirmation after which the change is abandoned.
    pub total_change: Duration,
    /// Maximum number of resends per change.
    pub max_resends: u32,
}

impl Default for ChangeTimeouts {
    fn default() -> Self {
        Self {
            command_response: Duration::from_secs(30),
            total_change: Duration::from_secs(120),
            max_resends: 3,
        }
    }
}

/// The single in-flight command intent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PendingChange {
    /// Heat level the stove should report.
    pub target_heatlevel: Option<u8>,
    /// Target temperature the stove should report.
    pub target_temperature: Option<f64>,
    /// Operation mode the stove should report.
    pub target_operation_mode: Option<OperationMode>,
    /// When the change was issued or last resent. Set iff a change is in progress.
    pub started_at: Option<DateTime<Utc>>,
    /// Resends issued so far.
    pub resend_attempt: u32,
    /// Whether a change awaits confirmation.
    pub change_in_progress: bool,
    /// Whether the change is a heat-level/temperature mode toggle.
    pub toggle_in_progress: bool,
}

impl PendingChange {
    fn clear_progress(&mut self) {
        self.change_in_progress = false;
        self.toggle_in_progress = false;
        self.started_at = None;
        self.resend_attempt = 0;
    }

    fn clear_targets(&mut self) {
        self.target_heatlevel = None;
        self.target_temperature = None;
        self.target_operation_mode = None;
    }

    fn clear(&mut self) {
        self.clear_progress();
        self.clear_targets();
    }

    fn begin(&mut self, now: DateTime<Utc>) {
        self.clear_targets();
        self.change_in_progress = true;
        self.toggle_in_progress = false;
        self.started_at = Some(now);
        self.resend_attempt = 0;
    }
}

/// The control-relevant part of one poll's telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservedControl {
    /// Firmware state code.
    pub state: StateCode,
    /// Reported heat level.
    pub heatlevel: u8,
    /// Reported target temperature.
    pub target_temp: f64,
    /// Reported operation mode.
    pub operation_mode: OperationMode,
}

impl From<&StoveTelemetry> for ObservedControl {
    fn from(telemetry: &StoveTelemetry) -> Self {
        Self {
            state: telemetry.state,
            heatlevel: telemetry.heatlevel,
            target_temp: telemetry.target_temp,
            operation_mode: telemetry.operation_mode,
        }
    }
}

/// Targets to send again, mode first.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResendPlan {
    /// Operation mode, if still unconfirmed.
    pub operation_mode: Option<OperationMode>,
    /// Heat level, if still unconfirmed.
    pub heatlevel: Option<u8>,
    /// Target temperature, if still unconfirmed.
    pub temperature: Option<f64>,
}

impl ResendPlan {
    /// Whether there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.operation_mode.is_none() && self.heatlevel.is_none() && self.temperature.is_none()
    }
}

/// What happened to the pending change during a poll.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ChangeOutcome {
    /// No change was pending.
    #[default]
    Idle,
    /// Still waiting for confirmation.
    Waiting,
    /// Every target was confirmed.
    Completed,
    /// The unconfirmed targets must be sent again.
    Resend(ResendPlan),
    /// The change was never confirmed and has been dropped.
    Abandoned,
    /// An outside change replaced the pending one.
    Overridden,
    /// The stove was stopped from outside; everything pending was dropped.
    ExternallyStopped,
}

/// Result of observing one poll.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChangeReport {
    /// Fate of the pending change.
    pub outcome: ChangeOutcome,
    /// A value changed that this coordinator did not request.
    pub app_change_detected: bool,
    /// The stove entered a shutdown state from a non-shutdown state.
    pub auto_stop_detected: bool,
    /// The stove entered an ignition state from a non-ignition state.
    pub auto_start_detected: bool,
}

/// What the stove is doing relative to the pending targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeTransition {
    /// Nothing outstanding.
    Idle,
    /// The operation mode is being changed.
    ModeChanging,
    /// A heat-level/temperature toggle has been issued.
    ModeToggling,
    /// The heat level is being changed in heat-level mode.
    HeatlevelAdjusting,
    /// The target temperature is being changed in temperature mode.
    TemperatureAdjusting,
}

impl std::fmt::Display for ModeTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::ModeChanging => "mode_changing",
            Self::ModeToggling => "mode_toggling",
            Self::HeatlevelAdjusting => "heatlevel_adjusting",
            Self::TemperatureAdjusting => "temperature_adjusting",
        };
        write!(f, "{}", label)
    }
}

/// The setpoint a user interface should show.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DisplayTarget {
    /// A heat level.
    Heatlevel(u8),
    /// A target temperature.
    Temperature(f64),
    /// Wood firing, no setpoint.
    Wood,
}

/// Derived match flags for the published snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalculatedData {
    /// Reported heat level equals the target, or no target is set.
    pub heatlevel_match: bool,
    /// Reported target temperature equals the target, or no target is set.
    pub temperature_match: bool,
    /// Reported mode equals the target, or no target is set.
    pub operation_mode_match: bool,
    /// Whether a change awaits confirmation.
    pub change_in_progress: bool,
    /// Whether a toggle awaits confirmation.
    pub toggle_in_progress: bool,
    /// What is being adjusted.
    pub mode_transition: ModeTransition,
    /// Setpoint to display.
    pub display_target: DisplayTarget,
}

/// Tracks the pending change and the last observed control values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeTracker {
    pending: PendingChange,
    previous: Option<ObservedControl>,
}

impl ChangeTracker {
    /// Create an idle tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current pending change.
    pub fn pending(&self) -> &PendingChange {
        &self.pending
    }

    /// Whether a change awaits confirmation.
    pub fn in_progress(&self) -> bool {
        self.pending.change_in_progress
    }

    /// Mark a heat level change as issued.
    pub fn begin_heatlevel(&mut self, heatlevel: u8, now: DateTime<Utc>) {
        self.pending.begin(now);
        self.pending.target_heatlevel = Some(heatlevel);
        self.pending.target_operation_mode = Some(OperationMode::HeatLevel);
    }

    /// Mark a target temperature change as issued.
    pub fn begin_temperature(&mut self, celsius: f64, now: DateTime<Utc>) {
        self.pending.begin(now);
        self.pending.target_temperature = Some(celsius);
        self.pending.target_operation_mode = Some(OperationMode::Temperature);
    }

    /// Mark an operation mode change as issued.
    pub fn begin_operation_mode(&mut self, mode: OperationMode, now: DateTime<Utc>) {
        self.pending.begin(now);
        self.pending.target_operation_mode = Some(mode);
    }

    /// Mark a mode toggle as issued.
    ///
    /// The value for the new mode is held at what the stove currently reports.
    pub fn begin_toggle(&mut self, new_mode: OperationMode, current: &ObservedControl, now: DateTime<Utc>) {
        self.pending.begin(now);
        self.pending.toggle_in_progress = true;
        self.pending.target_operation_mode = Some(new_mode);
        match new_mode {
            OperationMode::HeatLevel => self.pending.target_heatlevel = Some(current.heatlevel),
            OperationMode::Temperature => {
                self.pending.target_temperature = Some(current.target_temp)
            }
            _ => {}
        }
    }

    /// Mark a start or stop as issued. Completes on the next poll.
    pub fn begin_untargeted(&mut self, now: DateTime<Utc>) {
        self.pending.begin(now);
    }

    /// Drop the pending change after its command could not be sent.
    pub fn abort(&mut self) {
        debug!("Clearing pending change after failed send");
        self.pending.clear();
    }

    /// Process one poll's control values.
    pub fn observe(
        &mut self,
        current: &ObservedControl,
        now: DateTime<Utc>,
        timeouts: &ChangeTimeouts,
    ) -> ChangeReport {
        let mut report = ChangeReport::default();

        let Some(previous) = self.previous.replace(*current) else {
            debug!("Initialized previous control values on first poll");
            report.outcome = self.check_progress(current, now, timeouts);
            return report;
        };

        if current.state.is_shutdown() && !previous.state.is_shutdown() {
            info!("Stove stopped externally, state: {}", current.state);
            if self.pending.change_in_progress {
                warn!(
                    "Clearing pending change due to external stop - was targeting: HL={:?}, Temp={:?}, Mode={:?}",
                    self.pending.target_heatlevel,
                    self.pending.target_temperature,
                    self.pending.target_operation_mode
                );
            }
            self.pending.clear();
            report.auto_stop_detected = true;
            report.outcome = ChangeOutcome::ExternallyStopped;
            return report;
        }

        let overridden = if self.pending.change_in_progress {
            self.conflicts_with_pending(&previous, current)
        } else {
            value_changed(&previous, current)
        };

        if current.state.is_startup() && !previous.state.is_startup() {
            info!("Stove started, state: {}", current.state);
            report.auto_start_detected = true;
        }

        if overridden {
            info!(
                "External change detected: HL {} -> {}, Temp {} -> {}, Mode {} -> {}",
                previous.heatlevel,
                current.heatlevel,
                previous.target_temp,
                current.target_temp,
                previous.operation_mode,
                current.operation_mode
            );
            report.app_change_detected = true;
            let was_pending = self.pending.change_in_progress;
            self.adopt(current);
            if was_pending {
                info!("External change replaces the pending change");
                report.outcome = ChangeOutcome::Overridden;
                return report;
            }
        }

        report.outcome = self.check_progress(current, now, timeouts);
        report
    }

    /// Whether a value moved away from both its last reading and its pending target.
    fn conflicts_with_pending(&self, previous: &ObservedControl, current: &ObservedControl) -> bool {
        let pending = &self.pending;

        let mode_conflict = current.operation_mode != previous.operation_mode
            && pending.target_operation_mode != Some(current.operation_mode);

        let value_conflict = match current.operation_mode {
            OperationMode::HeatLevel => pending
                .target_heatlevel
                .map(|t| current.heatlevel != previous.heatlevel && current.heatlevel != t)
                .unwrap_or(false),
            OperationMode::Temperature => pending
                .target_temperature
                .map(|t| {
                    !temperatures_match(current.target_temp, previous.target_temp)
                        && !temperatures_match(current.target_temp, t)
                })
                .unwrap_or(false),
            _ => false,
        };

        (mode_conflict && pending.target_operation_mode.is_some()) || value_conflict
    }

    /// Take the reported values as the new baseline and drop any pending change.
    fn adopt(&mut self, current: &ObservedControl) {
        self.pending.clear_progress();
        match current.operation_mode {
            OperationMode::HeatLevel => {
                self.pending.target_heatlevel = Some(current.heatlevel);
                self.pending.target_operation_mode = Some(OperationMode::HeatLevel);
            }
            OperationMode::Temperature => {
                self.pending.target_temperature = Some(current.target_temp);
                self.pending.target_operation_mode = Some(OperationMode::Temperature);
            }
            other => self.pending.target_operation_mode = Some(other),
        }
    }

    fn unconfirmed(&self, current: &ObservedControl) -> ResendPlan {
        let pending = &self.pending;
        ResendPlan {
            operation_mode: pending
                .target_operation_mode
                .filter(|mode| *mode != current.operation_mode),
            heatlevel: pending
                .target_heatlevel
                .filter(|level| *level != current.heatlevel),
            temperature: pending
                .target_temperature
                .filter(|t| !temperatures_match(*t, current.target_temp)),
        }
    }

    fn check_progress(
        &mut self,
        current: &ObservedControl,
        now: DateTime<Utc>,
        timeouts: &ChangeTimeouts,
    ) -> ChangeOutcome {
        if !self.pending.change_in_progress {
            return ChangeOutcome::Idle;
        }

        let plan = self.unconfirmed(current);
        if plan.is_empty() {
            info!(
                "Change completed - HL: {}, Temp: {}, Mode: {}",
                current.heatlevel, current.target_temp, current.operation_mode
            );
            self.pending.clear();
            return ChangeOutcome::Completed;
        }

        let started_at = *self.pending.started_at.get_or_insert(now);
        let elapsed = (now - started_at).num_milliseconds() as f64 / 1000.0;

        if elapsed > timeouts.command_response.as_secs_f64()
            && self.pending.resend_attempt < timeouts.max_resends
        {
            self.pending.resend_attempt += 1;
            self.pending.started_at = Some(now);
            warn!(
                "Change not confirmed, resending (attempt {}/{})",
                self.pending.resend_attempt, timeouts.max_resends
            );
            ChangeOutcome::Resend(plan)
        } else if elapsed > timeouts.total_change.as_secs_f64() {
            error!("Change failed after timeout and retries");
            self.pending.clear();
            ChangeOutcome::Abandoned
        } else {
            ChangeOutcome::Waiting
        }
    }

    /// Match flags, transition label and display target for the snapshot.
    pub fn calculated(&self, current: &ObservedControl) -> CalculatedData {
        let pending = &self.pending;

        let heatlevel_match = pending
            .target_heatlevel
            .map(|t| t == current.heatlevel)
            .unwrap_or(true);
        let temperature_match = pending
            .target_temperature
            .map(|t| temperatures_match(t, current.target_temp))
            .unwrap_or(true);
        let operation_mode_match = pending
            .target_operation_mode
            .map(|m| m == current.operation_mode)
            .unwrap_or(true);

        let mode_transition = if pending.target_operation_mode.is_some() && !operation_mode_match {
            ModeTransition::ModeChanging
        } else if pending.toggle_in_progress {
            ModeTransition::ModeToggling
        } else if current.operation_mode == OperationMode::HeatLevel
            && pending.target_heatlevel.is_some()
            && !heatlevel_match
        {
            ModeTransition::HeatlevelAdjusting
        } else if current.operation_mode == OperationMode::Temperature
            && pending.target_temperature.is_some()
            && !temperature_match
        {
            ModeTransition::TemperatureAdjusting
        } else {
            ModeTransition::Idle
        };

        let display_mode = if pending.change_in_progress {
            pending.target_operation_mode.unwrap_or(current.operation_mode)
        } else {
            current.operation_mode
        };

        let display_target = match display_mode {
            OperationMode::HeatLevel => {
                DisplayTarget::Heatlevel(pending.target_heatlevel.unwrap_or(current.heatlevel))
            }
            OperationMode::Temperature => DisplayTarget::Temperature(
                pending.target_temperature.unwrap_or(current.target_temp),
            ),
            _ => DisplayTarget::Wood,
        };

        CalculatedData {
            heatlevel_match,
            temperature_match,
            operation_mode_match,
            change_in_progress: pending.change_in_progress,
            toggle_in_progress: pending.toggle_in_progress,
            mode_transition,
            display_target,
        }
    }
}

/// Whether any control value the user can change differs from the last poll.
fn value_changed(previous: &ObservedControl, current: &ObservedControl) -> bool {
    let value = match current.operation_mode {
        OperationMode::HeatLevel => current.heatlevel != previous.heatlevel,
        OperationMode::Temperature => {
            !temperatures_match(current.target_temp, previous.target_temp)
        }
        _ => false,
    };
    value || current.operation_mode != previous.operation_mode
}
