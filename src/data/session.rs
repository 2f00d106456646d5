//! Learning session tracking.
//!
//! Follows the stove through startup, stable burning and waiting periods
//! and turns each completed period into an observation in the
//! [`LearningData`] tables. At most one session of each kind is open at a
//! time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::learning::{CoolingSegment, HeatingSegment, LearningData};
use crate::data::telemetry::{OperationMode, StateCode};

/// Minimum stable-burn duration recorded as a heating observation, in seconds.
pub const MIN_HEATING_SECS: i64 = 900;

/// Stable-burn duration after which a periodic snapshot is recorded, in seconds.
pub const HEATING_SNAPSHOT_SECS: i64 = 1800;

/// Minimum waiting duration recorded as a cooling observation, in seconds.
pub const MIN_COOLING_SECS: i64 = 1800;

/// Minimum startup duration recorded as a startup observation, in seconds.
pub const MIN_STARTUP_SECS: i64 = 60;

/// An open startup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartupSession {
    /// When the sequence started.
    pub started_at: DateTime<Utc>,
    /// Learning consumption total at the start.
    pub start_consumption: f64,
}

/// An open stable-burn period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatingSession {
    /// Heat level held.
    pub heatlevel: u8,
    /// Start of the current measurement window.
    pub stable_start: DateTime<Utc>,
    /// Room temperature at the start of the window.
    pub start_room_temp: f64,
    /// Learning consumption total at the start of the window.
    pub start_consumption: f64,
    /// Target temperature when the session opened.
    pub target_temp: f64,
    /// Operation mode when the session opened.
    pub operation_mode: OperationMode,
}

/// An open waiting period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoolingSession {
    /// When waiting started.
    pub started_at: DateTime<Utc>,
    /// Room temperature when waiting started.
    pub start_room_temp: f64,
    /// Target temperature when waiting started.
    pub target_temp: f64,
    /// Operation mode when waiting started.
    pub operation_mode: OperationMode,
}

/// Per-cycle values the tracker needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionInputs {
    /// Firmware state code.
    pub state: StateCode,
    /// Current heat level.
    pub heatlevel: u8,
    /// Room temperature.
    pub room_temp: f64,
    /// Target temperature.
    pub target_temp: f64,
    /// Regulation mode.
    pub operation_mode: OperationMode,
    /// Learning consumption total.
    pub learning_consumption: f64,
    /// Outdoor temperature, if a sensor is available.
    pub outdoor_temp: Option<f64>,
    /// Whether a change made outside this coordinator was seen this cycle.
    pub app_change_detected: bool,
}

/// Open sessions, one slot per kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionTracker {
    /// Open startup sequence.
    pub startup: Option<StartupSession>,
    /// Open stable-burn period.
    pub heating: Option<HeatingSession>,
    /// Open waiting period.
    pub cooling: Option<CoolingSession>,
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds()
}

impl SessionTracker {
    /// Create a tracker with no open sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every open session without recording.
    pub fn clear(&mut self) {
        self.startup = None;
        self.heating = None;
        self.cooling = None;
    }

    /// Advance the sessions by one poll. Returns the number of observations recorded.
    pub fn update(
        &mut self,
        learning: &mut LearningData,
        inputs: &SessionInputs,
        now: DateTime<Utc>,
    ) -> usize {
        if !inputs.operation_mode.is_pellet_mode() {
            if self.heating.is_some() || self.cooling.is_some() || self.startup.is_some() {
                debug!(
                    "Operation mode {} suspends learning sessions",
                    inputs.operation_mode
                );
            }
            self.clear();
            return 0;
        }

        let mut recorded = 0;
        recorded += self.track_startup(learning, inputs, now);

        let state = inputs.state;
        if state.is_stable_burn() {
            recorded += self.track_heating(learning, inputs, now);
            if inputs.operation_mode == OperationMode::Temperature {
                recorded += self.close_cooling_on_restart(learning, inputs, now);
            }
        } else if state.is_waiting() && inputs.operation_mode == OperationMode::Temperature {
            recorded += self.enter_waiting(learning, inputs, now);
        }

        if !state.is_burning() && !state.is_waiting() {
            recorded += self.flush(learning, inputs, now);
        }

        recorded
    }

    fn track_startup(
        &mut self,
        learning: &mut LearningData,
        inputs: &SessionInputs,
        now: DateTime<Utc>,
    ) -> usize {
        let state = inputs.state;

        if state.is_startup_sequence() {
            if self.startup.is_none() {
                info!("Startup session started (state {})", state);
                self.startup = Some(StartupSession {
                    started_at: now,
                    start_consumption: inputs.learning_consumption,
                });
            }
            return 0;
        }

        let Some(session) = self.startup.take() else {
            return 0;
        };

        if state != StateCode::NORMAL {
            debug!("Startup session interrupted (state {})", state);
            return 0;
        }

        let duration = seconds_between(session.started_at, now);
        let consumption = inputs.learning_consumption - session.start_consumption;
        if duration > MIN_STARTUP_SECS && consumption > 0.0 {
            learning.record_startup(duration as u64, consumption);
            1
        } else {
            warn!(
                "Startup session invalid ({}s, {:.3} kg), not recording",
                duration, consumption
            );
            0
        }
    }

    fn open_heating(inputs: &SessionInputs, now: DateTime<Utc>) -> HeatingSession {
        HeatingSession {
            heatlevel: inputs.heatlevel,
            stable_start: now,
            start_room_temp: inputs.room_temp,
            start_consumption: inputs.learning_consumption,
            target_temp: inputs.target_temp,
            operation_mode: inputs.operation_mode,
        }
    }

    fn heating_segment(session: &HeatingSession, inputs: &SessionInputs, duration: i64) -> HeatingSegment {
        HeatingSegment {
            heatlevel: session.heatlevel,
            duration_seconds: duration as u64,
            start_room_temp: session.start_room_temp,
            end_room_temp: inputs.room_temp,
            target_temp: session.target_temp,
            consumption_kg: inputs.learning_consumption - session.start_consumption,
            outdoor_temp: inputs.outdoor_temp,
        }
    }

    /// Record the heating session if it ran long enough. The session stays open.
    fn record_heating_if_long(
        session: &HeatingSession,
        learning: &mut LearningData,
        inputs: &SessionInputs,
        now: DateTime<Utc>,
    ) -> usize {
        let duration = seconds_between(session.stable_start, now);
        if duration >= MIN_HEATING_SECS {
            learning.record_heating(&Self::heating_segment(session, inputs, duration), now);
            1
        } else {
            0
        }
    }

    fn track_heating(
        &mut self,
        learning: &mut LearningData,
        inputs: &SessionInputs,
        now: DateTime<Utc>,
    ) -> usize {
        let Some(session) = self.heating.as_mut() else {
            debug!("Started heating session at HL{}", inputs.heatlevel);
            self.heating = Some(Self::open_heating(inputs, now));
            return 0;
        };

        if session.heatlevel != inputs.heatlevel {
            let recorded = Self::record_heating_if_long(session, learning, inputs, now);
            debug!("Heat level changed to HL{}, new stable period", inputs.heatlevel);
            *session = Self::open_heating(inputs, now);
            return recorded;
        }

        let duration = seconds_between(session.stable_start, now);
        if duration >= HEATING_SNAPSHOT_SECS {
            learning.record_heating(&Self::heating_segment(session, inputs, duration), now);
            session.stable_start = now;
            session.start_room_temp = inputs.room_temp;
            session.start_consumption = inputs.learning_consumption;
            debug!(
                "Periodic snapshot for HL{} after {:.1} min",
                session.heatlevel,
                duration as f64 / 60.0
            );
            return 1;
        }

        0
    }

    fn close_cooling_on_restart(
        &mut self,
        learning: &mut LearningData,
        inputs: &SessionInputs,
        now: DateTime<Utc>,
    ) -> usize {
        let Some(session) = self.cooling.take() else {
            return 0;
        };

        let duration = seconds_between(session.started_at, now);
        if duration < MIN_COOLING_SECS {
            warn!(
                "Cooling session too short ({:.1} min), not recording",
                duration as f64 / 60.0
            );
            return 0;
        }

        learning.record_cooling(
            &CoolingSegment {
                duration_seconds: duration as u64,
                start_room_temp: session.start_room_temp,
                end_room_temp: inputs.room_temp,
                outdoor_temp: inputs.outdoor_temp,
            },
            now,
        );

        let target_unchanged = session.target_temp == inputs.target_temp;
        let mode_unchanged = session.operation_mode == OperationMode::Temperature
            && inputs.operation_mode == OperationMode::Temperature;
        if target_unchanged && mode_unchanged && !inputs.app_change_detected {
            learning.record_restart_delta(session.target_temp - inputs.room_temp);
            2
        } else {
            info!("Restart was interrupted, not recording restart delta");
            1
        }
    }

    fn enter_waiting(
        &mut self,
        learning: &mut LearningData,
        inputs: &SessionInputs,
        now: DateTime<Utc>,
    ) -> usize {
        let mut recorded = 0;

        if self.cooling.is_none() {
            self.cooling = Some(CoolingSession {
                started_at: now,
                start_room_temp: inputs.room_temp,
                target_temp: inputs.target_temp,
                operation_mode: inputs.operation_mode,
            });

            if let Some(heating) = &self.heating {
                if heating.operation_mode == OperationMode::Temperature
                    && heating.target_temp == inputs.target_temp
                {
                    learning.record_shutdown_delta(inputs.room_temp - inputs.target_temp);
                    recorded += 1;
                } else {
                    info!("Stove entered waiting after a user change, not recording shutdown delta");
                }
            }
            debug!("Started cooling session");
        }

        if let Some(heating) = self.heating.take() {
            recorded += Self::record_heating_if_long(&heating, learning, inputs, now);
        }

        recorded
    }

    fn flush(
        &mut self,
        learning: &mut LearningData,
        inputs: &SessionInputs,
        now: DateTime<Utc>,
    ) -> usize {
        let mut recorded = 0;

        if let Some(heating) = self.heating.take() {
            recorded += Self::record_heating_if_long(&heating, learning, inputs, now);
        }

        if inputs.operation_mode == OperationMode::Temperature {
            if let Some(cooling) = self.cooling.take() {
                let duration = seconds_between(cooling.started_at, now);
                if duration >= MIN_COOLING_SECS {
                    learning.record_cooling(
                        &CoolingSegment {
                            duration_seconds: duration as u64,
                            start_room_temp: cooling.start_room_temp,
                            end_room_temp: inputs.room_temp,
                            outdoor_temp: inputs.outdoor_temp,
                        },
                        now,
                    );
                    recorded += 1;
                }
            }
        }

        recorded
    }
}
