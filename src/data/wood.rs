//! Wood mode bookkeeping.
//!
//! When the stove switches to burning wood the pellet settings in force are
//! remembered so the stove can go back to pellets once the wood fire has
//! burned down.

use serde::Serialize;
use tracing::{debug, info};

use crate::data::telemetry::{OperationMode, StoveTelemetry};

/// Smoke temperature at or below which the wood fire counts as burned down.
pub const RESUME_SMOKE_TEMP: f64 = 110.0;

/// Pellet settings in force when wood mode was entered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PreWoodSettings {
    /// Operation mode before wood mode.
    pub operation_mode: OperationMode,
    /// Heat level before wood mode.
    pub heatlevel: u8,
    /// Target temperature before wood mode.
    pub target_temp: f64,
}

/// Start the stove, then restore the pre-wood heat level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeAction {
    /// Heat level to restore.
    pub heatlevel: u8,
}

/// Tracks entry to and exit from wood mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WoodModeTracker {
    saved: Option<PreWoodSettings>,
    resume_sent: bool,
    last: Option<StoveTelemetry>,
}

impl WoodModeTracker {
    /// Create an idle tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings saved on wood mode entry.
    pub fn saved(&self) -> Option<PreWoodSettings> {
        self.saved
    }

    /// Whether the stove is currently in wood mode.
    pub fn in_wood_mode(&self) -> bool {
        self.last.as_ref().map(|t| t.is_wood()).unwrap_or(false)
    }

    /// Whether auto-resume was already issued for this wood session.
    pub fn resume_sent(&self) -> bool {
        self.resume_sent
    }

    /// Feed one poll's telemetry.
    ///
    /// Returns the resume action once per wood session when auto-resume is
    /// enabled, the stove was in heat-level mode before, and the smoke
    /// temperature has dropped to [`RESUME_SMOKE_TEMP`].
    pub fn observe(&mut self, telemetry: &StoveTelemetry, auto_resume: bool) -> Option<ResumeAction> {
        let was_wood = self.in_wood_mode();
        let previous = self.last.replace(telemetry.clone());

        if !telemetry.is_wood() {
            if was_wood {
                info!("Left wood mode");
                self.saved = None;
                self.resume_sent = false;
            }
            return None;
        }

        if !was_wood {
            // Settings from the poll before the switch are the pellet ones.
            let source = previous.as_ref().filter(|p| !p.is_wood()).unwrap_or(telemetry);
            let saved = PreWoodSettings {
                operation_mode: source.operation_mode,
                heatlevel: source.heatlevel,
                target_temp: source.target_temp,
            };
            info!(
                "Entered wood mode, saved mode {} heatlevel {} target {:.1}°C",
                saved.operation_mode.to_raw(),
                saved.heatlevel,
                saved.target_temp
            );
            self.saved = Some(saved);
            self.resume_sent = false;
        }

        if !auto_resume || self.resume_sent {
            return None;
        }

        let saved = self.saved?;
        if saved.operation_mode != OperationMode::HeatLevel {
            return None;
        }
        if telemetry.smoke_temp > RESUME_SMOKE_TEMP {
            debug!(
                "Wood fire still burning: smoke {:.1}°C > {:.1}°C",
                telemetry.smoke_temp, RESUME_SMOKE_TEMP
            );
            return None;
        }

        info!(
            "Wood fire burned down (smoke {:.1}°C), resuming pellets at heatlevel {}",
            telemetry.smoke_temp, saved.heatlevel
        );
        self.resume_sent = true;
        Some(ResumeAction {
            heatlevel: saved.heatlevel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::telemetry::StateCode;

    fn pellets(heatlevel: u8) -> StoveTelemetry {
        StoveTelemetry {
            state: StateCode::NORMAL,
            operation_mode: OperationMode::HeatLevel,
            heatlevel,
            target_temp: 21.0,
            smoke_temp: 180.0,
            ..Default::default()
        }
    }

    fn wood(smoke: f64) -> StoveTelemetry {
        StoveTelemetry {
            state: StateCode::WOOD,
            operation_mode: OperationMode::Wood,
            heatlevel: 1,
            smoke_temp: smoke,
            ..Default::default()
        }
    }

    #[test]
    fn test_saves_pellet_settings_from_previous_poll() {
        let mut tracker = WoodModeTracker::new();
        tracker.observe(&pellets(3), true);
        assert_eq!(tracker.observe(&wood(300.0), true), None);

        let saved = tracker.saved().unwrap();
        assert_eq!(saved.operation_mode, OperationMode::HeatLevel);
        assert_eq!(saved.heatlevel, 3);
        assert!(tracker.in_wood_mode());
    }

    #[test]
    fn test_resume_once_when_fire_dies() {
        let mut tracker = WoodModeTracker::new();
        tracker.observe(&pellets(2), true);
        tracker.observe(&wood(250.0), true);
        assert_eq!(tracker.observe(&wood(110.0), true), Some(ResumeAction { heatlevel: 2 }));
        assert_eq!(tracker.observe(&wood(90.0), true), None);
        assert!(tracker.resume_sent());
    }

    #[test]
    fn test_no_resume_when_disabled_or_temperature_mode() {
        let mut tracker = WoodModeTracker::new();
        tracker.observe(&pellets(2), false);
        tracker.observe(&wood(250.0), false);
        assert_eq!(tracker.observe(&wood(80.0), false), None);

        let mut tracker = WoodModeTracker::new();
        let mut before = pellets(2);
        before.operation_mode = OperationMode::Temperature;
        tracker.observe(&before, true);
        tracker.observe(&wood(250.0), true);
        assert_eq!(tracker.observe(&wood(80.0), true), None);
    }

    #[test]
    fn test_leaving_wood_clears_record() {
        let mut tracker = WoodModeTracker::new();
        tracker.observe(&pellets(2), true);
        tracker.observe(&wood(80.0), true);
        tracker.observe(&pellets(2), true);

        assert_eq!(tracker.saved(), None);
        assert!(!tracker.resume_sent());
        assert!(!tracker.in_wood_mode());
    }
}
