//! Pellet consumption accounting.
//!
//! The stove reports a counter of kilograms burnt since local midnight.
//! [`ConsumptionTracker`] turns successive readings of that counter into
//! increments and keeps two independent "since event" totals plus the
//! accumulator used by the learning sessions.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default hopper capacity in kg.
pub const DEFAULT_CAPACITY_KG: f64 = 9.5;

/// Fuel inventory derived from the consumption counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuelState {
    /// Hopper capacity in kg.
    pub capacity: f64,
    /// Burnt since the last refill, in kg.
    pub consumed_since_refill: f64,
    /// Burnt since the last cleaning, in kg.
    pub consumed_since_cleaning: f64,
}

impl Default for FuelState {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY_KG,
            consumed_since_refill: 0.0,
            consumed_since_cleaning: 0.0,
        }
    }
}

impl FuelState {
    /// Pellets left in the hopper, never negative.
    pub fn remaining(&self) -> f64 {
        (self.capacity - self.consumed_since_refill).max(0.0)
    }

    /// Pellets left as a percentage of capacity.
    pub fn percentage(&self) -> f64 {
        if self.capacity > 0.0 {
            self.remaining() / self.capacity * 100.0
        } else {
            0.0
        }
    }
}

/// Tracks the daily counter and accumulates consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumptionTracker {
    /// Fuel totals.
    fuel: FuelState,
    /// Last daily counter value applied to the fuel totals.
    last_day_value: f64,
    /// Consumption accumulated for learning sessions, never reset.
    learning_total: f64,
    /// Last daily counter value applied to the learning accumulator.
    learning_baseline: Option<f64>,
}

impl Default for ConsumptionTracker {
    fn default() -> Self {
        Self {
            fuel: FuelState::default(),
            last_day_value: 0.0,
            learning_total: 0.0,
            learning_baseline: None,
        }
    }
}

impl ConsumptionTracker {
    /// Create a tracker with the default capacity and a zero baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current fuel totals.
    pub fn fuel(&self) -> FuelState {
        self.fuel
    }

    /// Apply a new reading of the daily counter to the fuel totals.
    ///
    /// A decrease means the counter rolled over at midnight: the baseline
    /// moves to the new value and the totals are left alone.
    pub fn update(&mut self, daily_counter: f64) -> FuelState {
        if !daily_counter.is_finite() {
            return self.fuel;
        }

        let delta = daily_counter - self.last_day_value;
        if delta < 0.0 {
            info!(
                "Daily counter reset from {:.2} kg to {:.2} kg",
                self.last_day_value, daily_counter
            );
            self.last_day_value = daily_counter;
        } else if delta > 0.0 {
            self.fuel.consumed_since_refill += delta;
            self.fuel.consumed_since_cleaning += delta;
            self.last_day_value = daily_counter;
            debug!(
                "Consumption +{:.2} kg (since refill {:.2} kg, since cleaning {:.2} kg)",
                delta, self.fuel.consumed_since_refill, self.fuel.consumed_since_cleaning
            );
        }

        self.fuel
    }

    /// Apply a new reading of the daily counter to the learning accumulator.
    ///
    /// Unlike the fuel totals, the value reached after a midnight reset is
    /// counted, since it was burnt after the last reading. The first reading
    /// only sets the baseline. Returns the increment applied.
    pub fn update_learning(&mut self, daily_counter: f64) -> f64 {
        if !daily_counter.is_finite() {
            return 0.0;
        }

        let Some(baseline) = self.learning_baseline else {
            self.learning_baseline = Some(daily_counter);
            debug!("Learning consumption baseline set to {:.3} kg", daily_counter);
            return 0.0;
        };

        let mut increment = daily_counter - baseline;
        if increment < 0.0 {
            increment = daily_counter;
        }

        self.learning_baseline = Some(daily_counter);
        if increment > 0.0 {
            self.learning_total += increment;
            increment
        } else {
            0.0
        }
    }

    /// Total consumption seen by the learning accumulator.
    pub fn learning_total(&self) -> f64 {
        self.learning_total
    }

    /// Record a hopper refill.
    pub fn refill(&mut self) {
        info!(
            "Pellets refilled after {:.2} kg consumed",
            self.fuel.consumed_since_refill
        );
        self.fuel.consumed_since_refill = 0.0;
    }

    /// Record a stove cleaning.
    pub fn reset_cleaning_counter(&mut self) {
        info!(
            "Cleaning counter reset after {:.2} kg consumed",
            self.fuel.consumed_since_cleaning
        );
        self.fuel.consumed_since_cleaning = 0.0;
    }

    /// Change the hopper capacity.
    pub fn set_capacity(&mut self, capacity_kg: f64) -> Result<()> {
        if !capacity_kg.is_finite() || capacity_kg <= 0.0 || capacity_kg > 1000.0 {
            return Err(Error::invalid_parameter("pellet_capacity", capacity_kg));
        }
        self.fuel.capacity = capacity_kg;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_midnight_reset_sequence() {
        let mut tracker = ConsumptionTracker::new();

        assert!((tracker.update(2.0).consumed_since_refill - 2.0).abs() < 1e-9);
        assert!((tracker.update(5.0).consumed_since_refill - 5.0).abs() < 1e-9);
        assert!((tracker.update(1.0).consumed_since_refill - 5.0).abs() < 1e-9);
        assert!((tracker.update(3.0).consumed_since_refill - 7.0).abs() < 1e-9);
        assert!((tracker.fuel().consumed_since_cleaning - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_refill_and_cleaning_are_independent() {
        let mut tracker = ConsumptionTracker::new();
        tracker.update(4.0);
        tracker.refill();

        let fuel = tracker.update(5.0);
        assert!((fuel.consumed_since_refill - 1.0).abs() < 1e-9);
        assert!((fuel.consumed_since_cleaning - 5.0).abs() < 1e-9);

        tracker.reset_cleaning_counter();
        let fuel = tracker.fuel();
        assert!((fuel.consumed_since_refill - 1.0).abs() < 1e-9);
        assert_eq!(fuel.consumed_since_cleaning, 0.0);
    }

    #[test]
    fn test_remaining_is_clamped() {
        let mut tracker = ConsumptionTracker::new();
        let fuel = tracker.update(12.0);
        assert_eq!(fuel.remaining(), 0.0);
        assert_eq!(fuel.percentage(), 0.0);

        let fuel = FuelState {
            capacity: 10.0,
            consumed_since_refill: 2.5,
            consumed_since_cleaning: 2.5,
        };
        assert!((fuel.remaining() - 7.5).abs() < 1e-9);
        assert!((fuel.percentage() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_learning_accumulator_counts_post_reset_value() {
        let mut tracker = ConsumptionTracker::new();
        assert_eq!(tracker.update_learning(2.0), 0.0);
        assert!((tracker.update_learning(5.0) - 3.0).abs() < 1e-9);
        assert!((tracker.update_learning(1.0) - 1.0).abs() < 1e-9);
        assert!((tracker.learning_total() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_capacity_validation() {
        let mut tracker = ConsumptionTracker::new();
        assert!(tracker.set_capacity(0.0).is_err());
        assert!(tracker.set_capacity(f64::NAN).is_err());
        tracker.set_capacity(15.0).unwrap();
        assert_eq!(tracker.fuel().capacity, 15.0);
    }

    proptest! {
        #[test]
        fn prop_consumed_tracks_positive_deltas(
            days in prop::collection::vec(prop::collection::vec(0.0f64..3.0, 1..10), 1..5)
        ) {
            let mut tracker = ConsumptionTracker::new();
            let mut expected = 0.0;
            let mut last = 0.0;

            for increments in days {
                // Each day restarts the counter from zero.
                let mut counter = 0.0;
                for inc in increments {
                    counter += inc;
                    let delta = counter - last;
                    if delta > 0.0 {
                        expected += delta;
                    }
                    last = counter;
                    tracker.update(counter);
                }
            }

            let fuel = tracker.fuel();
            prop_assert!((fuel.consumed_since_refill - expected).abs() < 1e-6);
            prop_assert!(fuel.consumed_since_refill >= 0.0);
        }
    }
}
