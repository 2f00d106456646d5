//! Consumption counter history.
//!
//! The stove reports three counter series: per day of the current month,
//! per month of the current year, and per year since 2013. Months the stove
//! has no data for carry a small placeholder value which is ignored.
//! Monthly snapshots are kept across years so the current month can be
//! compared against the same month last year.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::utils::round_to;

/// Placeholder value the stove reports for months without data.
pub const PLACEHOLDER_KG: f64 = 0.002;

/// Year of the first entry in the yearly counter series.
pub const FIRST_COUNTER_YEAR: i32 = 2013;

/// A calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    /// Calendar year.
    pub year: i32,
    /// Month, 1 to 12.
    pub month: u32,
}

impl MonthKey {
    /// Create a key.
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// Key of the month containing `date`.
    pub fn of(date: NaiveDate) -> Self {
        Self::new(date.year(), date.month())
    }

    /// The same month one year earlier.
    pub fn previous_year(&self) -> Self {
        Self::new(self.year - 1, self.month)
    }
}

/// Current month compared against the same month last year.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct YearOverYear {
    /// Month being compared, 1 to 12.
    pub month: u32,
    /// Consumption this year in kg.
    pub current_year_value: f64,
    /// Consumption in the same month last year in kg.
    pub last_year_value: f64,
    /// Difference in kg.
    pub difference: f64,
    /// Difference relative to last year in percent.
    pub percentage_change: f64,
}

/// Consumption figures derived from one fetch of the counter series.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConsumptionReport {
    /// Consumed today in kg.
    pub day: f64,
    /// Consumed yesterday in kg, zero on the first of the month.
    pub yesterday: f64,
    /// Consumed this month in kg.
    pub month: f64,
    /// Sum of this year's months up to the current one in kg.
    pub year_to_date: f64,
    /// The stove's own yearly counter for the current year in kg.
    pub year_from_stove: f64,
    /// Monthly counters of the current year, keyed 1 to 12.
    pub monthly_history: BTreeMap<u32, f64>,
    /// Yearly counters keyed by calendar year.
    pub yearly_history: BTreeMap<i32, f64>,
    /// Comparison with last year, when a snapshot for last year exists.
    pub year_over_year: Option<YearOverYear>,
}

/// Persisted monthly consumption snapshots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumptionHistory {
    /// Whether the snapshots were seeded from the stove's monthly series.
    pub initialized: bool,
    /// Consumption per month in kg.
    #[serde(with = "crate::data::learning::entries")]
    pub snapshots: BTreeMap<MonthKey, f64>,
}

impl ConsumptionHistory {
    /// Create empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for a month.
    pub fn snapshot(&self, key: MonthKey) -> Option<f64> {
        self.snapshots.get(&key).copied()
    }

    /// Digest one fetch of the counter series.
    ///
    /// The first call seeds a snapshot for every month with real data.
    /// Months after the current one belong to the previous year. Later
    /// calls only refresh the current month.
    pub fn update(
        &mut self,
        days: &[f64],
        months: &[f64],
        years: &[f64],
        today: NaiveDate,
    ) -> ConsumptionReport {
        let current = MonthKey::of(today);
        let day_index = today.day() as usize;
        let month_index = today.month() as usize;

        let day = entry(days, day_index);
        // On the 1st the day series still holds last month's tail.
        let yesterday = today
            .pred_opt()
            .map(|d| entry(days, d.day() as usize))
            .unwrap_or(0.0);
        let month = entry(months, month_index);

        if !self.initialized {
            self.seed(months, current);
        } else if month > PLACEHOLDER_KG {
            self.snapshots.insert(current, month);
        }

        let year_to_date: f64 = months
            .iter()
            .take(month_index)
            .filter(|v| **v > PLACEHOLDER_KG)
            .sum();

        let monthly_history = months
            .iter()
            .take(12)
            .enumerate()
            .map(|(i, v)| (i as u32 + 1, *v))
            .collect();

        let yearly_history = years
            .iter()
            .enumerate()
            .map(|(i, v)| (FIRST_COUNTER_YEAR + i as i32, *v))
            .collect();

        let year_from_stove = usize::try_from(today.year() - FIRST_COUNTER_YEAR)
            .ok()
            .and_then(|i| years.get(i).copied())
            .unwrap_or(0.0);

        ConsumptionReport {
            day,
            yesterday,
            month,
            year_to_date: round_to(year_to_date, 2),
            year_from_stove,
            monthly_history,
            yearly_history,
            year_over_year: self.compare(current, month),
        }
    }

    fn seed(&mut self, months: &[f64], current: MonthKey) {
        let mut seeded = 0;
        for (i, value) in months.iter().take(12).enumerate() {
            if *value <= PLACEHOLDER_KG {
                continue;
            }
            let month = i as u32 + 1;
            let year = if month > current.month {
                current.year - 1
            } else {
                current.year
            };
            self.snapshots.insert(MonthKey::new(year, month), *value);
            seeded += 1;
        }
        self.initialized = true;
        info!("Seeded {} monthly consumption snapshots", seeded);
    }

    fn compare(&self, current: MonthKey, month_value: f64) -> Option<YearOverYear> {
        let last_year = self.snapshot(current.previous_year())?;
        if last_year <= 0.0 {
            return None;
        }

        let difference = month_value - last_year;
        let comparison = YearOverYear {
            month: current.month,
            current_year_value: round_to(month_value, 2),
            last_year_value: round_to(last_year, 2),
            difference: round_to(difference, 2),
            percentage_change: round_to(difference / last_year * 100.0, 1),
        };
        debug!(
            "Month {} consumption {:.2} kg vs {:.2} kg last year",
            current.month, comparison.current_year_value, comparison.last_year_value
        );
        Some(comparison)
    }
}

/// One-based lookup into a counter series.
fn entry(series: &[f64], index: usize) -> f64 {
    index
        .checked_sub(1)
        .and_then(|i| series.get(i))
        .copied()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn months() -> Vec<f64> {
        // Jan..Mar this year, Apr..Oct placeholders, Nov/Dec from last year.
        let mut m = vec![PLACEHOLDER_KG; 12];
        m[0] = 310.0;
        m[1] = 280.5;
        m[2] = 120.25;
        m[10] = 150.0;
        m[11] = 290.0;
        m
    }

    #[test]
    fn test_day_month_and_year_to_date() {
        let mut history = ConsumptionHistory::new();
        let mut days = vec![0.0; 31];
        days[13] = 11.0;
        days[14] = 9.5;

        let report = history.update(&days, &months(), &[100.0; 14], date(2026, 3, 15));

        assert_eq!(report.day, 9.5);
        assert_eq!(report.yesterday, 11.0);
        assert_eq!(report.month, 120.25);
        assert_eq!(report.year_to_date, 710.75);
        assert_eq!(report.monthly_history.len(), 12);
        assert_eq!(report.monthly_history[&3], 120.25);
    }

    #[test]
    fn test_first_of_month_and_short_series() {
        let mut history = ConsumptionHistory::new();
        let report = history.update(&[4.0], &[], &[], date(2026, 2, 1));
        assert_eq!(report.day, 4.0);
        assert_eq!(report.yesterday, 0.0);
        assert_eq!(report.month, 0.0);
        assert_eq!(report.year_from_stove, 0.0);
        assert_eq!(report.year_over_year, None);
    }

    #[test]
    fn test_yesterday_on_first_reads_previous_month_tail() {
        let mut history = ConsumptionHistory::new();
        let mut days = vec![0.0; 31];
        days[0] = 2.0;
        days[29] = 6.0;
        days[30] = 7.5;

        let report = history.update(&days, &[], &[], date(2026, 2, 1));
        assert_eq!(report.day, 2.0);
        assert_eq!(report.yesterday, 7.5);

        let report = history.update(&days, &[], &[], date(2026, 5, 1));
        assert_eq!(report.yesterday, 6.0);
    }

    #[test]
    fn test_seeding_attributes_later_months_to_last_year() {
        let mut history = ConsumptionHistory::new();
        history.update(&[], &months(), &[], date(2026, 3, 15));

        assert!(history.initialized);
        assert_eq!(history.snapshot(MonthKey::new(2026, 1)), Some(310.0));
        assert_eq!(history.snapshot(MonthKey::new(2025, 12)), Some(290.0));
        assert_eq!(history.snapshot(MonthKey::new(2026, 12)), None);
        assert_eq!(history.snapshot(MonthKey::new(2026, 6)), None);
        assert_eq!(history.snapshots.len(), 5);
    }

    #[test]
    fn test_year_over_year() {
        let mut history = ConsumptionHistory::new();
        history.update(&[], &months(), &[], date(2026, 3, 15));

        // A year later, March reads 100 kg against last year's 120.25 kg.
        let mut this_year = months();
        this_year[2] = 100.0;
        let report = history.update(&[], &this_year, &[], date(2027, 3, 10));

        let yoy = report.year_over_year.unwrap();
        assert_eq!(yoy.month, 3);
        assert_eq!(yoy.current_year_value, 100.0);
        assert_eq!(yoy.last_year_value, 120.25);
        assert_eq!(yoy.difference, -20.25);
        assert_eq!(yoy.percentage_change, -16.8);
        assert_eq!(history.snapshot(MonthKey::new(2027, 3)), Some(100.0));
    }

    #[test]
    fn test_yearly_history_keys() {
        let mut history = ConsumptionHistory::new();
        let years: Vec<f64> = (0..14).map(|i| i as f64 * 10.0).collect();
        let report = history.update(&[], &[], &years, date(2026, 5, 5));

        assert_eq!(report.yearly_history[&2013], 0.0);
        assert_eq!(report.yearly_history[&2026], 130.0);
        assert_eq!(report.year_from_stove, 130.0);
    }

    #[test]
    fn test_snapshots_survive_serialization() {
        let mut history = ConsumptionHistory::new();
        history.update(&[], &months(), &[], date(2026, 3, 15));

        let json = serde_json::to_string(&history).unwrap();
        let restored: ConsumptionHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, history);
    }
}
