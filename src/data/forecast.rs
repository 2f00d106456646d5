//! Hourly outdoor temperature forecast cache.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Default time between forecast refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Default maximum distance between a query time and the sample used for it.
pub const DEFAULT_MATCH_TOLERANCE: Duration = Duration::from_secs(5400);

/// Forecast horizon below which predictions are flagged as short-sighted.
pub const SHORT_HORIZON_HOURS: f64 = 24.0;

/// One forecast sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastSample {
    /// Time the sample applies to.
    pub at: DateTime<Utc>,
    /// Outdoor temperature in Celsius.
    pub temperature: f64,
}

/// Cached forecast samples ordered by time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForecastCache {
    samples: Vec<ForecastSample>,
    last_updated: Option<DateTime<Utc>>,
}

impl ForecastCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the cache is older than `interval` or was never filled.
    pub fn needs_refresh(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        match self.last_updated {
            None => true,
            Some(at) => (now - at).to_std().map(|age| age >= interval).unwrap_or(false),
        }
    }

    /// Replace the cached samples.
    ///
    /// Non-finite temperatures are dropped. An empty result keeps the previous
    /// samples and returns `false`.
    pub fn replace(&mut self, samples: Vec<ForecastSample>, now: DateTime<Utc>) -> bool {
        let mut samples: Vec<ForecastSample> = samples
            .into_iter()
            .filter(|s| s.temperature.is_finite())
            .collect();

        if samples.is_empty() {
            warn!("No valid forecast entries, keeping previous forecast");
            return false;
        }

        samples.sort_by_key(|s| s.at);
        info!(
            "Updated weather forecast cache: {} hourly entries from {} to {}",
            samples.len(),
            samples[0].at.format("%Y-%m-%d %H:%M"),
            samples[samples.len() - 1].at.format("%Y-%m-%d %H:%M")
        );
        self.samples = samples;
        self.last_updated = Some(now);
        true
    }

    /// Whether no samples are cached.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The cached samples.
    pub fn samples(&self) -> &[ForecastSample] {
        &self.samples
    }

    /// When the cache was last filled.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Temperature of the sample nearest to `at`, if one lies within `tolerance`.
    pub fn temperature_at(&self, at: DateTime<Utc>, tolerance: Duration) -> Option<f64> {
        let nearest = self
            .samples
            .iter()
            .min_by_key(|s| (s.at - at).num_seconds().unsigned_abs())?;

        let distance = (nearest.at - at).num_seconds().unsigned_abs();
        (distance <= tolerance.as_secs()).then_some(nearest.temperature)
    }

    /// Hours between `now` and the last sample, zero if the forecast is stale.
    pub fn horizon_hours(&self, now: DateTime<Utc>) -> f64 {
        self.samples
            .last()
            .map(|s| ((s.at - now).num_seconds() as f64 / 3600.0).max(0.0))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(hours: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-20T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + ChronoDuration::hours(hours)
    }

    fn hourly(from: i64, temps: &[f64]) -> Vec<ForecastSample> {
        temps
            .iter()
            .enumerate()
            .map(|(i, temperature)| ForecastSample {
                at: t(from + i as i64),
                temperature: *temperature,
            })
            .collect()
    }

    #[test]
    fn test_refresh_rate_limit() {
        let mut cache = ForecastCache::new();
        assert!(cache.needs_refresh(t(0), DEFAULT_REFRESH_INTERVAL));

        assert!(cache.replace(hourly(0, &[1.0, 2.0]), t(0)));
        assert!(!cache.needs_refresh(t(0) + ChronoDuration::minutes(59), DEFAULT_REFRESH_INTERVAL));
        assert!(cache.needs_refresh(t(1), DEFAULT_REFRESH_INTERVAL));
    }

    #[test]
    fn test_empty_replace_keeps_previous() {
        let mut cache = ForecastCache::new();
        cache.replace(hourly(0, &[1.0]), t(0));
        assert!(!cache.replace(hourly(0, &[f64::NAN]), t(2)));
        assert_eq!(cache.samples().len(), 1);
        assert_eq!(cache.last_updated(), Some(t(0)));
    }

    #[test]
    fn test_nearest_within_tolerance() {
        let mut cache = ForecastCache::new();
        let mut samples = hourly(0, &[-2.0, -1.0, 0.5, 3.0]);
        samples.reverse();
        cache.replace(samples, t(0));

        let at = t(1) + ChronoDuration::minutes(20);
        assert_eq!(cache.temperature_at(at, DEFAULT_MATCH_TOLERANCE), Some(-1.0));

        // Last sample at +3h; +4h30 is exactly 1.5h away.
        let edge = t(4) + ChronoDuration::minutes(30);
        assert_eq!(cache.temperature_at(edge, DEFAULT_MATCH_TOLERANCE), Some(3.0));
        assert_eq!(cache.temperature_at(t(5), DEFAULT_MATCH_TOLERANCE), None);
    }

    #[test]
    fn test_horizon() {
        let mut cache = ForecastCache::new();
        assert_eq!(cache.horizon_hours(t(0)), 0.0);

        cache.replace(hourly(0, &[0.0; 13]), t(0));
        assert!((cache.horizon_hours(t(0)) - 12.0).abs() < 1e-9);
        assert_eq!(cache.horizon_hours(t(20)), 0.0);
    }
}
