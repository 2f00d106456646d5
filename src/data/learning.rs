//! Learned rate tables.
//!
//! Heating, cooling and consumption rates observed by the session tracker,
//! bucketed by operating conditions and kept as incremental means. Queries
//! fall back through progressively coarser buckets and finally to fixed
//! defaults, so a fresh install still produces usable numbers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::utils::{half_degree_steps, two_degree_bucket};

/// Default heating rates in °C/h by heat level.
pub const DEFAULT_HEATING_RATES: [(u8, f64); 3] = [(1, 0.3), (2, 0.6), (3, 1.0)];

/// Heating rate used for heat levels without a default.
pub const FALLBACK_HEATING_RATE: f64 = 0.6;

/// Default cooling rate in °C/h.
pub const DEFAULT_COOLING_RATE: f64 = 0.3;

/// Default consumption rates in kg/h by heat level.
pub const DEFAULT_CONSUMPTION_RATES: [(u8, f64); 3] = [(1, 0.35), (2, 0.75), (3, 1.2)];

/// Consumption rate used for heat levels without a default.
pub const FALLBACK_CONSUMPTION_RATE: f64 = 0.75;

/// Default startup consumption in kg.
pub const DEFAULT_STARTUP_CONSUMPTION_KG: f64 = 0.15;

/// Default startup duration in seconds.
pub const DEFAULT_STARTUP_DURATION_SECS: f64 = 360.0;

/// Default shutdown delta in °C above target.
pub const DEFAULT_SHUTDOWN_DELTA: f64 = 1.1;

/// Default restart delta in °C below target.
pub const DEFAULT_RESTART_DELTA: f64 = 0.6;

/// Hours each consumption observation is assumed to cover.
pub const HOURS_PER_OBSERVATION: f64 = 0.5;

/// Observed hours required per heat level before predictions are trusted.
pub const REQUIRED_HOURS_PER_LEVEL: f64 = 10.0;

/// Waiting periods required before predictions are trusted.
pub const REQUIRED_WAITING_PERIODS: u32 = 5;

/// Observations older than this no longer count as recent.
pub const RECENT_DATA_DAYS: i64 = 60;

fn default_for(table: &[(u8, f64)], heatlevel: u8, fallback: f64) -> f64 {
    table
        .iter()
        .find(|(level, _)| *level == heatlevel)
        .map(|(_, rate)| *rate)
        .unwrap_or(fallback)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Key of a heating observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeatingKey {
    /// Heat level 1-3.
    pub heatlevel: u8,
    /// Average distance to target, in half degrees.
    pub temp_delta_half: i32,
    /// Outdoor temperature 2°C floor bucket, if an outdoor reading existed.
    pub outdoor_bucket: Option<i32>,
}

impl HeatingKey {
    /// Bucket raw conditions into a key.
    pub fn new(heatlevel: u8, temp_delta: f64, outdoor_temp: Option<f64>) -> Self {
        Self {
            heatlevel,
            temp_delta_half: half_degree_steps(temp_delta),
            outdoor_bucket: outdoor_temp.map(two_degree_bucket),
        }
    }

    /// The temperature delta bucket in degrees.
    pub fn temp_delta_bucket(&self) -> f64 {
        self.temp_delta_half as f64 / 2.0
    }
}

/// Key of a cooling observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoolingKey {
    /// Outdoor temperature 2°C floor bucket, if an outdoor reading existed.
    pub outdoor_bucket: Option<i32>,
    /// Room temperature at the start of the waiting period, 2°C floor bucket.
    pub start_temp_bucket: i32,
}

impl CoolingKey {
    /// Bucket raw conditions into a key.
    pub fn new(start_room_temp: f64, outdoor_temp: Option<f64>) -> Self {
        Self {
            outdoor_bucket: outdoor_temp.map(two_degree_bucket),
            start_temp_bucket: two_degree_bucket(start_room_temp),
        }
    }
}

/// Incremental mean of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateObservation {
    /// Number of recorded observations.
    pub count: u32,
    /// Running average rate.
    pub avg: f64,
    /// When the bucket was last updated.
    pub last_updated: Option<DateTime<Utc>>,
}

impl RateObservation {
    /// Fold one more value into the mean.
    pub fn record(&mut self, value: f64, now: DateTime<Utc>) {
        let n = self.count as f64;
        self.avg = (self.avg * n + value) / (n + 1.0);
        self.count += 1;
        self.last_updated = Some(now);
    }

    fn is_recent(&self, now: DateTime<Utc>) -> bool {
        self.last_updated
            .map(|at| now - at <= ChronoDuration::days(RECENT_DATA_DAYS))
            .unwrap_or(false)
    }
}

/// Aggregate of startup sequences.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupStats {
    /// Number of recorded startups.
    pub count: u32,
    /// Average pellets burnt during startup, in kg.
    pub avg_consumption_kg: f64,
    /// Average startup duration in seconds.
    pub avg_duration_seconds: f64,
}

impl Default for StartupStats {
    fn default() -> Self {
        Self {
            count: 0,
            avg_consumption_kg: DEFAULT_STARTUP_CONSUMPTION_KG,
            avg_duration_seconds: DEFAULT_STARTUP_DURATION_SECS,
        }
    }
}

/// Aggregate of a temperature offset from the setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaStats {
    /// Number of recorded deltas.
    pub count: u32,
    /// Average delta in °C.
    pub avg_delta: f64,
}

impl DeltaStats {
    fn with_default(avg_delta: f64) -> Self {
        Self { count: 0, avg_delta }
    }

    /// Fold one more delta into the mean.
    pub fn record(&mut self, delta: f64) {
        let n = self.count as f64;
        self.avg_delta = (self.avg_delta * n + delta) / (n + 1.0);
        self.count += 1;
    }
}

fn default_shutdown() -> DeltaStats {
    DeltaStats::with_default(DEFAULT_SHUTDOWN_DELTA)
}

fn default_restart() -> DeltaStats {
    DeltaStats::with_default(DEFAULT_RESTART_DELTA)
}

/// A closed stable-burn period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatingSegment {
    /// Heat level held during the period.
    pub heatlevel: u8,
    /// Length of the period in seconds.
    pub duration_seconds: u64,
    /// Room temperature at the start.
    pub start_room_temp: f64,
    /// Room temperature at the end.
    pub end_room_temp: f64,
    /// Target temperature during the period.
    pub target_temp: f64,
    /// Pellets burnt during the period, in kg.
    pub consumption_kg: f64,
    /// Outdoor temperature when the period closed.
    pub outdoor_temp: Option<f64>,
}

/// A closed waiting period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoolingSegment {
    /// Length of the period in seconds.
    pub duration_seconds: u64,
    /// Room temperature at the start.
    pub start_room_temp: f64,
    /// Room temperature at the end.
    pub end_room_temp: f64,
    /// Outdoor temperature when the period closed.
    pub outdoor_temp: Option<f64>,
}

/// All learned tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningData {
    /// Heating rate in °C/h by conditions.
    #[serde(with = "entries")]
    pub heating: BTreeMap<HeatingKey, RateObservation>,
    /// Cooling rate in °C/h by conditions.
    #[serde(with = "entries")]
    pub cooling: BTreeMap<CoolingKey, RateObservation>,
    /// Consumption rate in kg/h by heat level.
    #[serde(with = "entries")]
    pub consumption: BTreeMap<u8, RateObservation>,
    /// Startup cost.
    pub startup: StartupStats,
    /// Room temperature above target when the stove stops in temperature mode.
    #[serde(default = "default_shutdown")]
    pub shutdown: DeltaStats,
    /// Room temperature below target when the stove restarts in temperature mode.
    #[serde(default = "default_restart")]
    pub restart: DeltaStats,
}

impl Default for LearningData {
    fn default() -> Self {
        Self {
            heating: BTreeMap::new(),
            cooling: BTreeMap::new(),
            consumption: BTreeMap::new(),
            startup: StartupStats::default(),
            shutdown: default_shutdown(),
            restart: default_restart(),
        }
    }
}

/// Summary of how much has been learned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStatus {
    /// Estimated observed hours per heat level 1-3.
    pub heatlevel_hours: [f64; 3],
    /// Number of recorded waiting periods.
    pub waiting_periods: u32,
    /// Whether any heating or cooling bucket was updated recently.
    pub recent_data: bool,
    /// Whether enough data exists for trusted predictions.
    pub sufficient_data: bool,
    /// Number of heating buckets.
    pub heating_buckets: usize,
    /// Number of cooling buckets.
    pub cooling_buckets: usize,
    /// Number of heat levels with consumption observations.
    pub consumption_levels: usize,
    /// Number of recorded startups.
    pub startups: u32,
}

impl LearningData {
    /// Record a closed stable-burn period.
    ///
    /// Updates the heating bucket for the conditions and the consumption
    /// rate for the heat level.
    pub fn record_heating(&mut self, segment: &HeatingSegment, now: DateTime<Utc>) {
        let hours = segment.duration_seconds as f64 / 3600.0;
        let (heating_rate, consumption_rate) = if hours > 0.0 {
            (
                (segment.end_room_temp - segment.start_room_temp) / hours,
                segment.consumption_kg / hours,
            )
        } else {
            (0.0, 0.0)
        };

        let avg_temp = (segment.start_room_temp + segment.end_room_temp) / 2.0;
        let key = HeatingKey::new(
            segment.heatlevel,
            segment.target_temp - avg_temp,
            segment.outdoor_temp,
        );

        let obs = self.heating.entry(key).or_default();
        obs.record(heating_rate, now);
        info!(
            "Recorded heating observation: HL{} delta {:.1}°C outdoor {:?} rate {:.2}°C/h (count {})",
            key.heatlevel,
            key.temp_delta_bucket(),
            key.outdoor_bucket,
            heating_rate,
            obs.count
        );

        let cons = self.consumption.entry(segment.heatlevel).or_default();
        cons.record(consumption_rate, now);
        info!(
            "Recorded consumption observation: HL{} rate {:.3} kg/h (count {}, avg {:.3} kg/h)",
            segment.heatlevel, consumption_rate, cons.count, cons.avg
        );
    }

    /// Record a closed waiting period.
    pub fn record_cooling(&mut self, segment: &CoolingSegment, now: DateTime<Utc>) {
        let hours = segment.duration_seconds as f64 / 3600.0;
        let cooling_rate = if hours > 0.0 {
            (segment.start_room_temp - segment.end_room_temp) / hours
        } else {
            0.0
        };

        let key = CoolingKey::new(segment.start_room_temp, segment.outdoor_temp);
        let obs = self.cooling.entry(key).or_default();
        obs.record(cooling_rate, now);
        info!(
            "Recorded cooling observation: start {:.1}°C outdoor {:?} rate {:.2}°C/h (count {})",
            segment.start_room_temp, key.outdoor_bucket, cooling_rate, obs.count
        );
    }

    /// Record a completed startup sequence.
    pub fn record_startup(&mut self, duration_seconds: u64, consumption_kg: f64) {
        let startup = &mut self.startup;
        let n = startup.count as f64;
        startup.avg_consumption_kg = (startup.avg_consumption_kg * n + consumption_kg) / (n + 1.0);
        startup.avg_duration_seconds =
            (startup.avg_duration_seconds * n + duration_seconds as f64) / (n + 1.0);
        startup.count += 1;
        info!(
            "Recorded startup: {:.3} kg over {} s (count {}, avg {:.3} kg)",
            consumption_kg, duration_seconds, startup.count, startup.avg_consumption_kg
        );
    }

    /// Record how far above target the room was when the stove stopped.
    pub fn record_shutdown_delta(&mut self, delta: f64) {
        self.shutdown.record(delta);
        info!(
            "Recorded shutdown delta {:.2}°C (avg {:.2}°C, count {})",
            delta, self.shutdown.avg_delta, self.shutdown.count
        );
    }

    /// Record how far below target the room was when the stove restarted.
    pub fn record_restart_delta(&mut self, delta: f64) {
        self.restart.record(delta);
        info!(
            "Recorded restart delta {:.2}°C (avg {:.2}°C, count {})",
            delta, self.restart.avg_delta, self.restart.count
        );
    }

    /// Heating rate in °C/h for the given conditions.
    pub fn heating_rate(&self, heatlevel: u8, temp_delta: f64, outdoor_temp: Option<f64>) -> f64 {
        let key = HeatingKey::new(heatlevel, temp_delta, outdoor_temp);

        if let Some(obs) = self.heating.get(&key).filter(|o| o.count >= 1) {
            return obs.avg;
        }

        let learned = || self.heating.iter().filter(|(_, o)| o.count >= 1);

        if key.outdoor_bucket.is_some() {
            if let Some(rate) = mean(
                learned()
                    .filter(|(k, _)| {
                        k.heatlevel == heatlevel && k.temp_delta_half == key.temp_delta_half
                    })
                    .map(|(_, o)| o.avg),
            ) {
                return rate;
            }

            if let Some(rate) = mean(
                learned()
                    .filter(|(k, _)| {
                        k.heatlevel == heatlevel && k.outdoor_bucket == key.outdoor_bucket
                    })
                    .map(|(_, o)| o.avg),
            ) {
                return rate;
            }
        }

        mean(
            learned()
                .filter(|(k, _)| k.heatlevel == heatlevel)
                .map(|(_, o)| o.avg),
        )
        .unwrap_or_else(|| default_for(&DEFAULT_HEATING_RATES, heatlevel, FALLBACK_HEATING_RATE))
    }

    /// Cooling rate in °C/h for the given conditions.
    pub fn cooling_rate(&self, start_room_temp: f64, outdoor_temp: Option<f64>) -> f64 {
        let key = CoolingKey::new(start_room_temp, outdoor_temp);

        if let Some(obs) = self.cooling.get(&key).filter(|o| o.count >= 1) {
            return obs.avg;
        }

        let learned = || self.cooling.iter().filter(|(_, o)| o.count >= 1);

        if key.outdoor_bucket.is_some() {
            if let Some(rate) = mean(
                learned()
                    .filter(|(k, _)| k.outdoor_bucket == key.outdoor_bucket)
                    .map(|(_, o)| o.avg),
            ) {
                return rate;
            }
        }

        if let Some(rate) = mean(
            learned()
                .filter(|(k, _)| k.start_temp_bucket == key.start_temp_bucket)
                .map(|(_, o)| o.avg),
        ) {
            return rate;
        }

        mean(learned().map(|(_, o)| o.avg)).unwrap_or(DEFAULT_COOLING_RATE)
    }

    /// Consumption rate in kg/h for a heat level.
    pub fn consumption_rate(&self, heatlevel: u8) -> f64 {
        self.consumption
            .get(&heatlevel)
            .filter(|o| o.count >= 1)
            .map(|o| o.avg)
            .unwrap_or_else(|| {
                default_for(&DEFAULT_CONSUMPTION_RATES, heatlevel, FALLBACK_CONSUMPTION_RATE)
            })
    }

    /// Summarize how much has been learned.
    pub fn status(&self, now: DateTime<Utc>) -> LearningStatus {
        let mut heatlevel_hours = [0.0; 3];
        for (i, hours) in heatlevel_hours.iter_mut().enumerate() {
            let count = self
                .consumption
                .get(&(i as u8 + 1))
                .map(|o| o.count)
                .unwrap_or(0);
            *hours = count as f64 * HOURS_PER_OBSERVATION;
        }

        let waiting_periods = self.cooling.values().map(|o| o.count).sum();
        let recent_data = self.heating.values().any(|o| o.is_recent(now))
            || self.cooling.values().any(|o| o.is_recent(now));

        let sufficient_data = heatlevel_hours
            .iter()
            .all(|hours| *hours >= REQUIRED_HOURS_PER_LEVEL)
            && waiting_periods >= REQUIRED_WAITING_PERIODS
            && recent_data;

        LearningStatus {
            heatlevel_hours,
            waiting_periods,
            recent_data,
            sufficient_data,
            heating_buckets: self.heating.len(),
            cooling_buckets: self.cooling.len(),
            consumption_levels: self.consumption.values().filter(|o| o.count > 0).count(),
            startups: self.startup.count,
        }
    }
}

/// Encodes maps with structured keys as a list of `{key, value}` entries.
pub(crate) mod entries {
    use serde::de::Deserializer;
    use serde::ser::Serializer;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct EntryRef<'a, K, V> {
        key: &'a K,
        value: &'a V,
    }

    #[derive(Deserialize)]
    struct Entry<K, V> {
        key: K,
        value: V,
    }

    pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        K: Serialize,
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter().map(|(key, value)| EntryRef { key, value }))
    }

    pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let entries = Vec::<Entry<K, V>>::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Learning data that passes the sufficiency gate, with the given
    /// consumption rates for heat levels 1-3.
    pub(crate) fn sufficient_learning(rates: [f64; 3], at: DateTime<Utc>) -> LearningData {
        let mut data = LearningData::default();
        for (i, rate) in rates.iter().enumerate() {
            data.consumption.insert(
                i as u8 + 1,
                RateObservation {
                    count: 20,
                    avg: *rate,
                    last_updated: Some(at),
                },
            );
        }
        data.cooling.insert(
            CoolingKey::new(22.0, None),
            RateObservation {
                count: 5,
                avg: 0.4,
                last_updated: Some(at),
            },
        );
        data
    }

    #[test]
    fn test_running_average() {
        let mut obs = RateObservation::default();
        for value in [10.0, 20.0, 30.0] {
            obs.record(value, now());
        }
        assert_eq!(obs.count, 3);
        assert!((obs.avg - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_record_heating_buckets() {
        let mut data = LearningData::default();
        data.record_heating(
            &HeatingSegment {
                heatlevel: 2,
                duration_seconds: 1800,
                start_room_temp: 19.0,
                end_room_temp: 20.0,
                target_temp: 21.0,
                consumption_kg: 0.4,
                outdoor_temp: Some(-3.0),
            },
            now(),
        );

        let key = HeatingKey {
            heatlevel: 2,
            temp_delta_half: 3,
            outdoor_bucket: Some(-4),
        };
        let obs = data.heating.get(&key).expect("bucket should exist");
        assert_eq!(obs.count, 1);
        assert!((obs.avg - 2.0).abs() < 1e-9);
        assert!((data.consumption_rate(2) - 0.8).abs() < 1e-9);
        assert_eq!(obs.last_updated, Some(now()));
    }

    #[test]
    fn test_heating_rate_fallbacks() {
        let mut data = LearningData::default();
        assert!((data.heating_rate(3, 2.0, Some(0.0)) - 1.0).abs() < 1e-9);
        assert!((data.heating_rate(7, 2.0, None) - FALLBACK_HEATING_RATE).abs() < 1e-9);

        data.heating.insert(
            HeatingKey::new(1, 2.0, Some(4.0)),
            RateObservation {
                count: 2,
                avg: 0.8,
                last_updated: Some(now()),
            },
        );
        data.heating.insert(
            HeatingKey::new(1, 2.0, Some(8.0)),
            RateObservation {
                count: 1,
                avg: 0.4,
                last_updated: Some(now()),
            },
        );
        data.heating.insert(
            HeatingKey::new(1, 0.5, Some(-2.0)),
            RateObservation {
                count: 1,
                avg: 0.1,
                last_updated: Some(now()),
            },
        );

        // Exact.
        assert!((data.heating_rate(1, 2.0, Some(4.5)) - 0.8).abs() < 1e-9);
        // Same level and delta, other outdoor buckets.
        assert!((data.heating_rate(1, 2.0, Some(20.0)) - 0.6).abs() < 1e-9);
        // Same level and outdoor bucket.
        assert!((data.heating_rate(1, 5.0, Some(-1.0)) - 0.1).abs() < 1e-9);
        // Same level only; no outdoor reading skips the middle rungs.
        let all = (0.8 + 0.4 + 0.1) / 3.0;
        assert!((data.heating_rate(1, 2.0, None) - all).abs() < 1e-9);
    }

    #[test]
    fn test_cooling_rate_fallbacks() {
        let mut data = LearningData::default();
        assert!((data.cooling_rate(22.0, Some(0.0)) - DEFAULT_COOLING_RATE).abs() < 1e-9);

        data.cooling.insert(
            CoolingKey::new(22.0, Some(0.0)),
            RateObservation {
                count: 1,
                avg: 0.5,
                last_updated: Some(now()),
            },
        );
        data.cooling.insert(
            CoolingKey::new(24.0, None),
            RateObservation {
                count: 1,
                avg: 0.3,
                last_updated: Some(now()),
            },
        );

        assert!((data.cooling_rate(23.0, Some(1.0)) - 0.5).abs() < 1e-9);
        // Same outdoor bucket, other start temperature.
        assert!((data.cooling_rate(30.0, Some(0.5)) - 0.5).abs() < 1e-9);
        // Same start bucket, no outdoor match.
        assert!((data.cooling_rate(25.0, Some(10.0)) - 0.3).abs() < 1e-9);
        // Everything.
        assert!((data.cooling_rate(40.0, Some(10.0)) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_consumption_rate_defaults() {
        let data = LearningData::default();
        assert!((data.consumption_rate(1) - 0.35).abs() < 1e-9);
        assert!((data.consumption_rate(2) - 0.75).abs() < 1e-9);
        assert!((data.consumption_rate(3) - 1.2).abs() < 1e-9);
        assert!((data.consumption_rate(9) - FALLBACK_CONSUMPTION_RATE).abs() < 1e-9);
    }

    #[test]
    fn test_startup_and_deltas() {
        let mut data = LearningData::default();
        data.record_startup(400, 0.2);
        assert_eq!(data.startup.count, 1);
        assert!((data.startup.avg_consumption_kg - 0.2).abs() < 1e-9);
        assert!((data.startup.avg_duration_seconds - 400.0).abs() < 1e-9);

        data.record_shutdown_delta(1.5);
        data.record_shutdown_delta(0.5);
        assert_eq!(data.shutdown.count, 2);
        assert!((data.shutdown.avg_delta - 1.0).abs() < 1e-9);
        assert!((data.restart.avg_delta - DEFAULT_RESTART_DELTA).abs() < 1e-9);
    }

    #[test]
    fn test_sufficiency_gate() {
        let data = sufficient_learning([0.35, 0.75, 1.2], now());
        let status = data.status(now());
        assert_eq!(status.heatlevel_hours, [10.0, 10.0, 10.0]);
        assert_eq!(status.waiting_periods, 5);
        assert!(status.recent_data);
        assert!(status.sufficient_data);

        let stale = data.status(now() + ChronoDuration::days(61));
        assert!(!stale.recent_data);
        assert!(!stale.sufficient_data);

        let mut thin = data.clone();
        thin.consumption.get_mut(&3).unwrap().count = 19;
        assert!(!thin.status(now()).sufficient_data);
    }

    #[test]
    fn test_json_round_trip() {
        let mut data = LearningData::default();
        data.record_heating(
            &HeatingSegment {
                heatlevel: 1,
                duration_seconds: 1800,
                start_room_temp: 20.0,
                end_room_temp: 20.5,
                target_temp: 22.0,
                consumption_kg: 0.2,
                outdoor_temp: None,
            },
            now(),
        );
        data.record_cooling(
            &CoolingSegment {
                duration_seconds: 3600,
                start_room_temp: 23.0,
                end_room_temp: 22.4,
                outdoor_temp: Some(-5.5),
            },
            now(),
        );
        data.record_startup(300, 0.1);

        let json = serde_json::to_string(&data).unwrap();
        let loaded: LearningData = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let loaded: LearningData = serde_json::from_str(r#"{"startup": {"count": 2}}"#).unwrap();
        assert_eq!(loaded.startup.count, 2);
        assert!((loaded.startup.avg_duration_seconds - DEFAULT_STARTUP_DURATION_SECS).abs() < 1e-9);
        assert!((loaded.shutdown.avg_delta - DEFAULT_SHUTDOWN_DELTA).abs() < 1e-9);
        assert!(loaded.heating.is_empty());
    }
}
