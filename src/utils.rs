//! Utility functions for the aduro-stove crate.

/// Format a remaining duration for display.
///
/// Durations of a day or more are shown as days and hours, shorter ones as
/// hours and minutes. Zero or negative input yields `"0h 0m"`.
///
/// # Example
///
/// ```
/// use aduro_stove::format_remaining;
///
/// assert_eq!(format_remaining(18_000), "5h 0m");
/// assert_eq!(format_remaining(90_000), "1d 1h");
/// ```
pub fn format_remaining(seconds: i64) -> String {
    if seconds <= 0 {
        return "0h 0m".to_string();
    }

    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else {
        format!("{}h {}m", hours, minutes)
    }
}

/// Round to a fixed number of decimals.
#[inline]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Quantize a temperature to the 2°C floor bucket used by the learning tables.
#[inline]
pub fn two_degree_bucket(celsius: f64) -> i32 {
    ((celsius / 2.0).floor() * 2.0) as i32
}

/// Quantize a temperature delta to the nearest 0.5°C, expressed in half degrees.
///
/// Exact quarter-degree ties go to the even step.
#[inline]
pub fn half_degree_steps(delta: f64) -> i32 {
    (delta * 2.0).round_ties_even() as i32
}
