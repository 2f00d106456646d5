//! Reply frame parsing.
//!
//! The stove answers reads with a comma-delimited string. Field positions
//! are fixed by the firmware; the positions that vary between firmware
//! generations are kept in [`FrameLayout`].

use serde::{Deserialize, Serialize};

use crate::data::telemetry::{
    heatlevel_from_power_pct, OperatingHours, OperationMode, StateCode, StoveTelemetry,
};
use crate::error::{Error, Result};

/// Function id for reading settings such as the network configuration.
pub const FUNCTION_SETTINGS: u8 = 1;

/// Function id for consumption counters.
pub const FUNCTION_CONSUMPTION: u8 = 6;

/// Function id for status and operating frames.
pub const FUNCTION_STATUS: u8 = 11;

/// Payload selecting the status frame.
pub const PAYLOAD_STATUS: &str = "*";

/// Payload selecting the operating frame.
pub const PAYLOAD_OPERATING: &str = "001*";

/// Payload selecting the router settings.
pub const PAYLOAD_NETWORK: &str = "wifi.router";

/// Payload selecting daily consumption for the current month.
pub const PAYLOAD_TOTAL_DAYS: &str = "total_days";

/// Payload selecting monthly consumption for the current year.
pub const PAYLOAD_TOTAL_MONTHS: &str = "total_months";

/// Payload selecting yearly consumption.
pub const PAYLOAD_TOTAL_YEARS: &str = "total_years";

mod operating {
    pub const ROOM_TEMP: usize = 0;
    pub const TARGET_TEMP: usize = 1;
    pub const DHW_TEMP: usize = 4;
    pub const SUBSTATE: usize = 5;
    pub const STATE: usize = 6;
    pub const MOTOR_CURRENT: usize = 24;
    pub const CO: usize = 26;
    pub const POWER_KW: usize = 31;
    pub const SHAFT_TEMP: usize = 35;
    pub const SMOKE_TEMP: usize = 37;
    pub const INTERNET_UPTIME: usize = 38;
    pub const CO_YELLOW: usize = 101;
    pub const CO_RED: usize = 102;
    pub const HOURS_AUGER: usize = 119;
    pub const HOURS_IGNITION: usize = 120;
    pub const HOURS_STOVE: usize = 121;
}

/// Firmware-dependent field positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLayout {
    /// Status frame position of the operation mode.
    pub status_operation_mode: usize,
    /// Status frame position of the lifetime consumption total.
    pub status_consumption_total: usize,
    /// Operating frame position of the power percentage.
    pub power_pct: usize,
    /// Operating frame position that must be non-empty for `power_pct` to be valid.
    pub power_pct_valid: usize,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            status_operation_mode: 16,
            status_consumption_total: 8,
            power_pct: 99,
            power_pct_valid: 99,
        }
    }
}

/// Parsed status frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusFrame {
    /// Regulation mode.
    pub operation_mode: OperationMode,
    /// Lifetime consumption in kg.
    pub consumption_total: Option<f64>,
}

/// Router and address details reported by the stove.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// WiFi network name.
    pub ssid: String,
    /// Stove IP address.
    pub stove_ip: String,
    /// Router IP address.
    pub router_ip: String,
    /// Signal strength in dBm.
    pub rssi: Option<i32>,
    /// Stove MAC address.
    pub mac: String,
}

/// Split a reply into trimmed fields.
fn split_fields(reply: &str) -> Vec<&str> {
    reply.split(',').map(str::trim).collect()
}

/// Drop a `name=` prefix from the first field, if present.
fn strip_key(field: &str) -> &str {
    match field.split_once('=') {
        Some((_, value)) => value,
        None => field,
    }
}

fn required_f64(fields: &[&str], index: usize, name: &str) -> Result<f64> {
    let raw = fields.get(index).ok_or_else(|| Error::InvalidData {
        context: format!(
            "frame has {} fields, {} expected at index {}",
            fields.len(),
            name,
            index
        ),
    })?;

    raw.parse::<f64>().map_err(|_| Error::InvalidData {
        context: format!("{} is not numeric: {:?}", name, raw),
    })
}

fn optional_f64(fields: &[&str], index: usize) -> Option<f64> {
    fields.get(index).and_then(|raw| raw.parse::<f64>().ok())
}

fn required_code(fields: &[&str], index: usize, name: &str) -> Result<u16> {
    let raw = fields.get(index).ok_or_else(|| Error::InvalidData {
        context: format!("frame has no {} at index {}", name, index),
    })?;

    raw.parse::<u16>().map_err(|_| Error::InvalidData {
        context: format!("{} is not a code: {:?}", name, raw),
    })
}

/// Parse the status frame (function 11, payload `*`).
pub fn parse_status(reply: &str, layout: &FrameLayout) -> Result<StatusFrame> {
    let fields = split_fields(reply);
    let raw_mode = required_f64(&fields, layout.status_operation_mode, "operation_mode")?;

    Ok(StatusFrame {
        operation_mode: OperationMode::from_raw(raw_mode as u8),
        consumption_total: optional_f64(&fields, layout.status_consumption_total),
    })
}

/// Parse the operating frame (function 11, payload `001*`).
///
/// The operating frame does not carry the regulation mode, so it is passed
/// in from the status frame of the same cycle (or the last known one).
pub fn parse_operating(
    reply: &str,
    layout: &FrameLayout,
    operation_mode: OperationMode,
) -> Result<StoveTelemetry> {
    use operating::*;

    let fields = split_fields(reply);

    let state = StateCode::from_raw(required_code(&fields, STATE, "state")?);
    let substate = required_code(&fields, SUBSTATE, "substate")?;
    let room_temp = required_f64(&fields, ROOM_TEMP, "room_temp")?;
    let target_temp = required_f64(&fields, TARGET_TEMP, "target_temp")?;
    let smoke_temp = required_f64(&fields, SMOKE_TEMP, "smoke_temp")?;

    let power_valid = fields
        .get(layout.power_pct_valid)
        .map(|raw| !raw.is_empty())
        .unwrap_or(false);
    let power_pct = if power_valid {
        optional_f64(&fields, layout.power_pct).unwrap_or(0.0)
    } else {
        0.0
    };

    Ok(StoveTelemetry {
        state,
        substate,
        heatlevel: heatlevel_from_power_pct(power_pct),
        power_pct,
        operation_mode,
        room_temp,
        target_temp,
        smoke_temp,
        shaft_temp: optional_f64(&fields, SHAFT_TEMP),
        dhw_temp: optional_f64(&fields, DHW_TEMP),
        power_kw: optional_f64(&fields, POWER_KW),
        co: optional_f64(&fields, CO),
        co_yellow: optional_f64(&fields, CO_YELLOW),
        co_red: optional_f64(&fields, CO_RED),
        motor_current_ma: optional_f64(&fields, MOTOR_CURRENT),
        internet_uptime: fields
            .get(INTERNET_UPTIME)
            .filter(|raw| !raw.is_empty())
            .map(|raw| raw.to_string()),
        operating_hours: OperatingHours {
            auger: optional_f64(&fields, HOURS_AUGER).unwrap_or(0.0),
            ignition: optional_f64(&fields, HOURS_IGNITION).unwrap_or(0.0),
            stove: optional_f64(&fields, HOURS_STOVE).unwrap_or(0.0),
        },
        consumption_total: None,
    })
}

/// Parse the router settings frame (function 1, payload `wifi.router`).
pub fn parse_network(reply: &str) -> Result<NetworkInfo> {
    let fields = split_fields(reply);
    if fields.len() < 10 {
        return Err(Error::InvalidData {
            context: format!("network frame has {} fields, need 10", fields.len()),
        });
    }

    Ok(NetworkInfo {
        ssid: strip_key(fields[0]).to_string(),
        stove_ip: fields[4].to_string(),
        router_ip: fields[5].to_string(),
        rssi: fields[6].parse().ok(),
        mac: fields[9].to_string(),
    })
}

/// Parse a consumption counter series (function 6).
///
/// The first field carries the `total_days=`/`total_months=`/`total_years=`
/// prefix, which is dropped.
pub fn parse_counter_series(reply: &str) -> Result<Vec<f64>> {
    let fields = split_fields(reply);
    fields
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let raw = if i == 0 { strip_key(raw) } else { raw };
            raw.parse::<f64>().map_err(|_| Error::InvalidData {
                context: format!("consumption entry {} is not numeric: {:?}", i, raw),
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an operating frame with the given key values and zeros elsewhere.
    pub(crate) fn operating_frame(
        state: u16,
        room_temp: f64,
        target_temp: f64,
        smoke_temp: f64,
        power_pct: f64,
    ) -> String {
        let mut fields = vec!["0".to_string(); 122];
        fields[operating::ROOM_TEMP] = room_temp.to_string();
        fields[operating::TARGET_TEMP] = target_temp.to_string();
        fields[operating::SUBSTATE] = "0".to_string();
        fields[operating::STATE] = state.to_string();
        fields[operating::SMOKE_TEMP] = smoke_temp.to_string();
        fields[99] = power_pct.to_string();
        fields[operating::HOURS_STOVE] = "1234.5".to_string();
        fields.join(",")
    }

    /// Build a status frame for the default layout.
    pub(crate) fn status_frame(operation_mode: u8, consumption_total: f64) -> String {
        let mut fields = vec!["0".to_string(); 20];
        fields[16] = operation_mode.to_string();
        fields[8] = consumption_total.to_string();
        fields.join(",")
    }

    #[test]
    fn test_parse_operating() {
        let reply = operating_frame(5, 21.5, 22.0, 180.0, 50.0);
        let telemetry =
            parse_operating(&reply, &FrameLayout::default(), OperationMode::Temperature).unwrap();

        assert_eq!(telemetry.state, StateCode::NORMAL);
        assert_eq!(telemetry.heatlevel, 2);
        assert!((telemetry.room_temp - 21.5).abs() < 0.001);
        assert!((telemetry.target_temp - 22.0).abs() < 0.001);
        assert!((telemetry.smoke_temp - 180.0).abs() < 0.001);
        assert_eq!(telemetry.operation_mode, OperationMode::Temperature);
        assert!((telemetry.operating_hours.stove - 1234.5).abs() < 0.001);
    }

    #[test]
    fn test_parse_operating_empty_power_gate() {
        let mut fields: Vec<String> = operating_frame(5, 20.0, 21.0, 150.0, 100.0)
            .split(',')
            .map(str::to_string)
            .collect();
        fields[99] = String::new();
        let reply = fields.join(",");

        let telemetry =
            parse_operating(&reply, &FrameLayout::default(), OperationMode::HeatLevel).unwrap();
        assert_eq!(telemetry.heatlevel, 1);
        assert_eq!(telemetry.power_pct, 0.0);
    }

    #[test]
    fn test_parse_operating_too_short() {
        let result = parse_operating("1,2,3", &FrameLayout::default(), OperationMode::HeatLevel);
        assert!(matches!(result, Err(Error::InvalidData { .. })));
    }

    #[test]
    fn test_parse_status() {
        let status = parse_status(&status_frame(1, 2345.6), &FrameLayout::default()).unwrap();
        assert_eq!(status.operation_mode, OperationMode::Temperature);
        assert_eq!(status.consumption_total, Some(2345.6));
    }

    #[test]
    fn test_parse_network() {
        let reply = "router=HomeNet,x,x,x,192.168.1.50,192.168.1.1,-61,x,x,AA:BB:CC:DD:EE:FF";
        let info = parse_network(reply).unwrap();

        assert_eq!(info.ssid, "HomeNet");
        assert_eq!(info.stove_ip, "192.168.1.50");
        assert_eq!(info.router_ip, "192.168.1.1");
        assert_eq!(info.rssi, Some(-61));
        assert_eq!(info.mac, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_parse_counter_series() {
        let series = parse_counter_series("total_days=1.5,2.25,0,3").unwrap();
        assert_eq!(series, vec![1.5, 2.25, 0.0, 3.0]);

        assert!(parse_counter_series("total_days=1.5,abc").is_err());
    }
}
