//! Collaborator seams.
//!
//! The coordinator never talks to the network directly. The stove protocol,
//! the weather forecast, and the outdoor temperature sensor are reached
//! through the traits below so they can be replaced in tests and by other
//! hosts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data::forecast::ForecastSample;
use crate::error::Result;

/// Everything needed to address one stove.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoveAddress {
    /// Controller serial number.
    pub serial: String,
    /// Controller pin code.
    pub pin: String,
    /// Host the stove answers on.
    pub host: String,
}

impl StoveAddress {
    /// Create an address.
    pub fn new(serial: impl Into<String>, pin: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            pin: pin.into(),
            host: host.into(),
        }
    }
}

/// Result of a network discovery.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    /// Address the stove answered from.
    pub host: String,
    /// Firmware version string.
    pub firmware_version: Option<String>,
    /// Firmware build string.
    pub firmware_build: Option<String>,
}

/// Raw request/response access to a stove.
#[async_trait]
pub trait StoveTransport: Send + Sync {
    /// Look for the stove on the local network.
    async fn discover(&self) -> Result<DiscoveryInfo>;

    /// Issue a read call and return the reply payload.
    async fn read(&self, address: &StoveAddress, function_id: u8, payload: &str) -> Result<String>;

    /// Write a setting. An empty reply means the stove accepted it.
    async fn write(&self, address: &StoveAddress, path: &str, value: &str) -> Result<String>;
}

/// Source of hourly outdoor temperature forecasts.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Fetch the hourly forecast.
    async fn hourly_forecast(&self) -> Result<Vec<ForecastSample>>;
}

/// Current outdoor temperature from an external sensor.
#[cfg_attr(test, mockall::automock)]
pub trait OutdoorSensor: Send + Sync {
    /// Latest reading, `None` when unavailable.
    fn temperature(&self) -> Option<f64>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::frames::tests::{operating_frame, status_frame};
    use crate::protocol::frames::{
        FUNCTION_CONSUMPTION, FUNCTION_SETTINGS, FUNCTION_STATUS, PAYLOAD_NETWORK,
        PAYLOAD_OPERATING, PAYLOAD_STATUS,
    };
    use parking_lot::Mutex;

    /// Mutable state behind [`FakeStove`].
    #[derive(Debug, Clone)]
    pub(crate) struct FakeState {
        pub state_code: u16,
        pub operation_mode: u8,
        pub power_pct: f64,
        pub room_temp: f64,
        pub target_temp: f64,
        pub smoke_temp: f64,
        /// Reported for every day and month of the counter series.
        pub day_counter: f64,
        /// Whether writes change the simulated stove.
        pub apply_writes: bool,
        pub reject_writes: bool,
        pub fail_reads: bool,
        pub fail_discovery: bool,
        pub discovery_host: Option<String>,
        pub writes: Vec<(String, String)>,
        pub discoveries: u32,
        pub reads: u32,
    }

    impl Default for FakeState {
        fn default() -> Self {
            Self {
                state_code: 5,
                operation_mode: 0,
                power_pct: 50.0,
                room_temp: 20.0,
                target_temp: 21.0,
                smoke_temp: 160.0,
                day_counter: 0.0,
                apply_writes: true,
                reject_writes: false,
                fail_reads: false,
                fail_discovery: false,
                discovery_host: None,
                writes: Vec::new(),
                discoveries: 0,
                reads: 0,
            }
        }
    }

    /// In-memory stove that answers reads from [`FakeState`] and applies writes to it.
    #[derive(Debug, Default)]
    pub(crate) struct FakeStove {
        pub state: Mutex<FakeState>,
    }

    impl FakeStove {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn writes(&self) -> Vec<(String, String)> {
            self.state.lock().writes.clone()
        }

        pub fn discoveries(&self) -> u32 {
            self.state.lock().discoveries
        }

        fn series(key: &str, value: f64, len: usize) -> String {
            let values: Vec<String> = std::iter::repeat(value.to_string()).take(len).collect();
            format!("{}={}", key, values.join(","))
        }
    }

    #[async_trait]
    impl StoveTransport for FakeStove {
        async fn discover(&self) -> Result<DiscoveryInfo> {
            let mut state = self.state.lock();
            state.discoveries += 1;
            if state.fail_discovery {
                return Err(Error::Discovery {
                    reason: "no answer".to_string(),
                });
            }
            Ok(DiscoveryInfo {
                host: state
                    .discovery_host
                    .clone()
                    .unwrap_or_else(|| "192.168.1.20".to_string()),
                firmware_version: Some("1.2.3".to_string()),
                firmware_build: Some("42".to_string()),
            })
        }

        async fn read(&self, _address: &StoveAddress, function_id: u8, payload: &str) -> Result<String> {
            let mut state = self.state.lock();
            state.reads += 1;
            if state.fail_reads {
                return Err(Error::Transport {
                    context: "timeout".to_string(),
                });
            }

            let reply = match (function_id, payload) {
                (FUNCTION_STATUS, PAYLOAD_STATUS) => status_frame(state.operation_mode, 1000.0),
                (FUNCTION_STATUS, PAYLOAD_OPERATING) => operating_frame(
                    state.state_code,
                    state.room_temp,
                    state.target_temp,
                    state.smoke_temp,
                    state.power_pct,
                ),
                (FUNCTION_SETTINGS, PAYLOAD_NETWORK) => {
                    "wifi.router=HomeNet,x,x,x,192.168.1.20,192.168.1.1,-58,x,x,AA:BB:CC:DD:EE:FF"
                        .to_string()
                }
                (FUNCTION_CONSUMPTION, key) => {
                    let len = if key == "total_years" { 20 } else { 31 };
                    Self::series(key, state.day_counter, len)
                }
                _ => {
                    return Err(Error::Transport {
                        context: format!("unknown read {} {}", function_id, payload),
                    })
                }
            };
            Ok(reply)
        }

        async fn write(&self, _address: &StoveAddress, path: &str, value: &str) -> Result<String> {
            let mut state = self.state.lock();
            state.writes.push((path.to_string(), value.to_string()));
            if state.reject_writes {
                return Ok("error".to_string());
            }
            if state.apply_writes {
                match path {
                    "regulation.operation_mode" => {
                        state.operation_mode = value.parse().unwrap_or(state.operation_mode)
                    }
                    "regulation.fixed_power" => {
                        state.power_pct = value.parse().unwrap_or(state.power_pct)
                    }
                    "boiler.temp" => state.target_temp = value.parse().unwrap_or(state.target_temp),
                    "misc.start" => state.state_code = 5,
                    "misc.stop" => state.state_code = 14,
                    _ => {}
                }
            }
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_fake_stove_applies_writes() {
        let stove = FakeStove::new();
        let address = StoveAddress::new("s", "p", "h");

        stove.write(&address, "misc.stop", "1").await.unwrap();
        let reply = stove.read(&address, FUNCTION_STATUS, PAYLOAD_OPERATING).await.unwrap();
        assert_eq!(reply.split(',').nth(6), Some("14"));
    }

    #[test]
    fn test_fake_stove_discovery_override() {
        let stove = FakeStove::new();
        stove.state.lock().discovery_host = Some("10.0.0.7".to_string());

        let info = tokio_test::block_on(stove.discover()).unwrap();
        assert_eq!(info.host, "10.0.0.7");
        assert_eq!(stove.discoveries(), 1);

        stove.state.lock().fail_discovery = true;
        assert!(tokio_test::block_on(stove.discover()).is_err());
    }
}
