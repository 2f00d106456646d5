//! Coordinator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::data::forecast::{DEFAULT_MATCH_TOLERANCE, DEFAULT_REFRESH_INTERVAL};
use crate::data::pending::ChangeTimeouts;
use crate::protocol::FrameLayout;

/// Public relay used when discovery fails.
pub const DEFAULT_FALLBACK_HOST: &str = "apprelay20.stokercloud.dk";

/// Connection details and timing for a [`StoveCoordinator`](crate::StoveCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Controller serial number.
    pub serial: String,
    /// Controller pin code.
    pub pin: String,
    /// Fixed host. Disables periodic rediscovery when set.
    pub host: Option<String>,
    /// Host used when discovery fails or returns an unusable address.
    pub fallback_host: String,
    /// Time between rediscoveries.
    pub rediscovery_interval: Duration,
    /// Normal time between polls.
    pub poll_interval: Duration,
    /// Time between polls after a command.
    pub fast_poll_interval: Duration,
    /// Number of fast polls after a command.
    pub fast_poll_cycles: u32,
    /// Minimum time between network info and consumption history refreshes.
    pub refresh_interval: Duration,
    /// Time between periodic saves.
    pub save_interval: Duration,
    /// Attempts per command.
    pub command_retries: u32,
    /// Wait between command attempts.
    pub command_backoff: Duration,
    /// Wait between a mode command and the value command that follows it.
    pub settle_delay: Duration,
    /// Time without confirmation before unconfirmed targets are resent.
    pub command_response_timeout: Duration,
    /// Time without confirmation after which a change is abandoned.
    pub total_change_timeout: Duration,
    /// Maximum resends per change.
    pub max_resends: u32,
    /// Minimum time between forecast refreshes.
    pub forecast_refresh_interval: Duration,
    /// Maximum distance between a simulated time and the forecast sample used.
    pub forecast_match_tolerance: Duration,
    /// Firmware-dependent frame field positions.
    pub frame_layout: FrameLayout,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            pin: String::new(),
            host: None,
            fallback_host: DEFAULT_FALLBACK_HOST.to_string(),
            rediscovery_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(30),
            fast_poll_interval: Duration::from_secs(5),
            fast_poll_cycles: 6,
            refresh_interval: Duration::from_secs(300),
            save_interval: Duration::from_secs(900),
            command_retries: 3,
            command_backoff: Duration::from_secs(1),
            settle_delay: Duration::from_secs(3),
            command_response_timeout: Duration::from_secs(30),
            total_change_timeout: Duration::from_secs(120),
            max_resends: 3,
            forecast_refresh_interval: DEFAULT_REFRESH_INTERVAL,
            forecast_match_tolerance: DEFAULT_MATCH_TOLERANCE,
            frame_layout: FrameLayout::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration for one stove with default timing.
    pub fn new(serial: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            pin: pin.into(),
            ..Self::default()
        }
    }

    /// Use a fixed host instead of discovery.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the fallback host.
    pub fn with_fallback_host(mut self, host: impl Into<String>) -> Self {
        self.fallback_host = host.into();
        self
    }

    /// Set the normal and fast poll intervals.
    pub fn with_poll_intervals(mut self, normal: Duration, fast: Duration) -> Self {
        self.poll_interval = normal;
        self.fast_poll_interval = fast;
        self
    }

    /// Set the wait between mode and value commands.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set command retry count and backoff.
    pub fn with_command_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.command_retries = retries;
        self.command_backoff = backoff;
        self
    }

    /// Set the confirmation timeouts.
    pub fn with_change_timeouts(mut self, response: Duration, total: Duration) -> Self {
        self.command_response_timeout = response;
        self.total_change_timeout = total;
        self
    }

    /// Set the frame layout for a different firmware.
    pub fn with_frame_layout(mut self, layout: FrameLayout) -> Self {
        self.frame_layout = layout;
        self
    }

    /// Timing rules for the confirmation machine.
    pub fn change_timeouts(&self) -> ChangeTimeouts {
        ChangeTimeouts {
            command_response: self.command_response_timeout,
            total_change: self.total_change_timeout,
            max_resends: self.max_resends,
        }
    }

    /// Whether rediscovery is skipped.
    pub fn has_fixed_host(&self) -> bool {
        self.host.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::new("12345", "0000");
        assert_eq!(config.serial, "12345");
        assert_eq!(config.fallback_host, "apprelay20.stokercloud.dk");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.fast_poll_cycles, 6);
        assert_eq!(config.change_timeouts(), ChangeTimeouts::default());
        assert!(!config.has_fixed_host());
    }

    #[test]
    fn test_builders() {
        let config = CoordinatorConfig::new("1", "2")
            .with_host("192.168.1.50")
            .with_settle_delay(Duration::ZERO)
            .with_change_timeouts(Duration::from_secs(5), Duration::from_secs(20));

        assert!(config.has_fixed_host());
        assert_eq!(config.settle_delay, Duration::ZERO);
        assert_eq!(config.change_timeouts().total_change, Duration::from_secs(20));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"serial": "4242", "pin": "1234", "fast_poll_cycles": 3}"#)
                .unwrap();
        assert_eq!(config.serial, "4242");
        assert_eq!(config.fast_poll_cycles, 3);
        assert_eq!(config.settle_delay, Duration::from_secs(3));
        assert_eq!(config.frame_layout, FrameLayout::default());
    }
}
