//! Stove link management.
//!
//! Keeps track of the host the stove answers on, rediscovers it when it
//! goes stale or a call failed, and retries writes.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::protocol::StoveCommand;
use crate::transport::{StoveAddress, StoveTransport};

/// Discovery and firmware details of the link.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LinkInfo {
    /// Host currently in use.
    pub host: Option<String>,
    /// Firmware version from the last successful discovery.
    pub firmware_version: Option<String>,
    /// Firmware build from the last successful discovery.
    pub firmware_build: Option<String>,
    /// Whether the host came from the fallback.
    pub using_fallback: bool,
}

#[derive(Debug, Default)]
struct LinkState {
    info: LinkInfo,
    last_discovery: Option<Instant>,
    rediscover: bool,
}

/// Owns the current stove host and sends commands over a [`StoveTransport`].
pub struct StoveLink {
    /// The transport used for every call.
    transport: Arc<dyn StoveTransport>,
    /// Host and discovery bookkeeping.
    state: RwLock<LinkState>,
    /// Controller serial number.
    serial: String,
    /// Controller pin code.
    pin: String,
    /// Fixed host, if configured.
    fixed_host: Option<String>,
    /// Host used when discovery fails.
    fallback_host: String,
    /// Time between rediscoveries.
    rediscovery_interval: Duration,
    /// Wait between failed command attempts.
    backoff: Duration,
}

impl StoveLink {
    /// Create a link for the stove described by `config`.
    pub fn new(transport: Arc<dyn StoveTransport>, config: &CoordinatorConfig) -> Self {
        Self {
            transport,
            state: RwLock::new(LinkState::default()),
            serial: config.serial.clone(),
            pin: config.pin.clone(),
            fixed_host: config.host.clone(),
            fallback_host: config.fallback_host.clone(),
            rediscovery_interval: config.rediscovery_interval,
            backoff: config.command_backoff,
        }
    }

    /// Host, firmware and fallback details.
    pub fn info(&self) -> LinkInfo {
        self.state.read().info.clone()
    }

    /// Force a rediscovery before the next call.
    pub fn mark_failed(&self) {
        self.state.write().rediscover = true;
    }

    /// Address for the current host, discovering it first if needed.
    pub async fn address(&self) -> StoveAddress {
        let host = match self.usable_host() {
            Some(host) => host,
            None => self.discover().await,
        };
        StoveAddress::new(&self.serial, &self.pin, host)
    }

    /// The current host if it needs no rediscovery.
    fn usable_host(&self) -> Option<String> {
        let state = self.state.read();
        let host = state.info.host.clone()?;

        if self.fixed_host.is_some() {
            return Some(host);
        }
        if state.rediscover {
            return None;
        }
        let fresh = state
            .last_discovery
            .map(|at| at.elapsed() < self.rediscovery_interval)
            .unwrap_or(false);
        fresh.then_some(host)
    }

    /// Run discovery and return the host to use.
    ///
    /// A failed discovery, or one that yields an unusable address, falls
    /// back to the relay host.
    pub async fn discover(&self) -> String {
        if let Some(host) = &self.fixed_host {
            let mut state = self.state.write();
            state.info.host = Some(host.clone());
            state.rediscover = false;
            return host.clone();
        }

        let (host, using_fallback) = match self.transport.discover().await {
            Ok(found) if !found.host.is_empty() && !found.host.contains("0.0.0.0") => {
                info!(
                    "Discovered stove at {} (firmware {} build {})",
                    found.host,
                    found.firmware_version.as_deref().unwrap_or("?"),
                    found.firmware_build.as_deref().unwrap_or("?")
                );
                let mut state = self.state.write();
                state.info.firmware_version = found.firmware_version;
                state.info.firmware_build = found.firmware_build;
                (found.host, false)
            }
            Ok(found) => {
                warn!(
                    "Discovery returned unusable address {:?}, using {}",
                    found.host, self.fallback_host
                );
                (self.fallback_host.clone(), true)
            }
            Err(e) => {
                warn!("Discovery failed: {}, using {}", e, self.fallback_host);
                (self.fallback_host.clone(), true)
            }
        };

        let mut state = self.state.write();
        state.info.host = Some(host.clone());
        state.info.using_fallback = using_fallback;
        state.last_discovery = Some(Instant::now());
        state.rediscover = false;
        host
    }

    /// Issue a read call.
    pub async fn read(&self, function_id: u8, payload: &str) -> Result<String> {
        let address = self.address().await;
        self.transport.read(&address, function_id, payload).await
    }

    /// Send a command, trying up to `attempts` times.
    ///
    /// The stove accepts a write by answering with an empty body. Between
    /// attempts the link waits the backoff and rediscovers.
    pub async fn send(&self, command: &StoveCommand, attempts: u32) -> Result<()> {
        let attempts = attempts.max(1);
        let path = command.path();
        let value = command.value();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let address = self.address().await;
            debug!("Sending {} (attempt {} of {})", command, attempt, attempts);

            let result = match self.transport.write(&address, path, &value).await {
                Ok(response) if response.trim().is_empty() => Ok(()),
                Ok(response) => Err(Error::CommandRejected {
                    path: path.to_string(),
                    response,
                }),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    info!("Command {} accepted", command);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Command {} attempt {} failed: {}", command, attempt, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff).await;
                        self.discover().await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Transport {
            context: format!("{} not sent", command),
        }))
    }
}
