// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]

//! # aduro-stove
//!
//! Polling coordinator for Aduro hybrid pellet stoves: fuel accounting,
//! confirmed commands, learned consumption and heating rates, and a
//! prediction of when the hopper runs empty.
//!
//! The stove itself is reached through a [`StoveTransport`], so the crate
//! runs against real hardware, a relay, or a simulation alike.
//!
//! ## Features
//!
//! - **Fuel Accounting**: Pellets left since refill and consumed since cleaning
//! - **Confirmed Commands**: Heat level, temperature and mode changes are
//!   tracked until the stove reports them, and resent when it does not
//! - **Rate Learning**: Heating, cooling and consumption rates per condition
//! - **Depletion Prediction**: Time until empty, simulated through burn cycles
//!   in temperature mode
//! - **Alerts**: Low fuel, critical fuel auto-shutdown, high smoke and low wood fire
//! - **Wood Mode**: Resume pellet heating once a wood fire has burnt down
//! - **Consumption History**: Daily, monthly and year-over-year totals
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aduro_stove::{CoordinatorConfig, JsonFileStore, Result, StoveCoordinator, StoveTransport};
//! use std::sync::Arc;
//!
//! async fn run(transport: Arc<dyn StoveTransport>) -> Result<()> {
//!     let config = CoordinatorConfig::new("12345", "0000");
//!     let store = Arc::new(JsonFileStore::new("aduro-state.json"));
//!     let coordinator = StoveCoordinator::new(config, transport, store).await;
//!
//!     let snapshot = coordinator.poll().await?;
//!     println!(
//!         "State {} at heatlevel {}, {:.1} kg pellets left",
//!         snapshot.telemetry.state, snapshot.telemetry.heatlevel, snapshot.fuel_remaining
//!     );
//!
//!     coordinator.set_heatlevel(3).await?;
//!
//!     let prediction = coordinator.predict_depletion().await?;
//!     println!("{}", prediction.report());
//!
//!     coordinator.start();
//!     tokio::time::sleep(std::time::Duration::from_secs(600)).await;
//!     coordinator.stop().await;
//!     Ok(())
//! }
//! ```

// Public modules
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod link;
pub mod persistence;
pub mod protocol;
pub mod transport;
pub mod utils;

// Re-exports for convenience
pub use config::CoordinatorConfig;
pub use coordinator::{CallbackHandle, StoveCoordinator, StoveSnapshot};
pub use error::{Error, Result};
pub use link::{LinkInfo, StoveLink};
pub use persistence::{BlobStore, JsonFileStore, MemoryStore, PersistedState};
pub use protocol::{NetworkInfo, StoveCommand};
pub use transport::{DiscoveryInfo, ForecastProvider, OutdoorSensor, StoveAddress, StoveTransport};
pub use utils::format_remaining;

// Re-export commonly used types from submodules
pub use data::{
    AlertEvaluator, AlertKind, CalculatedData, ConsumptionReport, DepletionPrediction,
    DisplayTarget, ForecastSample, FuelState, LearningData, LearningStatus, OperationMode,
    PendingChange, PreWoodSettings, PredictionStatus, StateCode, StoveTelemetry, UserSettings,
};
