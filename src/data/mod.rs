//! Data structures and per-poll bookkeeping for the stove.
//!
//! Everything in here is synchronous and owns its state; the coordinator
//! feeds each structure one poll at a time.

pub mod alarms;
pub mod forecast;
pub mod fuel;
pub mod history;
pub mod learning;
pub mod pending;
pub mod prediction;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod wood;

pub use alarms::{AlertEvaluator, AlertInputs, AlertKind, AlertState, AlertTiming};
pub use forecast::{ForecastCache, ForecastSample};
pub use fuel::{ConsumptionTracker, FuelState};
pub use history::{ConsumptionHistory, ConsumptionReport, MonthKey, YearOverYear};
pub use learning::{LearningData, LearningStatus};
pub use pending::{
    CalculatedData, ChangeOutcome, ChangeReport, ChangeTimeouts, ChangeTracker, DisplayTarget,
    ModeTransition, ObservedControl, PendingChange, ResendPlan,
};
pub use prediction::{
    predict, Confidence, CurrentPhase, DepletionPrediction, OutdoorReading, PredictionBasis,
    PredictionContext, PredictionStatus, PredictionTracker, SimulationStep,
};
pub use session::{SessionInputs, SessionTracker};
pub use settings::UserSettings;
pub use telemetry::{OperatingHours, OperationMode, StateCode, StoveTelemetry};
pub use wood::{PreWoodSettings, ResumeAction, WoodModeTracker};
