//! Stove coordinator.
//!
//! Drives the poll cycle, owns every per-stove state record and exposes the
//! control surface. One poll runs at a time; command sequences are
//! serialized behind a second lock so only one is in flight.

use chrono::{DateTime, Local, Utc};
use futures::future::join_all;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::data::alarms::{AlertEvaluator, AlertInputs, AlertKind};
use crate::data::forecast::ForecastCache;
use crate::data::fuel::{ConsumptionTracker, FuelState};
use crate::data::history::{ConsumptionHistory, ConsumptionReport};
use crate::data::learning::{LearningData, LearningStatus};
use crate::data::pending::{
    CalculatedData, ChangeOutcome, ChangeTracker, ObservedControl, PendingChange, ResendPlan,
};
use crate::data::prediction::{
    predict, DepletionPrediction, OutdoorReading, PredictionContext, PredictionTracker,
};
use crate::data::session::{SessionInputs, SessionTracker};
use crate::data::settings::UserSettings;
use crate::data::telemetry::{OperationMode, StoveTelemetry};
use crate::data::wood::{PreWoodSettings, ResumeAction, WoodModeTracker};
use crate::error::{Error, Result};
use crate::link::{LinkInfo, StoveLink};
use crate::persistence::{load_state, BlobStore, PersistedState, StateSaver, STATE_VERSION};
use crate::protocol::frames::{
    parse_counter_series, parse_network, parse_operating, parse_status, FUNCTION_CONSUMPTION,
    FUNCTION_SETTINGS, FUNCTION_STATUS, PAYLOAD_NETWORK, PAYLOAD_OPERATING, PAYLOAD_STATUS,
    PAYLOAD_TOTAL_DAYS, PAYLOAD_TOTAL_MONTHS, PAYLOAD_TOTAL_YEARS,
};
use crate::protocol::{NetworkInfo, StoveCommand};
use crate::transport::{ForecastProvider, OutdoorSensor, StoveTransport};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Everything published after a successful poll.
#[derive(Debug, Clone, Serialize)]
pub struct StoveSnapshot {
    /// Telemetry read this cycle.
    pub telemetry: StoveTelemetry,
    /// Fuel totals after this cycle's counter reading.
    pub fuel: FuelState,
    /// Pellets left in kg.
    pub fuel_remaining: f64,
    /// Pellets left in percent of capacity.
    pub fuel_percentage: f64,
    /// Consumption counters from the last successful refresh.
    pub consumption: Option<ConsumptionReport>,
    /// Network details from the last successful refresh.
    pub network: Option<NetworkInfo>,
    /// Host and firmware details.
    pub link: LinkInfo,
    /// Match flags and display target.
    pub calculated: CalculatedData,
    /// The pending change after this cycle.
    pub pending: PendingChange,
    /// A change made outside this coordinator was seen.
    pub app_change_detected: bool,
    /// The stove stopped on its own or from another client.
    pub auto_stop_detected: bool,
    /// The stove started ignition.
    pub auto_start_detected: bool,
    /// Alert states after this cycle.
    pub alerts: AlertEvaluator,
    /// Alerts that fired this cycle.
    pub fired_alerts: Vec<AlertKind>,
    /// Pellet settings saved on entering wood mode.
    pub pre_wood: Option<PreWoodSettings>,
    /// Learning diagnostics.
    pub learning_status: LearningStatus,
    /// Whether the next poll uses the fast interval.
    pub fast_polling: bool,
    /// When the poll ran.
    pub updated_at: DateTime<Utc>,
}

/// Work a poll hands to a command task.
#[derive(Debug, Clone, Copy, PartialEq)]
enum AutomaticAction {
    Resend(ResendPlan),
    Stop,
    Resume(ResumeAction),
}

/// Mutable coordinator state. Guarded by one lock, never held across `.await`.
struct CoordinatorState {
    telemetry: Option<StoveTelemetry>,
    consumption: ConsumptionTracker,
    settings: UserSettings,
    learning: LearningData,
    history: ConsumptionHistory,
    report: Option<ConsumptionReport>,
    network: Option<NetworkInfo>,
    changes: ChangeTracker,
    sessions: SessionTracker,
    alerts: AlertEvaluator,
    wood: WoodModeTracker,
    forecast: ForecastCache,
    prediction_tracker: PredictionTracker,
    snapshot: Option<StoveSnapshot>,
    available: bool,
    fast_polls_remaining: u32,
    last_refresh: Option<Instant>,
    last_save: Instant,
}

impl CoordinatorState {
    fn restore(persisted: PersistedState) -> Self {
        let alerts = AlertEvaluator::new(&persisted.settings);
        Self {
            telemetry: None,
            consumption: persisted.consumption,
            settings: persisted.settings,
            learning: persisted.learning,
            history: persisted.history,
            report: None,
            network: None,
            changes: ChangeTracker::new(),
            sessions: SessionTracker::new(),
            alerts,
            wood: WoodModeTracker::new(),
            forecast: ForecastCache::new(),
            prediction_tracker: PredictionTracker::new(),
            snapshot: None,
            available: false,
            fast_polls_remaining: 0,
            last_refresh: None,
            last_save: Instant::now(),
        }
    }

    fn persisted(&self) -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            consumption: self.consumption.clone(),
            settings: self.settings.clone(),
            learning: self.learning.clone(),
            history: self.history.clone(),
        }
    }
}

/// State and collaborators shared with background tasks.
struct Shared {
    config: CoordinatorConfig,
    link: StoveLink,
    state: Arc<RwLock<CoordinatorState>>,
    saver: StateSaver,
    forecast_provider: RwLock<Option<Arc<dyn ForecastProvider>>>,
    outdoor_sensor: RwLock<Option<Arc<dyn OutdoorSensor>>>,
    /// Serializes poll cycles.
    poll_lock: Mutex<()>,
    /// Serializes command sequences.
    command_lock: Mutex<()>,
    /// Command tasks spawned from polls.
    command_tasks: SyncMutex<Vec<JoinHandle<()>>>,
    snapshot_tx: broadcast::Sender<StoveSnapshot>,
    is_running: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    fn outdoor_reading(&self) -> OutdoorReading {
        let sensor = self.outdoor_sensor.read().clone();
        let sensor_configured = sensor.is_some() || self.state.read().settings.has_external_sensor();
        OutdoorReading {
            sensor_configured,
            temperature: sensor.and_then(|s| s.temperature()),
        }
    }

    fn poll_interval(&self) -> Duration {
        if self.state.read().fast_polls_remaining > 0 {
            self.config.fast_poll_interval
        } else {
            self.config.poll_interval
        }
    }

    async fn fetch_telemetry(&self) -> Result<StoveTelemetry> {
        let layout = &self.config.frame_layout;
        let last_mode = self
            .state
            .read()
            .telemetry
            .as_ref()
            .map(|t| t.operation_mode);

        let status = match self
            .link
            .read(FUNCTION_STATUS, PAYLOAD_STATUS)
            .await
            .and_then(|reply| parse_status(&reply, layout))
        {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Status frame unavailable, keeping last operation mode: {}", e);
                None
            }
        };

        let mode = status
            .map(|s| s.operation_mode)
            .or(last_mode)
            .unwrap_or_default();
        let reply = self.link.read(FUNCTION_STATUS, PAYLOAD_OPERATING).await?;
        let mut telemetry = parse_operating(&reply, layout, mode)?;
        telemetry.consumption_total = status.and_then(|s| s.consumption_total);
        Ok(telemetry)
    }

    async fn fetch_counters(&self) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        let days = parse_counter_series(&self.link.read(FUNCTION_CONSUMPTION, PAYLOAD_TOTAL_DAYS).await?)?;
        let months =
            parse_counter_series(&self.link.read(FUNCTION_CONSUMPTION, PAYLOAD_TOTAL_MONTHS).await?)?;
        let years =
            parse_counter_series(&self.link.read(FUNCTION_CONSUMPTION, PAYLOAD_TOTAL_YEARS).await?)?;
        Ok((days, months, years))
    }

    /// Refresh network info and consumption counters if the interval elapsed.
    async fn refresh_extras(&self, now: DateTime<Utc>) {
        let due = self
            .state
            .read()
            .last_refresh
            .map(|at| at.elapsed() >= self.config.refresh_interval)
            .unwrap_or(true);
        if !due {
            return;
        }

        match self
            .link
            .read(FUNCTION_SETTINGS, PAYLOAD_NETWORK)
            .await
            .and_then(|reply| parse_network(&reply))
        {
            Ok(network) => {
                debug!("Network info: SSID {}, RSSI {:?}", network.ssid, network.rssi);
                self.state.write().network = Some(network);
            }
            Err(e) => warn!("Network info unavailable, keeping previous: {}", e),
        }

        match self.fetch_counters().await {
            Ok((days, months, years)) => {
                let today = now.with_timezone(&Local).date_naive();
                let seeded = {
                    let mut state = self.state.write();
                    let was_initialized = state.history.initialized;
                    let report = state.history.update(&days, &months, &years, today);
                    debug!(
                        "Consumption today {:.2} kg, month {:.2} kg, year {:.2} kg",
                        report.day, report.month, report.year_to_date
                    );
                    state.report = Some(report);
                    !was_initialized
                };
                if seeded {
                    self.saver.request_save();
                }
            }
            Err(e) => warn!("Consumption data unavailable, keeping previous: {}", e),
        }

        self.state.write().last_refresh = Some(Instant::now());
    }

    async fn refresh_forecast(&self) {
        let Some(provider) = self.forecast_provider.read().clone() else {
            return;
        };
        let due = self
            .state
            .read()
            .forecast
            .needs_refresh(Utc::now(), self.config.forecast_refresh_interval);
        if !due {
            return;
        }

        match provider.hourly_forecast().await {
            Ok(samples) => {
                self.state.write().forecast.replace(samples, Utc::now());
            }
            Err(e) => warn!("Weather forecast refresh failed: {}", e),
        }
    }

    async fn poll_at(self: &Arc<Self>, now: DateTime<Utc>) -> Result<StoveSnapshot> {
        let _poll = self.poll_lock.lock().await;

        let telemetry = match self.fetch_telemetry().await {
            Ok(telemetry) => telemetry,
            Err(e) => {
                error!("Poll failed, keeping last data: {}", e);
                self.link.mark_failed();
                self.state.write().available = false;
                return Err(Error::PollFailed {
                    reason: e.to_string(),
                });
            }
        };

        self.refresh_extras(now).await;
        let outdoor = self.outdoor_reading();

        let (snapshot, actions, save) = self.process(telemetry, outdoor, now);

        if save {
            self.saver.request_save();
        }
        let _ = self.snapshot_tx.send(snapshot.clone());
        for action in actions {
            self.spawn_action(action);
        }
        Ok(snapshot)
    }

    /// Run every per-poll update against the new telemetry.
    fn process(
        &self,
        telemetry: StoveTelemetry,
        outdoor: OutdoorReading,
        now: DateTime<Utc>,
    ) -> (StoveSnapshot, Vec<AutomaticAction>, bool) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut actions = Vec::new();
        let mut save = false;

        debug!(
            "Poll: state {} mode {} heatlevel {} room {:.1}°C target {:.1}°C smoke {:.1}°C",
            telemetry.state,
            telemetry.operation_mode,
            telemetry.heatlevel,
            telemetry.room_temp,
            telemetry.target_temp,
            telemetry.smoke_temp
        );

        let observed = ObservedControl::from(&telemetry);
        let report = state
            .changes
            .observe(&observed, now, &self.config.change_timeouts());
        match report.outcome {
            ChangeOutcome::Resend(plan) => actions.push(AutomaticAction::Resend(plan)),
            ChangeOutcome::Abandoned => warn!("Pending change abandoned, telemetry kept as is"),
            _ => {}
        }

        state.fast_polls_remaining = if state.changes.in_progress() {
            self.config.fast_poll_cycles
        } else {
            state.fast_polls_remaining.saturating_sub(1)
        };

        if let Some(resume) = state
            .wood
            .observe(&telemetry, state.settings.auto_resume_after_wood)
        {
            actions.push(AutomaticAction::Resume(resume));
        }

        let fuel_percentage = match state.report.as_ref().map(|r| r.day) {
            Some(day) => {
                let fuel = state.consumption.update(day);
                state.consumption.update_learning(day);
                Some(fuel.percentage())
            }
            None => None,
        };

        let inputs = AlertInputs {
            fuel_percentage,
            smoke_temp: Some(telemetry.smoke_temp),
            in_wood_mode: telemetry.is_wood(),
        };
        let fired = state.alerts.evaluate(&state.settings, &inputs, now);
        if fired.contains(&AlertKind::CriticalFuel) {
            actions.push(AutomaticAction::Stop);
        }

        let session_inputs = SessionInputs {
            state: telemetry.state,
            heatlevel: telemetry.heatlevel,
            room_temp: telemetry.room_temp,
            target_temp: telemetry.target_temp,
            operation_mode: telemetry.operation_mode,
            learning_consumption: state.consumption.learning_total(),
            outdoor_temp: outdoor.temperature,
            app_change_detected: report.app_change_detected,
        };
        let recorded = state
            .sessions
            .update(&mut state.learning, &session_inputs, now);
        if recorded > 0 {
            save = true;
        }

        if state.last_save.elapsed() >= self.config.save_interval {
            state.last_save = Instant::now();
            save = true;
        }

        let fuel = state.consumption.fuel();
        let snapshot = StoveSnapshot {
            calculated: state.changes.calculated(&observed),
            pending: *state.changes.pending(),
            telemetry: telemetry.clone(),
            fuel,
            fuel_remaining: fuel.remaining(),
            fuel_percentage: fuel.percentage(),
            consumption: state.report.clone(),
            network: state.network.clone(),
            link: self.link.info(),
            app_change_detected: report.app_change_detected,
            auto_stop_detected: report.auto_stop_detected,
            auto_start_detected: report.auto_start_detected,
            alerts: state.alerts.clone(),
            fired_alerts: fired,
            pre_wood: state.wood.saved(),
            learning_status: state.learning.status(now),
            fast_polling: state.fast_polls_remaining > 0,
            updated_at: now,
        };

        state.telemetry = Some(telemetry);
        state.snapshot = Some(snapshot.clone());
        state.available = true;
        (snapshot, actions, save)
    }

    fn spawn_action(self: &Arc<Self>, action: AutomaticAction) {
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            shared.run_action(action).await;
        });
        let mut tasks = self.command_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn run_action(&self, action: AutomaticAction) {
        let _command = self.command_lock.lock().await;
        match action {
            AutomaticAction::Resend(plan) => self.resend(plan).await,
            AutomaticAction::Stop => {
                if let Err(e) = self.apply_untargeted(StoveCommand::Stop).await {
                    error!("Automatic stop failed: {}", e);
                }
            }
            AutomaticAction::Resume(resume) => {
                if let Err(e) = self.apply_untargeted(StoveCommand::Start).await {
                    error!("Failed to restart after wood mode: {}", e);
                    return;
                }
                tokio::time::sleep(self.config.settle_delay).await;
                if let Err(e) = self.apply_heatlevel(resume.heatlevel).await {
                    error!("Failed to restore heatlevel after wood mode: {}", e);
                }
            }
        }
    }

    /// Send the unconfirmed targets again, one attempt each, mode first.
    async fn resend(&self, plan: ResendPlan) {
        if let Some(mode) = plan.operation_mode {
            if let Err(e) = self.link.send(&StoveCommand::SetOperationMode(mode), 1).await {
                warn!("Resend of operation mode failed: {}", e);
            }
            if plan.heatlevel.is_some() || plan.temperature.is_some() {
                tokio::time::sleep(self.config.settle_delay).await;
            }
        }
        if let Some(level) = plan.heatlevel {
            if let Err(e) = self.link.send(&StoveCommand::SetHeatLevel(level), 1).await {
                warn!("Resend of heatlevel failed: {}", e);
            }
        }
        if let Some(celsius) = plan.temperature {
            let command = StoveCommand::SetTargetTemperature(celsius);
            if let Err(e) = self.link.send(&command, 1).await {
                warn!("Resend of temperature failed: {}", e);
            }
        }
    }

    fn command_succeeded(&self) {
        self.state.write().fast_polls_remaining = self.config.fast_poll_cycles;
    }

    fn abort_change(&self, command: &StoveCommand, e: &Error) {
        error!("Failed to send {}: {}", command, e);
        self.state.write().changes.abort();
    }

    /// Send a mode command, wait the settle delay, then send the value.
    async fn send_mode_and_value(&self, mode: OperationMode, value: StoveCommand) -> Result<()> {
        let attempts = self.config.command_retries;
        let mode_command = StoveCommand::SetOperationMode(mode);

        if let Err(e) = self.link.send(&mode_command, attempts).await {
            self.abort_change(&mode_command, &e);
            return Err(e);
        }
        tokio::time::sleep(self.config.settle_delay).await;
        if let Err(e) = self.link.send(&value, attempts).await {
            self.abort_change(&value, &e);
            return Err(e);
        }

        self.command_succeeded();
        Ok(())
    }

    async fn send_single(&self, command: StoveCommand) -> Result<()> {
        match self.link.send(&command, self.config.command_retries).await {
            Ok(()) => {
                self.command_succeeded();
                Ok(())
            }
            Err(e) => {
                self.abort_change(&command, &e);
                Err(e)
            }
        }
    }

    async fn apply_heatlevel(&self, level: u8) -> Result<()> {
        let command = StoveCommand::heatlevel(level)?;
        info!("Setting heatlevel to {}", level);
        self.state.write().changes.begin_heatlevel(level, Utc::now());
        self.send_mode_and_value(OperationMode::HeatLevel, command)
            .await
    }

    async fn apply_temperature(&self, celsius: f64) -> Result<()> {
        let command = StoveCommand::target_temperature(celsius)?;
        info!("Setting target temperature to {:.1}°C", celsius);
        self.state
            .write()
            .changes
            .begin_temperature(celsius, Utc::now());
        self.send_mode_and_value(OperationMode::Temperature, command)
            .await
    }

    async fn apply_untargeted(&self, command: StoveCommand) -> Result<()> {
        info!("Sending {}", command);
        self.state.write().changes.begin_untargeted(Utc::now());
        self.send_single(command).await
    }
}

/// Coordinates polling, bookkeeping and commands for one stove.
pub struct StoveCoordinator {
    /// State and collaborators shared with background tasks.
    shared: Arc<Shared>,
    /// Poll loop task handle.
    background_handle: RwLock<Option<JoinHandle<()>>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl StoveCoordinator {
    /// Create a coordinator, restoring persisted state from `store`.
    ///
    /// A missing or unreadable document starts from defaults. The state saver
    /// starts right away, so saves requested by manual polls, fuel actions and
    /// setters are written in the background without [`start`](Self::start).
    pub async fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn StoveTransport>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let persisted = load_state(&*store).await;
        let state = Arc::new(RwLock::new(CoordinatorState::restore(persisted)));

        let snapshot_state = state.clone();
        let saver = StateSaver::new(store, move || snapshot_state.read().persisted());
        let (snapshot_tx, _) = broadcast::channel(16);

        let coordinator = Self {
            shared: Arc::new(Shared {
                link: StoveLink::new(transport, &config),
                config,
                state,
                saver,
                forecast_provider: RwLock::new(None),
                outdoor_sensor: RwLock::new(None),
                poll_lock: Mutex::new(()),
                command_lock: Mutex::new(()),
                command_tasks: SyncMutex::new(Vec::new()),
                snapshot_tx,
                is_running: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
            background_handle: RwLock::new(None),
            callback_counter: AtomicU64::new(0),
        };
        coordinator.shared.saver.start();
        coordinator
    }

    /// The configuration in use.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Use `provider` for weather forecasts, or none.
    pub fn set_forecast_provider(&self, provider: Option<Arc<dyn ForecastProvider>>) {
        *self.shared.forecast_provider.write() = provider;
    }

    /// Use `sensor` for the outdoor temperature, or none.
    pub fn set_outdoor_sensor(&self, sensor: Option<Arc<dyn OutdoorSensor>>) {
        *self.shared.outdoor_sensor.write() = sensor;
    }

    // === Lifecycle ===

    /// Start the background poll loop.
    pub fn start(&self) {
        if self.shared.is_running.swap(true, Ordering::SeqCst) {
            debug!("Coordinator already running");
            return;
        }

        info!("Starting stove coordinator for {}", self.shared.config.serial);

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            while shared.is_running.load(Ordering::SeqCst) {
                if let Err(e) = shared.poll_at(Utc::now()).await {
                    debug!("Poll cycle failed: {}", e);
                }

                let interval = shared.poll_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shared.shutdown.notified() => {}
                }
            }
            debug!("Poll loop ended");
        });

        *self.background_handle.write() = Some(handle);
    }

    /// Stop the poll loop, wait for command tasks and save state.
    pub async fn stop(&self) {
        if !self.shared.is_running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping stove coordinator");
        self.shared.shutdown.notify_one();
        let handle = self.background_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.wait_for_commands().await;
        self.save().await;
    }

    /// Whether the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::SeqCst)
    }

    /// Run one poll cycle now.
    pub async fn poll(&self) -> Result<StoveSnapshot> {
        self.shared.poll_at(Utc::now()).await
    }

    #[cfg(test)]
    pub(crate) async fn poll_at(&self, now: DateTime<Utc>) -> Result<StoveSnapshot> {
        self.shared.poll_at(now).await
    }

    /// Wait for command tasks spawned by polls (resends, alert stop, wood resume).
    pub async fn wait_for_commands(&self) {
        let handles: Vec<_> = self.shared.command_tasks.lock().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Command task ended abnormally: {}", e);
            }
        }
    }

    /// Write the persisted state now.
    pub async fn save(&self) {
        self.shared.saver.request_save();
        self.shared.saver.flush().await;
    }

    // === Snapshot ===

    /// The last published snapshot. Kept when a later poll fails.
    pub fn snapshot(&self) -> Option<StoveSnapshot> {
        self.shared.state.read().snapshot.clone()
    }

    /// Whether the last poll succeeded.
    pub fn is_available(&self) -> bool {
        self.shared.state.read().available
    }

    /// Latest telemetry.
    pub fn telemetry(&self) -> Option<StoveTelemetry> {
        self.shared.state.read().telemetry.clone()
    }

    /// Current fuel totals.
    pub fn fuel(&self) -> FuelState {
        self.shared.state.read().consumption.fuel()
    }

    /// Current user settings.
    pub fn settings(&self) -> UserSettings {
        self.shared.state.read().settings.clone()
    }

    /// The pending change.
    pub fn pending_change(&self) -> PendingChange {
        *self.shared.state.read().changes.pending()
    }

    /// Learned rates.
    pub fn learning_data(&self) -> LearningData {
        self.shared.state.read().learning.clone()
    }

    /// Learning diagnostics.
    pub fn learning_status(&self) -> LearningStatus {
        self.shared.state.read().learning.status(Utc::now())
    }

    /// Interval until the next poll of the background loop.
    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval()
    }

    /// Subscribe to snapshots published after each successful poll.
    pub fn subscribe(&self) -> broadcast::Receiver<StoveSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Register a callback for published snapshots.
    pub fn on_snapshot<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&StoveSnapshot) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.snapshot_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(snapshot) = rx.recv().await {
                callback(&snapshot);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    // === Prediction ===

    /// Predict when the pellets run out.
    ///
    /// Refreshes the weather forecast first if it is due; a failed refresh
    /// keeps the cached forecast.
    pub async fn predict_depletion(&self) -> Result<DepletionPrediction> {
        self.shared.refresh_forecast().await;
        let outdoor = self.shared.outdoor_reading();
        let now = Utc::now();

        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let telemetry = state.telemetry.as_ref().ok_or(Error::NoTelemetry)?;

        let ctx = PredictionContext::new(
            telemetry,
            state.consumption.fuel().remaining(),
            &state.learning,
            &state.forecast,
            now,
        )
        .with_outdoor(outdoor)
        .with_forecast_tolerance(self.shared.config.forecast_match_tolerance);
        let prediction = predict(&ctx);

        state.prediction_tracker.observe(&prediction);
        Ok(prediction)
    }

    // === Control ===

    /// Set the heat level (1-3), switching to heat-level mode.
    pub async fn set_heatlevel(&self, heatlevel: u8) -> Result<()> {
        StoveCommand::heatlevel(heatlevel)?;
        let _command = self.shared.command_lock.lock().await;
        self.shared.apply_heatlevel(heatlevel).await
    }

    /// Set the target temperature, switching to temperature mode.
    pub async fn set_temperature(&self, celsius: f64) -> Result<()> {
        StoveCommand::target_temperature(celsius)?;
        let _command = self.shared.command_lock.lock().await;
        self.shared.apply_temperature(celsius).await
    }

    /// Set the operation mode.
    pub async fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        let command = StoveCommand::operation_mode(mode)?;
        let _command = self.shared.command_lock.lock().await;
        info!("Setting operation mode to {}", mode);
        self.shared
            .state
            .write()
            .changes
            .begin_operation_mode(mode, Utc::now());
        self.shared.send_single(command).await
    }

    /// Switch between heat-level and temperature mode, keeping the other mode's value.
    pub async fn toggle_mode(&self) -> Result<()> {
        let _command = self.shared.command_lock.lock().await;
        let new_mode = {
            let mut state = self.shared.state.write();
            let current = state.telemetry.as_ref().ok_or(Error::NoTelemetry)?;
            let observed = ObservedControl::from(current);
            let new_mode = current.operation_mode.toggled();
            state.changes.begin_toggle(new_mode, &observed, Utc::now());
            new_mode
        };
        info!("Toggling operation mode to {}", new_mode);
        self.shared
            .send_single(StoveCommand::SetOperationMode(new_mode))
            .await
    }

    /// Start the stove.
    pub async fn start_stove(&self) -> Result<()> {
        let _command = self.shared.command_lock.lock().await;
        self.shared.apply_untargeted(StoveCommand::Start).await
    }

    /// Stop the stove.
    pub async fn stop_stove(&self) -> Result<()> {
        let _command = self.shared.command_lock.lock().await;
        self.shared.apply_untargeted(StoveCommand::Stop).await
    }

    // === Fuel ===

    /// Record a hopper refill and release the fuel alert latches.
    pub fn refill(&self) {
        {
            let mut state = self.shared.state.write();
            state.consumption.refill();
            state.alerts.clear_fuel_latches();
        }
        self.shared.saver.request_save();
    }

    /// Record a stove cleaning.
    pub fn reset_cleaning_counter(&self) {
        self.shared.state.write().consumption.reset_cleaning_counter();
        self.shared.saver.request_save();
    }

    /// Set the hopper capacity in kg.
    pub fn set_pellet_capacity(&self, capacity_kg: f64) -> Result<()> {
        self.shared.state.write().consumption.set_capacity(capacity_kg)?;
        self.shared.saver.request_save();
        Ok(())
    }

    // === Settings ===

    fn update_settings<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut UserSettings) -> Result<()>,
    {
        {
            let mut state = self.shared.state.write();
            let mut settings = state.settings.clone();
            update(&mut settings)?;
            state.alerts.apply_settings(&settings);
            state.settings = settings;
        }
        self.shared.saver.request_save();
        Ok(())
    }

    /// Set the low-fuel notification level in percent.
    pub fn set_notification_level(&self, percent: f64) -> Result<()> {
        self.update_settings(|s| s.set_notification_level(percent))
    }

    /// Set the auto-shutdown level in percent.
    pub fn set_shutdown_level(&self, percent: f64) -> Result<()> {
        self.update_settings(|s| s.set_shutdown_level(percent))
    }

    /// Enable or disable stopping the stove at the shutdown level.
    pub fn set_auto_shutdown(&self, enabled: bool) -> Result<()> {
        self.update_settings(|s| {
            s.auto_shutdown_enabled = enabled;
            Ok(())
        })
    }

    /// Enable or disable resuming pellets after a wood fire.
    ///
    /// Disabling while the stove is in wood mode stops it.
    pub async fn set_auto_resume_after_wood(&self, enabled: bool) -> Result<()> {
        self.update_settings(|s| {
            s.auto_resume_after_wood = enabled;
            Ok(())
        })?;

        let in_wood = self.shared.state.read().wood.in_wood_mode();
        if !enabled && in_wood {
            info!("Auto-resume disabled during wood mode, stopping stove");
            self.stop_stove().await?;
        }
        Ok(())
    }

    /// Set the high smoke temperature threshold.
    pub fn set_high_smoke_temp_threshold(&self, celsius: f64) -> Result<()> {
        self.update_settings(|s| s.set_high_smoke_temp_threshold(celsius))
    }

    /// Set how long the smoke temperature must stay high before alerting.
    pub fn set_high_smoke_duration(&self, secs: u64) -> Result<()> {
        self.update_settings(|s| s.set_high_smoke_duration(secs))
    }

    /// Set the low wood-fire temperature threshold.
    pub fn set_low_wood_temp_threshold(&self, celsius: f64) -> Result<()> {
        self.update_settings(|s| s.set_low_wood_temp_threshold(celsius))
    }

    /// Set how long the wood fire must stay low before alerting.
    pub fn set_low_wood_duration(&self, secs: u64) -> Result<()> {
        self.update_settings(|s| s.set_low_wood_duration(secs))
    }

    /// Record which outdoor sensor the host uses.
    pub fn set_external_temp_sensor(&self, sensor: Option<String>) -> Result<()> {
        self.update_settings(|s| {
            s.external_temp_sensor = sensor;
            Ok(())
        })
    }

    /// Record which forecast source the host uses.
    pub fn set_forecast_source(&self, source: Option<String>) -> Result<()> {
        self.update_settings(|s| {
            s.forecast_source = source;
            Ok(())
        })
    }
}

impl Drop for StoveCoordinator {
    fn drop(&mut self) {
        self.shared.is_running.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::learning::tests::sufficient_learning;
    use crate::data::prediction::PredictionStatus;
    use crate::persistence::MemoryStore;
    use crate::transport::tests::FakeStove;
    use crate::transport::MockOutdoorSensor;
    use std::sync::atomic::AtomicU32;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::new("serial", "pin")
            .with_settle_delay(Duration::ZERO)
            .with_command_retries(1, Duration::ZERO)
    }

    async fn coordinator_with(
        config: CoordinatorConfig,
        stove: &Arc<FakeStove>,
        store: &Arc<MemoryStore>,
    ) -> StoveCoordinator {
        StoveCoordinator::new(config, stove.clone(), store.clone()).await
    }

    async fn coordinator(stove: &Arc<FakeStove>) -> StoveCoordinator {
        coordinator_with(config(), stove, &Arc::new(MemoryStore::new())).await
    }

    fn paths(stove: &FakeStove) -> Vec<String> {
        stove.writes().into_iter().map(|(path, _)| path).collect()
    }

    #[tokio::test]
    async fn test_poll_publishes_snapshot() {
        let stove = Arc::new(FakeStove::new());
        let coordinator = coordinator(&stove).await;
        assert!(coordinator.snapshot().is_none());
        assert!(!coordinator.is_available());

        let snapshot = coordinator.poll().await.unwrap();
        assert_eq!(snapshot.telemetry.heatlevel, 2);
        assert_eq!(snapshot.telemetry.operation_mode, OperationMode::HeatLevel);
        assert_eq!(snapshot.link.host.as_deref(), Some("192.168.1.20"));
        assert_eq!(snapshot.network.as_ref().map(|n| n.ssid.as_str()), Some("HomeNet"));
        assert!(snapshot.consumption.is_some());
        assert!((snapshot.fuel_remaining - 9.5).abs() < 1e-9);
        assert!(!snapshot.fast_polling);
        assert!(coordinator.is_available());
        assert_eq!(coordinator.poll_interval(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_set_heatlevel_sends_mode_then_power() {
        let stove = Arc::new(FakeStove::new());
        let coordinator = coordinator(&stove).await;

        coordinator.set_heatlevel(3).await.unwrap();
        assert_eq!(
            stove.writes(),
            vec![
                ("regulation.operation_mode".to_string(), "0".to_string()),
                ("regulation.fixed_power".to_string(), "100".to_string()),
            ]
        );
        assert!(coordinator.pending_change().change_in_progress);
        assert_eq!(coordinator.poll_interval(), Duration::from_secs(5));

        let snapshot = coordinator.poll().await.unwrap();
        assert_eq!(snapshot.telemetry.heatlevel, 3);
        assert!(!snapshot.pending.change_in_progress);
        assert!(snapshot.fast_polling);
    }

    #[tokio::test]
    async fn test_invalid_heatlevel_sends_nothing() {
        let stove = Arc::new(FakeStove::new());
        let coordinator = coordinator(&stove).await;

        let result = coordinator.set_heatlevel(4).await;
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
        assert!(coordinator.set_temperature(40.0).await.is_err());
        assert!(stove.writes().is_empty());
        assert!(!coordinator.pending_change().change_in_progress);
    }

    #[tokio::test]
    async fn test_rejected_command_clears_pending() {
        let stove = Arc::new(FakeStove::new());
        stove.state.lock().reject_writes = true;
        let coordinator = coordinator(&stove).await;

        let result = coordinator.set_temperature(22.5).await;
        assert!(matches!(result, Err(Error::CommandRejected { .. })));
        // The value command is never sent after the mode command failed.
        assert_eq!(paths(&stove), vec!["regulation.operation_mode"]);
        assert!(!coordinator.pending_change().change_in_progress);
    }

    #[tokio::test]
    async fn test_unconfirmed_change_is_resent() {
        let stove = Arc::new(FakeStove::new());
        stove.state.lock().apply_writes = false;
        let coordinator = coordinator(&stove).await;

        coordinator.set_heatlevel(3).await.unwrap();
        let snapshot = coordinator
            .poll_at(Utc::now() + chrono::Duration::seconds(31))
            .await
            .unwrap();
        coordinator.wait_for_commands().await;

        assert_eq!(snapshot.pending.resend_attempt, 1);
        let writes = stove.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(
            writes[2],
            ("regulation.fixed_power".to_string(), "100".to_string())
        );
    }

    #[tokio::test]
    async fn test_finished_command_tasks_are_pruned() {
        let stove = Arc::new(FakeStove::new());
        stove.state.lock().apply_writes = false;
        let coordinator = coordinator(&stove).await;
        let now = Utc::now();

        coordinator.set_heatlevel(3).await.unwrap();
        coordinator
            .poll_at(now + chrono::Duration::seconds(31))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.shared.command_tasks.lock().len(), 1);

        let snapshot = coordinator
            .poll_at(now + chrono::Duration::seconds(62))
            .await
            .unwrap();
        assert_eq!(snapshot.pending.resend_attempt, 2);
        // The first resend finished and was dropped before the second was queued.
        assert_eq!(coordinator.shared.command_tasks.lock().len(), 1);

        coordinator.wait_for_commands().await;
        assert_eq!(stove.writes().len(), 4);
    }

    #[tokio::test]
    async fn test_manual_use_saves_without_start() {
        let stove = Arc::new(FakeStove::new());
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator_with(config(), &stove, &store).await;
        assert!(!coordinator.is_running());

        coordinator.set_pellet_capacity(11.0).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.save_count() >= 1);
        let restored = PersistedState::from_json(&store.blob().unwrap()).unwrap();
        assert!((restored.consumption.fuel().capacity - 11.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_change_abandoned_after_total_timeout() {
        let stove = Arc::new(FakeStove::new());
        stove.state.lock().apply_writes = false;
        let mut config = config();
        config.max_resends = 0;
        let coordinator = coordinator_with(config, &stove, &Arc::new(MemoryStore::new())).await;

        coordinator.set_heatlevel(1).await.unwrap();
        let snapshot = coordinator
            .poll_at(Utc::now() + chrono::Duration::seconds(121))
            .await
            .unwrap();
        coordinator.wait_for_commands().await;

        assert!(!snapshot.pending.change_in_progress);
        assert_eq!(snapshot.telemetry.heatlevel, 2);
        assert_eq!(stove.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_external_stop_clears_pending() {
        let stove = Arc::new(FakeStove::new());
        stove.state.lock().apply_writes = false;
        let coordinator = coordinator(&stove).await;

        coordinator.poll().await.unwrap();
        coordinator.set_heatlevel(3).await.unwrap();
        stove.state.lock().state_code = 14;

        let snapshot = coordinator.poll().await.unwrap();
        assert!(snapshot.auto_stop_detected);
        assert!(!snapshot.pending.change_in_progress);
        assert_eq!(snapshot.pending.target_heatlevel, None);
    }

    #[tokio::test]
    async fn test_toggle_keeps_current_value() {
        let stove = Arc::new(FakeStove::new());
        let coordinator = coordinator(&stove).await;

        assert!(matches!(coordinator.toggle_mode().await, Err(Error::NoTelemetry)));

        coordinator.poll().await.unwrap();
        coordinator.toggle_mode().await.unwrap();
        assert_eq!(
            stove.writes(),
            vec![("regulation.operation_mode".to_string(), "1".to_string())]
        );
        let pending = coordinator.pending_change();
        assert!(pending.toggle_in_progress);
        assert_eq!(pending.target_temperature, Some(21.0));

        let snapshot = coordinator.poll().await.unwrap();
        assert_eq!(snapshot.telemetry.operation_mode, OperationMode::Temperature);
        assert!(!snapshot.pending.change_in_progress);
    }

    #[tokio::test]
    async fn test_critical_fuel_stops_stove() {
        let stove = Arc::new(FakeStove::new());
        stove.state.lock().day_counter = 1.95;
        let coordinator = coordinator(&stove).await;
        coordinator.set_auto_shutdown(true).unwrap();
        coordinator.set_pellet_capacity(2.0).unwrap();

        let snapshot = coordinator.poll().await.unwrap();
        coordinator.wait_for_commands().await;

        assert!(snapshot.fired_alerts.contains(&AlertKind::LowFuel));
        assert!(snapshot.fired_alerts.contains(&AlertKind::CriticalFuel));
        assert!((snapshot.fuel_percentage - 2.5).abs() < 1e-9);
        assert_eq!(paths(&stove), vec!["misc.stop"]);

        // Latched until refill.
        let snapshot = coordinator.poll().await.unwrap();
        coordinator.wait_for_commands().await;
        assert!(snapshot.fired_alerts.is_empty());
        assert_eq!(stove.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_wood_fire_resumes_pellets() {
        let stove = Arc::new(FakeStove::new());
        let coordinator = coordinator(&stove).await;
        coordinator.set_auto_resume_after_wood(true).await.unwrap();

        coordinator.poll().await.unwrap();
        {
            let mut state = stove.state.lock();
            state.state_code = 9;
            state.smoke_temp = 100.0;
        }
        let snapshot = coordinator.poll().await.unwrap();
        coordinator.wait_for_commands().await;

        assert_eq!(snapshot.pre_wood.map(|s| s.heatlevel), Some(2));
        assert_eq!(
            stove.writes(),
            vec![
                ("misc.start".to_string(), "1".to_string()),
                ("regulation.operation_mode".to_string(), "0".to_string()),
                ("regulation.fixed_power".to_string(), "50".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_disabling_auto_resume_in_wood_stops_stove() {
        let stove = Arc::new(FakeStove::new());
        stove.state.lock().state_code = 9;
        let coordinator = coordinator(&stove).await;

        coordinator.poll().await.unwrap();
        coordinator.set_auto_resume_after_wood(false).await.unwrap();
        assert_eq!(paths(&stove), vec!["misc.stop"]);
        assert!(!coordinator.settings().auto_resume_after_wood);
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_snapshot_and_rediscovers() {
        let stove = Arc::new(FakeStove::new());
        let coordinator = coordinator(&stove).await;

        coordinator.poll().await.unwrap();
        stove.state.lock().fail_reads = true;
        let result = coordinator.poll().await;
        assert!(matches!(result, Err(Error::PollFailed { .. })));
        assert!(!coordinator.is_available());
        assert!(coordinator.snapshot().is_some());

        stove.state.lock().fail_reads = false;
        coordinator.poll().await.unwrap();
        assert!(coordinator.is_available());
        assert_eq!(stove.discoveries(), 2);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let stove = Arc::new(FakeStove::new());
        stove.state.lock().day_counter = 2.0;
        let store = Arc::new(MemoryStore::new());

        let first = coordinator_with(config(), &stove, &store).await;
        first.set_pellet_capacity(12.0).unwrap();
        first.set_notification_level(20.0).unwrap();
        first.poll().await.unwrap();
        first.save().await;
        assert!(store.blob().is_some());

        let second = coordinator_with(config(), &stove, &store).await;
        let fuel = second.fuel();
        assert!((fuel.capacity - 12.0).abs() < 1e-9);
        assert!((fuel.consumed_since_refill - 2.0).abs() < 1e-9);
        assert!((second.settings().notification_level - 20.0).abs() < 1e-9);

        second.refill();
        assert!(second.fuel().consumed_since_refill.abs() < 1e-9);
        assert!((second.fuel().consumed_since_cleaning - 2.0).abs() < 1e-9);
        assert!(second.set_pellet_capacity(-1.0).is_err());
    }

    #[tokio::test]
    async fn test_predict_depletion() {
        let stove = Arc::new(FakeStove::new());
        let coordinator = coordinator(&stove).await;
        assert!(matches!(
            coordinator.predict_depletion().await,
            Err(Error::NoTelemetry)
        ));

        coordinator.poll().await.unwrap();
        let prediction = coordinator.predict_depletion().await.unwrap();
        assert_eq!(prediction.status, PredictionStatus::InsufficientData);
    }

    #[tokio::test]
    async fn test_predict_depletion_with_learned_rates() {
        let persisted = PersistedState {
            learning: sufficient_learning([0.5, 1.0, 1.5], Utc::now()),
            ..PersistedState::default()
        };
        let store = Arc::new(MemoryStore::with_blob(persisted.to_json().unwrap()));
        let stove = Arc::new(FakeStove::new());
        let coordinator = coordinator_with(config(), &stove, &store).await;

        let mut sensor = MockOutdoorSensor::new();
        sensor.expect_temperature().return_const(Some(-3.0));
        coordinator.set_outdoor_sensor(Some(Arc::new(sensor)));

        coordinator.poll().await.unwrap();
        let prediction = coordinator.predict_depletion().await.unwrap();
        assert_eq!(prediction.status, PredictionStatus::Ok);
        // 9.5 kg at 1.0 kg/h.
        assert_eq!(prediction.time_remaining_seconds, 34_200);
        assert_eq!(prediction.conditions.outdoor_temp, Some(-3.0));
    }

    #[tokio::test]
    async fn test_on_snapshot_callback() {
        let stove = Arc::new(FakeStove::new());
        let coordinator = coordinator(&stove).await;
        let count = Arc::new(AtomicU32::new(0));

        let counter = count.clone();
        let handle = coordinator.on_snapshot(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coordinator.poll().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.unregister();
        coordinator.poll().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let stove = Arc::new(FakeStove::new());
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator_with(config(), &stove, &store).await;
        let mut rx = coordinator.subscribe();

        coordinator.start();
        assert!(coordinator.is_running());
        let snapshot = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.telemetry.heatlevel, 2);

        coordinator.stop().await;
        assert!(!coordinator.is_running());
        assert!(store.save_count() >= 1);
    }
}
