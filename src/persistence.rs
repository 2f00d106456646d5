//! Persisted coordinator state.
//!
//! Fuel counters, user settings, learning data and monthly consumption
//! snapshots are written as one versioned JSON document through a
//! [`BlobStore`]. Saves are requested by setting a dirty flag; a single
//! background task drains it so bursts of requests collapse into one write.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::data::fuel::ConsumptionTracker;
use crate::data::history::ConsumptionHistory;
use crate::data::learning::LearningData;
use crate::data::settings::UserSettings;
use crate::error::{Error, Result};

/// Current document version.
pub const STATE_VERSION: u32 = 1;

/// Everything that survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Document version.
    pub version: u32,
    /// Fuel counters, baselines and the learning consumption accumulator.
    pub consumption: ConsumptionTracker,
    /// User settings.
    pub settings: UserSettings,
    /// Learned rates.
    pub learning: LearningData,
    /// Monthly consumption snapshots.
    pub history: ConsumptionHistory,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            consumption: ConsumptionTracker::default(),
            settings: UserSettings::default(),
            learning: LearningData::default(),
            history: ConsumptionHistory::default(),
        }
    }
}

impl PersistedState {
    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(json)?;
        if state.version > STATE_VERSION {
            return Err(Error::Persistence {
                context: format!(
                    "state version {} is newer than supported version {}",
                    state.version, STATE_VERSION
                ),
            });
        }
        Ok(state)
    }
}

/// Storage for the persisted document.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Load the stored document, `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<String>>;

    /// Replace the stored document.
    async fn save(&self, blob: String) -> Result<()>;
}

/// Stores the document in a file, replacing it atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file the document is written to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlobStore for JsonFileStore {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, blob: String) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Keeps the document in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: RwLock<Option<String>>,
    saves: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `blob`.
    pub fn with_blob(blob: impl Into<String>) -> Self {
        Self {
            blob: RwLock::new(Some(blob.into())),
            saves: AtomicU32::new(0),
        }
    }

    /// The stored document.
    pub fn blob(&self) -> Option<String> {
        self.blob.read().clone()
    }

    /// Number of saves so far.
    pub fn save_count(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.blob())
    }

    async fn save(&self, blob: String) -> Result<()> {
        *self.blob.write() = Some(blob);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Load the document from `store`.
///
/// A missing or unreadable document yields the defaults; the error is
/// logged rather than returned so a corrupt file never blocks startup.
pub async fn load_state(store: &dyn BlobStore) -> PersistedState {
    let blob = match store.load().await {
        Ok(Some(blob)) => blob,
        Ok(None) => {
            info!("No saved state, starting fresh");
            return PersistedState::default();
        }
        Err(e) => {
            error!("Failed to load saved state: {}", e);
            return PersistedState::default();
        }
    };

    match PersistedState::from_json(&blob) {
        Ok(state) => {
            info!(
                "Loaded saved state: {:.2} kg since refill, {} startups learned",
                state.consumption.fuel().consumed_since_refill,
                state.learning.startup.count
            );
            state
        }
        Err(e) => {
            error!("Saved state is unreadable, starting fresh: {}", e);
            PersistedState::default()
        }
    }
}

type Snapshot = dyn Fn() -> PersistedState + Send + Sync;

/// Background saver draining a dirty flag.
pub struct StateSaver {
    /// Where the document goes.
    store: Arc<dyn BlobStore>,
    /// Produces the document to save.
    snapshot: Arc<Snapshot>,
    /// Set when a save was requested.
    dirty: Arc<AtomicBool>,
    /// Wakes the background task.
    notify: Arc<Notify>,
    /// Serializes writes.
    save_lock: Arc<Mutex<()>>,
    /// Running flag.
    is_running: Arc<AtomicBool>,
    /// Background task handle.
    handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl StateSaver {
    /// Create a saver writing whatever `snapshot` returns to `store`.
    pub fn new(
        store: Arc<dyn BlobStore>,
        snapshot: impl Fn() -> PersistedState + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            snapshot: Arc::new(snapshot),
            dirty: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            save_lock: Arc::new(Mutex::new(())),
            is_running: Arc::new(AtomicBool::new(false)),
            handle: RwLock::new(None),
        }
    }

    /// Ask for a save. Returns immediately.
    pub fn request_save(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Whether a requested save has not been written yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Start the background task.
    pub fn start(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let store = self.store.clone();
        let snapshot = self.snapshot.clone();
        let dirty = self.dirty.clone();
        let notify = self.notify.clone();
        let save_lock = self.save_lock.clone();
        let is_running = self.is_running.clone();

        let handle = tokio::spawn(async move {
            while is_running.load(Ordering::SeqCst) {
                notify.notified().await;
                Self::drain(&*store, &*snapshot, &dirty, &save_lock).await;
            }
            debug!("State saver task ended");
        });

        *self.handle.write() = Some(handle);
    }

    /// Stop the background task and write any pending save.
    pub async fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush().await;
    }

    /// Write a pending save now.
    pub async fn flush(&self) {
        Self::drain(&*self.store, &*self.snapshot, &self.dirty, &self.save_lock).await;
    }

    async fn drain(
        store: &dyn BlobStore,
        snapshot: &Snapshot,
        dirty: &AtomicBool,
        save_lock: &Mutex<()>,
    ) {
        while dirty.swap(false, Ordering::SeqCst) {
            let _guard = save_lock.lock().await;
            let blob = match snapshot().to_json() {
                Ok(blob) => blob,
                Err(e) => {
                    error!("Failed to encode state: {}", e);
                    return;
                }
            };
            match store.save(blob).await {
                Ok(()) => debug!("Saved state"),
                Err(e) => warn!("Failed to save state: {}", e),
            }
        }
    }
}

impl Drop for StateSaver {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::learning::tests::sufficient_learning;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn populated() -> PersistedState {
        let mut state = PersistedState::default();
        state.consumption.update(3.25);
        state.consumption.update_learning(1.0);
        state.consumption.set_capacity(15.0).unwrap();
        state.settings.set_notification_level(20.0).unwrap();
        state.settings.auto_shutdown_enabled = true;
        state.learning = sufficient_learning([0.5, 1.0, 1.5], now());
        let months = [120.0, 80.0, 0.002, 0.002, 0.002, 0.002, 0.002, 0.002, 0.002, 0.002, 30.0, 90.0];
        state.history.update(
            &[],
            &months,
            &[],
            chrono::NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
        );
        state
    }

    #[test]
    fn test_document_survives_reload() {
        let state = populated();
        let restored = PersistedState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let restored = PersistedState::from_json(r#"{"version": 1, "settings": {"shutdown_level": 7.5}}"#).unwrap();
        assert_eq!(restored.settings.shutdown_level, 7.5);
        assert_eq!(restored.settings.notification_level, 10.0);
        assert_eq!(restored.consumption, ConsumptionTracker::default());
        assert_eq!(restored.learning, LearningData::default());
    }

    #[test]
    fn test_newer_version_rejected() {
        let result = PersistedState::from_json(r#"{"version": 2}"#);
        assert!(matches!(result, Err(Error::Persistence { .. })));
    }

    #[tokio::test]
    async fn test_load_falls_back_on_garbage() {
        let store = MemoryStore::with_blob("not json");
        assert_eq!(load_state(&store).await, PersistedState::default());
        assert_eq!(load_state(&MemoryStore::new()).await, PersistedState::default());
    }

    #[tokio::test]
    async fn test_file_store_replaces_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state").join("aduro.json"));

        assert_eq!(store.load().await.unwrap(), None);
        store.save("first".to_string()).await.unwrap();
        store.save(populated().to_json().unwrap()).await.unwrap();

        assert_eq!(load_state(&store).await, populated());
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_saver_collapses_requests() {
        let store = Arc::new(MemoryStore::new());
        let saver = StateSaver::new(store.clone(), populated);

        saver.request_save();
        saver.request_save();
        saver.request_save();
        assert!(saver.is_dirty());
        saver.flush().await;

        assert_eq!(store.save_count(), 1);
        assert!(!saver.is_dirty());
        assert_eq!(load_state(&*store).await, populated());

        saver.flush().await;
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_background_saver_writes_on_stop() {
        let store = Arc::new(MemoryStore::new());
        let saver = StateSaver::new(store.clone(), PersistedState::default);
        saver.start();

        saver.request_save();
        saver.stop().await;
        assert_eq!(store.save_count(), 1);
    }
}
