use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::events::{EventBus, HistoryEvent};
use crate::export::strip_control_sequences;
use crate::recorder::{RecorderState, SessionRecorder};
use crate::retention::{
    CleanupReport, RetentionPolicy, RetentionSettings, RetentionUpdate, StorageStats,
};
use crate::session::{HistoryDocument, SessionRecord};
use crate::settings::{JsonFileStore, SettingsStore};
use crate::storage::{self, atomic_write, StorageEngine};
use crate::HistoryError;

/// Key the history document lives under in the settings store.
pub const HISTORY_KEY: &str = "history";

struct ActiveSession {
    recorder: SessionRecorder,
    tab_id: String,
    cwd: String,
    start_time: i64,
    metadata: Option<Value>,
}

struct ManagerState {
    active: HashMap<String, ActiveSession>,
    /// Most recent first; only committed sessions.
    sessions: Vec<SessionRecord>,
    retention: RetentionPolicy,
    events: EventBus,
    /// Relative file paths reserved by an `end_session` still writing.
    claimed: HashSet<String>,
    destroyed: bool,
}

impl ManagerState {
    fn find(&self, session_id: &str) -> crate::Result<SessionRecord> {
        self.sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(format!("session {}", session_id)))
    }
}

/// Owns the in-flight recorders and the committed session list, and drives
/// recorder -> storage -> retention for every finished session.
///
/// State sits behind one mutex that is never held across an await, so the
/// list only ever changes in single read-modify-write steps.
pub struct HistoryManager {
    config: HistoryConfig,
    storage: StorageEngine,
    store: Arc<dyn SettingsStore>,
    state: Mutex<ManagerState>,
}

impl HistoryManager {
    /// Opens the manager backed by the JSON settings file from `config`.
    pub fn open(config: HistoryConfig) -> crate::Result<Self> {
        let store = JsonFileStore::open(&config.settings_file)?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: HistoryConfig, store: Arc<dyn SettingsStore>) -> crate::Result<Self> {
        let document = match store.get(HISTORY_KEY)? {
            Some(value) => serde_json::from_value::<HistoryDocument>(value)?,
            None => HistoryDocument::default(),
        };

        let storage = StorageEngine::new(&config.data_dir);
        std::fs::create_dir_all(storage.history_dir()).map_err(|e| {
            HistoryError::Storage(format!("{}: {}", storage.history_dir().display(), e))
        })?;

        debug!(
            "loaded {} sessions from {}",
            document.sessions.len(),
            config.data_dir.display()
        );
        Ok(Self {
            storage,
            store,
            state: Mutex::new(ManagerState {
                active: HashMap::new(),
                sessions: document.sessions,
                retention: RetentionPolicy::new(document.settings),
                events: EventBus::new(),
                claimed: HashSet::new(),
                destroyed: false,
            }),
            config,
        })
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    fn lock(&self) -> crate::Result<MutexGuard<'_, ManagerState>> {
        self.state
            .lock()
            .map_err(|e| HistoryError::Storage(e.to_string()))
    }

    fn persist(&self, document: &HistoryDocument) -> crate::Result<()> {
        self.store.set(HISTORY_KEY, serde_json::to_value(document)?)
    }

    /// Writes the new document to the store and only then installs it, so a
    /// failed write leaves the in-memory state exactly as it was.
    fn commit(
        &self,
        state: &mut ManagerState,
        sessions: Vec<SessionRecord>,
        settings: RetentionSettings,
    ) -> crate::Result<usize> {
        let document = HistoryDocument { sessions, settings };
        self.persist(&document)?;
        state.retention.set_settings(document.settings);
        state.sessions = document.sessions;
        Ok(state.sessions.len())
    }

    fn emit(&self, event: HistoryEvent) {
        if let Ok(state) = self.lock() {
            state.events.emit(event);
        }
    }

    pub fn subscribe(&self) -> crate::Result<broadcast::Receiver<HistoryEvent>> {
        Ok(self.lock()?.events.subscribe())
    }

    // Session lifecycle

    /// Returns `None` without creating anything while capture is disabled.
    pub fn start_session(
        &self,
        tab_id: &str,
        cwd: &str,
        metadata: Option<Value>,
    ) -> crate::Result<Option<String>> {
        storage::partition_key(cwd)?;

        let mut state = self.lock()?;
        if state.destroyed {
            debug!("manager shut down, not recording tab {}", tab_id);
            return Ok(None);
        }
        if !state.retention.settings().enabled {
            debug!("capture disabled, not recording tab {}", tab_id);
            return Ok(None);
        }

        let recorder = SessionRecorder::with_cap(self.config.buffer_cap);
        let start_time = recorder.started_at().timestamp_millis();
        let session_id = Uuid::new_v4().to_string();
        state.active.insert(
            session_id.clone(),
            ActiveSession {
                recorder,
                tab_id: tab_id.to_string(),
                cwd: cwd.to_string(),
                start_time,
                metadata,
            },
        );
        state.events.emit(HistoryEvent::SessionStarted {
            session_id: session_id.clone(),
            tab_id: tab_id.to_string(),
            cwd: cwd.to_string(),
        });
        info!("started session {} for {}", session_id, cwd);
        Ok(Some(session_id))
    }

    /// Unknown or finished sessions are ignored. A recorder that fails to
    /// buffer is aborted so it cannot affect anything else.
    pub fn capture_output(&self, session_id: &str, data: &[u8]) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        let failed = match state.active.get_mut(session_id) {
            Some(active) if active.recorder.state() == RecorderState::Active => {
                active.recorder.write(data).err()
            }
            _ => None,
        };
        if let Some(e) = failed {
            warn!("capture failed for session {}, aborting: {}", session_id, e);
            if let Some(mut active) = state.active.remove(session_id) {
                active.recorder.abort();
            }
        }
    }

    /// Compresses, stores and commits the session, then runs a retention
    /// pass. The recorder leaves the active table before anything else, so
    /// a second call for the same id fails with `NotFound` even while the
    /// first is still writing.
    pub async fn end_session(&self, session_id: &str, exit_code: i32) -> crate::Result<SessionRecord> {
        let active = self
            .lock()?
            .active
            .remove(session_id)
            .ok_or_else(|| HistoryError::NotFound(format!("active session {}", session_id)))?;
        let ActiveSession {
            mut recorder,
            tab_id,
            cwd,
            start_time,
            metadata,
        } = active;

        let capture = tokio::task::spawn_blocking(move || recorder.finalize(exit_code))
            .await
            .map_err(|e| HistoryError::Unknown(e.to_string()))??;

        let partition_key = storage::partition_key(&cwd)?;
        let (start_time, path) = self.claim_path(&cwd, start_time).await?;
        let file_path = path.to_string_lossy().replace('\\', "/");
        if let Err(e) = self.storage.write_session(&path, &capture.compressed).await {
            self.release_path(&file_path);
            warn!("failed to store session {}: {}", session_id, e);
            return Err(e);
        }

        let record = SessionRecord {
            id: session_id.to_string(),
            tab_id,
            partition_key,
            display_name: storage::display_name(&cwd),
            cwd,
            start_time,
            end_time: start_time + capture.duration_ms,
            duration: capture.duration_ms,
            exit_code: capture.exit_code,
            uncompressed_size: capture.uncompressed_size,
            compressed_size: capture.compressed_size,
            file_path: file_path.clone(),
            truncated: capture.truncated,
            metadata,
        };
        info!(
            "ended session {} (exit {}, {} -> {} bytes)",
            record.id, record.exit_code, record.uncompressed_size, record.compressed_size
        );

        let committed = self.apply_retention(Some(record.clone())).await;
        if let Err(e) = &committed {
            warn!("failed to commit session {}: {}", session_id, e);
            if let Err(e) = self.storage.delete_session(&path).await {
                warn!("could not roll back {}: {}", file_path, e);
            }
        }
        self.release_path(&file_path);
        let (_, session_count) = committed?;
        self.emit(HistoryEvent::SessionEnded {
            record: record.clone(),
        });
        self.emit(HistoryEvent::HistoryUpdated { session_count });
        Ok(record)
    }

    /// Two sessions of one directory starting in the same millisecond would
    /// share a file; later ones move forward a millisecond at a time. The
    /// returned path stays reserved until [`Self::release_path`].
    async fn claim_path(&self, cwd: &str, mut start_time: i64) -> crate::Result<(i64, PathBuf)> {
        loop {
            let path = storage::session_path(cwd, start_time)?;
            let relative = path.to_string_lossy().replace('\\', "/");
            let reserved = {
                let mut state = self.lock()?;
                let listed = state.sessions.iter().any(|s| s.file_path == relative);
                !listed && state.claimed.insert(relative.clone())
            };
            if reserved {
                if !self.storage.exists(&path).await {
                    return Ok((start_time, path));
                }
                self.release_path(&relative);
            }
            debug!("{} already taken, shifting start time", relative);
            start_time += 1;
        }
    }

    fn release_path(&self, relative: &str) {
        if let Ok(mut state) = self.lock() {
            state.claimed.remove(relative);
        }
    }

    /// Drops the session without producing a record. Returns whether a
    /// session was registered under `session_id`.
    pub fn abort_session(&self, session_id: &str) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        match state.active.remove(session_id) {
            Some(mut active) => {
                active.recorder.abort();
                info!("aborted session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.lock().map(|s| s.active.len()).unwrap_or(0)
    }

    pub fn is_capturing(&self, session_id: &str) -> bool {
        self.lock()
            .map(|s| s.active.contains_key(session_id))
            .unwrap_or(false)
    }

    // Retention

    async fn apply_retention(&self, record: Option<SessionRecord>) -> crate::Result<(CleanupReport, usize)> {
        let (plan, policy, session_count) = {
            let mut state = self.lock()?;
            let mut sessions = state.sessions.clone();
            if let Some(record) = record {
                sessions.insert(0, record);
            }
            let plan = state.retention.calculate_cleanup(&sessions);
            let settings = state.retention.settings();
            let session_count = self.commit(&mut state, plan.to_keep.clone(), settings)?;
            (plan, state.retention.clone(), session_count)
        };

        // Files are only touched once the shorter list is durable.
        let report = policy.execute_cleanup(&plan.to_delete, &self.storage).await;
        self.storage.prune_empty_directories().await;
        if !plan.to_delete.is_empty() {
            info!(
                "retention removed {} sessions, reclaimed {} bytes, {} errors",
                report.deleted_count,
                report.reclaimed_bytes,
                report.errors.len()
            );
        }
        Ok((report, session_count))
    }

    /// Runs a retention pass outside of a session ending.
    pub async fn run_retention(&self) -> crate::Result<CleanupReport> {
        let (report, session_count) = self.apply_retention(None).await?;
        if report.deleted_count > 0 || !report.errors.is_empty() {
            self.emit(HistoryEvent::HistoryUpdated { session_count });
        }
        Ok(report)
    }

    pub fn storage_stats(&self) -> crate::Result<StorageStats> {
        let state = self.lock()?;
        Ok(state.retention.storage_stats(&state.sessions))
    }

    // Queries

    pub fn get_all_sessions(&self, limit: Option<usize>, offset: usize) -> Vec<SessionRecord> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        state
            .sessions
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn get_sessions_for_cwd(&self, cwd: &str, limit: Option<usize>) -> crate::Result<Vec<SessionRecord>> {
        let key = storage::partition_key(cwd)?;
        let state = self.lock()?;
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.partition_key == key)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    pub fn get_session_by_id(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().ok()?.find(session_id).ok()
    }

    // Actions

    pub async fn read_session(&self, session_id: &str) -> crate::Result<Vec<u8>> {
        let record = self.lock()?.find(session_id)?;
        self.storage.read_session(Path::new(&record.file_path)).await
    }

    /// Writes the session as plain text with terminal control sequences removed.
    pub async fn export_session(&self, session_id: &str, dest: &Path) -> crate::Result<()> {
        let raw = self.read_session(session_id).await?;
        let text = strip_control_sequences(&raw);
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        atomic_write(dest, text.as_bytes()).await?;
        info!("exported session {} to {}", session_id, dest.display());
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> crate::Result<()> {
        let (record, session_count) = {
            let mut state = self.lock()?;
            let record = state.find(session_id)?;
            let remaining = state
                .sessions
                .iter()
                .filter(|s| s.id != session_id)
                .cloned()
                .collect();
            let settings = state.retention.settings();
            (record, self.commit(&mut state, remaining, settings)?)
        };
        self.emit(HistoryEvent::SessionDeleted {
            session_id: session_id.to_string(),
        });
        self.emit(HistoryEvent::HistoryUpdated { session_count });

        self.storage
            .delete_session(Path::new(&record.file_path))
            .await
            .inspect_err(|e| warn!("session {} dropped but file remains: {}", session_id, e))
    }

    /// Empties the store. File removal is best-effort; returns how many
    /// sessions were dropped from the list.
    pub async fn clear_all_history(&self) -> crate::Result<usize> {
        let removed = {
            let mut state = self.lock()?;
            let removed = state.sessions.clone();
            let settings = state.retention.settings();
            self.commit(&mut state, Vec::new(), settings)?;
            removed
        };

        for record in &removed {
            if let Err(e) = self.storage.delete_session(Path::new(&record.file_path)).await {
                warn!("could not delete {}: {}", record.file_path, e);
            }
        }
        self.storage.prune_empty_directories().await;
        info!("cleared {} sessions", removed.len());
        self.emit(HistoryEvent::HistoryUpdated { session_count: 0 });
        Ok(removed.len())
    }

    // Settings

    pub fn get_retention_settings(&self) -> crate::Result<RetentionSettings> {
        Ok(self.lock()?.retention.settings())
    }

    /// Applies the update with clamping and persists it. Takes effect for
    /// the next retention pass and the next `start_session`.
    pub fn update_retention_settings(&self, update: RetentionUpdate) -> crate::Result<RetentionSettings> {
        let settings = {
            let mut state = self.lock()?;
            let current = state.retention.settings();
            let settings = RetentionSettings {
                max_age_days: update.max_age_days.unwrap_or(current.max_age_days),
                max_size_mb: update.max_size_mb.unwrap_or(current.max_size_mb),
                enabled: update.enabled.unwrap_or(current.enabled),
            }
            .clamped();
            let sessions = state.sessions.clone();
            self.commit(&mut state, sessions, settings)?;
            state.retention.settings()
        };
        info!(
            "retention settings: {} days, {} MB, enabled={}",
            settings.max_age_days, settings.max_size_mb, settings.enabled
        );
        Ok(settings)
    }

    /// Aborts every in-flight session and closes the event channel. Later
    /// `start_session` calls return `None`.
    pub fn destroy(&self) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        state.destroyed = true;
        let aborted = state.active.len();
        for (_, mut active) in state.active.drain() {
            active.recorder.abort();
        }
        state.events.close();
        if aborted > 0 {
            warn!("shutdown aborted {} active sessions", aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::TRUNCATION_MARKER;
    use crate::settings::MemoryStore;
    use tempfile::TempDir;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    /// Memory store whose writes can be switched off.
    #[derive(Default)]
    struct UnreliableStore {
        inner: MemoryStore,
        offline: AtomicBool,
    }

    impl SettingsStore for UnreliableStore {
        fn get(&self, key: &str) -> crate::Result<Option<Value>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: Value) -> crate::Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(HistoryError::Storage("settings store offline".to_string()));
            }
            self.inner.set(key, value)
        }
    }

    fn manager(tmp_dir: &TempDir) -> HistoryManager {
        HistoryManager::with_store(
            HistoryConfig::with_data_dir(tmp_dir.path()),
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<HistoryEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_capture_roundtrip() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let mut rx = manager.subscribe().unwrap();

        let id = manager
            .start_session("tab-1", "/tmp/proj", None)
            .unwrap()
            .unwrap();
        for chunk in ["a", "b", "c"] {
            manager.capture_output(&id, chunk.as_bytes());
        }
        let record = manager.end_session(&id, 0).await.unwrap();

        assert_eq!(record.uncompressed_size, 3);
        assert_eq!(record.exit_code, 0);
        assert_eq!(record.display_name, "proj");
        assert_eq!(
            record.file_path,
            format!(
                "history/{}/{}.gz",
                storage::partition_key("/tmp/proj").unwrap(),
                record.start_time
            )
        );
        assert_eq!(manager.read_session(&id).await.unwrap(), b"abc");
        assert_eq!(manager.get_all_sessions(None, 0), vec![record]);
        assert_eq!(
            drain(&mut rx),
            vec!["session-started", "session-ended", "history-updated"]
        );
    }

    #[tokio::test]
    async fn test_end_twice_is_not_found() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        manager.end_session(&id, 0).await.unwrap();

        let err = manager.end_session(&id, 0).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(manager.get_all_sessions(None, 0).len(), 1);
    }

    #[tokio::test]
    async fn test_abort_leaves_no_trace() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        manager.capture_output(&id, b"some output");

        assert!(manager.abort_session(&id));
        assert!(!manager.abort_session(&id));
        assert!(!manager.is_capturing(&id));
        assert!(manager.get_all_sessions(None, 0).is_empty());
        assert!(manager.end_session(&id, 0).await.unwrap_err().is_not_found());

        let partitions = std::fs::read_dir(manager.storage().history_dir()).unwrap().count();
        assert_eq!(partitions, 0);
    }

    #[tokio::test]
    async fn test_buffer_cap_through_manager() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = HistoryManager::with_store(
            HistoryConfig::with_data_dir(tmp_dir.path()).buffer_cap(4096),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        for _ in 0..100 {
            manager.capture_output(&id, &[b'z'; 256]);
        }
        let record = manager.end_session(&id, 0).await.unwrap();

        assert!(record.truncated);
        assert!(record.uncompressed_size <= 4096);
        let data = manager.read_session(&id).await.unwrap();
        assert!(data.starts_with(TRUNCATION_MARKER.as_bytes()));
    }

    #[tokio::test]
    async fn test_disabled_capture_returns_none() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        manager
            .update_retention_settings(RetentionUpdate {
                enabled: Some(false),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(manager.start_session("t", "/tmp/proj", None).unwrap(), None);
        assert_eq!(manager.active_session_count(), 0);
        assert!(matches!(
            manager.start_session("t", "", None),
            Err(HistoryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_queries() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let mut ids = Vec::new();
        for cwd in ["/work/a", "/work/b", "/WORK/A/"] {
            let id = manager
                .start_session("t", cwd, Some(serde_json::json!({"shell": "zsh"})))
                .unwrap()
                .unwrap();
            manager.capture_output(&id, cwd.as_bytes());
            manager.end_session(&id, 0).await.unwrap();
            ids.push(id);
        }

        let all = manager.get_all_sessions(None, 0);
        let listed: Vec<_> = all.iter().map(|s| s.id.clone()).collect();
        assert_eq!(listed, vec![ids[2].clone(), ids[1].clone(), ids[0].clone()]);
        assert_eq!(manager.get_all_sessions(Some(1), 1)[0].id, ids[1]);
        assert!(manager.get_all_sessions(Some(5), 10).is_empty());

        let for_a = manager.get_sessions_for_cwd("/work/a", None).unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(manager.get_sessions_for_cwd("/work/a", Some(1)).unwrap().len(), 1);

        let record = manager.get_session_by_id(&ids[1]).unwrap();
        assert_eq!(record.cwd, "/work/b");
        assert_eq!(record.metadata, Some(serde_json::json!({"shell": "zsh"})));
        assert!(manager.get_session_by_id("nope").is_none());
    }

    #[tokio::test]
    async fn test_same_millisecond_sessions_get_distinct_files() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let first = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        let second = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        let shared = chrono::Utc::now().timestamp_millis();
        {
            let mut state = manager.lock().unwrap();
            state.active.get_mut(&first).unwrap().start_time = shared;
            state.active.get_mut(&second).unwrap().start_time = shared;
        }
        manager.capture_output(&first, b"one");
        manager.capture_output(&second, b"two");

        let a = manager.end_session(&first, 0).await.unwrap();
        let b = manager.end_session(&second, 0).await.unwrap();
        assert_eq!(a.start_time, shared);
        assert_eq!(b.start_time, shared + 1);
        assert_ne!(a.file_path, b.file_path);
        assert_eq!(manager.read_session(&first).await.unwrap(), b"one");
        assert_eq!(manager.read_session(&second).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_end_session_applies_age_retention() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let old = manager.start_session("t", "/tmp/old", None).unwrap().unwrap();
        manager.lock().unwrap().active.get_mut(&old).unwrap().start_time = 1_000;
        // an ancient session commits and is immediately evicted by age
        let record = manager.end_session(&old, 0).await.unwrap();
        assert!(manager.get_session_by_id(&old).is_none());
        assert!(!manager.storage().exists(Path::new(&record.file_path)).await);
        let partition = manager.storage().resolve(Path::new(&record.file_path));
        assert!(!partition.parent().unwrap().exists());

        let fresh = manager.start_session("t", "/tmp/new", None).unwrap().unwrap();
        manager.end_session(&fresh, 0).await.unwrap();
        assert_eq!(manager.get_all_sessions(None, 0).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
            manager.capture_output(&id, b"data");
            manager.end_session(&id, 0).await.unwrap();
            ids.push(id);
        }
        let mut rx = manager.subscribe().unwrap();

        manager.delete_session(&ids[0]).await.unwrap();
        assert!(manager.get_session_by_id(&ids[0]).is_none());
        assert!(manager.delete_session(&ids[0]).await.unwrap_err().is_not_found());
        assert_eq!(drain(&mut rx), vec!["session-deleted", "history-updated"]);

        assert_eq!(manager.clear_all_history().await.unwrap(), 2);
        assert!(manager.get_all_sessions(None, 0).is_empty());
        assert!(manager.storage().history_dir().exists());
        assert_eq!(
            std::fs::read_dir(manager.storage().history_dir()).unwrap().count(),
            0
        );
        assert_eq!(drain(&mut rx), vec!["history-updated"]);
    }

    #[tokio::test]
    async fn test_read_reports_corruption() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        let record = manager.end_session(&id, 0).await.unwrap();

        std::fs::write(manager.storage().resolve(Path::new(&record.file_path)), b"garbage").unwrap();
        assert!(manager.read_session(&id).await.unwrap_err().is_corrupted());
        assert!(manager.read_session("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_export_strips_control_sequences() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        manager.capture_output(&id, b"\x1b[31merror\x1b[0m: failed\r\n");
        manager.end_session(&id, 1).await.unwrap();

        let dest = tmp_dir.path().join("exports").join("session.txt");
        manager.export_session(&id, &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "error: failed\n");
    }

    #[tokio::test]
    async fn test_settings_persist_and_clamp() {
        let tmp_dir = TempDir::new().unwrap();
        let config = HistoryConfig::with_data_dir(tmp_dir.path());
        {
            let manager = HistoryManager::open(config.clone()).unwrap();
            let settings = manager
                .update_retention_settings(RetentionUpdate {
                    max_age_days: Some(0),
                    max_size_mb: Some(2),
                    enabled: None,
                })
                .unwrap();
            assert_eq!(settings.max_age_days, 1);
            assert_eq!(settings.max_size_mb, 10);
            assert!(settings.enabled);

            let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
            manager.end_session(&id, 3).await.unwrap();
        }

        let reopened = HistoryManager::open(config).unwrap();
        assert_eq!(reopened.get_retention_settings().unwrap().max_size_mb, 10);
        let sessions = reopened.get_all_sessions(None, 0);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].exit_code, 3);
    }

    #[tokio::test]
    async fn test_destroy_aborts_and_closes_listeners() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let mut rx = manager.subscribe().unwrap();
        let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        manager.capture_output(&id, b"unfinished");
        assert_eq!(rx.recv().await.unwrap().name(), "session-started");

        manager.destroy();
        assert_eq!(manager.active_session_count(), 0);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
        assert!(manager.get_all_sessions(None, 0).is_empty());
    }

    #[tokio::test]
    async fn test_run_retention_after_tightening_budget() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        for i in 0..3 {
            let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
            manager.lock().unwrap().active.get_mut(&id).unwrap().start_time =
                chrono::Utc::now().timestamp_millis() - 10_000 + i;
            manager.end_session(&id, 0).await.unwrap();
        }
        // nothing is old or large enough to evict
        let report = manager.run_retention().await.unwrap();
        assert_eq!(report.deleted_count, 0);
        assert_eq!(manager.storage_stats().unwrap().session_count, 3);
        assert!(manager.storage_stats().unwrap().usage_percent < 1.0);
    }

    #[tokio::test]
    async fn test_failed_persist_commits_nothing() {
        let tmp_dir = TempDir::new().unwrap();
        let store = Arc::new(UnreliableStore::default());
        let manager =
            HistoryManager::with_store(HistoryConfig::with_data_dir(tmp_dir.path()), store.clone())
                .unwrap();

        let old = manager.start_session("t", "/tmp/old", None).unwrap().unwrap();
        let old_record = manager.end_session(&old, 0).await.unwrap();
        // old enough that the next pass evicts it
        manager.lock().unwrap().sessions[0].start_time = 1_000;
        store.offline.store(true, Ordering::SeqCst);

        let new = manager.start_session("t", "/tmp/new", None).unwrap().unwrap();
        manager.capture_output(&new, b"never committed");
        let err = manager.end_session(&new, 0).await.unwrap_err();
        assert!(matches!(err, HistoryError::Storage(_)));
        assert!(!manager.is_capturing(&new));
        assert!(manager.get_session_by_id(&new).is_none());
        assert!(manager.get_session_by_id(&old).is_some());
        assert!(manager.storage().exists(Path::new(&old_record.file_path)).await);
        let new_partition = manager
            .storage()
            .history_dir()
            .join(storage::partition_key("/tmp/new").unwrap());
        assert!(!new_partition.exists());
        assert!(manager.lock().unwrap().claimed.is_empty());

        store.offline.store(false, Ordering::SeqCst);
        let report = manager.run_retention().await.unwrap();
        assert_eq!(report.deleted_count, 1);
        assert!(!manager.storage().exists(Path::new(&old_record.file_path)).await);
        assert!(manager.get_all_sessions(None, 0).is_empty());
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_delete_and_settings_unapplied() {
        let tmp_dir = TempDir::new().unwrap();
        let store = Arc::new(UnreliableStore::default());
        let manager =
            HistoryManager::with_store(HistoryConfig::with_data_dir(tmp_dir.path()), store.clone())
                .unwrap();
        let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        let record = manager.end_session(&id, 0).await.unwrap();
        let mut rx = manager.subscribe().unwrap();
        store.offline.store(true, Ordering::SeqCst);

        assert!(manager.delete_session(&id).await.is_err());
        assert!(manager.get_session_by_id(&id).is_some());
        assert!(manager.storage().exists(Path::new(&record.file_path)).await);

        assert!(manager.clear_all_history().await.is_err());
        assert_eq!(manager.get_all_sessions(None, 0).len(), 1);

        let before = manager.get_retention_settings().unwrap();
        assert!(manager
            .update_retention_settings(RetentionUpdate {
                max_age_days: Some(2),
                ..Default::default()
            })
            .is_err());
        assert_eq!(manager.get_retention_settings().unwrap(), before);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_on_end_creates_no_record() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        // a plain file where the partition directory should go
        let blocked = manager
            .storage()
            .history_dir()
            .join(storage::partition_key("/tmp/proj").unwrap());
        std::fs::write(&blocked, b"not a directory").unwrap();

        let id = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        manager.capture_output(&id, b"output");
        let err = manager.end_session(&id, 0).await.unwrap_err();
        assert!(matches!(err, HistoryError::Storage(_)));
        assert!(!manager.is_capturing(&id));
        assert!(manager.get_all_sessions(None, 0).is_empty());
        assert!(manager.end_session(&id, 0).await.unwrap_err().is_not_found());

        let entries: Vec<_> = std::fs::read_dir(manager.storage().history_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![blocked.file_name().unwrap().to_os_string()]);
        assert!(manager.lock().unwrap().claimed.is_empty());
    }

    #[tokio::test]
    async fn test_claimed_path_is_reserved_until_released() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let now = chrono::Utc::now().timestamp_millis();

        let (first, path) = manager.claim_path("/tmp/proj", now).await.unwrap();
        let (second, other) = manager.claim_path("/tmp/proj", now).await.unwrap();
        assert_eq!(first, now);
        assert_eq!(second, now + 1);
        assert_ne!(path, other);

        manager.release_path(&path.to_string_lossy().replace('\\', "/"));
        let (again, _) = manager.claim_path("/tmp/proj", now).await.unwrap();
        assert_eq!(again, now);
    }

    #[tokio::test]
    async fn test_concurrent_ends_in_same_millisecond_keep_both_files() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        let first = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        let second = manager.start_session("t", "/tmp/proj", None).unwrap().unwrap();
        let shared = chrono::Utc::now().timestamp_millis();
        {
            let mut state = manager.lock().unwrap();
            state.active.get_mut(&first).unwrap().start_time = shared;
            state.active.get_mut(&second).unwrap().start_time = shared;
        }
        manager.capture_output(&first, b"one");
        manager.capture_output(&second, b"two");

        let (a, b) = tokio::join!(manager.end_session(&first, 0), manager.end_session(&second, 0));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.file_path, b.file_path);
        assert_eq!(manager.read_session(&first).await.unwrap(), b"one");
        assert_eq!(manager.read_session(&second).await.unwrap(), b"two");
        assert!(manager.lock().unwrap().claimed.is_empty());
    }

    #[tokio::test]
    async fn test_start_after_destroy_returns_none() {
        let tmp_dir = TempDir::new().unwrap();
        let manager = manager(&tmp_dir);
        manager.destroy();

        assert_eq!(manager.start_session("t", "/tmp/proj", None).unwrap(), None);
        assert_eq!(manager.active_session_count(), 0);
    }
}
