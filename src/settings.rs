use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use serde_json::{Map, Value};

use crate::storage::atomic_write_blocking;
use crate::HistoryError;

/// Key-value store the history document is persisted into.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> crate::Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> crate::Result<()>;
}

/// In-process store; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> crate::Result<Option<Value>> {
        let guard = self
            .inner
            .read()
            .map_err(|e| HistoryError::Storage(e.to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> crate::Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|e| HistoryError::Storage(e.to_string()))?;
        guard.insert(key.to_string(), value);
        Ok(())
    }
}

/// A JSON object on disk. Loaded once on open and rewritten atomically on
/// every `set`.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: RwLock<Map<String, Value>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        let inner = match std::fs::read_to_string(&path) {
            Ok(data) if data.trim().is_empty() => Map::new(),
            Ok(data) => match serde_json::from_str::<Value>(&data)? {
                Value::Object(map) => map,
                _ => {
                    return Err(HistoryError::Storage(format!(
                        "{} does not contain a JSON object",
                        path.display()
                    )))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(HistoryError::Storage(format!("{}: {}", path.display(), e))),
        };
        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn save(&self, data: &Map<String, Value>) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HistoryError::Storage(format!("{}: {}", parent.display(), e)))?;
        }
        let bytes = serde_json::to_vec_pretty(data)?;
        atomic_write_blocking(&self.path, &bytes)
            .map_err(|e| HistoryError::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> crate::Result<Option<Value>> {
        let guard = self
            .inner
            .read()
            .map_err(|e| HistoryError::Storage(e.to_string()))?;
        Ok(guard.get(key).cloned())
    }

    /// The in-memory map only changes once the file write succeeded.
    fn set(&self, key: &str, value: Value) -> crate::Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|e| HistoryError::Storage(e.to_string()))?;
        let mut next = guard.clone();
        next.insert(key.to_string(), value);
        self.save(&next)?;
        *guard = next;
        Ok(())
    }
}
