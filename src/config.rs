use std::path::PathBuf;

use crate::recorder::DEFAULT_BUFFER_CAP;
use crate::HistoryError;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "TERMHIST_DATA_DIR";

const HISTORY_DIR_NAME: &str = "history";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Root under which `history/` and the settings document live.
    pub data_dir: PathBuf,
    pub settings_file: PathBuf,
    /// Per-session in-memory ceiling, in bytes.
    pub buffer_cap: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

impl HistoryConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            settings_file: data_dir.join(SETTINGS_FILE_NAME),
            data_dir,
            buffer_cap: DEFAULT_BUFFER_CAP,
        }
    }

    pub fn from_env() -> crate::Result<Self> {
        match std::env::var(DATA_DIR_ENV) {
            Ok(dir) if dir.trim().is_empty() => Err(HistoryError::Configuration(format!(
                "{} is set but empty",
                DATA_DIR_ENV
            ))),
            Ok(dir) => Ok(Self::with_data_dir(dir)),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn buffer_cap(mut self, cap: usize) -> Self {
        self.buffer_cap = cap;
        self
    }

    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join(HISTORY_DIR_NAME)
    }
}

fn default_data_dir() -> PathBuf {
    let base = |var: &str| {
        std::env::var(var)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
    };
    if cfg!(target_os = "windows") {
        base("LOCALAPPDATA").join("terminal-history")
    } else if cfg!(target_os = "macos") {
        base("HOME").join("Library/Application Support/terminal-history")
    } else {
        base("HOME").join(".local/share/terminal-history")
    }
}
