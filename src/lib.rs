pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod manager;
pub mod recorder;
pub mod retention;
pub mod session;
pub mod settings;
pub mod storage;

pub use config::HistoryConfig;
pub use error::HistoryError;
pub use events::{EventBus, HistoryEvent};
pub use manager::HistoryManager;
pub use recorder::{FinalizedCapture, RecorderState, SessionRecorder};
pub use retention::{
    CleanupPlan, CleanupReason, CleanupReport, RetentionPolicy, RetentionSettings,
    RetentionUpdate, StorageStats,
};
pub use session::{HistoryDocument, SessionRecord};
pub use settings::{JsonFileStore, MemoryStore, SettingsStore};
pub use storage::StorageEngine;

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, HistoryError>;
