use serde::{Deserialize, Serialize};

use crate::retention::RetentionSettings;

/// One completed capture. Never edited after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub tab_id: String,
    pub cwd: String,
    pub partition_key: String,
    pub display_name: String,
    /// Milliseconds since the Unix epoch.
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub exit_code: i32,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    /// `history/<partitionKey>/<startTime>.gz`, relative to the data directory.
    pub file_path: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SessionRecord {
    /// Bytes this session occupies on disk; older records without a
    /// compressed size fall back to the raw size.
    pub fn stored_size(&self) -> u64 {
        if self.compressed_size > 0 {
            self.compressed_size
        } else {
            self.uncompressed_size
        }
    }
}

/// The document persisted under the `history` key of the settings store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDocument {
    /// Most recent first.
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
    #[serde(default)]
    pub settings: RetentionSettings,
}

#[cfg(test)]
pub(crate) fn sample_record(id: &str, start_time: i64, compressed_size: u64) -> SessionRecord {
    SessionRecord {
        id: id.to_string(),
        tab_id: "tab-1".to_string(),
        cwd: "/tmp/proj".to_string(),
        partition_key: "0000000000000000".to_string(),
        display_name: "proj".to_string(),
        start_time,
        end_time: start_time + 1000,
        duration: 1000,
        exit_code: 0,
        uncompressed_size: compressed_size * 4,
        compressed_size,
        file_path: format!("history/0000000000000000/{}.gz", start_time),
        truncated: false,
        metadata: None,
    }
}
