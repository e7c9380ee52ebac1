use std::cmp::Reverse;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::session::SessionRecord;
use crate::storage::StorageEngine;

pub const MIN_MAX_AGE_DAYS: u32 = 1;
pub const MIN_MAX_SIZE_MB: u64 = 10;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSettings {
    pub max_age_days: u32,
    pub max_size_mb: u64,
    /// Whether new sessions are captured at all.
    pub enabled: bool,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_size_mb: 500,
            enabled: true,
        }
    }
}

impl RetentionSettings {
    pub fn clamped(self) -> Self {
        Self {
            max_age_days: self.max_age_days.max(MIN_MAX_AGE_DAYS),
            max_size_mb: self.max_size_mb.max(MIN_MAX_SIZE_MB),
            enabled: self.enabled,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn max_age_ms(&self) -> i64 {
        i64::from(self.max_age_days) * MS_PER_DAY
    }
}

/// Partial update; `None` fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionUpdate {
    pub max_age_days: Option<u32>,
    pub max_size_mb: Option<u64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupReason {
    Age,
    Size,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub session: SessionRecord,
    pub reason: CleanupReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupPlan {
    /// Oldest first, in the order they were selected.
    pub to_delete: Vec<Eviction>,
    /// Most recent first, ready to replace the persisted list.
    pub to_keep: Vec<SessionRecord>,
    pub reclaimed_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CleanupFailure {
    pub session_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub deleted_count: usize,
    pub reclaimed_bytes: u64,
    pub errors: Vec<CleanupFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub usage_percent: f64,
    pub session_count: usize,
}

/// Age-then-size eviction over the completed sessions.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    settings: RetentionSettings,
}

impl RetentionPolicy {
    pub fn new(settings: RetentionSettings) -> Self {
        Self {
            settings: settings.clamped(),
        }
    }

    pub fn settings(&self) -> RetentionSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: RetentionSettings) {
        self.settings = settings.clamped();
    }

    pub fn calculate_cleanup(&self, sessions: &[SessionRecord]) -> CleanupPlan {
        self.calculate_cleanup_at(sessions, Utc::now().timestamp_millis())
    }

    /// Deterministic for a given `now_ms`: sessions older than the age cutoff
    /// go first, then the oldest survivors until the size budget holds.
    pub fn calculate_cleanup_at(&self, sessions: &[SessionRecord], now_ms: i64) -> CleanupPlan {
        // Ties on start time: the entry listed later (older) sorts first, so
        // reversing the keep-set reproduces the incoming order.
        let mut ordered: Vec<(usize, &SessionRecord)> = sessions.iter().enumerate().collect();
        ordered.sort_by_key(|&(index, s)| (s.start_time, Reverse(index)));

        let cutoff = now_ms.saturating_sub(self.settings.max_age_ms());
        let mut to_delete = Vec::new();
        let mut kept = Vec::with_capacity(ordered.len());
        for (_, session) in ordered {
            if session.start_time < cutoff {
                to_delete.push(Eviction {
                    session: session.clone(),
                    reason: CleanupReason::Age,
                });
            } else {
                kept.push(session.clone());
            }
        }

        let max_bytes = self.settings.max_bytes();
        let mut total: u64 = kept.iter().map(SessionRecord::stored_size).sum();
        let mut evict_until = 0;
        while total > max_bytes && evict_until < kept.len() {
            total -= kept[evict_until].stored_size();
            evict_until += 1;
        }
        to_delete.extend(kept.drain(..evict_until).map(|session| Eviction {
            session,
            reason: CleanupReason::Size,
        }));

        kept.reverse();
        let reclaimed_bytes = to_delete.iter().map(|e| e.session.stored_size()).sum();
        if !to_delete.is_empty() {
            debug!(
                "retention selected {} of {} sessions ({} bytes)",
                to_delete.len(),
                sessions.len(),
                reclaimed_bytes
            );
        }
        CleanupPlan {
            to_delete,
            to_keep: kept,
            reclaimed_bytes,
        }
    }

    /// Deletes victims one at a time; a failure is recorded and the pass
    /// moves on.
    pub async fn execute_cleanup(
        &self,
        to_delete: &[Eviction],
        storage: &StorageEngine,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        for eviction in to_delete {
            let session = &eviction.session;
            match storage.delete_session(Path::new(&session.file_path)).await {
                Ok(()) => {
                    report.deleted_count += 1;
                    report.reclaimed_bytes += session.stored_size();
                    info!(
                        "evicted session {} ({:?}, {} bytes)",
                        session.id,
                        eviction.reason,
                        session.stored_size()
                    );
                }
                Err(e) => {
                    warn!("failed to evict session {}: {}", session.id, e);
                    report.errors.push(CleanupFailure {
                        session_id: session.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    pub fn storage_stats(&self, sessions: &[SessionRecord]) -> StorageStats {
        let total_bytes: u64 = sessions.iter().map(SessionRecord::stored_size).sum();
        let max_bytes = self.settings.max_bytes();
        let usage_percent = if max_bytes == 0 {
            0.0
        } else {
            total_bytes as f64 / max_bytes as f64 * 100.0
        };
        StorageStats {
            total_bytes,
            max_bytes,
            usage_percent,
            session_count: sessions.len(),
        }
    }
}
