use std::collections::VecDeque;
use std::io::Write as _;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::HistoryError;

/// Hard ceiling on buffered bytes per session (100 MiB).
pub const DEFAULT_BUFFER_CAP: usize = 100 * 1024 * 1024;

/// Inserted at the front of the buffer once older output has been dropped.
pub const TRUNCATION_MARKER: &str = "[...earlier output truncated...]\n";

/// gzip level used for every stored session.
pub const COMPRESSION_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Active,
    Finalized,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct FinalizedCapture {
    pub compressed: Vec<u8>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub truncated: bool,
}

/// Buffers one session's output under a fixed memory ceiling.
#[derive(Debug)]
pub struct SessionRecorder {
    chunks: VecDeque<Vec<u8>>,
    total_size: usize,
    cap: usize,
    state: RecorderState,
    truncated: bool,
    started_at: DateTime<Utc>,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_BUFFER_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_size: 0,
            cap,
            state: RecorderState::Active,
            truncated: false,
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Appends a chunk. A no-op once the recorder left the Active state; fails
    /// only when the buffer cannot grow.
    pub fn write(&mut self, chunk: &[u8]) -> crate::Result<()> {
        if self.state != RecorderState::Active || chunk.is_empty() {
            return Ok(());
        }

        let mut owned = Vec::new();
        owned
            .try_reserve_exact(chunk.len())
            .map_err(|e| HistoryError::Capture(e.to_string()))?;
        owned.extend_from_slice(chunk);
        self.chunks
            .try_reserve(1)
            .map_err(|e| HistoryError::Capture(e.to_string()))?;
        self.chunks.push_back(owned);
        self.total_size += chunk.len();

        if self.total_size > self.cap {
            self.truncate();
        }
        Ok(())
    }

    fn truncate(&mut self) {
        // Caps too small to hold the marker keep only the newest bytes.
        let marker: &[u8] = if self.cap > TRUNCATION_MARKER.len() {
            TRUNCATION_MARKER.as_bytes()
        } else {
            &[]
        };
        let target = (self.cap / 10 * 8).min(self.cap - marker.len());
        let before = self.total_size;
        while self.total_size > target && self.chunks.len() > 1 {
            if let Some(dropped) = self.chunks.pop_front() {
                self.total_size -= dropped.len();
            }
        }

        // One chunk larger than the target on its own: keep its newest bytes.
        if self.total_size > target {
            if let Some(front) = self.chunks.front_mut() {
                let excess = self.total_size - target;
                front.drain(..excess);
                self.total_size -= excess;
            }
        }

        if !marker.is_empty() {
            self.chunks.push_front(marker.to_vec());
            self.total_size += marker.len();
        }
        self.truncated = true;
        debug!(
            "capture buffer truncated from {} to {} bytes",
            before, self.total_size
        );
    }

    /// Compresses the buffered output and releases the buffer.
    pub fn finalize(&mut self, exit_code: i32) -> crate::Result<FinalizedCapture> {
        match self.state {
            RecorderState::Active => {}
            RecorderState::Finalized => {
                return Err(HistoryError::Capture("recorder already finalized".to_string()))
            }
            RecorderState::Aborted => {
                return Err(HistoryError::Capture("recorder was aborted".to_string()))
            }
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
        for chunk in &self.chunks {
            encoder.write_all(chunk)?;
        }
        let compressed = encoder.finish()?;

        let uncompressed_size = self.total_size as u64;
        self.chunks = VecDeque::new();
        self.total_size = 0;
        self.state = RecorderState::Finalized;

        Ok(FinalizedCapture {
            compressed_size: compressed.len() as u64,
            compressed,
            uncompressed_size,
            duration_ms: (Utc::now() - self.started_at).num_milliseconds().max(0),
            exit_code,
            truncated: self.truncated,
        })
    }

    /// Drops everything buffered. Always safe to call.
    pub fn abort(&mut self) {
        self.chunks = VecDeque::new();
        self.total_size = 0;
        if self.state == RecorderState::Active {
            self.state = RecorderState::Aborted;
        }
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new()
    }
}
