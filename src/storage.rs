use std::io::Read as _;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, warn};

use crate::HistoryError;

pub const HISTORY_DIR: &str = "history";
pub const SESSION_EXTENSION: &str = "gz";

const PARTITION_KEY_LEN: usize = 16;
const TEMP_SUFFIX: &str = ".tmp";

/// Lexically normalizes a working directory: backslashes become slashes,
/// `.` and empty segments are dropped, `..` pops, and the trailing slash goes.
/// Case is preserved; `partition_key` folds it.
pub fn normalize_cwd(cwd: &str) -> String {
    let unified = cwd.trim().replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                // `..` above the root of an absolute path stays at the root
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Stable 16-hex-character key grouping every session of one directory.
pub fn partition_key(cwd: &str) -> crate::Result<String> {
    if cwd.trim().is_empty() {
        return Err(HistoryError::InvalidInput(
            "working directory must not be empty".to_string(),
        ));
    }
    let normalized = normalize_cwd(cwd).to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut key: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    key.truncate(PARTITION_KEY_LEN);
    Ok(key)
}

/// Last path segment of `cwd`, used as the human label of a session.
pub fn display_name(cwd: &str) -> String {
    let normalized = normalize_cwd(cwd);
    normalized
        .rsplit('/')
        .find(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or(normalized)
}

/// `history/<partitionKey>/<startTimeMs>.gz`, relative to the data directory.
pub fn session_path(cwd: &str, start_time_ms: i64) -> crate::Result<PathBuf> {
    if start_time_ms <= 0 {
        return Err(HistoryError::InvalidInput(format!(
            "start time must be positive, got {}",
            start_time_ms
        )));
    }
    let key = partition_key(cwd)?;
    Ok(PathBuf::from(HISTORY_DIR)
        .join(key)
        .join(format!("{}.{}", start_time_ms, SESSION_EXTENSION)))
}

pub(crate) fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Writes `bytes` next to `target` and renames into place. The temp file is
/// removed on any failure so `target` is either the old file or the new one.
pub(crate) async fn atomic_write(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_path(target);
    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, target).await
    }
    .await;

    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove temp file {}: {}", tmp.display(), e);
            }
        }
    }
    result
}

/// Blocking twin of [`atomic_write`] for callers outside the runtime.
pub(crate) fn atomic_write_blocking(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_path(target);
    let result = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, target));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

pub(crate) fn gunzip(compressed: &[u8]) -> crate::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| HistoryError::Corruption(e.to_string()))?;
    Ok(out)
}

/// All filesystem access for captured sessions. Paths handed to it are
/// resolved against `root`; absolute paths are used as-is.
#[derive(Debug, Clone)]
pub struct StorageEngine {
    root: PathBuf,
}

impl StorageEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join(HISTORY_DIR)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(self.resolve(path)).await.unwrap_or(false)
    }

    pub async fn write_session(&self, path: &Path, compressed: &[u8]) -> crate::Result<()> {
        let target = self.resolve(path);
        let parent = target
            .parent()
            .ok_or_else(|| HistoryError::Storage(format!("invalid path {}", target.display())))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| HistoryError::Storage(format!("{}: {}", parent.display(), e)))?;

        atomic_write(&target, compressed)
            .await
            .map_err(|e| HistoryError::Storage(format!("{}: {}", target.display(), e)))?;
        debug!("wrote {} bytes to {}", compressed.len(), target.display());
        Ok(())
    }

    pub async fn read_session(&self, path: &Path) -> crate::Result<Vec<u8>> {
        let target = self.resolve(path);
        let compressed = match fs::read(&target).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HistoryError::NotFound(target.display().to_string()))
            }
            Err(e) => {
                return Err(HistoryError::Storage(format!("{}: {}", target.display(), e)))
            }
        };
        gunzip(&compressed)
    }

    /// Removes the file if present and then its partition directory if that
    /// became empty. The history root itself is never removed.
    pub async fn delete_session(&self, path: &Path) -> crate::Result<()> {
        let target = self.resolve(path);
        match fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(HistoryError::Storage(format!("{}: {}", target.display(), e)))
            }
        }

        let history_dir = self.history_dir();
        if let Some(parent) = target.parent() {
            if parent != history_dir && parent.starts_with(&history_dir) {
                // fails harmlessly while other sessions remain in the partition
                let _ = fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }

    /// Best-effort sweep of empty partition directories. Returns how many
    /// were removed.
    pub async fn prune_empty_directories(&self) -> usize {
        let history_dir = self.history_dir();
        let mut entries = match fs::read_dir(&history_dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    debug!("stopping directory sweep: {}", e);
                    break;
                }
            };
            let path = entry.path();
            if !fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            let is_empty = match fs::read_dir(&path).await {
                Ok(mut dir) => matches!(dir.next_entry().await, Ok(None)),
                Err(_) => false,
            };
            if is_empty {
                match fs::remove_dir(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => debug!("could not prune {}: {}", path.display(), e),
                }
            }
        }
        removed
    }
}
