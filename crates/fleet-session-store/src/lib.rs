//! Durable per-instance session snapshots.
//!
//! One file per instance, overwritten on every save, deleted on clean
//! completion. Corrupt or incompatible files never propagate as errors to
//! callers; they are logged and treated as "no usable state".

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleet_protocol::{now_ms, InstanceId, InstanceStatus};

pub const SESSION_STATE_VERSION: u32 = 1;
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("session state io error: {0}")]
    Io(#[from] io::Error),
    #[error("session state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Snapshot of one instance's conversation progress, written on every save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub instance_id: InstanceId,
    pub conversation_context: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: InstanceStatus,
    pub current_task_id: Option<String>,
    /// Unix epoch milliseconds, stamped by the store on save.
    pub saved_at: i64,
    pub version: u32,
}

impl SessionSnapshot {
    pub fn new(
        instance_id: InstanceId,
        conversation_context: serde_json::Value,
        status: InstanceStatus,
    ) -> Self {
        Self {
            instance_id,
            conversation_context,
            session_id: None,
            status,
            current_task_id: None,
            saved_at: 0,
            version: SESSION_STATE_VERSION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStateStore {
    dir: PathBuf,
}

impl SessionStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stamps the current time and format version, then writes atomically
    /// (temp file + rename) so readers never observe a partial snapshot.
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StateStoreError> {
        fs::create_dir_all(&self.dir)?;

        let mut stamped = snapshot.clone();
        stamped.saved_at = now_ms();
        stamped.version = SESSION_STATE_VERSION;

        let path = self.snapshot_path(&stamped.instance_id);
        let staging = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(&stamped)?;
        fs::write(&staging, payload)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }

    /// Returns `None` for missing, unreadable, unparsable, or
    /// version-mismatched files. Corruption is logged, never thrown.
    pub fn load(&self, instance_id: &InstanceId) -> Option<SessionSnapshot> {
        let path = self.snapshot_path(instance_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!(
                    instance = %instance_id,
                    path = %path.display(),
                    error = %error,
                    "failed to read session snapshot"
                );
                return None;
            }
        };

        let snapshot: SessionSnapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(
                    instance = %instance_id,
                    path = %path.display(),
                    error = %error,
                    "ignoring corrupt session snapshot"
                );
                return None;
            }
        };

        if snapshot.version != SESSION_STATE_VERSION {
            tracing::warn!(
                instance = %instance_id,
                found = snapshot.version,
                expected = SESSION_STATE_VERSION,
                "ignoring session snapshot with incompatible format version"
            );
            return None;
        }

        Some(snapshot)
    }

    /// Removes the snapshot for a cleanly completed instance. Missing files
    /// are not an error.
    pub fn delete(&self, instance_id: &InstanceId) -> bool {
        match fs::remove_file(self.snapshot_path(instance_id)) {
            Ok(()) => true,
            Err(error) if error.kind() == io::ErrorKind::NotFound => false,
            Err(error) => {
                tracing::warn!(
                    instance = %instance_id,
                    error = %error,
                    "failed to delete session snapshot"
                );
                false
            }
        }
    }

    /// Removes every snapshot older than `threshold`, whether or not its
    /// owning instance is still alive. Returns the count removed.
    pub fn cleanup_stale(&self, threshold: Duration) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return 0,
            Err(error) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    error = %error,
                    "failed to scan session state directory"
                );
                return 0;
            }
        };

        let cutoff = now_ms() - threshold.as_millis() as i64;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(saved_at) = Self::snapshot_age_marker(&path) else {
                continue;
            };
            if saved_at < cutoff && fs::remove_file(&path).is_ok() {
                tracing::debug!(path = %path.display(), "pruned stale session snapshot");
                removed += 1;
            }
        }
        removed
    }

    /// `savedAt` when parseable, fs mtime otherwise, so unreadable snapshots
    /// still age out.
    fn snapshot_age_marker(path: &Path) -> Option<i64> {
        if let Ok(raw) = fs::read(path) {
            if let Ok(snapshot) = serde_json::from_slice::<SessionSnapshot>(&raw) {
                return Some(snapshot.saved_at);
            }
        }
        let modified = fs::metadata(path).ok()?.modified().ok()?;
        let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
        Some(since_epoch.as_millis() as i64)
    }

    fn snapshot_path(&self, instance_id: &InstanceId) -> PathBuf {
        let safe: String = instance_id
            .as_str()
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}
