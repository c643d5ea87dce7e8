//! File-backed presence marker.
//!
//! The marker's existence is the durable record that secrets are currently
//! loaded. It is written last on unlock and removed first on lock, which makes
//! a repeated removal a no-op and keeps a crash from re-running the purge.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};

/// File name of the marker inside the state directory.
pub const MARKER_FILE_NAME: &str = "INSERTED";

/// Contents of the marker file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMarker {
    pub present: bool,
    /// Unix timestamp (seconds) of the unlock that wrote the marker.
    pub created_at: u64,
}

impl PresenceMarker {
    /// A marker stamped with the current time.
    pub fn now() -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            present: true,
            created_at,
        }
    }
}

/// Reads and writes the marker file at a fixed path.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    path: PathBuf,
}

impl MarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for the standard marker file inside `state_dir`.
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(MARKER_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the marker file is present right now.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Reads the marker. A missing file is `Ok(None)`.
    ///
    /// Legacy empty marker files (older tools just touched the file) read as
    /// present with an unknown creation time.
    pub fn read(&self) -> Result<Option<PresenceMarker>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).marker_context(&self.path),
        };
        if raw.trim().is_empty() {
            return Ok(Some(PresenceMarker {
                present: true,
                created_at: 0,
            }));
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::MarkerCorrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })
    }

    /// Writes a fresh marker, creating the state directory if needed.
    pub fn create(&self) -> Result<PresenceMarker> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).marker_context(parent)?;
        }
        let marker = PresenceMarker::now();
        let body = serde_json::to_vec(&marker).map_err(|e| Error::MarkerCorrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        // Write-then-rename so a crash never leaves a half-written marker.
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, body).marker_context(&staging)?;
        fs::rename(&staging, &self.path).marker_context(&self.path)?;
        debug!(path = %self.path.display(), "presence marker written");
        Ok(marker)
    }

    /// Removes the marker. Returns whether a marker was actually removed.
    ///
    /// An already-absent marker is success.
    pub fn delete(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "presence marker removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).marker_context(&self.path),
        }
    }
}
