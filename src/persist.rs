//! Conversation snapshot file.
//!
//! The snapshot is the turn sequence serialized as a JSON array in exactly the
//! [`Turn`] shape. Every save replaces the whole file: last write wins.

use std::path::{Path, PathBuf};

use crate::conversation::Turn;
use crate::error::{ChatError, Result};

pub fn to_json(turns: &[Turn]) -> Result<String> {
    Ok(serde_json::to_string_pretty(turns)?)
}

pub fn from_json(raw: &str) -> Result<Vec<Turn>> {
    Ok(serde_json::from_str(raw)?)
}

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot next to its final location, then rename over it so
    /// a crash mid-write never leaves a truncated file behind.
    pub fn save(&self, turns: &[Turn]) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, to_json(turns)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), turns = turns.len(), "snapshot saved");
        Ok(())
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub fn load(&self) -> Result<Option<Vec<Turn>>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        from_json(&raw)
            .map(Some)
            .map_err(|e| ChatError::Persistence(format!("{}: {e}", self.path.display())))
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
