//! On-disk JSON journals for the staging memory layers.
//!
//! The perceptual buffer, short-term store, and promotion queue live in
//! memory; the journal is their durability. Writes go to a temp file and
//! rename into place so a crash mid-write never corrupts the previous
//! snapshot. Journals are replayed on startup.

use crate::error::{MemoryError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;

pub const PERCEPTUAL: &str = "perceptual.json";
pub const SHORT_TERM: &str = "short_term.json";
pub const PROMOTION_QUEUE: &str = "promotion_queue.json";

/// Journal directory handle.
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|source| MemoryError::Journal {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Atomically write one journal file.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        let json = serde_json::to_vec_pretty(value)
            .map_err(|error| MemoryError::Consolidation(format!("journal encode: {error}")))?;

        std::fs::write(&tmp, json).map_err(|source| MemoryError::Journal {
            path: tmp.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| MemoryError::Journal {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Load a journal file; `None` when it doesn't exist yet. A corrupt
    /// file is logged and treated as absent rather than blocking startup.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.dir.join(name);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::error!(path = %path.display(), %error, "corrupt journal ignored");
                None
            }
        }
    }
}
