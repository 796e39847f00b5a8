use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{MoodReaderError, Result};

/// Last known reading position within one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingProgress {
    pub last_page: u32,
    #[serde(default)]
    pub last_line: Option<usize>,
}

/// Persistence hooks for reading progress. Recording is fire-and-forget:
/// implementations log their own failures.
pub trait ProgressStore: Send + Sync {
    fn load(&self, document: &str) -> Option<ReadingProgress>;

    fn record(&self, document: &str, progress: ReadingProgress);
}

/// Progress for every document kept in a single JSON file.
#[derive(Debug)]
pub struct JsonProgressStore {
    path: PathBuf,
    records: Mutex<HashMap<String, ReadingProgress>>,
}

impl JsonProgressStore {
    /// Opens the store, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ReadingProgress>>> {
        self.records
            .lock()
            .map_err(|_| MoodReaderError::msg("progress records have been poisoned"))
    }

    fn persist(&self, document: &str, progress: ReadingProgress) -> Result<()> {
        let mut records = self.lock()?;
        records.insert(document.to_string(), progress);
        let raw = serde_json::to_string_pretty(&*records)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl ProgressStore for JsonProgressStore {
    fn load(&self, document: &str) -> Option<ReadingProgress> {
        self.lock().ok()?.get(document).copied()
    }

    fn record(&self, document: &str, progress: ReadingProgress) {
        match self.persist(document, progress) {
            Ok(()) => debug!(document, page = progress.last_page, "progress saved"),
            Err(err) => warn!(document, error = %err, "failed to save reading progress"),
        }
    }
}
