//! Persisted boot-cycle record for rapid power-cycle detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::write_atomic;
use crate::error::StorageError;

/// File name of the boot-cycle record inside the state directory.
pub const BOOT_RECORD_FILE: &str = "boot_cycle.json";

/// Number of consecutive quick boots and when the last one happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootCycleRecord {
    pub count: u32,
    pub last_boot: DateTime<Utc>,
}

/// File-backed store for the [`BootCycleRecord`].
#[derive(Debug, Clone)]
pub struct BootRecordStore {
    path: PathBuf,
}

impl BootRecordStore {
    #[must_use]
    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(BOOT_RECORD_FILE),
        }
    }

    /// Load the record; unreadable records count as absent.
    #[must_use]
    pub fn load(&self) -> Option<BootCycleRecord> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read boot-cycle record");
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Discarding corrupt boot-cycle record");
                None
            }
        }
    }

    pub fn save(&self, record: &BootCycleRecord) -> Result<(), StorageError> {
        let json =
            serde_json::to_vec(record).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        write_atomic(&self.path, &json)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Boot-cycle record cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = BootRecordStore::in_dir(dir.path());
        assert!(store.load().is_none());

        let record = BootCycleRecord {
            count: 2,
            last_boot: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };
        store.save(&record).unwrap();
        assert_eq!(store.load(), Some(record));

        store.clear().unwrap();
        assert!(store.load().is_none());
        assert!(store.clear().is_ok());
    }

    #[test]
    fn test_corrupt_record_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = BootRecordStore::in_dir(dir.path());
        fs::write(dir.path().join(BOOT_RECORD_FILE), b"not json").unwrap();
        assert!(store.load().is_none());
    }
}
