//! Durable place-set and triggered-set storage.
//!
//! Two small JSON blobs under a caller-supplied directory. The place blob is
//! rewritten on every list replacement; the triggered blob on every dedup
//! mutation, so an alarm already fired before a process death is not fired
//! again on resurrection. A corrupt blob reads back as empty: monitoring
//! degrades rather than crashing the host.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::place::Place;

const PLACES_FILE: &str = "alarm_places.json";
const TRIGGERED_FILE: &str = "triggered_alarms.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),

    #[error("store encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryBlob {
    saved_at: String,
    places: Vec<Place>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TriggeredBlob {
    ids: BTreeSet<String>,
}

/// File-backed persistence for the monitor.
#[derive(Debug, Clone)]
pub struct PlaceStore {
    dir: PathBuf,
}

impl PlaceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn save_places(&self, places: &[Place]) -> Result<(), StoreError> {
        let blob = RegistryBlob {
            saved_at: Utc::now().to_rfc3339(),
            places: places.to_vec(),
        };
        self.write_blob(PLACES_FILE, &blob)?;
        debug!("[store] saved {} place(s)", blob.places.len());
        Ok(())
    }

    /// Load the persisted place set. Missing file means no prior places;
    /// a corrupt file is logged and treated the same way.
    pub fn load_places(&self) -> Vec<Place> {
        match self.read_blob::<RegistryBlob>(PLACES_FILE) {
            Ok(Some(blob)) => {
                debug!("[store] restored {} place(s)", blob.places.len());
                blob.places
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("[store] corrupt place blob, starting empty: {e}");
                Vec::new()
            }
        }
    }

    pub fn save_triggered(&self, ids: &BTreeSet<String>) -> Result<(), StoreError> {
        self.write_blob(TRIGGERED_FILE, &TriggeredBlob { ids: ids.clone() })
    }

    pub fn load_triggered(&self) -> BTreeSet<String> {
        match self.read_blob::<TriggeredBlob>(TRIGGERED_FILE) {
            Ok(Some(blob)) => blob.ids,
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!("[store] corrupt triggered blob, starting empty: {e}");
                BTreeSet::new()
            }
        }
    }

    /// Remove everything; called when monitoring stops for good.
    pub fn clear(&self) {
        for file in [PLACES_FILE, TRIGGERED_FILE] {
            match fs::remove_file(self.dir.join(file)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("[store] failed to remove {file}: {e}"),
            }
        }
    }

    fn write_blob<T: Serialize>(&self, file: &str, blob: &T) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file);
        let tmp = self.dir.join(format!("{file}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(blob)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_blob<T: for<'de> Deserialize<'de>>(&self, file: &str) -> Result<Option<T>, StoreError> {
        let path = self.dir.join(file);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::place::TriggerKind;
    use std::sync::atomic::{AtomicU64, Ordering};

    static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

    fn scratch_store() -> PlaceStore {
        let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "geofence_alarm_store_test_{}_{seq}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        PlaceStore::new(dir)
    }

    fn place(id: &str) -> Place {
        Place {
            id: id.to_string(),
            name: format!("place {id}"),
            latitude: 37.5665,
            longitude: 126.978,
            radius_meters: 150.0,
            trigger_kind: TriggerKind::Exit,
            enabled: true,
        }
    }

    #[test]
    fn test_places_round_trip() {
        let store = scratch_store();
        let places = vec![place("home"), place("work")];

        store.save_places(&places).unwrap();
        assert_eq!(store.load_places(), places);
    }

    #[test]
    fn test_missing_files_read_as_empty() {
        let store = scratch_store();
        assert!(store.load_places().is_empty());
        assert!(store.load_triggered().is_empty());
    }

    #[test]
    fn test_corrupt_blob_reads_as_empty() {
        let store = scratch_store();
        fs::create_dir_all(&store.dir).unwrap();
        fs::write(store.dir.join(PLACES_FILE), b"{not json").unwrap();
        fs::write(store.dir.join(TRIGGERED_FILE), b"[1,2,").unwrap();

        assert!(store.load_places().is_empty());
        assert!(store.load_triggered().is_empty());
    }

    #[test]
    fn test_triggered_round_trip_and_clear() {
        let store = scratch_store();
        let ids: BTreeSet<String> = ["home".to_string(), "work".to_string()].into();

        store.save_triggered(&ids).unwrap();
        store.save_places(&[place("home")]).unwrap();
        assert_eq!(store.load_triggered(), ids);

        store.clear();
        assert!(store.load_places().is_empty());
        assert!(store.load_triggered().is_empty());
    }
}
