//! Durable session state: which camera is active, and whether inference was
//! started for it.  Consulted at startup so a restart resumes supervision
//! without re-prompting the user.
//!
//! The two records are independent on purpose: a camera can be selected
//! without inference running, and the inference flag is keyed per camera so
//! switching cameras does not leak state between them.  Malformed stored
//! data is always treated as "nothing stored", never surfaced as an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{ActiveCamera, Result};

/// Persistence port for session state.  Injectable so the state machine is
/// not tied to any particular key-value store.
pub trait SessionStore: Send + Sync {
    /// The active-camera record, or `None` when nothing (valid) is stored.
    fn load_active(&self) -> Option<ActiveCamera>;
    fn save_active(&self, camera: &ActiveCamera) -> Result<()>;
    fn clear_active(&self) -> Result<()>;

    /// Whether inference was started for `camera_id` before the last
    /// shutdown.  Missing or corrupt data reads as `false`.
    fn inference_started(&self, camera_id: &str) -> bool;
    fn set_inference_started(&self, camera_id: &str) -> Result<()>;
    fn clear_inference_started(&self, camera_id: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreRecord {
    #[serde(default)]
    active_camera: Option<ActiveCamera>,
    #[serde(default)]
    inference: BTreeMap<String, bool>,
}

/// Single-file JSON store.  Reads the file on every access, which keeps the
/// store coherent across processes sharing the same session file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> StoreRecord {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return StoreRecord::default(),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    "discarding corrupt session store at {}: {err}",
                    self.path.display()
                );
                StoreRecord::default()
            }
        }
    }

    fn write(&self, record: &StoreRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(record)?;
        // Temp-then-rename: the file on disk is always a whole record, even
        // if the process dies mid-write.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SessionStore for JsonFileStore {
    fn load_active(&self) -> Option<ActiveCamera> {
        self.read().active_camera
    }

    fn save_active(&self, camera: &ActiveCamera) -> Result<()> {
        let mut record = self.read();
        record.active_camera = Some(camera.clone());
        self.write(&record)
    }

    fn clear_active(&self) -> Result<()> {
        let mut record = self.read();
        if record.active_camera.take().is_none() {
            return Ok(());
        }
        self.write(&record)
    }

    fn inference_started(&self, camera_id: &str) -> bool {
        self.read().inference.get(camera_id).copied().unwrap_or(false)
    }

    fn set_inference_started(&self, camera_id: &str) -> Result<()> {
        let mut record = self.read();
        record.inference.insert(camera_id.to_string(), true);
        self.write(&record)
    }

    fn clear_inference_started(&self, camera_id: &str) -> Result<()> {
        let mut record = self.read();
        if record.inference.remove(camera_id).is_none() {
            return Ok(());
        }
        self.write(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> JsonFileStore {
        JsonFileStore::new(dir.path().join("session.json"))
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.load_active().is_none());
        assert!(!store.inference_started("cam-1"));
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"{not json at all").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(store.load_active().is_none());
        assert!(!store.inference_started("cam-1"));
    }

    #[test]
    fn active_camera_round_trips() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let mut camera = ActiveCamera::new("cam-1", "rtsp://door");
        camera.name = Some("Front Door".into());

        store.save_active(&camera).unwrap();
        assert_eq!(store.load_active(), Some(camera));

        store.clear_active().unwrap();
        assert!(store.load_active().is_none());
    }

    #[test]
    fn writes_replace_the_file_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = JsonFileStore::new(&path);

        store.save_active(&ActiveCamera::new("cam-1", "rtsp://x")).unwrap();
        store.save_active(&ActiveCamera::new("cam-2", "rtsp://y")).unwrap();
        assert_eq!(store.load_active().unwrap().camera_id, "cam-2");

        // The intermediate file never outlives the write.
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("session.json")]);
    }

    #[test]
    fn inference_flags_are_per_camera_and_independent_of_active_record() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        store.set_inference_started("cam-1").unwrap();
        assert!(store.inference_started("cam-1"));
        assert!(!store.inference_started("cam-2"));

        // Clearing the active record leaves the flags alone.
        store.save_active(&ActiveCamera::new("cam-1", "rtsp://x")).unwrap();
        store.clear_active().unwrap();
        assert!(store.inference_started("cam-1"));

        store.clear_inference_started("cam-1").unwrap();
        assert!(!store.inference_started("cam-1"));
        // Clearing an absent flag is a no-op.
        store.clear_inference_started("cam-1").unwrap();
    }
}
