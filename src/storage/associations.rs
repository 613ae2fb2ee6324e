//! Device-to-participant pairing table
//!
//! Remembers which participant wore which sensor so the next session can
//! skip manual pairing. Stored as a JSON list of pairs. Loaded and saved
//! only at session boundaries; the live registry never reads it directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PersistenceError;
use crate::ble::transport::DeviceId;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AssociationEntry {
    device: DeviceId,
    participant: Uuid,
}

/// Persistent device → participant map.
pub struct DeviceAssociations {
    storage_path: PathBuf,
    entries: HashMap<DeviceId, Uuid>,
}

impl DeviceAssociations {
    /// Create an empty table (does not touch disk).
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            entries: HashMap::new(),
        }
    }

    /// Load the table, or start empty if the file does not exist yet.
    pub fn load(storage_path: &Path) -> Result<Self, PersistenceError> {
        let mut entries = HashMap::new();
        if storage_path.exists() {
            let data = std::fs::read(storage_path)
                .map_err(|e| PersistenceError::IoError(e.to_string()))?;
            let list: Vec<AssociationEntry> = serde_json::from_slice(&data)
                .map_err(|e| PersistenceError::DeserializationError(e.to_string()))?;
            for entry in list {
                entries.insert(entry.device, entry.participant);
            }
        }
        Ok(Self {
            storage_path: storage_path.to_path_buf(),
            entries,
        })
    }

    /// Write the table to disk.
    pub fn save(&self) -> Result<(), PersistenceError> {
        if let Some(parent) = self.storage_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PersistenceError::IoError(e.to_string()))?;
            }
        }
        let mut list: Vec<AssociationEntry> = self
            .entries
            .iter()
            .map(|(device, participant)| AssociationEntry {
                device: device.clone(),
                participant: *participant,
            })
            .collect();
        list.sort_by(|a, b| a.device.cmp(&b.device));

        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| PersistenceError::SerializationError(e.to_string()))?;
        std::fs::write(&self.storage_path, json)
            .map_err(|e| PersistenceError::IoError(e.to_string()))
    }

    pub fn participant_for(&self, device: &DeviceId) -> Option<Uuid> {
        self.entries.get(device).copied()
    }

    /// Pair a device with a participant. A participant keeps at most one
    /// device: any previous pairing of theirs is dropped.
    pub fn associate(&mut self, device: DeviceId, participant: Uuid) {
        self.entries.retain(|_, p| *p != participant);
        self.entries.insert(device, participant);
    }

    pub fn forget_device(&mut self, device: &DeviceId) -> Option<Uuid> {
        self.entries.remove(device)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairings").join("associations.json");

        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let strap = DeviceId::Address([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let watch = DeviceId::Platform("hci0/dev_AA".into());

        let mut table = DeviceAssociations::load(&path).unwrap();
        assert!(table.is_empty());
        table.associate(strap.clone(), alice);
        table.associate(watch.clone(), bob);
        table.save().unwrap();

        let reloaded = DeviceAssociations::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.participant_for(&strap), Some(alice));
        assert_eq!(reloaded.participant_for(&watch), Some(bob));
    }

    #[test]
    fn test_participant_keeps_one_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = DeviceAssociations::new(dir.path().join("a.json"));
        let alice = Uuid::new_v4();
        let first = DeviceId::Simulated(Uuid::new_v4());
        let second = DeviceId::Simulated(Uuid::new_v4());

        table.associate(first.clone(), alice);
        table.associate(second.clone(), alice);
        assert_eq!(table.participant_for(&first), None);
        assert_eq!(table.participant_for(&second), Some(alice));

        assert_eq!(table.forget_device(&second), Some(alice));
        assert!(table.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("associations.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            DeviceAssociations::load(&path),
            Err(PersistenceError::DeserializationError(_))
        ));
    }
}
