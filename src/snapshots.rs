//! Snapshot store.
//!
//! Periodically materializes the full world state so replay never has to
//! start from version zero. Snapshots are sealed on write and verified and
//! migrated on read.

use crate::error::{Result, StoreError};
use crate::integrity::{content_hash, SealedRecord, SigningKey};
use crate::migrate::{Migrator, CURRENT_SCHEMA_VERSION};
use crate::types::{SnapshotId, WorldState};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Store of sealed full-state snapshots, one file per version.
pub struct SnapshotStore {
    dir: PathBuf,
    key: SigningKey,
    migrator: Migrator,
}

impl SnapshotStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, key: SigningKey, migrator: Migrator) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, key, migrator })
    }

    /// Seal and persist the full state at its current version.
    pub fn write_snapshot(&self, state: &WorldState) -> Result<SnapshotId> {
        let id = SnapshotId::for_version(state.world_version);
        let record = SealedRecord::seal(state.clone(), &self.key)?;

        let mut file = File::create(self.snapshot_path(&id))?;
        file.write_all(&serde_json::to_vec_pretty(&record)?)?;
        file.sync_all()?;

        Ok(id)
    }

    /// Load a snapshot by id, verifying its envelope and migrating to the
    /// current schema.
    ///
    /// The caller named a specific artifact, so every failure surfaces:
    /// missing file, hash or signature mismatch, or a broken migration.
    pub fn load_snapshot(&self, id: &SnapshotId) -> Result<WorldState> {
        let path = self.snapshot_path(id);
        let raw = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::SnapshotNotFound(id.clone())
            } else {
                StoreError::Io(e)
            }
        })?;

        let record: SealedRecord<Value> = serde_json::from_slice(&raw)?;

        let actual = content_hash(&record.payload)?;
        if actual != record.integrity.content_hash {
            return Err(StoreError::HashMismatch {
                record: id.to_string(),
                expected: record.integrity.content_hash,
                got: actual,
            });
        }
        if !record.verify(&self.key) {
            return Err(StoreError::SignatureMismatch(id.to_string()));
        }

        let migrated = self
            .migrator
            .migrate(record.payload, CURRENT_SCHEMA_VERSION)?;
        Ok(serde_json::from_value(migrated)?)
    }

    /// All snapshot ids, ascending by version.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Some(id) = SnapshotId::parse(stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Newest snapshot that passes validation, scanning newest-first.
    ///
    /// Corrupt or unmigratable snapshots are skipped with a warning; they
    /// are recovery candidates here, not named artifacts. Returns `None`
    /// when no snapshot survives.
    pub fn load_latest_valid(&self) -> Result<Option<(SnapshotId, WorldState)>> {
        for id in self.list_snapshots()?.into_iter().rev() {
            match self.load_snapshot(&id) {
                Ok(state) => return Ok(Some((id, state))),
                Err(StoreError::Io(e)) => return Err(StoreError::Io(e)),
                Err(e) => {
                    warn!(snapshot = %id, error = %e, "skipping invalid snapshot");
                }
            }
        }
        Ok(None)
    }

    fn snapshot_path(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Operation, WorldVersion};
    use crate::apply::apply_operations;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::open(
            dir.path().join("snapshots"),
            SigningKey::new(b"secret".to_vec()),
            Migrator::with_defaults(),
        )
        .unwrap()
    }

    fn state_with_npc(seed: u64) -> WorldState {
        let base = WorldState::new(seed);
        apply_operations(&base, &[Operation::set("npc_1", json!({"hp": 10}))]).unwrap()
    }

    #[test]
    fn test_write_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let state = state_with_npc(42);
        let id = store.write_snapshot(&state).unwrap();
        assert_eq!(id.version(), WorldVersion(1));

        let loaded = store.load_snapshot(&id).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let id = SnapshotId::for_version(WorldVersion(7));
        assert!(matches!(
            store.load_snapshot(&id),
            Err(StoreError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_list_is_version_ordered() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let mut state = WorldState::new(1);
        store.write_snapshot(&state).unwrap();
        for _ in 0..11 {
            state = apply_operations(&state, &[]).unwrap();
        }
        store.write_snapshot(&state).unwrap();

        let versions: Vec<u64> = store
            .list_snapshots()
            .unwrap()
            .iter()
            .map(|id| id.version().0)
            .collect();
        assert_eq!(versions, vec![0, 11]);
    }

    #[test]
    fn test_tampered_snapshot_fails_hash_check() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let state = state_with_npc(9);
        let id = store.write_snapshot(&state).unwrap();

        let path = dir.path().join("snapshots").join(format!("{}.json", id));
        let mut raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        raw["payload"]["tick"] = json!(9999);
        fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        assert!(matches!(
            store.load_snapshot(&id),
            Err(StoreError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_forged_envelope_fails_signature_check() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let state = state_with_npc(9);
        let id = store.write_snapshot(&state).unwrap();

        // Recompute the hash for a tampered payload without the key.
        let path = dir.path().join("snapshots").join(format!("{}.json", id));
        let mut raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        raw["payload"]["tick"] = json!(9999);
        let forged = content_hash(&raw["payload"]).unwrap();
        raw["integrity"]["content_hash"] = json!(forged);
        fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        assert!(matches!(
            store.load_snapshot(&id),
            Err(StoreError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_latest_valid_skips_corrupt_newest() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let old = state_with_npc(5);
        store.write_snapshot(&old).unwrap();

        let newer = apply_operations(&old, &[Operation::patch("npc_1", json!({"hp": 2}))]).unwrap();
        let newest_id = store.write_snapshot(&newer).unwrap();

        let path = dir
            .path()
            .join("snapshots")
            .join(format!("{}.json", newest_id));
        fs::write(&path, b"{ not json").unwrap();

        let (id, state) = store.load_latest_valid().unwrap().unwrap();
        assert_eq!(id.version(), WorldVersion(1));
        assert_eq!(state, old);
    }

    #[test]
    fn test_latest_valid_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        assert!(store.load_latest_valid().unwrap().is_none());
    }

    #[test]
    fn test_loads_legacy_schema_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        // Hand-write a sealed v1 payload lacking the metadata bag.
        let legacy = json!({
            "schema_version": 1,
            "world_version": 3,
            "seed": 7,
            "tick": 3,
            "entities": {"npc_1": {"hp": 4}},
            "created_at": 0,
            "updated_at": 0,
        });
        let record =
            SealedRecord::seal(legacy, &SigningKey::new(b"secret".to_vec())).unwrap();
        let id = SnapshotId::for_version(WorldVersion(3));
        fs::write(
            dir.path().join("snapshots").join(format!("{}.json", id)),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();

        let state = store.load_snapshot(&id).unwrap();
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(state.metadata.is_empty());
        assert_eq!(state.entities["npc_1"], json!({"hp": 4}));
    }
}
