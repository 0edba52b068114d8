//! Per-chunk patch chains.
//!
//! The whole-world snapshot/diff design applied at chunk granularity:
//! instead of a version counter alone, each patch links to its predecessor
//! by content hash. Base chunk content comes from a deterministic generator
//! and is never persisted; only the patch chain on top of it is, so
//! rehydration is generation plus replay.

use crate::apply::apply_to_entities;
use crate::error::{Result, StoreError};
use crate::integrity::{content_hash, SealedRecord, SigningKey};
use crate::types::{EntityRecord, Operation, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Grid coordinate of a chunk.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Debug for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({},{})", self.x, self.y)
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Pure seeded producer of base chunk content.
///
/// Output must remain reproducible forever for a given `(seed, coord)`,
/// because only deltas on top of it are persisted.
pub trait ChunkGenerator {
    fn generate(&self, coord: ChunkCoord, seed: u64) -> BTreeMap<String, EntityRecord>;
}

/// One patch in a chunk's chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkPatch {
    /// Position in the chain; patch N applies to chain version N.
    pub base_version: u64,

    /// Content hash of the previous patch. `None` for the first patch.
    pub parent_hash: Option<String>,

    pub operations: Vec<Operation>,

    pub created_at: Timestamp,
}

/// Persisted payload for one chunk: its full ordered patch history.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChunkHistory {
    coord: ChunkCoord,
    patches: Vec<ChunkPatch>,
}

/// Store of per-chunk hash-linked patch chains.
pub struct ChunkStore {
    dir: PathBuf,
    key: SigningKey,

    /// Materialized chunk states keyed by coordinate.
    cache: Mutex<LruCache<ChunkCoord, BTreeMap<String, EntityRecord>>>,

    /// Serializes "read version, compute patch, append" per store.
    write_lock: Mutex<()>,
}

impl ChunkStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, key: SigningKey, cache_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap();

        Ok(Self {
            dir,
            key,
            cache: Mutex::new(LruCache::new(cache_size)),
            write_lock: Mutex::new(()),
        })
    }

    /// Append a patch to a chunk's chain.
    ///
    /// `base_version` must equal the chain's current version (its patch
    /// count); the new patch links to the previous one by content hash.
    pub fn append_patch(
        &self,
        coord: ChunkCoord,
        base_version: u64,
        operations: Vec<Operation>,
    ) -> Result<ChunkPatch> {
        let _lock = self.write_lock.lock();

        let mut history = self.read_history(coord)?;
        let current = history.patches.len() as u64;
        if base_version != current {
            return Err(StoreError::VersionConflict {
                expected: crate::types::WorldVersion(current),
                got: crate::types::WorldVersion(base_version),
            });
        }

        let parent_hash = match history.patches.last() {
            Some(prev) => Some(content_hash(prev)?),
            None => None,
        };

        let patch = ChunkPatch {
            base_version,
            parent_hash,
            operations,
            created_at: Timestamp::now(),
        };
        history.patches.push(patch.clone());
        self.write_history(&history)?;

        self.cache.lock().pop(&coord);

        debug!(chunk = %coord, version = history.patches.len(), "appended chunk patch");
        Ok(patch)
    }

    /// Current chain version (number of applied patches).
    pub fn version(&self, coord: ChunkCoord) -> Result<u64> {
        Ok(self.read_history(coord)?.patches.len() as u64)
    }

    /// The full verified patch history for a chunk.
    pub fn patch_history(&self, coord: ChunkCoord) -> Result<Vec<ChunkPatch>> {
        let history = self.read_history(coord)?;
        self.check_links(&history)?;
        Ok(history.patches)
    }

    /// Walk the chain checking positions and parent-hash links.
    pub fn verify_chain(&self, coord: ChunkCoord) -> Result<()> {
        let history = self.read_history(coord)?;
        self.check_links(&history)
    }

    /// Materialize a chunk: regenerate base content, then replay the
    /// verified patch chain on top of it.
    pub fn materialize(
        &self,
        coord: ChunkCoord,
        generator: &dyn ChunkGenerator,
        seed: u64,
    ) -> Result<BTreeMap<String, EntityRecord>> {
        if let Some(state) = self.cache.lock().get(&coord) {
            return Ok(state.clone());
        }

        // Repopulation must not interleave with an append: a pre-patch
        // state landing in the cache after the append's invalidation
        // would stick until the next append.
        let _lock = self.write_lock.lock();
        if let Some(state) = self.cache.lock().get(&coord) {
            return Ok(state.clone());
        }

        let history = self.read_history(coord)?;
        self.check_links(&history)?;

        let mut state = generator.generate(coord, seed);
        for patch in &history.patches {
            for operation in &patch.operations {
                apply_to_entities(&mut state, operation)?;
            }
        }

        self.cache.lock().put(coord, state.clone());
        Ok(state)
    }

    fn check_links(&self, history: &ChunkHistory) -> Result<()> {
        let mut prev: Option<&ChunkPatch> = None;
        for (index, patch) in history.patches.iter().enumerate() {
            if patch.base_version != index as u64 {
                return Err(StoreError::BrokenChain {
                    chunk: history.coord.to_string(),
                    reason: format!(
                        "patch at position {} declares base {}",
                        index, patch.base_version
                    ),
                });
            }
            let expected_parent = match prev {
                Some(p) => Some(content_hash(p)?),
                None => None,
            };
            if patch.parent_hash != expected_parent {
                return Err(StoreError::BrokenChain {
                    chunk: history.coord.to_string(),
                    reason: format!("parent hash mismatch at position {}", index),
                });
            }
            prev = Some(patch);
        }
        Ok(())
    }

    fn read_history(&self, coord: ChunkCoord) -> Result<ChunkHistory> {
        let path = self.chunk_path(coord);
        if !path.exists() {
            return Ok(ChunkHistory {
                coord,
                patches: Vec::new(),
            });
        }

        let raw = fs::read(&path)?;
        let record: SealedRecord<Value> = serde_json::from_slice(&raw)?;
        if !record.verify(&self.key) {
            return Err(StoreError::SignatureMismatch(path.display().to_string()));
        }
        Ok(serde_json::from_value(record.payload)?)
    }

    fn write_history(&self, history: &ChunkHistory) -> Result<()> {
        let record = SealedRecord::seal(history.clone(), &self.key)?;
        let mut file = File::create(self.chunk_path(history.coord))?;
        file.write_all(&serde_json::to_vec_pretty(&record)?)?;
        file.sync_all()?;
        Ok(())
    }

    fn chunk_path(&self, coord: ChunkCoord) -> PathBuf {
        self.dir.join(format!("chunk_{}_{}.json", coord.x, coord.y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    /// Deterministic generator: one marker entity derived from seed+coord.
    struct TestGenerator;

    impl ChunkGenerator for TestGenerator {
        fn generate(&self, coord: ChunkCoord, seed: u64) -> BTreeMap<String, EntityRecord> {
            let mut base = BTreeMap::new();
            base.insert(
                "terrain".to_string(),
                json!({"kind": "plains", "seed": seed, "x": coord.x, "y": coord.y}),
            );
            base
        }
    }

    fn test_store(dir: &TempDir) -> ChunkStore {
        ChunkStore::open(
            dir.path().join("chunks"),
            SigningKey::new(b"secret".to_vec()),
            16,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_chunk_materializes_base_content() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let state = store
            .materialize(ChunkCoord::new(0, 0), &TestGenerator, 42)
            .unwrap();
        assert_eq!(state["terrain"]["seed"], json!(42));
    }

    #[test]
    fn test_append_and_materialize() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let coord = ChunkCoord::new(1, -2);

        store
            .append_patch(coord, 0, vec![Operation::set("rock_1", json!({"mined": false}))])
            .unwrap();
        store
            .append_patch(coord, 1, vec![Operation::patch("rock_1", json!({"mined": true}))])
            .unwrap();

        let state = store.materialize(coord, &TestGenerator, 7).unwrap();
        assert_eq!(state["rock_1"], json!({"mined": true}));
        assert!(state.contains_key("terrain"));
        assert_eq!(store.version(coord).unwrap(), 2);
    }

    #[test]
    fn test_stale_base_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let coord = ChunkCoord::new(0, 0);

        store.append_patch(coord, 0, vec![]).unwrap();
        let result = store.append_patch(coord, 0, vec![]);
        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
    }

    #[test]
    fn test_parent_hash_links() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let coord = ChunkCoord::new(3, 3);

        let first = store.append_patch(coord, 0, vec![]).unwrap();
        let second = store.append_patch(coord, 1, vec![]).unwrap();

        assert!(first.parent_hash.is_none());
        assert_eq!(second.parent_hash, Some(content_hash(&first).unwrap()));
        store.verify_chain(coord).unwrap();
    }

    #[test]
    fn test_tampered_history_fails_envelope() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let coord = ChunkCoord::new(0, 0);
        store
            .append_patch(coord, 0, vec![Operation::set("e", json!({"v": 1}))])
            .unwrap();

        let path = dir.path().join("chunks").join("chunk_0_0.json");
        let mut raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        raw["payload"]["patches"][0]["operations"][0]["value"]["v"] = json!(999);
        fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        assert!(matches!(
            store.verify_chain(coord),
            Err(StoreError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_materialize_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let coord = ChunkCoord::new(5, 5);

        store
            .append_patch(coord, 0, vec![Operation::set("npc", json!({"hp": 3}))])
            .unwrap();

        let a = store.materialize(coord, &TestGenerator, 9).unwrap();
        let b = store.materialize(coord, &TestGenerator, 9).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_materialize_racing_appends_never_pins_stale_state() {
        use std::sync::Arc;
        use std::thread;

        let dir = TempDir::new().unwrap();
        let store = Arc::new(test_store(&dir));
        let coord = ChunkCoord::new(4, 4);

        store
            .append_patch(coord, 0, vec![Operation::set("npc", json!({"n": 0}))])
            .unwrap();

        // Reader hammers materialize while the writer appends; the cache
        // must never end up holding a pre-append state.
        let reader = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..200 {
                    store.materialize(coord, &TestGenerator, 1).unwrap();
                }
            })
        };
        for i in 1..50u64 {
            store
                .append_patch(coord, i, vec![Operation::set("npc", json!({"n": i}))])
                .unwrap();
        }
        reader.join().unwrap();

        let state = store.materialize(coord, &TestGenerator, 1).unwrap();
        assert_eq!(state["npc"], json!({"n": 49}));
    }

    #[test]
    fn test_cache_invalidated_on_append() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let coord = ChunkCoord::new(2, 2);

        store
            .append_patch(coord, 0, vec![Operation::set("npc", json!({"hp": 3}))])
            .unwrap();
        let before = store.materialize(coord, &TestGenerator, 1).unwrap();
        assert_eq!(before["npc"], json!({"hp": 3}));

        store
            .append_patch(coord, 1, vec![Operation::patch("npc", json!({"hp": 2}))])
            .unwrap();
        let after = store.materialize(coord, &TestGenerator, 1).unwrap();
        assert_eq!(after["npc"], json!({"hp": 2}));
    }
}
