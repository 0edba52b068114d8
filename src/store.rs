//! Main WorldStore struct tying all components together.

use crate::chunks::ChunkStore;
use crate::diffs::{DiffLog, DiffStream};
use crate::error::{Result, StoreError};
use crate::integrity::SigningKey;
use crate::migrate::Migrator;
use crate::recovery;
use crate::snapshots::SnapshotStore;
use crate::types::{Operation, SnapshotId, WorldState, WorldVersion};
use crate::apply::apply_operations;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct WorldStoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Write a full snapshot whenever `world_version % snapshot_interval == 0`.
    /// Bounds replay depth after the newest snapshot.
    pub snapshot_interval: u64,

    /// Signing key override. `None` reads `WORLD_SIGNING_KEY` from the
    /// environment, with a dev default.
    pub signing_key: Option<Vec<u8>>,

    /// Materialized chunk cache size (number of chunks).
    pub chunk_cache_size: usize,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for WorldStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./world"),
            snapshot_interval: 10,
            signing_key: None,
            chunk_cache_size: 256,
            create_if_missing: true,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"WLD\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// The world store.
///
/// Single writer per world: every mutation runs under one exclusive lock
/// so "read current version, compute diff, append" is atomic. Reads work
/// on write-once sealed records and need no lock.
pub struct WorldStore {
    /// Store configuration.
    config: WorldStoreConfig,

    /// Lock file for exclusive process access.
    _lock_file: File,

    /// Sealed full-state snapshots.
    snapshots: SnapshotStore,

    /// Append-only diff log.
    diffs: DiffLog,

    /// Per-chunk patch chains.
    chunks: ChunkStore,

    /// Lock for write operations to ensure atomicity.
    write_lock: Mutex<()>,
}

impl WorldStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: WorldStoreConfig) -> Result<Self> {
        if config.path.exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: WorldStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        Self::init(config)
    }

    /// Open an existing store.
    pub fn open(config: WorldStoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        Self::init(config)
    }

    fn init(config: WorldStoreConfig) -> Result<Self> {
        let lock_file = Self::acquire_lock(&config.path)?;

        let key = match &config.signing_key {
            Some(key) => SigningKey::new(key.clone()),
            None => SigningKey::from_env(),
        };

        let snapshots = SnapshotStore::open(
            config.path.join("snapshots"),
            key.clone(),
            Migrator::with_defaults(),
        )?;
        let diffs = DiffLog::open(config.path.join("diffs"), key.clone())?;
        let chunks = ChunkStore::open(config.path.join("chunks"), key, config.chunk_cache_size)?;

        Ok(Self {
            config,
            _lock_file: lock_file,
            snapshots,
            diffs,
            chunks,
            write_lock: Mutex::new(()),
        })
    }

    // --- Write Path ---

    /// Apply operations to a state, durably record the diff, and return
    /// the successor state.
    ///
    /// The caller's state is the declared base; a stale base fails when
    /// the diff for that version already exists. A snapshot is written
    /// automatically whenever the new version lands on the interval; a
    /// failed interval snapshot is logged but does not fail the append,
    /// because the diff is the record of truth and the snapshot only
    /// bounds replay depth.
    pub fn append(&self, state: &WorldState, operations: Vec<Operation>) -> Result<WorldState> {
        let _lock = self.write_lock.lock();

        let next = apply_operations(state, &operations)?;
        self.diffs
            .append(state.world_version, next.tick, operations)?;

        let interval = self.config.snapshot_interval.max(1);
        if next.world_version.0 % interval == 0 {
            // The diff is already durable at this point.
            match self.snapshots.write_snapshot(&next) {
                Ok(id) => debug!(snapshot = %id, "interval snapshot written"),
                Err(e) => {
                    warn!(version = %next.world_version, error = %e, "interval snapshot failed")
                }
            }
        }

        Ok(next)
    }

    /// Write a full snapshot of the given state.
    pub fn write_snapshot(&self, state: &WorldState) -> Result<SnapshotId> {
        let _lock = self.write_lock.lock();
        self.snapshots.write_snapshot(state)
    }

    // --- Read Path ---

    /// Load and verify a snapshot by id.
    pub fn load_snapshot(&self, id: &SnapshotId) -> Result<WorldState> {
        self.snapshots.load_snapshot(id)
    }

    /// All snapshot ids, ascending by version.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        self.snapshots.list_snapshots()
    }

    /// Stream verified diffs with base version at or above `min`.
    pub fn stream_from(&self, min: WorldVersion) -> Result<DiffStream<'_>> {
        self.diffs.stream_from(min)
    }

    // --- Recovery ---

    /// Reconstruct state from a snapshot (or the newest valid one) plus
    /// the diff chain above it.
    pub fn rebuild(&self, snapshot: Option<&SnapshotId>) -> Result<WorldState> {
        recovery::rebuild(&self.snapshots, &self.diffs, snapshot)
    }

    /// Recover the authoritative state at process start.
    pub fn recover_startup_state(&self) -> Result<WorldState> {
        recovery::recover_startup_state(&self.snapshots, &self.diffs)
    }

    // --- Accessors ---

    /// Per-chunk patch chains.
    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file.try_lock_exclusive().map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                StoreError::Locked
            } else {
                StoreError::Io(e)
            }
        })?;

        Ok(lock_file)
    }
}
