//! Core types for the world store.

use crate::migrate::CURRENT_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic counter identifying a fully-applied state of the world.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct WorldVersion(pub u64);

impl fmt::Debug for WorldVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for WorldVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WorldVersion {
    pub fn next(self) -> Self {
        WorldVersion(self.0 + 1)
    }
}

/// Identifier for a persisted snapshot.
///
/// Encodes the world version zero-padded to a fixed width so that lexical
/// order equals version order when listing files.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

/// Digit width of the version component in snapshot and diff file names.
pub const VERSION_PAD_WIDTH: usize = 12;

impl SnapshotId {
    /// Snapshot id for a given world version.
    pub fn for_version(version: WorldVersion) -> Self {
        SnapshotId(format!("snapshot_{:0width$}", version.0, width = VERSION_PAD_WIDTH))
    }

    /// Parse an id from a file stem like `snapshot_000000000042`.
    pub fn parse(stem: &str) -> Option<Self> {
        let digits = stem.strip_prefix("snapshot_")?;
        if digits.len() != VERSION_PAD_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(SnapshotId(stem.to_string()))
    }

    /// The world version this snapshot was taken at.
    pub fn version(&self) -> WorldVersion {
        let digits = &self.0["snapshot_".len()..];
        WorldVersion(digits.parse().unwrap_or(0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId({})", self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Opaque structured record for one entity.
pub type EntityRecord = Value;

/// The authoritative mutable world snapshot.
///
/// Owned and advanced exclusively by the diff apply step; callers never
/// mutate fields directly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub schema_version: u32,

    /// Strictly increases by exactly 1 per applied diff.
    pub world_version: WorldVersion,

    /// Generation seed, immutable for the life of a world.
    pub seed: u64,

    /// Simulation step counter. Monotonic, not necessarily dense.
    pub tick: u64,

    /// Entity id to opaque record. BTreeMap keeps key order stable for
    /// canonical encoding.
    pub entities: BTreeMap<String, EntityRecord>,

    /// Opaque key/value bag.
    pub metadata: BTreeMap<String, Value>,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorldState {
    /// Fresh world at version 0 with the given generation seed.
    pub fn new(seed: u64) -> Self {
        let now = Timestamp::now();
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            world_version: WorldVersion(0),
            seed,
            tick: 0,
            entities: BTreeMap::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Empty bootstrap state used when recovery finds no valid snapshot.
    pub fn bootstrap() -> Self {
        Self::new(0)
    }
}

/// One incremental mutation of a single entity.
///
/// Operations apply in list order within a diff; a later operation targeting
/// the same entity wins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Replace or create the entity record.
    Set { entity_id: String, value: EntityRecord },

    /// Shallow-merge fields into the entity record, creating it if absent.
    /// The value must be a JSON object.
    Patch { entity_id: String, value: EntityRecord },

    /// Remove the entity if present. Not an error if absent.
    Delete { entity_id: String },
}

impl Operation {
    pub fn set(entity_id: impl Into<String>, value: EntityRecord) -> Self {
        Operation::Set {
            entity_id: entity_id.into(),
            value,
        }
    }

    pub fn patch(entity_id: impl Into<String>, value: EntityRecord) -> Self {
        Operation::Patch {
            entity_id: entity_id.into(),
            value,
        }
    }

    pub fn delete(entity_id: impl Into<String>) -> Self {
        Operation::Delete {
            entity_id: entity_id.into(),
        }
    }

    /// The entity this operation targets.
    pub fn entity_id(&self) -> &str {
        match self {
            Operation::Set { entity_id, .. }
            | Operation::Patch { entity_id, .. }
            | Operation::Delete { entity_id } => entity_id,
        }
    }
}

/// An ordered, immutable set of operations transforming one world version
/// to the next.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorldDiff {
    pub schema_version: u32,

    /// Version this diff must be applied to.
    pub base_world_version: WorldVersion,

    /// Always `base + 1`.
    pub target_world_version: WorldVersion,

    /// Tick of the resulting state.
    pub tick: u64,

    pub operations: Vec<Operation>,

    pub created_at: Timestamp,
}
