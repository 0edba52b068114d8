//! # World Store
//!
//! A versioned store for simulated-world state: periodic full snapshots
//! plus append-only incremental diffs, every record sealed against
//! tampering, with deterministic rebuild at any recorded version.
//!
//! ## Core Concepts
//!
//! - **Snapshots**: Full world state at a version, sealed and write-once
//! - **Diffs**: Ordered operations transforming version `v` to `v + 1`
//! - **Integrity**: SHA-256 content hash plus keyed HMAC signature
//! - **Recovery**: Replay of the longest valid diff chain atop the newest
//!   valid snapshot; corruption degrades, it never crashes
//! - **Chunks**: The same design at chunk granularity with hash-linked
//!   patch chains over generated base content
//!
//! ## Example
//!
//! ```ignore
//! use worldstore::{Operation, WorldState, WorldStore, WorldStoreConfig};
//! use serde_json::json;
//!
//! let store = WorldStore::open_or_create(WorldStoreConfig {
//!     path: "./my-world".into(),
//!     ..Default::default()
//! })?;
//!
//! // Mutate the world one diff at a time
//! let state = store.recover_startup_state()?;
//! let state = store.append(&state, vec![
//!     Operation::set("npc_1", json!({"hp": 10})),
//! ])?;
//!
//! // Reconstruct after a restart
//! let rebuilt = store.rebuild(None)?;
//! assert_eq!(rebuilt.world_version, state.world_version);
//! ```

pub mod apply;
pub mod canonical;
pub mod chunks;
pub mod diffs;
pub mod error;
pub mod integrity;
pub mod migrate;
pub mod recovery;
pub mod snapshots;
pub mod store;
pub mod types;

// Re-exports
pub use apply::{apply_operations, apply_to_entities};
pub use canonical::to_canonical_bytes;
pub use chunks::{ChunkCoord, ChunkGenerator, ChunkPatch, ChunkStore};
pub use diffs::{DiffLog, DiffStream};
pub use error::{Result, StoreError};
pub use integrity::{seal, verify, Integrity, SealedRecord, SigningKey};
pub use migrate::{MigrationStep, Migrator, CURRENT_SCHEMA_VERSION};
pub use recovery::{rebuild, recover_startup_state, replay};
pub use snapshots::SnapshotStore;
pub use store::{WorldStore, WorldStoreConfig};
pub use types::*;
