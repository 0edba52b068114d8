//! Error types for the world store.

use crate::types::{SnapshotId, WorldVersion};
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    #[error("Hash mismatch in {record}: expected {expected}, got {got}")]
    HashMismatch {
        record: String,
        expected: String,
        got: String,
    },

    #[error("Signature mismatch in {0}")]
    SignatureMismatch(String),

    #[error("Schema version {found} is newer than supported {target}")]
    SchemaTooNew { found: u32, target: u32 },

    #[error("No migration step registered for schema version {from}")]
    MissingMigration { from: u32 },

    #[error("Version conflict: expected base {expected:?}, got {got:?}")]
    VersionConflict {
        expected: WorldVersion,
        got: WorldVersion,
    },

    #[error("Broken patch chain for {chunk}: {reason}")]
    BrokenChain { chunk: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_eof() {
            StoreError::Deserialization(e.to_string())
        } else {
            StoreError::Serialization(e.to_string())
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
