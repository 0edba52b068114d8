//! Schema migration for persisted payloads.
//!
//! Payloads are migrated as raw JSON values before typed decoding, one
//! version step at a time. Steps are additive and defaulting only: they
//! backfill missing fields with safe defaults and stamp the next schema
//! version, so a structurally minimal legacy payload can never make a step
//! fail.

use crate::error::{Result, StoreError};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Schema version written by the current code.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// A migration step from one schema version to the next.
///
/// The step must set `schema_version` to `from + 1` on its output.
pub type MigrationStep = Box<dyn Fn(Value) -> Value + Send + Sync>;

/// Registry of migration steps keyed by source version.
pub struct Migrator {
    steps: HashMap<u32, MigrationStep>,
}

impl Migrator {
    /// Empty registry, for callers that register their own steps.
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }

    /// Registry with all built-in world-state steps.
    pub fn with_defaults() -> Self {
        let mut migrator = Self::new();
        migrator.register(1, Box::new(migrate_v1_to_v2));
        migrator
    }

    /// Register the step that upgrades payloads at `from_version`.
    pub fn register(&mut self, from_version: u32, step: MigrationStep) {
        self.steps.insert(from_version, step);
    }

    /// Upgrade a payload to `target_version`.
    ///
    /// Fails when the payload declares a version newer than the target
    /// (downgrade attempt) or when no step covers an intermediate version
    /// (broken migration path). Both are fatal for the record.
    pub fn migrate(&self, payload: Value, target_version: u32) -> Result<Value> {
        let mut current = declared_version(&payload);
        if current > target_version {
            return Err(StoreError::SchemaTooNew {
                found: current,
                target: target_version,
            });
        }

        let mut migrated = payload;
        while current < target_version {
            let step = self
                .steps
                .get(&current)
                .ok_or(StoreError::MissingMigration { from: current })?;
            migrated = step(migrated);

            let stamped = declared_version(&migrated);
            if stamped != current + 1 {
                return Err(StoreError::Corruption(format!(
                    "migration step from {} stamped version {} instead of {}",
                    current,
                    stamped,
                    current + 1
                )));
            }
            current = stamped;
        }

        Ok(migrated)
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Schema version a payload declares. Legacy payloads without the field
/// are version 1.
fn declared_version(payload: &Value) -> u32 {
    payload
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32
}

/// v1 -> v2: introduce the metadata bag and backfill structural defaults.
fn migrate_v1_to_v2(payload: Value) -> Value {
    let mut obj = match payload {
        Value::Object(obj) => obj,
        other => {
            // Non-object v1 payloads get rebuilt around whatever was there.
            let mut obj = serde_json::Map::new();
            obj.insert("legacy".to_string(), other);
            obj
        }
    };

    obj.entry("metadata").or_insert_with(|| json!({}));
    obj.entry("entities").or_insert_with(|| json!({}));
    obj.entry("tick").or_insert(json!(0));
    obj.entry("world_version").or_insert(json!(0));
    obj.entry("seed").or_insert(json!(0));
    obj.insert("schema_version".to_string(), json!(2));

    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_v1_backfills_metadata() {
        let legacy = json!({
            "schema_version": 1,
            "world_version": 3,
            "seed": 7,
            "tick": 5,
            "entities": {},
            "created_at": 0,
            "updated_at": 0,
        });

        let migrated = Migrator::with_defaults()
            .migrate(legacy, CURRENT_SCHEMA_VERSION)
            .unwrap();
        assert_eq!(migrated["schema_version"], 2);
        assert_eq!(migrated["metadata"], json!({}));
        assert_eq!(migrated["world_version"], 3);
    }

    #[test]
    fn test_missing_version_field_means_v1() {
        let legacy = json!({"seed": 1});
        let migrated = Migrator::with_defaults()
            .migrate(legacy, CURRENT_SCHEMA_VERSION)
            .unwrap();
        assert_eq!(migrated["schema_version"], 2);
        assert_eq!(migrated["seed"], 1);
        assert_eq!(migrated["entities"], json!({}));
    }

    #[test]
    fn test_current_payload_passes_through() {
        let payload = json!({"schema_version": 2, "seed": 9, "metadata": {"k": "v"}});
        let migrated = Migrator::with_defaults()
            .migrate(payload.clone(), CURRENT_SCHEMA_VERSION)
            .unwrap();
        assert_eq!(migrated, payload);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let payload = json!({"schema_version": 99});
        let result = Migrator::with_defaults().migrate(payload, CURRENT_SCHEMA_VERSION);
        assert!(matches!(
            result,
            Err(StoreError::SchemaTooNew { found: 99, target: 2 })
        ));
    }

    #[test]
    fn test_broken_migration_path() {
        let payload = json!({"schema_version": 1});
        let result = Migrator::new().migrate(payload, CURRENT_SCHEMA_VERSION);
        assert!(matches!(
            result,
            Err(StoreError::MissingMigration { from: 1 })
        ));
    }

    #[test]
    fn test_migration_is_idempotent() {
        let legacy = json!({"schema_version": 1, "seed": 4});
        let migrator = Migrator::with_defaults();
        let once = migrator
            .migrate(legacy, CURRENT_SCHEMA_VERSION)
            .unwrap();
        let twice = migrator
            .migrate(once.clone(), CURRENT_SCHEMA_VERSION)
            .unwrap();
        assert_eq!(once, twice);
    }
}
