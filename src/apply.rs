//! Operation application.
//!
//! Shared by whole-world diff replay and per-chunk patch replay, so both
//! granularities have identical mutation semantics.

use crate::error::{Result, StoreError};
use crate::migrate::CURRENT_SCHEMA_VERSION;
use crate::types::{EntityRecord, Operation, Timestamp, WorldState};
use serde_json::Value;
use std::collections::BTreeMap;

/// Apply one operation to an entity map in place.
pub fn apply_to_entities(
    entities: &mut BTreeMap<String, EntityRecord>,
    operation: &Operation,
) -> Result<()> {
    match operation {
        Operation::Set { entity_id, value } => {
            entities.insert(entity_id.clone(), value.clone());
        }
        Operation::Patch { entity_id, value } => {
            let fields = match value {
                Value::Object(fields) => fields,
                other => {
                    return Err(StoreError::InvalidOperation(format!(
                        "patch value for '{}' must be an object, got {}",
                        entity_id,
                        json_kind(other)
                    )));
                }
            };

            // Merge atop the existing record; a non-object record is
            // treated as empty so the patch still lands.
            let mut merged = match entities.get(entity_id) {
                Some(Value::Object(existing)) => existing.clone(),
                _ => serde_json::Map::new(),
            };
            for (key, field) in fields {
                merged.insert(key.clone(), field.clone());
            }
            entities.insert(entity_id.clone(), Value::Object(merged));
        }
        Operation::Delete { entity_id } => {
            entities.remove(entity_id);
        }
    }
    Ok(())
}

/// Apply an ordered list of operations to a state, producing the successor
/// state at `world_version + 1`.
///
/// Operations apply in list order; a later operation targeting the same
/// entity wins. The input state is never mutated.
pub fn apply_operations(state: &WorldState, operations: &[Operation]) -> Result<WorldState> {
    let mut entities = state.entities.clone();
    for operation in operations {
        apply_to_entities(&mut entities, operation)?;
    }

    Ok(WorldState {
        schema_version: CURRENT_SCHEMA_VERSION,
        world_version: state.world_version.next(),
        seed: state.seed,
        tick: state.tick + 1,
        entities,
        metadata: state.metadata.clone(),
        created_at: state.created_at,
        updated_at: Timestamp::now(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
