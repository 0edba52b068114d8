//! Canonical byte-stable encoding.
//!
//! Hashing and signing require that identical logical content always
//! produces identical bytes, across processes and platforms. Payloads are
//! first converted to a `serde_json::Value` (whose object maps are sorted
//! by key) and then written compactly with no incidental whitespace.

use crate::error::Result;
use serde::Serialize;

/// Encode a payload deterministically.
///
/// Two payloads that serialize to the same logical JSON yield identical
/// bytes regardless of struct field declaration order or map insertion
/// order.
pub fn to_canonical_bytes<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    // Round-trip through Value so map keys come out sorted.
    let value = serde_json::to_value(payload)?;
    Ok(serde_json::to_vec(&value)?)
}
