//! Integrity envelope: content hash plus keyed signature.
//!
//! Every persisted record is wrapped with a SHA-256 hash of its canonical
//! bytes and an HMAC-SHA256 signature over that hash. Verification is pure
//! and never raises; callers treat `false` as "untrusted, do not use".

use crate::canonical::to_canonical_bytes;
use crate::error::Result;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Keyed signing material for record envelopes.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    /// Environment variable consulted by [`SigningKey::from_env`].
    pub const ENV_VAR: &'static str = "WORLD_SIGNING_KEY";

    /// Default key for non-production use.
    pub const DEV_DEFAULT: &'static str = "dev-world-signing-key";

    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        if key.is_empty() {
            return Self(Self::DEV_DEFAULT.as_bytes().to_vec());
        }
        Self(key)
    }

    /// Read the key from `WORLD_SIGNING_KEY`, falling back to the dev
    /// default when unset.
    pub fn from_env() -> Self {
        match std::env::var(Self::ENV_VAR) {
            Ok(key) => Self::new(key.into_bytes()),
            Err(_) => Self::new(Self::DEV_DEFAULT.as_bytes().to_vec()),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.0).expect("hmac key length")
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey(..)")
    }
}

/// Integrity block persisted alongside every payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrity {
    /// Hex SHA-256 of the payload's canonical bytes.
    pub content_hash: String,

    /// Hex HMAC-SHA256 over the content hash.
    pub signature: String,
}

/// Hex SHA-256 of a payload's canonical bytes.
pub fn content_hash<T: Serialize>(payload: &T) -> Result<String> {
    let bytes = to_canonical_bytes(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Seal a payload: hash its canonical bytes and sign the hash.
pub fn seal<T: Serialize>(payload: &T, key: &SigningKey) -> Result<Integrity> {
    let content_hash = content_hash(payload)?;
    let mut mac = key.mac();
    mac.update(content_hash.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    Ok(Integrity {
        content_hash,
        signature,
    })
}

/// Verify a payload against its envelope.
///
/// Recomputes the hash, then checks the signature with a constant-time
/// comparison. Returns `false` on any mismatch or malformed field.
pub fn verify<T: Serialize>(payload: &T, integrity: &Integrity, key: &SigningKey) -> bool {
    let actual_hash = match content_hash(payload) {
        Ok(h) => h,
        Err(_) => return false,
    };
    if actual_hash != integrity.content_hash {
        return false;
    }

    let signature = match hex::decode(&integrity.signature) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let mut mac = key.mac();
    mac.update(integrity.content_hash.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

/// Persisted wrapper: `{payload, integrity}`, write-once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedRecord<T> {
    pub payload: T,
    pub integrity: Integrity,
}

impl<T: Serialize> SealedRecord<T> {
    /// Seal a payload at write time.
    pub fn seal(payload: T, key: &SigningKey) -> Result<Self> {
        let integrity = seal(&payload, key)?;
        Ok(Self { payload, integrity })
    }

    /// Check the envelope at read time.
    pub fn verify(&self, key: &SigningKey) -> bool {
        verify(&self.payload, &self.integrity, key)
    }
}
