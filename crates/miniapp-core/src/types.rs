use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, SecureStorageError};

/// Fixed name used to derive the persisted file/table for every identity.
pub const STORAGE_NAME: &str = "securestorage";

/// Default quota per mini-app store.
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 2_000_000;

/// Logical content of one mini-app's store.
pub type StorageRecord = BTreeMap<String, String>;

/// Opaque identifier of one mini-app's storage namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageIdentity(String);

impl StorageIdentity {
    /// Builds an identity; empty (or whitespace-only) ids are rejected.
    pub fn new(id: impl Into<String>) -> Result<Self, SecureStorageError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SecureStorageError::unavailable(
                "storage identity must not be empty",
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorageIdentity {
    type Error = SecureStorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StorageIdentity> for String {
    fn from(value: StorageIdentity) -> Self {
        value.0
    }
}

/// Current utilization of a store against its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSizeReport {
    pub used_bytes: u64,
    pub max_bytes: u64,
}

/// Construction-time options for a secure storage manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Upper bound on the serialized record size.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
        }
    }
}

fn default_max_size_bytes() -> u64 {
    DEFAULT_MAX_SIZE_BYTES
}

/// Size of a record in its canonical (compact JSON) encoding, the plaintext
/// every driver encrypts or frames.
pub fn serialized_size(record: &StorageRecord) -> Result<u64, SecureStorageError> {
    let bytes = serde_json::to_vec(record).map_err(io_err)?;
    Ok(bytes.len() as u64)
}
