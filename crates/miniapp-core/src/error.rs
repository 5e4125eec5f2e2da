use thiserror::Error;

use crate::types::StorageIdentity;

/// Errors produced by the secure storage manager and its drivers.
///
/// Drivers translate their native failures (filesystem, database, cipher)
/// into `Io` or `Unavailable`, so callers only ever match on this taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecureStorageError {
    /// No record is materialized (never loaded, or unloaded since).
    #[error("secure storage for {identity} is not loaded")]
    NotLoaded { identity: StorageIdentity },
    /// Another mutation is still in flight on the same storage.
    #[error("secure storage for {identity} is busy")]
    Busy { identity: StorageIdentity },
    /// The prospective record would not fit in the configured quota.
    #[error("secure storage quota exceeded: {required} bytes required, {max} allowed")]
    QuotaExceeded { required: u64, max: u64 },
    /// The backing store could not be opened or initialized.
    #[error("secure storage unavailable: {reason}")]
    Unavailable { reason: String },
    /// Read, write, or (de)serialization failure in the backing store.
    #[error("secure storage i/o failure: {reason}")]
    Io { reason: String },
    /// Nothing has ever been persisted for the identity.
    #[error("secure storage for {identity} is empty")]
    Empty { identity: StorageIdentity },
}

impl SecureStorageError {
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Maps any displayable failure into `SecureStorageError::Io`.
pub fn io_err<E: ToString>(err: E) -> SecureStorageError {
    SecureStorageError::Io {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_identity() {
        let err = SecureStorageError::NotLoaded {
            identity: StorageIdentity::new("app-1").expect("identity"),
        };
        assert_eq!(err.to_string(), "secure storage for app-1 is not loaded");

        let err = SecureStorageError::QuotaExceeded {
            required: 12,
            max: 10,
        };
        assert!(err.to_string().contains("12 bytes required"));
    }
}
