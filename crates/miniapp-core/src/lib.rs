//! Core abstractions for mini-app secure storage: identities, records, errors,
//! events, and the backing-driver contracts shared by every backend.
//! Kept free of crypto and filesystem dependencies on purpose.

pub mod driver;
pub mod error;
pub mod events;
pub mod types;

pub use driver::{DriverFactory, InMemoryDriver, InMemoryDriverFactory, StorageDriver};
pub use error::{io_err, SecureStorageError};
pub use events::StorageEvent;
pub use types::{
    serialized_size, StorageIdentity, StorageOptions, StorageRecord, StorageSizeReport,
    DEFAULT_MAX_SIZE_BYTES, STORAGE_NAME,
};
