//! Concrete secure storage drivers with encryption at rest.
//! Uses AES-GCM with keys sourced from the OS keyring (or test doubles),
//! persisted either as one encrypted file or as an embedded redb database
//! per mini-app.

pub mod cipher;
pub mod database_driver;
pub mod file_driver;
pub mod key_provider;
pub mod paths;

pub use database_driver::{DatabaseDriver, DatabaseDriverFactory};
pub use file_driver::{EncryptedFileDriver, EncryptedFileDriverFactory};
pub use key_provider::{InMemoryKeyProvider, KeyMaterial, KeyProvider, KeyringProvider};
pub use paths::StorageLayout;
