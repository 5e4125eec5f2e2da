//! Per-mini-app secure storage manager and the process-wide registry that
//! hands out one manager per identity.

pub mod manager;
pub mod registry;

pub use manager::{Completion, SecureStorage};
pub use registry::{StorageRegistry, WipeReport};
