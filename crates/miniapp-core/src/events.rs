use serde::{Deserialize, Serialize};

use crate::types::StorageIdentity;

/// Process-wide notifications emitted once per load attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageEvent {
    /// The store finished loading and is ready for reads and writes.
    Ready { identity: StorageIdentity },
    /// Loading failed; the store stays unloaded.
    Error {
        identity: StorageIdentity,
        reason: String,
    },
}

impl StorageEvent {
    pub fn identity(&self) -> &StorageIdentity {
        match self {
            StorageEvent::Ready { identity } | StorageEvent::Error { identity, .. } => identity,
        }
    }
}
