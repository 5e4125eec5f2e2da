use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;

use crate::{
    error::{io_err, SecureStorageError},
    types::{serialized_size, StorageIdentity, StorageRecord},
};

/// Persistence contract for one mini-app identity.
///
/// Implementations own encryption at rest; callers only ever see plain
/// strings. `save` must replace prior content atomically.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Read the full persisted record; an empty map when nothing was written yet.
    async fn load(&self) -> Result<StorageRecord, SecureStorageError>;

    /// Durably persist `record`, replacing whatever was stored before.
    async fn save(&self, record: &StorageRecord) -> Result<(), SecureStorageError>;

    /// Remove all persisted state (idempotent).
    async fn delete(&self) -> Result<(), SecureStorageError>;

    /// Persisted footprint in bytes, 0 when nothing exists.
    async fn current_byte_size(&self) -> Result<u64, SecureStorageError>;

    /// What `current_byte_size` would report right after `save(record)`.
    /// The quota is enforced against this figure, so it must use the same measure.
    fn projected_size(&self, record: &StorageRecord) -> Result<u64, SecureStorageError>;

    /// Whether anything has been persisted for this identity.
    async fn exists(&self) -> Result<bool, SecureStorageError>;

    /// Whether the underlying store can currently be used.
    async fn is_available(&self) -> bool;
}

#[async_trait]
impl<D: StorageDriver + ?Sized> StorageDriver for Arc<D> {
    async fn load(&self) -> Result<StorageRecord, SecureStorageError> {
        (**self).load().await
    }

    async fn save(&self, record: &StorageRecord) -> Result<(), SecureStorageError> {
        (**self).save(record).await
    }

    async fn delete(&self) -> Result<(), SecureStorageError> {
        (**self).delete().await
    }

    async fn current_byte_size(&self) -> Result<u64, SecureStorageError> {
        (**self).current_byte_size().await
    }

    fn projected_size(&self, record: &StorageRecord) -> Result<u64, SecureStorageError> {
        (**self).projected_size(record)
    }

    async fn exists(&self) -> Result<bool, SecureStorageError> {
        (**self).exists().await
    }

    async fn is_available(&self) -> bool {
        (**self).is_available().await
    }
}

/// Creates drivers per identity and enumerates identities already on disk.
pub trait DriverFactory: Send + Sync {
    type Driver: StorageDriver + 'static;

    /// Open (without loading) the driver for `identity`.
    fn open(&self, identity: &StorageIdentity) -> Result<Self::Driver, SecureStorageError>;

    /// Identities that have persisted state, whether or not a manager exists for them.
    fn discover(&self) -> Result<Vec<StorageIdentity>, SecureStorageError>;
}

/// In-memory driver that masks its payload, for tests and smoke runs.
/// Not cryptographically secure; production code uses the drivers in
/// `miniapp-storage`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDriver {
    inner: Arc<Mutex<Option<Vec<u8>>>>,
    fail_saves: Arc<AtomicBool>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail with an i/o error (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make the driver report itself as unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Vec<u8>>>, SecureStorageError> {
        self.inner
            .lock()
            .map_err(|err| SecureStorageError::io(format!("lock poisoned: {err}")))
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    async fn load(&self) -> Result<StorageRecord, SecureStorageError> {
        let slot = self.slot()?;
        match slot.as_ref() {
            Some(masked) => serde_json::from_slice(&mask(masked)).map_err(io_err),
            None => Ok(StorageRecord::new()),
        }
    }

    async fn save(&self, record: &StorageRecord) -> Result<(), SecureStorageError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(SecureStorageError::io("injected save failure"));
        }
        let bytes = serde_json::to_vec(record).map_err(io_err)?;
        *self.slot()? = Some(mask(&bytes));
        Ok(())
    }

    async fn delete(&self) -> Result<(), SecureStorageError> {
        self.slot()?.take();
        Ok(())
    }

    async fn current_byte_size(&self) -> Result<u64, SecureStorageError> {
        Ok(self.slot()?.as_ref().map_or(0, |bytes| bytes.len() as u64))
    }

    fn projected_size(&self, record: &StorageRecord) -> Result<u64, SecureStorageError> {
        // masking keeps the length
        serialized_size(record)
    }

    async fn exists(&self) -> Result<bool, SecureStorageError> {
        Ok(self.slot()?.is_some())
    }

    async fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

/// Factory handing out shared `InMemoryDriver`s, one per identity.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDriverFactory {
    drivers: Arc<Mutex<HashMap<StorageIdentity, InMemoryDriver>>>,
}

impl InMemoryDriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the driver for `identity`, creating it if needed.
    pub fn driver(&self, identity: &StorageIdentity) -> Result<InMemoryDriver, SecureStorageError> {
        let mut drivers = self
            .drivers
            .lock()
            .map_err(|err| SecureStorageError::io(format!("lock poisoned: {err}")))?;
        Ok(drivers.entry(identity.clone()).or_default().clone())
    }
}

impl DriverFactory for InMemoryDriverFactory {
    type Driver = InMemoryDriver;

    fn open(&self, identity: &StorageIdentity) -> Result<Self::Driver, SecureStorageError> {
        self.driver(identity)
    }

    fn discover(&self) -> Result<Vec<StorageIdentity>, SecureStorageError> {
        let drivers = self
            .drivers
            .lock()
            .map_err(|err| SecureStorageError::io(format!("lock poisoned: {err}")))?;
        let mut found: Vec<StorageIdentity> = drivers
            .iter()
            .filter(|(_, driver)| matches!(driver.inner.lock(), Ok(slot) if slot.is_some()))
            .map(|(identity, _)| identity.clone())
            .collect();
        found.sort();
        Ok(found)
    }
}

const MASK_BYTE: u8 = 0xA5;

fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}
