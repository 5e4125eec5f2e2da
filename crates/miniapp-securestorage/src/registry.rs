use std::{
    collections::{BTreeSet, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use miniapp_core::{
    DriverFactory, SecureStorageError, StorageDriver, StorageEvent, StorageIdentity,
    StorageOptions,
};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::manager::SecureStorage;

const EVENT_CAPACITY: usize = 64;

/// Outcome of a bulk wipe.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WipeReport {
    pub wiped: Vec<StorageIdentity>,
    pub failed: Vec<(StorageIdentity, SecureStorageError)>,
}

impl WipeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Process-wide directory of secure storages, one per mini-app identity.
///
/// Storages are created lazily on first request and kept until wiped. All of
/// them publish load events on the registry's shared channel. Share the
/// registry (e.g. behind an `Arc`) instead of building a second one over the
/// same data root, so only one live storage exists per identity.
pub struct StorageRegistry<F: DriverFactory> {
    factory: F,
    options: StorageOptions,
    storages: Mutex<HashMap<StorageIdentity, SecureStorage<F::Driver>>>,
    events: broadcast::Sender<StorageEvent>,
}

impl<F: DriverFactory> StorageRegistry<F> {
    pub fn new(factory: F, options: StorageOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            factory,
            options,
            storages: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn options(&self) -> StorageOptions {
        self.options
    }

    /// Receives `Ready`/`Error` events from every storage of this registry.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Returns the storage for `identity`, creating it on first request.
    pub fn storage(
        &self,
        identity: &StorageIdentity,
    ) -> Result<SecureStorage<F::Driver>, SecureStorageError> {
        let mut storages = self.storages();
        if let Some(existing) = storages.get(identity) {
            return Ok(existing.clone());
        }

        let driver = self.factory.open(identity)?;
        let storage = SecureStorage::with_events(
            identity.clone(),
            driver,
            self.options,
            self.events.clone(),
        );
        storages.insert(identity.clone(), storage.clone());
        Ok(storage)
    }

    /// The live storage for `identity`, if one was created.
    pub fn live(&self, identity: &StorageIdentity) -> Option<SecureStorage<F::Driver>> {
        self.storages().get(identity).cloned()
    }

    /// Live identities plus every identity with persisted data under the factory's root.
    pub fn identities(&self) -> Result<Vec<StorageIdentity>, SecureStorageError> {
        let mut all: BTreeSet<StorageIdentity> = self.storages().keys().cloned().collect();
        all.extend(self.factory.discover()?);
        Ok(all.into_iter().collect())
    }

    /// Deletes persisted storage for one identity, live or not. Idempotent.
    ///
    /// A live storage is unloaded and forgotten once its data is gone; an
    /// in-flight mutation is allowed to finish before the data is removed.
    /// If the delete fails the storage stays registered and loaded.
    #[instrument(skip_all, fields(identity = %identity))]
    pub async fn wipe(&self, identity: &StorageIdentity) -> Result<(), SecureStorageError> {
        match self.live(identity) {
            Some(storage) => {
                let _writes = storage.lock_writes().await;
                storage.clear().await?;
                storage.unload();
                self.storages().remove(identity);
            }
            None => {
                self.factory.open(identity)?.delete().await?;
            }
        }
        info!("secure storage wiped");
        Ok(())
    }

    /// Wipes every live and discoverable identity. Best effort: a failure is
    /// logged and recorded, and the remaining identities are still wiped.
    #[instrument(skip_all)]
    pub async fn wipe_all(&self) -> WipeReport {
        let mut targets: BTreeSet<StorageIdentity> = self.storages().keys().cloned().collect();
        match self.factory.discover() {
            Ok(found) => targets.extend(found),
            Err(err) => warn!(error = %err, "could not enumerate persisted storages"),
        }

        let mut report = WipeReport::default();
        for identity in targets {
            match self.wipe(&identity).await {
                Ok(()) => report.wiped.push(identity),
                Err(err) => {
                    warn!(identity = %identity, error = %err, "failed to wipe secure storage");
                    report.failed.push((identity, err));
                }
            }
        }
        info!(
            wiped = report.wiped.len(),
            failed = report.failed.len(),
            "wipe-all finished"
        );
        report
    }

    fn storages(&self) -> MutexGuard<'_, HashMap<StorageIdentity, SecureStorage<F::Driver>>> {
        self.storages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
