use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
};

use miniapp_core::{
    SecureStorageError, StorageDriver, StorageEvent, StorageIdentity, StorageOptions,
    StorageRecord, StorageSizeReport,
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, oneshot, Mutex as AsyncMutex, OwnedMutexGuard},
};
use tracing::{debug, info, instrument, warn};

const EVENT_CAPACITY: usize = 16;

/// Per-mini-app secure storage: one in-memory record, persisted through a
/// [`StorageDriver`].
///
/// Mutations are admitted one at a time. `set` and `remove` apply their change
/// to the in-memory record before returning, then persist the whole record
/// on the runtime; the returned [`Completion`] resolves once the save is done.
/// A mutation issued while another one is still persisting, or while a load
/// is reading the persisted record, fails with [`SecureStorageError::Busy`].
///
/// When a save fails, the in-memory record is rolled back to its state before
/// the mutation (unless it was reloaded or unloaded in between).
pub struct SecureStorage<D: StorageDriver> {
    inner: Arc<Inner<D>>,
}

impl<D: StorageDriver> Clone for SecureStorage<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<D> {
    identity: StorageIdentity,
    options: StorageOptions,
    driver: D,
    slot: Mutex<Slot>,
    write_slot: Arc<AsyncMutex<()>>,
    loading: AtomicBool,
    events: broadcast::Sender<StorageEvent>,
}

#[derive(Default)]
struct Slot {
    record: Option<StorageRecord>,
    /// Bumped on every load/unload so a late rollback never clobbers a fresh record.
    generation: u64,
}

impl<D: StorageDriver> Inner<D> {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        // Slot updates are plain assignments; a poisoned lock still guards a consistent value.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StorageEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_failure(&self, err: &SecureStorageError) {
        warn!(identity = %self.identity, error = %err, "secure storage failed to load");
        self.emit(StorageEvent::Error {
            identity: self.identity.clone(),
            reason: err.to_string(),
        });
    }

    async fn read_persisted(&self) -> Result<StorageRecord, SecureStorageError> {
        if !self.driver.is_available().await {
            return Err(SecureStorageError::unavailable(format!(
                "backing store for {} could not be opened",
                self.identity
            )));
        }
        if !self.driver.exists().await? {
            debug!(identity = %self.identity, "creating empty store on first use");
            let empty = StorageRecord::new();
            self.driver.save(&empty).await?;
            return Ok(empty);
        }
        self.driver.load().await
    }
}

impl<D: StorageDriver + 'static> SecureStorage<D> {
    /// Storage with its own event channel.
    pub fn new(identity: StorageIdentity, driver: D, options: StorageOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(identity, driver, options, events)
    }

    /// Storage publishing load events on a shared (usually process-wide) channel.
    pub fn with_events(
        identity: StorageIdentity,
        driver: D,
        options: StorageOptions,
        events: broadcast::Sender<StorageEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                options,
                driver,
                slot: Mutex::new(Slot::default()),
                write_slot: Arc::new(AsyncMutex::new(())),
                loading: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn identity(&self) -> &StorageIdentity {
        &self.inner.identity
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.inner.options.max_size_bytes
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.slot().record.is_some()
    }

    /// Informational only; reads are not blocked while loading.
    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst)
    }

    /// Whether a mutation is being persisted or a load is reading.
    pub fn is_busy(&self) -> bool {
        self.inner.write_slot.try_lock().is_err()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }

    /// Reads the persisted record and materializes it in memory.
    ///
    /// A missing store is created empty. On failure the storage is left
    /// unloaded. Waits for an in-flight mutation to be persisted first and
    /// holds off new ones until the record is in place. Emits exactly one
    /// [`StorageEvent`] per call.
    #[instrument(skip_all, fields(identity = %self.inner.identity))]
    pub async fn load(&self) -> Result<(), SecureStorageError> {
        let handle = match runtime() {
            Ok(handle) => handle,
            Err(err) => {
                self.inner.emit_failure(&err);
                return Err(err);
            }
        };
        self.inner.loading.store(true, Ordering::SeqCst);
        let _writes = self.lock_writes().await;

        let inner = Arc::clone(&self.inner);
        let result = match handle
            .spawn(async move { inner.read_persisted().await })
            .await
        {
            Ok(result) => result,
            Err(err) => Err(SecureStorageError::io(format!("load task failed: {err}"))),
        };

        {
            let mut slot = self.inner.slot();
            slot.generation += 1;
            slot.record = match &result {
                Ok(record) => Some(record.clone()),
                Err(_) => None,
            };
        }
        self.inner.loading.store(false, Ordering::SeqCst);

        match result {
            Ok(record) => {
                info!(entries = record.len(), "secure storage ready");
                self.inner.emit(StorageEvent::Ready {
                    identity: self.inner.identity.clone(),
                });
                Ok(())
            }
            Err(err) => {
                self.inner.emit_failure(&err);
                Err(err)
            }
        }
    }

    /// Drops the in-memory record; persisted data is untouched.
    pub fn unload(&self) {
        let mut slot = self.inner.slot();
        slot.record = None;
        slot.generation += 1;
        debug!(identity = %self.inner.identity, "secure storage unloaded");
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, SecureStorageError> {
        let slot = self.inner.slot();
        let record = slot.record.as_ref().ok_or_else(|| self.not_loaded())?;
        Ok(record.get(key).cloned())
    }

    /// Merges `entries` into the record (later entries win) and persists it.
    ///
    /// Busy, not-loaded and quota failures are returned immediately and leave
    /// the record untouched.
    pub fn set<I, K, V>(&self, entries: I) -> Result<Completion, SecureStorageError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let max = self.inner.options.max_size_bytes;
        let driver = &self.inner.driver;
        self.mutate(move |current| {
            let mut next = current.clone();
            next.extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));

            let required = driver.projected_size(&next)?;
            if required > max {
                return Err(SecureStorageError::QuotaExceeded { required, max });
            }
            Ok(next)
        })
    }

    /// Removes `keys` (absent keys are ignored) and persists the record.
    pub fn remove<I, K>(&self, keys: I) -> Result<Completion, SecureStorageError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.mutate(move |current| {
            let mut next = current.clone();
            for key in keys {
                next.remove(key.as_ref());
            }
            Ok(next)
        })
    }

    /// Persisted footprint against the quota, in the driver's measure; works
    /// while unloaded.
    #[instrument(skip_all, fields(identity = %self.inner.identity))]
    pub async fn size(&self) -> Result<StorageSizeReport, SecureStorageError> {
        let used_bytes = self.inner.driver.current_byte_size().await?;
        Ok(StorageSizeReport {
            used_bytes,
            max_bytes: self.inner.options.max_size_bytes,
        })
    }

    /// Deletes the persisted store. Idempotent; does not unload.
    #[instrument(skip_all, fields(identity = %self.inner.identity))]
    pub async fn clear(&self) -> Result<(), SecureStorageError> {
        self.inner.driver.delete().await?;
        info!("secure storage cleared");
        Ok(())
    }

    /// Reads the persisted record without materializing it.
    pub async fn export(&self) -> Result<StorageRecord, SecureStorageError> {
        if !self.inner.driver.exists().await? {
            return Err(SecureStorageError::Empty {
                identity: self.inner.identity.clone(),
            });
        }
        self.inner.driver.load().await
    }

    /// Waits until no mutation is in flight and holds off new ones while the
    /// guard lives.
    pub(crate) async fn lock_writes(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.inner.write_slot).lock_owned().await
    }

    fn not_loaded(&self) -> SecureStorageError {
        SecureStorageError::NotLoaded {
            identity: self.inner.identity.clone(),
        }
    }

    fn mutate<F>(&self, apply: F) -> Result<Completion, SecureStorageError>
    where
        F: FnOnce(&StorageRecord) -> Result<StorageRecord, SecureStorageError>,
    {
        let handle = runtime()?;
        let guard = Arc::clone(&self.inner.write_slot)
            .try_lock_owned()
            .map_err(|_| SecureStorageError::Busy {
                identity: self.inner.identity.clone(),
            })?;

        let (snapshot, previous, generation) = {
            let mut slot = self.inner.slot();
            let generation = slot.generation;
            let record = slot.record.as_mut().ok_or_else(|| self.not_loaded())?;
            let next = apply(&*record)?;
            let previous = std::mem::replace(record, next);
            (record.clone(), previous, generation)
        };
        debug!(
            identity = %self.inner.identity,
            entries = snapshot.len(),
            "persisting secure storage"
        );

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            let result = inner.driver.save(&snapshot).await;
            if let Err(err) = &result {
                warn!(identity = %inner.identity, error = %err, "save failed, rolling back");
                let mut slot = inner.slot();
                if slot.generation == generation && slot.record.is_some() {
                    slot.record = Some(previous);
                }
            }
            drop(guard);
            let _ = tx.send(result);
        });

        Ok(Completion { rx })
    }
}

fn runtime() -> Result<Handle, SecureStorageError> {
    Handle::try_current()
        .map_err(|e| SecureStorageError::unavailable(format!("no async runtime: {e}")))
}

/// Resolves once a mutation has been persisted (or failed to persist).
/// The storage is no longer busy by the time this resolves.
#[must_use = "the mutation is only durable once the completion resolves"]
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), SecureStorageError>>,
}

impl Future for Completion {
    type Output = Result<(), SecureStorageError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SecureStorageError::io(
                "persistence task ended without reporting",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
