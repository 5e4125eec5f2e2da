//! Embedded transactional driver backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! One database file per identity, one table named after the storage
//! constant: `key → nonce || AES-GCM(value)`. Each row is sealed with
//! `identity || 0x00 || key` as associated data, so rows cannot be moved
//! between keys or mini-apps without failing authentication.
//!
//! ## Size Accounting
//!
//! The reported size is the bytes held in rows (key plus sealed value). The
//! database file is larger: redb preallocates pages and keeps free space for
//! copy-on-write commits, none of which counts against the quota.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use miniapp_core::{
    DriverFactory, SecureStorageError, StorageDriver, StorageIdentity, StorageRecord,
    STORAGE_NAME,
};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, instrument};

use crate::{
    cipher::{cipher_from, framed_len, open_framed, seal_framed},
    key_provider::KeyProvider,
    paths::StorageLayout,
};

/// File extension of the database file.
pub const DB_EXTENSION: &str = "redb";

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new(STORAGE_NAME);

/// Row-per-key driver. The database handle is opened lazily on first use and
/// released before the file is deleted.
pub struct DatabaseDriver<P: KeyProvider> {
    identity: StorageIdentity,
    path: PathBuf,
    key_provider: P,
    db: Mutex<Option<Database>>,
}

impl<P: KeyProvider> DatabaseDriver<P> {
    pub fn new(layout: &StorageLayout, identity: StorageIdentity, key_provider: P) -> Self {
        let path = layout.store_path(&identity, DB_EXTENSION);
        Self {
            identity,
            path,
            key_provider,
            db: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` against the open database, creating the file and table on first use.
    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, SecureStorageError>,
    ) -> Result<T, SecureStorageError> {
        let mut slot = self
            .db
            .lock()
            .map_err(|err| SecureStorageError::io(format!("lock poisoned: {err}")))?;

        if slot.is_none() {
            *slot = Some(open_database(&self.path)?);
        }
        match slot.as_ref() {
            Some(db) => f(db),
            None => Err(SecureStorageError::unavailable("database not open")),
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.db.lock(), Ok(slot) if slot.is_some())
    }

    fn row_aad(&self, key: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.identity.as_str().len() + 1 + key.len());
        aad.extend_from_slice(self.identity.as_str().as_bytes());
        aad.push(0);
        aad.extend_from_slice(key.as_bytes());
        aad
    }
}

fn open_database(path: &Path) -> Result<Database, SecureStorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| SecureStorageError::unavailable(format!("create directory: {e}")))?;
    }
    let db = Database::create(path)
        .map_err(|e| SecureStorageError::unavailable(format!("open database: {e}")))?;

    // Pre-create the table so later read transactions don't fail
    let write_txn = db.begin_write().map_err(storage_err)?;
    {
        let _ = write_txn.open_table(ENTRIES).map_err(storage_err)?;
    }
    write_txn.commit().map_err(storage_err)?;

    debug!(?path, "opened secure storage database");
    Ok(db)
}

#[async_trait]
impl<P: KeyProvider> StorageDriver for DatabaseDriver<P> {
    #[instrument(skip_all, fields(identity = %self.identity))]
    async fn load(&self) -> Result<StorageRecord, SecureStorageError> {
        if !self.is_open() && !self.path.is_file() {
            debug!("no persisted store yet");
            return Ok(StorageRecord::new());
        }

        let cipher = cipher_from(&self.key_provider).await?;
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(storage_err)?;
            let table = read_txn.open_table(ENTRIES).map_err(storage_err)?;

            let mut record = StorageRecord::new();
            for entry in table.iter().map_err(storage_err)? {
                let (key, sealed) = entry.map_err(storage_err)?;
                let key = key.value().to_string();
                let plaintext = open_framed(&cipher, sealed.value(), &self.row_aad(&key))?;
                let value = String::from_utf8(plaintext).map_err(storage_err)?;
                record.insert(key, value);
            }
            Ok(record)
        })
    }

    #[instrument(skip_all, fields(identity = %self.identity, entries = record.len()))]
    async fn save(&self, record: &StorageRecord) -> Result<(), SecureStorageError> {
        let cipher = cipher_from(&self.key_provider).await?;
        let sealed = record
            .iter()
            .map(|(key, value)| {
                seal_framed(&cipher, value.as_bytes(), &self.row_aad(key))
                    .map(|bytes| (key.as_str(), bytes))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.with_db(|db| {
            let write_txn = db.begin_write().map_err(storage_err)?;
            {
                let mut table = write_txn.open_table(ENTRIES).map_err(storage_err)?;

                let mut stale = Vec::new();
                for entry in table.iter().map_err(storage_err)? {
                    let (key, _) = entry.map_err(storage_err)?;
                    if !record.contains_key(key.value()) {
                        stale.push(key.value().to_string());
                    }
                }
                for key in &stale {
                    table.remove(key.as_str()).map_err(storage_err)?;
                }
                for (key, bytes) in &sealed {
                    table.insert(*key, bytes.as_slice()).map_err(storage_err)?;
                }
            }
            write_txn.commit().map_err(storage_err)?;
            Ok(())
        })
    }

    #[instrument(skip_all, fields(identity = %self.identity))]
    async fn delete(&self) -> Result<(), SecureStorageError> {
        {
            let mut slot = self
                .db
                .lock()
                .map_err(|err| SecureStorageError::io(format!("lock poisoned: {err}")))?;
            slot.take();
        }

        match fs::remove_file(&self.path) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(storage_err(err)),
        }
        if let Some(dir) = self.path.parent() {
            let _ = fs::remove_dir(dir);
        }
        Ok(())
    }

    async fn current_byte_size(&self) -> Result<u64, SecureStorageError> {
        if !self.is_open() && !self.path.is_file() {
            return Ok(0);
        }
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(storage_err)?;
            let table = read_txn.open_table(ENTRIES).map_err(storage_err)?;

            let mut total = 0u64;
            for entry in table.iter().map_err(storage_err)? {
                let (key, sealed) = entry.map_err(storage_err)?;
                total += (key.value().len() + sealed.value().len()) as u64;
            }
            Ok(total)
        })
    }

    fn projected_size(&self, record: &StorageRecord) -> Result<u64, SecureStorageError> {
        Ok(record
            .iter()
            .map(|(key, value)| (key.len() + framed_len(value.len())) as u64)
            .sum())
    }

    async fn exists(&self) -> Result<bool, SecureStorageError> {
        Ok(self.path.is_file())
    }

    async fn is_available(&self) -> bool {
        self.with_db(|_| Ok(())).is_ok() && self.key_provider.get_or_create().await.is_ok()
    }
}

/// Builds `DatabaseDriver`s rooted at one data directory, sharing a key provider.
pub struct DatabaseDriverFactory<P: KeyProvider> {
    layout: StorageLayout,
    key_provider: Arc<P>,
}

impl<P: KeyProvider> DatabaseDriverFactory<P> {
    pub fn new(root: impl Into<PathBuf>, key_provider: P) -> Self {
        Self {
            layout: StorageLayout::new(root),
            key_provider: Arc::new(key_provider),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }
}

impl<P: KeyProvider + 'static> DriverFactory for DatabaseDriverFactory<P> {
    type Driver = DatabaseDriver<Arc<P>>;

    fn open(&self, identity: &StorageIdentity) -> Result<Self::Driver, SecureStorageError> {
        Ok(DatabaseDriver::new(
            &self.layout,
            identity.clone(),
            Arc::clone(&self.key_provider),
        ))
    }

    fn discover(&self) -> Result<Vec<StorageIdentity>, SecureStorageError> {
        self.layout.discover(DB_EXTENSION)
    }
}

fn storage_err<E: ToString>(err: E) -> SecureStorageError {
    SecureStorageError::Io {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_provider::InMemoryKeyProvider;

    fn record(pairs: &[(&str, &str)]) -> StorageRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn driver(
        root: &Path,
        id: &str,
        keys: InMemoryKeyProvider,
    ) -> DatabaseDriver<InMemoryKeyProvider> {
        DatabaseDriver::new(
            &StorageLayout::new(root),
            StorageIdentity::new(id).expect("id"),
            keys,
        )
    }

    #[tokio::test]
    async fn round_trip_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys = InMemoryKeyProvider::default();
        let saved = record(&[("a", "1"), ("b", "secret-value")]);
        {
            let db = driver(dir.path(), "app-1", keys.clone());
            db.save(&saved).await.expect("save");
        }

        let reopened = driver(dir.path(), "app-1", keys);
        assert_eq!(reopened.load().await.expect("load"), saved);

        let raw = fs::read(reopened.path()).expect("read db file");
        assert!(!String::from_utf8_lossy(&raw).contains("secret-value"));
    }

    #[tokio::test]
    async fn load_without_file_does_not_create_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = driver(dir.path(), "fresh", InMemoryKeyProvider::default());

        assert!(db.load().await.expect("load").is_empty());
        assert!(!db.exists().await.expect("exists"));
        assert_eq!(db.current_byte_size().await.expect("size"), 0);
    }

    #[tokio::test]
    async fn save_drops_removed_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = driver(dir.path(), "app-1", InMemoryKeyProvider::default());

        db.save(&record(&[("a", "1"), ("b", "2"), ("c", "3")]))
            .await
            .expect("save");
        db.save(&record(&[("b", "20")])).await.expect("save");

        assert_eq!(db.load().await.expect("load"), record(&[("b", "20")]));
    }

    #[tokio::test]
    async fn size_counts_rows_not_preallocated_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = driver(dir.path(), "app-1", InMemoryKeyProvider::default());

        let saved = record(&[("a", "1"), ("long", "v".repeat(300).as_str())]);
        let projected = db.projected_size(&saved).expect("projected");
        // 1 + 12 + 1 + 16 and 4 + 12 + 300 + 16
        assert_eq!(projected, 30 + 332);

        db.save(&saved).await.expect("save");
        assert_eq!(db.current_byte_size().await.expect("size"), projected);
        let file_len = fs::metadata(db.path()).expect("metadata").len();
        assert!(file_len > projected);

        db.save(&StorageRecord::new()).await.expect("save");
        assert_eq!(db.current_byte_size().await.expect("size"), 0);
    }

    #[tokio::test]
    async fn wrong_key_fails_to_decrypt() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = driver(dir.path(), "app-1", InMemoryKeyProvider::with_key([1u8; 32]));
            db.save(&record(&[("a", "1")])).await.expect("save");
        }

        let other = driver(dir.path(), "app-1", InMemoryKeyProvider::with_key([2u8; 32]));
        let err = other.load().await.expect_err("must not decrypt");
        assert!(matches!(err, SecureStorageError::Io { .. }));
    }

    #[tokio::test]
    async fn delete_closes_and_removes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = driver(dir.path(), "app-1", InMemoryKeyProvider::default());
        db.save(&record(&[("a", "1")])).await.expect("save");
        assert!(db.current_byte_size().await.expect("size") > 0);

        db.delete().await.expect("delete");
        db.delete().await.expect("delete again");
        assert!(!db.exists().await.expect("exists"));

        // usable again after delete
        db.save(&record(&[("z", "26")])).await.expect("save");
        assert_eq!(db.load().await.expect("load"), record(&[("z", "26")]));
    }

    #[tokio::test]
    async fn factory_discovers_database_identities() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = DatabaseDriverFactory::new(dir.path(), InMemoryKeyProvider::default());
        let id = StorageIdentity::new("app-db").expect("id");

        let db = factory.open(&id).expect("open");
        assert!(db.is_available().await);
        assert_eq!(factory.discover().expect("discover"), vec![id]);
    }
}
