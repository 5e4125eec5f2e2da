use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use miniapp_core::{
    DriverFactory, SecureStorageError, StorageDriver, StorageIdentity, StorageRecord,
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::{
    cipher::{cipher_from, open, seal, sealed_len, NONCE_LEN},
    key_provider::KeyProvider,
    paths::StorageLayout,
};

/// File extension of the encrypted envelope.
pub const FILE_EXTENSION: &str = "json";

const ENVELOPE_VERSION: u8 = 1;

/// AES-GCM encrypted single-file driver: the whole record is rewritten on
/// every save through a temp file that is atomically renamed over the target.
pub struct EncryptedFileDriver<P: KeyProvider> {
    identity: StorageIdentity,
    path: PathBuf,
    key_provider: P,
}

impl<P: KeyProvider> EncryptedFileDriver<P> {
    pub fn new(layout: &StorageLayout, identity: StorageIdentity, key_provider: P) -> Self {
        let path = layout.store_path(&identity, FILE_EXTENSION);
        Self {
            identity,
            path,
            key_provider,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u8,
    nonce: String,
    ciphertext: String,
}

#[async_trait]
impl<P: KeyProvider> StorageDriver for EncryptedFileDriver<P> {
    #[instrument(skip_all, fields(identity = %self.identity))]
    async fn load(&self) -> Result<StorageRecord, SecureStorageError> {
        let Some(envelope) = read_envelope(&self.path)? else {
            debug!("no persisted store yet");
            return Ok(StorageRecord::new());
        };
        if envelope.version != ENVELOPE_VERSION {
            return Err(SecureStorageError::io(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }

        let nonce = URL_SAFE_NO_PAD
            .decode(envelope.nonce)
            .map_err(|e| SecureStorageError::io(format!("nonce decode failed: {e}")))?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(envelope.ciphertext)
            .map_err(|e| SecureStorageError::io(format!("ciphertext decode failed: {e}")))?;

        let cipher = cipher_from(&self.key_provider).await?;
        let plaintext = open(&cipher, &nonce, &ciphertext, self.identity.as_str().as_bytes())?;
        serde_json::from_slice(&plaintext).map_err(storage_err)
    }

    #[instrument(skip_all, fields(identity = %self.identity, entries = record.len()))]
    async fn save(&self, record: &StorageRecord) -> Result<(), SecureStorageError> {
        let plaintext = serde_json::to_vec(record).map_err(storage_err)?;
        let cipher = cipher_from(&self.key_provider).await?;
        let (nonce, ciphertext) = seal(&cipher, &plaintext, self.identity.as_str().as_bytes())?;

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        };
        write_envelope(&self.path, &envelope)
    }

    #[instrument(skip_all, fields(identity = %self.identity))]
    async fn delete(&self) -> Result<(), SecureStorageError> {
        match fs::remove_file(&self.path) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(storage_err(err)),
        }
        if let Some(dir) = self.path.parent() {
            // Only succeeds when nothing else lives in the identity directory.
            let _ = fs::remove_dir(dir);
        }
        Ok(())
    }

    async fn current_byte_size(&self) -> Result<u64, SecureStorageError> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(storage_err(err)),
        }
    }

    fn projected_size(&self, record: &StorageRecord) -> Result<u64, SecureStorageError> {
        let plaintext = serde_json::to_vec(record).map_err(storage_err)?;
        envelope_len(plaintext.len())
    }

    async fn exists(&self) -> Result<bool, SecureStorageError> {
        Ok(self.path.is_file())
    }

    async fn is_available(&self) -> bool {
        let dir_ok = self
            .path
            .parent()
            .is_some_and(|dir| fs::create_dir_all(dir).is_ok());
        dir_ok && self.key_provider.get_or_create().await.is_ok()
    }
}

/// Builds `EncryptedFileDriver`s rooted at one data directory, sharing a key provider.
pub struct EncryptedFileDriverFactory<P: KeyProvider> {
    layout: StorageLayout,
    key_provider: Arc<P>,
}

impl<P: KeyProvider> EncryptedFileDriverFactory<P> {
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

impl<P: KeyProvider + 'static> DriverFactory for EncryptedFileDriverFactory<P> {
    type Driver = EncryptedFileDriver<Arc<P>>;

    fn open(&self, identity: &StorageIdentity) -> Result<Self::Driver, SecureStorageError> {
        Ok(EncryptedFileDriver::new(
            &self.layout,
            identity.clone(),
            Arc::clone(&self.key_provider),
        ))
    }

    fn discover(&self) -> Result<Vec<StorageIdentity>, SecureStorageError> {
        self.layout.discover(FILE_EXTENSION)
    }
}

/// Exact length of the written envelope for `plaintext_len` bytes of record JSON.
/// Base64 output needs no JSON escaping, so the wrapper adds a fixed amount.
fn envelope_len(plaintext_len: usize) -> Result<u64, SecureStorageError> {
    let wrapper = serde_json::to_vec(&Envelope {
        version: ENVELOPE_VERSION,
        nonce: String::new(),
        ciphertext: String::new(),
    })
    .map_err(storage_err)?;
    let nonce = base64::encoded_len(NONCE_LEN, false);
    let ciphertext = base64::encoded_len(sealed_len(plaintext_len), false);
    match (nonce, ciphertext) {
        (Some(nonce), Some(ciphertext)) => Ok((wrapper.len() + nonce + ciphertext) as u64),
        _ => Err(SecureStorageError::io("record too large to encode")),
    }
}

fn write_envelope(path: &Path, envelope: &Envelope) -> Result<(), SecureStorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| SecureStorageError::io("invalid storage path"))?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    let json = serde_json::to_vec(envelope).map_err(storage_err)?;
    tmp.write_all(&json).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.as_file().sync_all().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn read_envelope(path: &Path) -> Result<Option<Envelope>, SecureStorageError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(storage_err(err)),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    serde_json::from_slice(&buf).map(Some).map_err(storage_err)
}

fn storage_err<E: ToString>(err: E) -> SecureStorageError {
    SecureStorageError::Io {
        reason: err.to_string(),
    }
}
