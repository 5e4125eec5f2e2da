use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use miniapp_core::{SecureStorageError, StorageIdentity, STORAGE_NAME};
use tracing::debug;

/// On-disk layout: `<root>/<b64url(identity)>/securestorage.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Identity-scoped directory; any identity string maps to a legal path component.
    pub fn identity_dir(&self, identity: &StorageIdentity) -> PathBuf {
        self.root.join(encode_identity(identity))
    }

    pub fn store_path(&self, identity: &StorageIdentity, extension: &str) -> PathBuf {
        self.identity_dir(identity)
            .join(format!("{STORAGE_NAME}.{extension}"))
    }

    /// Identities whose directory holds a `securestorage.<ext>` file.
    pub fn discover(&self, extension: &str) -> Result<Vec<StorageIdentity>, SecureStorageError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SecureStorageError::io(err.to_string())),
        };

        let file_name = format!("{STORAGE_NAME}.{extension}");
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SecureStorageError::io(e.to_string()))?;
            let dir = entry.path();
            if !dir.join(&file_name).is_file() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(decode_identity) {
                Some(identity) => found.push(identity),
                None => debug!(?dir, "skipping directory with undecodable identity"),
            }
        }
        found.sort();
        Ok(found)
    }
}

fn encode_identity(identity: &StorageIdentity) -> String {
    URL_SAFE_NO_PAD.encode(identity.as_str())
}

fn decode_identity(name: &str) -> Option<StorageIdentity> {
    let bytes = URL_SAFE_NO_PAD.decode(name).ok()?;
    let id = String::from_utf8(bytes).ok()?;
    StorageIdentity::new(id).ok()
}
