use std::{
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key material used for encrypting mini-app stores at rest.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Identifier for logging/rotation (never log key bytes).
    pub id: String,
    /// 256-bit symmetric key.
    pub bytes: [u8; 32],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
}

/// Provides the storage master key (OS keychain in production; memory in tests).
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError>;
}

#[async_trait]
impl<P: KeyProvider + ?Sized> KeyProvider for Arc<P> {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        (**self).get_or_create().await
    }
}

/// OS keyring-backed provider. The key is fetched once and cached for the
/// lifetime of the provider so every save does not hit the keychain.
pub struct KeyringProvider {
    service: String,
    account: String,
    cached: Mutex<Option<KeyMaterial>>,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
            cached: Mutex::new(None),
        }
    }

    fn fetch(&self) -> Result<KeyMaterial, KeyError> {
        let entry = keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| KeyError::Keyring(e.to_string()))?;

        match entry.get_password() {
            Ok(secret) => decode_key(&secret),
            Err(keyring::Error::NoEntry) => {
                debug!(service = %self.service, "creating storage master key");
                let material = generate_key();
                entry
                    .set_password(&encode_key(&material))
                    .map_err(|e| KeyError::Keyring(e.to_string()))?;
                Ok(material)
            }
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }
}

#[async_trait]
impl KeyProvider for KeyringProvider {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|err| KeyError::Keyring(format!("lock poisoned: {err}")))?;
        if let Some(existing) = cached.as_ref() {
            return Ok(existing.clone());
        }

        // Keyring operations are synchronous; the guard is never held across an await.
        let material = self.fetch()?;
        *cached = Some(material.clone());
        Ok(material)
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
}

impl InMemoryKeyProvider {
    /// Provider seeded with a fixed key, e.g. to reopen a store in tests.
    pub fn with_key(bytes: [u8; 32]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(KeyMaterial {
                id: "fixed".to_string(),
                bytes,
            }))),
        }
    }
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        let material = generate_key();
        *guard = Some(material.clone());
        Ok(material)
    }
}

fn generate_key() -> KeyMaterial {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    KeyMaterial {
        id: "securestorage".to_string(),
        bytes,
    }
}

fn encode_key(material: &KeyMaterial) -> String {
    general_purpose::STANDARD.encode(material.bytes)
}

fn decode_key(secret: &str) -> Result<KeyMaterial, KeyError> {
    let mut bytes = general_purpose::STANDARD
        .decode(secret)
        .map_err(|e| KeyError::Decode(e.to_string()))?;

    if bytes.len() != 32 {
        let len = bytes.len();
        bytes.zeroize();
        return Err(KeyError::Decode(format!("expected 32 bytes, got {len}")));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(KeyMaterial {
        id: "securestorage".to_string(),
        bytes: out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_provider_returns_same_key() {
        let provider = InMemoryKeyProvider::default();
        let first = provider.get_or_create().await.unwrap();
        let second = provider.get_or_create().await.unwrap();

        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn fixed_key_is_returned_verbatim() {
        let provider = InMemoryKeyProvider::with_key([7u8; 32]);
        let key = provider.get_or_create().await.unwrap();
        assert_eq!(key.bytes, [7u8; 32]);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode_key("abcd").expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }

    #[test]
    fn encode_decode_preserves_key() {
        let material = generate_key();
        let decoded = decode_key(&encode_key(&material)).expect("decode");
        assert_eq!(decoded.bytes, material.bytes);
    }

    #[test]
    fn debug_output_redacts_bytes() {
        let rendered = format!("{:?}", generate_key());
        assert!(rendered.contains("<redacted>"));
    }
}
