//! AES-256-GCM sealing shared by the file and database drivers.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use miniapp_core::SecureStorageError;

use crate::key_provider::{KeyMaterial, KeyProvider};

/// Length of the random AES-GCM nonce prefixed to every sealed value.
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Ciphertext length produced by [`seal`] for `plaintext_len` input bytes.
pub fn sealed_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_LEN
}

/// Frame length produced by [`seal_framed`] for `plaintext_len` input bytes.
pub fn framed_len(plaintext_len: usize) -> usize {
    NONCE_LEN + sealed_len(plaintext_len)
}

/// Fetches the master key and builds a cipher from it.
pub async fn cipher_from<P: KeyProvider + ?Sized>(
    provider: &P,
) -> Result<Aes256Gcm, SecureStorageError> {
    let material = provider
        .get_or_create()
        .await
        .map_err(|e| SecureStorageError::unavailable(format!("key provider: {e}")))?;
    build_cipher(&material)
}

pub fn build_cipher(material: &KeyMaterial) -> Result<Aes256Gcm, SecureStorageError> {
    Aes256Gcm::new_from_slice(&material.bytes)
        .map_err(|e| SecureStorageError::unavailable(format!("cipher init failed: {e}")))
}

/// Encrypts `plaintext` bound to `aad`. Returns `(nonce, ciphertext)`.
pub fn seal(
    cipher: &Aes256Gcm,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), SecureStorageError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| SecureStorageError::io(format!("encrypt failed: {e}")))?;
    Ok((nonce.to_vec(), ciphertext))
}

/// Decrypts a value sealed with [`seal`]; fails if `aad` does not match.
pub fn open(
    cipher: &Aes256Gcm,
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SecureStorageError> {
    if nonce.len() != NONCE_LEN {
        return Err(SecureStorageError::io(format!(
            "invalid nonce length: {}",
            nonce.len()
        )));
    }
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| SecureStorageError::io(format!("decrypt failed: {e}")))
}

/// `nonce || ciphertext` framing used for database rows.
pub fn seal_framed(
    cipher: &Aes256Gcm,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SecureStorageError> {
    let (mut framed, ciphertext) = seal(cipher, plaintext, aad)?;
    framed.extend_from_slice(&ciphertext);
    Ok(framed)
}

pub fn open_framed(
    cipher: &Aes256Gcm,
    framed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SecureStorageError> {
    if framed.len() < NONCE_LEN {
        return Err(SecureStorageError::io("sealed value is truncated"));
    }
    let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
    open(cipher, nonce, ciphertext, aad)
}
