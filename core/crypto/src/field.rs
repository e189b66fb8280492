//! Field-level encryption with a lazily provisioned device key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use jobsync_common::{Error, Result};

use crate::aead;
use crate::keys::{FieldKey, KeyStore};

/// Encrypts and decrypts individual string fields.
///
/// The key is fetched from the [`KeyStore`] on first use and generated
/// (then persisted) if none exists. Generation happens at most once per
/// store: concurrent first callers serialize on the key slot.
pub struct FieldCipher {
    store: Arc<dyn KeyStore>,
    key: Mutex<Option<FieldKey>>,
}

impl FieldCipher {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            key: Mutex::new(None),
        }
    }

    /// Run `f` with the device key, provisioning it if needed.
    fn with_key<T>(&self, f: impl FnOnce(&FieldKey) -> Result<T>) -> Result<T> {
        let mut slot = self
            .key
            .lock()
            .map_err(|_| Error::Crypto("Field key lock poisoned".to_string()))?;

        if slot.is_none() {
            let key = match self.store.load()? {
                Some(key) => key,
                None => {
                    let key = FieldKey::generate();
                    self.store.save(&key)?;
                    info!("Generated new field encryption key");
                    key
                }
            };
            *slot = Some(key);
        }

        match slot.as_ref() {
            Some(key) => f(key),
            None => Err(Error::Crypto("Field key unavailable".to_string())),
        }
    }

    /// Make sure a key exists, generating one if necessary.
    pub fn ensure_key(&self) -> Result<()> {
        self.with_key(|_| Ok(()))
    }

    /// Encrypt a single value.
    ///
    /// Returns `None` for missing or blank input, and also when encryption
    /// fails: plaintext is never returned in place of ciphertext.
    pub fn encrypt_field(&self, plaintext: Option<&str>) -> Option<String> {
        let plaintext = plaintext.filter(|p| !p.trim().is_empty())?;

        match self.with_key(|key| aead::encrypt(key.as_bytes(), plaintext.as_bytes())) {
            Ok(sealed) => Some(BASE64.encode(sealed)),
            Err(e) => {
                warn!("Field encryption failed: {}", e);
                None
            }
        }
    }

    /// Decrypt a value produced by [`FieldCipher::encrypt_field`].
    ///
    /// Returns `None` for corrupted data or data sealed under another key.
    pub fn decrypt_field(&self, ciphertext: &str) -> Option<String> {
        if ciphertext.is_empty() {
            return None;
        }

        let sealed = BASE64.decode(ciphertext).ok()?;
        let opened = self.with_key(|key| aead::decrypt(key.as_bytes(), &sealed));

        match opened {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            Err(e) => {
                warn!("Field decryption failed: {}", e);
                None
            }
        }
    }

    /// Forget the in-memory key and delete it from the key store (logout).
    pub fn destroy_key(&self) -> Result<()> {
        let mut slot = self
            .key
            .lock()
            .map_err(|_| Error::Crypto("Field key lock poisoned".to_string()))?;
        *slot = None;
        self.store.delete()?;
        info!("Field encryption key destroyed");
        Ok(())
    }
}
