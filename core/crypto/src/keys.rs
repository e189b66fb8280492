//! Device key with secure memory handling and its persistence.
//!
//! The field key is a single 256-bit AES-GCM key per install. It is
//! generated lazily and persisted through a [`KeyStore`]; its memory is
//! zeroized on drop.

use aes_gcm::{
    aead::{KeyInit, OsRng},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use jobsync_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Symmetric key used for field-level encryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FieldKey {
    key: [u8; KEY_LENGTH],
}

impl FieldKey {
    /// Create a field key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Generate a random key from the OS RNG.
    pub fn generate() -> Self {
        let generated = Aes256Gcm::generate_key(&mut OsRng);
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&generated);
        Self { key }
    }

    fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    fn from_base64(encoded: &str) -> Result<Self> {
        let mut bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Crypto(format!("Stored key is not valid base64: {}", e)))?;

        if bytes.len() != KEY_LENGTH {
            let len = bytes.len();
            bytes.zeroize();
            return Err(Error::Crypto(format!(
                "Stored key has invalid length: expected {}, got {}",
                KEY_LENGTH, len
            )));
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self { key })
    }
}

impl fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldKey([REDACTED])")
    }
}

/// Secure device storage for the field key.
pub trait KeyStore: Send + Sync {
    /// Load the persisted key, if one exists.
    fn load(&self) -> Result<Option<FieldKey>>;

    /// Persist the key, replacing any previous one.
    fn save(&self, key: &FieldKey) -> Result<()>;

    /// Destroy the persisted key. Deleting a missing key is not an error.
    fn delete(&self) -> Result<()>;
}

/// Key store backed by a single file holding the base64-encoded key.
///
/// On unix the file is created with mode 0600.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<FieldKey>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut encoded = fs::read_to_string(&self.path)?;
        let key = FieldKey::from_base64(&encoded);
        encoded.zeroize();
        debug!("Loaded field key from {}", self.path.display());
        key.map(Some)
    }

    fn save(&self, key: &FieldKey) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut encoded = key.to_base64();
        let written = fs::write(&self.path, encoded.as_bytes());
        encoded.zeroize();
        written?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        info!("Persisted field key to {}", self.path.display());
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Deleted field key at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// In-memory key store for testing.
#[derive(Default)]
pub struct MemoryKeyStore {
    key: Mutex<Option<FieldKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<FieldKey>>> {
        self.key
            .lock()
            .map_err(|_| Error::Crypto("Key store lock poisoned".to_string()))
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<FieldKey>> {
        Ok(self.slot()?.clone())
    }

    fn save(&self, key: &FieldKey) -> Result<()> {
        *self.slot()? = Some(key.clone());
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        *self.slot()? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_key_generate() {
        let key1 = FieldKey::generate();
        let key2 = FieldKey::generate();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = FieldKey::from_bytes([7u8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", key), "FieldKey([REDACTED])");
    }

    #[test]
    fn test_file_key_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys").join("field.key"));

        assert!(store.load().unwrap().is_none());

        let key = FieldKey::generate();
        store.save(&key).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.as_bytes(), key.as_bytes());

        store.delete().unwrap();
        assert!(store.load().unwrap().is_none());
        // Deleting twice is fine.
        store.delete().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_file_key_store_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("field.key"));
        store.save(&FieldKey::generate()).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_file_key_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.key");
        fs::write(&path, "not base64!!").unwrap();

        assert!(FileKeyStore::new(&path).load().is_err());
    }

    #[test]
    fn test_memory_key_store() {
        let store = MemoryKeyStore::new();
        assert!(store.load().unwrap().is_none());

        store.save(&FieldKey::from_bytes([1u8; KEY_LENGTH])).unwrap();
        assert_eq!(store.load().unwrap().unwrap().as_bytes(), &[1u8; KEY_LENGTH]);

        store.delete().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
