//! Per-user named secrets.
//!
//! Entries are AES-256-GCM ciphertexts (`nonce ‖ ciphertext ‖ tag`, fresh
//! nonce per put, storage key as AAD) written through the storage engine
//! at `secret/<user>/<name>`. The in-memory map holds ciphertext only and
//! is preloaded at boot; plaintext exists only inside `get`, in a buffer
//! that is zeroed on drop.
//!
//! Locking: the cache lock is never held across a storage call or a
//! decryption. Ciphertext is copied out under the lock and opened outside
//! it.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

use tracing::{debug, info, warn};

use crate::error::{SecretError, StorageError};
use crate::storage::StorageEngine;

const PREFIX: &str = "secret/";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct SecretManager {
    engine: Arc<StorageEngine>,
    cipher: Aes256Gcm,
    /// Ciphertext cache keyed by (user, name). Never holds plaintext.
    cache: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl SecretManager {
    /// Open the manager and preload every stored ciphertext.
    pub fn open(engine: Arc<StorageEngine>, secret_key: &[u8; 32]) -> Result<Self, SecretError> {
        let cipher = Aes256Gcm::new_from_slice(secret_key)
            .map_err(|_| SecretError::Storage("invalid secret key".to_string()))?;
        let manager = Self {
            engine,
            cipher,
            cache: Mutex::new(HashMap::new()),
        };
        manager.preload()?;
        Ok(manager)
    }

    fn preload(&self) -> Result<(), SecretError> {
        let keys = self.engine.list(PREFIX)?;
        let mut loaded = 0usize;
        let mut skipped = 0usize;
        for key in keys {
            let Some((user, name)) = Self::parse_key(&key) else {
                warn!(key, "skipping secret with unparseable key");
                skipped += 1;
                continue;
            };
            match self.engine.get(&key) {
                Ok(ciphertext) => {
                    self.cache
                        .lock()
                        .unwrap()
                        .insert((user, name), ciphertext);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(key, error = %e, "skipping unreadable secret");
                    skipped += 1;
                }
            }
        }
        info!(loaded, skipped, "secret cache preloaded");
        Ok(())
    }

    fn storage_key(user: &str, name: &str) -> String {
        format!("{PREFIX}{user}/{name}")
    }

    fn parse_key(key: &str) -> Option<(String, String)> {
        let rest = key.strip_prefix(PREFIX)?;
        let (user, name) = rest.split_once('/')?;
        if user.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some((user.to_string(), name.to_string()))
    }

    fn check_component(label: &str, value: &str) -> Result<(), SecretError> {
        if value.is_empty() || value.contains('/') {
            return Err(SecretError::InvalidName(format!(
                "{label} must be non-empty and must not contain '/'"
            )));
        }
        Ok(())
    }

    /// Store (or replace) a secret.
    pub fn put(&self, user: &str, name: &str, value: &[u8]) -> Result<(), SecretError> {
        Self::check_component("user", user)?;
        Self::check_component("name", name)?;

        let key = Self::storage_key(user, name);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| SecretError::Storage(format!("rng: {e}")))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: value,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| SecretError::Storage("secret encryption failed".to_string()))?;

        let mut entry = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        entry.extend_from_slice(&nonce_bytes);
        entry.extend_from_slice(&ciphertext);

        // Durable first; the cache reflects only committed state.
        self.engine.put(&key, &entry)?;
        self.cache
            .lock()
            .unwrap()
            .insert((user.to_string(), name.to_string()), entry);
        debug!(user, name, "secret stored");
        Ok(())
    }

    /// Fetch and decrypt a secret. The returned buffer is zeroed on drop.
    pub fn get(&self, user: &str, name: &str) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let cached = self
            .cache
            .lock()
            .unwrap()
            .get(&(user.to_string(), name.to_string()))
            .cloned();

        let entry = match cached {
            Some(entry) => entry,
            None => {
                // Not preloaded (or written by another owner of the same
                // device); fall back to storage before giving up.
                let key = Self::storage_key(user, name);
                match self.engine.get(&key) {
                    Ok(entry) => {
                        self.cache
                            .lock()
                            .unwrap()
                            .insert((user.to_string(), name.to_string()), entry.clone());
                        entry
                    }
                    Err(StorageError::NotFound) => return Err(SecretError::NotFound),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        self.open_entry(user, name, &entry)
    }

    fn open_entry(
        &self,
        user: &str,
        name: &str,
        entry: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        if entry.len() < NONCE_LEN + TAG_LEN {
            return Err(SecretError::Integrity("secret entry too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = entry.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Self::storage_key(user, name);
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| {
                SecretError::Integrity("secret authentication failed".to_string())
            })?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Remove a secret from storage and the cache. The cache removal is
    /// observable only after the storage delete committed.
    pub fn delete(&self, user: &str, name: &str) -> Result<(), SecretError> {
        Self::check_component("user", user)?;
        Self::check_component("name", name)?;
        let key = Self::storage_key(user, name);
        match self.engine.delete(&key) {
            Ok(()) => {}
            Err(StorageError::NotFound) => {
                // Keep the cache honest even if storage lost the entry.
                self.cache
                    .lock()
                    .unwrap()
                    .remove(&(user.to_string(), name.to_string()));
                return Err(SecretError::NotFound);
            }
            Err(e) => return Err(e.into()),
        }
        self.cache
            .lock()
            .unwrap()
            .remove(&(user.to_string(), name.to_string()));
        debug!(user, name, "secret deleted");
        Ok(())
    }

    /// Names with a committed put and no later delete, for one user.
    pub fn list_names(&self, user: &str) -> BTreeSet<String> {
        self.cache
            .lock()
            .unwrap()
            .keys()
            .filter(|(u, _)| u == user)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn exists(&self, user: &str, name: &str) -> bool {
        self.cache
            .lock()
            .unwrap()
            .contains_key(&(user.to_string(), name.to_string()))
    }

    /// Resolve several secrets at once. Missing names are simply absent
    /// from the result map.
    pub fn get_many(
        &self,
        user: &str,
        names: &BTreeSet<String>,
    ) -> Result<HashMap<String, Zeroizing<Vec<u8>>>, SecretError> {
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            match self.get(user, name) {
                Ok(value) => {
                    out.insert(name.clone(), value);
                }
                Err(SecretError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}
