//! Persistent storage engine.
//!
//! Values move through compress → chunk → encrypt on their way to the
//! sealed KV device, with a self-checking header per object. Reads verify
//! the header digest, every chunk digest and AEAD tag, and the declared
//! lengths before any plaintext is returned.
//!
//! ## Layout
//!
//! A value that fits one chunk is stored as `header ‖ chunk` under its
//! logical key. Larger values keep the header under the logical key and
//! chunk `i` under `<key>/<i>`.
//!
//! ## Concurrency
//!
//! One coarse mutex guards the pipeline and the plaintext cache; the
//! device serializes its own operations. Transactions stage writes in a
//! side table and apply them under the engine mutex at commit, so commits
//! are serializable and a key's visible state is always the last
//! committed write.

mod cache;
mod pipeline;

pub use pipeline::ObjectHeader;

use aes_gcm::aead::KeyInit;
use aes_gcm::Aes256Gcm;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::device::KvDevice;
use crate::error::{DeviceError, StorageError};
use cache::PlaintextCache;

/// Handle for an open transaction.
pub type TxId = u64;

struct EngineState {
    cache: Option<PlaintextCache>,
    /// Integrity failure counts per key, for audit escalation.
    integrity_failures: HashMap<String, u32>,
    integrity_alerts: Vec<String>,
}

#[derive(Default)]
struct TxBuffer {
    /// Staged operations in program order; `None` is a delete.
    writes: Vec<(String, Option<Vec<u8>>)>,
}

pub struct StorageEngine {
    device: Arc<dyn KvDevice>,
    cipher: Option<Aes256Gcm>,
    config: StorageConfig,
    state: Mutex<EngineState>,
    transactions: Mutex<HashMap<TxId, TxBuffer>>,
    next_tx: AtomicU64,
    flush_stop: Arc<AtomicBool>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StorageEngine {
    /// Open the engine over a device. `encryption_key` must be present
    /// when encryption is enabled.
    pub fn open(
        device: Arc<dyn KvDevice>,
        encryption_key: Option<&[u8; 32]>,
        config: StorageConfig,
    ) -> Result<Self, StorageError> {
        let cipher = match (config.enable_encryption, encryption_key) {
            (true, Some(key)) => Some(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|_| StorageError::Io("invalid encryption key".to_string()))?,
            ),
            (true, None) => {
                return Err(StorageError::Io(
                    "encryption enabled but no key provided".to_string(),
                ))
            }
            (false, _) => None,
        };

        let cache = config
            .enable_caching
            .then(|| PlaintextCache::new(config.cache_size_bytes));

        let engine = Self {
            device,
            cipher,
            config,
            state: Mutex::new(EngineState {
                cache,
                integrity_failures: HashMap::new(),
                integrity_alerts: Vec::new(),
            }),
            transactions: Mutex::new(HashMap::new()),
            next_tx: AtomicU64::new(0),
            flush_stop: Arc::new(AtomicBool::new(false)),
            flush_thread: Mutex::new(None),
        };

        if engine.config.enable_auto_flush {
            let device = engine.device.clone();
            let stop = engine.flush_stop.clone();
            let interval = Duration::from_millis(engine.config.auto_flush_interval_ms);
            let handle = std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = device.flush() {
                        warn!(error = %e, "auto-flush failed");
                    }
                }
            });
            *engine.flush_thread.lock().unwrap() = Some(handle);
        }

        info!(
            encryption = engine.cipher.is_some(),
            compression = engine.config.enable_compression,
            caching = engine.config.enable_caching,
            "storage engine open"
        );
        Ok(engine)
    }

    fn chunk_key(key: &str, index: u32) -> String {
        format!("{key}/{index}")
    }

    // --- point operations ---

    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        self.put_locked(&mut state, key, value)
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let mut state = self.state.lock().unwrap();
        self.get_locked(&mut state, key)
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        self.delete_locked(&mut state, key)
    }

    pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.device.exists(key)?)
    }

    /// Enumerate logical keys with the given prefix. Chunk records are
    /// filtered out by consulting their owner's header.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let raw = self.device.list(prefix)?;
        let mut chunk_counts: HashMap<String, u32> = HashMap::new();
        let mut keys = Vec::with_capacity(raw.len());
        for key in raw {
            if self.is_chunk_key(&key, &mut chunk_counts)? {
                continue;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        Ok(self.device.flush()?)
    }

    /// Drain keys that have failed integrity checks repeatedly. The
    /// caller is expected to surface these to the audit log.
    pub fn take_integrity_alerts(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().unwrap().integrity_alerts)
    }

    // --- transactions ---

    /// Open a transaction. Ids are monotone per engine.
    pub fn begin(&self) -> TxId {
        let id = self.next_tx.fetch_add(1, Ordering::AcqRel) + 1;
        self.transactions
            .lock()
            .unwrap()
            .insert(id, TxBuffer::default());
        debug!(tx = id, "transaction open");
        id
    }

    pub fn tx_write(&self, tx: TxId, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut table = self.transactions.lock().unwrap();
        let buffer = table.get_mut(&tx).ok_or(StorageError::UnknownTransaction(tx))?;
        buffer.writes.push((key.to_string(), Some(value)));
        Ok(())
    }

    pub fn tx_delete(&self, tx: TxId, key: &str) -> Result<(), StorageError> {
        let mut table = self.transactions.lock().unwrap();
        let buffer = table.get_mut(&tx).ok_or(StorageError::UnknownTransaction(tx))?;
        buffer.writes.push((key.to_string(), None));
        Ok(())
    }

    /// Apply all staged operations in one logical step.
    pub fn commit(&self, tx: TxId) -> Result<(), StorageError> {
        let buffer = self
            .transactions
            .lock()
            .unwrap()
            .remove(&tx)
            .ok_or(StorageError::UnknownTransaction(tx))?;
        let mut state = self.state.lock().unwrap();
        for (key, op) in buffer.writes {
            match op {
                Some(value) => self.put_locked(&mut state, &key, &value)?,
                None => match self.delete_locked(&mut state, &key) {
                    Ok(()) | Err(StorageError::NotFound) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        debug!(tx, "transaction committed");
        Ok(())
    }

    /// Discard a transaction's staged operations.
    pub fn rollback(&self, tx: TxId) -> Result<(), StorageError> {
        self.transactions
            .lock()
            .unwrap()
            .remove(&tx)
            .map(|_| debug!(tx, "transaction rolled back"))
            .ok_or(StorageError::UnknownTransaction(tx))
    }

    // --- pipeline internals (engine mutex held) ---

    fn put_locked(
        &self,
        state: &mut EngineState,
        key: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        if let Some(cache) = state.cache.as_mut() {
            cache.invalidate(key);
        }

        let processed = if self.config.enable_compression {
            pipeline::compress(value, self.config.compression_level)?
        } else {
            value.to_vec()
        };

        let mut stored_chunks: Vec<Vec<u8>> = Vec::new();
        let plain_chunks: Vec<&[u8]> = if processed.is_empty() {
            vec![&[]]
        } else {
            processed.chunks(self.config.max_chunk_size).collect()
        };
        for plain in &plain_chunks {
            let stored = match &self.cipher {
                Some(cipher) => pipeline::seal_chunk(cipher, plain)?,
                None => plain.to_vec(),
            };
            stored_chunks.push(stored);
        }

        let header = ObjectHeader {
            compressed: self.config.enable_compression,
            encrypted: self.cipher.is_some(),
            original_len: value.len() as u64,
            stored_len: stored_chunks.iter().map(|c| c.len() as u64).sum(),
            chunk_digests: stored_chunks.iter().map(|c| pipeline::digest(c)).collect(),
        };

        // Replacing a multi-chunk object: remember how many chunks the
        // old version had so stale ones can be removed afterwards.
        let old_chunk_count = self.read_header_quiet(key).map(|h| h.chunk_count());

        let chunk_count = stored_chunks.len() as u32;
        if chunk_count == 1 {
            let mut record = header.encode();
            record.extend_from_slice(&stored_chunks[0]);
            self.device.write(key, &record)?;
        } else {
            for (i, stored) in stored_chunks.iter().enumerate() {
                self.device.write(&Self::chunk_key(key, i as u32), stored)?;
            }
            self.device.write(key, &header.encode())?;
        }

        if let Some(old_count) = old_chunk_count {
            // Side chunks exist only for multi-chunk objects.
            let kept = if chunk_count == 1 { 0 } else { chunk_count };
            for i in kept..old_count {
                let _ = self.device.delete(&Self::chunk_key(key, i));
            }
        }

        if let Some(cache) = state.cache.as_mut() {
            cache.insert(key, value.to_vec());
        }
        Ok(())
    }

    fn get_locked(&self, state: &mut EngineState, key: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(cache) = state.cache.as_mut() {
            if let Some(hit) = cache.get(key) {
                return Ok(hit);
            }
        }

        let result = self.read_through(key);
        match result {
            Ok(value) => {
                if let Some(cache) = state.cache.as_mut() {
                    cache.insert(key, value.clone());
                }
                Ok(value)
            }
            Err(StorageError::Integrity(msg)) => {
                let count = state
                    .integrity_failures
                    .entry(key.to_string())
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
                warn!(key, failures = *count, error = %msg, "integrity failure");
                if *count >= 2 {
                    state.integrity_alerts.push(key.to_string());
                }
                Err(StorageError::Integrity(msg))
            }
            Err(e) => Err(e),
        }
    }

    fn read_through(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let record = self.device.read(key)?;
        let (header, header_len) = ObjectHeader::decode(&record)?;

        let chunk_count = header.chunk_count() as usize;
        if chunk_count == 0 {
            return Err(StorageError::Integrity("object with no chunks".to_string()));
        }

        let mut stored_chunks: Vec<Vec<u8>> = Vec::with_capacity(chunk_count);
        if chunk_count == 1 {
            stored_chunks.push(record[header_len..].to_vec());
        } else {
            if record.len() != header_len {
                return Err(StorageError::Integrity(
                    "unexpected inline data on chunked object".to_string(),
                ));
            }
            for i in 0..chunk_count {
                let chunk = match self.device.read(&Self::chunk_key(key, i as u32)) {
                    Ok(c) => c,
                    Err(DeviceError::NotFound) => {
                        return Err(StorageError::Integrity(format!("missing chunk {i}")))
                    }
                    Err(e) => return Err(e.into()),
                };
                stored_chunks.push(chunk);
            }
        }

        let stored_len: u64 = stored_chunks.iter().map(|c| c.len() as u64).sum();
        if stored_len != header.stored_len {
            return Err(StorageError::Integrity(format!(
                "stored length mismatch: declared {}, found {stored_len}",
                header.stored_len
            )));
        }

        let mut processed = Vec::with_capacity(header.original_len as usize);
        for (i, stored) in stored_chunks.iter().enumerate() {
            if pipeline::digest(stored) != header.chunk_digests[i] {
                return Err(StorageError::Integrity(format!("chunk {i} digest mismatch")));
            }
            if header.encrypted {
                let cipher = self.cipher.as_ref().ok_or_else(|| {
                    StorageError::Integrity("encrypted object but encryption is off".to_string())
                })?;
                processed.extend_from_slice(&pipeline::open_chunk(cipher, stored)?);
            } else {
                processed.extend_from_slice(stored);
            }
        }

        let value = if header.compressed {
            pipeline::decompress(&processed, header.original_len)?
        } else {
            processed
        };
        if value.len() as u64 != header.original_len {
            return Err(StorageError::Integrity(format!(
                "original length mismatch: declared {}, found {}",
                header.original_len,
                value.len()
            )));
        }
        Ok(value)
    }

    fn delete_locked(&self, state: &mut EngineState, key: &str) -> Result<(), StorageError> {
        if let Some(cache) = state.cache.as_mut() {
            cache.invalidate(key);
        }
        let chunk_count = self.read_header_quiet(key).map(|h| h.chunk_count());
        match self.device.delete(key) {
            Ok(()) => {}
            Err(DeviceError::NotFound) => return Err(StorageError::NotFound),
            Err(e) => return Err(e.into()),
        }
        if let Some(count) = chunk_count {
            if count > 1 {
                for i in 0..count {
                    let _ = self.device.delete(&Self::chunk_key(key, i));
                }
            }
        }
        Ok(())
    }

    /// Best-effort header read; corrupt or absent headers yield `None`.
    fn read_header_quiet(&self, key: &str) -> Option<ObjectHeader> {
        let record = self.device.read(key).ok()?;
        ObjectHeader::decode(&record).ok().map(|(h, _)| h)
    }

    fn is_chunk_key(
        &self,
        key: &str,
        chunk_counts: &mut HashMap<String, u32>,
    ) -> Result<bool, StorageError> {
        let Some((base, suffix)) = key.rsplit_once('/') else {
            return Ok(false);
        };
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }
        let Ok(index) = suffix.parse::<u32>() else {
            return Ok(false);
        };
        let count = match chunk_counts.get(base) {
            Some(c) => *c,
            None => {
                let c = self
                    .read_header_quiet(base)
                    .map(|h| h.chunk_count())
                    .unwrap_or(0);
                chunk_counts.insert(base.to_string(), c);
                c
            }
        };
        Ok(count > 1 && index < count)
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.flush_stop.store(true, Ordering::Release);
        if let Some(handle) = self.flush_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let _ = self.device.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemKvDevice;

    fn small_chunk_config() -> StorageConfig {
        StorageConfig {
            max_chunk_size: 64,
            enable_compression: false,
            enable_auto_flush: false,
            ..StorageConfig::default()
        }
    }

    fn engine_with(config: StorageConfig) -> (Arc<MemKvDevice>, StorageEngine) {
        let device = Arc::new(MemKvDevice::new());
        let engine =
            StorageEngine::open(device.clone(), Some(&[42u8; 32]), config).unwrap();
        (device, engine)
    }

    #[test]
    fn roundtrip_across_size_boundaries() {
        let (_, engine) = engine_with(small_chunk_config());
        for size in [0usize, 1, 63, 64, 65, 128, 129] {
            let value: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let key = format!("obj-{size}");
            engine.put(&key, &value).unwrap();
            assert_eq!(engine.get(&key).unwrap(), value, "size {size}");
        }
    }

    #[test]
    fn chunk_count_boundary() {
        let (device, engine) = engine_with(small_chunk_config());
        engine.put("single", &[0x42; 64]).unwrap();
        engine.put("double", &[0x42; 65]).unwrap();

        // A single-chunk object stores no side chunks.
        assert!(!device.exists("single/0").unwrap());
        // Two chunks live beside the header.
        assert!(device.exists("double/0").unwrap());
        assert!(device.exists("double/1").unwrap());
        assert!(!device.exists("double/2").unwrap());
    }

    #[test]
    fn compressed_and_encrypted_roundtrip() {
        let config = StorageConfig {
            max_chunk_size: 256,
            enable_auto_flush: false,
            ..StorageConfig::default()
        };
        let (_, engine) = engine_with(config);
        let value = b"repetitive repetitive repetitive ".repeat(200);
        engine.put("blob", &value).unwrap();
        assert_eq!(engine.get("blob").unwrap(), value);
    }

    #[test]
    fn identical_values_store_distinct_ciphertexts() {
        let (device, engine) = engine_with(small_chunk_config());
        engine.put("a", b"same value").unwrap();
        engine.put("b", b"same value").unwrap();
        assert_ne!(device.read("a").unwrap(), device.read("b").unwrap());
    }

    #[test]
    fn tampered_record_fails_integrity() {
        let (device, engine) = engine_with(small_chunk_config());
        engine.put("victim", b"sensitive payload").unwrap();

        let mut record = device.read("victim").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0x01;
        device.write("victim", &record).unwrap();

        // Cache still holds the old plaintext; drop it by using a fresh
        // engine over the same device.
        drop(engine);
        let engine = StorageEngine::open(device.clone(), Some(&[42u8; 32]), small_chunk_config())
            .unwrap();
        assert!(matches!(
            engine.get("victim"),
            Err(StorageError::Integrity(_))
        ));
    }

    #[test]
    fn repeated_integrity_failures_raise_an_alert() {
        let (device, engine) = engine_with(StorageConfig {
            enable_caching: false,
            ..small_chunk_config()
        });
        engine.put("victim", b"payload").unwrap();
        let mut record = device.read("victim").unwrap();
        record[5] ^= 0xff;
        device.write("victim", &record).unwrap();

        assert!(engine.get("victim").is_err());
        assert!(engine.take_integrity_alerts().is_empty());
        assert!(engine.get("victim").is_err());
        assert_eq!(engine.take_integrity_alerts(), vec!["victim".to_string()]);
    }

    #[test]
    fn missing_key_is_not_found() {
        let (_, engine) = engine_with(small_chunk_config());
        assert!(matches!(engine.get("absent"), Err(StorageError::NotFound)));
        assert!(matches!(
            engine.delete("absent"),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn delete_removes_all_chunks() {
        let (device, engine) = engine_with(small_chunk_config());
        engine.put("wide", &[1u8; 200]).unwrap();
        assert!(device.exists("wide/1").unwrap());
        engine.delete("wide").unwrap();
        assert!(!device.exists("wide").unwrap());
        assert!(!device.exists("wide/0").unwrap());
        assert!(!device.exists("wide/1").unwrap());
        assert!(matches!(engine.get("wide"), Err(StorageError::NotFound)));
    }

    #[test]
    fn shrinking_an_object_drops_stale_chunks() {
        let (device, engine) = engine_with(small_chunk_config());
        engine.put("k", &[1u8; 200]).unwrap(); // 4 chunks
        engine.put("k", &[2u8; 10]).unwrap(); // single chunk, inline
        assert!(!device.exists("k/0").unwrap());
        assert!(!device.exists("k/3").unwrap());
        assert_eq!(engine.get("k").unwrap(), vec![2u8; 10]);
    }

    #[test]
    fn list_returns_logical_keys_only() {
        let (_, engine) = engine_with(small_chunk_config());
        engine.put("data/wide", &[1u8; 200]).unwrap();
        engine.put("data/narrow", b"x").unwrap();
        let mut keys = engine.list("data/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["data/narrow", "data/wide"]);
    }

    #[test]
    fn transaction_commit_applies_last_write() {
        let (_, engine) = engine_with(small_chunk_config());
        let tx = engine.begin();
        engine.tx_write(tx, "k", b"v1".to_vec()).unwrap();
        engine.tx_write(tx, "k", b"v2".to_vec()).unwrap();
        engine.commit(tx).unwrap();
        assert_eq!(engine.get("k").unwrap(), b"v2");
    }

    #[test]
    fn transaction_rollback_leaves_no_trace() {
        let (_, engine) = engine_with(small_chunk_config());
        let tx = engine.begin();
        engine.tx_write(tx, "k", b"v1".to_vec()).unwrap();
        engine.rollback(tx).unwrap();
        assert!(matches!(engine.get("k"), Err(StorageError::NotFound)));
        // The transaction is gone; further use is an error.
        assert!(matches!(
            engine.tx_write(tx, "k", b"v".to_vec()),
            Err(StorageError::UnknownTransaction(_))
        ));
        assert!(matches!(
            engine.commit(tx),
            Err(StorageError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn transaction_delete_is_visible_after_commit() {
        let (_, engine) = engine_with(small_chunk_config());
        engine.put("k", b"live").unwrap();
        let tx = engine.begin();
        engine.tx_delete(tx, "k").unwrap();
        // Staged, not yet visible.
        assert_eq!(engine.get("k").unwrap(), b"live");
        engine.commit(tx).unwrap();
        assert!(matches!(engine.get("k"), Err(StorageError::NotFound)));
    }

    #[test]
    fn disjoint_transactions_both_commit() {
        let (_, engine) = engine_with(small_chunk_config());
        let tx1 = engine.begin();
        let tx2 = engine.begin();
        assert!(tx2 > tx1);
        engine.tx_write(tx1, "a", b"1".to_vec()).unwrap();
        engine.tx_write(tx2, "b", b"2".to_vec()).unwrap();
        engine.commit(tx1).unwrap();
        engine.commit(tx2).unwrap();
        assert_eq!(engine.get("a").unwrap(), b"1");
        assert_eq!(engine.get("b").unwrap(), b"2");
    }

    #[test]
    fn cache_serves_repeated_reads() {
        let (device, engine) = engine_with(small_chunk_config());
        engine.put("hot", b"cached value").unwrap();
        assert_eq!(engine.get("hot").unwrap(), b"cached value");

        // Corrupt the device record; the cache must still serve the
        // last value written through it.
        device.write("hot", b"garbage").unwrap();
        assert_eq!(engine.get("hot").unwrap(), b"cached value");
    }

    #[test]
    fn plaintext_never_reaches_the_device() {
        let (device, engine) = engine_with(StorageConfig {
            enable_compression: false,
            enable_auto_flush: false,
            ..StorageConfig::default()
        });
        let needle = b"finding this plaintext would be bad";
        engine.put("secret-ish", needle).unwrap();
        let stored = device.read("secret-ish").unwrap();
        assert!(!stored
            .windows(needle.len())
            .any(|w| w == needle.as_slice()));
    }
}
