//! Sealed KV device: the byte-keyed blob store everything above persists
//! into.
//!
//! `FileKvDevice` keeps one file per key. File names are the hex SHA-256
//! of the key, so arbitrary key bytes can never become path components;
//! the key itself is recorded inside the file. Each record carries a
//! digest of its value, verified on every read.
//!
//! Record layout:
//! - `magic(4) = "SKV1"`
//! - `key_len (u32 LE)` ‖ key bytes
//! - `value_len (u64 LE)`
//! - `sha256(value) (32)`
//! - value bytes
//!
//! Writes land in a temp file, are fsynced, then renamed over the target,
//! so a crash leaves either the old record or the new one.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::DeviceError;

const MAGIC: &[u8; 4] = b"SKV1";
const EXT: &str = "kv";

/// Byte-keyed, bytes-valued blob store.
///
/// Keys are opaque; `list` matches on raw byte prefixes. All writes are
/// atomic with respect to crash.
pub trait KvDevice: Send + Sync {
    fn read(&self, key: &str) -> Result<Vec<u8>, DeviceError>;
    fn write(&self, key: &str, value: &[u8]) -> Result<(), DeviceError>;
    fn delete(&self, key: &str) -> Result<(), DeviceError>;
    fn exists(&self, key: &str) -> Result<bool, DeviceError>;
    fn size(&self, key: &str) -> Result<u64, DeviceError>;
    /// Enumerate keys starting with `prefix`; order unspecified.
    fn list(&self, prefix: &str) -> Result<Vec<String>, DeviceError>;
    fn flush(&self) -> Result<(), DeviceError>;
}

/// Directory-backed device.
pub struct FileKvDevice {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileKvDevice {
    pub fn open(root: impl Into<PathBuf>, create_if_missing: bool) -> Result<Self, DeviceError> {
        let root = root.into();
        if !root.exists() {
            if !create_if_missing {
                return Err(DeviceError::NotFound);
            }
            fs::create_dir_all(&root)?;
        }
        debug!(root = %root.display(), "opened kv device");
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.root
            .join(format!("{}.{EXT}", hex::encode(hasher.finalize())))
    }

    fn encode_record(key: &str, value: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(value);
        let digest = hasher.finalize();

        let mut out = Vec::with_capacity(4 + 4 + key.len() + 8 + 32 + value.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u64).to_le_bytes());
        out.extend_from_slice(&digest);
        out.extend_from_slice(value);
        out
    }

    /// Read and verify the header of a record file. Returns the key and
    /// the declared value length, leaving `reader` positioned at the
    /// value digest.
    fn read_header(reader: &mut impl Read) -> Result<(String, u64), DeviceError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DeviceError::CorruptRecord("bad magic".to_string()));
        }
        let mut len4 = [0u8; 4];
        reader.read_exact(&mut len4)?;
        let key_len = u32::from_le_bytes(len4) as usize;
        if key_len > 64 * 1024 {
            return Err(DeviceError::CorruptRecord("oversized key".to_string()));
        }
        let mut key_bytes = vec![0u8; key_len];
        reader.read_exact(&mut key_bytes)?;
        let key = String::from_utf8(key_bytes)
            .map_err(|_| DeviceError::CorruptRecord("key is not utf-8".to_string()))?;
        let mut len8 = [0u8; 8];
        reader.read_exact(&mut len8)?;
        Ok((key, u64::from_le_bytes(len8)))
    }

    fn decode_record(bytes: &[u8]) -> Result<(String, Vec<u8>), DeviceError> {
        let mut cursor = bytes;
        let (key, value_len) = Self::read_header(&mut cursor)?;
        let mut digest = [0u8; 32];
        cursor.read_exact(&mut digest)?;
        if cursor.len() as u64 != value_len {
            return Err(DeviceError::CorruptRecord(format!(
                "value length mismatch: declared {value_len}, found {}",
                cursor.len()
            )));
        }
        let mut hasher = Sha256::new();
        hasher.update(cursor);
        if digest != <[u8; 32]>::from(hasher.finalize()) {
            return Err(DeviceError::CorruptRecord("value digest mismatch".to_string()));
        }
        Ok((key, cursor.to_vec()))
    }
}

impl KvDevice for FileKvDevice {
    fn read(&self, key: &str) -> Result<Vec<u8>, DeviceError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeviceError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let (stored_key, value) = Self::decode_record(&bytes)?;
        if stored_key != key {
            // A digest collision would be required to get here.
            return Err(DeviceError::CorruptRecord("record key mismatch".to_string()));
        }
        Ok(value)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), DeviceError> {
        let path = self.path_for(key);
        let tmp = self.root.join(format!(
            ".tmp.{}.{}",
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        let record = Self::encode_record(key, value);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&record)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), DeviceError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DeviceError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, DeviceError> {
        Ok(self.path_for(key).exists())
    }

    fn size(&self, key: &str) -> Result<u64, DeviceError> {
        let path = self.path_for(key);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeviceError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let (_, value_len) = Self::read_header(&mut file)?;
        Ok(value_len)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, DeviceError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e != EXT).unwrap_or(true) {
                continue;
            }
            let mut file = match fs::File::open(&path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            match Self::read_header(&mut file) {
                Ok((key, _)) => {
                    if key.as_bytes().starts_with(prefix.as_bytes()) {
                        keys.push(key);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable record");
                }
            }
        }
        Ok(keys)
    }

    fn flush(&self) -> Result<(), DeviceError> {
        let dir = fs::File::open(&self.root)?;
        dir.sync_all()?;
        Ok(())
    }
}

/// In-memory device for tests and embedders without a backing directory.
#[derive(Default)]
pub struct MemKvDevice {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemKvDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvDevice for MemKvDevice {
    fn read(&self, key: &str) -> Result<Vec<u8>, DeviceError> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(DeviceError::NotFound)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), DeviceError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), DeviceError> {
        self.entries
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or(DeviceError::NotFound)
    }

    fn exists(&self, key: &str) -> Result<bool, DeviceError> {
        Ok(self.entries.lock().unwrap().contains_key(key))
    }

    fn size(&self, key: &str) -> Result<u64, DeviceError> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|v| v.len() as u64)
            .ok_or(DeviceError::NotFound)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, DeviceError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.as_bytes().starts_with(prefix.as_bytes()))
            .cloned()
            .collect())
    }

    fn flush(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn open_device(dir: &Path) -> FileKvDevice {
        FileKvDevice::open(dir, true).unwrap()
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let device = open_device(dir.path());

        device.write("alpha", b"payload").unwrap();
        assert_eq!(device.read("alpha").unwrap(), b"payload");
        assert!(device.exists("alpha").unwrap());
        assert_eq!(device.size("alpha").unwrap(), 7);
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let device = open_device(dir.path());
        assert!(matches!(device.read("nope"), Err(DeviceError::NotFound)));
        assert!(matches!(device.delete("nope"), Err(DeviceError::NotFound)));
        assert!(!device.exists("nope").unwrap());
    }

    #[test]
    fn overwrite_replaces_the_value() {
        let dir = TempDir::new().unwrap();
        let device = open_device(dir.path());
        device.write("k", b"one").unwrap();
        device.write("k", b"two").unwrap();
        assert_eq!(device.read("k").unwrap(), b"two");
    }

    #[test]
    fn corrupt_value_is_detected() {
        let dir = TempDir::new().unwrap();
        let device = open_device(dir.path());
        device.write("victim", b"original value bytes").unwrap();

        // Flip one byte in the stored value region.
        let path = device.path_for("victim");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            device.read("victim"),
            Err(DeviceError::CorruptRecord(_))
        ));
    }

    #[test]
    fn traversal_shaped_keys_stay_inside_the_root() {
        let dir = TempDir::new().unwrap();
        let device = open_device(dir.path());
        device.write("../../etc/passwd", b"nope").unwrap();
        assert_eq!(device.read("../../etc/passwd").unwrap(), b"nope");
        // Exactly one record file, inside the root.
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn list_matches_byte_prefixes() {
        let dir = TempDir::new().unwrap();
        let device = open_device(dir.path());
        device.write("secret/u1/a", b"1").unwrap();
        device.write("secret/u1/b", b"2").unwrap();
        device.write("secret/u2/a", b"3").unwrap();
        device.write("metrics/f/u/1", b"4").unwrap();

        let mut keys = device.list("secret/u1/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["secret/u1/a", "secret/u1/b"]);
        assert_eq!(device.list("secret/").unwrap().len(), 3);
        assert_eq!(device.list("").unwrap().len(), 4);
    }

    #[test]
    fn reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        {
            let device = open_device(dir.path());
            device.write("durable", b"still here").unwrap();
            device.flush().unwrap();
        }
        let device = FileKvDevice::open(dir.path(), false).unwrap();
        assert_eq!(device.read("durable").unwrap(), b"still here");
    }

    #[test]
    fn open_without_create_fails_on_missing_root() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent");
        assert!(FileKvDevice::open(&missing, false).is_err());
        assert!(FileKvDevice::open(&missing, true).is_ok());
    }

    #[test]
    fn mem_device_behaves_like_a_device() {
        let device = MemKvDevice::new();
        device.write("k", b"v").unwrap();
        assert_eq!(device.read("k").unwrap(), b"v");
        assert_eq!(device.size("k").unwrap(), 1);
        device.delete("k").unwrap();
        assert!(matches!(device.read("k"), Err(DeviceError::NotFound)));
    }
}
