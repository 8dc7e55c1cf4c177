//! Value pipeline: compression, chunking and per-chunk encryption.
//!
//! On write a value is deflated (optional), split into bounded chunks,
//! and each chunk is sealed with AES-256-GCM under a fresh 96-bit nonce.
//! The object header records what was done and a digest of every stored
//! chunk so reads can refuse tampered data before touching plaintext.
//!
//! Header layout (little-endian):
//! - `magic(4) = "SOBJ"` ‖ `version(1)` ‖ `flags(1)`
//! - `original_len(u64)` ‖ `stored_len(u64)` ‖ `chunk_count(u32)`
//! - `chunk_digest(32) × chunk_count`
//! - `header_digest(32)` over all preceding bytes

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use crate::error::StorageError;

const MAGIC: &[u8; 4] = b"SOBJ";
const VERSION: u8 = 1;
const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_ENCRYPTED: u8 = 0b0000_0010;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub compressed: bool,
    pub encrypted: bool,
    pub original_len: u64,
    pub stored_len: u64,
    pub chunk_digests: Vec<[u8; 32]>,
}

impl ObjectHeader {
    pub fn chunk_count(&self) -> u32 {
        self.chunk_digests.len() as u32
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        let mut out = Vec::with_capacity(4 + 1 + 1 + 8 + 8 + 4 + 32 * self.chunk_digests.len() + 32);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(flags);
        out.extend_from_slice(&self.original_len.to_le_bytes());
        out.extend_from_slice(&self.stored_len.to_le_bytes());
        out.extend_from_slice(&self.chunk_count().to_le_bytes());
        for digest in &self.chunk_digests {
            out.extend_from_slice(digest);
        }
        let mut hasher = Sha256::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize());
        out
    }

    /// Decode a header from the start of `bytes`; returns the header and
    /// the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), StorageError> {
        let fixed = 4 + 1 + 1 + 8 + 8 + 4;
        if bytes.len() < fixed {
            return Err(StorageError::Integrity("truncated header".to_string()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(StorageError::Integrity("bad header magic".to_string()));
        }
        if bytes[4] != VERSION {
            return Err(StorageError::Integrity(format!(
                "unsupported header version {}",
                bytes[4]
            )));
        }
        let flags = bytes[5];
        let original_len = u64::from_le_bytes(bytes[6..14].try_into().unwrap());
        let stored_len = u64::from_le_bytes(bytes[14..22].try_into().unwrap());
        let chunk_count = u32::from_le_bytes(bytes[22..26].try_into().unwrap()) as usize;

        let digests_end = fixed + 32 * chunk_count;
        let header_end = digests_end + 32;
        if bytes.len() < header_end {
            return Err(StorageError::Integrity("truncated header".to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(&bytes[..digests_end]);
        let expected: [u8; 32] = hasher.finalize().into();
        if bytes[digests_end..header_end] != expected {
            return Err(StorageError::Integrity("header digest mismatch".to_string()));
        }

        let mut chunk_digests = Vec::with_capacity(chunk_count);
        for i in 0..chunk_count {
            let start = fixed + 32 * i;
            chunk_digests.push(bytes[start..start + 32].try_into().unwrap());
        }

        Ok((
            Self {
                compressed: flags & FLAG_COMPRESSED != 0,
                encrypted: flags & FLAG_ENCRYPTED != 0,
                original_len,
                stored_len,
                chunk_digests,
            },
            header_end,
        ))
    }
}

pub fn compress(value: &[u8], level: u32) -> Result<Vec<u8>, StorageError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(value)
        .map_err(|e| StorageError::Io(format!("compress: {e}")))?;
    encoder
        .finish()
        .map_err(|e| StorageError::Io(format!("compress: {e}")))
}

pub fn decompress(compressed: &[u8], original_len: u64) -> Result<Vec<u8>, StorageError> {
    let mut decoder = DeflateDecoder::new(compressed);
    let mut out = Vec::with_capacity(original_len as usize);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Integrity(format!("decompress: {e}")))?;
    Ok(out)
}

/// Seal one chunk: fresh nonce, AES-256-GCM, stored as `nonce ‖ ct ‖ tag`.
pub fn seal_chunk(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| StorageError::Io("chunk encryption failed".to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open_chunk(cipher: &Aes256Gcm, stored: &[u8]) -> Result<Vec<u8>, StorageError> {
    if stored.len() < NONCE_LEN + TAG_LEN {
        return Err(StorageError::Integrity("chunk too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = stored.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| StorageError::Integrity("chunk authentication failed".to_string()))
}

pub fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}
