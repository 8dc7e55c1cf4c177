//! Error taxonomy for the runtime.
//!
//! Every module has its own typed error; all of them project onto the
//! canonical [`ErrorKind`] that crosses the request boundary and lands in
//! audit records. Exactly one terminal kind is surfaced per request.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical failure kinds visible at the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The script threw or failed to compile.
    ScriptError,
    /// Wall-clock deadline exceeded.
    TimeoutError,
    /// Gas limit exceeded.
    OutOfGas,
    /// Interpreter heap exhausted.
    MemoryError,
    /// Forbidden global, tampered input, or refused digest.
    SecurityError,
    /// Sealing/attestation policy not satisfied.
    PolicyViolation,
    /// AEAD tag or checksum failure.
    IntegrityError,
    /// Key or secret does not exist.
    NotFound,
    /// Backing device failure.
    IoError,
    /// Dispatcher at capacity; the caller may retry.
    Overload,
    /// Cancelled from outside.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ScriptError => "ScriptError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::OutOfGas => "OutOfGas",
            ErrorKind::MemoryError => "MemoryError",
            ErrorKind::SecurityError => "SecurityError",
            ErrorKind::PolicyViolation => "PolicyViolation",
            ErrorKind::IntegrityError => "IntegrityError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::IoError => "IoError",
            ErrorKind::Overload => "Overload",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sealed KV device failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("key not found")]
    NotFound,

    #[error("device i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotFound => ErrorKind::NotFound,
            DeviceError::Io(_) => ErrorKind::IoError,
            DeviceError::CorruptRecord(_) => ErrorKind::IntegrityError,
        }
    }
}

/// Storage engine failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found")]
    NotFound,

    #[error("storage i/o: {0}")]
    Io(String),

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("unknown or closed transaction {0}")]
    UnknownTransaction(u64),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound => ErrorKind::NotFound,
            StorageError::Io(_) => ErrorKind::IoError,
            StorageError::Integrity(_) => ErrorKind::IntegrityError,
            StorageError::UnknownTransaction(_) => ErrorKind::NotFound,
        }
    }
}

impl From<DeviceError> for StorageError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::NotFound => StorageError::NotFound,
            DeviceError::Io(io) => StorageError::Io(io.to_string()),
            DeviceError::CorruptRecord(msg) => StorageError::Integrity(msg),
        }
    }
}

/// Secret manager failures.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found")]
    NotFound,

    #[error("invalid secret name: {0}")]
    InvalidName(String),

    #[error("secret integrity failure: {0}")]
    Integrity(String),

    #[error("sealing policy violation: {0}")]
    PolicyViolation(String),

    #[error("secret storage: {0}")]
    Storage(String),
}

impl SecretError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretError::NotFound => ErrorKind::NotFound,
            SecretError::InvalidName(_) => ErrorKind::SecurityError,
            SecretError::Integrity(_) => ErrorKind::IntegrityError,
            SecretError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            SecretError::Storage(_) => ErrorKind::IoError,
        }
    }
}

impl From<StorageError> for SecretError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => SecretError::NotFound,
            StorageError::Integrity(msg) => SecretError::Integrity(msg),
            other => SecretError::Storage(other.to_string()),
        }
    }
}

/// Sealing and attestation failures.
#[derive(Debug, Error)]
pub enum SealError {
    #[error("sealing policy violation: {0}")]
    PolicyViolation(String),

    #[error("sealed blob integrity failure: {0}")]
    Integrity(String),

    #[error("platform failure: {0}")]
    Platform(String),
}

impl SealError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SealError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            SealError::Integrity(_) => ErrorKind::IntegrityError,
            SealError::Platform(_) => ErrorKind::IoError,
        }
    }
}

/// Gas accounting failure. Carries the observed counters.
#[derive(Debug, Error, Clone, Copy)]
#[error("out of gas: used {used} of {limit}")]
pub struct OutOfGas {
    pub used: u64,
    pub limit: u64,
}
