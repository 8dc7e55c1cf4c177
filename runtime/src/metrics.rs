//! Append-only metrics and audit records.
//!
//! Success records land under `metrics/<fn>/<user>/<id>`, failures under
//! `failures/<fn>/<user>/<id>`, audit entries (script log lines, code
//! digests, integrity alerts) under `audit/<fn>/<user>/<id>`. All records
//! go through the storage engine, so they share its encryption, and
//! through one writer, so ids are totally ordered. A record is flushed
//! durable before the caller releases its response.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{ErrorKind, StorageError};
use crate::storage::StorageEngine;

#[derive(Debug, Serialize)]
struct SuccessRecord<'a> {
    function_id: &'a str,
    user_id: &'a str,
    gas_used: u64,
    wall_ms: u64,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct FailureRecord<'a> {
    function_id: &'a str,
    user_id: &'a str,
    error_kind: ErrorKind,
    message: &'a str,
    gas_used_at_fail: u64,
    wall_ms: u64,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    function_id: &'a str,
    user_id: &'a str,
    code_digest: &'a str,
    logs: &'a [String],
    timestamp: u64,
}

pub struct MetricsWriter {
    engine: Arc<StorageEngine>,
    counter: AtomicU64,
    /// Serializes record emission so id order equals commit order.
    writer: Mutex<()>,
}

impl MetricsWriter {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            counter: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Monotone record id: start wall-time plus a process counter for
    /// tie-breaking.
    fn next_id(&self, start_ms: u64) -> String {
        let seq = self.counter.fetch_add(1, Ordering::AcqRel);
        format!("{start_ms:013}-{seq:06}")
    }

    fn write_durable(&self, key: &str, record: &[u8]) -> Result<(), StorageError> {
        let _guard = self.writer.lock().unwrap();
        self.engine.put(key, record)?;
        self.engine.flush()?;
        debug!(key, "record written");
        Ok(())
    }

    pub fn record_success(
        &self,
        function_id: &str,
        user_id: &str,
        gas_used: u64,
        wall_ms: u64,
        start_ms: u64,
    ) -> Result<(), StorageError> {
        let record = SuccessRecord {
            function_id,
            user_id,
            gas_used,
            wall_ms,
            timestamp: Self::now_ms(),
        };
        let key = format!("metrics/{function_id}/{user_id}/{}", self.next_id(start_ms));
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StorageError::Io(format!("encode record: {e}")))?;
        self.write_durable(&key, &bytes)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_failure(
        &self,
        function_id: &str,
        user_id: &str,
        error_kind: ErrorKind,
        message: &str,
        gas_used_at_fail: u64,
        wall_ms: u64,
        start_ms: u64,
    ) -> Result<(), StorageError> {
        let record = FailureRecord {
            function_id,
            user_id,
            error_kind,
            message,
            gas_used_at_fail,
            wall_ms,
            timestamp: Self::now_ms(),
        };
        let key = format!("failures/{function_id}/{user_id}/{}", self.next_id(start_ms));
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StorageError::Io(format!("encode record: {e}")))?;
        self.write_durable(&key, &bytes)
    }

    /// Append an audit entry: the executed code digest plus any script
    /// log lines.
    pub fn append_audit(
        &self,
        function_id: &str,
        user_id: &str,
        code_digest: &str,
        logs: &[String],
        start_ms: u64,
    ) -> Result<(), StorageError> {
        let record = AuditRecord {
            function_id,
            user_id,
            code_digest,
            logs,
            timestamp: Self::now_ms(),
        };
        let key = format!("audit/{function_id}/{user_id}/{}", self.next_id(start_ms));
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StorageError::Io(format!("encode record: {e}")))?;
        self.write_durable(&key, &bytes)
    }

    /// Surface storage keys that failed integrity checks repeatedly.
    pub fn report_integrity_alerts(&self, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let start_ms = Self::now_ms();
        let lines: Vec<String> = keys
            .iter()
            .map(|k| format!("repeated integrity failures on {k}"))
            .collect();
        self.append_audit("storage", "system", "", &lines, start_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::device::MemKvDevice;

    fn writer() -> (Arc<StorageEngine>, MetricsWriter) {
        let engine = Arc::new(
            StorageEngine::open(
                Arc::new(MemKvDevice::new()),
                Some(&[1u8; 32]),
                StorageConfig {
                    enable_auto_flush: false,
                    ..StorageConfig::default()
                },
            )
            .unwrap(),
        );
        (engine.clone(), MetricsWriter::new(engine))
    }

    #[test]
    fn success_records_land_under_metrics() {
        let (engine, metrics) = writer();
        metrics
            .record_success("fn1", "u1", 1234, 56, 1_700_000_000_000)
            .unwrap();
        let keys = engine.list("metrics/fn1/u1/").unwrap();
        assert_eq!(keys.len(), 1);
        let record: serde_json::Value =
            serde_json::from_slice(&engine.get(&keys[0]).unwrap()).unwrap();
        assert_eq!(record["gas_used"], 1234);
        assert_eq!(record["wall_ms"], 56);
    }

    #[test]
    fn failure_records_carry_the_kind() {
        let (engine, metrics) = writer();
        metrics
            .record_failure(
                "fn1",
                "u1",
                ErrorKind::OutOfGas,
                "out of gas: used 600 of 500",
                600,
                12,
                1_700_000_000_000,
            )
            .unwrap();
        let keys = engine.list("failures/fn1/u1/").unwrap();
        assert_eq!(keys.len(), 1);
        let record: serde_json::Value =
            serde_json::from_slice(&engine.get(&keys[0]).unwrap()).unwrap();
        assert_eq!(record["error_kind"], "OutOfGas");
        assert_eq!(record["gas_used_at_fail"], 600);
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let (engine, metrics) = writer();
        for _ in 0..5 {
            metrics
                .record_success("f", "u", 1, 1, 1_700_000_000_000)
                .unwrap();
        }
        let mut keys = engine.list("metrics/f/u/").unwrap();
        keys.sort();
        assert_eq!(keys.len(), 5);
        keys.dedup();
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn audit_records_carry_logs_and_digest() {
        let (engine, metrics) = writer();
        metrics
            .append_audit(
                "f",
                "u",
                "abcd",
                &["line one".to_string(), "line two".to_string()],
                1_700_000_000_000,
            )
            .unwrap();
        let keys = engine.list("audit/f/u/").unwrap();
        let record: serde_json::Value =
            serde_json::from_slice(&engine.get(&keys[0]).unwrap()).unwrap();
        assert_eq!(record["code_digest"], "abcd");
        assert_eq!(record["logs"].as_array().unwrap().len(), 2);
    }
}
