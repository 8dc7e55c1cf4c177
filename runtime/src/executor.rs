//! Execution core: one fresh context per request.
//!
//! Validates the request, arms a gas meter, wires the host bindings to
//! the secret store / RNG / audit log, runs the sandbox, maps the outcome
//! onto the canonical error kinds, and writes the metrics or failure
//! record before the response is released.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use sealvm_quickjs_sandbox::{
    HostCallError, HostCalls, RunLimits, RunState, Sandbox, SandboxReport, WatchSignal, Watchdog,
};

use crate::config::GasConfig;
use crate::error::ErrorKind;
use crate::gas::{GasCosts, GasMeter};
use crate::metrics::MetricsWriter;
use crate::secrets::SecretManager;
use crate::storage::StorageEngine;
use crate::tee::{TeeContext, TeeMode};

/// Hard request-boundary limits.
pub const MAX_CODE_BYTES: usize = 1024 * 1024;
pub const MIN_WALL_MS: u64 = 100;
pub const MAX_WALL_MS: u64 = 300_000;

const MAX_RANDOM_BYTES: u32 = 64 * 1024;
const MAX_AUDIT_LINES: usize = 10_000;

fn default_true() -> bool {
    true
}

/// One execution request, as handed over by the outer boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub function_id: String,
    pub user_id: String,
    /// UTF-8 JavaScript source, at most 1 MiB. Must define `main(input)`.
    pub code: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub secret_names: BTreeSet<String>,
    pub gas_limit: u64,
    pub max_wall_ms: u64,
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_profiling: bool,
    /// Caller-chosen id for cancellation; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

/// Extra counters reported when profiling is requested. No semantic
/// effect on the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub validate_us: u64,
    pub execute_us: u64,
    pub persist_us: u64,
    pub host_calls: u64,
    pub fuel_consumed: u64,
}

/// The response envelope surfaced to the outer boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub gas_used: u64,
    pub wall_ms: u64,
    pub attestation_valid: bool,
    pub enclave_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ExecutionProfile>,
}

/// Shared cancellation/metering handle for one in-flight execution.
pub struct ExecutionControl {
    pub(crate) meter: Arc<GasMeter>,
    cancelled: AtomicBool,
}

impl ExecutionControl {
    pub(crate) fn new(meter: Arc<GasMeter>) -> Self {
        Self {
            meter,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Idempotent: flips the meter into lockout and marks the run
    /// cancelled; the watchdog aborts the interpreter at its next tick.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.meter.lock_out();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Watchdog the sandbox polls from its tick thread. Atomics only.
struct MeterWatchdog {
    control: Arc<ExecutionControl>,
}

impl Watchdog for MeterWatchdog {
    fn poll(&self) -> WatchSignal {
        if self.control.is_cancelled() {
            return WatchSignal::Cancelled;
        }
        self.control.meter.accrue_time();
        if self.control.meter.locked_out() {
            WatchSignal::OutOfGas
        } else {
            WatchSignal::Continue
        }
    }
}

/// Host-binding implementation for one request. Charges gas before every
/// operation; shares its audit buffer and counters with the core through
/// handles so they survive the sandbox consuming the box.
struct RequestHost {
    user_id: String,
    meter: Arc<GasMeter>,
    secrets: Arc<SecretManager>,
    tee: Arc<TeeContext>,
    verifying_key: VerifyingKey,
    costs: GasCosts,
    audit: Arc<Mutex<Vec<String>>>,
    host_calls: Arc<AtomicU64>,
}

impl RequestHost {
    fn charge(&self, units: u64) -> Result<(), HostCallError> {
        self.meter.charge(units).map_err(|e| HostCallError::OutOfGas {
            used: e.used,
            limit: e.limit,
        })
    }
}

impl HostCalls for RequestHost {
    fn get_secret(&mut self, name: &str) -> Result<String, HostCallError> {
        self.host_calls.fetch_add(1, Ordering::Relaxed);
        self.charge(self.costs.crypto_op)?;
        let plaintext = self.secrets.get(&self.user_id, name).map_err(|e| match e {
            crate::error::SecretError::NotFound => {
                HostCallError::NotFound(format!("secret {name}"))
            }
            crate::error::SecretError::Integrity(msg) => HostCallError::Integrity(msg),
            other => HostCallError::Internal(other.to_string()),
        })?;
        String::from_utf8(plaintext.to_vec())
            .map_err(|_| HostCallError::Internal(format!("secret {name} is not utf-8")))
    }

    fn log(&mut self, message: &str) -> Result<(), HostCallError> {
        self.host_calls.fetch_add(1, Ordering::Relaxed);
        self.charge(self.costs.basic_op + self.costs.memory(message.len()))?;
        let mut audit = self.audit.lock().unwrap();
        if audit.len() < MAX_AUDIT_LINES {
            audit.push(message.to_string());
        }
        Ok(())
    }

    fn verify_data(&mut self, data: &[u8], signature: &[u8]) -> Result<bool, HostCallError> {
        self.host_calls.fetch_add(1, Ordering::Relaxed);
        self.charge(self.costs.crypto_op)?;
        let bytes: [u8; 64] = match signature.try_into() {
            Ok(b) => b,
            Err(_) => return Ok(false),
        };
        let signature = Signature::from_bytes(&bytes);
        Ok(self.verifying_key.verify(data, &signature).is_ok())
    }

    fn random_bytes(&mut self, count: u32) -> Result<Vec<u8>, HostCallError> {
        self.host_calls.fetch_add(1, Ordering::Relaxed);
        if count > MAX_RANDOM_BYTES {
            return Err(HostCallError::Invalid(format!(
                "at most {MAX_RANDOM_BYTES} random bytes per call"
            )));
        }
        self.charge(self.costs.random(count))?;
        self.tee
            .random(count as usize)
            .map_err(|e| HostCallError::Internal(e.to_string()))
    }

    fn timer_armed(&mut self, _delay_ms: u32) -> Result<(), HostCallError> {
        self.host_calls.fetch_add(1, Ordering::Relaxed);
        self.charge(self.costs.timer_arm)
    }

    fn timer_fired(&mut self) -> Result<(), HostCallError> {
        self.host_calls.fetch_add(1, Ordering::Relaxed);
        self.charge(self.costs.timer_fire)
    }
}

/// Reject malformed requests before any resources are committed.
pub(crate) fn validate_request(
    request: &ExecutionRequest,
    max_gas_limit: u64,
    secrets: &SecretManager,
) -> Result<(), (ErrorKind, String)> {
    if request.code.is_empty() {
        return Err((ErrorKind::ScriptError, "code must not be empty".to_string()));
    }
    if request.code.len() > MAX_CODE_BYTES {
        return Err((
            ErrorKind::ScriptError,
            format!("code exceeds {MAX_CODE_BYTES} bytes"),
        ));
    }
    if request.gas_limit == 0 || request.gas_limit > max_gas_limit {
        return Err((
            ErrorKind::ScriptError,
            format!("gas limit must be in 1..={max_gas_limit}"),
        ));
    }
    if !(MIN_WALL_MS..=MAX_WALL_MS).contains(&request.max_wall_ms) {
        return Err((
            ErrorKind::ScriptError,
            format!("wall limit must be in {MIN_WALL_MS}..={MAX_WALL_MS} ms"),
        ));
    }
    if request.user_id.is_empty() || request.function_id.is_empty() {
        return Err((
            ErrorKind::ScriptError,
            "function id and user id must not be empty".to_string(),
        ));
    }
    for name in &request.secret_names {
        if !secrets.exists(&request.user_id, name) {
            return Err((
                ErrorKind::NotFound,
                format!("declared secret {name} does not exist for this user"),
            ));
        }
    }
    Ok(())
}

/// Map a script fault (JS error name + message) onto a canonical kind.
fn kind_for_fault(name: &str, message: &str) -> ErrorKind {
    if message.to_ascii_lowercase().contains("out of memory") {
        return ErrorKind::MemoryError;
    }
    match name {
        "SecurityError" => ErrorKind::SecurityError,
        "OutOfGas" => ErrorKind::OutOfGas,
        "NotFound" => ErrorKind::NotFound,
        "IntegrityError" => ErrorKind::IntegrityError,
        "Cancelled" => ErrorKind::Cancelled,
        "SystemError" | "IoError" => ErrorKind::IoError,
        _ => ErrorKind::ScriptError,
    }
}

pub(crate) struct ExecutionCore {
    pub(crate) sandbox: Sandbox,
    pub(crate) secrets: Arc<SecretManager>,
    pub(crate) storage: Arc<StorageEngine>,
    pub(crate) metrics: Arc<MetricsWriter>,
    pub(crate) tee: Arc<TeeContext>,
    pub(crate) gas_config: GasConfig,
    pub(crate) max_fuel: u64,
    pub(crate) signing_key: SigningKey,
    pub(crate) enclave_id: String,
}

impl ExecutionCore {
    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Sign `data` with the enclave key; scripts check such signatures
    /// through `verifyData`.
    pub(crate) fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    fn base_response(&self, gas_used: u64, wall_ms: u64) -> ExecutionResponse {
        ExecutionResponse {
            success: false,
            result: None,
            gas_used,
            wall_ms,
            attestation_valid: self.tee.mode() == TeeMode::Hardware,
            enclave_id: self.enclave_id.clone(),
            error_kind: None,
            error_message: None,
            profile: None,
        }
    }

    /// Run one request to completion. Blocking; the dispatcher calls this
    /// on a blocking thread.
    pub(crate) fn run(
        &self,
        request: &ExecutionRequest,
        control: Arc<ExecutionControl>,
    ) -> ExecutionResponse {
        let started = Instant::now();
        let start_ms = Self::now_ms();
        let meter = control.meter.clone();

        if let Err((kind, message)) = validate_request(
            request,
            self.gas_config.max_gas_limit,
            &self.secrets,
        ) {
            let mut response = self.base_response(0, 0);
            response.error_kind = Some(kind);
            response.error_message = Some(message.clone());
            self.write_failure(request, kind, &message, 0, 0, start_ms);
            return response;
        }
        let validate_us = started.elapsed().as_micros() as u64;

        // Entry cost: even a script that does nothing pays it.
        let costs = GasCosts::from_config(&self.gas_config);
        if let Err(e) = meter.charge(costs.basic_op) {
            let mut response = self.base_response(meter.used(), meter.wall_ms());
            response.error_kind = Some(ErrorKind::OutOfGas);
            response.error_message = Some(e.to_string());
            self.write_failure(
                request,
                ErrorKind::OutOfGas,
                &e.to_string(),
                meter.used(),
                meter.wall_ms(),
                start_ms,
            );
            return response;
        }

        let audit: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let host_calls = Arc::new(AtomicU64::new(0));
        let host = RequestHost {
            user_id: request.user_id.clone(),
            meter: meter.clone(),
            secrets: self.secrets.clone(),
            tee: self.tee.clone(),
            verifying_key: self.signing_key.verifying_key(),
            costs,
            audit: audit.clone(),
            host_calls: host_calls.clone(),
        };
        let watchdog = Arc::new(MeterWatchdog {
            control: control.clone(),
        });

        let limits = RunLimits {
            max_fuel: self.max_fuel,
            max_wall: Duration::from_millis(request.max_wall_ms),
        };

        let execute_started = Instant::now();
        let report = match self.sandbox.run(
            &request.code,
            &request.input,
            &limits,
            Box::new(host),
            watchdog,
        ) {
            Ok(report) => report,
            Err(e) => {
                let message = format!("sandbox unavailable: {e}");
                let mut response = self.base_response(meter.used(), meter.wall_ms());
                response.error_kind = Some(ErrorKind::IoError);
                response.error_message = Some(message.clone());
                self.write_failure(
                    request,
                    ErrorKind::IoError,
                    &message,
                    meter.used(),
                    meter.wall_ms(),
                    start_ms,
                );
                return response;
            }
        };
        let execute_us = execute_started.elapsed().as_micros() as u64;

        meter.accrue_time();
        let gas_used = meter.used();
        let wall_ms = started.elapsed().as_millis() as u64;

        let persist_started = Instant::now();
        let outcome = self.map_report(&control, &report);
        let mut response = self.base_response(gas_used, wall_ms);
        match outcome {
            Ok(result) => {
                response.success = true;
                response.result = Some(result);
                if request.enable_metrics {
                    if let Err(e) = self.metrics.record_success(
                        &request.function_id,
                        &request.user_id,
                        gas_used,
                        wall_ms,
                        start_ms,
                    ) {
                        // A response may not be released without its record.
                        warn!(error = %e, "metrics record failed");
                        response.success = false;
                        response.result = None;
                        response.error_kind = Some(ErrorKind::IoError);
                        response.error_message = Some(format!("metrics record failed: {e}"));
                    }
                }
            }
            Err((kind, message)) => {
                response.error_kind = Some(kind);
                response.error_message = Some(message.clone());
                self.write_failure(request, kind, &message, gas_used, wall_ms, start_ms);
            }
        }

        self.write_audit(request, &report, &audit, start_ms);
        let alerts = self.storage.take_integrity_alerts();
        if let Err(e) = self.metrics.report_integrity_alerts(&alerts) {
            warn!(error = %e, "integrity alert record failed");
        }
        let persist_us = persist_started.elapsed().as_micros() as u64;

        if request.enable_profiling {
            response.profile = Some(ExecutionProfile {
                validate_us,
                execute_us,
                persist_us,
                host_calls: host_calls.load(Ordering::Relaxed),
                fuel_consumed: report.fuel_consumed,
            });
        }

        debug!(
            function = %request.function_id,
            user = %request.user_id,
            success = response.success,
            gas_used,
            wall_ms,
            "execution finished"
        );
        response
    }

    fn map_report(
        &self,
        control: &ExecutionControl,
        report: &SandboxReport,
    ) -> Result<serde_json::Value, (ErrorKind, String)> {
        if report.cancelled || (control.is_cancelled() && report.state != RunState::Completed) {
            return Err((ErrorKind::Cancelled, "execution cancelled".to_string()));
        }
        match report.state {
            RunState::Completed => Ok(report
                .result
                .clone()
                .unwrap_or(serde_json::Value::Null)),
            RunState::OutOfGas => Err((
                ErrorKind::OutOfGas,
                format!(
                    "out of gas: used {} of {}",
                    control.meter.used(),
                    control.meter.limit()
                ),
            )),
            RunState::TimedOut => Err((
                ErrorKind::TimeoutError,
                "wall-clock deadline exceeded".to_string(),
            )),
            RunState::Failed => {
                let (name, message) = report
                    .fault
                    .as_ref()
                    .map(|f| (f.name.as_str(), f.message.as_str()))
                    .unwrap_or(("ScriptError", "script failed"));
                Err((kind_for_fault(name, message), format!("{name}: {message}")))
            }
        }
    }

    fn write_failure(
        &self,
        request: &ExecutionRequest,
        kind: ErrorKind,
        message: &str,
        gas_used: u64,
        wall_ms: u64,
        start_ms: u64,
    ) {
        if let Err(e) = self.metrics.record_failure(
            &request.function_id,
            &request.user_id,
            kind,
            message,
            gas_used,
            wall_ms,
            start_ms,
        ) {
            warn!(error = %e, "failure record failed");
        }
    }

    fn write_audit(
        &self,
        request: &ExecutionRequest,
        report: &SandboxReport,
        audit: &Arc<Mutex<Vec<String>>>,
        start_ms: u64,
    ) {
        let logs = std::mem::take(&mut *audit.lock().unwrap());
        // The code digest is always recorded on hardware; script log
        // lines are recorded whenever present.
        if logs.is_empty() && self.tee.mode() != TeeMode::Hardware {
            return;
        }
        if let Err(e) = self.metrics.append_audit(
            &request.function_id,
            &request.user_id,
            &hex::encode(report.code_digest),
            &logs,
            start_ms,
        ) {
            warn!(error = %e, "audit record failed");
        }
    }
}

/// Derive a named subkey from the session encryption key.
pub(crate) fn derive_subkey(sek: &Zeroizing<[u8; 32]>, domain: &str) -> Zeroizing<[u8; 32]> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"sealvm-subkey/");
    hasher.update(domain.as_bytes());
    hasher.update(b"/");
    hasher.update(sek.as_slice());
    Zeroizing::new(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::device::MemKvDevice;

    fn secrets() -> Arc<SecretManager> {
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
        let secrets = SecretManager::open(engine, &[2u8; 32]).unwrap();
        secrets.put("u1", "K", b"v").unwrap();
        Arc::new(secrets)
    }

    fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest {
            function_id: "fn1".to_string(),
            user_id: "u1".to_string(),
            code: code.to_string(),
            input: serde_json::json!({}),
            secret_names: BTreeSet::new(),
            gas_limit: 10_000,
            max_wall_ms: 1_000,
            enable_metrics: true,
            enable_profiling: false,
            execution_id: None,
        }
    }

    #[test]
    fn code_size_boundary() {
        let secrets = secrets();
        let mut req = request("x");
        req.code = "/".repeat(MAX_CODE_BYTES);
        assert!(validate_request(&req, 1_000_000, &secrets).is_ok());
        req.code.push('/');
        let (kind, _) = validate_request(&req, 1_000_000, &secrets).unwrap_err();
        assert_eq!(kind, ErrorKind::ScriptError);
    }

    #[test]
    fn empty_code_is_rejected() {
        let secrets = secrets();
        let req = request("");
        assert!(validate_request(&req, 1_000_000, &secrets).is_err());
    }

    #[test]
    fn limits_must_be_in_range() {
        let secrets = secrets();
        let mut req = request("function main(){}");
        req.gas_limit = 0;
        assert!(validate_request(&req, 1_000_000, &secrets).is_err());
        req.gas_limit = 2_000_000;
        assert!(validate_request(&req, 1_000_000, &secrets).is_err());
        req.gas_limit = 1;
        assert!(validate_request(&req, 1_000_000, &secrets).is_ok());

        req.max_wall_ms = 99;
        assert!(validate_request(&req, 1_000_000, &secrets).is_err());
        req.max_wall_ms = 300_001;
        assert!(validate_request(&req, 1_000_000, &secrets).is_err());
        req.max_wall_ms = 100;
        assert!(validate_request(&req, 1_000_000, &secrets).is_ok());
    }

    #[test]
    fn undeclared_secret_names_are_not_found() {
        let secrets = secrets();
        let mut req = request("function main(){}");
        req.secret_names = ["K".to_string()].into_iter().collect();
        assert!(validate_request(&req, 1_000_000, &secrets).is_ok());
        req.secret_names = ["missing".to_string()].into_iter().collect();
        let (kind, _) = validate_request(&req, 1_000_000, &secrets).unwrap_err();
        assert_eq!(kind, ErrorKind::NotFound);
    }

    #[test]
    fn fault_mapping_covers_the_taxonomy() {
        assert_eq!(
            kind_for_fault("SecurityError", "eval is not available"),
            ErrorKind::SecurityError
        );
        assert_eq!(kind_for_fault("NotFound", "secret K"), ErrorKind::NotFound);
        assert_eq!(
            kind_for_fault("InternalError", "out of memory"),
            ErrorKind::MemoryError
        );
        assert_eq!(kind_for_fault("TypeError", "boom"), ErrorKind::ScriptError);
        assert_eq!(kind_for_fault("SystemError", "io"), ErrorKind::IoError);
        assert_eq!(
            kind_for_fault("Cancelled", "execution cancelled"),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn subkeys_are_domain_separated() {
        let sek = Zeroizing::new([7u8; 32]);
        let a = derive_subkey(&sek, "storage");
        let b = derive_subkey(&sek, "secrets");
        assert_ne!(a.as_slice(), b.as_slice());
        let a2 = derive_subkey(&sek, "storage");
        assert_eq!(a.as_slice(), a2.as_slice());
    }

    #[test]
    fn control_cancel_is_idempotent() {
        let control = ExecutionControl::new(Arc::new(GasMeter::new(100, 0)));
        assert!(!control.is_cancelled());
        control.cancel();
        control.cancel();
        assert!(control.is_cancelled());
        assert!(control.meter.locked_out());
    }
}
