//! Runtime assembly: session-key bootstrap, secret durability across a
//! runtime restart, attestation, sealing, and boundary validation. These
//! run without an interpreter binary (an empty WASM module is a valid
//! sandbox payload; it just cannot execute scripts).

use std::collections::BTreeSet;
use std::sync::Arc;

use sealvm_runtime::config::Config;
use sealvm_runtime::device::{KvDevice, MemKvDevice};
use sealvm_runtime::error::ErrorKind;
use sealvm_runtime::tee::{SealPolicy, TeeMode};
use sealvm_runtime::{ExecutionRequest, Runtime};

/// Minimal valid WASM module: magic + version. Compiles, exports nothing.
const EMPTY_WASM: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.enable_auto_flush = false;
    config
}

fn boot(device: Arc<MemKvDevice>) -> Runtime {
    Runtime::init_with_device(test_config(), device, EMPTY_WASM).unwrap()
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
fn session_key_is_minted_once_and_reused() {
    let device = Arc::new(MemKvDevice::new());
    boot(device.clone());
    let sealed_first = device.read("session/encryption-key").unwrap();

    // Second boot in the same process unseals the same key.
    boot(device.clone());
    let sealed_second = device.read("session/encryption-key").unwrap();
    assert_eq!(sealed_first, sealed_second);
}

#[test]
fn secrets_survive_a_runtime_restart() {
    let device = Arc::new(MemKvDevice::new());
    {
        let runtime = boot(device.clone());
        runtime.secrets().put("u1", "K", b"s3cret").unwrap();
    }
    let runtime = boot(device);
    assert_eq!(runtime.secrets().get("u1", "K").unwrap().as_slice(), b"s3cret");
    assert_eq!(
        runtime.secrets().list_names("u1"),
        ["K".to_string()].into_iter().collect()
    );
}

#[test]
fn storage_survives_a_runtime_restart() {
    let device = Arc::new(MemKvDevice::new());
    {
        let runtime = boot(device.clone());
        runtime.storage().put("state/counter", b"41").unwrap();
    }
    let runtime = boot(device);
    assert_eq!(runtime.storage().get("state/counter").unwrap(), b"41");
}

#[test]
fn attestation_reports_simulation_mode() {
    let runtime = boot(Arc::new(MemKvDevice::new()));
    let bundle = runtime.attestation(true).unwrap();
    assert_eq!(bundle.mode, TeeMode::Simulation);
    assert!(bundle.quote.is_none());
}

#[test]
fn seal_unseal_through_the_runtime() {
    let runtime = boot(Arc::new(MemKvDevice::new()));
    for policy in [
        SealPolicy::EnclaveIdentity,
        SealPolicy::SignerIdentity,
        SealPolicy::Hybrid,
    ] {
        let blob = runtime.seal(b"payload", policy).unwrap();
        assert_eq!(runtime.unseal(&blob).unwrap(), b"payload");
    }
}

#[tokio::test]
async fn oversized_code_fails_validation() {
    let runtime = boot(Arc::new(MemKvDevice::new()));
    let mut req = request("x");
    req.code = "/".repeat(1024 * 1024 + 1);
    let response = runtime.execute(req).await;
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::ScriptError));
}

#[tokio::test]
async fn undeclared_secret_fails_validation_with_not_found() {
    let runtime = boot(Arc::new(MemKvDevice::new()));
    let mut req = request("function main(){}");
    req.secret_names = ["missing".to_string()].into_iter().collect();
    let response = runtime.execute(req).await;
    assert_eq!(response.error_kind, Some(ErrorKind::NotFound));
}

#[tokio::test]
async fn failed_requests_leave_a_failure_record() {
    let device = Arc::new(MemKvDevice::new());
    let runtime = boot(device);
    let response = runtime.execute(request("")).await;
    assert!(!response.success);

    let keys = runtime.storage().list("failures/fn1/u1/").unwrap();
    assert_eq!(keys.len(), 1);
    let record: serde_json::Value =
        serde_json::from_slice(&runtime.storage().get(&keys[0]).unwrap()).unwrap();
    assert_eq!(record["error_kind"], "ScriptError");
}

#[tokio::test]
async fn response_envelope_carries_the_enclave_id() {
    let runtime = boot(Arc::new(MemKvDevice::new()));
    let response = runtime.execute(request("")).await;
    assert!(!response.enclave_id.is_empty());
    assert!(!response.attestation_valid); // simulation mode
}

#[test]
fn enclave_signature_verifies_against_itself() {
    let runtime = boot(Arc::new(MemKvDevice::new()));
    let signature = runtime.sign(b"attested payload");
    assert_eq!(signature.len(), 64);
    // Same seed, same signature: the key is derived from the session key.
    assert_eq!(runtime.sign(b"attested payload"), signature);
}

#[test]
fn cancel_of_unknown_execution_is_a_noop() {
    let runtime = boot(Arc::new(MemKvDevice::new()));
    assert!(!runtime.cancel("no-such-id"));
    assert!(runtime.active_executions().is_empty());
}
