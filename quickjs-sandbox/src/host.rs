//! Host-call surface exposed to sandboxed scripts.
//!
//! The sandbox itself never resolves secrets, verifies signatures or talks
//! to storage; it forwards every binding invocation to a [`HostCalls`]
//! implementation supplied per run. Requests and responses travel as small
//! JSON envelopes between the loader shim and the host.

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Errors a host binding may produce.
///
/// Everything except [`HostCallError::OutOfGas`] is surfaced to the script
/// as a thrown value it can observe (and, if it wants, catch). Gas
/// exhaustion is fatal: it latches an abort and traps the interpreter at
/// the next interruption point.
#[derive(Debug, Error)]
pub enum HostCallError {
    #[error("out of gas: used {used} of {limit}")]
    OutOfGas { used: u64, limit: u64 },

    #[error("security violation: {0}")]
    Security(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("host failure: {0}")]
    Internal(String),
}

impl HostCallError {
    /// Error name the loader shim assigns to the thrown JS value.
    pub fn js_name(&self) -> &'static str {
        match self {
            HostCallError::OutOfGas { .. } => "OutOfGas",
            HostCallError::Security(_) => "SecurityError",
            HostCallError::NotFound(_) => "NotFound",
            HostCallError::Integrity(_) => "IntegrityError",
            HostCallError::Invalid(_) => "TypeError",
            HostCallError::Internal(_) => "SystemError",
        }
    }
}

/// The only surface a sandboxed script may call into.
///
/// Implementations charge gas for every operation before performing it.
pub trait HostCalls: Send {
    /// Resolve a named secret for the requesting user.
    fn get_secret(&mut self, name: &str) -> Result<String, HostCallError>;

    /// Append a line to the request's audit log.
    fn log(&mut self, message: &str) -> Result<(), HostCallError>;

    /// Verify `signature` over `data` against the enclave public key.
    fn verify_data(&mut self, data: &[u8], signature: &[u8]) -> Result<bool, HostCallError>;

    /// Produce `count` bytes from the platform RNG.
    fn random_bytes(&mut self, count: u32) -> Result<Vec<u8>, HostCallError>;

    /// A script armed a timer.
    fn timer_armed(&mut self, delay_ms: u32) -> Result<(), HostCallError>;

    /// An armed timer fired.
    fn timer_fired(&mut self) -> Result<(), HostCallError>;
}

/// Polled by the watchdog thread on every tick. Implementations must touch
/// only atomics; the watchdog never takes a lock.
pub trait Watchdog: Send + Sync {
    fn poll(&self) -> WatchSignal;
}

/// Verdict of a single watchdog poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSignal {
    Continue,
    OutOfGas,
    Cancelled,
}

/// A watchdog that never interrupts. Useful for embedders that rely on
/// fuel and the wall deadline alone.
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn poll(&self) -> WatchSignal {
        WatchSignal::Continue
    }
}

#[derive(Deserialize)]
#[serde(tag = "fn")]
enum HostRequest {
    #[serde(rename = "getSecret")]
    GetSecret { name: String },
    #[serde(rename = "log")]
    Log { message: String },
    #[serde(rename = "verifyData")]
    VerifyData { data: String, signature: String },
    #[serde(rename = "randomBytes")]
    RandomBytes { count: u32 },
    #[serde(rename = "timerArmed")]
    TimerArmed {
        #[serde(default)]
        delay: u32,
    },
    #[serde(rename = "timerFired")]
    TimerFired {},
}

/// Raised out of the dispatch path when the run must stop making progress.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FatalOutOfGas {
    pub used: u64,
    pub limit: u64,
}

/// Decode one host-call envelope, invoke the binding, encode the response.
///
/// Returns `Err` only for gas exhaustion; every other failure is encoded
/// into the response so the loader can re-throw it inside the script.
pub(crate) fn dispatch_host_call(
    host: &mut dyn HostCalls,
    request: &[u8],
) -> Result<Vec<u8>, FatalOutOfGas> {
    let parsed: HostRequest = match serde_json::from_slice(request) {
        Ok(r) => r,
        Err(e) => {
            return Ok(error_response(&HostCallError::Invalid(format!(
                "malformed host call: {e}"
            ))))
        }
    };

    let outcome = match parsed {
        HostRequest::GetSecret { name } => host.get_secret(&name).map(|v| json!(v)),
        HostRequest::Log { message } => host.log(&message).map(|_| json!(null)),
        HostRequest::VerifyData { data, signature } => {
            use base64::Engine as _;
            match base64::engine::general_purpose::STANDARD.decode(signature.as_bytes()) {
                Ok(sig) => host.verify_data(data.as_bytes(), &sig).map(|v| json!(v)),
                Err(_) => Err(HostCallError::Invalid(
                    "signature must be base64".to_string(),
                )),
            }
        }
        HostRequest::RandomBytes { count } => host.random_bytes(count).map(|v| json!(v)),
        HostRequest::TimerArmed { delay } => host.timer_armed(delay).map(|_| json!(null)),
        HostRequest::TimerFired {} => host.timer_fired().map(|_| json!(null)),
    };

    match outcome {
        Ok(value) => Ok(ok_response(value)),
        Err(HostCallError::OutOfGas { used, limit }) => Err(FatalOutOfGas { used, limit }),
        Err(e) => Ok(error_response(&e)),
    }
}

fn ok_response(value: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({ "ok": true, "value": value }))
        .unwrap_or_else(|_| b"{\"ok\":false,\"kind\":\"SystemError\",\"message\":\"encode\"}".to_vec())
}

fn error_response(error: &HostCallError) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ok": false,
        "kind": error.js_name(),
        "message": error.to_string(),
    }))
    .unwrap_or_else(|_| b"{\"ok\":false,\"kind\":\"SystemError\",\"message\":\"encode\"}".to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records calls and answers from canned values.
    struct MockHost {
        calls: Vec<String>,
        gas_left: u64,
    }

    impl MockHost {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                gas_left: 1000,
            }
        }

        fn spend(&mut self, units: u64) -> Result<(), HostCallError> {
            if units > self.gas_left {
                return Err(HostCallError::OutOfGas {
                    used: 1000,
                    limit: 1000,
                });
            }
            self.gas_left -= units;
            Ok(())
        }
    }

    impl HostCalls for MockHost {
        fn get_secret(&mut self, name: &str) -> Result<String, HostCallError> {
            self.spend(50)?;
            self.calls.push(format!("getSecret:{name}"));
            if name == "missing" {
                return Err(HostCallError::NotFound(format!("secret {name}")));
            }
            Ok("s3cret".to_string())
        }

        fn log(&mut self, message: &str) -> Result<(), HostCallError> {
            self.spend(1)?;
            self.calls.push(format!("log:{message}"));
            Ok(())
        }

        fn verify_data(&mut self, _data: &[u8], signature: &[u8]) -> Result<bool, HostCallError> {
            self.spend(50)?;
            Ok(signature.len() == 64)
        }

        fn random_bytes(&mut self, count: u32) -> Result<Vec<u8>, HostCallError> {
            self.spend(20 + count as u64)?;
            Ok(vec![7u8; count as usize])
        }

        fn timer_armed(&mut self, _delay_ms: u32) -> Result<(), HostCallError> {
            self.spend(15)
        }

        fn timer_fired(&mut self) -> Result<(), HostCallError> {
            self.spend(5)
        }
    }

    fn call(host: &mut MockHost, req: serde_json::Value) -> serde_json::Value {
        let bytes = dispatch_host_call(host, &serde_json::to_vec(&req).unwrap()).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn get_secret_roundtrip() {
        let mut host = MockHost::new();
        let resp = call(&mut host, serde_json::json!({"fn": "getSecret", "name": "K"}));
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["value"], "s3cret");
        assert_eq!(host.calls, vec!["getSecret:K"]);
    }

    #[test]
    fn missing_secret_is_a_script_visible_error() {
        let mut host = MockHost::new();
        let resp = call(
            &mut host,
            serde_json::json!({"fn": "getSecret", "name": "missing"}),
        );
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["kind"], "NotFound");
    }

    #[test]
    fn random_bytes_returns_byte_array() {
        let mut host = MockHost::new();
        let resp = call(&mut host, serde_json::json!({"fn": "randomBytes", "count": 4}));
        assert_eq!(resp["ok"], true);
        assert_eq!(resp["value"], serde_json::json!([7, 7, 7, 7]));
    }

    #[test]
    fn verify_data_decodes_base64_signature() {
        use base64::Engine as _;
        let mut host = MockHost::new();
        let sig = base64::engine::general_purpose::STANDARD.encode([0u8; 64]);
        let resp = call(
            &mut host,
            serde_json::json!({"fn": "verifyData", "data": "hello", "signature": sig}),
        );
        assert_eq!(resp["value"], true);

        let resp = call(
            &mut host,
            serde_json::json!({"fn": "verifyData", "data": "hello", "signature": "!!!"}),
        );
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["kind"], "TypeError");
    }

    #[test]
    fn out_of_gas_is_fatal() {
        let mut host = MockHost::new();
        host.gas_left = 10;
        let err = dispatch_host_call(
            &mut host,
            &serde_json::to_vec(&serde_json::json!({"fn": "getSecret", "name": "K"})).unwrap(),
        )
        .unwrap_err();
        assert_eq!(err.limit, 1000);
    }

    #[test]
    fn malformed_envelope_is_type_error() {
        let mut host = MockHost::new();
        let bytes = dispatch_host_call(&mut host, b"not json").unwrap();
        let resp: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(resp["kind"], "TypeError");
    }
}
