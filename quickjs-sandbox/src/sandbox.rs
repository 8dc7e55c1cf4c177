//! Wasmtime-backed QuickJS sandbox.
//!
//! A [`Sandbox`] compiles the QuickJS WASM binary once and then executes
//! scripts against it, one fresh store per run:
//!
//! - fuel metering bounds instruction count deterministically,
//! - epoch interruption plus a watchdog thread bounds wall time and lets
//!   the embedder abort a run (gas exhaustion, cancellation),
//! - a store limiter bounds linear memory growth,
//! - code, input and result travel through a preopened `/work` scratch
//!   directory; host bindings travel through the `sealvm` import pair.
//!
//! The QuickJS binary must be built with the `sealvm` host bridge: it
//! imports `sealvm::host_call(ptr, len) -> len` and
//! `sealvm::host_read(ptr) -> len`, and exposes them to scripts as
//! `globalThis.__sealvm_hostcall(json) -> json`.

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use wasmtime::{
    Caller, Engine, Extern, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
    UpdateDeadline,
};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::host::{dispatch_host_call, HostCalls, WatchSignal, Watchdog};
use crate::loader::{CODE_NAME, INPUT_NAME, LOADER_MJS, LOADER_NAME, OUT_NAME};

/// Watchdog tick; also the epoch granularity.
const TICK: Duration = Duration::from_millis(5);

/// Abort reasons latched by the watchdog or a fatal host call.
const ABORT_NONE: u8 = 0;
const ABORT_OUT_OF_GAS: u8 = 1;
const ABORT_DEADLINE: u8 = 2;
const ABORT_CANCELLED: u8 = 3;

/// Sandbox construction parameters.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Linear memory ceiling per run, in bytes.
    pub max_memory_bytes: usize,
    /// When set, only scripts whose SHA-256 digest (lowercase hex) is
    /// listed may execute.
    pub code_allowlist: Option<HashSet<String>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 128 * 1024 * 1024,
            code_allowlist: None,
        }
    }
}

/// Per-run resource limits.
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Fuel budget (instruction-ish accounting).
    pub max_fuel: u64,
    /// Wall-clock budget enforced by the watchdog.
    pub max_wall: Duration,
}

/// Terminal state of a run. Observed exactly once, in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Completed,
    Failed,
    OutOfGas,
    TimedOut,
}

/// A script-level failure: the JS error name and message.
#[derive(Debug, Clone)]
pub struct ScriptFault {
    pub name: String,
    pub message: String,
}

/// Outcome of one sandboxed execution.
#[derive(Debug)]
pub struct SandboxReport {
    pub state: RunState,
    pub result: Option<serde_json::Value>,
    pub fault: Option<ScriptFault>,
    pub fuel_consumed: u64,
    pub wall: Duration,
    /// SHA-256 of the executed script, for the audit trail.
    pub code_digest: [u8; 32],
    /// Set when the run was stopped by an external cancel signal.
    pub cancelled: bool,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("interpreter init failed: {0}")]
    Init(String),

    #[error("scratch dir: {0}")]
    Io(#[from] std::io::Error),

    #[error("interpreter wiring failed: {0}")]
    Wiring(String),
}

/// Store state for one run.
struct RunCtx {
    wasi: WasiP1Ctx,
    host: Box<dyn HostCalls>,
    pending: Vec<u8>,
    limits: StoreLimits,
}

/// Hardened QuickJS sandbox. Compile once, run many.
pub struct Sandbox {
    engine: Engine,
    module: Module,
    config: SandboxConfig,
}

impl Sandbox {
    /// Create a sandbox from QuickJS WASM bytes.
    pub fn new(quickjs_wasm: &[u8], config: SandboxConfig) -> Result<Self, SandboxError> {
        let mut wcfg = wasmtime::Config::new();
        wcfg.consume_fuel(true);
        wcfg.epoch_interruption(true);
        wcfg.debug_info(false);
        let engine =
            Engine::new(&wcfg).map_err(|e| SandboxError::Init(format!("engine: {e}")))?;
        let module = Module::new(&engine, quickjs_wasm)
            .map_err(|e| SandboxError::Init(format!("compile quickjs: {e}")))?;
        Ok(Self {
            engine,
            module,
            config,
        })
    }

    /// Compute the digest recorded for a script.
    pub fn code_digest(code: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        hasher.finalize().into()
    }

    /// Execute `main(input)` from `code` under the given limits.
    ///
    /// Host bindings dispatch into `host`; `watchdog` is polled on every
    /// tick and may stop the run (the poll must only touch atomics).
    pub fn run(
        &self,
        code: &str,
        input: &serde_json::Value,
        limits: &RunLimits,
        host: Box<dyn HostCalls>,
        watchdog: Arc<dyn Watchdog>,
    ) -> Result<SandboxReport, SandboxError> {
        let start = Instant::now();
        let code_digest = Self::code_digest(code);

        if let Some(allowlist) = &self.config.code_allowlist {
            let digest_hex = hex::encode(code_digest);
            if !allowlist.contains(&digest_hex) {
                warn!(digest = %digest_hex, "refusing script outside digest allowlist");
                return Ok(SandboxReport {
                    state: RunState::Failed,
                    result: None,
                    fault: Some(ScriptFault {
                        name: "SecurityError".to_string(),
                        message: "script digest is not allowlisted".to_string(),
                    }),
                    fuel_consumed: 0,
                    wall: start.elapsed(),
                    code_digest,
                    cancelled: false,
                });
            }
        }

        // 1) Materialize the /work payload.
        let scratch = tempfile::TempDir::new()?;
        let work = scratch.path();
        fs::write(work.join(LOADER_NAME), LOADER_MJS)?;
        fs::write(work.join(CODE_NAME), code)?;
        fs::write(work.join(INPUT_NAME), serde_json::to_vec(input).unwrap_or_default())?;

        // 2) WASI store with preopened /work.
        let mut wasi_builder = WasiCtxBuilder::new();
        wasi_builder.inherit_stderr();
        wasi_builder
            .preopened_dir(work, "/work", DirPerms::all(), FilePerms::all())
            .map_err(|e| SandboxError::Wiring(format!("preopen /work: {e}")))?;
        wasi_builder.arg("qjs");
        wasi_builder.arg("-m");
        wasi_builder.arg(format!("/work/{LOADER_NAME}"));
        let wasi = wasi_builder.build_p1();

        let abort = Arc::new(AtomicU8::new(ABORT_NONE));

        let ctx = RunCtx {
            wasi,
            host,
            pending: Vec::new(),
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory_bytes)
                .build(),
        };
        let mut store = Store::new(&self.engine, ctx);
        store.limiter(|cx| &mut cx.limits);
        store
            .set_fuel(limits.max_fuel)
            .map_err(|e| SandboxError::Wiring(format!("set fuel: {e}")))?;
        store.set_epoch_deadline(1);
        {
            let abort = abort.clone();
            store.epoch_deadline_callback(move |_cx| {
                match abort.load(Ordering::Acquire) {
                    ABORT_NONE => Ok(UpdateDeadline::Continue(1)),
                    ABORT_OUT_OF_GAS => Err(anyhow!("aborted: out of gas")),
                    ABORT_DEADLINE => Err(anyhow!("aborted: wall deadline exceeded")),
                    _ => Err(anyhow!("aborted: cancelled")),
                }
            });
        }

        // 3) Watchdog: drives epochs, polls the embedder, enforces the
        // wall deadline. Writes only to the abort atomic.
        let done = Arc::new(AtomicBool::new(false));
        let ticker = {
            let engine = self.engine.clone();
            let abort = abort.clone();
            let done = done.clone();
            let watchdog = watchdog.clone();
            let deadline = limits.max_wall;
            std::thread::spawn(move || {
                let begun = Instant::now();
                while !done.load(Ordering::Acquire) {
                    std::thread::sleep(TICK);
                    engine.increment_epoch();
                    if abort.load(Ordering::Acquire) != ABORT_NONE {
                        continue;
                    }
                    let signal = watchdog.poll();
                    let verdict = match signal {
                        WatchSignal::OutOfGas => ABORT_OUT_OF_GAS,
                        WatchSignal::Cancelled => ABORT_CANCELLED,
                        WatchSignal::Continue if begun.elapsed() >= deadline => ABORT_DEADLINE,
                        WatchSignal::Continue => ABORT_NONE,
                    };
                    if verdict != ABORT_NONE {
                        let _ = abort.compare_exchange(
                            ABORT_NONE,
                            verdict,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                }
            })
        };

        // 4) Linker: WASI preview1 plus the sealvm host-call pair.
        let mut linker: Linker<RunCtx> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |cx: &mut RunCtx| &mut cx.wasi)
            .map_err(|e| SandboxError::Wiring(format!("link wasi: {e}")))?;
        {
            let abort = abort.clone();
            linker
                .func_wrap(
                    "sealvm",
                    "host_call",
                    move |mut caller: Caller<'_, RunCtx>, ptr: i32, len: i32| -> anyhow::Result<i32> {
                        let memory = match caller.get_export("memory") {
                            Some(Extern::Memory(m)) => m,
                            _ => return Err(anyhow!("no exported memory")),
                        };
                        let start = ptr as usize;
                        let end = start
                            .checked_add(len as usize)
                            .ok_or_else(|| anyhow!("host call out of bounds"))?;
                        let data = memory.data(&caller);
                        let request = data
                            .get(start..end)
                            .ok_or_else(|| anyhow!("host call out of bounds"))?
                            .to_vec();
                        let response = match dispatch_host_call(&mut *caller.data_mut().host, &request) {
                            Ok(bytes) => bytes,
                            Err(fatal) => {
                                abort.store(ABORT_OUT_OF_GAS, Ordering::Release);
                                return Err(anyhow!(
                                    "aborted: out of gas (used {} of {})",
                                    fatal.used,
                                    fatal.limit
                                ));
                            }
                        };
                        let response_len = response.len() as i32;
                        caller.data_mut().pending = response;
                        Ok(response_len)
                    },
                )
                .map_err(|e| SandboxError::Wiring(format!("link host_call: {e}")))?;
        }
        linker
            .func_wrap(
                "sealvm",
                "host_read",
                |mut caller: Caller<'_, RunCtx>, ptr: i32| -> anyhow::Result<i32> {
                    let memory = match caller.get_export("memory") {
                        Some(Extern::Memory(m)) => m,
                        _ => return Err(anyhow!("no exported memory")),
                    };
                    let pending = std::mem::take(&mut caller.data_mut().pending);
                    memory
                        .write(&mut caller, ptr as usize, &pending)
                        .map_err(|e| anyhow!("host read out of bounds: {e}"))?;
                    Ok(pending.len() as i32)
                },
            )
            .map_err(|e| SandboxError::Wiring(format!("link host_read: {e}")))?;

        // 5) Instantiate and run _start (the qjs entry point).
        let call_result = (|| -> anyhow::Result<()> {
            let instance = linker.instantiate(&mut store, &self.module)?;
            let start_fn = instance.get_typed_func::<(), ()>(&mut store, "_start")?;
            start_fn.call(&mut store, ())
        })();

        let fuel_consumed = limits
            .max_fuel
            .saturating_sub(store.get_fuel().unwrap_or(0));

        done.store(true, Ordering::Release);
        let _ = ticker.join();
        drop(store); // release /work handles before reading results

        let wall = start.elapsed();
        let abort_code = abort.load(Ordering::Acquire);

        let mut report = SandboxReport {
            state: RunState::Failed,
            result: None,
            fault: None,
            fuel_consumed,
            wall,
            code_digest,
            cancelled: abort_code == ABORT_CANCELLED,
        };

        match call_result {
            Err(e) if abort_code == ABORT_OUT_OF_GAS => {
                debug!(error = %e, "run aborted on gas");
                report.state = RunState::OutOfGas;
                return Ok(report);
            }
            Err(e) if abort_code == ABORT_DEADLINE => {
                debug!(error = %e, "run aborted on wall deadline");
                report.state = RunState::TimedOut;
                return Ok(report);
            }
            Err(e) if abort_code == ABORT_CANCELLED => {
                debug!(error = %e, "run cancelled");
                report.fault = Some(ScriptFault {
                    name: "Cancelled".to_string(),
                    message: "execution cancelled".to_string(),
                });
                return Ok(report);
            }
            Err(e) if e.downcast_ref::<Trap>() == Some(&Trap::OutOfFuel) => {
                report.state = RunState::OutOfGas;
                return Ok(report);
            }
            Err(e) => {
                // A wasi exit is the loader's normal way out on early
                // failures; any exit code still leaves out.json behind.
                match e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                    Some(_) => {}
                    None => {
                        report.fault = Some(ScriptFault {
                            name: "ScriptError".to_string(),
                            message: format!("interpreter trap: {e}"),
                        });
                        return Ok(report);
                    }
                }
            }
            Ok(()) => {}
        }

        // 6) Read the result envelope the loader wrote.
        let out_path = work.join(OUT_NAME);
        let out_bytes = match fs::read(&out_path) {
            Ok(b) => b,
            Err(_) => {
                report.fault = Some(ScriptFault {
                    name: "SystemError".to_string(),
                    message: "script produced no result".to_string(),
                });
                return Ok(report);
            }
        };
        let parsed: serde_json::Value = match serde_json::from_slice(&out_bytes) {
            Ok(v) => v,
            Err(e) => {
                report.fault = Some(ScriptFault {
                    name: "SystemError".to_string(),
                    message: format!("result envelope unreadable: {e}"),
                });
                return Ok(report);
            }
        };

        if parsed.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            report.state = RunState::Completed;
            report.result = Some(parsed.get("result").cloned().unwrap_or(serde_json::Value::Null));
        } else {
            report.fault = Some(ScriptFault {
                name: parsed
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("ScriptError")
                    .to_string(),
                message: parsed
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("script failed")
                    .to_string(),
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_digest_is_sha256() {
        let digest = Sandbox::code_digest("function main() {}");
        let mut hasher = Sha256::new();
        hasher.update(b"function main() {}");
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(digest, expected);
    }

    #[test]
    fn allowlist_config_defaults_open() {
        let config = SandboxConfig::default();
        assert!(config.code_allowlist.is_none());
        assert_eq!(config.max_memory_bytes, 128 * 1024 * 1024);
    }
}
