//! Hardened QuickJS sandbox for confidential function execution.
//!
//! Runs untrusted JavaScript inside a QuickJS interpreter compiled to
//! WASM, itself executed under wasmtime with fuel metering, epoch
//! interruption and a memory limiter. A loader shim freezes the intrinsic
//! prototype chains, traps forbidden globals, charges gas for timers and
//! installs the host bindings (`getSecret`, `log`, `verifyData`,
//! `generateRandomBytes`) before any user code runs.
//!
//! The embedder supplies:
//! - the QuickJS WASM binary (built with the `sealvm` host bridge),
//! - a [`HostCalls`] implementation resolving bindings and charging gas,
//! - a [`Watchdog`] polled from the tick thread to stop a run early.
//!
//! Usage: construct a [`Sandbox`] once, then call [`Sandbox::run`] per
//! request; every run gets a fresh interpreter instance and scratch
//! directory, so no heap state survives between executions.

mod host;
mod loader;
mod sandbox;

pub use host::{HostCallError, HostCalls, NoWatchdog, WatchSignal, Watchdog};
pub use sandbox::{
    RunLimits, RunState, Sandbox, SandboxConfig, SandboxError, SandboxReport, ScriptFault,
};
