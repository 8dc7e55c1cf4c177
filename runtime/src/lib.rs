//! Confidential JavaScript execution runtime.
//!
//! A hardware-isolated process that receives untrusted user-supplied
//! JavaScript, executes it against per-user encrypted inputs and secrets,
//! meters resource consumption in gas units, persists state across runs
//! in sealed storage, and returns an attested result.
//!
//! [`Runtime::init`] establishes the single owner of all process-wide
//! state (platform handle, storage engine, secret store, metrics writer,
//! dispatcher); execution contexts receive capabilities from it and never
//! reach for globals. The outer API surface is expected to hold one
//! `Runtime` and call [`Runtime::execute`] per request.

pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod gas;
pub mod metrics;
pub mod secrets;
pub mod storage;
pub mod tee;

use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use tracing::{info, warn};
use zeroize::Zeroizing;

use sealvm_quickjs_sandbox::{Sandbox, SandboxConfig as QjsConfig};

use crate::config::Config;
use crate::device::{FileKvDevice, KvDevice};
use crate::dispatcher::Dispatcher;
use crate::error::{DeviceError, SealError};
use crate::executor::{derive_subkey, ExecutionCore};
use crate::metrics::MetricsWriter;
use crate::secrets::SecretManager;
use crate::storage::StorageEngine;
use crate::tee::{AttestationBundle, SealPolicy, TeeContext, TeeMode};

pub use crate::error::ErrorKind;
pub use crate::executor::{ExecutionProfile, ExecutionRequest, ExecutionResponse};

/// Reserved device key holding the sealed session encryption key.
const SEK_DEVICE_KEY: &str = "session/encryption-key";

/// The assembled enclave runtime.
pub struct Runtime {
    dispatcher: Dispatcher,
    tee: Arc<TeeContext>,
    storage: Arc<StorageEngine>,
    secrets: Arc<SecretManager>,
    core: Arc<ExecutionCore>,
}

impl Runtime {
    /// Initialize from configuration: open the backing device at the
    /// configured path and load the QuickJS binary from disk.
    pub fn init(config: Config) -> Result<Self> {
        config.validate()?;
        let device = Arc::new(
            FileKvDevice::open(&config.storage.storage_path, config.storage.create_if_missing)
                .context("open storage device")?,
        );
        let quickjs_wasm = std::fs::read(&config.sandbox.quickjs_wasm_path)
            .with_context(|| {
                format!(
                    "read QuickJS binary at {}",
                    config.sandbox.quickjs_wasm_path.display()
                )
            })?;
        Self::init_with_device(config, device, &quickjs_wasm)
    }

    /// Initialize over an explicit device and interpreter binary. Used by
    /// embedders that bring their own sealed device.
    pub fn init_with_device(
        config: Config,
        device: Arc<dyn KvDevice>,
        quickjs_wasm: &[u8],
    ) -> Result<Self> {
        config.validate()?;
        let tee = Arc::new(TeeContext::init(&config.tee).context("attach platform")?);

        let sek = Self::load_or_create_sek(&tee, device.as_ref())?;
        let storage_key = derive_subkey(&sek, "storage");
        let secret_key = derive_subkey(&sek, "secrets");
        let signing_seed = derive_subkey(&sek, "signing");

        let storage = Arc::new(
            StorageEngine::open(device, Some(&storage_key), config.storage.clone())
                .context("open storage engine")?,
        );
        let secrets = Arc::new(
            SecretManager::open(storage.clone(), &secret_key).context("open secret manager")?,
        );
        let metrics = Arc::new(MetricsWriter::new(storage.clone()));

        let sandbox = Sandbox::new(
            quickjs_wasm,
            QjsConfig {
                max_memory_bytes: config.sandbox.max_memory_mb as usize * 1024 * 1024,
                code_allowlist: config.sandbox.code_allowlist.clone(),
            },
        )
        .context("build sandbox")?;

        let signing_key = SigningKey::from_bytes(&signing_seed);
        let enclave_id = hex::encode(tee.measurement_enclave().as_bytes());

        let core = Arc::new(ExecutionCore {
            sandbox,
            secrets: secrets.clone(),
            storage: storage.clone(),
            metrics,
            tee: tee.clone(),
            gas_config: config.gas.clone(),
            max_fuel: config.sandbox.max_fuel,
            signing_key,
            enclave_id,
        });
        let dispatcher = Dispatcher::new(core.clone(), &config.dispatcher);

        info!(mode = ?tee.mode(), "runtime initialized");
        Ok(Self {
            dispatcher,
            tee,
            storage,
            secrets,
            core,
        })
    }

    /// Load the session encryption key, or mint and seal a fresh one.
    fn load_or_create_sek(
        tee: &TeeContext,
        device: &dyn KvDevice,
    ) -> Result<Zeroizing<[u8; 32]>> {
        match device.read(SEK_DEVICE_KEY) {
            Ok(blob) => match tee.unseal(&blob) {
                Ok(plaintext) => {
                    let bytes: [u8; 32] = plaintext
                        .as_slice()
                        .try_into()
                        .map_err(|_| anyhow::anyhow!("session key has wrong length"))?;
                    info!("session encryption key unsealed");
                    Ok(Zeroizing::new(bytes))
                }
                Err(SealError::PolicyViolation(msg)) => {
                    warn!(
                        reason = %msg,
                        "enclave identity changed; previous sealed state is unreadable"
                    );
                    Self::mint_sek(tee, device)
                }
                Err(e) if tee.mode() == TeeMode::Simulation => {
                    // Simulation sealing keys are per-process; a blob from
                    // an earlier process cannot be opened.
                    warn!(
                        error = %e,
                        "simulation restart: regenerating session key, stored secrets are unreadable"
                    );
                    Self::mint_sek(tee, device)
                }
                Err(e) => Err(e).context("unseal session encryption key"),
            },
            Err(DeviceError::NotFound) => {
                info!("no session encryption key yet; generating one");
                Self::mint_sek(tee, device)
            }
            Err(e) => Err(e).context("read session encryption key"),
        }
    }

    fn mint_sek(tee: &TeeContext, device: &dyn KvDevice) -> Result<Zeroizing<[u8; 32]>> {
        let raw = tee.random(32).context("generate session key")?;
        let bytes: [u8; 32] = raw.as_slice().try_into().expect("32 bytes requested");
        let sek = Zeroizing::new(bytes);
        let blob = tee
            .seal(sek.as_slice(), SealPolicy::EnclaveIdentity)
            .context("seal session key")?;
        device
            .write(SEK_DEVICE_KEY, &blob)
            .context("persist sealed session key")?;
        device.flush().context("flush sealed session key")?;
        Ok(sek)
    }

    /// Execute one request. Admission, metering and record-keeping are
    /// handled internally; the response always carries exactly one
    /// terminal error kind on failure.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResponse {
        self.dispatcher.execute(request).await
    }

    /// Cancel an in-flight execution. Idempotent.
    pub fn cancel(&self, execution_id: &str) -> bool {
        self.dispatcher.cancel(execution_id)
    }

    pub fn active_executions(&self) -> Vec<String> {
        self.dispatcher.active_executions()
    }

    /// Attestation evidence for this enclave instance.
    pub fn attestation(&self, include_quote: bool) -> Result<AttestationBundle, SealError> {
        self.tee.attestation(include_quote)
    }

    /// Seal arbitrary data to this enclave's identity.
    pub fn seal(&self, plaintext: &[u8], policy: SealPolicy) -> Result<Vec<u8>, SealError> {
        self.tee.seal(plaintext, policy)
    }

    /// Unseal a blob produced by [`Runtime::seal`].
    pub fn unseal(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        self.tee.unseal(blob)
    }

    /// Sign data with the enclave key; scripts can check the signature
    /// via `verifyData`.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.core.sign(data).to_bytes()
    }

    /// The secret store, for the management surface of the outer API.
    pub fn secrets(&self) -> &Arc<SecretManager> {
        &self.secrets
    }

    /// The storage engine, for the management surface of the outer API.
    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn tee(&self) -> &Arc<TeeContext> {
        &self.tee
    }
}
