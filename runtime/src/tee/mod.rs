//! TEE platform boundary: attestation, sealing, hardware randomness.
//!
//! In hardware mode the platform is reached through the attestation
//! pseudo-device directory (`quote`, `user_report_data`, `keys/...`), the
//! layout Gramine exposes inside SGX enclaves. In simulation mode the
//! measurements are fixed mock values and sealing uses an ephemeral
//! process-wide key: simulation-sealed blobs are confidential against an
//! offline observer but are NOT attested and do NOT survive a process
//! restart.

pub mod attestation;
pub mod sealing;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::{TeeConfig, TeeModeConfig};
use crate::error::SealError;
pub use attestation::{
    AttestationBundle, EnclaveAttributes, EnclaveIdentity, Measurement, QuoteStatus, TeeMode,
};
pub use sealing::SealPolicy;

const QUOTE_FILE: &str = "quote";
const REPORT_DATA_FILE: &str = "user_report_data";
const SEAL_KEY_FILE: &str = "keys/_sgx_mrenclave";
const SIGNER_KEY_FILE: &str = "keys/_sgx_mrsigner";

/// Ephemeral process-wide sealing key for simulation mode.
fn simulation_root_key() -> &'static [u8; 32] {
    static KEY: OnceLock<[u8; 32]> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    })
}

/// Process-global handle to the platform. Stateless with respect to the
/// host; the hardware (or the simulation key) is the state.
pub struct TeeContext {
    mode: TeeMode,
    identity: EnclaveIdentity,
    root_key: [u8; 32],
    device_dir: PathBuf,
}

impl TeeContext {
    /// Probe the platform described by `config`.
    pub fn init(config: &TeeConfig) -> Result<Self, SealError> {
        match config.mode {
            TeeModeConfig::Hardware => Self::init_hardware(&config.attestation_device_dir),
            TeeModeConfig::Simulation => Ok(Self::simulated()),
        }
    }

    fn init_hardware(device_dir: &Path) -> Result<Self, SealError> {
        // An initial quote establishes our own identity fields.
        let quote = Self::request_quote_at(device_dir, &[0u8; 64])?;
        let identity = EnclaveIdentity::from_quote(&quote)?;

        // Hardware sealing keys are policy-specific; fold both into the
        // root so per-policy subkeys can be derived from one value.
        let enclave_key = fs::read(device_dir.join(SEAL_KEY_FILE))
            .map_err(|e| SealError::Platform(format!("sealing key unavailable: {e}")))?;
        let signer_key = fs::read(device_dir.join(SIGNER_KEY_FILE))
            .map_err(|e| SealError::Platform(format!("signer key unavailable: {e}")))?;
        let mut hasher = Sha256::new();
        hasher.update(&enclave_key);
        hasher.update(&signer_key);
        let root_key: [u8; 32] = hasher.finalize().into();

        info!(
            enclave = %identity.measurement_enclave,
            signer = %identity.measurement_signer,
            "hardware platform attached"
        );
        Ok(Self {
            mode: TeeMode::Hardware,
            identity,
            root_key,
            device_dir: device_dir.to_path_buf(),
        })
    }

    /// Simulation platform with the fixed mock identity.
    pub fn simulated() -> Self {
        Self::simulated_with(EnclaveIdentity::simulated())
    }

    /// Simulation platform with an explicit identity. Lets embedders and
    /// tests model identity changes (enclave upgrades, other signers).
    pub fn simulated_with(identity: EnclaveIdentity) -> Self {
        warn!("simulation platform: sealed data will not survive a process restart");
        Self {
            mode: TeeMode::Simulation,
            identity,
            root_key: *simulation_root_key(),
            device_dir: PathBuf::new(),
        }
    }

    pub fn mode(&self) -> TeeMode {
        self.mode
    }

    /// The enclave code measurement. Fixed per instance.
    pub fn measurement_enclave(&self) -> Measurement {
        self.identity.measurement_enclave
    }

    /// The enclave signer measurement. Fixed per instance.
    pub fn measurement_signer(&self) -> Measurement {
        self.identity.measurement_signer
    }

    pub fn identity(&self) -> &EnclaveIdentity {
        &self.identity
    }

    /// Fill `n` bytes from the platform RNG.
    pub fn random(&self, n: usize) -> Result<Vec<u8>, SealError> {
        let mut out = vec![0u8; n];
        rand::rngs::OsRng
            .try_fill_bytes(&mut out)
            .map_err(|e| SealError::Platform(format!("rng: {e}")))?;
        Ok(out)
    }

    /// Seal `plaintext` so only an enclave satisfying `policy` can read it.
    pub fn seal(&self, plaintext: &[u8], policy: SealPolicy) -> Result<Vec<u8>, SealError> {
        sealing::seal(&self.root_key, &self.identity, plaintext, policy)
    }

    /// Unseal a blob produced by [`TeeContext::seal`].
    pub fn unseal(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        sealing::unseal(&self.root_key, &self.identity, blob)
    }

    /// Produce the attestation bundle, optionally with a platform quote.
    pub fn attestation(&self, include_quote: bool) -> Result<AttestationBundle, SealError> {
        let (quote, quote_status) = match (self.mode, include_quote) {
            (TeeMode::Hardware, true) => {
                let quote = Self::request_quote_at(&self.device_dir, &[0u8; 64])?;
                (Some(quote), Some(QuoteStatus::Ok))
            }
            _ => (None, None),
        };
        Ok(AttestationBundle {
            mode: self.mode,
            measurement_enclave: self.identity.measurement_enclave,
            measurement_signer: self.identity.measurement_signer,
            product_id: self.identity.product_id,
            svn: self.identity.svn,
            attributes: self.identity.attributes,
            quote,
            quote_status,
        })
    }

    fn request_quote_at(device_dir: &Path, report_data: &[u8; 64]) -> Result<Vec<u8>, SealError> {
        fs::write(device_dir.join(REPORT_DATA_FILE), report_data)
            .map_err(|e| SealError::Platform(format!("report data write failed: {e}")))?;
        fs::read(device_dir.join(QUOTE_FILE))
            .map_err(|e| SealError::Platform(format!("quote read failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_fills_requested_length() {
        let tee = TeeContext::simulated();
        assert_eq!(tee.random(0).unwrap().len(), 0);
        assert_eq!(tee.random(33).unwrap().len(), 33);
        // Two draws are distinct with overwhelming probability.
        assert_ne!(tee.random(16).unwrap(), tee.random(16).unwrap());
    }

    #[test]
    fn simulation_attestation_carries_no_quote() {
        let tee = TeeContext::simulated();
        let bundle = tee.attestation(true).unwrap();
        assert_eq!(bundle.mode, TeeMode::Simulation);
        assert!(bundle.quote.is_none());
        assert!(bundle.quote_status.is_none());
        assert_eq!(bundle.measurement_enclave, tee.measurement_enclave());
    }

    #[test]
    fn measurements_are_stable() {
        let tee = TeeContext::simulated();
        assert_eq!(tee.measurement_enclave(), tee.measurement_enclave());
        assert_eq!(tee.measurement_signer(), tee.measurement_signer());
    }

    #[test]
    fn seal_roundtrip_within_one_process() {
        let tee = TeeContext::simulated();
        let blob = tee.seal(b"root of trust", SealPolicy::EnclaveIdentity).unwrap();
        assert_eq!(tee.unseal(&blob).unwrap(), b"root of trust");

        // A second context in the same process shares the process key.
        let tee2 = TeeContext::simulated();
        assert_eq!(tee2.unseal(&blob).unwrap(), b"root of trust");
    }

    #[test]
    fn identity_change_violates_enclave_policy() {
        let tee = TeeContext::simulated();
        let blob = tee.seal(b"pinned", SealPolicy::EnclaveIdentity).unwrap();

        let upgraded = TeeContext::simulated_with(EnclaveIdentity {
            measurement_enclave: Measurement::new([0x5A; 32]),
            ..EnclaveIdentity::simulated()
        });
        assert!(matches!(
            upgraded.unseal(&blob),
            Err(SealError::PolicyViolation(_))
        ));
    }
}
