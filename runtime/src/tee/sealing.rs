//! Sealing: binding ciphertext to enclave identity.
//!
//! Blob format: `magic(4)="SEAL" ‖ version(1) ‖ policy(1) ‖ nonce(12) ‖
//! ciphertext ‖ tag(16)`, AES-256-GCM with the format prefix as AAD. The
//! sealed plaintext is prefixed with an 8-byte digest of the identity
//! fields the policy binds, so unsealing under a different identity is
//! reported as a policy violation rather than generic corruption.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::SealError;
use crate::tee::attestation::EnclaveIdentity;

const MAGIC: &[u8; 4] = b"SEAL";
const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const IDENTITY_DIGEST_LEN: usize = 8;

/// What the sealing key (and the embedded identity digest) binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealPolicy {
    /// Only an enclave with the same code measurement may unseal.
    EnclaveIdentity,
    /// Any enclave from the same signer may unseal.
    SignerIdentity,
    /// Both the code measurement and the signer must match.
    Hybrid,
}

impl SealPolicy {
    fn as_byte(self) -> u8 {
        match self {
            SealPolicy::EnclaveIdentity => 1,
            SealPolicy::SignerIdentity => 2,
            SealPolicy::Hybrid => 3,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(SealPolicy::EnclaveIdentity),
            2 => Some(SealPolicy::SignerIdentity),
            3 => Some(SealPolicy::Hybrid),
            _ => None,
        }
    }

    fn domain_tag(self) -> &'static str {
        match self {
            SealPolicy::EnclaveIdentity => "enclave",
            SealPolicy::SignerIdentity => "signer",
            SealPolicy::Hybrid => "hybrid",
        }
    }
}

/// Digest of the identity fields a policy binds, embedded in the sealed
/// plaintext.
fn identity_digest(identity: &EnclaveIdentity, policy: SealPolicy) -> [u8; IDENTITY_DIGEST_LEN] {
    let mut hasher = Sha256::new();
    match policy {
        SealPolicy::EnclaveIdentity => {
            hasher.update(identity.measurement_enclave.as_bytes());
        }
        SealPolicy::SignerIdentity => {
            hasher.update(identity.measurement_signer.as_bytes());
        }
        SealPolicy::Hybrid => {
            hasher.update(identity.measurement_enclave.as_bytes());
            hasher.update(identity.measurement_signer.as_bytes());
        }
    }
    let full: [u8; 32] = hasher.finalize().into();
    full[..IDENTITY_DIGEST_LEN].try_into().unwrap()
}

fn sealing_cipher(root_key: &[u8; 32], policy: SealPolicy) -> Aes256Gcm {
    let mut hasher = Sha256::new();
    hasher.update(b"sealvm-seal/");
    hasher.update(policy.domain_tag().as_bytes());
    hasher.update(root_key);
    let key: [u8; 32] = hasher.finalize().into();
    Aes256Gcm::new_from_slice(&key).expect("key length is 32")
}

pub(crate) fn seal(
    root_key: &[u8; 32],
    identity: &EnclaveIdentity,
    plaintext: &[u8],
    policy: SealPolicy,
) -> Result<Vec<u8>, SealError> {
    let cipher = sealing_cipher(root_key, policy);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| SealError::Platform(format!("rng: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut inner = Vec::with_capacity(IDENTITY_DIGEST_LEN + plaintext.len());
    inner.extend_from_slice(&identity_digest(identity, policy));
    inner.extend_from_slice(plaintext);

    let aad = [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], VERSION, policy.as_byte()];
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: &inner,
                aad: &aad,
            },
        )
        .map_err(|_| SealError::Platform("seal encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(6 + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&aad);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub(crate) fn unseal(
    root_key: &[u8; 32],
    identity: &EnclaveIdentity,
    blob: &[u8],
) -> Result<Vec<u8>, SealError> {
    if blob.len() < 6 + NONCE_LEN + IDENTITY_DIGEST_LEN + TAG_LEN {
        return Err(SealError::Integrity("sealed blob too short".to_string()));
    }
    if &blob[0..4] != MAGIC {
        return Err(SealError::Integrity("bad sealed blob magic".to_string()));
    }
    if blob[4] != VERSION {
        return Err(SealError::Integrity(format!(
            "unsupported sealed blob version {}",
            blob[4]
        )));
    }
    let policy = SealPolicy::from_byte(blob[5]).ok_or_else(|| {
        SealError::PolicyViolation(format!("unknown sealing policy {:#04x}", blob[5]))
    })?;

    let cipher = sealing_cipher(root_key, policy);
    let nonce = Nonce::from_slice(&blob[6..6 + NONCE_LEN]);
    let aad = &blob[0..6];

    let inner = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &blob[6 + NONCE_LEN..],
                aad,
            },
        )
        .map_err(|_| SealError::Integrity("sealed blob authentication failed".to_string()))?;

    let (recorded, plaintext) = inner.split_at(IDENTITY_DIGEST_LEN);
    if recorded != identity_digest(identity, policy) {
        return Err(SealError::PolicyViolation(
            "current identity does not satisfy the recorded policy".to_string(),
        ));
    }
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::attestation::Measurement;

    fn identity() -> EnclaveIdentity {
        EnclaveIdentity::simulated()
    }

    fn other_enclave() -> EnclaveIdentity {
        EnclaveIdentity {
            measurement_enclave: Measurement::new([0x11; 32]),
            ..EnclaveIdentity::simulated()
        }
    }

    const KEY: [u8; 32] = [9u8; 32];

    #[test]
    fn roundtrip_under_every_policy() {
        for policy in [
            SealPolicy::EnclaveIdentity,
            SealPolicy::SignerIdentity,
            SealPolicy::Hybrid,
        ] {
            let blob = seal(&KEY, &identity(), b"sealed payload", policy).unwrap();
            assert_eq!(unseal(&KEY, &identity(), &blob).unwrap(), b"sealed payload");
        }
    }

    #[test]
    fn blob_is_self_describing() {
        let blob = seal(&KEY, &identity(), b"x", SealPolicy::Hybrid).unwrap();
        assert_eq!(&blob[0..4], b"SEAL");
        assert_eq!(blob[4], 1);
        assert_eq!(blob[5], 3);
        // magic + version + policy + nonce + digest prefix + payload + tag
        assert_eq!(blob.len(), 6 + 12 + 8 + 1 + 16);
    }

    #[test]
    fn tampered_blob_is_an_integrity_error() {
        let mut blob = seal(&KEY, &identity(), b"payload", SealPolicy::EnclaveIdentity).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            unseal(&KEY, &identity(), &blob),
            Err(SealError::Integrity(_))
        ));
    }

    #[test]
    fn changed_enclave_identity_is_a_policy_violation() {
        let blob = seal(&KEY, &identity(), b"payload", SealPolicy::EnclaveIdentity).unwrap();
        assert!(matches!(
            unseal(&KEY, &other_enclave(), &blob),
            Err(SealError::PolicyViolation(_))
        ));
    }

    #[test]
    fn signer_policy_survives_enclave_changes() {
        // A new code measurement under the same signer still unseals.
        let blob = seal(&KEY, &identity(), b"payload", SealPolicy::SignerIdentity).unwrap();
        assert_eq!(
            unseal(&KEY, &other_enclave(), &blob).unwrap(),
            b"payload"
        );

        // But a hybrid blob does not.
        let blob = seal(&KEY, &identity(), b"payload", SealPolicy::Hybrid).unwrap();
        assert!(matches!(
            unseal(&KEY, &other_enclave(), &blob),
            Err(SealError::PolicyViolation(_))
        ));
    }

    #[test]
    fn unknown_policy_byte_is_a_policy_violation() {
        let mut blob = seal(&KEY, &identity(), b"payload", SealPolicy::EnclaveIdentity).unwrap();
        blob[5] = 0x7f;
        assert!(matches!(
            unseal(&KEY, &identity(), &blob),
            Err(SealError::PolicyViolation(_))
        ));
    }

    #[test]
    fn nonces_are_fresh_per_seal() {
        let a = seal(&KEY, &identity(), b"same", SealPolicy::EnclaveIdentity).unwrap();
        let b = seal(&KEY, &identity(), b"same", SealPolicy::EnclaveIdentity).unwrap();
        assert_ne!(a, b);
    }
}
