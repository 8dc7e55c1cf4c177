//! Attestation types: measurements, attributes, quotes.
//!
//! Quote parsing follows the SGX quote layout: a 48-byte header followed
//! by the report body. Measurement offsets below are absolute offsets
//! into the raw quote bytes.

use serde::{Deserialize, Serialize};

use crate::error::SealError;

const MEASUREMENT_SIZE: usize = 32;
const ATTRIBUTES_OFFSET: usize = 96; // 48 (header) + 48 (body offset of attributes)
const MRENCLAVE_OFFSET: usize = 112; // 48 + 64
const MRSIGNER_OFFSET: usize = 176; // 48 + 128
const ISV_PRODID_OFFSET: usize = 304; // 48 + 256
const ISV_SVN_OFFSET: usize = 306; // 48 + 258
const MIN_QUOTE_LEN: usize = 432;

// Attribute flag bits (low u64 of the 16-byte attributes field).
const ATTR_DEBUG: u64 = 0x02;
const ATTR_MODE64BIT: u64 = 0x04;
const ATTR_PROVISIONKEY: u64 = 0x10;
const ATTR_EINITTOKEN_KEY: u64 = 0x20;

/// Whether the platform is real hardware or a software simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeeMode {
    Hardware,
    Simulation,
}

/// A 32-byte enclave or signer measurement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Measurement(#[serde(with = "hex_bytes")] pub [u8; 32]);

impl Measurement {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Measurement({})", hex::encode(self.0))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Platform attribute flags carried in the attestation bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveAttributes {
    pub debug: bool,
    pub mode_64bit: bool,
    pub provisioning_key: bool,
    pub einittoken_key: bool,
}

impl EnclaveAttributes {
    fn from_flags(flags: u64) -> Self {
        Self {
            debug: flags & ATTR_DEBUG != 0,
            mode_64bit: flags & ATTR_MODE64BIT != 0,
            provisioning_key: flags & ATTR_PROVISIONKEY != 0,
            einittoken_key: flags & ATTR_EINITTOKEN_KEY != 0,
        }
    }
}

/// Verification status of a platform quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuoteStatus {
    Ok,
    SignatureInvalid,
    GroupRevoked,
    SignatureRevoked,
    KeyRevoked,
    SigrlVersionMismatch,
    GroupOutOfDate,
    ConfigurationNeeded,
}

/// The stable identity of the running enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclaveIdentity {
    pub measurement_enclave: Measurement,
    pub measurement_signer: Measurement,
    pub product_id: u16,
    pub svn: u16,
    pub attributes: EnclaveAttributes,
}

impl EnclaveIdentity {
    /// Fixed identity used in simulation mode.
    pub fn simulated() -> Self {
        Self {
            measurement_enclave: Measurement::new(*b"~~~~ SEALVM MOCK  ENCLAVE  ~~~~~"),
            measurement_signer: Measurement::new(*b"==== SEALVM MOCK  SIGNER   ====="),
            product_id: 0,
            svn: 0,
            attributes: EnclaveAttributes {
                debug: true,
                mode_64bit: true,
                provisioning_key: false,
                einittoken_key: false,
            },
        }
    }

    /// Extract the identity fields from a raw platform quote.
    pub fn from_quote(quote: &[u8]) -> Result<Self, SealError> {
        if quote.len() < MIN_QUOTE_LEN {
            return Err(SealError::Platform(format!(
                "quote too short: {} bytes",
                quote.len()
            )));
        }
        let measurement = |offset: usize| -> Measurement {
            let mut out = [0u8; MEASUREMENT_SIZE];
            out.copy_from_slice(&quote[offset..offset + MEASUREMENT_SIZE]);
            Measurement::new(out)
        };
        let flags = u64::from_le_bytes(
            quote[ATTRIBUTES_OFFSET..ATTRIBUTES_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        Ok(Self {
            measurement_enclave: measurement(MRENCLAVE_OFFSET),
            measurement_signer: measurement(MRSIGNER_OFFSET),
            product_id: u16::from_le_bytes(
                quote[ISV_PRODID_OFFSET..ISV_PRODID_OFFSET + 2]
                    .try_into()
                    .unwrap(),
            ),
            svn: u16::from_le_bytes(
                quote[ISV_SVN_OFFSET..ISV_SVN_OFFSET + 2].try_into().unwrap(),
            ),
            attributes: EnclaveAttributes::from_flags(flags),
        })
    }
}

/// Everything a relying party needs to appraise this enclave instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationBundle {
    pub mode: TeeMode,
    pub measurement_enclave: Measurement,
    pub measurement_signer: Measurement,
    pub product_id: u16,
    pub svn: u16,
    pub attributes: EnclaveAttributes,
    /// Raw platform quote, present only in hardware mode on request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote_status: Option<QuoteStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_quote() -> Vec<u8> {
        let mut quote = vec![0u8; 512];
        quote[ATTRIBUTES_OFFSET..ATTRIBUTES_OFFSET + 8]
            .copy_from_slice(&(ATTR_MODE64BIT | ATTR_DEBUG).to_le_bytes());
        quote[MRENCLAVE_OFFSET..MRENCLAVE_OFFSET + 32].copy_from_slice(&[0xAA; 32]);
        quote[MRSIGNER_OFFSET..MRSIGNER_OFFSET + 32].copy_from_slice(&[0xBB; 32]);
        quote[ISV_PRODID_OFFSET..ISV_PRODID_OFFSET + 2].copy_from_slice(&7u16.to_le_bytes());
        quote[ISV_SVN_OFFSET..ISV_SVN_OFFSET + 2].copy_from_slice(&3u16.to_le_bytes());
        quote
    }

    #[test]
    fn identity_parses_from_quote() {
        let identity = EnclaveIdentity::from_quote(&fake_quote()).unwrap();
        assert_eq!(identity.measurement_enclave, Measurement::new([0xAA; 32]));
        assert_eq!(identity.measurement_signer, Measurement::new([0xBB; 32]));
        assert_eq!(identity.product_id, 7);
        assert_eq!(identity.svn, 3);
        assert!(identity.attributes.debug);
        assert!(identity.attributes.mode_64bit);
        assert!(!identity.attributes.provisioning_key);
    }

    #[test]
    fn short_quote_is_rejected() {
        assert!(EnclaveIdentity::from_quote(&[0u8; 100]).is_err());
    }

    #[test]
    fn measurement_serializes_as_hex() {
        let m = Measurement::new([0xAB; 32]);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: Measurement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
