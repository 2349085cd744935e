//! Ed25519 envelope signing for broadcast events.
//!
//! One private key is loaded at startup. Signing is deterministic over the
//! payload string: identical inputs yield identical signatures for the same
//! key, which lets downstream peers deduplicate envelopes byte-for-byte.

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use thiserror::Error;

use crate::model::{Event, SignedEnvelope};

/// Development-only seed, mirroring the JWK the deployment scripts replace.
/// Production deployments must inject `CANARIA_SIGNING_KEY`.
const DEV_SEED_B64: &str = "1fL1nL0Zg7p3n2cAnar1aDevS1gn1ngKeySeed00A0E=";

pub const SIGNING_KEY_ENV: &str = "CANARIA_SIGNING_KEY";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signing key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("signing key must decode to exactly 32 bytes, got {0}")]
    BadLength(usize),
}

pub struct Signer {
    key: SigningKey,
}

impl Signer {
    /// Loads the key from `CANARIA_SIGNING_KEY` (base64 32-byte seed) when
    /// set, otherwise falls back to the embedded development seed.
    pub fn from_env() -> Result<Self, SignerError> {
        match std::env::var(SIGNING_KEY_ENV) {
            Ok(encoded) => Self::from_base64(&encoded),
            Err(_) => {
                log::warn!("{SIGNING_KEY_ENV} not set; using the development signing key");
                Self::from_base64(DEV_SEED_B64)
            }
        }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, SignerError> {
        let bytes = general_purpose::STANDARD.decode(encoded.trim())?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::BadLength(bytes.len()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { key: SigningKey::from_bytes(&seed) }
    }

    /// Signs the canonical serialization of an event.
    pub fn sign_event(&self, event: &Event) -> SignedEnvelope {
        let payload = serde_json::to_string(event)
            .unwrap_or_else(|_| String::from("{}"));
        self.sign_payload(payload)
    }

    /// Signs an arbitrary payload string. Deterministic per key + payload;
    /// only `timestamp` varies between calls.
    pub fn sign_payload(&self, payload: String) -> SignedEnvelope {
        let signature = self.key.sign(payload.as_bytes());
        SignedEnvelope {
            payload,
            signature: general_purpose::STANDARD.encode(signature.to_bytes()),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

/// Verifies a base64 signature against a payload under the given public key.
pub fn verify(key: &VerifyingKey, payload: &str, signature_b64: &str) -> bool {
    let Ok(bytes) = general_purpose::STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&bytes) else {
        return false;
    };
    key.verify(payload.as_bytes(), &signature).is_ok()
}
