//! Field codecs applied at the storage boundary
//!
//! Sender, recipient and payload may be encrypted at rest. Hashes are always
//! computed over the decoded values, so the choice of codec never changes the
//! chain itself. Participant lookups go through [`FieldCodec::blind`], which
//! maps an identity to a fixed-size index key without storing the identity.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{LedgerError, Result};

/// Index key derived from an identity
pub type BlindTag = [u8; 32];

/// Minimum master key length in bytes
pub const MIN_MASTER_KEY_LEN: usize = 32;

/// AES-GCM nonce size (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM tag size (128 bits)
const TAG_SIZE: usize = 16;

/// Domain separation for key derivation
mod domain {
    pub const FIELD_KEY: &[u8] = b"SecureChat_v1_LedgerFieldKey";
    pub const BLIND_KEY: &[u8] = b"SecureChat_v1_LedgerBlindKey";
}

/// Encodes ledger fields for storage
pub trait FieldCodec: Send + Sync {
    /// Short codec name for logs
    fn name(&self) -> &'static str;

    /// Encode a logical value for storage
    fn encode(&self, value: &str) -> Result<String>;

    /// Decode a stored value back to its logical form
    fn decode(&self, stored: &str) -> Result<String>;

    /// Deterministic index key for an identity
    fn blind(&self, identity: &str) -> BlindTag;
}

/// Stores fields as-is
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainCodec;

impl FieldCodec for PlainCodec {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn encode(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }

    fn decode(&self, stored: &str) -> Result<String> {
        Ok(stored.to_string())
    }

    fn blind(&self, identity: &str) -> BlindTag {
        Sha256::digest(identity.as_bytes()).into()
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct BlindKey([u8; 32]);

/// AES-256-GCM field encryption with keys derived from a master key
pub struct AesGcmCodec {
    cipher: Aes256Gcm,
    blind_key: BlindKey,
}

impl AesGcmCodec {
    /// Derive field and blinding keys from `master_key` via HKDF-SHA256
    pub fn from_master_key(master_key: &[u8]) -> Result<Self> {
        if master_key.len() < MIN_MASTER_KEY_LEN {
            return Err(LedgerError::Config(format!(
                "master key must be at least {} bytes, got {}",
                MIN_MASTER_KEY_LEN,
                master_key.len()
            )));
        }

        let hk = Hkdf::<Sha256>::new(None, master_key);

        let mut field_key = [0u8; 32];
        hk.expand(domain::FIELD_KEY, &mut field_key)
            .map_err(|e| LedgerError::Codec(e.to_string()))?;
        let mut blind_key = [0u8; 32];
        hk.expand(domain::BLIND_KEY, &mut blind_key)
            .map_err(|e| LedgerError::Codec(e.to_string()))?;

        let cipher = Aes256Gcm::new_from_slice(&field_key)
            .map_err(|e| LedgerError::Codec(e.to_string()));
        field_key.zeroize();

        Ok(Self {
            cipher: cipher?,
            blind_key: BlindKey(blind_key),
        })
    }
}

impl std::fmt::Debug for AesGcmCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCodec").finish_non_exhaustive()
    }
}

impl FieldCodec for AesGcmCodec {
    fn name(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn encode(&self, value: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), value.as_bytes())
            .map_err(|_| LedgerError::Codec("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    fn decode(&self, stored: &str) -> Result<String> {
        let raw = STANDARD
            .decode(stored)
            .map_err(|e| LedgerError::Codec(format!("invalid base64: {}", e)))?;

        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(LedgerError::Codec(format!(
                "ciphertext too short: {} bytes",
                raw.len()
            )));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| LedgerError::Codec("decryption failed".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| LedgerError::Codec(e.to_string()))
    }

    fn blind(&self, identity: &str) -> BlindTag {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.blind_key.0)
            .expect("HMAC can take key of any size");
        mac.update(identity.as_bytes());
        mac.finalize().into_bytes().into()
    }
}
