//! Field cipher collaborator: per-value encryption and blind equality indexing.
//!
//! [`FieldCipher`] is the seam to a key-management service. [`AesGcmCipher`]
//! is the local implementation: AES-256-GCM with a random 96-bit nonce
//! prepended to each ciphertext, and HMAC-SHA256 blind indexes. Both keys are
//! derived from one 32-byte master key.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::warn;

use piivault_core::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub trait FieldCipher: Send + Sync {
    /// Encrypt one value. `aad` binds the ciphertext to where it is stored.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a value produced by [`FieldCipher::encrypt`] with the same `aad`.
    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Deterministic keyed digest used for equality lookups and uniqueness.
    fn blind_index(&self, collection: &str, property: &str, canonical: &str) -> Result<String>;
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
    index_key: [u8; KEY_LEN],
}

impl AesGcmCipher {
    pub fn new(master_key: &[u8]) -> Result<Self> {
        if master_key.len() != KEY_LEN {
            return Err(Error::Crypto(format!(
                "master key must be {} bytes, got {}",
                KEY_LEN,
                master_key.len()
            )));
        }
        let enc_key = derive_key(master_key, b"piivault/field-encryption/v1")?;
        let index_key = derive_key(master_key, b"piivault/blind-index/v1")?;
        let cipher = <Aes256Gcm as KeyInit>::new_from_slice(&enc_key)
            .map_err(|_| Error::Crypto("invalid encryption key".into()))?;
        Ok(Self { cipher, index_key })
    }

    /// Random per-process key. Data written with it is unreadable after restart.
    pub fn ephemeral() -> Result<Self> {
        warn!("No master key configured; using an ephemeral key (data will not survive restart)");
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::new(&key)
    }
}

impl FieldCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(Error::Crypto("ciphertext too short".into()));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad })
            .map_err(|_| Error::Crypto("decryption failed".into()))
    }

    fn blind_index(&self, collection: &str, property: &str, canonical: &str) -> Result<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.index_key)
            .map_err(|_| Error::Crypto("invalid index key".into()))?;
        mac.update(collection.as_bytes());
        mac.update(&[0]);
        mac.update(property.as_bytes());
        mac.update(&[0]);
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn derive_key(master_key: &[u8], label: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(master_key)
        .map_err(|_| Error::Crypto("invalid master key".into()))?;
    mac.update(label);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}
