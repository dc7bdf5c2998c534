//! AES-256-GCM sealing for token columns.
//!
//! Every token is sealed on its own with a fresh random nonce. The master key
//! is 32 bytes, supplied base64-encoded through the environment.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// A sealed token as stored in the database: base64 ciphertext plus base64 nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: String,
    pub nonce: String,
}

/// Seals and opens token strings with one master key.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Build a cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key_bytes = decode_key(key_base64)?;
        Self::from_key_bytes(&key_bytes)
    }

    /// Build a cipher from raw key bytes.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(anyhow!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key.len()
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` under a newly generated nonce.
    pub fn seal(&self, plaintext: &str) -> Result<Sealed> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok(Sealed {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
        })
    }

    /// Decrypt a sealed value. Fails on a wrong key or any tampering.
    pub fn open(&self, sealed: &Sealed) -> Result<String> {
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .context("Failed to decode nonce")?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }
}

/// Decode and length-check a base64 master key.
pub fn decode_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}
