// src/auth/keys.rs

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ApiError, Result};

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// Mint an opaque caller id: CL- followed by 12 uppercase hex digits
pub fn mint_caller_id() -> String {
    let bits = rand::random::<u64>() & 0xFFFF_FFFF_FFFF;
    format!("CL-{:012X}", bits)
}

/// Generate a fresh API key: 32 random bytes, base64url without padding
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// bcrypt hash for verification storage
pub fn hash_api_key(key: &str) -> Result<String> {
    bcrypt::hash(key, bcrypt::DEFAULT_COST)
        .map_err(|e| ApiError::Internal(format!("key hashing: {}", e)))
}

/// Constant-time comparison against the stored bcrypt hash
pub fn verify_api_key(key: &str, hash: &str) -> bool {
    bcrypt::verify(key, hash).unwrap_or(false)
}

/// SHA-256 lookup digest. bcrypt cannot drive an index, so credentials
/// are resolved by this digest first and verified against the bcrypt
/// hash second.
pub fn lookup_digest(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// AES-256-GCM cipher for the recoverable key copy.
///
/// Ciphertexts are base64(nonce || ciphertext) with a fresh random
/// nonce per encryption.
#[derive(Clone)]
pub struct ApiKeyCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for ApiKeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyCipher").finish_non_exhaustive()
    }
}

impl ApiKeyCipher {
    /// Build from the configured 64-hex-character key
    pub fn from_hex_key(hex_key: &str) -> Result<Self> {
        let bytes = decode_hex(hex_key)?;
        if bytes.len() != 32 {
            return Err(ApiError::Config(
                "encryption key must decode to 32 bytes".to_string(),
            ));
        }

        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| ApiError::Internal(format!("encryption: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = STANDARD
            .decode(encoded)
            .map_err(|e| ApiError::Internal(format!("decryption: {}", e)))?;
        if combined.len() <= NONCE_LEN {
            return Err(ApiError::Internal("ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| ApiError::Internal(format!("decryption: {}", e)))?;

        String::from_utf8(plaintext).map_err(|e| ApiError::Internal(format!("decryption: {}", e)))
    }
}

fn decode_hex(input: &str) -> Result<Vec<u8>> {
    if input.len() % 2 != 0 {
        return Err(ApiError::Config("hex string has odd length".to_string()));
    }

    (0..input.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&input[i..i + 2], 16)
                .map_err(|_| ApiError::Config("invalid hex string".to_string()))
        })
        .collect()
}
