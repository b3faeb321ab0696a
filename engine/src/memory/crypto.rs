//! Symmetric encryption at the file boundary.
//!
//! On-disk format with encryption enabled:
//! `ENCRYPTED:<base64(nonce || aes-256-gcm ciphertext)>`. Plain JSON files
//! (no sentinel) load unchanged, so existing stores keep working after the
//! key is configured.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Sentinel prefix marking an encrypted payload.
pub const ENCRYPTED_PREFIX: &str = "ENCRYPTED:";

const NONCE_LEN: usize = 12;

/// Errors from the encryption boundary.
#[derive(Debug, thiserror::Error)]
pub enum MemoryCryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("invalid encrypted payload: {0}")]
    InvalidPayload(String),

    #[error("decryption failed (wrong key or corrupted file)")]
    DecryptFailed,

    #[error("encryption failed")]
    EncryptFailed,
}

/// A 256-bit symmetric key, configured as base64.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Parse a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, MemoryCryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| MemoryCryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MemoryCryptoError::InvalidKey("key must be 32 bytes".to_string()))?;
        Ok(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "EncryptionKey(..)")
    }
}

/// Encrypt a JSON payload into the sentinel format.
pub fn encrypt_payload(plain: &str, key: &EncryptionKey) -> Result<String, MemoryCryptoError> {
    let cipher = key.cipher();
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain.as_bytes())
        .map_err(|_| MemoryCryptoError::EncryptFailed)?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);

    Ok(format!("{ENCRYPTED_PREFIX}{}", BASE64.encode(combined)))
}

/// Decrypt a payload if it carries the sentinel; pass plain data through.
pub fn decrypt_payload(
    data: &str,
    key: Option<&EncryptionKey>,
) -> Result<String, MemoryCryptoError> {
    let Some(encoded) = data.strip_prefix(ENCRYPTED_PREFIX) else {
        return Ok(data.to_string());
    };
    let key = key.ok_or_else(|| {
        MemoryCryptoError::InvalidPayload("file is encrypted but no key configured".to_string())
    })?;

    let combined = BASE64
        .decode(encoded.trim())
        .map_err(|e| MemoryCryptoError::InvalidPayload(e.to_string()))?;
    if combined.len() <= NONCE_LEN {
        return Err(MemoryCryptoError::InvalidPayload(
            "ciphertext shorter than nonce".to_string(),
        ));
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let plain = key
        .cipher()
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| MemoryCryptoError::DecryptFailed)?;

    String::from_utf8(plain).map_err(|e| MemoryCryptoError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_base64(&BASE64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let key = test_key();
        let plain = r#"{"lessons":[],"history":[]}"#;
        let encrypted = encrypt_payload(plain, &key).unwrap();
        assert!(encrypted.starts_with(ENCRYPTED_PREFIX));
        assert!(!encrypted.contains("lessons"));

        let decrypted = decrypt_payload(&encrypted, Some(&key)).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn test_plain_passthrough() {
        let plain = r#"{"history":[]}"#;
        assert_eq!(decrypt_payload(plain, None).unwrap(), plain);
        assert_eq!(decrypt_payload(plain, Some(&test_key())).unwrap(), plain);
    }

    #[test]
    fn test_encrypted_without_key_errors() {
        let key = test_key();
        let encrypted = encrypt_payload("{}", &key).unwrap();
        assert!(decrypt_payload(&encrypted, None).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = encrypt_payload("{}", &test_key()).unwrap();
        let other = EncryptionKey::from_base64(&BASE64.encode([9u8; 32])).unwrap();
        assert!(matches!(
            decrypt_payload(&encrypted, Some(&other)),
            Err(MemoryCryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        let short = BASE64.encode([1u8; 16]);
        assert!(EncryptionKey::from_base64(&short).is_err());
    }

    #[test]
    fn test_nonce_makes_output_nondeterministic() {
        let key = test_key();
        let a = encrypt_payload("same input", &key).unwrap();
        let b = encrypt_payload("same input", &key).unwrap();
        assert_ne!(a, b);
    }
}
