use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};

use crate::error::ForgeError;

const NONCE_BYTES: usize = 12;

/// AES-256-GCM encryption for sensitive task fields at rest.
///
/// The persisted form is `base64(nonce || ciphertext)`. A fresh nonce is drawn
/// per encryption, so two encryptions of the same plaintext never match.
pub struct CryptoService {
    cipher: Aes256Gcm,
}

impl CryptoService {
    /// Builds the service from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, ForgeError> {
        let key = BASE64_STANDARD
            .decode(key_base64.trim())
            .map_err(|_| ForgeError::Crypto("encryption key is not valid base64".to_string()))?;
        if key.len() != 32 {
            return Err(ForgeError::Crypto(format!(
                "encryption key must be 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| ForgeError::Crypto("encryption key has invalid length".to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypts plaintext into the base64 envelope. Empty input stays empty.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, ForgeError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce = [0u8; NONCE_BYTES];
        use aes_gcm::aead::rand_core::RngCore as _;
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| ForgeError::Crypto("payload encryption failed".to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_BYTES + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);
        Ok(BASE64_STANDARD.encode(payload))
    }

    /// Decrypts a base64 envelope back to plaintext. Empty input stays empty.
    pub fn decrypt(&self, encoded: &str) -> Result<String, ForgeError> {
        if encoded.is_empty() {
            return Ok(String::new());
        }

        let raw = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| ForgeError::Crypto("ciphertext is not valid base64".to_string()))?;
        if raw.len() <= NONCE_BYTES {
            return Err(ForgeError::Crypto("ciphertext is truncated".to_string()));
        }

        let (nonce, sealed) = raw.split_at(NONCE_BYTES);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| ForgeError::Crypto("payload integrity check failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| ForgeError::Crypto("payload is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};

    use super::CryptoService;

    fn test_service() -> CryptoService {
        CryptoService::new(&BASE64_STANDARD.encode([7u8; 32])).expect("build crypto service")
    }

    #[test]
    fn unit_encrypt_decrypt_round_trips() {
        let service = test_service();
        let encoded = service.encrypt("ghp_example_token").expect("encrypt");
        assert_ne!(encoded, "ghp_example_token");
        let decoded = service.decrypt(&encoded).expect("decrypt");
        assert_eq!(decoded, "ghp_example_token");
    }

    #[test]
    fn unit_nonce_freshness_produces_distinct_ciphertexts() {
        let service = test_service();
        let first = service.encrypt("same-plaintext").expect("first encrypt");
        let second = service.encrypt("same-plaintext").expect("second encrypt");
        assert_ne!(first, second);
    }

    #[test]
    fn unit_empty_values_pass_through() {
        let service = test_service();
        assert_eq!(service.encrypt("").expect("encrypt empty"), "");
        assert_eq!(service.decrypt("").expect("decrypt empty"), "");
    }

    #[test]
    fn regression_tampered_ciphertext_fails_closed() {
        let service = test_service();
        let encoded = service.encrypt("secret").expect("encrypt");
        let mut raw = BASE64_STANDARD.decode(&encoded).expect("base64");
        let last = raw.last_mut().expect("ciphertext byte");
        *last ^= 0xAA;
        let tampered = BASE64_STANDARD.encode(raw);
        let error = service.decrypt(&tampered).expect_err("tampered must fail");
        assert!(error.to_string().contains("integrity check failed"));
    }

    #[test]
    fn regression_rejects_short_keys() {
        let error = match CryptoService::new(&BASE64_STANDARD.encode([1u8; 16])) {
            Err(error) => error,
            Ok(_) => panic!("short key must be rejected"),
        };
        assert!(error.to_string().contains("32 bytes"));
    }
}
