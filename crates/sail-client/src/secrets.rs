//! Decryption of config content stored encrypted in the remote store.
//!
//! Encrypted entries are AES-192 in ECB mode with PKCS#7 padding, wrapped
//! in standard base64. The key is the first 24 bytes of the namespace key.
//! Content that is not valid base64 is plaintext and passes through as is,
//! so encrypted and plain namespaces need no mode flag.

use aes::Aes192;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ecb::cipher::block_padding::Pkcs7;
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use secrecy::{ExposeSecret, SecretString};

type Aes192EcbDec = ecb::Decryptor<Aes192>;
type Aes192EcbEnc = ecb::Encryptor<Aes192>;

/// AES-192 key size in bytes.
pub const KEY_SIZE: usize = 24;

/// Error type for config content decryption.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No namespace key configured")]
    MissingKey,

    #[error("Invalid namespace key: {0}")]
    InvalidKey(String),

    #[error("Decryption error: {0}")]
    DecryptionError(String),
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Best-effort decode/decrypt gate applied to every raw entry.
#[derive(Clone)]
pub struct DecryptionGate {
    namespace_key: Option<SecretString>,
}

impl std::fmt::Debug for DecryptionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionGate")
            .field("has_key", &self.namespace_key.is_some())
            .finish()
    }
}

impl DecryptionGate {
    pub fn new(namespace_key: Option<SecretString>) -> Self {
        Self { namespace_key }
    }

    /// Returns the usable content of a raw entry.
    ///
    /// Plaintext passes through. Base64 content is decrypted; an empty
    /// string means the entry can't be used and should be skipped.
    pub fn open(&self, name: &str, content: &str) -> String {
        if STANDARD.decode(content).is_err() {
            return content.to_string();
        }

        match self.decrypt(content) {
            Ok(plain) => plain,
            Err(e) => {
                log::error!("decrypt config {} err: {}", name, e);
                String::new()
            }
        }
    }

    /// Decrypts base64 encoded AES-192-ECB content.
    pub fn decrypt(&self, content: &str) -> Result<String> {
        let key = self.key()?;
        let ciphertext = STANDARD
            .decode(content)
            .map_err(|e| SecretError::DecryptionError(format!("Invalid base64: {}", e)))?;

        let plaintext = Aes192EcbDec::new_from_slice(key)
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|e| SecretError::DecryptionError(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| SecretError::DecryptionError(format!("Invalid UTF-8: {}", e)))
    }

    /// Encrypts plaintext into the format understood by [`Self::decrypt`].
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let key = self.key()?;
        let ciphertext = Aes192EcbEnc::new_from_slice(key)
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        Ok(STANDARD.encode(ciphertext))
    }

    fn key(&self) -> Result<&[u8]> {
        let secret = self
            .namespace_key
            .as_ref()
            .map(|k| k.expose_secret().as_bytes())
            .filter(|k| !k.is_empty())
            .ok_or(SecretError::MissingKey)?;

        if secret.len() < KEY_SIZE {
            return Err(SecretError::InvalidKey(format!(
                "Key must be at least {} bytes, got {} bytes",
                KEY_SIZE,
                secret.len()
            )));
        }
        Ok(&secret[..KEY_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "NTUZNTNQNUKYEL4GP5SGVDV9LEYZAWBD";
    // host=0.0.0.0\nport=6379 encrypted with TEST_KEY
    const REDIS_CIPHERTEXT: &str = "I9IfkJSBekxeYbQJSX6zQsvZJwlfj3VyZ6RrtRF4LFI=";

    fn gate() -> DecryptionGate {
        DecryptionGate::new(Some(SecretString::from(TEST_KEY)))
    }

    #[test]
    fn test_plaintext_passthrough() {
        let content = "database=\"127.0.0.1:3306\"";
        assert_eq!(gate().open("mysql.toml", content), content);
        assert_eq!(gate().open("cfg.custom", "CA"), "CA");
    }

    #[test]
    fn test_decrypt_known_vector() {
        assert_eq!(
            gate().open("redis.properties", REDIS_CIPHERTEXT),
            "host=0.0.0.0\nport=6379"
        );
    }

    #[test]
    fn test_roundtrip() {
        let plain = "[server]\nport = 8080\n";
        let encrypted = gate().encrypt(plain).unwrap();
        assert_ne!(encrypted, plain);
        assert_eq!(gate().decrypt(&encrypted).unwrap(), plain);
    }

    #[test]
    fn test_missing_key_skips_encrypted_content() {
        let gate = DecryptionGate::new(None);
        assert_eq!(gate.open("redis.properties", REDIS_CIPHERTEXT), "");
        assert!(matches!(
            gate.decrypt(REDIS_CIPHERTEXT),
            Err(SecretError::MissingKey)
        ));

        let gate = DecryptionGate::new(Some(SecretString::from("")));
        assert_eq!(gate.open("redis.properties", REDIS_CIPHERTEXT), "");
    }

    #[test]
    fn test_short_key_rejected() {
        let gate = DecryptionGate::new(Some(SecretString::from("too-short")));
        assert!(matches!(
            gate.decrypt(REDIS_CIPHERTEXT),
            Err(SecretError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_wrong_key_skips() {
        let gate = DecryptionGate::new(Some(SecretString::from(
            "ABCDEFGHIJKLMNOPQRSTUVWXYZ012345",
        )));
        assert_eq!(gate.open("redis.properties", REDIS_CIPHERTEXT), "");
    }

    #[test]
    fn test_base64_but_not_ciphertext_skips() {
        // Valid base64, but 3 bytes is not a whole cipher block.
        assert_eq!(gate().open("x.toml", "YWJj"), "");
    }

    #[test]
    fn test_debug_hides_key() {
        let debug = format!("{:?}", gate());
        assert!(!debug.contains(TEST_KEY));
    }
}
