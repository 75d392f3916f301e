//! At-rest encryption for connection passwords.
//!
//! AES-256-GCM with a 16-byte iv; the per-value encoding is
//! `hex(iv):hex(tag):hex(ciphertext)`. A value is recognized as encrypted
//! iff it splits into exactly three hex parts. The key is derived from the
//! per-install salt so config files are not portable between machines.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// GCM with the 16-byte iv the on-disk format mandates.
type Cipher = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_CONTEXT: &[u8] = b"outpost-config-secrets-v1";

#[derive(Clone, Debug, Error)]
pub enum SecretError {
    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    /// Derive the key from the install salt.
    pub fn new(salt: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(salt);
        Self {
            key: hasher.finalize().into(),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = Cipher::new_from_slice(&self.key)
            .map_err(|err| SecretError::Encrypt(err.to_string()))?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::<U16>::from_slice(&iv);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|err| SecretError::Encrypt(err.to_string()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, value: &str) -> Result<String, SecretError> {
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() != 3 {
            return Err(SecretError::Decrypt("not an encrypted value".into()));
        }
        let iv = hex::decode(parts[0]).map_err(|err| SecretError::Decrypt(err.to_string()))?;
        let tag = hex::decode(parts[1]).map_err(|err| SecretError::Decrypt(err.to_string()))?;
        let ciphertext =
            hex::decode(parts[2]).map_err(|err| SecretError::Decrypt(err.to_string()))?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(SecretError::Decrypt("malformed iv or tag".into()));
        }

        let cipher = Cipher::new_from_slice(&self.key)
            .map_err(|err| SecretError::Decrypt(err.to_string()))?;
        let nonce = Nonce::<U16>::from_slice(&iv);

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);
        let plain = cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| SecretError::Decrypt("authentication failed".into()))?;
        String::from_utf8(plain).map_err(|err| SecretError::Decrypt(err.to_string()))
    }
}

/// An encrypted value splits into exactly three nonempty hex parts.
pub fn is_encrypted(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Generate a fresh 16-byte install salt.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_utf8() {
        let cipher = SecretCipher::new(&generate_salt());
        for plain in ["s3cret", "", "päss wörd ☃", "a:b:c"] {
            let sealed = cipher.encrypt(plain).unwrap();
            assert!(is_encrypted(&sealed), "{sealed} should parse as encrypted");
            assert_eq!(cipher.decrypt(&sealed).unwrap(), plain);
        }
    }

    #[test]
    fn plaintext_is_not_recognized_as_encrypted() {
        assert!(!is_encrypted("hunter2"));
        assert!(!is_encrypted("a:b"));
        assert!(!is_encrypted("xyz:123:deadbeef"));
        assert!(!is_encrypted("::"));
    }

    #[test]
    fn iv_is_sixteen_bytes() {
        let cipher = SecretCipher::new(b"salt");
        let sealed = cipher.encrypt("p").unwrap();
        let iv = sealed.split(':').next().unwrap();
        assert_eq!(iv.len(), 32); // 16 bytes hex-encoded
    }

    #[test]
    fn tampering_fails_authentication() {
        let cipher = SecretCipher::new(b"salt");
        let sealed = cipher.encrypt("payload").unwrap();
        let mut parts: Vec<String> = sealed.split(':').map(str::to_string).collect();
        parts[2] = parts[2].replace(
            parts[2].chars().next().unwrap(),
            if parts[2].starts_with('0') { "1" } else { "0" },
        );
        assert!(cipher.decrypt(&parts.join(":")).is_err());
    }

    #[test]
    fn different_salts_derive_different_keys() {
        let a = SecretCipher::new(b"salt-a");
        let b = SecretCipher::new(b"salt-b");
        let sealed = a.encrypt("p").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }
}
