use crate::error::{CredentialError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fs;
use std::path::Path;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 32;

/// Encrypts device and repository credentials with a process-wide master
/// key and derives per-share repository keys from device passwords.
pub struct CredentialStore {
    cipher: Aes256Gcm,
    iterations: u32,
}

impl CredentialStore {
    /// Loads the master key from `key_file`, generating and persisting a
    /// fresh one on first start.
    pub fn open<P: AsRef<Path>>(key_file: P, iterations: u32) -> Result<Self> {
        let key_file = key_file.as_ref();

        let key = if key_file.exists() {
            let encoded = fs::read_to_string(key_file).map_err(|e| {
                CredentialError::InvalidKey(format!("{}: {}", key_file.display(), e))
            })?;
            BASE64
                .decode(encoded.trim())
                .map_err(|e| CredentialError::InvalidKey(e.to_string()))?
        } else {
            let mut key = vec![0u8; KEY_SIZE];
            OsRng.fill_bytes(&mut key);
            fs::write(key_file, BASE64.encode(&key)).map_err(|e| {
                CredentialError::InvalidKey(format!("{}: {}", key_file.display(), e))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(key_file, fs::Permissions::from_mode(0o600));
            }
            info!(path = %key_file.display(), "Generated new master key");
            key
        };

        Self::from_key(&key, iterations)
    }

    pub fn from_key(key: &[u8], iterations: u32) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(CredentialError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                key.len()
            ))
            .into());
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher, iterations })
    }

    /// Encrypts a secret; output is base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CredentialError::EncryptFailed(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| CredentialError::DecryptFailed(e.to_string()))?;
        if combined.len() < NONCE_SIZE {
            return Err(
                CredentialError::DecryptFailed("ciphertext too short".to_string()).into(),
            );
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CredentialError::DecryptFailed(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CredentialError::DecryptFailed(e.to_string()).into())
    }

    /// Fresh random salt for repository key derivation, base64 encoded.
    pub fn generate_salt() -> String {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        BASE64.encode(salt)
    }

    /// Derives a repository key from a device password and a share salt.
    /// Stable: the same inputs always yield the same key bytes.
    pub fn derive_repository_key(&self, password: &str, salt_b64: &str) -> Result<String> {
        let salt = BASE64
            .decode(salt_b64)
            .map_err(|e| CredentialError::InvalidKey(format!("bad salt: {}", e)))?;

        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac_sha256(password.as_bytes(), &salt, self.iterations, &mut key);
        Ok(BASE64.encode(key))
    }
}

/// PBKDF2 per RFC 8018 with HMAC-SHA256 as the PRF.
fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], iterations: u32, output: &mut [u8]) {
    let mut block_index: u32 = 1;
    for chunk in output.chunks_mut(32) {
        let mut mac: HmacSha256 =
            Mac::new_from_slice(password).expect("HMAC accepts any key length");
        mac.update(salt);
        mac.update(&block_index.to_be_bytes());
        let mut u = mac.finalize().into_bytes();

        let mut acc = [0u8; 32];
        acc.copy_from_slice(&u);
        for _ in 1..iterations {
            let mut mac: HmacSha256 =
                Mac::new_from_slice(password).expect("HMAC accepts any key length");
            mac.update(&u);
            u = mac.finalize().into_bytes();
            for (a, b) in acc.iter_mut().zip(u.iter()) {
                *a ^= *b;
            }
        }

        let len = chunk.len();
        chunk.copy_from_slice(&acc[..len]);
        block_index += 1;
    }
}
