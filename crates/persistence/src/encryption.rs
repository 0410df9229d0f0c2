//! AES-256-GCM layer applied over the (optionally compressed) envelope bytes
//! when `persistence.encryption_key` is set.
//!
//! The passphrase is stretched to a 256-bit key with SHA-256 rather than
//! taken raw, so operators can use a memorable secret instead of a
//! hex-encoded key. A random 96-bit nonce is generated per write and
//! prepended to the ciphertext; AES-GCM's authentication tag turns any
//! tampering or bit-rot into a hard decrypt error instead of silent
//! corruption.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use task_queue_common::error::{Error, Result};

const NONCE_LEN: usize = 12;

fn derive_key(passphrase: &Secret<String>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.expose_secret().as_bytes());
    hasher.finalize().into()
}

pub fn encrypt(passphrase: &Secret<String>, plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = derive_key(passphrase);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("invalid key length: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Internal(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(passphrase: &Secret<String>, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::Corrupt("ciphertext shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let key = derive_key(passphrase);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("invalid key length: {e}")))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::Corrupt("decryption failed: wrong key or corrupt data".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_correct_key() {
        let key = Secret::new("correct horse battery staple".to_string());
        let plaintext = b"queue-state payload";
        let ciphertext = encrypt(&key, plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        assert_eq!(decrypt(&key, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let key = Secret::new("right-key".to_string());
        let wrong = Secret::new("wrong-key".to_string());
        let ciphertext = encrypt(&key, b"secret").unwrap();
        assert!(decrypt(&wrong, &ciphertext).is_err());
    }

    #[test]
    fn nonces_differ_between_calls() {
        let key = Secret::new("k".to_string());
        let a = encrypt(&key, b"same plaintext").unwrap();
        let b = encrypt(&key, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }
}
