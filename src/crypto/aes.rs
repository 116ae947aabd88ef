use aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::crypto::SymmetricCrypto;
use crate::error::CryptoError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM with a random nonce prefixed to the ciphertext: `nonce(12B) | ciphertext`.
///  The GCM tag doubles as cryptographic integrity check, so a flipped ciphertext bit
///  surfaces as a decrypt failure rather than silently corrupted plaintext.
pub struct Aes256GcmCrypto;

impl Aes256GcmCrypto {
    fn cipher(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)
    }
}

impl SymmetricCrypto for Aes256GcmCrypto {
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Self::cipher(key)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| CryptoError::BadPadding)?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Self::cipher(key)?;

        if data.len() < NONCE_LEN {
            return Err(CryptoError::BadPadding);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::BadPadding)
    }

    fn generate_key(&self) -> Vec<u8> {
        let mut key = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let crypto = Aes256GcmCrypto;
        let key = crypto.generate_key();

        let ciphertext = crypto.encrypt(b"attack at dawn", &key).unwrap();
        assert_ne!(&ciphertext[NONCE_LEN..], b"attack at dawn");
        assert_eq!(crypto.decrypt(&ciphertext, &key).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_nonces_are_unique_per_encryption() {
        let crypto = Aes256GcmCrypto;
        let key = crypto.generate_key();

        let a = crypto.encrypt(b"same plaintext", &key).unwrap();
        let b = crypto.encrypt(b"same plaintext", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let crypto = Aes256GcmCrypto;
        let key = crypto.generate_key();
        let other_key = crypto.generate_key();

        let ciphertext = crypto.encrypt(b"attack at dawn", &key).unwrap();
        assert_eq!(crypto.decrypt(&ciphertext, &other_key), Err(CryptoError::BadPadding));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let crypto = Aes256GcmCrypto;
        let key = crypto.generate_key();

        let mut ciphertext = crypto.encrypt(b"attack at dawn", &key).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert_eq!(crypto.decrypt(&ciphertext, &key), Err(CryptoError::BadPadding));
    }

    #[test]
    fn test_invalid_key_length() {
        let crypto = Aes256GcmCrypto;
        assert_eq!(crypto.encrypt(b"data", b"short key"), Err(CryptoError::InvalidKey));
        assert_eq!(crypto.decrypt(b"data", b"short key"), Err(CryptoError::InvalidKey));
    }
}
