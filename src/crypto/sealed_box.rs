use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{Aes256GcmCrypto, AsymmetricCrypto, KeyPair, SymmetricCrypto};
use crate::error::CryptoError;

const KEY_LEN: usize = 32;

/// Asymmetric encryption as an X25519 sealed box: an ephemeral key pair is generated per
///  encryption, its Diffie-Hellman shared secret with the recipient's public key is hashed
///  into an AES-256-GCM key, and the ephemeral public key travels in front of the sealed
///  payload: `ephemeral_pub(32B) | nonce(12B) | ciphertext`.
///
/// Only the holder of the matching private key can re-derive the shared secret, which is
///  all the handshake needs to move the session key to the acceptor.
pub struct SealedBoxCrypto;

fn fixed_key(raw: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    raw.try_into().map_err(|_| CryptoError::InvalidKey)
}

fn derive_key(shared_secret: &[u8], ephemeral_public: &PublicKey, recipient_public: &PublicKey) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(ephemeral_public.as_bytes());
    hasher.update(recipient_public.as_bytes());
    hasher.finalize().to_vec()
}

impl AsymmetricCrypto for SealedBoxCrypto {
    fn encrypt(&self, data: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let recipient = PublicKey::from(fixed_key(public_key)?);

        let ephemeral_secret = StaticSecret::random_from_rng(rand::thread_rng());
        let ephemeral_public = PublicKey::from(&ephemeral_secret);
        let shared_secret = ephemeral_secret.diffie_hellman(&recipient);

        let key = derive_key(shared_secret.as_bytes(), &ephemeral_public, &recipient);
        let sealed = Aes256GcmCrypto.encrypt(data, &key)?;

        let mut result = Vec::with_capacity(KEY_LEN + sealed.len());
        result.extend_from_slice(ephemeral_public.as_bytes());
        result.extend_from_slice(&sealed);
        Ok(result)
    }

    fn decrypt(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let secret = StaticSecret::from(fixed_key(private_key)?);
        let recipient = PublicKey::from(&secret);

        if data.len() < KEY_LEN {
            return Err(CryptoError::BadPadding);
        }
        let (raw_ephemeral, sealed) = data.split_at(KEY_LEN);
        let ephemeral_public = PublicKey::from(fixed_key(raw_ephemeral)?);

        let shared_secret = secret.diffie_hellman(&ephemeral_public);
        let key = derive_key(shared_secret.as_bytes(), &ephemeral_public, &recipient);
        Aes256GcmCrypto.decrypt(sealed, &key)
    }

    fn generate_key_pair(&self) -> KeyPair {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);

        KeyPair {
            public_key: public.as_bytes().to_vec(),
            private_key: secret.to_bytes().to_vec(),
        }
    }
}
