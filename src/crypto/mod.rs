//! Cipher seams of the protocol. Keys are opaque byte slices so that providers can be
//!  swapped without touching the state machine; all failures collapse into
//!  [`CryptoError`](crate::error::CryptoError).

mod aes;
mod sealed_box;

pub use aes::Aes256GcmCrypto;
pub use sealed_box::SealedBoxCrypto;

use std::fmt::{Debug, Formatter};

use crate::error::CryptoError;

/// Same key for encryption and decryption. Used for everything after the session key is
///  negotiated, and for the session-key proof of possession during the handshake.
pub trait SymmetricCrypto: Send + Sync + 'static {
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn generate_key(&self) -> Vec<u8>;
}

/// Different keys for encryption and decryption. Used exactly once per handshake, to move
///  the freshly generated session key to the acceptor.
pub trait AsymmetricCrypto: Send + Sync + 'static {
    fn encrypt(&self, data: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, data: &[u8], private_key: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn generate_key_pair(&self) -> KeyPair;
}

#[derive(Clone)]
pub struct KeyPair {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl Debug for KeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair{{public_key:{:02x?}, private_key:<redacted>}}", &self.public_key)
    }
}
