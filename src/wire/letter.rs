//! The inner payload frame carried inside a packet: `checksum(8B) | payload`, the whole
//!  frame optionally passed through the symmetric cipher. The letter checksum is an
//!  integrity domain of its own, independent of the packet's head checksum.

use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::crypto::SymmetricCrypto;
use crate::error::{CryptoError, LetterError, WireError};
use crate::wire::packet::Checksum;

pub const PAYLOAD_START: usize = 8;

pub fn wrap(payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(PAYLOAD_START + payload.len());
    buf.put_u64(Checksum::of(payload).0);
    buf.put_slice(payload);
    buf.to_vec()
}

pub fn resolve(letter: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut buf = letter;
    let declared = buf.try_get_u64().map_err(|_| WireError::TooShort)?;
    if Checksum::of(buf) != Checksum(declared) {
        return Err(WireError::ChecksumMismatch);
    }
    Ok(buf.to_vec())
}

pub fn wrap_and_encrypt(
    payload: &[u8],
    crypto: &dyn SymmetricCrypto,
    key: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    crypto.encrypt(&wrap(payload), key)
}

pub fn decrypt_and_resolve(
    letter: &[u8],
    crypto: &dyn SymmetricCrypto,
    key: &[u8],
) -> Result<Vec<u8>, LetterError> {
    let framed = crypto.decrypt(letter, key)?;
    Ok(resolve(&framed)?)
}
