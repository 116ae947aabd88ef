use thiserror::Error;

/// Checksum or framing failure while decoding a packet or letter. Recoverable before
///  authentication via BROKEN_PRE_REQUEST, acknowledged via BROKEN_DATA once connected -
///  never fatal by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame is shorter than its fixed header")]
    TooShort,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unknown operation {0}")]
    UnknownOperation(u8),
}

/// Invalid key material or failed decryption. Session-fatal during the handshake and the
///  data phase alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key material")]
    InvalidKey,
    #[error("bad padding or failed authentication")]
    BadPadding,
}

/// A data-plane call was attempted outside an established connection. This is the only
///  fault surfaced synchronously to the API caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no established connection")]
pub struct NoConnection;

/// Combined failure domain for letters that are decrypted and resolved in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LetterError {
    #[error(transparent)]
    Broken(#[from] WireError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
