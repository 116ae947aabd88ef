use std::fmt::{Debug, Formatter};

use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use crc::Crc;

use crate::error::WireError;
use crate::wire::operation::Operation;

/// Offset of the head fields inside the wire frame, i.e. the range covered by the head
///  checksum.
pub const HEAD_START: usize = 8;
/// Offset of the letter, i.e. the length of the fixed header.
pub const LETTER_START: usize = 25;

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn of(data: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();
        digest.update(data);
        Checksum(digest.finalize())
    }
}

/// The authenticated part of a packet: covered by the head checksum, never by the letter
///  checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHead {
    pub session_id: u64,
    pub operation: Operation,
    pub tag: u64,
}

impl PacketHead {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.session_id);
        buf.put_u8(self.operation.into());
        buf.put_u64(self.tag);
    }
}

/// The wire unit: head plus an opaque letter. The head checksum covers exactly the head
///  fields - a corrupt letter leaves the head verifiable, and vice versa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub head: PacketHead,
    pub letter: Vec<u8>,
}

impl Packet {
    pub fn new(session_id: u64, operation: Operation, tag: u64, letter: Vec<u8>) -> Packet {
        Packet {
            head: PacketHead {
                session_id,
                operation,
                tag,
            },
            letter,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut head = BytesMut::with_capacity(LETTER_START - HEAD_START);
        self.head.ser(&mut head);

        buf.put_u64(Checksum::of(&head).0);
        buf.put_slice(&head);
        buf.put_slice(&self.letter);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(LETTER_START + self.letter.len());
        self.ser(&mut buf);
        buf.to_vec()
    }

    pub fn deser(bytes: &[u8]) -> Result<Packet, WireError> {
        if bytes.len() < LETTER_START {
            return Err(WireError::TooShort);
        }

        let mut buf = bytes;
        let declared = buf.try_get_u64().map_err(|_| WireError::TooShort)?;
        if Checksum::of(&bytes[HEAD_START..LETTER_START]) != Checksum(declared) {
            return Err(WireError::ChecksumMismatch);
        }

        let session_id = buf.try_get_u64().map_err(|_| WireError::TooShort)?;
        let raw_operation = buf.try_get_u8().map_err(|_| WireError::TooShort)?;
        let operation = Operation::try_from(raw_operation)
            .map_err(|_| WireError::UnknownOperation(raw_operation))?;
        let tag = buf.try_get_u64().map_err(|_| WireError::TooShort)?;

        Ok(Packet {
            head: PacketHead {
                session_id,
                operation,
                tag,
            },
            letter: buf.to_vec(),
        })
    }
}
