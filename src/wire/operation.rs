use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The protocol's wire operations. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Operation {
    Disconnect = 0,
    Connect = 1,
    ConnectStandBy = 2,
    PublicKeyOffer = 3,
    PublicKeyStandBy = 4,
    StartSession = 5,
    BrokenPreRequest = 6,
    /// letter is symmetrically encrypted
    ConfirmSession = 7,
    ConnectionEstablish = 8,
    ConnectionConfirm = 9,
    /// letter is symmetrically encrypted
    SendData = 10,
    ConfirmData = 11,
    BrokenData = 12,
    KeepAlive = 13,
}
