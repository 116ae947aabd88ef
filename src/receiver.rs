//! The observer seam towards the application. Any number of receivers can be registered
//!  on one delivery instance; all of them see every lifecycle and data event.

use crate::delivery::SecureDelivery;

/// Implemented by the application to observe one delivery instance.
///
/// `on_connect` and `on_public_key_respond` announce a pending decision: the application
///  answers via [`SecureDelivery::respond_connect`] / [`SecureDelivery::respond_public_key`]
///  (or keeps the peer waiting with the matching stand-by call). The remaining callbacks
///  are notifications only.
pub trait SecureReceiver: Send + Sync + 'static {
    /// A peer requests a connection. Answer with `respond_connect`.
    fn on_connect(&self, datagram: &[u8]);

    /// The acceptor offered its public key. Answer with `respond_public_key`.
    fn on_public_key_respond(&self, public_key: &[u8]);

    fn on_connection_establish(&self);

    /// The session was torn down, locally or by the peer. The datagram is `None` when the
    ///  peer's disconnect letter did not survive the transport.
    fn on_disconnect(&self, datagram: Option<&[u8]>);

    /// Application data arrived from the peer.
    fn receive(&self, tag: u64, data: &[u8]);

    /// The peer confirmed reception of the data sent under this tag.
    fn post_confirm(&self, tag: u64);

    /// The peer received the data sent under this tag, but its letter was broken. Most of
    ///  the time the right reaction is to send it again.
    fn post_broken(&self, tag: u64);
}

/// A receiver that accepts every connection request and every offered public key - the
///  default decision behavior for endpoints that do not want to gate the handshake.
pub struct AutoAcceptReceiver {
    delivery: SecureDelivery,
}

impl AutoAcceptReceiver {
    pub fn new(delivery: SecureDelivery) -> AutoAcceptReceiver {
        AutoAcceptReceiver { delivery }
    }
}

impl SecureReceiver for AutoAcceptReceiver {
    fn on_connect(&self, _datagram: &[u8]) {
        self.delivery.respond_connect(true);
    }

    fn on_public_key_respond(&self, _public_key: &[u8]) {
        self.delivery.respond_public_key(true);
    }

    fn on_connection_establish(&self) {}

    fn on_disconnect(&self, _datagram: Option<&[u8]>) {}

    fn receive(&self, _tag: u64, _data: &[u8]) {}

    fn post_confirm(&self, _tag: u64) {}

    fn post_broken(&self, _tag: u64) {}
}
