//! The unreliable transport seam. The protocol assumes nothing from it: no reliability,
//!  no ordering, no integrity. Sends are fire-and-forget.

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// The raw point-to-point byte-message transport a delivery instance runs on - a UDP-like
///  channel, a game-engine packet bus, anything that can move opaque byte messages.
#[cfg_attr(test, automock)]
pub trait Messenger: Send + Sync + 'static {
    fn send(&self, data: &[u8]);

    /// Registers a callback for inbound messages under a unique channel name.
    fn register_receptor(&self, channel_name: &str, receptor: Arc<dyn Receptor>);

    fn unregister_receptor(&self, channel_name: &str);
}

/// Inbound side of the transport seam.
pub trait Receptor: Send + Sync + 'static {
    fn receive(&self, data: &[u8]);
}
