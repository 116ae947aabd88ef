use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::error;

use crate::receiver::SecureReceiver;

/// Named registry of observers with isolated dispatch: every broadcast works on one
///  consistent snapshot of the registry, and a panicking observer is logged and skipped
///  without affecting the remaining observers or the event loop.
pub struct ReceiverRegistry {
    receivers: Mutex<FxHashMap<String, Arc<dyn SecureReceiver>>>,
}

impl ReceiverRegistry {
    pub fn new() -> ReceiverRegistry {
        ReceiverRegistry {
            receivers: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn register(&self, channel_name: impl Into<String>, receiver: Arc<dyn SecureReceiver>) {
        if let Ok(mut receivers) = self.receivers.lock() {
            receivers.insert(channel_name.into(), receiver);
        }
    }

    pub fn unregister(&self, channel_name: &str) {
        if let Ok(mut receivers) = self.receivers.lock() {
            receivers.remove(channel_name);
        }
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn SecureReceiver>)> {
        match self.receivers.lock() {
            Ok(receivers) => receivers
                .iter()
                .map(|(name, receiver)| (name.clone(), receiver.clone()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn isolated(name: &str, callback: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!("receiver {:?} panicked in {} - skipping it for this event", name, callback);
        }
    }

    pub fn broadcast_on_connect(&self, datagram: &[u8]) {
        for (name, receiver) in self.snapshot() {
            let datagram = datagram.to_vec();
            Self::isolated(&name, "on_connect", || receiver.on_connect(&datagram));
        }
    }

    pub fn broadcast_on_public_key_respond(&self, public_key: &[u8]) {
        for (name, receiver) in self.snapshot() {
            let public_key = public_key.to_vec();
            Self::isolated(&name, "on_public_key_respond", || {
                receiver.on_public_key_respond(&public_key)
            });
        }
    }

    pub fn broadcast_on_connection_establish(&self) {
        for (name, receiver) in self.snapshot() {
            Self::isolated(&name, "on_connection_establish", || {
                receiver.on_connection_establish()
            });
        }
    }

    pub fn broadcast_on_disconnect(&self, datagram: Option<&[u8]>) {
        for (name, receiver) in self.snapshot() {
            let datagram = datagram.map(<[u8]>::to_vec);
            Self::isolated(&name, "on_disconnect", || {
                receiver.on_disconnect(datagram.as_deref())
            });
        }
    }

    pub fn broadcast_receive(&self, tag: u64, data: &[u8]) {
        for (name, receiver) in self.snapshot() {
            let data = data.to_vec();
            Self::isolated(&name, "receive", || receiver.receive(tag, &data));
        }
    }

    pub fn broadcast_post_confirm(&self, tag: u64) {
        for (name, receiver) in self.snapshot() {
            Self::isolated(&name, "post_confirm", || receiver.post_confirm(tag));
        }
    }

    pub fn broadcast_post_broken(&self, tag: u64) {
        for (name, receiver) in self.snapshot() {
            Self::isolated(&name, "post_broken", || receiver.post_broken(tag));
        }
    }
}
