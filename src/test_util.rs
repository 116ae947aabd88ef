//! In-memory transport and a recording receiver, for tests and demos. The hub delivers
//!  frames synchronously between two endpoints and supports per-endpoint outbound fault
//!  injection (corruption or loss), which is all the protocol's failure paths need.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::messenger::{Messenger, Receptor};
use crate::receiver::SecureReceiver;

type FaultHook = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

struct Side {
    receptors: FxHashMap<String, Arc<dyn Receptor>>,
    outbound_fault: Option<FaultHook>,
}

impl Side {
    fn new() -> Side {
        Side {
            receptors: FxHashMap::default(),
            outbound_fault: None,
        }
    }
}

struct Hub {
    sides: [Mutex<Side>; 2],
}

/// One endpoint of an in-memory point-to-point link.
pub struct InMemoryMessenger {
    hub: Arc<Hub>,
    side: usize,
}

/// Creates two connected in-memory endpoints.
pub fn in_memory_pair() -> (Arc<InMemoryMessenger>, Arc<InMemoryMessenger>) {
    let hub = Arc::new(Hub {
        sides: [Mutex::new(Side::new()), Mutex::new(Side::new())],
    });
    (
        Arc::new(InMemoryMessenger {
            hub: hub.clone(),
            side: 0,
        }),
        Arc::new(InMemoryMessenger { hub, side: 1 }),
    )
}

impl InMemoryMessenger {
    /// Installs a hook applied to every frame this endpoint sends. Returning `None` drops
    ///  the frame, returning modified bytes corrupts it in transit.
    pub fn set_outbound_fault(&self, fault: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static) {
        if let Ok(mut side) = self.hub.sides[self.side].lock() {
            side.outbound_fault = Some(Box::new(fault));
        }
    }

    pub fn clear_outbound_fault(&self) {
        if let Ok(mut side) = self.hub.sides[self.side].lock() {
            side.outbound_fault = None;
        }
    }
}

impl Messenger for InMemoryMessenger {
    fn send(&self, data: &[u8]) {
        let frame = match self.hub.sides[self.side].lock() {
            Ok(side) => match &side.outbound_fault {
                Some(fault) => match fault(data) {
                    Some(frame) => frame,
                    None => return, // dropped in transit
                },
                None => data.to_vec(),
            },
            Err(_) => return,
        };

        let receptors: Vec<Arc<dyn Receptor>> = match self.hub.sides[1 - self.side].lock() {
            Ok(side) => side.receptors.values().cloned().collect(),
            Err(_) => return,
        };
        for receptor in receptors {
            receptor.receive(&frame);
        }
    }

    fn register_receptor(&self, channel_name: &str, receptor: Arc<dyn Receptor>) {
        if let Ok(mut side) = self.hub.sides[self.side].lock() {
            side.receptors.insert(channel_name.to_string(), receptor);
        }
    }

    fn unregister_receptor(&self, channel_name: &str) {
        if let Ok(mut side) = self.hub.sides[self.side].lock() {
            side.receptors.remove(channel_name);
        }
    }
}

/// Everything a [`SecureReceiver`] can observe, as a recorded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    Connect(Vec<u8>),
    PublicKeyRespond(Vec<u8>),
    ConnectionEstablish,
    Disconnect(Option<Vec<u8>>),
    Receive(u64, Vec<u8>),
    PostConfirm(u64),
    PostBroken(u64),
}

/// Records every observed event for later assertions.
pub struct CollectingReceiver {
    events: Mutex<Vec<ReceiverEvent>>,
}

impl CollectingReceiver {
    pub fn new() -> Arc<CollectingReceiver> {
        Arc::new(CollectingReceiver {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ReceiverEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn contains(&self, event: &ReceiverEvent) -> bool {
        self.events().contains(event)
    }

    fn push(&self, event: ReceiverEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl SecureReceiver for CollectingReceiver {
    fn on_connect(&self, datagram: &[u8]) {
        self.push(ReceiverEvent::Connect(datagram.to_vec()));
    }

    fn on_public_key_respond(&self, public_key: &[u8]) {
        self.push(ReceiverEvent::PublicKeyRespond(public_key.to_vec()));
    }

    fn on_connection_establish(&self) {
        self.push(ReceiverEvent::ConnectionEstablish);
    }

    fn on_disconnect(&self, datagram: Option<&[u8]>) {
        self.push(ReceiverEvent::Disconnect(datagram.map(<[u8]>::to_vec)));
    }

    fn receive(&self, tag: u64, data: &[u8]) {
        self.push(ReceiverEvent::Receive(tag, data.to_vec()));
    }

    fn post_confirm(&self, tag: u64) {
        self.push(ReceiverEvent::PostConfirm(tag));
    }

    fn post_broken(&self, tag: u64) {
        self.push(ReceiverEvent::PostBroken(tag));
    }
}
